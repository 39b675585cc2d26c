use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use super::domain::{Rating, Ratings};
use crate::error::{ApiError, ApiResult};

/// Book record in the database. `average_rating` is derived from the
/// `ratings` table and recomputed on every vote, never by clients.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Book {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub title: String,
    pub author: String,
    pub year: i32,
    pub genre: String,
    pub image_url: String,
    pub average_rating: i32,
    pub created_at: OffsetDateTime,
}

const BOOK_COLUMNS: &str =
    "id, owner_id, title, author, year, genre, image_url, average_rating, created_at";

impl Book {
    pub async fn list_all(db: &PgPool) -> anyhow::Result<Vec<Book>> {
        let rows = sqlx::query_as::<_, Book>(&format!(
            "SELECT {BOOK_COLUMNS} FROM books ORDER BY created_at DESC"
        ))
        .fetch_all(db)
        .await?;
        Ok(rows)
    }

    pub async fn find(db: &PgPool, id: Uuid) -> anyhow::Result<Option<Book>> {
        let row = sqlx::query_as::<_, Book>(&format!(
            "SELECT {BOOK_COLUMNS} FROM books WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(db)
        .await?;
        Ok(row)
    }

    /// Best-rated books, descending. Tie order among equal averages is
    /// store-defined.
    pub async fn top_rated(db: &PgPool, limit: i64) -> anyhow::Result<Vec<Book>> {
        let rows = sqlx::query_as::<_, Book>(&format!(
            "SELECT {BOOK_COLUMNS} FROM books ORDER BY average_rating DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(db)
        .await?;
        Ok(rows)
    }

    pub async fn ratings(db: &PgPool, book_id: Uuid) -> anyhow::Result<Vec<Rating>> {
        let rows = sqlx::query_as::<_, Rating>(
            r#"
            SELECT rater_id, grade
            FROM ratings
            WHERE book_id = $1
            "#,
        )
        .bind(book_id)
        .fetch_all(db)
        .await?;
        Ok(rows)
    }

    /// Votes for a batch of books, grouped by book id. One query instead of
    /// one per listed book.
    pub async fn ratings_for(
        db: &PgPool,
        book_ids: &[Uuid],
    ) -> anyhow::Result<HashMap<Uuid, Vec<Rating>>> {
        let rows = sqlx::query_as::<_, (Uuid, Uuid, i32)>(
            r#"
            SELECT book_id, rater_id, grade
            FROM ratings
            WHERE book_id = ANY($1)
            "#,
        )
        .bind(book_ids)
        .fetch_all(db)
        .await?;

        let mut grouped: HashMap<Uuid, Vec<Rating>> = HashMap::new();
        for (book_id, rater_id, grade) in rows {
            grouped
                .entry(book_id)
                .or_default()
                .push(Rating { rater_id, grade });
        }
        Ok(grouped)
    }

    /// Insert a new book together with its seed rating in one transaction.
    pub async fn create(db: &PgPool, book: &Book, seed: Rating) -> anyhow::Result<Book> {
        let mut tx = db.begin().await?;

        let created = sqlx::query_as::<_, Book>(&format!(
            r#"
            INSERT INTO books (id, owner_id, title, author, year, genre, image_url, average_rating)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {BOOK_COLUMNS}
            "#
        ))
        .bind(book.id)
        .bind(book.owner_id)
        .bind(&book.title)
        .bind(&book.author)
        .bind(book.year)
        .bind(&book.genre)
        .bind(&book.image_url)
        .bind(book.average_rating)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO ratings (book_id, rater_id, grade)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(book.id)
        .bind(seed.rater_id)
        .bind(seed.grade)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(created)
    }

    /// Owner-mutable scalar fields plus the cover URL; `owner_id` is not an
    /// updatable column by construction.
    pub async fn update_fields(
        db: &PgPool,
        id: Uuid,
        title: &str,
        author: &str,
        year: i32,
        genre: &str,
        image_url: &str,
    ) -> anyhow::Result<Book> {
        let row = sqlx::query_as::<_, Book>(&format!(
            r#"
            UPDATE books
            SET title = $2, author = $3, year = $4, genre = $5, image_url = $6
            WHERE id = $1
            RETURNING {BOOK_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(title)
        .bind(author)
        .bind(year)
        .bind(genre)
        .bind(image_url)
        .fetch_one(db)
        .await?;
        Ok(row)
    }

    pub async fn delete(db: &PgPool, id: Uuid) -> anyhow::Result<()> {
        // Ratings go with the book via ON DELETE CASCADE.
        sqlx::query("DELETE FROM books WHERE id = $1")
            .bind(id)
            .execute(db)
            .await?;
        Ok(())
    }

    /// Record one user's vote and recompute the aggregate.
    ///
    /// The book row is locked for the duration of the transaction, so the
    /// check-append-recompute sequence is serialized per book: concurrent
    /// raters cannot both pass the duplicate check, and no vote is lost or
    /// double counted. Contention never extends beyond one book's row.
    pub async fn rate(
        db: &PgPool,
        id: Uuid,
        rater_id: Uuid,
        grade: i32,
    ) -> ApiResult<(Book, Vec<Rating>)> {
        let mut tx = db.begin().await?;

        let mut book = sqlx::query_as::<_, Book>(&format!(
            "SELECT {BOOK_COLUMNS} FROM books WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(ApiError::NotFound("book"))?;

        let rows = sqlx::query_as::<_, Rating>(
            "SELECT rater_id, grade FROM ratings WHERE book_id = $1",
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;

        let mut ratings = Ratings::from_rows(rows);
        // Rejection drops the transaction unwritten.
        let average = ratings.add(rater_id, grade)?;

        sqlx::query("INSERT INTO ratings (book_id, rater_id, grade) VALUES ($1, $2, $3)")
            .bind(id)
            .bind(rater_id)
            .bind(grade)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE books SET average_rating = $2 WHERE id = $1")
            .bind(id)
            .bind(average)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        book.average_rating = average;
        Ok((book, ratings.entries().to_vec()))
    }
}
