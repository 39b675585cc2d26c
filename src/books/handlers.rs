use axum::{
    extract::{DefaultBodyLimit, FromRequest, Multipart, Path, Query, Request, State},
    http::{header::CONTENT_TYPE, StatusCode},
    routing::{get, post, put},
    Json, Router,
};
use bytes::Bytes;
use serde_json::json;
use time::OffsetDateTime;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::domain::{self, Rating, Ratings};
use super::dto::{BookPayload, BookResponse, RateRequest, TopQuery};
use super::repo::Book;
use crate::auth::AuthUser;
use crate::covers;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub fn read_routes() -> Router<AppState> {
    Router::new()
        .route("/books", get(list_books))
        .route("/books/bestrating", get(best_rated))
        .route("/books/:id", get(get_book))
}

pub fn write_routes() -> Router<AppState> {
    Router::new()
        .route("/books", post(create_book))
        .route("/books/:id", put(update_book).delete(delete_book))
        .route("/books/:id/rating", post(rate_book))
        .layer(DefaultBodyLimit::max(10 * 1024 * 1024))
}

// --- reads (public) ---

#[instrument(skip(state))]
pub async fn list_books(State(state): State<AppState>) -> ApiResult<Json<Vec<BookResponse>>> {
    let books = Book::list_all(&state.db).await.map_err(ApiError::persistence)?;
    Ok(Json(with_ratings(&state, books).await?))
}

#[instrument(skip(state))]
pub async fn best_rated(
    State(state): State<AppState>,
    Query(q): Query<TopQuery>,
) -> ApiResult<Json<Vec<BookResponse>>> {
    let limit = q.limit.clamp(1, 100);
    let books = Book::top_rated(&state.db, limit)
        .await
        .map_err(ApiError::persistence)?;
    Ok(Json(with_ratings(&state, books).await?))
}

#[instrument(skip(state))]
pub async fn get_book(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<BookResponse>> {
    let book = Book::find(&state.db, id)
        .await
        .map_err(ApiError::persistence)?
        .ok_or(ApiError::NotFound("book"))?;
    let ratings = Book::ratings(&state.db, id)
        .await
        .map_err(ApiError::persistence)?;
    Ok(Json(BookResponse::from_parts(book, ratings)))
}

// --- mutations (authenticated) ---

/// POST /books — multipart with a `book` JSON field and an `image` file.
#[instrument(skip(state, mp))]
pub async fn create_book(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    mp: Multipart,
) -> ApiResult<(StatusCode, Json<BookResponse>)> {
    let form = read_book_form(mp).await?;
    let (payload, image, content_type) = form.into_create_parts()?;

    // Validate the seed grade before touching storage.
    let creator_grade = payload.rating.unwrap_or(0);
    let seed = Ratings::seed(user_id, creator_grade)?;

    let book_id = Uuid::new_v4();
    // Image first: a failed upload leaves no record behind (StorageFailure
    // at creation is fatal).
    let image_url = covers::store_cover(&state, user_id, book_id, image, &content_type).await?;

    let book = Book {
        id: book_id,
        owner_id: user_id,
        title: payload.title,
        author: payload.author,
        year: payload.year,
        genre: payload.genre,
        image_url,
        average_rating: seed.average(),
        created_at: OffsetDateTime::now_utc(),
    };
    let seed_rating = Rating {
        rater_id: user_id,
        grade: creator_grade,
    };

    let created = match Book::create(&state.db, &book, seed_rating).await {
        Ok(b) => b,
        Err(e) => {
            // Reclaim the stored cover so the failed insert leaves no orphan.
            if let Err(del) = covers::delete_cover(&state, &book.image_url).await {
                warn!(error = %del, book_id = %book.id, "orphaned cover after failed insert");
            }
            return Err(ApiError::persistence(e));
        }
    };

    info!(book_id = %created.id, owner_id = %user_id, "book created");
    Ok((
        StatusCode::CREATED,
        Json(BookResponse::from_parts(created, vec![seed_rating])),
    ))
}

/// PUT /books/{id} — multipart when the cover is replaced, plain JSON
/// otherwise, mirroring how the upload client sends it.
#[instrument(skip(state, req))]
pub async fn update_book(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<Uuid>,
    req: Request,
) -> ApiResult<Json<BookResponse>> {
    let book = Book::find(&state.db, id)
        .await
        .map_err(ApiError::persistence)?
        .ok_or(ApiError::NotFound("book"))?;
    domain::authorize(book.owner_id, user_id)?;

    let is_multipart = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("multipart/form-data"))
        .unwrap_or(false);

    let (payload, new_image) = if is_multipart {
        let mp = Multipart::from_request(req, &state)
            .await
            .map_err(|e| ApiError::InvalidInput(e.to_string()))?;
        let form = read_book_form(mp).await?;
        (form.payload, form.image)
    } else {
        let Json(payload) = Json::<BookPayload>::from_request(req, &state)
            .await
            .map_err(|e| ApiError::InvalidInput(e.to_string()))?;
        (payload, None)
    };

    let replacement_url = match new_image {
        Some((image, content_type)) => {
            Some(covers::store_cover(&state, book.owner_id, book.id, image, &content_type).await?)
        }
        None => None,
    };
    let image_url = replacement_url
        .clone()
        .unwrap_or_else(|| book.image_url.clone());

    let result = Book::update_fields(
        &state.db,
        id,
        &payload.title,
        &payload.author,
        payload.year,
        &payload.genre,
        &image_url,
    )
    .await;
    let updated =
        settle_cover_swap(&state, id, &book.image_url, replacement_url.as_deref(), result).await?;

    let ratings = Book::ratings(&state.db, id)
        .await
        .map_err(ApiError::persistence)?;
    info!(book_id = %id, owner_id = %user_id, "book updated");
    Ok(Json(BookResponse::from_parts(updated, ratings)))
}

/// DELETE /books/{id} — the cover delete is best-effort: failing to reclaim
/// the file must not block removing the catalog entry.
#[instrument(skip(state))]
pub async fn delete_book(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let book = Book::find(&state.db, id)
        .await
        .map_err(ApiError::persistence)?
        .ok_or(ApiError::NotFound("book"))?;
    domain::authorize(book.owner_id, user_id)?;

    if let Err(e) = covers::delete_cover(&state, &book.image_url).await {
        warn!(error = %e, book_id = %id, "cover delete failed, removing record anyway");
    }

    Book::delete(&state.db, id)
        .await
        .map_err(ApiError::persistence)?;
    info!(book_id = %id, owner_id = %user_id, "book deleted");
    Ok(Json(json!({ "message": "book deleted" })))
}

/// POST /books/{id}/rating — open to any authenticated user, owner included.
#[instrument(skip(state, body))]
pub async fn rate_book(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<Uuid>,
    Json(body): Json<RateRequest>,
) -> ApiResult<Json<BookResponse>> {
    let (book, ratings) = Book::rate(&state.db, id, user_id, body.rating).await?;
    info!(book_id = %id, rater_id = %user_id, grade = body.rating, "book rated");
    Ok(Json(BookResponse::from_parts(book, ratings)))
}

// --- helpers ---

#[derive(Debug)]
struct BookForm {
    payload: BookPayload,
    image: Option<(Bytes, String)>,
}

impl BookForm {
    fn assemble(payload: Option<BookPayload>, image: Option<(Bytes, String)>) -> ApiResult<Self> {
        Ok(Self {
            payload: payload
                .ok_or_else(|| ApiError::InvalidInput("missing book field".into()))?,
            image,
        })
    }

    /// Creation requires the image part; a book without a cover is rejected
    /// before anything is stored, whatever the other fields look like.
    fn into_create_parts(self) -> ApiResult<(BookPayload, Bytes, String)> {
        let (image, content_type) = self
            .image
            .ok_or_else(|| ApiError::InvalidInput("no image provided".into()))?;
        Ok((self.payload, image, content_type))
    }
}

/// Cover bookkeeping once the field write has completed: on success the
/// replaced cover is released, on failure the freshly stored replacement is
/// reclaimed. Both deletes are best-effort and only logged.
async fn settle_cover_swap(
    state: &AppState,
    book_id: Uuid,
    old_url: &str,
    replacement_url: Option<&str>,
    result: anyhow::Result<Book>,
) -> ApiResult<Book> {
    match result {
        Ok(updated) => {
            if replacement_url.is_some() {
                if let Err(e) = covers::delete_cover(state, old_url).await {
                    warn!(error = %e, book_id = %book_id, "failed to release replaced cover");
                }
            }
            Ok(updated)
        }
        Err(e) => {
            if let Some(url) = replacement_url {
                if let Err(del) = covers::delete_cover(state, url).await {
                    warn!(error = %del, book_id = %book_id, "orphaned cover after failed update");
                }
            }
            Err(ApiError::persistence(e))
        }
    }
}

async fn read_book_form(mut mp: Multipart) -> ApiResult<BookForm> {
    let mut payload: Option<BookPayload> = None;
    let mut image: Option<(Bytes, String)> = None;

    while let Some(field) = mp
        .next_field()
        .await
        .map_err(|e| ApiError::InvalidInput(e.to_string()))?
    {
        let name = field.name().map(|s| s.to_string());
        match name.as_deref() {
            Some("book") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::InvalidInput(e.to_string()))?;
                payload = Some(serde_json::from_str(&text).map_err(|e| {
                    ApiError::InvalidInput(format!("malformed book payload: {e}"))
                })?);
            }
            Some("image") => {
                let content_type = field
                    .content_type()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "application/octet-stream".into());
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::InvalidInput(e.to_string()))?;
                image = Some((data, content_type));
            }
            _ => {}
        }
    }

    BookForm::assemble(payload, image)
}

async fn with_ratings(state: &AppState, books: Vec<Book>) -> ApiResult<Vec<BookResponse>> {
    let ids: Vec<Uuid> = books.iter().map(|b| b.id).collect();
    let mut grouped = Book::ratings_for(&state.db, &ids)
        .await
        .map_err(ApiError::persistence)?;
    Ok(books
        .into_iter()
        .map(|b| {
            let ratings = grouped.remove(&b.id).unwrap_or_default();
            BookResponse::from_parts(b, ratings)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageClient;
    use axum::async_trait;
    use std::sync::{Arc, Mutex};

    fn sample_payload() -> BookPayload {
        serde_json::from_str(r#"{"title":"T","author":"A","year":2000,"genre":"G"}"#).unwrap()
    }

    fn sample_book(image_url: &str) -> Book {
        Book {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            title: "T".into(),
            author: "A".into(),
            year: 2000,
            genre: "G".into(),
            image_url: image_url.into(),
            average_rating: 0,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn creation_without_image_is_invalid_input_whatever_the_fields() {
        let form = BookForm::assemble(Some(sample_payload()), None).unwrap();
        let err = form.into_create_parts().unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[test]
    fn form_without_book_field_is_invalid_input() {
        let image = Some((Bytes::from_static(b"img"), "image/png".to_string()));
        let err = BookForm::assemble(None, image).unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[test]
    fn complete_form_yields_payload_and_image() {
        let image = Some((Bytes::from_static(b"img"), "image/png".to_string()));
        let form = BookForm::assemble(Some(sample_payload()), image).unwrap();
        let (payload, bytes, content_type) = form.into_create_parts().unwrap();
        assert_eq!(payload.title, "T");
        assert_eq!(bytes.as_ref(), b"img");
        assert_eq!(content_type, "image/png");
    }

    #[derive(Clone, Default)]
    struct RecordingStorage {
        deleted: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl StorageClient for RecordingStorage {
        async fn put_object(&self, _k: &str, _b: Bytes, _ct: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn delete_object(&self, key: &str) -> anyhow::Result<()> {
            self.deleted.lock().unwrap().push(key.to_string());
            Ok(())
        }
    }

    const OLD_URL: &str = "https://cdn.fake.local/covers/old.jpg";
    const NEW_URL: &str = "https://cdn.fake.local/covers/new.jpg";

    #[tokio::test]
    async fn failed_update_reclaims_the_replacement_cover() {
        let storage = RecordingStorage::default();
        let state = AppState::fake_with_storage(Arc::new(storage.clone()));

        let err = settle_cover_swap(
            &state,
            Uuid::new_v4(),
            OLD_URL,
            Some(NEW_URL),
            Err(anyhow::anyhow!("write failed")),
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind(), "persistence_failure");
        assert_eq!(
            *storage.deleted.lock().unwrap(),
            vec!["covers/new.jpg".to_string()]
        );
    }

    #[tokio::test]
    async fn successful_update_releases_the_old_cover() {
        let storage = RecordingStorage::default();
        let state = AppState::fake_with_storage(Arc::new(storage.clone()));

        let updated = settle_cover_swap(
            &state,
            Uuid::new_v4(),
            OLD_URL,
            Some(NEW_URL),
            Ok(sample_book(NEW_URL)),
        )
        .await
        .unwrap();

        assert_eq!(updated.image_url, NEW_URL);
        assert_eq!(
            *storage.deleted.lock().unwrap(),
            vec!["covers/old.jpg".to_string()]
        );
    }

    #[tokio::test]
    async fn update_without_replacement_touches_no_covers() {
        let storage = RecordingStorage::default();
        let state = AppState::fake_with_storage(Arc::new(storage.clone()));

        settle_cover_swap(&state, Uuid::new_v4(), OLD_URL, None, Ok(sample_book(OLD_URL)))
            .await
            .unwrap();

        assert!(storage.deleted.lock().unwrap().is_empty());
    }
}
