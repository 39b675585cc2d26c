use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::domain::Rating;
use super::repo::Book;

/// Client-supplied book fields. `id` and `owner_id` have no representation
/// here, so client attempts to set them are dropped by construction; the
/// owner always comes from the verified token.
#[derive(Debug, Deserialize)]
pub struct BookPayload {
    pub title: String,
    pub author: String,
    pub year: i32,
    pub genre: String,
    /// Creator's own grade, only honored at creation. Defaults to 0.
    #[serde(default)]
    pub rating: Option<i32>,
}

/// Body of `POST /books/{id}/rating`. The rater is the authenticated user;
/// any user id in the body is ignored.
#[derive(Debug, Deserialize)]
pub struct RateRequest {
    pub rating: i32,
}

#[derive(Debug, Deserialize)]
pub struct TopQuery {
    #[serde(default = "default_top_limit")]
    pub limit: i64,
}

fn default_top_limit() -> i64 {
    3
}

#[derive(Debug, Serialize)]
pub struct RatingEntry {
    pub user_id: Uuid,
    pub grade: i32,
}

#[derive(Debug, Serialize)]
pub struct BookResponse {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub title: String,
    pub author: String,
    pub year: i32,
    pub genre: String,
    pub image_url: String,
    pub ratings: Vec<RatingEntry>,
    pub average_rating: i32,
}

impl BookResponse {
    pub fn from_parts(book: Book, ratings: Vec<Rating>) -> Self {
        Self {
            id: book.id,
            owner_id: book.owner_id,
            title: book.title,
            author: book.author,
            year: book.year,
            genre: book.genre,
            image_url: book.image_url,
            ratings: ratings
                .into_iter()
                .map(|r| RatingEntry {
                    user_id: r.rater_id,
                    grade: r.grade,
                })
                .collect(),
            average_rating: book.average_rating,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_has_no_identity_fields() {
        // Client-supplied id/owner values are simply not representable.
        let json = r#"{
            "id": "11111111-1111-1111-1111-111111111111",
            "ownerId": "22222222-2222-2222-2222-222222222222",
            "userId": "33333333-3333-3333-3333-333333333333",
            "title": "Le Grand Meaulnes",
            "author": "Alain-Fournier",
            "year": 1913,
            "genre": "Roman"
        }"#;
        let payload: BookPayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.title, "Le Grand Meaulnes");
        assert_eq!(payload.year, 1913);
        assert_eq!(payload.rating, None);

        let reserialized = format!("{payload:?}");
        assert!(!reserialized.contains("1111"));
        assert!(!reserialized.contains("2222"));
    }

    #[test]
    fn payload_requires_metadata_fields() {
        let json = r#"{"title": "Only a title"}"#;
        assert!(serde_json::from_str::<BookPayload>(json).is_err());
    }

    #[test]
    fn rate_request_ignores_body_user_id() {
        let json = r#"{"userId": "44444444-4444-4444-4444-444444444444", "rating": 3}"#;
        let req: RateRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.rating, 3);
    }

    #[test]
    fn top_query_defaults_to_three() {
        let q: TopQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(q.limit, 3);
        let q: TopQuery = serde_json::from_str(r#"{"limit": 10}"#).unwrap();
        assert_eq!(q.limit, 10);
    }
}
