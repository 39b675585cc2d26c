use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::ApiError;

pub const MIN_GRADE: i32 = 0;
pub const MAX_GRADE: i32 = 5;

/// One user's grade for one book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Rating {
    pub rater_id: Uuid,
    pub grade: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RatingError {
    #[error("grade must be an integer between {MIN_GRADE} and {MAX_GRADE}")]
    InvalidGrade,
    #[error("user has already rated this book")]
    DuplicateRater,
}

impl From<RatingError> for ApiError {
    fn from(e: RatingError) -> Self {
        match e {
            RatingError::InvalidGrade => ApiError::InvalidInput(e.to_string()),
            RatingError::DuplicateRater => ApiError::Conflict(e.to_string()),
        }
    }
}

pub fn validate_grade(grade: i32) -> Result<(), RatingError> {
    if (MIN_GRADE..=MAX_GRADE).contains(&grade) {
        Ok(())
    } else {
        Err(RatingError::InvalidGrade)
    }
}

/// The vote set of a single book.
///
/// All mutation goes through [`Ratings::add`], so a state with two grades
/// from the same rater is unrepresentable here; the store's primary key on
/// `(book_id, rater_id)` backs the same invariant at rest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ratings(Vec<Rating>);

impl Ratings {
    /// Rebuild from rows loaded out of the store, where uniqueness is
    /// already guaranteed by the primary key.
    pub fn from_rows(rows: Vec<Rating>) -> Self {
        Self(rows)
    }

    /// The creator's own grade recorded at book creation, counted like any
    /// other vote.
    pub fn seed(owner_id: Uuid, grade: i32) -> Result<Self, RatingError> {
        validate_grade(grade)?;
        Ok(Self(vec![Rating {
            rater_id: owner_id,
            grade,
        }]))
    }

    /// Append a vote and return the recomputed aggregate. On rejection the
    /// set is left untouched.
    pub fn add(&mut self, rater_id: Uuid, grade: i32) -> Result<i32, RatingError> {
        validate_grade(grade)?;
        if self.0.iter().any(|r| r.rater_id == rater_id) {
            return Err(RatingError::DuplicateRater);
        }
        self.0.push(Rating { rater_id, grade });
        Ok(self.average())
    }

    /// Mean of all grades rounded half-up (half away from zero; grades are
    /// non-negative so the two coincide). `0` for an empty set.
    pub fn average(&self) -> i32 {
        if self.0.is_empty() {
            return 0;
        }
        let sum: i32 = self.0.iter().map(|r| r.grade).sum();
        (f64::from(sum) / self.0.len() as f64).round() as i32
    }

    pub fn entries(&self) -> &[Rating] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Ownership guard for mutation requests.
///
/// Pure predicate over an already-loaded book; an absent book is a
/// `NotFound` precondition failure upstream, never a deny here. Rating is
/// deliberately not owner-gated.
pub fn authorize(owner_id: Uuid, requester_id: Uuid) -> Result<(), ApiError> {
    if owner_id == requester_id {
        Ok(())
    } else {
        Err(ApiError::Forbidden("not owner".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_set_averages_zero() {
        assert_eq!(Ratings::default().average(), 0);
    }

    #[test]
    fn average_rounds_half_up() {
        let mut r = Ratings::default();
        r.add(Uuid::new_v4(), 3).unwrap();
        let avg = r.add(Uuid::new_v4(), 4).unwrap();
        // mean 3.5 rounds up
        assert_eq!(avg, 4);

        let mut r = Ratings::default();
        r.add(Uuid::new_v4(), 0).unwrap();
        let avg = r.add(Uuid::new_v4(), 5).unwrap();
        // mean 2.5 rounds up, not to even
        assert_eq!(avg, 3);
    }

    #[test]
    fn average_of_exact_mean() {
        let mut r = Ratings::default();
        r.add(Uuid::new_v4(), 2).unwrap();
        r.add(Uuid::new_v4(), 4).unwrap();
        assert_eq!(r.average(), 3);
    }

    #[test]
    fn add_rejects_out_of_range_grades() {
        let mut r = Ratings::default();
        assert_eq!(r.add(Uuid::new_v4(), -1), Err(RatingError::InvalidGrade));
        assert_eq!(r.add(Uuid::new_v4(), 6), Err(RatingError::InvalidGrade));
        assert!(r.is_empty());
    }

    #[test]
    fn add_rejects_duplicate_rater_and_leaves_state_unchanged() {
        let rater = Uuid::new_v4();
        let mut r = Ratings::default();
        r.add(rater, 5).unwrap();
        let before = r.entries().to_vec();
        let avg_before = r.average();

        assert_eq!(r.add(rater, 1), Err(RatingError::DuplicateRater));
        assert_eq!(r.entries(), before.as_slice());
        assert_eq!(r.average(), avg_before);
    }

    #[test]
    fn seed_counts_like_any_other_vote() {
        let owner = Uuid::new_v4();
        let mut r = Ratings::seed(owner, 4).unwrap();
        assert_eq!(r.average(), 4);
        // The creator cannot vote twice either.
        assert_eq!(r.add(owner, 2), Err(RatingError::DuplicateRater));
        assert_eq!(Ratings::seed(owner, 7), Err(RatingError::InvalidGrade));
    }

    #[test]
    fn authorize_allows_owner_only() {
        let owner = Uuid::new_v4();
        assert!(authorize(owner, owner).is_ok());

        let err = authorize(owner, Uuid::new_v4()).unwrap_err();
        assert_eq!(err.kind(), "forbidden");
    }

    // The end-to-end rating lifecycle from the API contract, at entity level.
    #[test]
    fn rating_lifecycle_scenario() {
        let user_a = Uuid::new_v4();
        let user_b = Uuid::new_v4();
        let user_c = Uuid::new_v4();

        // A creates the book with a seed grade of 4.
        let mut ratings = Ratings::seed(user_a, 4).unwrap();
        assert_eq!(ratings.average(), 4);
        assert_eq!(ratings.len(), 1);

        // B rates 2: average becomes round(6 / 2) = 3.
        let avg = ratings.add(user_b, 2).unwrap();
        assert_eq!(avg, 3);
        assert_eq!(ratings.len(), 2);

        // B rates again: rejected, state unchanged.
        assert_eq!(ratings.add(user_b, 5), Err(RatingError::DuplicateRater));
        assert_eq!(ratings.len(), 2);
        assert_eq!(ratings.average(), 3);

        // C is not the owner and may not mutate, but may rate.
        assert!(authorize(user_a, user_c).is_err());
        assert!(ratings.add(user_c, 5).is_ok());
    }
}
