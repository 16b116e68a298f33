use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

pub const MAX_TITLE_CHARS: usize = 120;
pub const MAX_BODY_CHARS: usize = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Pending => "PENDING",
            ReviewStatus::Approved => "APPROVED",
            ReviewStatus::Rejected => "REJECTED",
        }
    }
}

impl FromStr for ReviewStatus {
    type Err = ReviewError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "PENDING" => Ok(ReviewStatus::Pending),
            "APPROVED" => Ok(ReviewStatus::Approved),
            "REJECTED" => Ok(ReviewStatus::Rejected),
            _ => Err(ReviewError::UnknownStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReviewError {
    #[error("Rating must be between 1 and 5")]
    Rating,
    #[error("Title must be at most {} characters", MAX_TITLE_CHARS)]
    Title,
    #[error("Review body must be 1 to {} characters", MAX_BODY_CHARS)]
    Body,
    #[error("Unknown review status {0}")]
    UnknownStatus(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewDraft {
    pub rating: i16,
    pub title: String,
    pub body: String,
}

pub fn validate(rating: i16, title: &str, body: &str) -> Result<ReviewDraft, ReviewError> {
    if !(1..=5).contains(&rating) {
        return Err(ReviewError::Rating);
    }
    let title = title.trim();
    if title.chars().count() > MAX_TITLE_CHARS {
        return Err(ReviewError::Title);
    }
    let body = body.trim();
    if body.is_empty() || body.chars().count() > MAX_BODY_CHARS {
        return Err(ReviewError::Body);
    }
    Ok(ReviewDraft {
        rating,
        title: title.to_string(),
        body: body.to_string(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, ToSchema, Default)]
pub struct RatingSummary {
    pub average: f64,
    pub count: usize,
}

/// Averages approved ratings, rounded to one decimal.
pub fn summarize(approved_ratings: &[i16]) -> RatingSummary {
    if approved_ratings.is_empty() {
        return RatingSummary::default();
    }
    let sum: i64 = approved_ratings.iter().map(|r| *r as i64).sum();
    let average = sum as f64 / approved_ratings.len() as f64;
    RatingSummary {
        average: (average * 10.0).round() / 10.0,
        count: approved_ratings.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_and_trims() {
        let draft = validate(4, "  Great fit ", " Runs a bit small. ").unwrap();
        assert_eq!(draft.title, "Great fit");
        assert_eq!(draft.body, "Runs a bit small.");
    }

    #[test]
    fn rejects_out_of_range_input() {
        assert_eq!(validate(0, "t", "b"), Err(ReviewError::Rating));
        assert_eq!(validate(6, "t", "b"), Err(ReviewError::Rating));
        assert_eq!(
            validate(3, &"x".repeat(MAX_TITLE_CHARS + 1), "b"),
            Err(ReviewError::Title)
        );
        assert_eq!(validate(3, "t", ""), Err(ReviewError::Body));
    }

    #[test]
    fn title_is_optional() {
        let draft = validate(3, "   ", "Solid shoes").unwrap();
        assert_eq!(draft.title, "");
        assert!(validate(3, "", "Solid shoes").is_ok());
        assert!(validate(3, &"x".repeat(MAX_TITLE_CHARS), "b").is_ok());
    }

    #[test]
    fn summary_averages_to_one_decimal() {
        let summary = summarize(&[5, 4, 4]);
        assert_eq!(summary.count, 3);
        assert_eq!(summary.average, 4.3);
        assert_eq!(summarize(&[]), RatingSummary::default());
    }

    #[test]
    fn parses_status() {
        assert_eq!("approved".parse::<ReviewStatus>(), Ok(ReviewStatus::Approved));
        assert!("spam".parse::<ReviewStatus>().is_err());
    }
}
