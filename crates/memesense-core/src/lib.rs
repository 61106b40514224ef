//! Core types, configuration, and errors for memesense
//!
//! This crate contains the foundational types shared across all memesense
//! components: the five-way [`Sentiment`] label, the labelled [`Sample`] read
//! from the dataset table, the unified [`MemeSenseError`], and the
//! [`config::ExperimentConfig`] that externalises every path and
//! hyperparameter of a run.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

pub mod config;

pub use config::ExperimentConfig;

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// Number of sentiment classes predicted by the fusion model.
pub const NUM_CLASSES: usize = 5;

/// Ordinal sentiment class attached to a meme.
///
/// The integer codes are fixed and are what the model is trained against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    /// Code 0.
    VeryNegative,
    /// Code 1.
    Negative,
    /// Code 2.
    Neutral,
    /// Code 3.
    Positive,
    /// Code 4.
    VeryPositive,
}

impl Sentiment {
    /// All classes, ordered by code.
    pub const ALL: [Sentiment; NUM_CLASSES] = [
        Sentiment::VeryNegative,
        Sentiment::Negative,
        Sentiment::Neutral,
        Sentiment::Positive,
        Sentiment::VeryPositive,
    ];

    /// Integer class code in `0..NUM_CLASSES`.
    pub fn code(self) -> u32 {
        match self {
            Sentiment::VeryNegative => 0,
            Sentiment::Negative => 1,
            Sentiment::Neutral => 2,
            Sentiment::Positive => 3,
            Sentiment::VeryPositive => 4,
        }
    }

    /// Inverse of [`Sentiment::code`].
    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    /// Label string as it appears in the dataset table.
    pub fn as_str(self) -> &'static str {
        match self {
            Sentiment::VeryNegative => "very_negative",
            Sentiment::Negative => "negative",
            Sentiment::Neutral => "neutral",
            Sentiment::Positive => "positive",
            Sentiment::VeryPositive => "very_positive",
        }
    }
}

impl std::fmt::Display for Sentiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Sentiment {
    type Err = MemeSenseError;

    fn from_str(s: &str) -> Result<Self> {
        let needle = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == needle)
            .ok_or_else(|| MemeSenseError::Dataset(format!("Unknown sentiment label '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// Samples
// ---------------------------------------------------------------------------

/// One labelled row of the dataset table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    /// Image file name, relative to the configured image directory.
    pub image_path: PathBuf,
    /// Caption exactly as read from the table.
    pub raw_caption: String,
    /// Ground-truth class.
    pub sentiment: Sentiment,
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Reasons a stratified split cannot be produced.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SplitError {
    /// The requested test fraction is not strictly between 0 and 1.
    #[error("test fraction must be in (0, 1), got {0}")]
    InvalidFraction(f64),

    /// A class has too few members to appear in both partitions.
    #[error(
        "class '{class}' has only {count} member(s); at least 2 are required for a stratified split"
    )]
    ClassTooSmall {
        /// The under-populated class.
        class: Sentiment,
        /// Its number of members.
        count: usize,
    },

    /// One partition would be smaller than the number of classes present.
    #[error("{partition} partition of {size} sample(s) cannot hold {classes} classes")]
    PartitionTooSmall {
        /// `"train"` or `"test"`.
        partition: &'static str,
        /// Number of samples the partition would receive.
        size: usize,
        /// Number of distinct classes present.
        classes: usize,
    },
}

/// Core error types.
#[derive(thiserror::Error, Debug)]
pub enum MemeSenseError {
    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed label table or row.
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Image decoding or lookup failure.
    #[error("Image error: {0}")]
    Image(String),

    /// Stratified split failure.
    #[error("Split error: {0}")]
    Split(#[from] SplitError),

    /// Model construction, weight loading, or forward pass failure.
    #[error("Model error: {0}")]
    Model(String),

    /// Failure inside the training loop.
    #[error("Training error: {0}")]
    Training(String),
}

impl From<serde_yaml::Error> for MemeSenseError {
    fn from(value: serde_yaml::Error) -> Self {
        MemeSenseError::Config(format!("Failed to parse config YAML: {value}"))
    }
}

/// Convenience alias for `std::result::Result<T, MemeSenseError>`.
pub type Result<T> = std::result::Result<T, MemeSenseError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentiment_codes_are_fixed() {
        let codes: Vec<u32> = Sentiment::ALL.iter().map(|s| s.code()).collect();
        assert_eq!(codes, vec![0, 1, 2, 3, 4]);
        assert_eq!(Sentiment::from_code(2), Some(Sentiment::Neutral));
        assert_eq!(Sentiment::from_code(5), None);
    }

    #[test]
    fn test_sentiment_parse_from_table_labels() {
        assert_eq!(
            "very_negative".parse::<Sentiment>().unwrap(),
            Sentiment::VeryNegative
        );
        assert_eq!(
            " Very_Positive ".parse::<Sentiment>().unwrap(),
            Sentiment::VeryPositive
        );
        assert!("slightly_positive".parse::<Sentiment>().is_err());
        assert!("".parse::<Sentiment>().is_err());
    }

    #[test]
    fn test_sentiment_display_round_trips_through_parse() {
        for s in Sentiment::ALL {
            assert_eq!(s.to_string().parse::<Sentiment>().unwrap(), s);
        }
    }

    #[test]
    fn test_sentiment_serde_uses_snake_case() {
        let json = serde_json::to_string(&Sentiment::VeryNegative).unwrap();
        assert_eq!(json, "\"very_negative\"");
    }

    #[test]
    fn test_split_error_message_names_class() {
        let err = MemeSenseError::from(SplitError::ClassTooSmall {
            class: Sentiment::Negative,
            count: 1,
        });
        let msg = err.to_string();
        assert!(msg.contains("negative"));
        assert!(msg.contains("only 1"));
    }
}
