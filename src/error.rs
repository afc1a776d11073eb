// ⚠️ Error types for the categorization core
// Construction-time configuration problems are fatal; everything else is
// resolved locally by the engine and never reaches categorize() callers.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CategorizerError {
    /// Malformed schema, rule set, example set or thresholds
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A label that is not part of the configured category schema
    #[error("unknown category: {category}/{subcategory}")]
    UnknownCategory {
        category: String,
        subcategory: String,
    },

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Embedding backend failed to load or encode
    #[error("embedding error: {0}")]
    Embedding(String),

    /// Fewer samples than the configured minimum
    #[error("insufficient training data: {have} samples (need at least {need})")]
    InsufficientData { have: usize, need: usize },

    /// Model fit or evaluation failed
    #[error("training error: {0}")]
    Training(String),
}

impl CategorizerError {
    pub fn config(message: impl Into<String>) -> Self {
        CategorizerError::Configuration(message.into())
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, CategorizerError::Configuration(_))
    }
}

pub type Result<T> = std::result::Result<T, CategorizerError>;
