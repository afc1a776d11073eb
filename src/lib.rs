// Transaction Categorizer - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod config;     // Category schema, rules, examples and thresholds
pub mod error;
pub mod rules;      // Keyword rules
pub mod semantic;   // Embedding similarity against example phrases
pub mod classifier; // TF-IDF + naive Bayes, hot-swappable
pub mod store;      // SQLite ledger: samples, counter, audit, snapshots
pub mod retraining; // Retraining pipeline
pub mod overrides;  // Manual corrections and the retrain trigger
pub mod engine;     // Strategy orchestration

// Re-export commonly used types
pub use config::{
    CategoryDefinition, CategorySchema, EngineConfig, KeywordRule, SemanticExampleGroup,
};
pub use error::{CategorizerError, Result};
pub use rules::{RuleMatch, RuleMatcher};
pub use semantic::{
    load_default_backend, EmbeddingBackend, SemanticMatch, SemanticMatcher, SemanticStats,
};
pub use classifier::{
    Label, LearnedClassifier, ModelInfo, NaiveBayesModel, Prediction, TrainingReport,
    MODEL_TYPE,
};
pub use store::{ImportReport, OverrideEvent, RetrainingAuditRecord, Store, TrainingSample};
pub use retraining::{PipelineState, PipelineStats, RetrainResult, RetrainingPipeline};
pub use overrides::{ManualOverride, OverrideOutcome, OverrideTracker};
pub use engine::{
    CategorizationEngine, CategorizationResult, CategorizeRequest, EngineStats, Source,
    TransactionRecord,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
