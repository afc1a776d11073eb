// ⚙️ Engine Configuration - Rules as Data
// Category schema, thresholds, keyword rules and semantic examples, loaded
// once from JSON. Arrays keep the author's ordering, which is the iteration
// order every matcher relies on.

use crate::error::{CategorizerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

// ============================================================================
// DEFAULTS
// ============================================================================

pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.65;
pub const DEFAULT_SEMANTIC_THRESHOLD: f64 = 0.75;
pub const DEFAULT_RETRAIN_TRIGGER_COUNT: u32 = 10;
pub const DEFAULT_MINIMUM_TRAINING_SAMPLES: usize = 4;
pub const DEFAULT_VALIDATION_SPLIT: f64 = 0.2;
pub const DEFAULT_EMBEDDING_MODEL: &str = "all-MiniLM-L6-v2";

fn default_confidence_threshold() -> f64 {
    DEFAULT_CONFIDENCE_THRESHOLD
}

fn default_semantic_threshold() -> f64 {
    DEFAULT_SEMANTIC_THRESHOLD
}

fn default_retrain_trigger_count() -> u32 {
    DEFAULT_RETRAIN_TRIGGER_COUNT
}

fn default_minimum_training_samples() -> usize {
    DEFAULT_MINIMUM_TRAINING_SAMPLES
}

fn default_validation_split() -> f64 {
    DEFAULT_VALIDATION_SPLIT
}

fn default_true() -> bool {
    true
}

fn default_category() -> String {
    "Other".to_string()
}

fn default_subcategory() -> String {
    "Unknown".to_string()
}

fn default_embedding_model() -> String {
    DEFAULT_EMBEDDING_MODEL.to_string()
}

// ============================================================================
// CATEGORY SCHEMA
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryDefinition {
    pub name: String,

    #[serde(default)]
    pub subcategories: Vec<String>,
}

impl CategoryDefinition {
    pub fn new(name: impl Into<String>, subcategories: &[&str]) -> Self {
        CategoryDefinition {
            name: name.into(),
            subcategories: subcategories.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Closed, ordered category → subcategories vocabulary
#[derive(Debug, Clone, PartialEq)]
pub struct CategorySchema {
    categories: Vec<CategoryDefinition>,
}

impl CategorySchema {
    /// Build a schema, rejecting empty or duplicate names within their scope
    pub fn new(categories: Vec<CategoryDefinition>) -> Result<Self> {
        if categories.is_empty() {
            return Err(CategorizerError::config("category schema is empty"));
        }

        let mut seen = HashSet::new();
        for category in &categories {
            if category.name.trim().is_empty() {
                return Err(CategorizerError::config("category name must not be empty"));
            }
            if !seen.insert(category.name.as_str()) {
                return Err(CategorizerError::config(format!(
                    "duplicate category: {}",
                    category.name
                )));
            }

            let mut seen_sub = HashSet::new();
            for sub in &category.subcategories {
                if sub.trim().is_empty() {
                    return Err(CategorizerError::config(format!(
                        "empty subcategory under {}",
                        category.name
                    )));
                }
                if !seen_sub.insert(sub.as_str()) {
                    return Err(CategorizerError::config(format!(
                        "duplicate subcategory {} under {}",
                        sub, category.name
                    )));
                }
            }
        }

        Ok(CategorySchema { categories })
    }

    pub fn categories(&self) -> Vec<String> {
        self.categories.iter().map(|c| c.name.clone()).collect()
    }

    /// Subcategories of a category, empty for an unknown one
    pub fn subcategories(&self, category: &str) -> Vec<String> {
        self.categories
            .iter()
            .find(|c| c.name == category)
            .map(|c| c.subcategories.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, category: &str, subcategory: &str) -> bool {
        self.categories
            .iter()
            .any(|c| c.name == category && c.subcategories.iter().any(|s| s == subcategory))
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}

// ============================================================================
// RULE AND EXAMPLE SETS
// ============================================================================

/// Keywords for one category/subcategory pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordRule {
    pub category: String,
    pub subcategory: String,
    pub keywords: Vec<String>,
}

/// Ground-truth phrases for one category/subcategory pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticExampleGroup {
    pub category: String,
    pub subcategory: String,
    pub examples: Vec<String>,
}

// ============================================================================
// ENGINE CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub categories: Vec<CategoryDefinition>,

    /// Bucket used when no strategy produced a result
    #[serde(default = "default_category")]
    pub default_category: String,

    #[serde(default = "default_subcategory")]
    pub default_subcategory: String,

    /// Minimum classifier probability for an "ai" result
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// Minimum cosine similarity for a "semantic" result
    #[serde(default = "default_semantic_threshold")]
    pub semantic_threshold: f64,

    /// Overrides needed before automatic retraining
    #[serde(default = "default_retrain_trigger_count")]
    pub retrain_trigger_count: u32,

    #[serde(default = "default_minimum_training_samples")]
    pub minimum_training_samples: usize,

    /// Share of samples held out for evaluation
    #[serde(default = "default_validation_split")]
    pub validation_split: f64,

    /// Zero the override counter after a failed retrain as well
    #[serde(default = "default_true")]
    pub reset_counter_on_failure: bool,

    /// Last-evaluation accuracy a model needs before its predictions count
    #[serde(default)]
    pub minimum_model_accuracy: f64,

    /// Run threshold-triggered retraining on a worker thread
    #[serde(default)]
    pub retrain_in_background: bool,

    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    #[serde(default)]
    pub rules: Vec<KeywordRule>,

    #[serde(default)]
    pub semantic_examples: Vec<SemanticExampleGroup>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            categories: vec![CategoryDefinition::new(default_category(), &["Unknown"])],
            default_category: default_category(),
            default_subcategory: default_subcategory(),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            semantic_threshold: DEFAULT_SEMANTIC_THRESHOLD,
            retrain_trigger_count: DEFAULT_RETRAIN_TRIGGER_COUNT,
            minimum_training_samples: DEFAULT_MINIMUM_TRAINING_SAMPLES,
            validation_split: DEFAULT_VALIDATION_SPLIT,
            reset_counter_on_failure: true,
            minimum_model_accuracy: 0.0,
            retrain_in_background: false,
            embedding_model: default_embedding_model(),
            rules: Vec::new(),
            semantic_examples: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Load and validate configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            CategorizerError::config(format!(
                "failed to read config file {:?}: {}",
                path.as_ref(),
                e
            ))
        })?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(content)
            .map_err(|e| CategorizerError::config(format!("failed to parse config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Build the schema and check every threshold and reference against it
    pub fn validate(&self) -> Result<CategorySchema> {
        check_unit_interval("confidence_threshold", self.confidence_threshold)?;
        check_unit_interval("semantic_threshold", self.semantic_threshold)?;
        check_unit_interval("minimum_model_accuracy", self.minimum_model_accuracy)?;
        check_unit_interval("validation_split", self.validation_split)?;
        if self.validation_split >= 1.0 {
            return Err(CategorizerError::config("validation_split must be below 1.0"));
        }
        if self.retrain_trigger_count == 0 {
            return Err(CategorizerError::config("retrain_trigger_count must be positive"));
        }
        if self.minimum_training_samples == 0 {
            return Err(CategorizerError::config("minimum_training_samples must be positive"));
        }

        let schema = CategorySchema::new(self.categories.clone())?;

        if !schema.contains(&self.default_category, &self.default_subcategory) {
            return Err(CategorizerError::config(format!(
                "default {}/{} is not in the category schema",
                self.default_category, self.default_subcategory
            )));
        }

        for rule in &self.rules {
            if !schema.contains(&rule.category, &rule.subcategory) {
                return Err(CategorizerError::config(format!(
                    "rule targets unknown category {}/{}",
                    rule.category, rule.subcategory
                )));
            }
        }

        for group in &self.semantic_examples {
            if !schema.contains(&group.category, &group.subcategory) {
                return Err(CategorizerError::config(format!(
                    "semantic examples target unknown category {}/{}",
                    group.category, group.subcategory
                )));
            }
        }

        Ok(schema)
    }
}

fn check_unit_interval(name: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(CategorizerError::config(format!(
            "{} must be within [0, 1], got {}",
            name, value
        )));
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "categories": [
                {"name": "Transport", "subcategories": ["Fuel", "Parking"]},
                {"name": "Food", "subcategories": ["Groceries"]},
                {"name": "Other", "subcategories": ["Unknown"]}
            ],
            "rules": [
                {"category": "Transport", "subcategory": "Fuel", "keywords": ["shell"]}
            ]
        }"#
    }

    #[test]
    fn test_defaults_applied() {
        let config = EngineConfig::from_json_str(sample_json()).unwrap();

        assert_eq!(config.confidence_threshold, 0.65);
        assert_eq!(config.semantic_threshold, 0.75);
        assert_eq!(config.retrain_trigger_count, 10);
        assert_eq!(config.minimum_training_samples, 4);
        assert_eq!(config.default_category, "Other");
        assert!(config.reset_counter_on_failure);
    }

    #[test]
    fn test_schema_preserves_order() {
        let config = EngineConfig::from_json_str(sample_json()).unwrap();
        let schema = config.validate().unwrap();

        assert_eq!(schema.categories(), vec!["Transport", "Food", "Other"]);
        assert_eq!(schema.subcategories("Transport"), vec!["Fuel", "Parking"]);
        assert!(schema.subcategories("Missing").is_empty());
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let mut config = EngineConfig::default();
        config.semantic_threshold = 1.5;

        let err = config.validate().unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_duplicate_category_rejected() {
        let mut config = EngineConfig::default();
        config.categories.push(CategoryDefinition::new("Other", &["Misc"]));

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_subcategory_rejected() {
        let mut config = EngineConfig::default();
        config.categories = vec![CategoryDefinition::new("Other", &["Unknown", "Unknown"])];

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rule_with_unknown_category_rejected() {
        let mut config = EngineConfig::default();
        config.rules.push(KeywordRule {
            category: "Travel".to_string(),
            subcategory: "Flights".to_string(),
            keywords: vec!["sas".to_string()],
        });

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_pair_must_exist() {
        let mut config = EngineConfig::default();
        config.default_subcategory = "Misc".to_string();

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_json_is_configuration_error() {
        let err = EngineConfig::from_json_str("{not json").unwrap_err();
        assert!(err.is_configuration());
    }
}
