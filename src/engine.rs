// 🧭 Categorization Engine - layered strategies over one transaction
//
// Strategy order is fixed: learned classifier, semantic examples, keyword
// rules, then the flagged default. The first strategy that produces an
// acceptable answer wins.
//
// Reads never take the engine lock: the classifier hands out an Arc snapshot
// and the matchers are immutable after construction. All writes (overrides,
// counter, retraining, model swap) go through the single store mutex.

use crate::classifier::{LearnedClassifier, ModelInfo, NaiveBayesModel};
use crate::config::{CategorySchema, EngineConfig};
use crate::error::{CategorizerError, Result};
use crate::overrides::{ManualOverride, OverrideOutcome, OverrideTracker};
use crate::retraining::{PipelineStats, RetrainResult, RetrainingPipeline};
use crate::rules::RuleMatcher;
use crate::semantic::{EmbeddingBackend, SemanticMatcher, SemanticStats};
use crate::store::{ImportReport, RetrainingAuditRecord, Store};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, trace, warn};

// ============================================================================
// RESULT TYPES
// ============================================================================

/// Which strategy produced a categorization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Ai,
    Semantic,
    Rule,
    Manual,
    Default,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Ai => "ai",
            Source::Semantic => "semantic",
            Source::Rule => "rule",
            Source::Manual => "manual",
            Source::Default => "default",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorizationResult {
    pub category: String,
    pub subcategory: String,

    /// 0.0 - 1.0
    pub confidence_score: f64,

    pub source: Source,

    /// Needs human review
    pub flagged: bool,
}

// ============================================================================
// REQUEST TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorizeRequest {
    pub description: String,

    #[serde(default)]
    pub amount: Option<f64>,

    #[serde(default)]
    pub merchant: Option<String>,

    /// Carried for callers and logs; no strategy reads it
    #[serde(default)]
    pub account_type: Option<String>,

    #[serde(default = "default_enabled")]
    pub use_ai: bool,

    #[serde(default = "default_enabled")]
    pub use_semantic: bool,
}

fn default_enabled() -> bool {
    true
}

impl CategorizeRequest {
    pub fn new(description: impl Into<String>) -> Self {
        CategorizeRequest {
            description: description.into(),
            amount: None,
            merchant: None,
            account_type: None,
            use_ai: true,
            use_semantic: true,
        }
    }

    pub fn amount(mut self, amount: f64) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn merchant(mut self, merchant: impl Into<String>) -> Self {
        self.merchant = Some(merchant.into());
        self
    }

    pub fn account_type(mut self, account_type: impl Into<String>) -> Self {
        self.account_type = Some(account_type.into());
        self
    }

    pub fn use_ai(mut self, enabled: bool) -> Self {
        self.use_ai = enabled;
        self
    }

    pub fn use_semantic(mut self, enabled: bool) -> Self {
        self.use_semantic = enabled;
        self
    }

    /// Description and merchant joined, as the text-matching strategies see it
    fn match_text(&self) -> String {
        match self.merchant.as_deref().map(str::trim) {
            Some(m) if !m.is_empty() => format!("{} {}", self.description, m),
            _ => self.description.clone(),
        }
    }
}

/// A transaction carrying its own categorization fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: String,
    pub description: String,
    pub amount: f64,

    #[serde(default)]
    pub merchant: Option<String>,

    #[serde(default)]
    pub account_type: Option<String>,

    // Filled by categorize_record
    #[serde(default)]
    pub category: Option<String>,

    #[serde(default)]
    pub subcategory: Option<String>,

    #[serde(default)]
    pub confidence_score: Option<f64>,

    #[serde(default)]
    pub source: Option<Source>,

    #[serde(default)]
    pub flagged: bool,
}

impl TransactionRecord {
    pub fn new(id: impl Into<String>, description: impl Into<String>, amount: f64) -> Self {
        TransactionRecord {
            id: id.into(),
            description: description.into(),
            amount,
            merchant: None,
            account_type: None,
            category: None,
            subcategory: None,
            confidence_score: None,
            source: None,
            flagged: false,
        }
    }

    fn request(&self) -> CategorizeRequest {
        CategorizeRequest {
            description: self.description.clone(),
            amount: Some(self.amount),
            merchant: self.merchant.clone(),
            account_type: self.account_type.clone(),
            use_ai: true,
            use_semantic: true,
        }
    }

    fn apply(&mut self, result: &CategorizationResult) {
        self.category = Some(result.category.clone());
        self.subcategory = Some(result.subcategory.clone());
        self.confidence_score = Some(result.confidence_score);
        self.source = Some(result.source);
        self.flagged = result.flagged;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub active_categories: usize,
    pub rules_loaded: usize,
    pub semantic_vectors: usize,
    pub semantic_available: bool,
    pub manual_overrides_since_last_retrain: u32,
    pub retrain_trigger_count: u32,
    pub confidence_threshold: f64,
    pub semantic_threshold: f64,
    pub training_samples: usize,
    pub model: Option<ModelInfo>,
}

// ============================================================================
// STRATEGIES
// ============================================================================

trait Strategy: Send + Sync {
    fn source(&self) -> Source;

    fn enabled_for(&self, _request: &CategorizeRequest) -> bool {
        true
    }

    fn attempt(&self, request: &CategorizeRequest) -> Option<CategorizationResult>;
}

struct AiStrategy {
    classifier: Arc<LearnedClassifier>,
    schema: Arc<CategorySchema>,
    confidence_threshold: f64,
    minimum_accuracy: f64,
}

impl Strategy for AiStrategy {
    fn source(&self) -> Source {
        Source::Ai
    }

    fn enabled_for(&self, request: &CategorizeRequest) -> bool {
        request.use_ai
    }

    fn attempt(&self, request: &CategorizeRequest) -> Option<CategorizationResult> {
        let model = self.classifier.snapshot()?;
        if model.info().accuracy.unwrap_or(0.0) < self.minimum_accuracy {
            return None;
        }

        let prediction = model.predict(
            &request.description,
            request.amount,
            request.merchant.as_deref(),
        )?;
        if prediction.confidence < self.confidence_threshold {
            debug!(
                confidence = prediction.confidence,
                "classifier below confidence threshold"
            );
            return None;
        }
        if !self.schema.contains(&prediction.category, &prediction.subcategory) {
            warn!(
                category = %prediction.category,
                subcategory = %prediction.subcategory,
                "classifier predicted a label outside the schema"
            );
            return None;
        }

        Some(CategorizationResult {
            category: prediction.category,
            subcategory: prediction.subcategory,
            confidence_score: prediction.confidence,
            source: Source::Ai,
            flagged: false,
        })
    }
}

struct SemanticStrategy {
    matcher: Arc<SemanticMatcher>,
}

impl Strategy for SemanticStrategy {
    fn source(&self) -> Source {
        Source::Semantic
    }

    fn enabled_for(&self, request: &CategorizeRequest) -> bool {
        request.use_semantic && self.matcher.is_available()
    }

    fn attempt(&self, request: &CategorizeRequest) -> Option<CategorizationResult> {
        let m = self.matcher.match_text(&request.match_text())?;
        Some(CategorizationResult {
            category: m.category,
            subcategory: m.subcategory,
            confidence_score: m.similarity_score,
            source: Source::Semantic,
            flagged: false,
        })
    }
}

struct RuleStrategy {
    matcher: Arc<RuleMatcher>,
}

impl Strategy for RuleStrategy {
    fn source(&self) -> Source {
        Source::Rule
    }

    fn attempt(&self, request: &CategorizeRequest) -> Option<CategorizationResult> {
        let m = self.matcher.match_text(&request.match_text())?;
        debug!(keyword = %m.keyword, "rule matched");
        Some(CategorizationResult {
            category: m.category,
            subcategory: m.subcategory,
            confidence_score: 1.0,
            source: Source::Rule,
            flagged: false,
        })
    }
}

// ============================================================================
// ENGINE
// ============================================================================

/// Mutable half of the engine, shareable with a retraining worker
struct Learning {
    store: Mutex<Store>,
    tracker: OverrideTracker,
    retrain_in_flight: AtomicBool,
}

impl Learning {
    /// Overrides wait on the store lock while a run loads and fits, so the
    /// counter the run settles covers exactly the samples it saw.
    fn retrain(&self) -> RetrainResult {
        let store = self.store.lock();
        self.tracker.run_retraining(&store)
    }
}

pub struct CategorizationEngine {
    config: EngineConfig,
    schema: Arc<CategorySchema>,
    classifier: Arc<LearnedClassifier>,
    semantic: Arc<SemanticMatcher>,
    rules: Arc<RuleMatcher>,
    strategies: Vec<Box<dyn Strategy>>,
    learning: Arc<Learning>,
}

impl CategorizationEngine {
    /// Validate the configuration, restore the last model snapshot and embed
    /// the semantic examples. Configuration problems are the only errors.
    pub fn new(
        config: EngineConfig,
        store: Store,
        backend: Option<Arc<dyn EmbeddingBackend>>,
    ) -> Result<Self> {
        let schema = Arc::new(config.validate()?);

        let classifier = Arc::new(LearnedClassifier::new(config.minimum_training_samples));
        match store.latest_model_snapshot() {
            Ok(Some(json)) => match NaiveBayesModel::from_json(&json) {
                Ok(model) => {
                    classifier.swap(model);
                }
                Err(e) => warn!(error = %e, "ignoring unreadable model snapshot"),
            },
            Ok(None) => debug!("no model snapshot; classifier starts untrained"),
            Err(e) => warn!(error = %e, "could not read model snapshot"),
        }

        let semantic = Arc::new(SemanticMatcher::new(
            &config.semantic_examples,
            backend,
            config.semantic_threshold,
        ));
        let rules = Arc::new(RuleMatcher::from_rules(&config.rules));

        let pipeline = Arc::new(RetrainingPipeline::new(
            Arc::clone(&classifier),
            config.retrain_trigger_count,
            config.minimum_training_samples,
            config.validation_split,
        ));
        let tracker = OverrideTracker::new(pipeline, config.reset_counter_on_failure);

        let strategies: Vec<Box<dyn Strategy>> = vec![
            Box::new(AiStrategy {
                classifier: Arc::clone(&classifier),
                schema: Arc::clone(&schema),
                confidence_threshold: config.confidence_threshold,
                minimum_accuracy: config.minimum_model_accuracy,
            }),
            Box::new(SemanticStrategy {
                matcher: Arc::clone(&semantic),
            }),
            Box::new(RuleStrategy {
                matcher: Arc::clone(&rules),
            }),
        ];

        info!(
            categories = schema.len(),
            rules = rules.rule_count(),
            semantic_examples = semantic.example_count(),
            model_loaded = classifier.is_trained(),
            "categorization engine ready"
        );

        Ok(CategorizationEngine {
            config,
            schema,
            classifier,
            semantic,
            rules,
            strategies,
            learning: Arc::new(Learning {
                store: Mutex::new(store),
                tracker,
                retrain_in_flight: AtomicBool::new(false),
            }),
        })
    }

    // ------------------------------------------------------------------------
    // Categorization
    // ------------------------------------------------------------------------

    /// Always returns a result; unmatched input gets the flagged default
    pub fn categorize(&self, request: &CategorizeRequest) -> CategorizationResult {
        for strategy in &self.strategies {
            if !strategy.enabled_for(request) {
                trace!(strategy = %strategy.source(), "strategy skipped");
                continue;
            }
            if let Some(result) = strategy.attempt(request) {
                debug!(
                    description = %request.description,
                    account_type = request.account_type.as_deref().unwrap_or("-"),
                    source = %result.source,
                    category = %result.category,
                    subcategory = %result.subcategory,
                    "categorized"
                );
                return result;
            }
        }

        debug!(description = %request.description, "no strategy matched; using default");
        self.default_result()
    }

    /// Categorize a record in place and return the result
    pub fn categorize_record(&self, record: &mut TransactionRecord) -> CategorizationResult {
        let result = self.categorize(&record.request());
        record.apply(&result);
        result
    }

    fn default_result(&self) -> CategorizationResult {
        CategorizationResult {
            category: self.config.default_category.clone(),
            subcategory: self.config.default_subcategory.clone(),
            confidence_score: 0.0,
            source: Source::Default,
            flagged: true,
        }
    }

    // ------------------------------------------------------------------------
    // Schema
    // ------------------------------------------------------------------------

    pub fn get_categories(&self) -> Vec<String> {
        self.schema.categories()
    }

    /// Empty for unknown categories
    pub fn get_subcategories(&self, category: &str) -> Vec<String> {
        self.schema.subcategories(category)
    }

    pub fn schema(&self) -> &CategorySchema {
        &self.schema
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Learning
    // ------------------------------------------------------------------------

    /// Record a human correction. Reaching the trigger retrains inline, or on
    /// a worker thread when retrain_in_background is set.
    pub fn register_manual_override(&self, correction: &ManualOverride) -> Result<OverrideOutcome> {
        if !self
            .schema
            .contains(&correction.category, &correction.subcategory)
        {
            return Err(CategorizerError::UnknownCategory {
                category: correction.category.clone(),
                subcategory: correction.subcategory.clone(),
            });
        }

        let store = self.learning.store.lock();
        let tracker = &self.learning.tracker;
        let count = tracker.record(&store, correction)?;
        let result = OverrideTracker::manual_result(correction);

        if !tracker.should_retrain(&store)? {
            return Ok(OverrideOutcome {
                result,
                override_count: count,
                retrain: None,
                retrain_scheduled: false,
            });
        }

        if self.config.retrain_in_background {
            drop(store);
            let scheduled = self.spawn_retraining().is_some();
            return Ok(OverrideOutcome {
                result,
                override_count: count,
                retrain: None,
                retrain_scheduled: scheduled,
            });
        }

        info!(count, "override threshold reached; retraining");
        let retrain = tracker.run_retraining(&store);
        let override_count = store.override_counter()?;

        Ok(OverrideOutcome {
            result,
            override_count,
            retrain: Some(retrain),
            retrain_scheduled: false,
        })
    }

    /// Counter at the trigger or a retrain was requested
    pub fn should_retrain(&self) -> bool {
        let store = self.learning.store.lock();
        self.learning
            .tracker
            .should_retrain(&store)
            .unwrap_or_else(|e| {
                error!(error = %e, "could not read retraining state");
                false
            })
    }

    /// Flag a retrain for the next retrain_if_needed call
    pub fn request_retrain(&self) -> Result<()> {
        let store = self.learning.store.lock();
        self.learning.tracker.request_retrain(&store)?;
        info!("retraining requested");
        Ok(())
    }

    pub fn retrain_if_needed(&self) -> Option<RetrainResult> {
        if self.should_retrain() {
            Some(self.trigger_retraining_now())
        } else {
            None
        }
    }

    /// Run the pipeline regardless of the counter
    pub fn trigger_retraining_now(&self) -> RetrainResult {
        self.learning.retrain()
    }

    /// Retrain on a worker thread. None when a worker is already running or
    /// the thread could not be started.
    pub fn spawn_retraining(&self) -> Option<JoinHandle<RetrainResult>> {
        if self.learning.retrain_in_flight.swap(true, Ordering::SeqCst) {
            debug!("retraining already in flight");
            return None;
        }

        let learning = Arc::clone(&self.learning);
        let spawned = thread::Builder::new()
            .name("categorizer-retrain".to_string())
            .spawn(move || {
                let result = learning.retrain();
                learning.retrain_in_flight.store(false, Ordering::SeqCst);
                result
            });

        match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(error = %e, "failed to start retraining worker");
                self.learning.retrain_in_flight.store(false, Ordering::SeqCst);
                None
            }
        }
    }

    pub fn reset_override_counter(&self) -> Result<()> {
        let store = self.learning.store.lock();
        self.learning.tracker.reset_counter(&store)
    }

    pub fn override_count(&self) -> Result<u32> {
        self.learning.store.lock().override_counter()
    }

    /// Bulk-load labelled rows into the training ledger. Does not retrain.
    pub fn import_training_csv<P: AsRef<Path>>(&self, path: P) -> Result<ImportReport> {
        let mut store = self.learning.store.lock();
        store.import_training_csv(path, &self.schema)
    }

    pub fn audit_log(&self) -> Result<Vec<RetrainingAuditRecord>> {
        self.learning.store.lock().audit_records()
    }

    pub fn pipeline_stats(&self) -> PipelineStats {
        let store = self.learning.store.lock();
        self.learning.tracker.pipeline().stats(&store)
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    pub fn get_stats(&self) -> EngineStats {
        let (overrides, samples) = {
            let store = self.learning.store.lock();
            let overrides = store.override_counter().unwrap_or_else(|e| {
                error!(error = %e, "could not read override counter");
                0
            });
            let samples = store.sample_count().unwrap_or_else(|e| {
                error!(error = %e, "could not count training samples");
                0
            });
            (overrides, samples)
        };

        EngineStats {
            active_categories: self.schema.len(),
            rules_loaded: self.rules.rule_count(),
            semantic_vectors: self.semantic.example_count(),
            semantic_available: self.semantic.is_available(),
            manual_overrides_since_last_retrain: overrides,
            retrain_trigger_count: self.config.retrain_trigger_count,
            confidence_threshold: self.config.confidence_threshold,
            semantic_threshold: self.config.semantic_threshold,
            training_samples: samples,
            model: self.classifier.info(),
        }
    }

    pub fn classifier(&self) -> &LearnedClassifier {
        &self.classifier
    }

    pub fn is_semantic_available(&self) -> bool {
        self.semantic.is_available()
    }

    pub fn semantic_stats(&self) -> SemanticStats {
        self.semantic.stats()
    }
}

impl std::fmt::Debug for CategorizationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CategorizationEngine")
            .field("categories", &self.schema.len())
            .field("rules", &self.rules.rule_count())
            .field("semantic_available", &self.semantic.is_available())
            .field("model_trained", &self.classifier.is_trained())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CategoryDefinition, KeywordRule, SemanticExampleGroup};
    use crate::semantic::tests::HashingEmbedder;

    fn config() -> EngineConfig {
        EngineConfig {
            categories: vec![
                CategoryDefinition::new("Transport", &["Fuel", "Parking"]),
                CategoryDefinition::new("Food", &["Groceries", "Restaurant"]),
                CategoryDefinition::new("Income", &["Salary"]),
                CategoryDefinition::new("Other", &["Unknown"]),
            ],
            rules: vec![
                KeywordRule {
                    category: "Transport".into(),
                    subcategory: "Fuel".into(),
                    keywords: vec!["shell".into(), "circle k".into()],
                },
                KeywordRule {
                    category: "Food".into(),
                    subcategory: "Groceries".into(),
                    keywords: vec!["ica".into()],
                },
            ],
            semantic_examples: vec![SemanticExampleGroup {
                category: "Transport".into(),
                subcategory: "Parking".into(),
                examples: vec!["parkering garage".into(), "easypark avgift".into()],
            }],
            ..EngineConfig::default()
        }
    }

    fn engine(config: EngineConfig) -> CategorizationEngine {
        CategorizationEngine::new(config, Store::open_in_memory().unwrap(), None).unwrap()
    }

    fn semantic_engine() -> CategorizationEngine {
        let backend: Arc<dyn EmbeddingBackend> = Arc::new(HashingEmbedder);
        CategorizationEngine::new(config(), Store::open_in_memory().unwrap(), Some(backend))
            .unwrap()
    }

    /// Five groceries and five fuel corrections with class-specific tokens
    fn corrections() -> Vec<ManualOverride> {
        (0..10)
            .map(|i| {
                if i % 2 == 0 {
                    ManualOverride::new(
                        format!("tx-{}", i),
                        "Food",
                        "Groceries",
                        format!("ICA Maxi kvitto {}", 100 + i),
                    )
                } else {
                    ManualOverride::new(
                        format!("tx-{}", i),
                        "Transport",
                        "Fuel",
                        format!("Shell tankning station {}", 100 + i),
                    )
                }
            })
            .collect()
    }

    #[test]
    fn test_rule_match() {
        let e = engine(config());
        let result = e.categorize(
            &CategorizeRequest::new("Tankning Shell")
                .amount(-450.0)
                .use_ai(false)
                .use_semantic(false),
        );

        assert_eq!(result.category, "Transport");
        assert_eq!(result.subcategory, "Fuel");
        assert_eq!(result.source, Source::Rule);
        assert_eq!(result.confidence_score, 1.0);
        assert!(!result.flagged);
    }

    #[test]
    fn test_rule_matches_merchant() {
        let e = engine(config());
        let result = e.categorize(&CategorizeRequest::new("Kortköp 1234").merchant("ICA Nära"));

        assert_eq!(result.category, "Food");
        assert_eq!(result.source, Source::Rule);
    }

    #[test]
    fn test_unmatched_gets_flagged_default() {
        let e = engine(config());
        let result = e.categorize(&CategorizeRequest::new("xyzzy123"));

        assert_eq!(result.category, "Other");
        assert_eq!(result.subcategory, "Unknown");
        assert_eq!(result.source, Source::Default);
        assert_eq!(result.confidence_score, 0.0);
        assert!(result.flagged);
    }

    #[test]
    fn test_empty_description_gets_default() {
        let e = semantic_engine();
        let result = e.categorize(&CategorizeRequest::new(""));
        assert_eq!(result.source, Source::Default);
    }

    #[test]
    fn test_categorize_is_deterministic() {
        let e = engine(config());
        let request = CategorizeRequest::new("Shell Helsingborg").amount(-300.0);
        assert_eq!(e.categorize(&request), e.categorize(&request));
    }

    #[test]
    fn test_semantic_match() {
        let e = semantic_engine();
        assert!(e.is_semantic_available());

        let result = e.categorize(&CategorizeRequest::new("Parkering Garage"));
        assert_eq!(result.category, "Transport");
        assert_eq!(result.subcategory, "Parking");
        assert_eq!(result.source, Source::Semantic);
        assert!(result.confidence_score >= 0.75);
    }

    #[test]
    fn test_semantic_disabled_falls_through() {
        let e = semantic_engine();
        let result = e.categorize(&CategorizeRequest::new("Parkering Garage").use_semantic(false));
        assert_eq!(result.source, Source::Default);
    }

    #[test]
    fn test_semantic_below_threshold_falls_to_rule() {
        let e = semantic_engine();
        let result = e.categorize(&CategorizeRequest::new("Shell Lund"));
        assert_eq!(result.source, Source::Rule);
    }

    #[test]
    fn test_semantic_unavailable_without_backend() {
        let e = engine(config());
        assert!(!e.is_semantic_available());
        let result = e.categorize(&CategorizeRequest::new("Parkering Garage"));
        assert_eq!(result.source, Source::Default);
    }

    #[test]
    fn test_trigger_count_retrains_and_ai_takes_over() {
        let e = engine(EngineConfig {
            confidence_threshold: 0.5,
            ..config()
        });
        let corrections = corrections();

        for (i, c) in corrections.iter().enumerate().take(9) {
            let outcome = e.register_manual_override(c).unwrap();
            assert_eq!(outcome.override_count, i as u32 + 1);
            assert!(outcome.retrain.is_none());
        }
        assert!(!e.should_retrain());

        let outcome = e.register_manual_override(&corrections[9]).unwrap();
        let retrain = outcome.retrain.expect("tenth override retrains");
        assert!(retrain.success);
        assert_eq!(retrain.samples_used, 10);
        assert_eq!(outcome.override_count, 0);
        assert!(e.classifier().is_trained());

        // Rule "ica" also matches; the classifier answers first
        let result = e.categorize(&CategorizeRequest::new("ICA Maxi kvitto 200"));
        assert_eq!(result.source, Source::Ai);
        assert_eq!(result.category, "Food");
        assert_eq!(result.subcategory, "Groceries");
        assert!(!result.flagged);

        let audit = e.audit_log().unwrap();
        assert_eq!(audit.len(), 1);
        assert!(audit[0].success);
    }

    #[test]
    fn test_use_ai_false_skips_classifier() {
        let e = engine(EngineConfig {
            confidence_threshold: 0.5,
            ..config()
        });
        for c in &corrections() {
            e.register_manual_override(c).unwrap();
        }
        assert!(e.classifier().is_trained());

        let result = e.categorize(&CategorizeRequest::new("ICA Maxi kvitto 200").use_ai(false));
        assert_eq!(result.source, Source::Rule);
    }

    #[test]
    fn test_override_returns_manual_result() {
        let e = engine(config());
        let outcome = e
            .register_manual_override(&ManualOverride::new("tx-1", "Food", "Restaurant", "Pizzeria"))
            .unwrap();

        assert_eq!(outcome.result.source, Source::Manual);
        assert_eq!(outcome.result.category, "Food");
        assert_eq!(outcome.result.confidence_score, 1.0);
    }

    #[test]
    fn test_unknown_category_rejected() {
        let e = engine(config());
        let err = e
            .register_manual_override(&ManualOverride::new("tx-1", "Travel", "Flights", "SAS"))
            .unwrap_err();

        assert!(matches!(err, CategorizerError::UnknownCategory { .. }));
        assert_eq!(e.override_count().unwrap(), 0);
    }

    #[test]
    fn test_insufficient_data_keeps_classifier_untrained() {
        let e = engine(config());
        e.register_manual_override(&ManualOverride::new("tx-1", "Food", "Groceries", "ICA"))
            .unwrap();
        e.register_manual_override(&ManualOverride::new("tx-2", "Transport", "Fuel", "Shell"))
            .unwrap();

        let result = e.trigger_retraining_now();
        assert!(!result.success);
        assert!(result.message.contains("Insufficient training data"));
        assert!(!e.classifier().is_trained());

        let categorized = e.categorize(&CategorizeRequest::new("Shell"));
        assert_eq!(categorized.source, Source::Rule);

        let audit = e.audit_log().unwrap();
        assert_eq!(audit.len(), 1);
        assert!(!audit[0].success);
    }

    #[test]
    fn test_failed_retrain_resets_counter_by_default() {
        let e = engine(EngineConfig {
            minimum_training_samples: 50,
            ..config()
        });
        let mut last = None;
        for c in &corrections() {
            last = Some(e.register_manual_override(c).unwrap());
        }

        let outcome = last.unwrap();
        assert!(!outcome.retrain.unwrap().success);
        assert_eq!(outcome.override_count, 0);
    }

    #[test]
    fn test_failed_retrain_keeps_counter_when_configured() {
        let e = engine(EngineConfig {
            minimum_training_samples: 50,
            reset_counter_on_failure: false,
            ..config()
        });
        for c in &corrections() {
            e.register_manual_override(c).unwrap();
        }
        assert_eq!(e.override_count().unwrap(), 10);

        // Still at the trigger, so the next override attempts again
        let outcome = e
            .register_manual_override(&ManualOverride::new("tx-x", "Food", "Groceries", "ICA"))
            .unwrap();
        assert!(outcome.retrain.is_some());
        assert_eq!(outcome.override_count, 11);
        assert_eq!(e.audit_log().unwrap().len(), 2);
    }

    #[test]
    fn test_request_retrain_and_retrain_if_needed() {
        let e = engine(config());
        assert!(e.retrain_if_needed().is_none());

        e.request_retrain().unwrap();
        assert!(e.should_retrain());

        let result = e.retrain_if_needed().unwrap();
        assert!(!result.success);
        assert!(!e.should_retrain());
    }

    #[test]
    fn test_reset_override_counter() {
        let e = engine(config());
        e.register_manual_override(&ManualOverride::new("tx-1", "Food", "Groceries", "ICA"))
            .unwrap();
        assert_eq!(e.override_count().unwrap(), 1);

        e.reset_override_counter().unwrap();
        assert_eq!(e.override_count().unwrap(), 0);
    }

    #[test]
    fn test_background_retraining() {
        let e = engine(EngineConfig {
            retrain_in_background: true,
            ..config()
        });
        let corrections = corrections();
        for c in &corrections[..9] {
            e.register_manual_override(c).unwrap();
        }

        let outcome = e.register_manual_override(&corrections[9]).unwrap();
        assert!(outcome.retrain.is_none());
        assert!(outcome.retrain_scheduled);

        // Wait for the scheduled worker by queueing behind it on the store
        let handle = loop {
            if let Some(h) = e.spawn_retraining() {
                break h;
            }
            thread::yield_now();
        };
        let result = handle.join().unwrap();
        assert!(result.success);
        assert!(e.classifier().is_trained());
        assert_eq!(e.override_count().unwrap(), 0);
    }

    #[test]
    fn test_concurrent_reads_during_retraining() {
        let e = engine(EngineConfig {
            confidence_threshold: 0.5,
            ..config()
        });
        for c in &corrections()[..9] {
            e.register_manual_override(c).unwrap();
        }

        let categories = e.get_categories();
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..50 {
                        let r = e.categorize(&CategorizeRequest::new("ICA Maxi kvitto 201"));
                        assert!(categories.contains(&r.category));
                        assert_eq!(r.category, "Food");
                    }
                });
            }
            s.spawn(|| {
                let result = e.trigger_retraining_now();
                assert!(result.success);
            });
        });
    }

    #[test]
    fn test_snapshot_restored_on_restart() {
        let path = std::env::temp_dir().join(format!("categorizer-{}.db", uuid::Uuid::new_v4()));

        {
            let e = CategorizationEngine::new(
                EngineConfig {
                    confidence_threshold: 0.5,
                    ..config()
                },
                Store::open(&path).unwrap(),
                None,
            )
            .unwrap();
            for c in &corrections() {
                e.register_manual_override(c).unwrap();
            }
            assert!(e.classifier().is_trained());
        }

        let e = CategorizationEngine::new(
            EngineConfig {
                confidence_threshold: 0.5,
                ..config()
            },
            Store::open(&path).unwrap(),
            None,
        )
        .unwrap();
        assert!(e.classifier().is_trained());
        assert_eq!(e.classifier().info().unwrap().version, 1);
        assert_eq!(
            e.categorize(&CategorizeRequest::new("Shell tankning station 205")).source,
            Source::Ai
        );

        drop(e);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_minimum_accuracy_gates_classifier() {
        let classifier = Arc::new(LearnedClassifier::new(1));
        let samples: Vec<_> = corrections()
            .iter()
            .map(|c| crate::store::TrainingSample::manual(&c.description, &c.category, &c.subcategory))
            .collect();
        let model = NaiveBayesModel::fit(&samples, 1).unwrap().with_accuracy(0.4);
        classifier.swap(model);

        let schema = Arc::new(config().validate().unwrap());
        let request = CategorizeRequest::new("ICA Maxi kvitto 100");

        let strict = AiStrategy {
            classifier: Arc::clone(&classifier),
            schema: Arc::clone(&schema),
            confidence_threshold: 0.5,
            minimum_accuracy: 0.5,
        };
        assert!(strict.attempt(&request).is_none());

        let lenient = AiStrategy {
            classifier,
            schema,
            confidence_threshold: 0.5,
            minimum_accuracy: 0.3,
        };
        assert_eq!(lenient.attempt(&request).unwrap().category, "Food");
    }

    #[test]
    fn test_categorize_record_fills_fields() {
        let e = engine(config());
        let mut record = TransactionRecord::new("tx-9", "Circle K Malmö", -520.0);

        let result = e.categorize_record(&mut record);
        assert_eq!(record.category.as_deref(), Some("Transport"));
        assert_eq!(record.source, Some(Source::Rule));
        assert_eq!(record.confidence_score, Some(result.confidence_score));
    }

    #[test]
    fn test_amount_alone_never_reaches_classifier() {
        let e = engine(config());
        for i in 0..10 {
            let mut c = if i < 8 {
                ManualOverride::new(format!("tx-{}", i), "Food", "Groceries", format!("Hemköp kvitto {}", 100 + i))
            } else {
                ManualOverride::new(format!("tx-{}", i), "Income", "Salary", format!("Lön arbetsgivare {}", 100 + i))
            };
            c.amount = Some(if i < 8 { -100.0 } else { 30000.0 });
            e.register_manual_override(&c).unwrap();
        }
        assert!(e.classifier().is_trained());

        for description in ["", "xyzzy123"] {
            let result = e.categorize(&CategorizeRequest::new(description).amount(-50.0));
            assert_eq!(result.source, Source::Default);
            assert!(result.flagged);
        }

        let known = e.categorize(&CategorizeRequest::new("Hemköp kvitto 300").amount(-50.0));
        assert_eq!(known.source, Source::Ai);
        assert_eq!(known.category, "Food");
    }

    #[test]
    fn test_categories_and_stats() {
        let e = semantic_engine();
        assert_eq!(e.get_categories(), vec!["Transport", "Food", "Income", "Other"]);
        assert_eq!(e.get_subcategories("Transport"), vec!["Fuel", "Parking"]);
        assert!(e.get_subcategories("Nope").is_empty());

        let semantic = e.semantic_stats();
        assert!(semantic.model_available);
        assert_eq!(semantic.model_name.as_deref(), Some("hashing-test"));

        let stats = e.get_stats();
        assert_eq!(stats.active_categories, 4);
        assert_eq!(stats.rules_loaded, 2);
        assert_eq!(stats.semantic_vectors, 2);
        assert_eq!(stats.manual_overrides_since_last_retrain, 0);
        assert_eq!(stats.retrain_trigger_count, 10);
        assert!(stats.model.is_none());
    }

    #[test]
    fn test_source_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Source::Ai).unwrap(), "\"ai\"");
        assert_eq!(Source::Default.to_string(), "default");
    }
}
