// ✍️ Override Tracker - human corrections as training signal
//
// Every correction bumps the durable counter; with train_ai it also lands in
// the training ledger. Reaching the trigger runs the retraining pipeline.
// Callers hold the store lock around every method here, so counter updates
// and the classifier swap never interleave.

use crate::engine::{CategorizationResult, Source};
use crate::error::Result;
use crate::retraining::{RetrainResult, RetrainingPipeline};
use crate::store::{OverrideEvent, Store, TrainingSample};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info};

// ============================================================================
// OVERRIDE INPUT / OUTCOME
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualOverride {
    pub transaction_id: String,
    pub category: String,
    pub subcategory: String,
    pub description: String,

    #[serde(default)]
    pub merchant: Option<String>,

    #[serde(default)]
    pub amount: Option<f64>,

    /// Append the correction to the training ledger
    #[serde(default = "default_train_ai")]
    pub train_ai: bool,
}

fn default_train_ai() -> bool {
    true
}

impl ManualOverride {
    pub fn new(
        transaction_id: impl Into<String>,
        category: impl Into<String>,
        subcategory: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        ManualOverride {
            transaction_id: transaction_id.into(),
            category: category.into(),
            subcategory: subcategory.into(),
            description: description.into(),
            merchant: None,
            amount: None,
            train_ai: true,
        }
    }

    pub fn without_training(mut self) -> Self {
        self.train_ai = false;
        self
    }

    fn training_sample(&self) -> TrainingSample {
        let mut sample = TrainingSample::manual(
            self.description.clone(),
            self.category.clone(),
            self.subcategory.clone(),
        );
        sample.merchant = self.merchant.clone();
        sample.amount = self.amount;
        sample
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideOutcome {
    /// The correction as a categorization (source = manual)
    pub result: CategorizationResult,

    /// Counter value once this override is fully handled
    pub override_count: u32,

    /// Present when this override ran retraining inline
    pub retrain: Option<RetrainResult>,

    /// Retraining was handed to a background worker
    pub retrain_scheduled: bool,
}

// ============================================================================
// OVERRIDE TRACKER
// ============================================================================

pub struct OverrideTracker {
    pipeline: Arc<RetrainingPipeline>,
    reset_counter_on_failure: bool,
}

impl OverrideTracker {
    pub fn new(pipeline: Arc<RetrainingPipeline>, reset_counter_on_failure: bool) -> Self {
        OverrideTracker {
            pipeline,
            reset_counter_on_failure,
        }
    }

    /// Store the correction and bump the counter; returns the new count
    pub fn record(&self, store: &Store, correction: &ManualOverride) -> Result<u32> {
        if correction.train_ai {
            store.append_sample(&correction.training_sample())?;
            debug!(
                description = %correction.description,
                "added training sample"
            );
        }

        let count = store.override_counter()?.saturating_add(1);
        store.set_override_counter(count)?;

        store.insert_override_event(&OverrideEvent::new(
            correction.transaction_id.as_str(),
            correction.category.as_str(),
            correction.subcategory.as_str(),
            correction.description.as_str(),
            correction.train_ai,
            count,
        ))?;

        info!(
            transaction_id = %correction.transaction_id,
            category = %correction.category,
            subcategory = %correction.subcategory,
            count,
            "manual override registered"
        );
        Ok(count)
    }

    pub fn should_retrain(&self, store: &Store) -> Result<bool> {
        Ok(self
            .pipeline
            .should_retrain(store.override_counter()?, store.retrain_requested()?))
    }

    /// Run the pipeline now and settle the counter afterwards
    pub fn run_retraining(&self, store: &Store) -> RetrainResult {
        let counted = store.override_counter().unwrap_or_else(|e| {
            error!(error = %e, "failed to read override counter");
            0
        });
        let result = self.pipeline.run(store);

        if let Err(e) = store.set_retrain_requested(false) {
            error!(error = %e, "failed to clear retrain request");
        }
        if result.success || self.reset_counter_on_failure {
            if let Err(e) = self.settle_counter(store, counted) {
                error!(error = %e, "failed to settle override counter");
            }
        }

        info!(
            success = result.success,
            message = %result.message,
            "retraining attempt finished"
        );
        result
    }

    /// Take the overrides a run consumed off the counter. Anything recorded
    /// after `counted` was read stays counted toward the next trigger.
    pub fn settle_counter(&self, store: &Store, counted: u32) -> Result<u32> {
        let remaining = store.override_counter()?.saturating_sub(counted);
        store.set_override_counter(remaining)?;
        Ok(remaining)
    }

    pub fn reset_counter(&self, store: &Store) -> Result<()> {
        store.set_override_counter(0)?;
        info!("override counter reset");
        Ok(())
    }

    pub fn request_retrain(&self, store: &Store) -> Result<()> {
        store.set_retrain_requested(true)
    }

    pub fn manual_result(correction: &ManualOverride) -> CategorizationResult {
        CategorizationResult {
            category: correction.category.clone(),
            subcategory: correction.subcategory.clone(),
            confidence_score: 1.0,
            source: Source::Manual,
            flagged: false,
        }
    }

    pub fn pipeline(&self) -> &RetrainingPipeline {
        &self.pipeline
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::LearnedClassifier;

    fn tracker(reset_on_failure: bool) -> OverrideTracker {
        let classifier = Arc::new(LearnedClassifier::new(4));
        let pipeline = Arc::new(RetrainingPipeline::new(classifier, 3, 4, 0.2));
        OverrideTracker::new(pipeline, reset_on_failure)
    }

    #[test]
    fn test_record_appends_sample_and_counts() {
        let store = Store::open_in_memory().unwrap();
        let t = tracker(true);

        let count = t
            .record(&store, &ManualOverride::new("tx-1", "Food", "Groceries", "ICA"))
            .unwrap();

        assert_eq!(count, 1);
        assert_eq!(store.sample_count().unwrap(), 1);
        let events = store.override_events_for("tx-1").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].counter_after, 1);
    }

    #[test]
    fn test_record_without_training_still_counts() {
        let store = Store::open_in_memory().unwrap();
        let t = tracker(true);

        let count = t
            .record(
                &store,
                &ManualOverride::new("tx-1", "Food", "Groceries", "ICA").without_training(),
            )
            .unwrap();

        assert_eq!(count, 1);
        assert_eq!(store.sample_count().unwrap(), 0);
    }

    #[test]
    fn test_should_retrain_at_trigger() {
        let store = Store::open_in_memory().unwrap();
        let t = tracker(true);

        for i in 0..3 {
            assert!(!t.should_retrain(&store).unwrap());
            t.record(&store, &ManualOverride::new(format!("tx-{}", i), "Food", "Groceries", "ICA"))
                .unwrap();
        }
        assert!(t.should_retrain(&store).unwrap());
    }

    #[test]
    fn test_failed_run_resets_counter_by_default() {
        let store = Store::open_in_memory().unwrap();
        let t = tracker(true);
        store.set_override_counter(3).unwrap();

        let result = t.run_retraining(&store);

        assert!(!result.success);
        assert_eq!(store.override_counter().unwrap(), 0);
    }

    #[test]
    fn test_failed_run_keeps_counter_when_configured() {
        let store = Store::open_in_memory().unwrap();
        let t = tracker(false);
        store.set_override_counter(3).unwrap();

        let result = t.run_retraining(&store);

        assert!(!result.success);
        assert_eq!(store.override_counter().unwrap(), 3);
    }

    #[test]
    fn test_run_consumes_every_counted_override() {
        let store = Store::open_in_memory().unwrap();
        let t = tracker(true);
        for i in 0..11 {
            let correction = if i % 2 == 0 {
                ManualOverride::new(
                    format!("tx-{}", i),
                    "Food",
                    "Groceries",
                    format!("ICA kvitto {}", i),
                )
            } else {
                ManualOverride::new(format!("tx-{}", i), "Income", "Salary", format!("Lön {}", i))
            };
            t.record(&store, &correction).unwrap();
        }
        assert_eq!(store.override_counter().unwrap(), 11);

        let result = t.run_retraining(&store);

        assert!(result.success, "{}", result.message);
        assert_eq!(result.samples_used, 11);
        assert_eq!(store.override_counter().unwrap(), 0);
    }

    #[test]
    fn test_settle_keeps_overrides_recorded_after_read() {
        let store = Store::open_in_memory().unwrap();
        let t = tracker(true);
        store.set_override_counter(3).unwrap();
        let counted = store.override_counter().unwrap();

        t.record(&store, &ManualOverride::new("tx-late", "Food", "Groceries", "ICA"))
            .unwrap();
        t.record(&store, &ManualOverride::new("tx-later", "Food", "Groceries", "Willys"))
            .unwrap();

        assert_eq!(t.settle_counter(&store, counted).unwrap(), 2);
        assert_eq!(store.override_counter().unwrap(), 2);
    }

    #[test]
    fn test_request_flag_cleared_after_run() {
        let store = Store::open_in_memory().unwrap();
        let t = tracker(true);

        t.request_retrain(&store).unwrap();
        assert!(t.should_retrain(&store).unwrap());

        t.run_retraining(&store);
        assert!(!t.should_retrain(&store).unwrap());
    }

    #[test]
    fn test_manual_result_shape() {
        let result =
            OverrideTracker::manual_result(&ManualOverride::new("tx", "Food", "Groceries", "ICA"));
        assert_eq!(result.source, Source::Manual);
        assert_eq!(result.confidence_score, 1.0);
        assert!(!result.flagged);
    }
}
