// 🔁 Retraining Pipeline - validate → train → evaluate → swap → audit
//
// IDLE → VALIDATING → TRAINING → EVALUATING → AUDITING → IDLE on success,
// IDLE → VALIDATING → FAILED → IDLE otherwise. Every attempt leaves one audit
// row. A failed attempt never touches the active classifier.

use crate::classifier::{LearnedClassifier, NaiveBayesModel, MODEL_TYPE};
use crate::store::{RetrainingAuditRecord, Store, TrainingSample};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

// ============================================================================
// STATE / RESULT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    Idle,
    Validating,
    Training,
    Evaluating,
    Auditing,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrainResult {
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub model_type: String,
    pub samples_used: usize,

    /// Validation accuracy of the new model, 0.0 on failure
    pub accuracy: f64,
    pub message: String,

    /// Version of the model swapped in, if any
    pub model_version: Option<u64>,
}

impl RetrainResult {
    fn audit_record(&self) -> RetrainingAuditRecord {
        RetrainingAuditRecord {
            timestamp: self.timestamp,
            model_type: self.model_type.clone(),
            sample_count: self.samples_used,
            accuracy: self.accuracy,
            success: self.success,
            message: self.message.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStats {
    pub trigger_threshold: u32,
    pub model_type: String,
    pub validation_split: f64,
    pub minimum_training_samples: usize,
    pub state: PipelineState,
    pub last_retrain: Option<RetrainingAuditRecord>,
}

// ============================================================================
// SPLIT
// ============================================================================

/// Deterministic train/validation partition. Samples are ranked by a hash of
/// their content and position; the lowest-ranked share becomes validation,
/// except that every label keeps at least one training sample. Both
/// partitions keep ledger order.
pub fn split_samples(
    samples: &[TrainingSample],
    validation_split: f64,
) -> (Vec<TrainingSample>, Vec<TrainingSample>) {
    let n_validation = (samples.len() as f64 * validation_split).floor() as usize;

    let mut ranked: Vec<(Vec<u8>, usize)> = samples
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let mut hasher = Sha256::new();
            hasher.update(format!("{}|{}|{}|{}", i, s.description, s.category, s.subcategory));
            (hasher.finalize().to_vec(), i)
        })
        .collect();
    ranked.sort();

    let mut in_training: HashMap<(&str, &str), usize> = HashMap::new();
    for s in samples {
        *in_training
            .entry((s.category.as_str(), s.subcategory.as_str()))
            .or_insert(0) += 1;
    }

    let mut is_validation = vec![false; samples.len()];
    let mut held_out = 0;
    for (_, i) in &ranked {
        if held_out == n_validation {
            break;
        }
        let s = &samples[*i];
        let remaining = in_training
            .entry((s.category.as_str(), s.subcategory.as_str()))
            .or_insert(0);
        if *remaining > 1 {
            *remaining -= 1;
            is_validation[*i] = true;
            held_out += 1;
        }
    }

    let mut train = Vec::with_capacity(samples.len() - held_out);
    let mut validation = Vec::with_capacity(held_out);
    for (sample, validate) in samples.iter().zip(is_validation) {
        if validate {
            validation.push(sample.clone());
        } else {
            train.push(sample.clone());
        }
    }
    (train, validation)
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct RetrainingPipeline {
    classifier: Arc<LearnedClassifier>,
    trigger_threshold: u32,
    minimum_training_samples: usize,
    validation_split: f64,
    state: Mutex<PipelineState>,
}

impl RetrainingPipeline {
    pub fn new(
        classifier: Arc<LearnedClassifier>,
        trigger_threshold: u32,
        minimum_training_samples: usize,
        validation_split: f64,
    ) -> Self {
        RetrainingPipeline {
            classifier,
            trigger_threshold,
            minimum_training_samples,
            validation_split,
            state: Mutex::new(PipelineState::Idle),
        }
    }

    /// Counter reached the trigger, or a manual retrain was requested
    pub fn should_retrain(&self, override_count: u32, manually_requested: bool) -> bool {
        manually_requested || override_count >= self.trigger_threshold
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock()
    }

    /// Run one full attempt. Never fails: problems come back as success=false.
    pub fn run(&self, store: &Store) -> RetrainResult {
        let timestamp = Utc::now();
        info!("starting retraining pipeline");

        // Step 1-2: load and validate
        self.transition(PipelineState::Validating);
        let samples = match store.load_samples() {
            Ok(s) => s,
            Err(e) => {
                return self.fail(store, timestamp, 0, format!("Failed to load training data: {}", e))
            }
        };

        if samples.len() < self.minimum_training_samples {
            return self.fail(
                store,
                timestamp,
                samples.len(),
                format!(
                    "Insufficient training data: {} samples (need at least {})",
                    samples.len(),
                    self.minimum_training_samples
                ),
            );
        }

        // Step 3-4: split and fit a new instance
        self.transition(PipelineState::Training);
        let (train, validation) = split_samples(&samples, self.validation_split);
        let version = self.classifier.next_version();
        let model = match NaiveBayesModel::fit(&train, version) {
            Ok(m) => m,
            Err(e) => {
                return self.fail(store, timestamp, samples.len(), format!("Training failed: {}", e))
            }
        };

        // Step 5: evaluate on the held-out partition
        self.transition(PipelineState::Evaluating);
        let evaluation_set = if validation.is_empty() { &train } else { &validation };
        let accuracy = model.accuracy(evaluation_set);
        debug!(
            train = train.len(),
            validation = validation.len(),
            accuracy,
            "model evaluated"
        );

        // Step 6: activate
        let model = model.with_accuracy(accuracy);
        let snapshot = model.to_json();
        let trained_at = model.info().trained_at;
        self.classifier.swap(model);

        match snapshot {
            Ok(json) => {
                if let Err(e) = store.save_model_snapshot(version, trained_at, &json) {
                    warn!(error = %e, "failed to persist model snapshot");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize model snapshot"),
        }

        // Step 7: audit
        self.transition(PipelineState::Auditing);
        let result = RetrainResult {
            success: true,
            timestamp,
            model_type: MODEL_TYPE.to_string(),
            samples_used: samples.len(),
            accuracy,
            message: format!(
                "Successfully retrained model v{} with {} samples ({} held out)",
                version,
                samples.len(),
                validation.len()
            ),
            model_version: Some(version),
        };
        self.audit(store, &result);

        self.transition(PipelineState::Idle);
        info!(version, accuracy, "retraining complete");
        result
    }

    pub fn stats(&self, store: &Store) -> PipelineStats {
        let last_retrain = store.last_audit().unwrap_or_else(|e| {
            debug!(error = %e, "could not load last audit record");
            None
        });

        PipelineStats {
            trigger_threshold: self.trigger_threshold,
            model_type: MODEL_TYPE.to_string(),
            validation_split: self.validation_split,
            minimum_training_samples: self.minimum_training_samples,
            state: self.state(),
            last_retrain,
        }
    }

    fn fail(
        &self,
        store: &Store,
        timestamp: DateTime<Utc>,
        samples_used: usize,
        message: String,
    ) -> RetrainResult {
        self.transition(PipelineState::Failed);
        warn!(%message, "retraining failed");

        let result = RetrainResult {
            success: false,
            timestamp,
            model_type: MODEL_TYPE.to_string(),
            samples_used,
            accuracy: 0.0,
            message,
            model_version: None,
        };
        self.audit(store, &result);

        self.transition(PipelineState::Idle);
        result
    }

    fn audit(&self, store: &Store, result: &RetrainResult) {
        if let Err(e) = store.append_audit(&result.audit_record()) {
            error!(error = %e, "failed to write retraining audit record");
        }
    }

    fn transition(&self, next: PipelineState) {
        let mut state = self.state.lock();
        debug!(from = ?*state, to = ?next, "pipeline state");
        *state = next;
    }
}

// ============================================================================
// TESTS
// ============================================================================
