// 🤖 Learned Classifier - TF-IDF + Multinomial Naive Bayes
//
// Trained on corrected samples over the joint (category, subcategory) label.
// A fitted model is immutable; retraining builds a new one and swaps the
// shared reference, so readers always see a whole model.

use crate::error::{CategorizerError, Result};
use crate::store::TrainingSample;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

pub const MODEL_TYPE: &str = "tfidf_multinomial_nb";

/// Cap on vocabulary size, most frequent terms kept
pub const MAX_FEATURES: usize = 500;

/// Additive smoothing for the naive Bayes likelihoods
pub const SMOOTHING_ALPHA: f64 = 0.1;

const DEBIT_TOKEN: &str = "__debit";
const CREDIT_TOKEN: &str = "__credit";

// ============================================================================
// LABEL / PREDICTION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Label {
    pub category: String,
    pub subcategory: String,
}

impl Label {
    pub fn new(category: impl Into<String>, subcategory: impl Into<String>) -> Self {
        Label {
            category: category.into(),
            subcategory: subcategory.into(),
        }
    }

    fn of(sample: &TrainingSample) -> Self {
        Label::new(sample.category.clone(), sample.subcategory.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub category: String,
    pub subcategory: String,

    /// Posterior probability of the predicted label
    pub confidence: f64,
}

/// Outcome of LearnedClassifier::train
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub accuracy: f64,
    pub model_version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model_type: String,
    pub version: u64,
    pub trained_at: DateTime<Utc>,
    pub samples_used: usize,
    pub labels: usize,
    pub vocabulary_size: usize,

    /// Accuracy from the last evaluation, None until evaluated
    pub accuracy: Option<f64>,
}

// ============================================================================
// FEATURES
// ============================================================================

/// Text the model sees: description, merchant and a direction token
pub fn feature_text(description: &str, merchant: Option<&str>, amount: Option<f64>) -> String {
    let mut text = description.trim().to_string();
    if let Some(m) = merchant.filter(|m| !m.trim().is_empty()) {
        text.push(' ');
        text.push_str(m.trim());
    }
    match amount {
        Some(a) if a < 0.0 => {
            text.push(' ');
            text.push_str(DEBIT_TOKEN);
        }
        Some(a) if a > 0.0 => {
            text.push(' ');
            text.push_str(CREDIT_TOKEN);
        }
        _ => {}
    }
    text
}

fn sample_text(sample: &TrainingSample) -> String {
    feature_text(&sample.description, sample.merchant.as_deref(), sample.amount)
}

/// Lowercased word tokens of two or more characters, plus adjacent bigrams
fn analyze(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| w.chars().count() >= 2)
        .collect();

    let mut terms: Vec<String> = words.iter().map(|w| w.to_string()).collect();
    terms.extend(words.windows(2).map(|pair| format!("{} {}", pair[0], pair[1])));
    terms
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TfidfVectorizer {
    vocabulary: HashMap<String, usize>,
    idf: Vec<f64>,
    max_features: usize,
}

impl TfidfVectorizer {
    pub fn new(max_features: usize) -> Self {
        TfidfVectorizer {
            vocabulary: HashMap::new(),
            idf: Vec::new(),
            max_features,
        }
    }

    /// Build the vocabulary (most frequent terms, ties alphabetical) and smooth idf
    pub fn fit(&mut self, documents: &[String]) {
        let mut term_freq: BTreeMap<String, usize> = BTreeMap::new();
        let mut doc_freq: HashMap<String, usize> = HashMap::new();

        for doc in documents {
            let terms = analyze(doc);
            let unique: HashSet<&String> = terms.iter().collect();
            for term in unique {
                *doc_freq.entry(term.clone()).or_insert(0) += 1;
            }
            for term in terms {
                *term_freq.entry(term).or_insert(0) += 1;
            }
        }

        let mut ranked: Vec<(String, usize)> = term_freq.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(self.max_features);

        let mut kept: Vec<String> = ranked.into_iter().map(|(t, _)| t).collect();
        kept.sort();

        let n_docs = documents.len() as f64;
        self.vocabulary = kept
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i))
            .collect();
        self.idf = kept
            .iter()
            .map(|t| {
                let df = *doc_freq.get(t).unwrap_or(&0) as f64;
                ((1.0 + n_docs) / (1.0 + df)).ln() + 1.0
            })
            .collect();
    }

    /// Sparse L2-normalised tf-idf vector; empty when no term is known
    pub fn transform(&self, text: &str) -> Vec<(usize, f64)> {
        let mut counts: BTreeMap<usize, f64> = BTreeMap::new();
        for term in analyze(text) {
            if let Some(&idx) = self.vocabulary.get(&term) {
                *counts.entry(idx).or_insert(0.0) += 1.0;
            }
        }

        let mut vector: Vec<(usize, f64)> = counts
            .into_iter()
            .map(|(idx, tf)| (idx, tf * self.idf[idx]))
            .collect();

        let norm = vector.iter().map(|(_, v)| v * v).sum::<f64>().sqrt();
        if norm > 0.0 {
            for (_, v) in &mut vector {
                *v /= norm;
            }
        }
        vector
    }

    /// True when at least one term of `text` is in the vocabulary
    pub fn knows_any(&self, text: &str) -> bool {
        analyze(text)
            .iter()
            .any(|term| self.vocabulary.contains_key(term))
    }

    pub fn vocabulary_size(&self) -> usize {
        self.vocabulary.len()
    }
}

// ============================================================================
// NAIVE BAYES MODEL
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NaiveBayesModel {
    vectorizer: TfidfVectorizer,
    labels: Vec<Label>,
    class_log_prior: Vec<f64>,
    feature_log_prob: Vec<Vec<f64>>,
    info: ModelInfo,
}

impl NaiveBayesModel {
    /// Fit a fresh model; needs at least two distinct labels
    pub fn fit(samples: &[TrainingSample], version: u64) -> Result<Self> {
        let labels: Vec<Label> = samples
            .iter()
            .map(Label::of)
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();

        if labels.len() < 2 {
            return Err(CategorizerError::Training(format!(
                "need at least 2 distinct labels, got {}",
                labels.len()
            )));
        }

        let documents: Vec<String> = samples.iter().map(sample_text).collect();
        let mut vectorizer = TfidfVectorizer::new(MAX_FEATURES);
        vectorizer.fit(&documents);

        let n_features = vectorizer.vocabulary_size();
        if n_features == 0 {
            return Err(CategorizerError::Training(
                "training descriptions produced no features".to_string(),
            ));
        }

        let label_index: HashMap<&Label, usize> =
            labels.iter().enumerate().map(|(i, l)| (l, i)).collect();

        let mut class_count = vec![0usize; labels.len()];
        let mut feature_count = vec![vec![0.0f64; n_features]; labels.len()];

        for (sample, doc) in samples.iter().zip(&documents) {
            let c = label_index[&Label::of(sample)];
            class_count[c] += 1;
            for (j, v) in vectorizer.transform(doc) {
                feature_count[c][j] += v;
            }
        }

        let n_samples = samples.len() as f64;
        let class_log_prior = class_count
            .iter()
            .map(|&n| (n as f64 / n_samples).ln())
            .collect();

        let feature_log_prob = feature_count
            .iter()
            .map(|counts| {
                let total: f64 = counts.iter().sum::<f64>() + SMOOTHING_ALPHA * n_features as f64;
                counts
                    .iter()
                    .map(|c| ((c + SMOOTHING_ALPHA) / total).ln())
                    .collect()
            })
            .collect();

        let info = ModelInfo {
            model_type: MODEL_TYPE.to_string(),
            version,
            trained_at: Utc::now(),
            samples_used: samples.len(),
            labels: labels.len(),
            vocabulary_size: n_features,
            accuracy: None,
        };

        debug!(
            samples = samples.len(),
            labels = labels.len(),
            features = n_features,
            "naive bayes model fitted"
        );

        Ok(NaiveBayesModel {
            vectorizer,
            labels,
            class_log_prior,
            feature_log_prob,
            info,
        })
    }

    /// Most probable label; None when description and merchant carry no
    /// known term. The direction token alone never produces a prediction.
    pub fn predict(
        &self,
        description: &str,
        amount: Option<f64>,
        merchant: Option<&str>,
    ) -> Option<Prediction> {
        if !self
            .vectorizer
            .knows_any(&feature_text(description, merchant, None))
        {
            return None;
        }
        let x = self
            .vectorizer
            .transform(&feature_text(description, merchant, amount));

        let joint: Vec<f64> = self
            .class_log_prior
            .iter()
            .zip(&self.feature_log_prob)
            .map(|(prior, flp)| prior + x.iter().map(|(j, v)| v * flp[*j]).sum::<f64>())
            .collect();

        let max = joint.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let exp: Vec<f64> = joint.iter().map(|j| (j - max).exp()).collect();
        let total: f64 = exp.iter().sum();

        let mut best = 0;
        for (i, p) in exp.iter().enumerate() {
            if *p > exp[best] {
                best = i;
            }
        }

        let label = &self.labels[best];
        Some(Prediction {
            category: label.category.clone(),
            subcategory: label.subcategory.clone(),
            confidence: exp[best] / total,
        })
    }

    /// Share of samples whose label is predicted exactly
    pub fn accuracy(&self, samples: &[TrainingSample]) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        let correct = samples
            .iter()
            .filter(|s| {
                self.predict(&s.description, s.amount, s.merchant.as_deref())
                    .map_or(false, |p| p.category == s.category && p.subcategory == s.subcategory)
            })
            .count();
        correct as f64 / samples.len() as f64
    }

    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.info.accuracy = Some(accuracy);
        self
    }

    pub fn info(&self) -> &ModelInfo {
        &self.info
    }

    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

// ============================================================================
// LEARNED CLASSIFIER
// ============================================================================

/// Shared handle to the active model
pub struct LearnedClassifier {
    active: RwLock<Option<Arc<NaiveBayesModel>>>,
    minimum_training_samples: usize,
}

impl LearnedClassifier {
    pub fn new(minimum_training_samples: usize) -> Self {
        LearnedClassifier {
            active: RwLock::new(None),
            minimum_training_samples,
        }
    }

    /// Current model reference; the lock is held only for the clone
    pub fn snapshot(&self) -> Option<Arc<NaiveBayesModel>> {
        self.active.read().clone()
    }

    pub fn is_trained(&self) -> bool {
        self.active.read().is_some()
    }

    pub fn predict(
        &self,
        description: &str,
        amount: Option<f64>,
        merchant: Option<&str>,
    ) -> Option<Prediction> {
        self.snapshot()?.predict(description, amount, merchant)
    }

    pub fn predict_batch(&self, descriptions: &[&str]) -> Vec<Option<Prediction>> {
        match self.snapshot() {
            Some(model) => descriptions
                .iter()
                .map(|d| model.predict(d, None, None))
                .collect(),
            None => vec![None; descriptions.len()],
        }
    }

    /// Fit on every sample and swap the result in. Below the minimum sample
    /// count nothing changes and the prior model stays active.
    pub fn train(&self, samples: &[TrainingSample]) -> Result<TrainingReport> {
        if samples.len() < self.minimum_training_samples {
            return Err(CategorizerError::InsufficientData {
                have: samples.len(),
                need: self.minimum_training_samples,
            });
        }

        let version = self.next_version();
        let model = NaiveBayesModel::fit(samples, version)?;
        let accuracy = model.accuracy(samples);
        self.swap(model.with_accuracy(accuracy));

        Ok(TrainingReport {
            accuracy,
            model_version: version,
        })
    }

    /// Replace the active model in a single reference assignment
    pub fn swap(&self, model: NaiveBayesModel) -> Option<Arc<NaiveBayesModel>> {
        let model = Arc::new(model);
        info!(
            version = model.info().version,
            samples = model.info().samples_used,
            "activating classifier"
        );
        self.active.write().replace(model)
    }

    pub fn next_version(&self) -> u64 {
        self.snapshot().map_or(1, |m| m.info().version + 1)
    }

    pub fn info(&self) -> Option<ModelInfo> {
        self.snapshot().map(|m| m.info().clone())
    }

    pub fn minimum_training_samples(&self) -> usize {
        self.minimum_training_samples
    }
}

// ============================================================================
// TESTS
// ============================================================================
