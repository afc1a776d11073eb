// 🧭 Semantic Matcher - Sentence embeddings vs. ground-truth examples
//
// Every example phrase is embedded once, at construction, in one batch. A
// query is embedded and compared by cosine similarity against the whole
// cache; the best example wins only if it clears the threshold.
//
// Availability is decided once: a missing backend or a failed batch encode
// leaves the matcher permanently unavailable and the engine skips it.

use crate::config::SemanticExampleGroup;
use crate::error::{CategorizerError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

// ============================================================================
// EMBEDDING BACKEND
// ============================================================================

/// Sentence embedding model
pub trait EmbeddingBackend: Send + Sync {
    fn model_name(&self) -> &str;

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])?
            .into_iter()
            .next()
            .ok_or_else(|| CategorizerError::Embedding("backend returned no embedding".to_string()))
    }
}

#[cfg(feature = "embeddings")]
pub use fast::FastEmbedBackend;

#[cfg(feature = "embeddings")]
mod fast {
    use super::EmbeddingBackend;
    use crate::error::{CategorizerError, Result};
    use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
    use parking_lot::Mutex;

    /// ONNX sentence-transformer via fastembed
    pub struct FastEmbedBackend {
        model: Mutex<TextEmbedding>,
        name: String,
    }

    impl FastEmbedBackend {
        pub fn load(model_name: &str) -> Result<Self> {
            let model_id = match model_name {
                "all-MiniLM-L6-v2" => EmbeddingModel::AllMiniLML6V2,
                "all-MiniLM-L12-v2" => EmbeddingModel::AllMiniLML12V2,
                "paraphrase-multilingual-MiniLM-L12-v2" => EmbeddingModel::ParaphraseMLMiniLML12V2,
                "bge-small-en-v1.5" => EmbeddingModel::BGESmallENV15,
                other => {
                    return Err(CategorizerError::Embedding(format!(
                        "unsupported embedding model: {}",
                        other
                    )))
                }
            };

            let model = TextEmbedding::try_new(InitOptions::new(model_id))
                .map_err(|e| CategorizerError::Embedding(e.to_string()))?;

            Ok(FastEmbedBackend {
                model: Mutex::new(model),
                name: model_name.to_string(),
            })
        }
    }

    impl EmbeddingBackend for FastEmbedBackend {
        fn model_name(&self) -> &str {
            &self.name
        }

        fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let mut model = self.model.lock();
            model
                .embed(texts.to_vec(), None)
                .map_err(|e| CategorizerError::Embedding(e.to_string()))
        }
    }
}

/// Load the configured sentence-embedding model, or None when it cannot be used
pub fn load_default_backend(model_name: &str) -> Option<Arc<dyn EmbeddingBackend>> {
    #[cfg(feature = "embeddings")]
    {
        match FastEmbedBackend::load(model_name) {
            Ok(backend) => {
                info!(model = model_name, "embedding backend loaded");
                Some(Arc::new(backend))
            }
            Err(e) => {
                warn!(model = model_name, error = %e, "embedding backend unavailable");
                None
            }
        }
    }

    #[cfg(not(feature = "embeddings"))]
    {
        info!(
            model = model_name,
            "built without the `embeddings` feature; semantic matching disabled"
        );
        None
    }
}

// ============================================================================
// MATCH RESULT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticMatch {
    pub category: String,
    pub subcategory: String,
    pub similarity_score: f64,
    pub best_example: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticStats {
    pub model_available: bool,
    pub model_name: Option<String>,
    pub examples_cached: usize,
    pub similarity_threshold: f64,
}

// ============================================================================
// SEMANTIC MATCHER
// ============================================================================

struct CachedExample {
    category: String,
    subcategory: String,
    phrase: String,
    /// L2-normalised
    embedding: Vec<f32>,
}

pub struct SemanticMatcher {
    backend: Option<Arc<dyn EmbeddingBackend>>,
    examples: Vec<CachedExample>,
    threshold: f64,
}

impl SemanticMatcher {
    /// Embed every example phrase up front. Blocks until the cache is built.
    pub fn new(
        groups: &[SemanticExampleGroup],
        backend: Option<Arc<dyn EmbeddingBackend>>,
        threshold: f64,
    ) -> Self {
        let backend = match backend {
            Some(b) => b,
            None => {
                debug!("no embedding backend; semantic matching unavailable");
                return SemanticMatcher::unavailable(threshold);
            }
        };

        let mut labels = Vec::new();
        let mut phrases = Vec::new();
        for group in groups {
            for phrase in group.examples.iter().filter(|p| !p.trim().is_empty()) {
                labels.push((group.category.clone(), group.subcategory.clone()));
                phrases.push(phrase.clone());
            }
        }

        if phrases.is_empty() {
            warn!("no semantic examples configured; semantic matching unavailable");
            return SemanticMatcher::unavailable(threshold);
        }

        let embeddings = match backend.embed_batch(&phrases) {
            Ok(e) if e.len() == phrases.len() => e,
            Ok(e) => {
                warn!(
                    expected = phrases.len(),
                    got = e.len(),
                    "embedding count mismatch; semantic matching unavailable"
                );
                return SemanticMatcher::unavailable(threshold);
            }
            Err(e) => {
                warn!(error = %e, "failed to embed examples; semantic matching unavailable");
                return SemanticMatcher::unavailable(threshold);
            }
        };

        let examples: Vec<CachedExample> = labels
            .into_iter()
            .zip(phrases)
            .zip(embeddings)
            .map(|((label, phrase), embedding)| CachedExample {
                category: label.0,
                subcategory: label.1,
                phrase,
                embedding: normalize(embedding),
            })
            .collect();

        info!(
            examples = examples.len(),
            model = backend.model_name(),
            "semantic example embeddings cached"
        );

        SemanticMatcher {
            backend: Some(backend),
            examples,
            threshold,
        }
    }

    pub fn unavailable(threshold: f64) -> Self {
        SemanticMatcher {
            backend: None,
            examples: Vec::new(),
            threshold,
        }
    }

    pub fn is_available(&self) -> bool {
        self.backend.is_some() && !self.examples.is_empty()
    }

    /// Closest example at or above the threshold; ties keep the first inserted
    pub fn match_text(&self, text: &str) -> Option<SemanticMatch> {
        let backend = self.backend.as_ref()?;
        if self.examples.is_empty() || text.trim().is_empty() {
            return None;
        }

        let query = match backend.embed(text) {
            Ok(v) => normalize(v),
            Err(e) => {
                warn!(error = %e, "query embedding failed");
                return None;
            }
        };

        let mut best: Option<(&CachedExample, f64)> = None;
        for example in &self.examples {
            let score = dot(&query, &example.embedding);
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((example, score));
            }
        }

        let (example, score) = best?;
        if score < self.threshold {
            return None;
        }

        debug!(
            category = %example.category,
            subcategory = %example.subcategory,
            score,
            "semantic match"
        );

        Some(SemanticMatch {
            category: example.category.clone(),
            subcategory: example.subcategory.clone(),
            similarity_score: score,
            best_example: example.phrase.clone(),
        })
    }

    pub fn example_count(&self) -> usize {
        self.examples.len()
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn stats(&self) -> SemanticStats {
        SemanticStats {
            model_available: self.is_available(),
            model_name: self.backend.as_ref().map(|b| b.model_name().to_string()),
            examples_cached: self.examples.len(),
            similarity_threshold: self.threshold,
        }
    }
}

fn normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-10 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Deterministic bag-of-words embedder: one dimension per hashed token
    pub(crate) struct HashingEmbedder;

    impl HashingEmbedder {
        const DIM: usize = 256;

        fn bucket(token: &str) -> usize {
            let mut h: u64 = 1469598103934665603;
            for b in token.bytes() {
                h ^= b as u64;
                h = h.wrapping_mul(1099511628211);
            }
            (h % Self::DIM as u64) as usize
        }
    }

    impl EmbeddingBackend for HashingEmbedder {
        fn model_name(&self) -> &str {
            "hashing-test"
        }

        fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0f32; Self::DIM];
                    for token in t.to_lowercase().split_whitespace() {
                        v[Self::bucket(token)] += 1.0;
                    }
                    v
                })
                .collect())
        }
    }

    struct FailingEmbedder;

    impl EmbeddingBackend for FailingEmbedder {
        fn model_name(&self) -> &str {
            "failing"
        }

        fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Err(CategorizerError::Embedding("model files missing".to_string()))
        }
    }

    fn groups() -> Vec<SemanticExampleGroup> {
        vec![
            SemanticExampleGroup {
                category: "Transport".to_string(),
                subcategory: "Fuel".to_string(),
                examples: vec!["bensin på macken".to_string(), "diesel tankning".to_string()],
            },
            SemanticExampleGroup {
                category: "Food".to_string(),
                subcategory: "Groceries".to_string(),
                examples: vec!["matbutik veckohandling".to_string()],
            },
        ]
    }

    #[test]
    fn test_exact_example_matches() {
        let matcher = SemanticMatcher::new(&groups(), Some(Arc::new(HashingEmbedder)), 0.75);
        assert!(matcher.is_available());
        assert_eq!(matcher.example_count(), 3);

        let m = matcher.match_text("diesel tankning").unwrap();
        assert_eq!(m.category, "Transport");
        assert_eq!(m.subcategory, "Fuel");
        assert_eq!(m.best_example, "diesel tankning");
        assert!((m.similarity_score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_below_threshold_returns_none() {
        let matcher = SemanticMatcher::new(&groups(), Some(Arc::new(HashingEmbedder)), 0.75);

        // Shares one of three tokens with the closest example
        assert!(matcher.match_text("bensin xyz qqq").is_none());
        assert!(matcher.match_text("completely unrelated words").is_none());
    }

    #[test]
    fn test_never_returns_score_below_threshold() {
        let matcher = SemanticMatcher::new(&groups(), Some(Arc::new(HashingEmbedder)), 0.5);

        for text in ["bensin", "diesel på macken", "veckohandling", "hello"] {
            if let Some(m) = matcher.match_text(text) {
                assert!(m.similarity_score >= 0.5, "{} scored {}", text, m.similarity_score);
            }
        }
    }

    #[test]
    fn test_tie_keeps_first_inserted_example() {
        let groups = vec![
            SemanticExampleGroup {
                category: "A".to_string(),
                subcategory: "One".to_string(),
                examples: vec!["same phrase".to_string()],
            },
            SemanticExampleGroup {
                category: "B".to_string(),
                subcategory: "Two".to_string(),
                examples: vec!["same phrase".to_string()],
            },
        ];
        let matcher = SemanticMatcher::new(&groups, Some(Arc::new(HashingEmbedder)), 0.75);

        let m = matcher.match_text("same phrase").unwrap();
        assert_eq!(m.category, "A");
    }

    #[test]
    fn test_missing_backend_is_unavailable() {
        let matcher = SemanticMatcher::new(&groups(), None, 0.75);

        assert!(!matcher.is_available());
        assert!(matcher.match_text("diesel tankning").is_none());
        assert_eq!(matcher.stats().model_name, None);
    }

    #[test]
    fn test_failing_backend_is_unavailable() {
        let matcher = SemanticMatcher::new(&groups(), Some(Arc::new(FailingEmbedder)), 0.75);

        assert!(!matcher.is_available());
        assert_eq!(matcher.example_count(), 0);
    }

    #[test]
    fn test_no_examples_is_unavailable() {
        let matcher = SemanticMatcher::new(&[], Some(Arc::new(HashingEmbedder)), 0.75);
        assert!(!matcher.is_available());
    }

    #[test]
    fn test_empty_query_returns_none() {
        let matcher = SemanticMatcher::new(&groups(), Some(Arc::new(HashingEmbedder)), 0.0);
        assert!(matcher.match_text("  ").is_none());
    }
}
