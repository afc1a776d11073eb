// 🏷️ Keyword Rules - Rules as Data
// Case-insensitive substring lookup; the first keyword hit in configuration
// order wins. No scoring, no overlap resolution.

use crate::config::KeywordRule;
use serde::{Deserialize, Serialize};

// ============================================================================
// RULE MATCH
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleMatch {
    pub category: String,
    pub subcategory: String,

    /// Keyword that fired, as configured
    pub keyword: String,
}

// ============================================================================
// RULE MATCHER
// ============================================================================

#[derive(Debug, Clone)]
struct CompiledKeyword {
    category: String,
    subcategory: String,
    keyword: String,
    needle: String,
}

#[derive(Debug, Clone, Default)]
pub struct RuleMatcher {
    keywords: Vec<CompiledKeyword>,
    rule_count: usize,
}

impl RuleMatcher {
    pub fn new() -> Self {
        RuleMatcher::default()
    }

    /// Flatten the rule set, keeping category → subcategory → keyword order
    pub fn from_rules(rules: &[KeywordRule]) -> Self {
        let keywords = rules
            .iter()
            .flat_map(|rule| {
                rule.keywords
                    .iter()
                    .filter(|k| !k.trim().is_empty())
                    .map(move |k| CompiledKeyword {
                        category: rule.category.clone(),
                        subcategory: rule.subcategory.clone(),
                        keyword: k.clone(),
                        needle: k.to_lowercase(),
                    })
            })
            .collect();

        RuleMatcher {
            keywords,
            rule_count: rules.len(),
        }
    }

    /// First keyword contained in `text`, or None
    pub fn match_text(&self, text: &str) -> Option<RuleMatch> {
        if text.trim().is_empty() {
            return None;
        }
        let haystack = text.to_lowercase();

        self.keywords
            .iter()
            .find(|k| haystack.contains(&k.needle))
            .map(|k| RuleMatch {
                category: k.category.clone(),
                subcategory: k.subcategory.clone(),
                keyword: k.keyword.clone(),
            })
    }

    /// Number of category/subcategory rules loaded
    pub fn rule_count(&self) -> usize {
        self.rule_count
    }

    pub fn keyword_count(&self) -> usize {
        self.keywords.len()
    }
}

// ============================================================================
// TESTS
// ============================================================================
