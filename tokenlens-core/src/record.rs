//! Result records shared with report writers and renderers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::CacheStats;

/// Which attribution algorithm produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributionMethod {
    Cosine,
    Shapley,
}

impl std::fmt::Display for AttributionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttributionMethod::Cosine => write!(f, "cosine"),
            AttributionMethod::Shapley => write!(f, "shapley"),
        }
    }
}

impl std::str::FromStr for AttributionMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cosine" => Ok(AttributionMethod::Cosine),
            "shapley" | "shap" => Ok(AttributionMethod::Shapley),
            other => Err(format!("unknown attribution method '{other}'")),
        }
    }
}

/// Importance of one token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenAttribution {
    pub token: String,
    /// Min-max normalized across the run.
    pub importance: f64,
    /// Index into the original full encode of the prompt.
    pub position: usize,
}

/// Outcome of one successful attribution run. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub run_id: Uuid,
    pub method: AttributionMethod,
    pub prompt: String,
    /// Sorted by importance, descending; ties keep position order.
    pub tokens: Vec<TokenAttribution>,
    pub timestamp: DateTime<Utc>,
    /// Completion model identifier.
    pub model: String,
    /// Tokenizer encoding name.
    pub encoding: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
    /// Completion for the empty prompt (Shapley).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_output: Option<String>,
    /// Completion for the unmodified prompt (Shapley).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_output: Option<String>,
    /// Positions whose perturbation failed and were left unscored (cosine).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped_positions: Vec<usize>,
    /// Sampled coalitions evaluated (Shapley).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coalitions_evaluated: Option<usize>,
    /// Cache activity attributable to this run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheStats>,
}

impl ResultRecord {
    /// The `n` most important tokens.
    pub fn top_tokens(&self, n: usize) -> &[TokenAttribution] {
        &self.tokens[..n.min(self.tokens.len())]
    }

    /// Attribution for an original prompt position, if it was scored.
    pub fn token_at(&self, position: usize) -> Option<&TokenAttribution> {
        self.tokens.iter().find(|t| t.position == position)
    }

    /// Tokens re-ordered by position, for left-to-right rendering.
    pub fn in_position_order(&self) -> Vec<&TokenAttribution> {
        let mut tokens: Vec<&TokenAttribution> = self.tokens.iter().collect();
        tokens.sort_by_key(|t| t.position);
        tokens
    }
}
