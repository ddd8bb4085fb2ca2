//! Token attribution algorithms.
//!
//! Both attributors follow the same outline: tokenize, query the model for
//! perturbed variants of the prompt, turn the responses into raw per-token
//! scores, then min-max normalize and rank them.

pub mod cosine;
pub mod divergence;
pub mod sampling;
pub mod shapley;

pub use cosine::CosineAttributor;
pub use divergence::{DivergenceMetric, LengthDivergence};
pub use sampling::{CoalitionBuilder, CoalitionDraw, SamplingPlan};
pub use shapley::ShapleyAttributor;

use async_trait::async_trait;

use crate::error::{AttributionError, Result};
use crate::progress::{RunProgress, RunStage};
use crate::record::{AttributionMethod, ResultRecord, TokenAttribution};
use crate::tokenizer::{Token, TokenizerAdapter};

/// A runnable attribution method.
#[async_trait]
pub trait Attributor: Send + Sync {
    fn method(&self) -> AttributionMethod;

    /// Score every token of `prompt`. Progress goes to `progress`; the
    /// returned record carries `progress.run_id()`.
    async fn attribute(&self, prompt: &str, progress: &RunProgress) -> Result<ResultRecord>;
}

/// Tokenize a prompt for attribution, optionally truncating to `max_tokens`.
///
/// Fails with [`AttributionError::EmptyPrompt`] before any model call when
/// the prompt is blank or encodes to nothing.
pub(crate) fn prepare_tokens(
    tokenizer: &TokenizerAdapter,
    prompt: &str,
    max_tokens: Option<usize>,
    progress: &RunProgress,
) -> Result<Vec<Token>> {
    if prompt.trim().is_empty() {
        return Err(AttributionError::EmptyPrompt.into());
    }
    progress.stage(RunStage::Tokenizing, 0.0, "Tokenizing prompt...");

    let mut tokens = tokenizer.tokenize(prompt)?;
    if tokens.is_empty() {
        return Err(AttributionError::EmptyPrompt.into());
    }
    if let Some(limit) = max_tokens
        && tokens.len() > limit
    {
        tracing::debug!(total = tokens.len(), limit, "Truncating prompt tokens");
        tokens.truncate(limit);
    }
    Ok(tokens)
}

/// Rescale scores into [0, 1] in place.
///
/// When every score is equal the values are left untouched, so a single
/// scored token keeps its raw value.
pub fn normalize_min_max(scores: &mut [f64]) {
    let Some(min) = scores.iter().copied().reduce(f64::min) else {
        return;
    };
    let max = scores.iter().copied().fold(min, f64::max);
    if max > min {
        let range = max - min;
        for score in scores.iter_mut() {
            *score = (*score - min) / range;
        }
    }
}

/// Normalize importances and sort descending. The sort is stable, so ties
/// keep the order in which tokens were supplied.
pub fn rank(mut attributions: Vec<TokenAttribution>) -> Vec<TokenAttribution> {
    let mut scores: Vec<f64> = attributions.iter().map(|a| a.importance).collect();
    normalize_min_max(&mut scores);
    for (attribution, score) in attributions.iter_mut().zip(scores) {
        attribution.importance = score;
    }
    attributions.sort_by(|a, b| {
        b.importance
            .partial_cmp(&a.importance)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    attributions
}

/// True when `text` matches one of `stoplist` exactly.
pub(crate) fn in_stoplist(text: &str, stoplist: &[String]) -> bool {
    stoplist.iter().any(|s| s == text)
}
