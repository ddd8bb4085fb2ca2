//! Sampled Shapley-style attribution over completion outputs.
//!
//! Significant tokens are ablated in sampled coalitions. For each coalition
//! the completion is compared to the baseline (the completion of an empty
//! message) with a [`DivergenceMetric`]; adding a missing token to the
//! coalition and measuring the change in effect yields one marginal
//! contribution for that token. A token's importance is the mean of its
//! marginals.

use async_trait::async_trait;
use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::sampling::{CoalitionBuilder, SamplingPlan, sample_coalition};
use super::{Attributor, DivergenceMetric, LengthDivergence, in_stoplist, prepare_tokens, rank};
use crate::cache::{CacheKey, CoalitionCache};
use crate::config::ShapleyConfig;
use crate::error::{AttributionError, Result};
use crate::progress::{RunProgress, RunStage};
use crate::providers::ModelClient;
use crate::record::{AttributionMethod, ResultRecord, TokenAttribution};
use crate::tokenizer::{Token, TokenizerAdapter};

pub struct ShapleyAttributor {
    client: Arc<dyn ModelClient>,
    tokenizer: Arc<TokenizerAdapter>,
    config: ShapleyConfig,
    outputs: Arc<CoalitionCache<String>>,
    divergence: Arc<dyn DivergenceMetric>,
}

/// Per-run state shared by every coalition query.
struct RunContext<'a> {
    builder: CoalitionBuilder,
    significant_count: usize,
    full_text: &'a str,
}

impl ShapleyAttributor {
    pub fn new(
        client: Arc<dyn ModelClient>,
        tokenizer: Arc<TokenizerAdapter>,
        config: ShapleyConfig,
    ) -> Self {
        Self::with_cache(client, tokenizer, config, Arc::new(CoalitionCache::new()))
    }

    /// Share a completion cache (and so the baseline) with other runs.
    pub fn with_cache(
        client: Arc<dyn ModelClient>,
        tokenizer: Arc<TokenizerAdapter>,
        config: ShapleyConfig,
        outputs: Arc<CoalitionCache<String>>,
    ) -> Self {
        Self {
            client,
            tokenizer,
            config,
            outputs,
            divergence: Arc::new(LengthDivergence),
        }
    }

    /// Swap the output-divergence metric.
    pub fn with_divergence(mut self, divergence: Arc<dyn DivergenceMetric>) -> Self {
        self.divergence = divergence;
        self
    }

    /// Positions eligible for ablation, in position order.
    pub fn significant_positions(&self, tokens: &[Token]) -> Vec<usize> {
        let mut significant: Vec<usize> = tokens
            .iter()
            .filter(|t| {
                let normalized = t.text.trim().to_lowercase();
                !normalized.is_empty() && !in_stoplist(&normalized, &self.config.stopwords)
            })
            .map(|t| t.position)
            .collect();
        if let Some(limit) = self.config.max_significant_tokens {
            significant.truncate(limit);
        }
        significant
    }

    async fn complete_cached(&self, key: CacheKey, text: &str) -> Result<String> {
        Ok(self
            .outputs
            .get_or_compute(key, || self.client.complete(text))
            .await?)
    }

    /// Completion for a coalition. The full coalition reuses the full-prompt entry.
    async fn coalition_output(&self, ctx: &RunContext<'_>, members: &[usize]) -> Result<String> {
        if members.len() >= ctx.significant_count {
            return self
                .complete_cached(CacheKey::full_prompt(ctx.full_text), ctx.full_text)
                .await;
        }
        let text = ctx.builder.text(&self.tokenizer, members)?;
        self.complete_cached(ctx.builder.key(members), &text).await
    }
}

#[async_trait]
impl Attributor for ShapleyAttributor {
    fn method(&self) -> AttributionMethod {
        AttributionMethod::Shapley
    }

    async fn attribute(&self, prompt: &str, progress: &RunProgress) -> Result<ResultRecord> {
        let tokens = prepare_tokens(&self.tokenizer, prompt, self.config.max_tokens, progress)?;
        let significant = self.significant_positions(&tokens);
        if significant.is_empty() {
            return Err(AttributionError::NoSignificantTokens.into());
        }
        let n = significant.len();
        debug!(
            total = tokens.len(),
            significant = n,
            divergence = self.divergence.name(),
            "Filtered significant tokens"
        );

        let ids: Vec<_> = tokens.iter().map(|t| t.id).collect();
        let full_text = self.tokenizer.decode(&ids)?;
        let cache_before = self.outputs.stats();

        progress.stage(RunStage::Baseline, 0.0, "Computing baseline output...");
        let baseline = self.complete_cached(CacheKey::Baseline, "").await?;
        let full_output = self
            .complete_cached(CacheKey::full_prompt(&full_text), &full_text)
            .await?;

        let ctx = RunContext {
            builder: CoalitionBuilder::new(prompt, &tokens, &significant),
            significant_count: n,
            full_text: &full_text,
        };
        let plan = SamplingPlan::build(n, self.config.max_samples);
        let total_samples = plan.total_samples();
        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut marginal_sums: HashMap<usize, f64> = HashMap::new();
        let mut marginal_counts: HashMap<usize, usize> = HashMap::new();
        let mut evaluated = 0;

        for draw in plan.draws() {
            for _ in 0..draw.count {
                let coalition = sample_coalition(&significant, draw.size, &mut rng);
                let output = self.coalition_output(&ctx, &coalition).await?;
                let effect = self.divergence.effect(&baseline, &output);

                if coalition.len() < n {
                    for &position in significant.iter().filter(|p| !coalition.contains(*p)) {
                        let count = marginal_counts.entry(position).or_default();
                        if *count >= self.config.max_marginal_samples {
                            continue;
                        }
                        let mut extended = coalition.clone();
                        extended.push(position);
                        let extended_output = self.coalition_output(&ctx, &extended).await?;
                        let extended_effect = self.divergence.effect(&baseline, &extended_output);

                        *count += 1;
                        *marginal_sums.entry(position).or_default() += extended_effect - effect;
                    }
                }

                evaluated += 1;
                progress.iteration(evaluated, total_samples);
            }
        }

        let attributions: Vec<TokenAttribution> = tokens
            .iter()
            .map(|token| {
                let importance = match marginal_counts.get(&token.position) {
                    Some(&count) if count > 0 => {
                        marginal_sums.get(&token.position).copied().unwrap_or(0.0) / count as f64
                    }
                    _ => 0.0,
                };
                TokenAttribution {
                    token: token.text.clone(),
                    importance,
                    position: token.position,
                }
            })
            .collect();

        let ranked = rank(attributions);
        let cache = self.outputs.stats().since(&cache_before);
        info!(
            run_id = %progress.run_id(),
            tokens = ranked.len(),
            coalitions = evaluated,
            cache_hits = cache.hits,
            cache_misses = cache.misses,
            "Shapley attribution complete"
        );
        progress.stage(RunStage::Completed, 100.0, "Analysis complete");

        Ok(ResultRecord {
            run_id: progress.run_id(),
            method: AttributionMethod::Shapley,
            prompt: prompt.to_string(),
            tokens: ranked,
            timestamp: Utc::now(),
            model: self.client.completion_model().to_string(),
            encoding: self.tokenizer.encoding().to_string(),
            embedding_model: None,
            baseline_output: Some(baseline),
            full_output: Some(full_output),
            skipped_positions: Vec::new(),
            coalitions_evaluated: Some(evaluated),
            cache: Some(cache),
        })
    }
}
