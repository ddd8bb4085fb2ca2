//! Coalition sampling for the Shapley attributor.

use rand::Rng;
use rand::seq::SliceRandom;
use std::collections::HashSet;

use crate::cache::{CacheKey, prompt_fingerprint};
use crate::error::TokenizationError;
use crate::tokenizer::{Token, TokenId, TokenizerAdapter};

/// `count` coalitions of `size` significant tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoalitionDraw {
    pub size: usize,
    pub count: usize,
}

/// Ordered list of coalition sizes to sample, and how many of each.
///
/// Built deterministically from the number of significant tokens and the
/// sample budget:
///
/// 1. one empty coalition;
/// 2. one coalition of all-but-one tokens;
/// 3. with more than two tokens, `min(n, (budget - 2) / 2)` single-token coalitions;
/// 4. with more than three tokens, one coalition of each size `2..n-1` while
///    budget remains.
///
/// Assigning a size that is already planned overwrites its count in place.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SamplingPlan {
    draws: Vec<CoalitionDraw>,
}

impl SamplingPlan {
    pub fn build(total_tokens: usize, max_samples: usize) -> Self {
        let mut plan = Self::default();
        if total_tokens == 0 {
            return plan;
        }

        plan.assign(0, 1);
        plan.assign(total_tokens - 1, 1);
        let mut remaining = max_samples.saturating_sub(2);

        if total_tokens > 2 {
            let singles = total_tokens.min(remaining / 2);
            plan.assign(1, singles);
            remaining = remaining.saturating_sub(singles);

            if total_tokens > 3 {
                for size in 2..total_tokens - 1 {
                    if remaining == 0 {
                        break;
                    }
                    plan.assign(size, 1);
                    remaining -= 1;
                }
            }
        }
        plan
    }

    fn assign(&mut self, size: usize, count: usize) {
        match self.draws.iter_mut().find(|d| d.size == size) {
            Some(draw) => draw.count = count,
            None => self.draws.push(CoalitionDraw { size, count }),
        }
    }

    pub fn draws(&self) -> &[CoalitionDraw] {
        &self.draws
    }

    /// Total coalitions the plan will evaluate; the progress denominator.
    pub fn total_samples(&self) -> usize {
        self.draws.iter().map(|d| d.count).sum()
    }

    /// As `(size, count)` pairs, in planning order.
    pub fn as_pairs(&self) -> Vec<(usize, usize)> {
        self.draws.iter().map(|d| (d.size, d.count)).collect()
    }
}

/// Draw a coalition of `size` positions uniformly without replacement.
///
/// Size 0 is the empty coalition and a size of at least `significant.len()`
/// is the full set; neither consumes randomness.
pub fn sample_coalition<R: Rng + ?Sized>(
    significant: &[usize],
    size: usize,
    rng: &mut R,
) -> Vec<usize> {
    if size == 0 {
        Vec::new()
    } else if size >= significant.len() {
        significant.to_vec()
    } else {
        significant.choose_multiple(rng, size).copied().collect()
    }
}

/// Rebuilds prompt text for a coalition and derives its cache key.
///
/// A coalition names the significant positions that are kept; every
/// non-significant token is always kept, so ablation only ever removes
/// significant tokens.
#[derive(Debug, Clone)]
pub struct CoalitionBuilder {
    ids: Vec<TokenId>,
    significant: Vec<bool>,
    fingerprint: String,
}

impl CoalitionBuilder {
    pub fn new(prompt: &str, tokens: &[Token], significant: &[usize]) -> Self {
        let mut mask = vec![false; tokens.len()];
        for &position in significant {
            if let Some(slot) = mask.get_mut(position) {
                *slot = true;
            }
        }
        Self {
            ids: tokens.iter().map(|t| t.id).collect(),
            significant: mask,
            fingerprint: prompt_fingerprint(prompt),
        }
    }

    /// Cache key for the coalition; member order does not matter.
    pub fn key(&self, members: &[usize]) -> CacheKey {
        CacheKey::coalition(&self.fingerprint, members.iter().copied())
    }

    /// Token ids kept by the coalition, in original order.
    pub fn retained_ids(&self, members: &[usize]) -> Vec<TokenId> {
        let members: HashSet<usize> = members.iter().copied().collect();
        self.ids
            .iter()
            .enumerate()
            .filter(|(position, _)| !self.significant[*position] || members.contains(position))
            .map(|(_, id)| *id)
            .collect()
    }

    /// Decoded text of the coalition's prompt.
    pub fn text(
        &self,
        tokenizer: &TokenizerAdapter,
        members: &[usize],
    ) -> Result<String, TokenizationError> {
        tokenizer.decode(&self.retained_ids(members))
    }
}
