//! Property-based tests for core components using proptest.

use proptest::prelude::*;
use std::sync::LazyLock;

use tokenlens_core::attribution::{SamplingPlan, normalize_min_max};
use tokenlens_core::cache::CacheKey;
use tokenlens_core::tokenizer::TokenizerAdapter;

// --- Normalization properties ---

proptest! {
    #[test]
    fn normalized_scores_span_unit_range(
        scores in prop::collection::vec(-10.0f64..10.0, 1..40)
    ) {
        let mut normalized = scores.clone();
        normalize_min_max(&mut normalized);

        let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
        let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if max > min {
            let new_min = normalized.iter().copied().fold(f64::INFINITY, f64::min);
            let new_max = normalized.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            prop_assert_eq!(new_min, 0.0);
            prop_assert!((new_max - 1.0).abs() < 1e-12);
        } else {
            prop_assert_eq!(normalized, scores);
        }
    }

    #[test]
    fn normalization_preserves_order(
        scores in prop::collection::vec(-10.0f64..10.0, 2..40)
    ) {
        let mut normalized = scores.clone();
        normalize_min_max(&mut normalized);
        for i in 0..scores.len() {
            for j in 0..scores.len() {
                if scores[i] < scores[j] {
                    prop_assert!(normalized[i] <= normalized[j]);
                }
            }
        }
    }
}

// --- Coalition key properties ---

proptest! {
    #[test]
    fn coalition_key_ignores_member_order(
        members in prop::collection::vec(0usize..64, 0..12).prop_shuffle()
    ) {
        let mut sorted = members.clone();
        sorted.sort_unstable();
        let a = CacheKey::coalition("fp", members.iter().copied());
        let b = CacheKey::coalition("fp", sorted.iter().rev().copied());
        prop_assert_eq!(a.stable_hash(), b.stable_hash());
        prop_assert_eq!(a, b);
    }
}

// --- Sampling plan properties ---

proptest! {
    #[test]
    fn sampling_plan_sizes_are_unique_and_in_range(
        total in 1usize..60,
        max_samples in 0usize..50,
    ) {
        let plan = SamplingPlan::build(total, max_samples);
        let pairs = plan.as_pairs();
        prop_assert_eq!(pairs[0], (0, 1));

        let mut sizes: Vec<usize> = pairs.iter().map(|(size, _)| *size).collect();
        prop_assert!(sizes.iter().all(|&s| s < total));
        sizes.sort_unstable();
        sizes.dedup();
        prop_assert_eq!(sizes.len(), pairs.len());

        prop_assert!(plan.total_samples() <= max_samples.max(2));
    }
}

// --- Tokenizer properties ---

static TOKENIZER: LazyLock<TokenizerAdapter> =
    LazyLock::new(|| TokenizerAdapter::from_encoding("cl100k_base").unwrap());

proptest! {
    #[test]
    fn decode_inverts_encode(text in "\\PC{0,80}") {
        let ids = TOKENIZER.encode(&text);
        prop_assert_eq!(TOKENIZER.decode(&ids).unwrap(), text);
    }
}
