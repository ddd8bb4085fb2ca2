//! Output-divergence metrics for the Shapley attributor.

/// Measures how far a coalition's completion moved away from the baseline.
///
/// Must be pure: the same pair of strings always yields the same effect.
pub trait DivergenceMetric: Send + Sync {
    fn name(&self) -> &str;

    fn effect(&self, baseline: &str, output: &str) -> f64;
}

/// Relative difference in output length, in characters.
///
/// `|len(baseline) - len(output)| / max(len(baseline), len(output), 1)`.
/// A cheap proxy that needs no extra model calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct LengthDivergence;

impl DivergenceMetric for LengthDivergence {
    fn name(&self) -> &str {
        "length"
    }

    fn effect(&self, baseline: &str, output: &str) -> f64 {
        let b = baseline.chars().count();
        let o = output.chars().count();
        b.abs_diff(o) as f64 / b.max(o).max(1) as f64
    }
}
