//! Prompt dataset files: one prompt per line.

use anyhow::Context;
use std::path::Path;

/// Parse dataset text. Blank lines and lines starting with `#` are ignored;
/// surrounding whitespace is trimmed.
pub fn parse_prompts(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Load prompts from a dataset file.
pub fn load_prompts(path: &Path) -> anyhow::Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read dataset {}", path.display()))?;
    let prompts = parse_prompts(&content);
    tracing::debug!(path = %path.display(), prompts = prompts.len(), "Loaded dataset");
    Ok(prompts)
}
