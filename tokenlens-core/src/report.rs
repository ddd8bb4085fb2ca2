//! Report writers for attribution results and token breakdowns.
//!
//! All writers take any `io::Write`, so callers decide whether output goes
//! to a file, stdout or an in-memory buffer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;

use crate::error::Result;
use crate::record::{AttributionMethod, ResultRecord};
use crate::tokenizer::TokenizerAdapter;

const HEAVY_RULE: &str = "==================================================";
const RULE: &str = "--------------------------------------------------";
const WIDE_RULE: &str =
    "--------------------------------------------------------------------------------";
const TABLE_RULE: &str =
    "----------------------------------------------------------------------";

/// Longest token text shown in a report table.
pub const MAX_TOKEN_DISPLAY: usize = 20;

/// Output format for an attribution report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Text,
    Json,
}

impl ReportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ReportFormat::Text => "txt",
            ReportFormat::Json => "json",
        }
    }

    pub fn write<W: Write>(&self, record: &ResultRecord, writer: &mut W) -> Result<()> {
        match self {
            ReportFormat::Text => write_text_report(record, writer),
            ReportFormat::Json => write_json_report(record, writer),
        }
    }
}

impl std::str::FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "txt" => Ok(ReportFormat::Text),
            "json" => Ok(ReportFormat::Json),
            other => Err(format!("unknown report format '{other}'")),
        }
    }
}

/// File name for a record's report, e.g. `shapley_report_20250101_120000_1a2b3c4d.txt`.
pub fn report_file_name(record: &ResultRecord, format: ReportFormat) -> String {
    let run = record.run_id.simple().to_string();
    format!(
        "{}_report_{}_{}.{}",
        record.method,
        record.timestamp.format("%Y%m%d_%H%M%S"),
        &run[..8],
        format.extension()
    )
}

/// Escape a token for a one-line table cell and clip it to [`MAX_TOKEN_DISPLAY`] chars.
pub fn display_token(token: &str) -> String {
    let shown = match token {
        "\n" => "\\n".to_string(),
        "\t" => "\\t".to_string(),
        t if !t.is_empty() && t.chars().all(char::is_whitespace) => "[space]".to_string(),
        t => t.replace('\n', "\\n").replace('\t', "\\t"),
    };
    shown.chars().take(MAX_TOKEN_DISPLAY).collect()
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

/// Plain-text report: header, prompt, reference outputs and the ranked token table.
pub fn write_text_report<W: Write>(record: &ResultRecord, writer: &mut W) -> Result<()> {
    let (title, table_title, value_header) = match record.method {
        AttributionMethod::Cosine => (
            "TOKEN IMPORTANCE ANALYSIS",
            "TOKEN IMPORTANCE ANALYSIS:",
            "IMPORTANCE",
        ),
        AttributionMethod::Shapley => (
            "SHAP TOKEN IMPORTANCE ANALYSIS",
            "TOKEN SHAP VALUES:",
            "SHAP VALUE",
        ),
    };

    writeln!(writer, "{title}")?;
    writeln!(writer, "{HEAVY_RULE}\n")?;
    writeln!(writer, "Analysis Date: {}", format_timestamp(&record.timestamp))?;
    writeln!(writer, "Run ID: {}", record.run_id)?;
    writeln!(writer, "Model: {}", record.model)?;
    if let Some(embedding_model) = &record.embedding_model {
        writeln!(writer, "Embedding Model: {embedding_model}")?;
    }
    writeln!(writer, "Encoding: {}\n", record.encoding)?;

    writeln!(writer, "ORIGINAL PROMPT:")?;
    writeln!(writer, "{RULE}")?;
    writeln!(writer, "{}\n", record.prompt)?;

    if let Some(baseline) = &record.baseline_output {
        writeln!(writer, "BASELINE MODEL OUTPUT (empty prompt):")?;
        writeln!(writer, "{RULE}")?;
        writeln!(writer, "{baseline}\n")?;
    }
    if let Some(full) = &record.full_output {
        writeln!(writer, "FULL PROMPT OUTPUT:")?;
        writeln!(writer, "{RULE}")?;
        writeln!(writer, "{full}\n")?;
    }

    writeln!(writer, "{table_title}")?;
    writeln!(writer, "{RULE}")?;
    writeln!(writer, "{:<20} {:<15} {:<10}", "TOKEN", value_header, "POSITION")?;
    writeln!(writer, "{RULE}")?;
    for token in &record.tokens {
        writeln!(
            writer,
            "{:<20} {:<15.4} {:<10}",
            display_token(&token.token),
            token.importance,
            token.position
        )?;
    }

    if !record.skipped_positions.is_empty() {
        let skipped: Vec<String> = record
            .skipped_positions
            .iter()
            .map(|p| p.to_string())
            .collect();
        writeln!(writer, "\nSkipped positions (query failed): {}", skipped.join(", "))?;
    }
    if let Some(evaluated) = record.coalitions_evaluated {
        writeln!(writer, "\nCoalitions evaluated: {evaluated}")?;
    }
    if let Some(cache) = &record.cache {
        writeln!(
            writer,
            "Cache: {} hits, {} misses ({:.0}% hit rate)",
            cache.hits,
            cache.misses,
            cache.hit_rate() * 100.0
        )?;
    }
    Ok(())
}

/// Pretty-printed JSON of the record.
pub fn write_json_report<W: Write>(record: &ResultRecord, writer: &mut W) -> Result<()> {
    serde_json::to_writer_pretty(&mut *writer, record)?;
    writeln!(writer)?;
    Ok(())
}

/// Show whitespace tokens visibly: a single space as `·`, runs as one `·` per char.
fn visible_whitespace(text: &str) -> String {
    match text {
        "\n" => "\\n".to_string(),
        "\t" => "\\t".to_string(),
        " " => "·".to_string(),
        t if t.chars().count() > 1 && t.trim().is_empty() => "·".repeat(t.chars().count()),
        t => t.to_string(),
    }
}

/// Per-prompt token listing (index, text, id) with a closing summary.
pub fn write_token_breakdown<W: Write, S: AsRef<str>>(
    prompts: &[S],
    tokenizer: &TokenizerAdapter,
    writer: &mut W,
) -> Result<()> {
    writeln!(
        writer,
        "Token Report - {}",
        format_timestamp(&Utc::now())
    )?;
    writeln!(writer, "Tokenizer: {}\n", tokenizer.encoding())?;

    let mut total_tokens = 0;
    for (i, prompt) in prompts.iter().enumerate() {
        let prompt = prompt.as_ref();
        let tokens = tokenizer.tokenize(prompt)?;
        total_tokens += tokens.len();

        writeln!(writer, "Prompt {}:", i + 1)?;
        writeln!(writer, "{WIDE_RULE}")?;
        writeln!(writer, "{prompt}")?;
        writeln!(writer, "{WIDE_RULE}")?;
        writeln!(writer, "Total tokens: {}\n", tokens.len())?;

        writeln!(writer, "Token breakdown:")?;
        writeln!(writer, "{:<10}{:<50}{:<10}", "Index", "Token Text", "Token ID")?;
        writeln!(writer, "{TABLE_RULE}")?;
        for token in &tokens {
            writeln!(
                writer,
                "{:<10}{:<50}{:<10}",
                token.position,
                visible_whitespace(&token.text),
                token.id
            )?;
        }
        writeln!(writer, "\n")?;
    }

    writeln!(writer, "Summary:")?;
    writeln!(writer, "{WIDE_RULE}")?;
    writeln!(writer, "Total prompts: {}", prompts.len())?;
    writeln!(writer, "Total tokens across all prompts: {total_tokens}")?;
    Ok(())
}
