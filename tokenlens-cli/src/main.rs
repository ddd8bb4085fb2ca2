//! TokenLens CLI: score which prompt tokens matter to a language model.
//!
//! Runs cosine-drop or sampled-Shapley attribution over a single prompt or a
//! dataset file and writes text or JSON reports.

mod commands;
mod dataset;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// TokenLens: token attribution for LLM prompts
#[derive(Parser, Debug)]
#[command(name = "tokenlens", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (searched for .tokenlens/config.toml)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress progress output and info logs
    #[arg(short, long)]
    quiet: bool,

    /// Subcommand
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum Commands {
    /// Score tokens by how far the prompt embedding drifts when each is removed
    Cosine(AnalyzeArgs),
    /// Score tokens with sampled Shapley values over completion outputs
    Shapley(AnalyzeArgs),
    /// Show how prompts split into tokens
    Tokens {
        /// Prompt to tokenize
        #[arg(required_unless_present = "dataset")]
        prompt: Option<String>,
        /// Dataset file with one prompt per line
        #[arg(short, long, conflicts_with = "prompt")]
        dataset: Option<PathBuf>,
        /// Write the report to this file instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub(crate) struct AnalyzeArgs {
    /// Prompt to analyze
    #[arg(required_unless_present = "dataset")]
    pub prompt: Option<String>,

    /// Dataset file with one prompt per line ('#' starts a comment)
    #[arg(short, long, conflicts_with = "prompt")]
    pub dataset: Option<PathBuf>,

    /// API key (defaults to the variable named by llm.api_key_env)
    #[arg(long)]
    pub api_key: Option<String>,

    /// Directory to write one report per run (prints to stdout if omitted)
    #[arg(short, long)]
    pub out: Option<PathBuf>,

    /// Report format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    /// Completion model to use
    #[arg(short, long)]
    pub model: Option<String>,

    /// Truncate prompts to this many tokens
    #[arg(long)]
    pub max_tokens: Option<usize>,

    /// RNG seed for reproducible coalition sampling (shapley)
    #[arg(long)]
    pub seed: Option<u64>,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

impl From<OutputFormat> for tokenlens_core::ReportFormat {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Text => tokenlens_core::ReportFormat::Text,
            OutputFormat::Json => tokenlens_core::ReportFormat::Json,
        }
    }
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum ConfigAction {
    /// Write a default .tokenlens/config.toml into the workspace
    Init,
    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "tokenlens", "tokenlens")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "tokenlens.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    commands::handle_command(cli.command, &workspace, cli.quiet).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_shapley_with_options() {
        let cli = Cli::try_parse_from([
            "tokenlens",
            "-vv",
            "shapley",
            "Explain recursion",
            "--seed",
            "7",
            "--format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Shapley(args) => {
                assert_eq!(args.prompt.as_deref(), Some("Explain recursion"));
                assert_eq!(args.seed, Some(7));
                assert_eq!(args.format, OutputFormat::Json);
            }
            other => panic!("Expected Shapley, got {:?}", other),
        }
    }

    #[test]
    fn test_prompt_or_dataset_required() {
        assert!(Cli::try_parse_from(["tokenlens", "cosine"]).is_err());
        let both = ["tokenlens", "cosine", "hi", "--dataset", "prompts.txt"];
        assert!(Cli::try_parse_from(both).is_err());
        assert!(Cli::try_parse_from(["tokenlens", "cosine", "--dataset", "prompts.txt"]).is_ok());
    }
}
