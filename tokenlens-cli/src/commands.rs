//! CLI subcommand handlers.

use crate::dataset;
use crate::{AnalyzeArgs, Commands, ConfigAction};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokenlens_core::report::{ReportFormat, report_file_name, write_token_breakdown};
use tokenlens_core::{
    AttributionConfig, AttributionMethod, AttributionSession, BatchOutcome, ProgressEvent,
    ProgressSink, ResultRecord, TokenizerAdapter, resolve_api_key,
};
use tokio::sync::mpsc::UnboundedReceiver;

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    quiet: bool,
) -> anyhow::Result<()> {
    match command {
        Commands::Cosine(args) => {
            handle_analyze(AttributionMethod::Cosine, args, workspace, quiet).await
        }
        Commands::Shapley(args) => {
            handle_analyze(AttributionMethod::Shapley, args, workspace, quiet).await
        }
        Commands::Tokens {
            prompt,
            dataset,
            out,
        } => handle_tokens(prompt, dataset, out, workspace),
        Commands::Config { action } => handle_config(action, workspace),
    }
}

fn load_workspace_config(workspace: &Path) -> anyhow::Result<AttributionConfig> {
    tokenlens_core::config::load_config(Some(workspace), None)
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
}

fn collect_prompts(
    prompt: Option<String>,
    dataset_path: Option<&Path>,
) -> anyhow::Result<Vec<String>> {
    let prompts = match (prompt, dataset_path) {
        (Some(prompt), _) => vec![prompt],
        (None, Some(path)) => dataset::load_prompts(path)?,
        (None, None) => anyhow::bail!("Provide a prompt or --dataset"),
    };
    if prompts.is_empty() {
        anyhow::bail!("No prompts to analyze");
    }
    Ok(prompts)
}

/// Apply per-invocation flags on top of the loaded configuration.
fn apply_overrides(config: &mut AttributionConfig, method: AttributionMethod, args: &AnalyzeArgs) {
    if let Some(model) = &args.model {
        config.llm.completion_model = model.clone();
    }
    if let Some(seed) = args.seed {
        config.shapley.seed = Some(seed);
    }
    if let Some(max_tokens) = args.max_tokens {
        match method {
            AttributionMethod::Cosine => config.cosine.max_tokens = Some(max_tokens),
            AttributionMethod::Shapley => config.shapley.max_tokens = Some(max_tokens),
        }
    }
}

async fn handle_analyze(
    method: AttributionMethod,
    args: AnalyzeArgs,
    workspace: &Path,
    quiet: bool,
) -> anyhow::Result<()> {
    let mut config = load_workspace_config(workspace)?;
    apply_overrides(&mut config, method, &args);

    let is_batch = args.prompt.is_none();
    let prompts = collect_prompts(args.prompt.clone(), args.dataset.as_deref())?;
    let api_key = resolve_api_key(args.api_key.as_deref(), &config.llm)?;
    let session = AttributionSession::connect(config, &api_key)?;
    let format = ReportFormat::from(args.format);

    let (sink, rx) = ProgressSink::channel();
    let printer = tokio::spawn(render_progress(rx, quiet));

    let result = if is_batch {
        let outcomes = session.run_batch(method, &prompts, &sink).await;
        drop(sink);
        let _ = printer.await;
        emit_batch(&outcomes, format, args.out.as_deref())
    } else {
        let outcome = session.run(method, &prompts[0], &sink).await;
        drop(sink);
        let _ = printer.await;
        let record = outcome?;
        emit_record(&record, format, args.out.as_deref()).map(|_| ())
    };

    let stats = session.cache_stats();
    tracing::debug!(
        hits = stats.hits,
        misses = stats.misses,
        entries = stats.entries,
        "Session cache"
    );
    result
}

/// Print progress events to stderr until every sender is gone.
async fn render_progress(mut rx: UnboundedReceiver<ProgressEvent>, quiet: bool) {
    while let Some(event) = rx.recv().await {
        if !quiet {
            eprintln!("{}", format_progress(&event));
        }
    }
}

pub(crate) fn format_progress(event: &ProgressEvent) -> String {
    let run = event.run_id.simple().to_string();
    format!(
        "[{}] {:<10} {:>5.1}%  {}",
        &run[..8],
        event.stage.to_string(),
        event.percent,
        event.message
    )
}

/// Write one report. Returns the file written, if any.
fn emit_record(
    record: &ResultRecord,
    format: ReportFormat,
    out_dir: Option<&Path>,
) -> anyhow::Result<Option<PathBuf>> {
    match out_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let path = dir.join(report_file_name(record, format));
            let mut file = std::io::BufWriter::new(std::fs::File::create(&path)?);
            format.write(record, &mut file)?;
            file.flush()?;
            println!("Report saved to {}", path.display());
            Ok(Some(path))
        }
        None => {
            let stdout = std::io::stdout();
            let mut handle = stdout.lock();
            format.write(record, &mut handle)?;
            writeln!(handle)?;
            Ok(None)
        }
    }
}

fn emit_batch(
    outcomes: &[BatchOutcome],
    format: ReportFormat,
    out_dir: Option<&Path>,
) -> anyhow::Result<()> {
    let mut failed = 0;
    for outcome in outcomes {
        match outcome {
            BatchOutcome::Completed(record) => {
                emit_record(record, format, out_dir)?;
            }
            BatchOutcome::Failed { prompt, message } => {
                failed += 1;
                eprintln!("Failed: {prompt}\n  {message}");
            }
            BatchOutcome::Skipped { .. } => {}
        }
    }
    let completed = outcomes.iter().filter(|o| o.record().is_some()).count();
    println!("Batch complete: {completed} succeeded, {failed} failed");
    if completed == 0 && failed > 0 {
        anyhow::bail!("Every prompt in the batch failed");
    }
    Ok(())
}

fn handle_tokens(
    prompt: Option<String>,
    dataset: Option<PathBuf>,
    out: Option<PathBuf>,
    workspace: &Path,
) -> anyhow::Result<()> {
    let config = load_workspace_config(workspace)?;
    let prompts = collect_prompts(prompt, dataset.as_deref())?;
    let tokenizer = TokenizerAdapter::from_config(
        config.tokenizer.encoding.as_deref(),
        &config.llm.completion_model,
    )?;

    match out {
        Some(path) => {
            let mut file = std::io::BufWriter::new(std::fs::File::create(&path)?);
            write_token_breakdown(&prompts, &tokenizer, &mut file)?;
            file.flush()?;
            println!("Token report saved to {}", path.display());
        }
        None => {
            let stdout = std::io::stdout();
            write_token_breakdown(&prompts, &tokenizer, &mut stdout.lock())?;
        }
    }
    Ok(())
}

fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".tokenlens");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = tokenlens_core::config::to_toml_string(&AttributionConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load_workspace_config(workspace)?;
            for warning in config.llm.validate() {
                eprintln!("warning: {warning}");
            }
            println!("{}", tokenlens_core::config::to_toml_string(&config)?);
            Ok(())
        }
    }
}
