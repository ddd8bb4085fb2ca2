//! Attribution sessions: run, spawn and batch attribution runs.
//!
//! A session owns the model client, the tokenizer and the session-scoped
//! caches, so the baseline completion and any repeated perturbation are
//! paid for once across every prompt in the session. Finished runs are
//! published to a status map only after they fully complete or fully fail.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::attribution::{Attributor, CosineAttributor, ShapleyAttributor};
use crate::cache::{CacheStats, CoalitionCache};
use crate::config::{AttributionConfig, load_config};
use crate::error::{AttributionError, ConfigError, Result, TokenLensError};
use crate::progress::{ProgressSink, RunStage};
use crate::providers::{ModelClient, create_client};
use crate::record::{AttributionMethod, ResultRecord};
use crate::tokenizer::TokenizerAdapter;

/// State of a run in the session's result store.
#[derive(Debug, Clone, PartialEq)]
pub enum RunStatus {
    Running,
    Completed(ResultRecord),
    /// User-facing failure message.
    Failed(String),
}

/// Outcome of one prompt in a batch, in input order.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    Completed(ResultRecord),
    Failed { prompt: String, message: String },
    /// Blank prompt; nothing was submitted.
    Skipped { index: usize },
}

impl BatchOutcome {
    pub fn record(&self) -> Option<&ResultRecord> {
        match self {
            BatchOutcome::Completed(record) => Some(record),
            _ => None,
        }
    }
}

/// Shared context for attribution runs.
#[derive(Clone)]
pub struct AttributionSession {
    config: AttributionConfig,
    client: Arc<dyn ModelClient>,
    tokenizer: Arc<TokenizerAdapter>,
    cosine: Arc<CosineAttributor>,
    shapley: Arc<ShapleyAttributor>,
    completions: Arc<CoalitionCache<String>>,
    embeddings: Arc<CoalitionCache<Vec<f32>>>,
    results: Arc<RwLock<HashMap<Uuid, RunStatus>>>,
}

impl std::fmt::Debug for AttributionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttributionSession")
            .field("completion_model", &self.client.completion_model())
            .field("embedding_model", &self.client.embedding_model())
            .field("tokenizer", &self.tokenizer)
            .finish()
    }
}

impl AttributionSession {
    /// Build a session around an existing client.
    pub fn new(config: AttributionConfig, client: Arc<dyn ModelClient>) -> Result<Self> {
        let tokenizer = Arc::new(TokenizerAdapter::from_config(
            config.tokenizer.encoding.as_deref(),
            &config.llm.completion_model,
        )?);
        let completions = Arc::new(CoalitionCache::new());
        let embeddings = Arc::new(CoalitionCache::new());

        let cosine = Arc::new(CosineAttributor::with_cache(
            client.clone(),
            tokenizer.clone(),
            config.cosine.clone(),
            embeddings.clone(),
        ));
        let shapley = Arc::new(ShapleyAttributor::with_cache(
            client.clone(),
            tokenizer.clone(),
            config.shapley.clone(),
            completions.clone(),
        ));

        Ok(Self {
            config,
            client,
            tokenizer,
            cosine,
            shapley,
            completions,
            embeddings,
            results: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Build a session talking to the configured HTTP service.
    ///
    /// A blank key is rejected here, before any request is made.
    pub fn connect(config: AttributionConfig, api_key: &str) -> Result<Self> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(ConfigError::MissingCredential {
                var: config.llm.api_key_env.clone(),
            }
            .into());
        }
        for warning in config.llm.validate() {
            warn!("{warning}");
        }
        let client = create_client(&config.llm, api_key.to_string())?;
        Self::new(config, client)
    }

    pub fn config(&self) -> &AttributionConfig {
        &self.config
    }

    pub fn tokenizer(&self) -> &TokenizerAdapter {
        &self.tokenizer
    }

    fn attributor(&self, method: AttributionMethod) -> Arc<dyn Attributor> {
        match method {
            AttributionMethod::Cosine => self.cosine.clone(),
            AttributionMethod::Shapley => self.shapley.clone(),
        }
    }

    fn publish(&self, run_id: Uuid, status: RunStatus) {
        let mut results = self.results.write().unwrap_or_else(|e| e.into_inner());
        results.insert(run_id, status);
    }

    /// Current status of a run, if the session has seen it.
    pub fn status(&self, run_id: Uuid) -> Option<RunStatus> {
        let results = self.results.read().unwrap_or_else(|e| e.into_inner());
        results.get(&run_id).cloned()
    }

    /// Every completed record, oldest first.
    pub fn completed(&self) -> Vec<ResultRecord> {
        let results = self.results.read().unwrap_or_else(|e| e.into_inner());
        let mut records: Vec<ResultRecord> = results
            .values()
            .filter_map(|status| match status {
                RunStatus::Completed(record) => Some(record.clone()),
                _ => None,
            })
            .collect();
        records.sort_by_key(|r| r.timestamp);
        records
    }

    /// Combined counters of the session's completion and embedding caches.
    pub fn cache_stats(&self) -> CacheStats {
        let c = self.completions.stats();
        let e = self.embeddings.stats();
        CacheStats {
            hits: c.hits + e.hits,
            misses: c.misses + e.misses,
            entries: c.entries + e.entries,
        }
    }

    async fn execute(
        &self,
        run_id: Uuid,
        method: AttributionMethod,
        prompt: &str,
        progress: &ProgressSink,
    ) -> Result<ResultRecord> {
        let mut guard = RunGuard::start(self, run_id);
        let run_progress = progress.for_run(run_id);
        info!(%run_id, %method, prompt_chars = prompt.chars().count(), "Starting attribution run");

        let outcome = self.attributor(method).attribute(prompt, &run_progress).await;
        guard.finished = true;
        match outcome {
            Ok(record) => {
                self.publish(run_id, RunStatus::Completed(record.clone()));
                Ok(record)
            }
            Err(e) => {
                let message = e.user_message();
                warn!(%run_id, %method, error = %message, "Attribution run failed");
                run_progress.stage(RunStage::Failed, 100.0, message.clone());
                self.publish(run_id, RunStatus::Failed(message));
                Err(e)
            }
        }
    }

    /// Run one attribution to completion.
    pub async fn run(
        &self,
        method: AttributionMethod,
        prompt: &str,
        progress: &ProgressSink,
    ) -> Result<ResultRecord> {
        self.execute(Uuid::new_v4(), method, prompt, progress).await
    }

    /// Run one attribution on a background task.
    pub fn spawn(
        &self,
        method: AttributionMethod,
        prompt: impl Into<String>,
        progress: ProgressSink,
    ) -> (Uuid, JoinHandle<Result<ResultRecord>>) {
        let run_id = Uuid::new_v4();
        let session = self.clone();
        let prompt = prompt.into();
        let handle =
            tokio::spawn(async move { session.execute(run_id, method, &prompt, &progress).await });
        (run_id, handle)
    }

    /// Delay between consecutive batch submissions for a method.
    pub fn batch_delay(&self, method: AttributionMethod) -> Duration {
        let ms = match method {
            AttributionMethod::Cosine => self.config.batch.cosine_delay_ms,
            AttributionMethod::Shapley => self.config.batch.shapley_delay_ms,
        };
        Duration::from_millis(ms)
    }

    /// Attribute several prompts one after another.
    ///
    /// Blank prompts are skipped. A failed prompt does not stop the batch.
    pub async fn run_batch<S: AsRef<str>>(
        &self,
        method: AttributionMethod,
        prompts: &[S],
        progress: &ProgressSink,
    ) -> Vec<BatchOutcome> {
        let delay = self.batch_delay(method);
        let mut outcomes = Vec::with_capacity(prompts.len());
        let mut submitted = 0;

        for (index, prompt) in prompts.iter().enumerate() {
            let prompt = prompt.as_ref();
            if prompt.trim().is_empty() {
                info!(index, "Skipping empty prompt in batch");
                outcomes.push(BatchOutcome::Skipped { index });
                continue;
            }
            if submitted > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            submitted += 1;

            let outcome = match self.run(method, prompt, progress).await {
                Ok(record) => BatchOutcome::Completed(record),
                Err(e) => BatchOutcome::Failed {
                    prompt: prompt.to_string(),
                    message: e.user_message(),
                },
            };
            outcomes.push(outcome);
        }

        info!(
            %method,
            submitted,
            completed = outcomes.iter().filter(|o| o.record().is_some()).count(),
            "Batch finished"
        );
        outcomes
    }
}

/// Publishes `Running` for a run and marks it failed if the run future is
/// dropped before reaching a final status.
struct RunGuard<'a> {
    session: &'a AttributionSession,
    run_id: Uuid,
    finished: bool,
}

impl<'a> RunGuard<'a> {
    fn start(session: &'a AttributionSession, run_id: Uuid) -> Self {
        session.publish(run_id, RunStatus::Running);
        Self {
            session,
            run_id,
            finished: false,
        }
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let error = TokenLensError::from(AttributionError::Aborted {
            message: "run was discarded before it finished".to_string(),
        });
        warn!(run_id = %self.run_id, "Attribution run discarded");
        self.session
            .publish(self.run_id, RunStatus::Failed(error.user_message()));
    }
}

async fn run_single(
    method: AttributionMethod,
    prompt: &str,
    api_key: &str,
) -> Result<ResultRecord> {
    let workspace = std::env::current_dir().ok();
    let config = load_config(workspace.as_deref(), None).map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })?;
    let session = AttributionSession::connect(config, api_key)?;
    session.run(method, prompt, &ProgressSink::noop()).await
}

/// Cosine-drop attribution of one prompt with the effective configuration.
pub async fn run_cosine_attribution(prompt: &str, api_key: &str) -> Result<ResultRecord> {
    run_single(AttributionMethod::Cosine, prompt, api_key).await
}

/// Sampled-Shapley attribution of one prompt with the effective configuration.
pub async fn run_shapley_attribution(prompt: &str, api_key: &str) -> Result<ResultRecord> {
    run_single(AttributionMethod::Shapley, prompt, api_key).await
}
