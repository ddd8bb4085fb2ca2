//! Leave-one-out attribution by embedding similarity.
//!
//! Each token is removed in turn; the importance of a token is how far the
//! embedding of the shortened prompt drifts from the embedding of the full
//! prompt, measured as `1 - cosine_similarity`.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{Attributor, in_stoplist, prepare_tokens, rank};
use crate::cache::{CacheKey, CoalitionCache};
use crate::config::CosineConfig;
use crate::error::{AttributionError, Result, ServiceError};
use crate::progress::{RunProgress, RunStage};
use crate::providers::ModelClient;
use crate::record::{AttributionMethod, ResultRecord, TokenAttribution};
use crate::tokenizer::{TokenId, TokenizerAdapter};

pub struct CosineAttributor {
    client: Arc<dyn ModelClient>,
    tokenizer: Arc<TokenizerAdapter>,
    config: CosineConfig,
    embeddings: Arc<CoalitionCache<Vec<f32>>>,
}

impl CosineAttributor {
    pub fn new(
        client: Arc<dyn ModelClient>,
        tokenizer: Arc<TokenizerAdapter>,
        config: CosineConfig,
    ) -> Self {
        Self::with_cache(client, tokenizer, config, Arc::new(CoalitionCache::new()))
    }

    /// Share an embedding cache with other runs in the same session.
    pub fn with_cache(
        client: Arc<dyn ModelClient>,
        tokenizer: Arc<TokenizerAdapter>,
        config: CosineConfig,
        embeddings: Arc<CoalitionCache<Vec<f32>>>,
    ) -> Self {
        Self {
            client,
            tokenizer,
            config,
            embeddings,
        }
    }

    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, ServiceError> {
        self.embeddings
            .get_or_compute(CacheKey::text(text), || self.client.embed(text))
            .await
    }

    /// Score one perturbed text against the reference embedding.
    async fn score(
        &self,
        reference: &[f32],
        perturbed: &str,
    ) -> std::result::Result<f64, ServiceError> {
        let embedding = self.embed(perturbed).await?;
        Ok(1.0 - cosine_similarity(reference, &embedding)?)
    }
}

#[async_trait]
impl Attributor for CosineAttributor {
    fn method(&self) -> AttributionMethod {
        AttributionMethod::Cosine
    }

    async fn attribute(&self, prompt: &str, progress: &RunProgress) -> Result<ResultRecord> {
        let tokens = prepare_tokens(&self.tokenizer, prompt, self.config.max_tokens, progress)?;
        let ids: Vec<TokenId> = tokens.iter().map(|t| t.id).collect();
        let total = tokens.len();
        let cache_before = self.embeddings.stats();

        progress.stage(RunStage::Baseline, 0.0, "Embedding full prompt...");
        let full_text = self.tokenizer.decode(&ids)?;
        let reference = self.embed(&full_text).await?;

        let mut scored = Vec::with_capacity(total);
        let mut skipped = Vec::new();
        let mut attempted = 0;

        for (i, token) in tokens.iter().enumerate() {
            if !in_stoplist(token.text.trim(), &self.config.stoplist) {
                attempted += 1;

                let mut perturbed_ids = ids.clone();
                perturbed_ids.remove(i);
                let perturbed = self.tokenizer.decode(&perturbed_ids)?;

                match self.score(&reference, &perturbed).await {
                    Ok(importance) => scored.push(TokenAttribution {
                        token: token.text.clone(),
                        importance,
                        position: token.position,
                    }),
                    Err(e) => {
                        warn!(
                            position = token.position,
                            error = %e,
                            "Skipping token after embedding failure"
                        );
                        skipped.push(token.position);
                    }
                }
            }
            progress.iteration(i + 1, total);
        }

        if attempted == 0 {
            return Err(AttributionError::NoSignificantTokens.into());
        }
        if scored.is_empty() {
            return Err(AttributionError::AllTokensFailed { attempted }.into());
        }

        debug!(scored = scored.len(), skipped = skipped.len(), "Cosine scoring finished");
        let tokens = rank(scored);
        let cache = self.embeddings.stats().since(&cache_before);
        info!(
            run_id = %progress.run_id(),
            tokens = tokens.len(),
            cache_hits = cache.hits,
            "Cosine attribution complete"
        );
        progress.stage(RunStage::Completed, 100.0, "Analysis complete");

        Ok(ResultRecord {
            run_id: progress.run_id(),
            method: AttributionMethod::Cosine,
            prompt: prompt.to_string(),
            tokens,
            timestamp: Utc::now(),
            model: self.client.completion_model().to_string(),
            encoding: self.tokenizer.encoding().to_string(),
            embedding_model: Some(self.client.embedding_model().to_string()),
            baseline_output: None,
            full_output: None,
            skipped_positions: skipped,
            coalitions_evaluated: None,
            cache: Some(cache),
        })
    }
}

/// Cosine similarity of two embeddings. A zero vector has similarity 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> std::result::Result<f64, ServiceError> {
    if a.len() != b.len() {
        return Err(ServiceError::ResponseParse {
            message: format!("embedding dimensions differ: {} vs {}", a.len(), b.len()),
        });
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }
    Ok(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressSink;
    use crate::providers::MockModelClient;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn tokenizer() -> Arc<TokenizerAdapter> {
        Arc::new(TokenizerAdapter::from_encoding("cl100k_base").unwrap())
    }

    fn progress() -> RunProgress {
        ProgressSink::noop().for_run(Uuid::new_v4())
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]).unwrap() - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).unwrap().abs() < 1e-9);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]).unwrap() + 1.0).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]).unwrap(), 0.0);
        assert!(cosine_similarity(&[1.0], &[1.0, 0.0]).is_err());
    }

    #[tokio::test]
    async fn test_orthogonal_ablations_all_score_one() {
        let prompt = "The quick brown fox";
        let client = Arc::new(MockModelClient::new().with_embedder(move |text| {
            Ok(if text == prompt {
                vec![1.0, 0.0]
            } else {
                vec![0.0, 1.0]
            })
        }));
        let attributor =
            CosineAttributor::new(client.clone(), tokenizer(), CosineConfig::default());
        let record = attributor.attribute(prompt, &progress()).await.unwrap();

        assert_eq!(record.tokens.len(), 4);
        assert!(record.tokens.iter().all(|t| t.importance == 1.0));
        // Ties keep position order
        let positions: Vec<usize> = record.tokens.iter().map(|t| t.position).collect();
        assert_eq!(positions, vec![0, 1, 2, 3]);
        assert_eq!(record.embedding_model.as_deref(), Some("mock-embedding"));
        assert_eq!(client.embed_calls(), 5);
    }

    #[tokio::test]
    async fn test_progress_counts_finished_tokens() {
        use std::sync::Mutex;

        let (sink, rx) = ProgressSink::channel();
        let rx = Arc::new(Mutex::new(rx));
        let analyzing = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let (rx_in, analyzing_in, seen_in) = (rx.clone(), analyzing.clone(), seen.clone());
        let client = Arc::new(MockModelClient::new().with_embedder(move |_| {
            let mut rx = rx_in.lock().unwrap();
            while let Ok(event) = rx.try_recv() {
                if event.stage == RunStage::Analyzing {
                    analyzing_in.fetch_add(1, Ordering::SeqCst);
                }
            }
            seen_in.lock().unwrap().push(analyzing_in.load(Ordering::SeqCst));
            Ok(vec![1.0, 0.0])
        }));
        let attributor = CosineAttributor::new(client, tokenizer(), CosineConfig::default());
        attributor
            .attribute("The quick brown fox", &sink.for_run(Uuid::new_v4()))
            .await
            .unwrap();

        // Reference embedding, then one ablation per token; each ablation
        // sees only the iterations already finished.
        assert_eq!(*seen.lock().unwrap(), vec![0, 0, 1, 2, 3]);

        let mut rx = rx.lock().unwrap();
        let mut last_analyzing = None;
        while let Ok(event) = rx.try_recv() {
            if event.stage == RunStage::Analyzing {
                last_analyzing = Some(event.message);
            }
        }
        assert_eq!(last_analyzing.as_deref(), Some("4/4"));
    }

    #[tokio::test]
    async fn test_stoplisted_tokens_are_not_scored() {
        let client = Arc::new(MockModelClient::new());
        let attributor = CosineAttributor::new(client, tokenizer(), CosineConfig::default());
        let record = attributor
            .attribute("Hello, world!", &progress())
            .await
            .unwrap();

        let texts: Vec<&str> = record.tokens.iter().map(|t| t.token.as_str()).collect();
        assert!(!texts.contains(&","));
        assert!(!texts.contains(&"!"));
        assert!(texts.contains(&"Hello"));
    }

    #[tokio::test]
    async fn test_failed_tokens_are_skipped() {
        let prompt = "The quick brown fox";
        let client = Arc::new(MockModelClient::new().with_embedder(move |text| {
            if text == prompt {
                Ok(vec![1.0, 0.0])
            } else if !text.contains("quick") {
                Err(ServiceError::Connection {
                    message: "flaky".into(),
                })
            } else {
                Ok(vec![1.0, 1.0])
            }
        }));
        let attributor = CosineAttributor::new(client, tokenizer(), CosineConfig::default());
        let record = attributor.attribute(prompt, &progress()).await.unwrap();

        assert_eq!(record.skipped_positions, vec![1]);
        assert_eq!(record.tokens.len(), 3);
        assert!(record.token_at(1).is_none());
    }

    #[tokio::test]
    async fn test_all_failures_is_an_error() {
        let prompt = "The quick brown fox";
        let client = Arc::new(MockModelClient::new().with_embedder(move |text| {
            if text == prompt {
                Ok(vec![1.0, 0.0])
            } else {
                Err(ServiceError::Connection {
                    message: "down".into(),
                })
            }
        }));
        let attributor = CosineAttributor::new(client, tokenizer(), CosineConfig::default());
        let err = attributor.attribute(prompt, &progress()).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::TokenLensError::Attribution(AttributionError::AllTokensFailed {
                attempted: 4
            })
        ));
    }

    #[tokio::test]
    async fn test_reference_embedding_failure_is_fatal() {
        let client = Arc::new(MockModelClient::new().with_embedder(|_| {
            Err(ServiceError::AuthFailed {
                provider: "mock".into(),
            })
        }));
        let attributor =
            CosineAttributor::new(client.clone(), tokenizer(), CosineConfig::default());
        let err = attributor
            .attribute("The quick brown fox", &progress())
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::TokenLensError::Service(_)));
        assert_eq!(client.embed_calls(), 1);
    }

    #[tokio::test]
    async fn test_truncation_limits_scored_tokens() {
        let client = Arc::new(MockModelClient::new());
        let config = CosineConfig {
            max_tokens: Some(2),
            ..Default::default()
        };
        let attributor = CosineAttributor::new(client, tokenizer(), config);
        let record = attributor
            .attribute("The quick brown fox", &progress())
            .await
            .unwrap();
        assert!(record.tokens.iter().all(|t| t.position < 2));
    }

    #[tokio::test]
    async fn test_shared_cache_avoids_repeat_calls() {
        let client = Arc::new(MockModelClient::new());
        let attributor =
            CosineAttributor::new(client.clone(), tokenizer(), CosineConfig::default());
        attributor
            .attribute("The quick brown fox", &progress())
            .await
            .unwrap();
        let calls = client.embed_calls();
        let record = attributor
            .attribute("The quick brown fox", &progress())
            .await
            .unwrap();
        assert_eq!(client.embed_calls(), calls);
        assert_eq!(record.cache.unwrap().misses, 0);
    }
}
