//! In-process model client for tests and offline runs.

use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::ModelClient;
use crate::error::ServiceError;

type EmbedFn = dyn Fn(&str) -> Result<Vec<f32>, ServiceError> + Send + Sync;
type CompleteFn = dyn Fn(&str) -> Result<String, ServiceError> + Send + Sync;

/// A `ModelClient` backed by plain functions, with per-call counters.
pub struct MockModelClient {
    embed_fn: Box<EmbedFn>,
    complete_fn: Box<CompleteFn>,
    embed_calls: AtomicUsize,
    complete_calls: AtomicUsize,
    completion_inputs: Mutex<Vec<String>>,
}

impl MockModelClient {
    pub fn new() -> Self {
        Self {
            embed_fn: Box::new(|text| Ok(vec![text.len() as f32, 1.0])),
            complete_fn: Box::new(|text| Ok(text.to_string())),
            embed_calls: AtomicUsize::new(0),
            complete_calls: AtomicUsize::new(0),
            completion_inputs: Mutex::new(Vec::new()),
        }
    }

    /// Replace the embedding function.
    pub fn with_embedder<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> Result<Vec<f32>, ServiceError> + Send + Sync + 'static,
    {
        self.embed_fn = Box::new(f);
        self
    }

    /// Replace the completion function.
    pub fn with_completer<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> Result<String, ServiceError> + Send + Sync + 'static,
    {
        self.complete_fn = Box::new(f);
        self
    }

    /// Always return the same completion text.
    pub fn with_response(text: &str) -> Self {
        let text = text.to_string();
        Self::new().with_completer(move |_| Ok(text.clone()))
    }

    pub fn embed_calls(&self) -> usize {
        self.embed_calls.load(Ordering::SeqCst)
    }

    pub fn complete_calls(&self) -> usize {
        self.complete_calls.load(Ordering::SeqCst)
    }

    /// Every user message sent to `complete`, in call order.
    pub fn completion_inputs(&self) -> Vec<String> {
        self.completion_inputs
            .lock()
            .map(|inputs| inputs.clone())
            .unwrap_or_default()
    }
}

impl Default for MockModelClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelClient for MockModelClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ServiceError> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        (self.embed_fn)(text)
    }

    async fn complete(&self, text: &str) -> Result<String, ServiceError> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut inputs) = self.completion_inputs.lock() {
            inputs.push(text.to_string());
        }
        (self.complete_fn)(text)
    }

    fn completion_model(&self) -> &str {
        "mock-model"
    }

    fn embedding_model(&self) -> &str {
        "mock-embedding"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_defaults() {
        let client = MockModelClient::new();
        assert_eq!(client.complete("echo").await.unwrap(), "echo");
        assert_eq!(client.embed("abc").await.unwrap(), vec![3.0, 1.0]);
        assert_eq!(client.complete_calls(), 1);
        assert_eq!(client.embed_calls(), 1);
    }

    #[tokio::test]
    async fn test_mock_with_response_records_inputs() {
        let client = MockModelClient::with_response("fixed");
        assert_eq!(client.complete("a").await.unwrap(), "fixed");
        assert_eq!(client.complete("b").await.unwrap(), "fixed");
        assert_eq!(client.completion_inputs(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_mock_errors_propagate() {
        let client = MockModelClient::new().with_embedder(|_| {
            Err(ServiceError::Connection {
                message: "offline".into(),
            })
        });
        assert!(client.embed("x").await.is_err());
        assert_eq!(client.embed_calls(), 1);
    }
}
