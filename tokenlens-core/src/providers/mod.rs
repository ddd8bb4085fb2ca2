//! Model query clients.
//!
//! Defines the `ModelClient` trait the attributors drive, with an
//! OpenAI-compatible HTTP implementation and an in-process mock.

pub mod mock;
pub mod openai_compat;

pub use mock::MockModelClient;
pub use openai_compat::OpenAiCompatibleClient;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::LlmConfig;
use crate::error::ServiceError;

/// The two external calls an attribution run needs.
///
/// Implementations do not retry; callers decide whether a failure aborts the
/// run or only skips one item.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Embed a string with the configured embedding model.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ServiceError>;

    /// Complete a single user message at temperature 0 with a bounded output length.
    async fn complete(&self, text: &str) -> Result<String, ServiceError>;

    /// Identifier of the completion model.
    fn completion_model(&self) -> &str;

    /// Identifier of the embedding model.
    fn embedding_model(&self) -> &str;
}

/// Create the HTTP client for a configuration and an already-resolved key.
pub fn create_client(
    config: &LlmConfig,
    api_key: String,
) -> Result<Arc<dyn ModelClient>, ServiceError> {
    Ok(Arc::new(OpenAiCompatibleClient::new(config, api_key)?))
}
