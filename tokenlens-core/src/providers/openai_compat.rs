//! OpenAI-compatible model client.
//!
//! Talks to any endpoint that follows the OpenAI chat completions and
//! embeddings API format (OpenAI, Azure OpenAI, Ollama, vLLM, LM Studio).

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

use super::ModelClient;
use crate::config::LlmConfig;
use crate::error::ServiceError;

/// OpenAI-compatible client for embeddings and chat completions.
pub struct OpenAiCompatibleClient {
    client: Client,
    base_url: String,
    api_key: String,
    completion_model: String,
    embedding_model: String,
    system_prompt: String,
    max_output_tokens: usize,
    temperature: f32,
    timeout_secs: u64,
}

impl std::fmt::Debug for OpenAiCompatibleClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // api_key must never reach logs
        f.debug_struct("OpenAiCompatibleClient")
            .field("base_url", &self.base_url)
            .field("completion_model", &self.completion_model)
            .field("embedding_model", &self.embedding_model)
            .finish()
    }
}

impl OpenAiCompatibleClient {
    /// Create a client with an explicitly provided API key.
    pub fn new(config: &LlmConfig, api_key: String) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ServiceError::Connection {
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            completion_model: config.completion_model.clone(),
            embedding_model: config.embedding_model.clone(),
            system_prompt: config.system_prompt.clone(),
            max_output_tokens: config.max_output_tokens,
            temperature: config.temperature,
            timeout_secs: config.request_timeout_secs,
        })
    }

    /// Build the chat completion request body for one user message.
    fn completion_body(&self, text: &str) -> Value {
        json!({
            "model": self.completion_model,
            "messages": [
                { "role": "system", "content": self.system_prompt },
                { "role": "user", "content": text },
            ],
            "temperature": self.temperature,
            "max_tokens": self.max_output_tokens,
            "stream": false,
        })
    }

    /// Extract the assistant text from a chat completion body.
    ///
    /// A `null` content (e.g. a filtered response) is treated as empty output.
    fn parse_completion(body: &Value) -> Result<String, ServiceError> {
        let message = body
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .ok_or_else(|| ServiceError::ResponseParse {
                message: "No message in completion response".to_string(),
            })?;

        Ok(message
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or("")
            .to_string())
    }

    /// Extract the first embedding vector from an embeddings body.
    fn parse_embedding(body: &Value) -> Result<Vec<f32>, ServiceError> {
        let values = body["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| ServiceError::ResponseParse {
                message: "No embedding in response".to_string(),
            })?;

        let embedding: Vec<f32> = values
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();

        if embedding.len() != values.len() || embedding.is_empty() {
            return Err(ServiceError::ResponseParse {
                message: "Embedding contains non-numeric or no values".to_string(),
            });
        }
        Ok(embedding)
    }

    /// Map an HTTP status code to the appropriate ServiceError.
    fn map_http_error(status: reqwest::StatusCode, body: &str) -> ServiceError {
        match status.as_u16() {
            401 => {
                debug!(body = %body, "Authentication failed (401)");
                ServiceError::AuthFailed {
                    provider: "OpenAI-compatible".to_string(),
                }
            }
            429 => {
                // "Rate limit reached ... Please try again in 20s."
                let retry_secs = serde_json::from_str::<Value>(body)
                    .ok()
                    .and_then(|v| {
                        v.get("error")?
                            .get("message")?
                            .as_str()
                            .map(|s| s.to_string())
                    })
                    .and_then(|msg| {
                        msg.split("in ").last().and_then(|s| {
                            s.trim_end_matches('.')
                                .trim_end_matches('s')
                                .parse::<u64>()
                                .ok()
                        })
                    })
                    .unwrap_or(5);
                ServiceError::RateLimited {
                    retry_after_secs: retry_secs,
                }
            }
            status if status >= 500 => ServiceError::ApiRequest {
                message: format!("Server error ({}): {}", status, body),
            },
            _ => ServiceError::ApiRequest {
                message: format!("HTTP {}: {}", status, body),
            },
        }
    }

    fn map_transport_error(&self, e: reqwest::Error) -> ServiceError {
        if e.is_timeout() {
            ServiceError::Timeout {
                timeout_secs: self.timeout_secs,
            }
        } else if e.is_connect() {
            ServiceError::Connection {
                message: e.to_string(),
            }
        } else {
            ServiceError::ApiRequest {
                message: format!("Request failed: {}", e),
            }
        }
    }

    async fn post_json(&self, url: &str, body: &Value) -> Result<Value, ServiceError> {
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        let response_body = response
            .text()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        if !status.is_success() {
            return Err(Self::map_http_error(status, &response_body));
        }

        serde_json::from_str(&response_body).map_err(|e| ServiceError::ResponseParse {
            message: format!("Invalid JSON: {}", e),
        })
    }
}

#[async_trait]
impl ModelClient for OpenAiCompatibleClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ServiceError> {
        let url = format!("{}/embeddings", self.base_url);
        let body = json!({
            "model": self.embedding_model,
            "input": [text],
        });
        debug!(model = %self.embedding_model, chars = text.len(), "Requesting embedding");
        let json = self.post_json(&url, &body).await?;
        Self::parse_embedding(&json)
    }

    async fn complete(&self, text: &str) -> Result<String, ServiceError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.completion_body(text);
        debug!(model = %self.completion_model, chars = text.len(), "Requesting completion");
        let json = self.post_json(&url, &body).await?;
        Self::parse_completion(&json)
    }

    fn completion_model(&self) -> &str {
        &self.completion_model
    }

    fn embedding_model(&self) -> &str {
        &self.embedding_model
    }
}
