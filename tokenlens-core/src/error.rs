//! Error types for the TokenLens attribution engine.
//!
//! Uses `thiserror` for public API error types, with one structured enum per
//! failure domain: configuration, the external model service, the tokenizer,
//! and the attribution run itself.

/// Top-level error type for the TokenLens core library.
#[derive(Debug, thiserror::Error)]
pub enum TokenLensError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Tokenization error: {0}")]
    Tokenization(#[from] TokenizationError),

    #[error("Attribution error: {0}")]
    Attribution(#[from] AttributionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised before a run starts, while resolving settings or credentials.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("No API key provided and environment variable {var} is not set")]
    MissingCredential { var: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },

    #[error("Unknown tokenizer encoding: {name}")]
    UnknownEncoding { name: String },
}

/// Errors from the external embedding / completion service.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    #[error("API request failed: {message}")]
    ApiRequest { message: String },

    #[error("API response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Provider connection failed: {message}")]
    Connection { message: String },
}

/// Errors from the BPE tokenizer backend.
#[derive(Debug, thiserror::Error)]
pub enum TokenizationError {
    #[error("Failed to decode token ids: {message}")]
    Decode { message: String },
}

/// A run finished without producing a usable result.
#[derive(Debug, thiserror::Error)]
pub enum AttributionError {
    #[error("Prompt is empty")]
    EmptyPrompt,

    #[error("No significant tokens left after filtering")]
    NoSignificantTokens,

    #[error("All {attempted} token perturbations failed")]
    AllTokensFailed { attempted: usize },

    #[error("Run aborted: {message}")]
    Aborted { message: String },
}

/// A type alias for results using the top-level `TokenLensError`.
pub type Result<T> = std::result::Result<T, TokenLensError>;

impl TokenLensError {
    /// Short message suitable for a status line.
    ///
    /// Long provider bodies are clipped so a failed run never floods the output.
    pub fn user_message(&self) -> String {
        let full = self.to_string();
        if full.chars().count() > 120 {
            let clipped: String = full.chars().take(117).collect();
            format!("{clipped}...")
        } else {
            full
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_config() {
        let err = TokenLensError::Config(ConfigError::MissingCredential {
            var: "OPENAI_API_KEY".into(),
        });
        assert_eq!(
            err.to_string(),
            "Configuration error: No API key provided and environment variable OPENAI_API_KEY is not set"
        );
    }

    #[test]
    fn test_error_display_service() {
        let err = TokenLensError::Service(ServiceError::ApiRequest {
            message: "connection refused".into(),
        });
        assert_eq!(
            err.to_string(),
            "Service error: API request failed: connection refused"
        );
    }

    #[test]
    fn test_error_display_attribution() {
        let err = TokenLensError::Attribution(AttributionError::AllTokensFailed { attempted: 4 });
        assert_eq!(
            err.to_string(),
            "Attribution error: All 4 token perturbations failed"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: TokenLensError = io_err.into();
        assert!(matches!(err, TokenLensError::Io(_)));
    }

    #[test]
    fn test_error_from_serde() {
        let serde_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: TokenLensError = serde_err.into();
        assert!(matches!(err, TokenLensError::Serialization(_)));
    }

    #[test]
    fn test_service_error_variants() {
        let err = ServiceError::RateLimited {
            retry_after_secs: 60,
        };
        assert_eq!(err.to_string(), "Rate limited by provider, retry after 60s");

        let err = ServiceError::Timeout { timeout_secs: 30 };
        assert_eq!(err.to_string(), "Request timed out after 30s");
    }

    #[test]
    fn test_user_message_clips_long_errors() {
        let err = TokenLensError::Service(ServiceError::ApiRequest {
            message: "x".repeat(500),
        });
        let msg = err.user_message();
        assert_eq!(msg.chars().count(), 120);
        assert!(msg.ends_with("..."));
    }

    #[test]
    fn test_user_message_short_errors_untouched() {
        let err = TokenLensError::Attribution(AttributionError::EmptyPrompt);
        assert_eq!(err.user_message(), "Attribution error: Prompt is empty");
    }
}
