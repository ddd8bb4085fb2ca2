//! # TokenLens Core
//!
//! Core library for TokenLens token attribution.
//! Provides the tokenizer adapter, model query clients, the coalition cache,
//! the cosine-drop and sampled-Shapley attributors, result records, report
//! writers, sessions, configuration and error types.

pub mod attribution;
pub mod cache;
pub mod config;
pub mod error;
pub mod progress;
pub mod providers;
pub mod record;
pub mod report;
pub mod session;
pub mod tokenizer;

// Re-export commonly used types at the crate root.
pub use attribution::{
    Attributor, CosineAttributor, DivergenceMetric, LengthDivergence, SamplingPlan,
    ShapleyAttributor,
};
pub use cache::{CacheKey, CacheStats, CoalitionCache};
pub use config::{AttributionConfig, LlmConfig, load_config, resolve_api_key};
pub use error::{
    AttributionError, ConfigError, Result, ServiceError, TokenLensError, TokenizationError,
};
pub use progress::{ProgressEvent, ProgressSink, RunProgress, RunStage};
pub use providers::{MockModelClient, ModelClient, OpenAiCompatibleClient, create_client};
pub use record::{AttributionMethod, ResultRecord, TokenAttribution};
pub use report::{ReportFormat, write_json_report, write_text_report, write_token_breakdown};
pub use session::{
    AttributionSession, BatchOutcome, RunStatus, run_cosine_attribution, run_shapley_attribution,
};
pub use tokenizer::{Token, TokenId, TokenizerAdapter};
