//! Configuration system for TokenLens.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> overrides.
//! Configuration is loaded from `~/.config/tokenlens/config.toml` and/or `.tokenlens/config.toml`
//! in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;

/// Top-level configuration for an attribution session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttributionConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub tokenizer: TokenizerConfig,
    #[serde(default)]
    pub cosine: CosineConfig,
    #[serde(default)]
    pub shapley: ShapleyConfig,
    #[serde(default)]
    pub batch: BatchConfig,
}

/// Language-model service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible API.
    pub base_url: String,
    /// Chat model used for completions (Shapley method).
    pub completion_model: String,
    /// Embedding model used by the cosine method.
    pub embedding_model: String,
    /// Environment variable consulted when no key is passed explicitly.
    pub api_key_env: String,
    /// System message sent ahead of every completion.
    pub system_prompt: String,
    /// Completion length cap. Bounds cost, not correctness.
    pub max_output_tokens: usize,
    /// Sampling temperature; attribution assumes 0.
    pub temperature: f32,
    /// Per-request timeout.
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            completion_model: "gpt-3.5-turbo".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            system_prompt: "You are a helpful assistant.".to_string(),
            max_output_tokens: 20,
            temperature: 0.0,
            request_timeout_secs: 60,
        }
    }
}

impl LlmConfig {
    /// Validate this LLM config and return any warnings.
    ///
    /// Returns an empty Vec if the config is valid. Warnings never block a run.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.temperature != 0.0 {
            warnings.push(format!(
                "temperature is {}; attribution scores assume deterministic completions (0.0)",
                self.temperature
            ));
        }
        if self.max_output_tokens == 0 {
            warnings.push("max_output_tokens is 0; every completion will be empty".to_string());
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            warnings.push(format!("base_url '{}' is not an http(s) URL", self.base_url));
        }
        if self.request_timeout_secs == 0 {
            warnings.push("request_timeout_secs is 0; requests will time out immediately".into());
        }
        warnings
    }
}

/// Tokenizer selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenizerConfig {
    /// Explicit encoding name (e.g. "cl100k_base"). When unset, the encoding
    /// is derived from the completion model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

/// Settings for the cosine-drop attributor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CosineConfig {
    /// Truncate the prompt to this many tokens before scoring.
    #[serde(
        default = "default_cosine_max_tokens",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_tokens: Option<usize>,
    /// Token texts (after trimming) that are never scored.
    #[serde(default = "default_cosine_stoplist")]
    pub stoplist: Vec<String>,
}

fn default_cosine_max_tokens() -> Option<usize> {
    Some(50)
}

fn default_cosine_stoplist() -> Vec<String> {
    ["", " ", ".", ",", "!", "?"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for CosineConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_cosine_max_tokens(),
            stoplist: default_cosine_stoplist(),
        }
    }
}

/// Settings for the sampled-Shapley attributor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShapleyConfig {
    /// Optional prompt truncation (none by default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
    /// Coalition sample budget per prompt.
    #[serde(default = "default_max_samples")]
    pub max_samples: usize,
    /// Marginal-contribution probes per significant token.
    #[serde(default = "default_max_marginal_samples")]
    pub max_marginal_samples: usize,
    /// Keep only the first N significant tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_significant_tokens: Option<usize>,
    /// Lowercased token texts that are never ablated.
    #[serde(default = "default_shapley_stopwords")]
    pub stopwords: Vec<String>,
    /// Fixed RNG seed for reproducible coalition sampling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

fn default_max_samples() -> usize {
    20
}

fn default_max_marginal_samples() -> usize {
    3
}

fn default_shapley_stopwords() -> Vec<String> {
    [
        " ", ".", ",", "!", "?", ":", ";", ")", "(", "\"", "'", "-", "_", "the", "a", "an", "and",
        "of", "to", "in", "is", "that", "for",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for ShapleyConfig {
    fn default() -> Self {
        Self {
            max_tokens: None,
            max_samples: default_max_samples(),
            max_marginal_samples: default_max_marginal_samples(),
            max_significant_tokens: None,
            stopwords: default_shapley_stopwords(),
            seed: None,
        }
    }
}

/// Politeness throttle between batch submissions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_cosine_delay_ms")]
    pub cosine_delay_ms: u64,
    #[serde(default = "default_shapley_delay_ms")]
    pub shapley_delay_ms: u64,
}

fn default_cosine_delay_ms() -> u64 {
    200
}

fn default_shapley_delay_ms() -> u64 {
    500
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            cosine_delay_ms: default_cosine_delay_ms(),
            shapley_delay_ms: default_shapley_delay_ms(),
        }
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `TOKENLENS_`)
/// 3. Workspace-local config (`.tokenlens/config.toml`)
/// 4. User config (`~/.config/tokenlens/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&AttributionConfig>,
) -> Result<AttributionConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(AttributionConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("dev", "tokenlens", "tokenlens") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".tokenlens").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // TOKENLENS_LLM__COMPLETION_MODEL, TOKENLENS_SHAPLEY__MAX_SAMPLES, etc.
    figment = figment.merge(Env::prefixed("TOKENLENS_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

/// Render a configuration as TOML, for `config show`.
pub fn to_toml_string(config: &AttributionConfig) -> Result<String, ConfigError> {
    toml::to_string_pretty(config).map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })
}

/// Resolve the credential for a run.
///
/// An explicit non-blank key wins; otherwise the variable named by
/// `llm.api_key_env` is consulted. Blank values count as missing.
pub fn resolve_api_key(explicit: Option<&str>, llm: &LlmConfig) -> Result<String, ConfigError> {
    if let Some(key) = explicit.map(str::trim).filter(|k| !k.is_empty()) {
        return Ok(key.to_string());
    }
    std::env::var(&llm.api_key_env)
        .ok()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .ok_or_else(|| ConfigError::MissingCredential {
            var: llm.api_key_env.clone(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AttributionConfig::default();
        assert_eq!(config.llm.completion_model, "gpt-3.5-turbo");
        assert_eq!(config.llm.embedding_model, "text-embedding-3-small");
        assert_eq!(config.llm.max_output_tokens, 20);
        assert_eq!(config.llm.temperature, 0.0);
        assert_eq!(config.cosine.max_tokens, Some(50));
        assert_eq!(config.shapley.max_samples, 20);
        assert_eq!(config.shapley.max_marginal_samples, 3);
        assert!(config.shapley.max_tokens.is_none());
        assert_eq!(config.batch.cosine_delay_ms, 200);
        assert_eq!(config.batch.shapley_delay_ms, 500);
    }

    #[test]
    fn test_default_stoplists() {
        let config = AttributionConfig::default();
        assert!(config.cosine.stoplist.contains(&".".to_string()));
        assert!(config.cosine.stoplist.contains(&String::new()));
        assert!(config.shapley.stopwords.contains(&"the".to_string()));
        assert!(config.shapley.stopwords.contains(&"(".to_string()));
        assert!(!config.shapley.stopwords.contains(&"fox".to_string()));
    }

    #[test]
    fn test_default_config_validates_clean() {
        assert!(LlmConfig::default().validate().is_empty());
    }

    #[test]
    fn test_validate_warns_on_nonzero_temperature() {
        let config = LlmConfig {
            temperature: 0.7,
            ..Default::default()
        };
        let warnings = config.validate();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("temperature"));
    }

    #[test]
    fn test_validate_warns_on_bad_url() {
        let config = LlmConfig {
            base_url: "api.openai.com".into(),
            ..Default::default()
        };
        assert!(config.validate().iter().any(|w| w.contains("base_url")));
    }

    #[test]
    fn test_config_deserialize_partial() {
        let toml_str = r#"
[llm]
base_url = "http://localhost:11434/v1"
completion_model = "llama3.1:8b"
embedding_model = "nomic-embed-text"
api_key_env = "OLLAMA_KEY"
system_prompt = "Be brief."
max_output_tokens = 10
temperature = 0.0
request_timeout_secs = 30

[shapley]
max_samples = 8
seed = 7
"#;
        let config: AttributionConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.llm.completion_model, "llama3.1:8b");
        assert_eq!(config.shapley.max_samples, 8);
        assert_eq!(config.shapley.seed, Some(7));
        // Unset fields keep their defaults
        assert_eq!(config.shapley.max_marginal_samples, 3);
        assert_eq!(config.cosine.max_tokens, Some(50));
    }

    #[test]
    fn test_load_config_workspace_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_dir = dir.path().join(".tokenlens");
        std::fs::create_dir_all(&cfg_dir).unwrap();
        std::fs::write(
            cfg_dir.join("config.toml"),
            "[cosine]\nmax_tokens = 12\n\n[batch]\ncosine_delay_ms = 5\n",
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.cosine.max_tokens, Some(12));
        assert_eq!(config.batch.cosine_delay_ms, 5);
        assert_eq!(config.batch.shapley_delay_ms, 500);
    }

    #[test]
    fn test_load_config_overrides_win() {
        let dir = tempfile::tempdir().unwrap();
        let mut overrides = AttributionConfig::default();
        overrides.shapley.max_samples = 4;
        let config = load_config(Some(dir.path()), Some(&overrides)).unwrap();
        assert_eq!(config.shapley.max_samples, 4);
    }

    #[test]
    fn test_to_toml_string_roundtrip() {
        let config = AttributionConfig::default();
        let rendered = to_toml_string(&config).unwrap();
        let parsed: AttributionConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.llm.completion_model, config.llm.completion_model);
        assert_eq!(parsed.cosine.stoplist, config.cosine.stoplist);
    }

    #[test]
    fn test_resolve_api_key_explicit_wins() {
        let llm = LlmConfig {
            api_key_env: "TOKENLENS_TEST_KEY_UNUSED".into(),
            ..Default::default()
        };
        let key = resolve_api_key(Some("  sk-explicit  "), &llm).unwrap();
        assert_eq!(key, "sk-explicit");
    }

    #[test]
    fn test_resolve_api_key_from_env() {
        // SAFETY: test-only env var manipulation
        unsafe { std::env::set_var("TOKENLENS_TEST_KEY_PRESENT", "sk-env") };
        let llm = LlmConfig {
            api_key_env: "TOKENLENS_TEST_KEY_PRESENT".into(),
            ..Default::default()
        };
        assert_eq!(resolve_api_key(None, &llm).unwrap(), "sk-env");
        // SAFETY: test-only env var manipulation
        unsafe { std::env::remove_var("TOKENLENS_TEST_KEY_PRESENT") };
    }

    #[test]
    fn test_resolve_api_key_blank_is_missing() {
        // SAFETY: test-only env var manipulation
        unsafe { std::env::remove_var("TOKENLENS_TEST_KEY_MISSING") };
        let llm = LlmConfig {
            api_key_env: "TOKENLENS_TEST_KEY_MISSING".into(),
            ..Default::default()
        };
        let err = resolve_api_key(Some("   "), &llm).unwrap_err();
        match err {
            ConfigError::MissingCredential { var } => {
                assert_eq!(var, "TOKENLENS_TEST_KEY_MISSING")
            }
            other => panic!("Expected MissingCredential, got {:?}", other),
        }
    }
}
