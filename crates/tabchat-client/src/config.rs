use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use tabchat_core::{ChatError, ChatResult};

/// Environment variable holding the default model identifier.
pub const ENV_DEFAULT_MODEL: &str = "TABCHAT_DEFAULT_MODEL";
/// Environment variable holding the fallback API key.
pub const ENV_FALLBACK_API_KEY: &str = "TABCHAT_FALLBACK_API_KEY";
/// Environment variable holding the default API base URL.
pub const ENV_API_BASE_URL: &str = "TABCHAT_API_BASE_URL";

/// Generation options sent with every completion request.
///
/// Unknown keys are rejected when deserializing so a misspelled option
/// fails loudly instead of being silently dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ModelSettings {
    /// Upper bound on generated tokens.
    #[serde(default = "default_max_tokens", alias = "max_tokens")]
    pub max_tokens: u32,
    /// Sampling temperature, 0 to 2.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Nucleus sampling mass, above 0 and at most 1.
    #[serde(default = "default_top_p", alias = "top_p")]
    pub top_p: f32,
    /// Top-k sampling; not sent when unset.
    #[serde(default, alias = "top_k", skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    /// Frequency penalty, -2 to 2.
    #[serde(default, alias = "frequency_penalty")]
    pub frequency_penalty: f32,
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    1.0
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: None,
            frequency_penalty: 0.0,
        }
    }
}

impl ModelSettings {
    /// Checks every option against the range providers accept.
    pub fn validate(&self) -> ChatResult<()> {
        if self.max_tokens == 0 {
            return Err(ChatError::Config("maxTokens must be positive".into()));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ChatError::Config(format!(
                "temperature {} outside [0, 2]",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(ChatError::Config(format!("topP {} outside (0, 1]", self.top_p)));
        }
        if !(-2.0..=2.0).contains(&self.frequency_penalty) {
            return Err(ChatError::Config(format!(
                "frequencyPenalty {} outside [-2, 2]",
                self.frequency_penalty
            )));
        }
        Ok(())
    }
}

/// One selectable model endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model identifier sent as `model` in streaming requests.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Base URL; `/chat/completions` is appended.
    #[serde(default)]
    pub base_url: String,
    /// Bearer credential.
    #[serde(default)]
    pub api_key: String,
    /// Whether image parts may be sent to this model.
    #[serde(default)]
    pub supports_attachments: bool,
    /// Sampling options.
    #[serde(default)]
    pub settings: ModelSettings,
}

impl ModelConfig {
    /// A model with default settings whose display name is its id.
    pub fn new(
        id: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            base_url: base_url.into(),
            api_key: api_key.into(),
            supports_attachments: false,
            settings: ModelSettings::default(),
        }
    }

    /// Builds the default model from environment values alone.
    pub fn from_env(env: &EnvConfig) -> ChatResult<Self> {
        let id = env
            .default_model
            .clone()
            .ok_or_else(|| ChatError::Config(format!("{ENV_DEFAULT_MODEL} is not set")))?;
        let mut config = Self::new(id, String::new(), String::new());
        config.apply_env_defaults(env);
        Ok(config)
    }

    /// Parses a model from a TOML table.
    pub fn from_toml_str(source: &str) -> ChatResult<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| ChatError::Config(format!("Invalid model config: {e}")))?;
        config.settings.validate()?;
        Ok(config)
    }

    /// Fills an empty base URL or API key from the environment.
    pub fn apply_env_defaults(&mut self, env: &EnvConfig) {
        if self.base_url.is_empty() {
            if let Some(url) = &env.api_base_url {
                self.base_url.clone_from(url);
            }
        }
        if self.api_key.is_empty() {
            if let Some(key) = &env.fallback_api_key {
                self.api_key.clone_from(key);
            }
        }
    }

    /// `Authorization` header value.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.api_key)
    }

    /// Full URL of the chat-completions endpoint.
    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

/// The shared "current model".
///
/// Swapping the model affects requests started afterwards only; every
/// request takes a [`ModelHandle::snapshot`] when it starts.
#[derive(Debug, Clone)]
pub struct ModelHandle {
    current: Arc<RwLock<Arc<ModelConfig>>>,
}

impl ModelHandle {
    /// Makes `config` the current model.
    pub fn new(config: ModelConfig) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// The configuration in effect right now.
    pub fn snapshot(&self) -> Arc<ModelConfig> {
        Arc::clone(&*self.current.read())
    }

    /// Replaces the current model and returns the previous one.
    pub fn set(&self, config: ModelConfig) -> Arc<ModelConfig> {
        tracing::info!(model = %config.id, base_url = %config.base_url, "Current model updated");
        std::mem::replace(&mut *self.current.write(), Arc::new(config))
    }
}

/// Defaults read from the process environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvConfig {
    /// `TABCHAT_DEFAULT_MODEL`.
    pub default_model: Option<String>,
    /// `TABCHAT_FALLBACK_API_KEY`.
    pub fallback_api_key: Option<String>,
    /// `TABCHAT_API_BASE_URL`.
    pub api_base_url: Option<String>,
}

impl EnvConfig {
    /// Reads the variables through `lookup`. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            default_model: read(ENV_DEFAULT_MODEL),
            fallback_api_key: read(ENV_FALLBACK_API_KEY),
            api_base_url: read(ENV_API_BASE_URL),
        }
    }

    /// Loads `.env` if present, then reads the process environment.
    pub fn load() -> Self {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "Loaded .env file");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Process-wide values, loaded on first use.
    pub fn global() -> &'static EnvConfig {
        static ENV: OnceLock<EnvConfig> = OnceLock::new();
        ENV.get_or_init(Self::load)
    }
}
