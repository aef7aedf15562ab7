use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::agent::{AgentConfig, DEFAULT_SYSTEM_PROMPT, EMPTY_RESPONSE};
use crate::providers::configs::{
    BedrockProviderConfig, BEDROCK_DEFAULT_MODEL, BEDROCK_DEFAULT_REGION,
};
use crate::retry::RetryPolicy;
use crate::systems::SystemConfig;

pub const ENV_PREFIX: &str = "BEDROCK_AGENT";
/// Where Bedrock API keys are conventionally exported
pub const BEDROCK_API_KEY_ENV: &str = "AWS_BEARER_TOKEN_BEDROCK";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration, set {env_var}")]
    MissingEnvVar { env_var: String },

    #[error("Invalid value for {key}: {message}")]
    Invalid { key: String, message: String },

    #[error(transparent)]
    Other(#[from] config::ConfigError),
}

/// The environment variable that sets a dotted config key
pub fn to_env_var(key: &str) -> String {
    format!("{}_{}", ENV_PREFIX, key.replace('.', "__").to_uppercase())
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSettings {
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_model")]
    pub model_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<i32>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            region: default_region(),
            model_id: default_model(),
            api_key: String::new(),
            host: None,
            max_tokens: None,
            temperature: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Seconds
    #[serde(default)]
    pub endpoint_timeout: Option<f64>,
    /// Seconds
    #[serde(default)]
    pub tool_timeout: Option<f64>,
    #[serde(default)]
    pub response_tags: Option<(String, String)>,
    #[serde(default = "default_empty_response")]
    pub empty_response: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            endpoint_timeout: None,
            tool_timeout: None,
            response_tags: None,
            empty_response: default_empty_response(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetrySettings {
    #[serde(default)]
    pub endpoint: RetryPolicy,
    #[serde(default)]
    pub tool: RetryPolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub provider: ProviderSettings,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub systems: Vec<SystemConfig>,
}

impl Settings {
    /// Load from defaults and the environment
    pub fn new() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from defaults, a TOML file, then the environment
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::load(Some(path.as_ref()))
    }

    fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let mut builder = Config::builder()
            .set_default("provider.region", default_region())?
            .set_default("provider.model_id", default_model())?;

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut settings: Settings = match config.try_deserialize() {
            Ok(settings) => settings,
            Err(err) => {
                tracing::debug!("Configuration error: {:?}", &err);

                let error_str = err.to_string();
                return if let Some(field) = missing_field(&error_str) {
                    Err(ConfigError::MissingEnvVar {
                        env_var: to_env_var(field),
                    })
                } else if let config::ConfigError::NotFound(field) = &err {
                    Err(ConfigError::MissingEnvVar {
                        env_var: to_env_var(field),
                    })
                } else {
                    Err(ConfigError::Other(err))
                };
            }
        };

        if settings.provider.api_key.is_empty() {
            settings.provider.api_key = std::env::var(BEDROCK_API_KEY_ENV).unwrap_or_default();
        }
        if settings.provider.api_key.is_empty() {
            return Err(ConfigError::MissingEnvVar {
                env_var: to_env_var("provider.api_key"),
            });
        }

        for (key, value) in [
            ("agent.endpoint_timeout", settings.agent.endpoint_timeout),
            ("agent.tool_timeout", settings.agent.tool_timeout),
        ] {
            if let Some(secs) = value {
                seconds(key, secs)?;
            }
        }

        Ok(settings)
    }

    pub fn provider_config(&self) -> BedrockProviderConfig {
        BedrockProviderConfig {
            region: self.provider.region.clone(),
            model_id: self.provider.model_id.clone(),
            api_key: self.provider.api_key.clone(),
            host: self.provider.host.clone(),
            max_tokens: self.provider.max_tokens,
            temperature: self.provider.temperature,
        }
    }

    pub fn agent_config(&self) -> Result<AgentConfig, ConfigError> {
        let timeout = |key: &str, value: Option<f64>| value.map(|secs| seconds(key, secs)).transpose();

        Ok(AgentConfig {
            system_prompt: self.agent.system_prompt.clone(),
            endpoint_retry: self.retry.endpoint,
            tool_retry: self.retry.tool,
            endpoint_timeout: timeout("agent.endpoint_timeout", self.agent.endpoint_timeout)?,
            tool_timeout: timeout("agent.tool_timeout", self.agent.tool_timeout)?,
            response_tags: self.agent.response_tags.clone(),
            empty_response: self.agent.empty_response.clone(),
        })
    }

    /// Everything needed to build a provider, an agent and its systems
    pub fn into_parts(
        self,
    ) -> Result<(BedrockProviderConfig, AgentConfig, Vec<SystemConfig>), ConfigError> {
        let provider = self.provider_config();
        let agent = self.agent_config()?;
        Ok((provider, agent, self.systems))
    }
}

fn seconds(key: &str, secs: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::Invalid {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Extract the field name from serde's "missing field `name`" message
fn missing_field(message: &str) -> Option<&str> {
    let rest = message.split("missing field `").nth(1)?;
    rest.split('`').next()
}

fn default_region() -> String {
    BEDROCK_DEFAULT_REGION.to_string()
}

fn default_model() -> String {
    BEDROCK_DEFAULT_MODEL.to_string()
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_empty_response() -> String {
    EMPTY_RESPONSE.to_string()
}
