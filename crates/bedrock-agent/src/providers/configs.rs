use serde::{Deserialize, Serialize};

pub const BEDROCK_DEFAULT_REGION: &str = "us-west-2";
pub const BEDROCK_DEFAULT_MODEL: &str = "mistral.mistral-large-2407-v1:0";
pub const BEDROCK_DEFAULT_MAX_TOKENS: i32 = 8192;
pub const BEDROCK_DEFAULT_TEMPERATURE: f32 = 0.7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BedrockProviderConfig {
    pub region: String,
    pub model_id: String,
    /// Bedrock API key, sent as a bearer token
    pub api_key: String,
    /// Overrides the regional bedrock-runtime endpoint
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<i32>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl BedrockProviderConfig {
    pub fn new<R: Into<String>, M: Into<String>, K: Into<String>>(
        region: R,
        model_id: M,
        api_key: K,
    ) -> Self {
        Self {
            region: region.into(),
            model_id: model_id.into(),
            api_key: api_key.into(),
            host: None,
            max_tokens: Some(BEDROCK_DEFAULT_MAX_TOKENS),
            temperature: Some(BEDROCK_DEFAULT_TEMPERATURE),
        }
    }

    pub fn host(&self) -> String {
        match &self.host {
            Some(host) => host.trim_end_matches('/').to_string(),
            None => format!("https://bedrock-runtime.{}.amazonaws.com", self.region),
        }
    }
}
