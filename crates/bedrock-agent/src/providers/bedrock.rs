use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use super::base::{Completion, Provider};
use super::configs::{
    BedrockProviderConfig, BEDROCK_DEFAULT_MAX_TOKENS, BEDROCK_DEFAULT_TEMPERATURE,
};
use super::errors::ProviderError;
use super::utils::{
    converse_response_to_completion, messages_to_converse_spec, tools_to_converse_spec,
};
use crate::models::message::Message;
use crate::models::tool::Tool;

/// Mistral on Amazon Bedrock, through the Converse API
pub struct BedrockProvider {
    client: Client,
    config: BedrockProviderConfig,
}

impl BedrockProvider {
    pub fn new(config: BedrockProviderConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &BedrockProviderConfig {
        &self.config
    }

    fn converse_url(&self) -> String {
        format!(
            "{}/model/{}/converse",
            self.config.host(),
            urlencoding::encode(&self.config.model_id)
        )
    }

    async fn post(&self, payload: Value) -> Result<Value, ProviderError> {
        let url = self.converse_url();

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        match status {
            StatusCode::OK => serde_json::from_str(&body).map_err(|e| {
                ProviderError::MalformedResponse(format!("response is not JSON: {}", e))
            }),
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
                Err(ProviderError::Server {
                    status: status.as_u16(),
                    body,
                })
            }
            status if status.is_server_error() => Err(ProviderError::Server {
                status: status.as_u16(),
                body,
            }),
            _ => Err(ProviderError::Request {
                status: status.as_u16(),
                body,
            }),
        }
    }
}

#[async_trait]
impl Provider for BedrockProvider {
    async fn complete(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
    ) -> Result<Completion, ProviderError> {
        let mut payload = json!({
            "messages": messages_to_converse_spec(messages),
            "system": [{ "text": system }],
            "inferenceConfig": {
                "maxTokens": self.config.max_tokens.unwrap_or(BEDROCK_DEFAULT_MAX_TOKENS),
                "temperature": self.config.temperature.unwrap_or(BEDROCK_DEFAULT_TEMPERATURE),
            },
        });

        if !tools.is_empty() {
            if let Some(object) = payload.as_object_mut() {
                object.insert("toolConfig".to_string(), tools_to_converse_spec(tools));
            }
        }

        debug!(
            target: "bedrock",
            model = %self.config.model_id,
            messages = messages.len(),
            tools = tools.len(),
            "Sending converse request"
        );

        let response = self.post(payload).await?;
        converse_response_to_completion(&response)
    }
}
