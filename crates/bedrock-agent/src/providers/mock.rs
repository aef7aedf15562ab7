use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use crate::models::message::Message;
use crate::models::tool::Tool;
use crate::providers::base::{Completion, Provider, StopReason};
use crate::providers::errors::ProviderError;

/// What the provider was asked for on one call
#[derive(Debug, Clone)]
pub struct MockRequest {
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<Tool>,
}

/// A mock provider that returns pre-configured responses for testing
#[derive(Clone)]
pub struct MockProvider {
    responses: Arc<Mutex<VecDeque<Result<Completion, ProviderError>>>>,
    requests: Arc<Mutex<Vec<MockRequest>>>,
}

impl MockProvider {
    /// Create a new mock provider with a sequence of responses
    pub fn new(responses: Vec<Completion>) -> Self {
        Self::with_results(responses.into_iter().map(Ok).collect())
    }

    /// Script failures as well as completions
    pub fn with_results(results: Vec<Result<Completion, ProviderError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(results.into())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<MockRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn complete(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
    ) -> Result<Completion, ProviderError> {
        self.requests.lock().unwrap().push(MockRequest {
            system: system.to_string(),
            messages: messages.to_vec(),
            tools: tools.to_vec(),
        });

        // Empty end of turn once the script runs out
        self.responses.lock().unwrap().pop_front().unwrap_or_else(|| {
            Ok(Completion::new(
                Message::assistant().with_text(""),
                StopReason::EndTurn,
            ))
        })
    }
}
