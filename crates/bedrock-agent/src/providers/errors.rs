use std::time::Duration;
use thiserror::Error;

use crate::retry::Retryable;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server error: {status} - {body}")]
    Server { status: u16, body: String },

    #[error("Request failed: {status} - {body}")]
    Request { status: u16, body: String },

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

impl Retryable for ProviderError {
    fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Http(_) | ProviderError::Server { .. } | ProviderError::Timeout(_) => {
                true
            }
            ProviderError::Request { .. } | ProviderError::MalformedResponse(_) => false,
        }
    }

    fn timed_out(after: Duration) -> Self {
        ProviderError::Timeout(after)
    }
}
