use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification of a failed request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Connect,
    Status(u16),
    Decode,
    Shape,
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("cannot reach {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("server answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("cannot decode response: {0}")]
    Decode(String),

    #[error("shape mismatch: {0}")]
    Shape(String),
}

impl ClientError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ClientError::Timeout { .. } => FailureKind::Timeout,
            ClientError::Connect { .. } => FailureKind::Connect,
            ClientError::Status { status, .. } => FailureKind::Status(*status),
            ClientError::Decode(_) => FailureKind::Decode,
            ClientError::Shape(_) => FailureKind::Shape,
        }
    }

    /// Transport failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), FailureKind::Timeout | FailureKind::Connect)
    }

    pub(crate) fn transport(url: &str, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            ClientError::Timeout {
                url: url.to_string(),
            }
        } else if source.is_decode() || source.is_body() {
            ClientError::Decode(source.to_string())
        } else {
            ClientError::Connect {
                url: url.to_string(),
                source,
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
