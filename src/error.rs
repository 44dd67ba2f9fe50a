//! Error types shared by the dispatch pipeline.

use thiserror::Error;

const REJECTED_TOKEN_CODES: [i64; 2] = [99991663, 99991668];

/// Errors returned by the chat-platform gateway.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The open platform answered with a non-zero business code.
    #[error("API error ({code}): {message}")]
    Api {
        code: i64,
        message: String,
        status: u16,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl GatewayError {
    pub fn api(code: i64, message: impl Into<String>, status: u16) -> Self {
        Self::Api {
            code,
            message: message.into(),
            status,
        }
    }

    /// The platform refused our tenant token, either at the HTTP layer or
    /// with one of its invalid/expired access token codes.
    pub fn is_auth_rejection(&self) -> bool {
        match self {
            Self::Api { code, status, .. } => {
                matches!(status, 401 | 403) || REJECTED_TOKEN_CODES.contains(code)
            }
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue rejected message ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("queue is closed")]
    Closed,
}

/// Coarse classification used for logging and for the HTTP status mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Routing,
    Validation,
    Integration,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Routing => "routing_error",
            ErrorKind::Validation => "validation_error",
            ErrorKind::Integration => "integration_error",
            ErrorKind::Internal => "internal_error",
        }
    }
}

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("{0}")]
    Routing(String),

    #[error("{0}")]
    Validation(String),

    #[error("no case found for conversation {0}")]
    CaseNotFound(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("case store error: {0}")]
    Store(String),

    #[error("internal failure: {0}")]
    Internal(String),
}

impl BridgeError {
    pub fn unknown_message_type(raw: &str) -> Self {
        Self::Routing(format!("unknown message type: {raw}"))
    }

    pub fn unmatched_action(raw: &str) -> Self {
        Self::Routing(format!("failed to match action handler: {raw}"))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Routing(_) => ErrorKind::Routing,
            Self::Validation(_) => ErrorKind::Validation,
            Self::CaseNotFound(_)
            | Self::Gateway(_)
            | Self::Queue(_)
            | Self::Store(_) => ErrorKind::Integration,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
