//! Error types for chatrelay.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use crate::credentials::ProviderKind;

/// Result type alias for chatrelay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for chatrelay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(
        "At least one provider API key (anthropicApiKey, openaiApiKey, groqApiKey or \
         openRouterApiKey) must be supplied in the request or configured on the server"
    )]
    MissingCredential,

    #[error("Provider '{provider}' call failed: {message}")]
    ProviderCall {
        provider: ProviderKind,
        message: String,
    },

    #[error("Cannot continue message: maximum segments reached ({segments})")]
    ContinuationLimitExceeded { segments: u32 },

    #[error("Stream state error: {0}")]
    StreamState(&'static str),

    #[error("Upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a failed provider call.
    pub fn provider(provider: ProviderKind, message: impl Into<String>) -> Self {
        Error::ProviderCall {
            provider,
            message: message.into(),
        }
    }

    /// HTTP status for this error. Only the credential precondition is a 400.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::MissingCredential => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short, stable title used as the `error` field of the envelope.
    pub fn title(&self) -> &'static str {
        match self {
            Error::MissingCredential => "Missing API key",
            Error::ProviderCall { .. } | Error::Upstream(_) => "Provider call failed",
            Error::ContinuationLimitExceeded { .. } => "Continuation limit exceeded",
            Error::StreamState(_) => "Stream state error",
            Error::InvalidRequest(_) => "Invalid request",
            Error::Internal(_) => "Internal server error",
        }
    }
}

/// JSON error body returned by the relay: `{ "error": ..., "details": ... }`.
#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorEnvelope {
    pub error: String,
    pub details: String,
}

impl From<&Error> for ErrorEnvelope {
    fn from(err: &Error) -> Self {
        Self {
            error: err.title().to_string(),
            details: err.to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, axum::Json(ErrorEnvelope::from(&self))).into_response()
    }
}
