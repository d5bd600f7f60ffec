//! Chat relay request types.

use serde::{Deserialize, Serialize};

use crate::credentials::ApiKeys;
use crate::error::{Error, Result};
use crate::llm::Message;

/// Body of `POST /api/chat`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    /// Per-request keys; non-blank values override server defaults.
    #[serde(rename = "apiKeys", default, skip_serializing_if = "Option::is_none")]
    pub api_keys: Option<ApiKeys>,
}

impl ChatRequest {
    /// Parse and validate a raw request body.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        let request: ChatRequest = serde_json::from_slice(body)
            .map_err(|e| Error::InvalidRequest(format!("malformed body: {}", e)))?;

        if request.messages.is_empty() {
            return Err(Error::InvalidRequest(
                "messages must contain at least one message".to_string(),
            ));
        }
        Ok(request)
    }
}
