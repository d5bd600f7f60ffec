//! HTTP relay module.
//!
//! This module provides the chat relay endpoint that streams provider
//! output to the client and continues truncated generations in place.

pub mod continuation;
mod handlers;
mod server;
pub mod stream;
pub mod types;

pub use continuation::{ContinuationController, RelayOutcome, CONTINUE_PROMPT};
pub use handlers::{REQUEST_ID_HEADER, TEXT_CONTENT_TYPE};
pub use server::{create_router, run_server, AppState, RequestId};
pub use stream::{OutwardStream, SwitchableStream};
pub use types::ChatRequest;
