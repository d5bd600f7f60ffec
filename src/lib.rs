//! chatrelay - Streaming chat relay for LLM providers
//!
//! This library provides the core functionality for the chatrelay server:
//! configuration, credential handling, provider streaming, and the relay
//! that transparently continues token-limited generations.

pub mod config;
pub mod credentials;
pub mod error;
pub mod keystore;
pub mod llm;
pub mod proxy;
pub mod router;

pub use config::Config;
pub use credentials::{ApiKeys, CredentialSet, ProviderKind};
pub use error::{Error, Result};
