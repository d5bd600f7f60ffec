//! Production [`StreamSource`] backed by `reqwest`.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::time::Duration;

use super::{anthropic, openai, Generation, Message, StreamSource, StreamingOptions};
use crate::config::Config;
use crate::credentials::{CredentialSet, Protocol};
use crate::error::Result;
use crate::router::Router;

/// Calls the provider the [`Router`] selects for each request's credentials.
#[derive(Debug, Clone)]
pub struct ProviderClient {
    http: reqwest::Client,
    router: Router,
}

impl ProviderClient {
    pub fn new(http: reqwest::Client, router: Router) -> Self {
        Self { http, router }
    }

    /// Build a client with timeouts taken from configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.relay.request_timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self::new(http, Router::from_config(config)))
    }
}

impl StreamSource for ProviderClient {
    fn call<'a>(
        &'a self,
        messages: &'a [Message],
        credentials: &'a CredentialSet,
        options: &'a StreamingOptions,
    ) -> BoxFuture<'a, Result<Generation>> {
        async move {
            let provider = self.router.select(credentials)?;

            tracing::info!(
                provider = %provider.kind,
                model = %provider.model,
                messages = messages.len(),
                max_tokens = options.max_tokens,
                "Calling provider"
            );

            match provider.kind.protocol() {
                Protocol::Anthropic => {
                    anthropic::stream_chat(&self.http, &provider, messages, options).await
                }
                Protocol::OpenAiCompatible => {
                    openai::stream_chat(&self.http, &provider, messages, options).await
                }
            }
        }
        .boxed()
    }
}
