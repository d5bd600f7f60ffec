//! Provider selection logic.

use crate::config::{ApiKey, Config, ProviderConfig};
use crate::credentials::{CredentialSet, ProviderKind};
use crate::error::{Error, Result};

/// A provider selected to serve one call.
#[derive(Debug, Clone)]
pub struct SelectedProvider {
    pub kind: ProviderKind,
    /// API root the protocol paths are appended to.
    pub api_base: String,
    pub model: String,
    pub api_key: Option<ApiKey>,
}

/// Router for selecting providers.
#[derive(Debug, Clone)]
pub struct Router {
    providers: Vec<ProviderConfig>,
    preferred: Option<ProviderKind>,
}

impl Router {
    /// Create a new router with the given provider settings and preference.
    pub fn new(providers: Vec<ProviderConfig>, preferred: Option<ProviderKind>) -> Self {
        Self {
            providers,
            preferred,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.providers.clone(), config.relay.provider)
    }

    /// Select the provider for a request's credentials.
    ///
    /// The configured preference wins when it has a usable credential;
    /// otherwise the first keyed provider in `ProviderKind::KEYED` order.
    /// Ollama is only ever chosen as the explicit preference.
    pub fn select(&self, credentials: &CredentialSet) -> Result<SelectedProvider> {
        if let Some(preferred) = self.preferred {
            if credentials.contains(preferred) {
                tracing::debug!(provider = %preferred, "Selected preferred provider");
                return Ok(self.selected(preferred, credentials));
            }
            tracing::debug!(
                provider = %preferred,
                "Preferred provider has no credential, falling back"
            );
        }

        ProviderKind::KEYED
            .into_iter()
            .find(|kind| credentials.api_key(*kind).is_some())
            .map(|kind| self.selected(kind, credentials))
            .ok_or(Error::MissingCredential)
    }

    fn selected(&self, kind: ProviderKind, credentials: &CredentialSet) -> SelectedProvider {
        let settings = self
            .settings(kind)
            .cloned()
            .unwrap_or_else(|| ProviderConfig::builtin(kind));

        let api_base = match credentials.base_url(kind) {
            // Request-supplied Ollama roots override the configured one.
            Some(root) => format!("{}/v1", root.trim_end_matches('/')),
            None if kind.uses_base_url() => {
                format!("{}/v1", settings.base_url.trim_end_matches('/'))
            }
            None => settings.base_url,
        };

        SelectedProvider {
            kind,
            api_base,
            model: settings.model,
            api_key: credentials.api_key(kind).cloned(),
        }
    }

    fn settings(&self, kind: ProviderKind) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.kind == kind)
    }
}
