//! Configuration parsing and validation for chatrelay.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::path::Path;

use crate::credentials::{CredentialSet, ProviderKind};

/// Root configuration structure, resolved against the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub relay: RelayConfig,
    pub logging: LoggingConfig,
    /// One entry per supported provider, in `ProviderKind::ALL` order.
    pub providers: Vec<ProviderConfig>,
    /// Server-side default credentials, read once at startup.
    pub defaults: CredentialSet,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "127.0.0.1:5173")
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Enables CORS mode with this `Access-Control-Allow-Origin` value
    #[serde(default)]
    pub cors_allow_origin: Option<String>,
    /// Caps in-flight requests when set
    #[serde(default)]
    pub max_concurrent_requests: Option<usize>,
}

fn default_listen() -> String {
    "127.0.0.1:5173".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            cors_allow_origin: None,
            max_concurrent_requests: None,
        }
    }
}

/// Continuation and generation limits. Read-only after startup.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Maximum number of provider calls chained for one client request
    #[serde(default = "default_max_response_segments")]
    pub max_response_segments: u32,
    /// Per-call generation cap passed to the provider
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Preferred provider when several credentials are usable
    #[serde(default)]
    pub provider: Option<ProviderKind>,
    /// Upper bound on a single upstream call, body included
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_max_response_segments() -> u32 {
    2
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_request_timeout_secs() -> u64 {
    600
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_response_segments: default_max_response_segments(),
            max_tokens: default_max_tokens(),
            provider: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// API key wrapper that redacts in Debug/Display/Serialize and zeroizes on drop.
///
/// Only accessible via `.expose_secret()` so every use is grep-auditable.
#[derive(Clone)]
pub struct ApiKey(SecretString);

impl ApiKey {
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Serialize for ApiKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> serde::Deserialize<'de> for ApiKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(|s| ApiKey(SecretString::from(s)))
    }
}

impl From<String> for ApiKey {
    fn from(s: String) -> Self {
        ApiKey(SecretString::from(s))
    }
}

impl From<&str> for ApiKey {
    fn from(s: &str) -> Self {
        ApiKey(SecretString::from(s))
    }
}

/// How a provider's default credential was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum KeySource {
    /// Literal string in config (no ${} references)
    Literal,
    /// Config value contained ${VAR} references expanded from environment
    EnvExpanded,
    /// Picked up from the provider's convention env var (holds var name)
    Convention(String),
    /// Built-in default (Ollama's local base URL)
    Builtin,
    /// No credential available
    None,
}

impl std::fmt::Display for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::Literal => write!(f, "config-literal"),
            KeySource::EnvExpanded => write!(f, "env-expanded"),
            KeySource::Convention(var) => write!(f, "convention ({})", var),
            KeySource::Builtin => write!(f, "builtin-default"),
            KeySource::None => write!(f, "none"),
        }
    }
}

/// Resolved per-provider settings.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    /// API root, e.g. "https://api.openai.com/v1". For Ollama this is the
    /// server root; the OpenAI-compatible API lives under `/v1`.
    pub base_url: String,
    pub model: String,
    /// Where the server-side default credential came from
    pub key_source: KeySource,
}

impl ProviderConfig {
    /// Settings with every field at its built-in default.
    pub fn builtin(kind: ProviderKind) -> Self {
        Self {
            kind,
            base_url: kind.default_base_url().to_string(),
            model: kind.default_model().to_string(),
            key_source: KeySource::None,
        }
    }
}

/// Raw provider table deserialized directly from TOML.
/// Values may contain `${VAR}` references not yet expanded.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawProviderConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Raw configuration deserialized directly from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub providers: BTreeMap<ProviderKind, RawProviderConfig>,
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment variable '{var}' not set for provider '{provider}': {message}")]
    EnvVar {
        var: String,
        provider: String,
        message: String,
    },
}

/// Expand all `${VAR}` references in a string using a custom lookup function.
///
/// Supports multiple `${VAR}` in one string (e.g., `${SCHEME}://${HOST}/v1`).
/// Fails on first missing variable, unclosed `${`, or empty variable name.
fn expand_env_vars_with<F>(
    input: &str,
    provider_name: &str,
    lookup: F,
) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if !input.contains("${") {
        return Ok(input.to_string());
    }

    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let end = after.find('}').ok_or_else(|| ConfigError::EnvVar {
            var: "<unclosed>".to_string(),
            provider: provider_name.to_string(),
            message: format!("Unclosed '${{' in config value: {}", input),
        })?;

        let var_name = &after[..end];
        if var_name.is_empty() {
            return Err(ConfigError::EnvVar {
                var: "".to_string(),
                provider: provider_name.to_string(),
                message: "Empty variable name in '${}' reference".to_string(),
            });
        }

        let value = lookup(var_name).ok_or_else(|| ConfigError::EnvVar {
            var: var_name.to_string(),
            provider: provider_name.to_string(),
            message: format!(
                "Environment variable '{}' is not set (referenced in provider '{}')",
                var_name, provider_name
            ),
        })?;

        result.push_str(&value);
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    Ok(result)
}

/// Resolve a credential value: explicit config first, then the convention var.
fn resolve_credential<F>(
    kind: ProviderKind,
    configured: Option<&str>,
    lookup: &F,
) -> Result<(Option<String>, KeySource), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let resolved = match configured {
        Some(raw) if raw.contains("${") => (
            Some(expand_env_vars_with(raw, kind.as_str(), lookup)?),
            KeySource::EnvExpanded,
        ),
        Some(raw) => (Some(raw.to_string()), KeySource::Literal),
        None => match lookup(kind.env_var()).filter(|v| !v.trim().is_empty()) {
            Some(value) => (Some(value), KeySource::Convention(kind.env_var().to_string())),
            None if kind.uses_base_url() => (
                Some(kind.default_base_url().to_string()),
                KeySource::Builtin,
            ),
            None => (None, KeySource::None),
        },
    };

    match resolved {
        (Some(value), _) if value.trim().is_empty() => Ok((None, KeySource::None)),
        other => Ok(other),
    }
}

impl Config {
    /// Load configuration from a TOML file, resolving credentials from the
    /// process environment.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::parse_str(&content)
    }

    /// Parse configuration from a TOML string, resolving against the process environment.
    pub fn parse_str(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(content).map_err(ConfigError::Parse)?;
        Self::from_raw(raw)
    }

    /// Built-in defaults plus whatever the convention env vars provide.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_raw(RawConfig::default())
    }

    pub fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        Self::from_raw_with(raw, |name| std::env::var(name).ok())
    }

    /// Convert raw config to final config using a custom env lookup.
    ///
    /// For each provider:
    /// - credential containing `${VAR}`: expanded, source = `EnvExpanded`
    /// - literal credential: used as is, source = `Literal`
    /// - absent: convention var (e.g. `OPENAI_API_KEY`), source = `Convention`,
    ///   else `Builtin` for Ollama's local URL, else `None`
    pub fn from_raw_with<F>(raw: RawConfig, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut providers = Vec::with_capacity(ProviderKind::ALL.len());
        let mut defaults = CredentialSet::new();

        for kind in ProviderKind::ALL {
            let rp = raw.providers.get(&kind).cloned().unwrap_or_default();

            // Ollama is addressed by URL; its base_url doubles as its credential.
            let configured = if kind.uses_base_url() {
                rp.base_url.as_deref()
            } else {
                rp.api_key.as_deref()
            };
            let (credential, key_source) = resolve_credential(kind, configured, &lookup)?;

            let base_url = match (&credential, &rp.base_url) {
                (Some(url), _) if kind.uses_base_url() => url.clone(),
                (_, Some(url)) => expand_env_vars_with(url, kind.as_str(), &lookup)?,
                _ => kind.default_base_url().to_string(),
            };

            if let Some(value) = &credential {
                defaults.insert(kind, value);
            }

            providers.push(ProviderConfig {
                kind,
                base_url,
                model: rp.model.unwrap_or_else(|| kind.default_model().to_string()),
                key_source,
            });
        }

        let config = Config {
            server: raw.server,
            relay: raw.relay,
            logging: raw.logging,
            providers,
            defaults,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.relay.max_response_segments == 0 {
            return Err(ConfigError::Validation(
                "relay.max_response_segments must be at least 1".to_string(),
            ));
        }
        if self.relay.max_tokens == 0 {
            return Err(ConfigError::Validation(
                "relay.max_tokens must be at least 1".to_string(),
            ));
        }

        if let Some(origin) = &self.server.cors_allow_origin {
            if axum::http::HeaderValue::from_str(origin).is_err() {
                return Err(ConfigError::Validation(format!(
                    "server.cors_allow_origin '{}' is not a valid header value",
                    origin
                )));
            }
        }

        for provider in &self.providers {
            if provider.base_url.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Provider '{}' has empty base_url",
                    provider.kind
                )));
            }
        }

        Ok(())
    }

    /// Resolved settings for one provider.
    pub fn provider(&self, kind: ProviderKind) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.kind == kind)
    }
}

impl Default for Config {
    /// Built-in defaults with no credentials beyond Ollama's local URL.
    fn default() -> Self {
        let providers: Vec<ProviderConfig> = ProviderKind::ALL
            .into_iter()
            .map(ProviderConfig::builtin)
            .collect();
        Config {
            server: ServerConfig::default(),
            relay: RelayConfig::default(),
            logging: LoggingConfig::default(),
            providers,
            defaults: CredentialSet::new()
                .with(ProviderKind::Ollama, ProviderKind::Ollama.default_base_url()),
        }
    }
}
