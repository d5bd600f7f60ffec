//! Provider identities and per-request credential sets.
//!
//! A [`CredentialSet`] is assembled for every chat request by overlaying the
//! client-supplied [`ApiKeys`] on top of the server defaults resolved at
//! startup. Blank values never count as credentials.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::ApiKey;

/// The LLM providers the relay can talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProviderKind {
    Anthropic,
    OpenAi,
    Groq,
    OpenRouter,
    Ollama,
}

/// Wire protocol spoken by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Anthropic,
    OpenAiCompatible,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 5] = [
        ProviderKind::Anthropic,
        ProviderKind::OpenAi,
        ProviderKind::Groq,
        ProviderKind::OpenRouter,
        ProviderKind::Ollama,
    ];

    /// Providers authenticated by an API key, in selection order.
    pub const KEYED: [ProviderKind; 4] = [
        ProviderKind::Anthropic,
        ProviderKind::OpenAi,
        ProviderKind::Groq,
        ProviderKind::OpenRouter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Groq => "groq",
            ProviderKind::OpenRouter => "openrouter",
            ProviderKind::Ollama => "ollama",
        }
    }

    /// Field name in the `apiKeys` request object.
    pub fn request_field(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropicApiKey",
            ProviderKind::OpenAi => "openaiApiKey",
            ProviderKind::Groq => "groqApiKey",
            ProviderKind::OpenRouter => "openRouterApiKey",
            ProviderKind::Ollama => "ollamaApiBaseUrl",
        }
    }

    /// Environment variable holding the server-side default credential.
    pub fn env_var(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
            ProviderKind::OpenAi => "OPENAI_API_KEY",
            ProviderKind::Groq => "GROQ_API_KEY",
            ProviderKind::OpenRouter => "OPEN_ROUTER_API_KEY",
            ProviderKind::Ollama => "OLLAMA_API_BASE_URL",
        }
    }

    /// Whether the credential is a base URL rather than a secret key.
    pub fn uses_base_url(&self) -> bool {
        matches!(self, ProviderKind::Ollama)
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            ProviderKind::Anthropic => Protocol::Anthropic,
            _ => Protocol::OpenAiCompatible,
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "https://api.anthropic.com/v1",
            ProviderKind::OpenAi => "https://api.openai.com/v1",
            ProviderKind::Groq => "https://api.groq.com/openai/v1",
            ProviderKind::OpenRouter => "https://openrouter.ai/api/v1",
            ProviderKind::Ollama => "http://localhost:11434",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "claude-3-5-sonnet-20240620",
            ProviderKind::OpenAi => "gpt-4o",
            ProviderKind::Groq => "llama-3.1-70b-versatile",
            ProviderKind::OpenRouter => "anthropic/claude-3.5-sonnet",
            ProviderKind::Ollama => "llama3.1",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "anthropic" => Ok(ProviderKind::Anthropic),
            "openai" => Ok(ProviderKind::OpenAi),
            "groq" => Ok(ProviderKind::Groq),
            "openrouter" => Ok(ProviderKind::OpenRouter),
            "ollama" => Ok(ProviderKind::Ollama),
            other => Err(format!(
                "unknown provider '{}' (expected anthropic, openai, groq, openrouter or ollama)",
                other
            )),
        }
    }
}

impl<'de> Deserialize<'de> for ProviderKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Provider keys as sent by the browser client and kept in its key store.
#[derive(Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeys {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anthropic_api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openai_api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groq_api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_router_api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ollama_api_base_url: Option<String>,
}

impl ApiKeys {
    pub fn get(&self, kind: ProviderKind) -> Option<&str> {
        self.slot(kind).as_deref()
    }

    pub fn set(&mut self, kind: ProviderKind, value: Option<String>) {
        *self.slot_mut(kind) = value;
    }

    fn slot(&self, kind: ProviderKind) -> &Option<String> {
        match kind {
            ProviderKind::Anthropic => &self.anthropic_api_key,
            ProviderKind::OpenAi => &self.openai_api_key,
            ProviderKind::Groq => &self.groq_api_key,
            ProviderKind::OpenRouter => &self.open_router_api_key,
            ProviderKind::Ollama => &self.ollama_api_base_url,
        }
    }

    fn slot_mut(&mut self, kind: ProviderKind) -> &mut Option<String> {
        match kind {
            ProviderKind::Anthropic => &mut self.anthropic_api_key,
            ProviderKind::OpenAi => &mut self.openai_api_key,
            ProviderKind::Groq => &mut self.groq_api_key,
            ProviderKind::OpenRouter => &mut self.open_router_api_key,
            ProviderKind::Ollama => &mut self.ollama_api_base_url,
        }
    }
}

impl fmt::Debug for ApiKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for kind in ProviderKind::ALL {
            match self.get(kind) {
                Some(url) if kind.uses_base_url() => map.entry(&kind.request_field(), &url),
                Some(_) => map.entry(&kind.request_field(), &"[REDACTED]"),
                None => continue,
            };
        }
        map.finish()
    }
}

/// A single provider credential.
#[derive(Debug, Clone)]
pub enum Credential {
    ApiKey(ApiKey),
    BaseUrl(String),
}

impl Credential {
    /// Build the credential appropriate for `kind`, or `None` when blank.
    fn for_provider(kind: ProviderKind, value: &str) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() {
            return None;
        }
        Some(if kind.uses_base_url() {
            Credential::BaseUrl(value.to_string())
        } else {
            Credential::ApiKey(ApiKey::from(value))
        })
    }
}

/// Provider credentials for the lifetime of one request.
#[derive(Debug, Clone, Default)]
pub struct CredentialSet {
    entries: BTreeMap<ProviderKind, Credential>,
}

impl CredentialSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a credential; blank values are treated as absent and ignored.
    pub fn insert(&mut self, kind: ProviderKind, value: &str) {
        if let Some(credential) = Credential::for_provider(kind, value) {
            self.entries.insert(kind, credential);
        }
    }

    pub fn with(mut self, kind: ProviderKind, value: &str) -> Self {
        self.insert(kind, value);
        self
    }

    pub fn get(&self, kind: ProviderKind) -> Option<&Credential> {
        self.entries.get(&kind)
    }

    pub fn contains(&self, kind: ProviderKind) -> bool {
        self.entries.contains_key(&kind)
    }

    /// The API key for `kind`, if one is present.
    pub fn api_key(&self, kind: ProviderKind) -> Option<&ApiKey> {
        match self.entries.get(&kind) {
            Some(Credential::ApiKey(key)) => Some(key),
            _ => None,
        }
    }

    /// The base URL override for `kind`, if one is present.
    pub fn base_url(&self, kind: ProviderKind) -> Option<&str> {
        match self.entries.get(&kind) {
            Some(Credential::BaseUrl(url)) => Some(url),
            _ => None,
        }
    }

    /// Whether any provider API key is present. Base URLs do not count.
    pub fn has_api_key(&self) -> bool {
        self.entries
            .values()
            .any(|c| matches!(c, Credential::ApiKey(_)))
    }

    /// Overlay client-supplied keys: non-blank client values win.
    pub fn overlay(&self, client: &ApiKeys) -> Self {
        let mut merged = self.clone();
        for kind in ProviderKind::ALL {
            if let Some(value) = client.get(kind) {
                merged.insert(kind, value);
            }
        }
        merged
    }

    pub fn providers(&self) -> impl Iterator<Item = ProviderKind> + '_ {
        self.entries.keys().copied()
    }
}
