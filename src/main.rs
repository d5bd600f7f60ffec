//! chatrelay - Streaming chat relay for LLM providers
//!
//! Serves `POST /api/chat`, streaming the provider's answer back as plain
//! text and continuing generations that hit the token limit.

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chatrelay::error::ErrorEnvelope;
use chatrelay::keystore::ApiKeyStore;
use chatrelay::llm::Message;
use chatrelay::proxy::{run_server, ChatRequest};
use chatrelay::{Config, ProviderKind};

#[derive(Parser)]
#[command(name = "chatrelay")]
#[command(about = "Streaming chat relay with transparent continuation across LLM providers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay server
    Serve {
        /// Path to configuration file (defaults + environment when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override listen address
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Validate configuration file
    Check {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Show configured providers and where their default keys come from
    Providers {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Manage the client-side key store
    Keys {
        /// Path to the key store file
        #[arg(short, long)]
        store: Option<PathBuf>,

        #[command(subcommand)]
        action: KeysAction,
    },

    /// Send a prompt to a running relay and print the streamed answer
    Ask {
        /// Relay endpoint
        #[arg(short, long, default_value = "http://127.0.0.1:5173/api/chat")]
        url: String,

        /// Path to the key store file
        #[arg(short, long)]
        store: Option<PathBuf>,

        prompt: String,
    },
}

#[derive(Subcommand)]
enum KeysAction {
    /// Store a key (or the Ollama base URL)
    Set { provider: ProviderKind, value: String },
    /// Remove a stored key
    Unset { provider: ProviderKind },
    /// Show which keys are stored
    List,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => Config::from_env().context("loading configuration from environment"),
    }
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("chatrelay={level},tower_http={level}").into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, listen } => {
            let mut config = load_config(config.as_ref())?;
            init_tracing(&config.logging.level);

            if let Some(addr) = listen {
                tracing::info!(listen = %addr, "Override listen address");
                config.server.listen = addr;
            }
            if !config.defaults.has_api_key() {
                tracing::warn!("No server-side provider keys; clients must send apiKeys");
            }
            tracing::info!(
                max_response_segments = config.relay.max_response_segments,
                max_tokens = config.relay.max_tokens,
                preferred = ?config.relay.provider,
                "Relay configured"
            );

            run_server(config).await
        }

        Commands::Check { config } => {
            let config = load_config(config.as_ref())?;
            init_tracing(&config.logging.level);

            println!("Configuration OK");
            println!("  listen: {}", config.server.listen);
            println!(
                "  max_response_segments: {}",
                config.relay.max_response_segments
            );
            println!("  max_tokens: {}", config.relay.max_tokens);
            for provider in &config.providers {
                println!("  {}: key source {}", provider.kind, provider.key_source);
            }
            if !config.defaults.has_api_key() {
                println!("  warning: no server-side provider keys configured");
            }
            Ok(())
        }

        Commands::Providers { config } => {
            let config = load_config(config.as_ref())?;
            init_tracing(&config.logging.level);

            println!(
                "{:<12} {:<28} {:<36} {}",
                "PROVIDER", "MODEL", "BASE URL", "DEFAULT KEY"
            );
            for p in &config.providers {
                let marker = if config.relay.provider == Some(p.kind) {
                    " (preferred)"
                } else {
                    ""
                };
                println!(
                    "{:<12} {:<28} {:<36} {}{}",
                    p.kind.as_str(),
                    p.model,
                    p.base_url,
                    p.key_source,
                    marker
                );
            }
            Ok(())
        }

        Commands::Keys { store, action } => {
            init_tracing("warn");
            let path = store.unwrap_or_else(ApiKeyStore::default_path);
            let mut store = ApiKeyStore::load(&path);

            match action {
                KeysAction::Set { provider, value } => {
                    store.set(provider, &value)?;
                    println!("Stored {} in {}", provider.request_field(), path.display());
                }
                KeysAction::Unset { provider } => {
                    store.clear(provider)?;
                    println!("Removed {}", provider.request_field());
                }
                KeysAction::List => {
                    for kind in ProviderKind::ALL {
                        let shown = match store.keys().get(kind) {
                            Some(url) if kind.uses_base_url() => url.to_string(),
                            Some(_) => "set".to_string(),
                            None => "-".to_string(),
                        };
                        println!("{:<18} {}", kind.request_field(), shown);
                    }
                }
            }
            Ok(())
        }

        Commands::Ask { url, store, prompt } => {
            init_tracing("warn");
            let path = store.unwrap_or_else(ApiKeyStore::default_path);
            let store = ApiKeyStore::load(&path);
            ask(&url, store.keys().clone(), prompt).await
        }
    }
}

async fn ask(url: &str, api_keys: chatrelay::ApiKeys, prompt: String) -> anyhow::Result<()> {
    let request = ChatRequest {
        messages: vec![Message::user(prompt)],
        api_keys: Some(api_keys),
    };

    let response = reqwest::Client::new()
        .post(url)
        .json(&request)
        .send()
        .await
        .with_context(|| format!("connecting to {}", url))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<ErrorEnvelope>(&body) {
            Ok(envelope) => format!("{}: {}", envelope.error, envelope.details),
            Err(_) => body,
        };
        anyhow::bail!("relay returned {}: {}", status, message);
    }

    let mut stdout = std::io::stdout();
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        stdout.write_all(&chunk?)?;
        stdout.flush()?;
    }
    writeln!(stdout)?;
    Ok(())
}
