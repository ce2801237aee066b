use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use clap::{Parser, Subcommand};
use streamrelay_core::{
    config::{Config, ProviderKind},
    consumer::{ExchangeObserver, HttpTransport, StreamConsumer, SubmitOutcome},
    error::RelayError,
    markup::{self, MarkupStyle},
    model::{Turn, TurnRole},
    provider_factory,
    relay::{self, RelaySettings, RelayState},
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Streaming chat relay and terminal client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay endpoint
    Serve {
        #[arg(long, help = "JSON or TOML config file")]
        config: Option<PathBuf>,
        #[arg(long, help = "Listen address, overrides server.bind")]
        bind: Option<String>,
        #[arg(long, help = "Serve canned replies when no API key is set")]
        allow_null: bool,
    },
    /// Interactive chat against a running relay (one message per line)
    Chat {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, help = "Relay URL, overrides client.relay_url")]
        url: Option<String>,
        #[arg(long, help = "Print each reply rendered as HTML markup")]
        html: bool,
    },
    /// Send a single message and print the streamed reply
    Ask {
        #[arg(short, long, help = "Message from the user")]
        message: String,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let default_filter = match cli.command {
        Commands::Serve { .. } => "info,streamrelay=debug",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Serve {
            config,
            bind,
            allow_null,
        } => serve(config, bind, allow_null).await,
        Commands::Chat { config, url, html } => chat(config, url, html).await,
        Commands::Ask {
            message,
            config,
            url,
        } => ask(config, url, &message).await,
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(p) => Config::from_path(&p).with_context(|| format!("loading {}", p.display())),
        None => Ok(Config::default()),
    }
}

async fn serve(config: Option<PathBuf>, bind: Option<String>, allow_null: bool) -> anyhow::Result<()> {
    let mut cfg = load_config(config)?;
    if let Some(bind) = bind {
        cfg.server.bind = bind;
    }

    let provider = match provider_factory::from_config(&cfg) {
        Ok(p) => p,
        Err(RelayError::Validation(reason)) if allow_null => {
            tracing::warn!(%reason, "falling back to the null provider");
            cfg.upstream.provider = ProviderKind::Null;
            provider_factory::from_config(&cfg)?
        }
        Err(e) => return Err(e.into()),
    };
    tracing::info!(
        provider = provider.name(),
        model = %cfg.upstream.model,
        max_output_tokens = cfg.upstream.max_output_tokens,
        "relay configured"
    );

    let state = RelayState::new(provider, RelaySettings::from_config(&cfg.upstream));
    let listener = tokio::net::TcpListener::bind(&cfg.server.bind)
        .await
        .with_context(|| format!("binding {}", cfg.server.bind))?;
    relay::serve(listener, state, async {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
        }
    })
    .await?;
    Ok(())
}

fn consumer(
    config: Option<PathBuf>,
    url: Option<String>,
    html: bool,
) -> anyhow::Result<StreamConsumer<HttpTransport>> {
    let mut cfg = load_config(config)?;
    if let Some(url) = url {
        cfg.client.relay_url = url;
    }
    let transport = HttpTransport::from_config(&cfg)?;
    tracing::debug!(url = transport.url(), "using relay");
    Ok(StreamConsumer::new(transport).with_observer(Arc::new(TerminalObserver::new(html))))
}

async fn chat(config: Option<PathBuf>, url: Option<String>, html: bool) -> anyhow::Result<()> {
    let consumer = consumer(config, url, html)?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        io::stdout().flush().ok();
        let Some(line) = lines.next_line().await? else {
            println!();
            return Ok(());
        };
        match consumer.submit(&line).await {
            Ok(_) | Err(RelayError::EmptyInput) => {}
            Err(e) => eprintln!("[{e}]"),
        }
    }
}

async fn ask(config: Option<PathBuf>, url: Option<String>, message: &str) -> anyhow::Result<()> {
    let consumer = consumer(config, url, false)?;
    match consumer.submit(message).await? {
        SubmitOutcome::Completed(_) => Ok(()),
        SubmitOutcome::Failed(_) => anyhow::bail!("exchange failed"),
    }
}

/// Prints only the new suffix of every partial, then settles the line once
/// the assistant turn is committed.
struct TerminalObserver {
    html: Option<MarkupStyle>,
    printed: Mutex<String>,
}

impl TerminalObserver {
    fn new(html: bool) -> Self {
        Self {
            html: html.then(MarkupStyle::default),
            printed: Mutex::new(String::new()),
        }
    }
}

impl ExchangeObserver for TerminalObserver {
    fn on_partial(&self, text: &str) {
        let mut printed = self.printed.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(suffix) = text.strip_prefix(printed.as_str()) {
            print!("{suffix}");
            io::stdout().flush().ok();
            *printed = text.to_string();
        }
    }

    fn on_commit(&self, turn: &Turn) {
        if turn.role != TurnRole::Assistant {
            return;
        }
        let printed = std::mem::take(&mut *self.printed.lock().unwrap_or_else(PoisonError::into_inner));
        if printed != turn.content {
            // failed exchanges replace whatever was streamed
            if !printed.is_empty() {
                println!();
            }
            print!("{}", turn.content);
        }
        println!();
        if let Some(style) = &self.html {
            println!("{}", markup::render(&turn.content, style));
        }
    }
}
