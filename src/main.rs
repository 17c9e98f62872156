//! miio discovery - command line entry point
//!
//! Broadcasts handshake probes and prints devices as they appear, move and
//! disappear until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use miio_discovery::{Browser, DiscoveryConfig, DiscoveryEvent, Token};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// miio device discovery
#[derive(Parser, Debug)]
#[command(name = "miio-discover")]
#[command(about = "Discover miio devices on the local network")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Seconds a device stays cached without replying
    #[arg(long, env = "MIIO_CACHE_TIME")]
    cache_time: Option<u64>,

    /// Do not look up hidden tokens in the token store
    #[arg(long)]
    no_token_storage: bool,

    /// Manual token, as <id>=<hex>
    #[arg(long = "token", value_parser = parse_token_arg)]
    tokens: Vec<(String, Token)>,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

impl Cli {
    /// Initialize logging based on debug flag
    fn initialize_logging(&self) {
        let filter = if self.debug {
            EnvFilter::new("debug")
        } else {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .init();
    }

    /// File, then environment, then flags
    fn discovery_config(&self) -> Result<DiscoveryConfig> {
        let mut config = match &self.config {
            Some(path) => DiscoveryConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => DiscoveryConfig::default(),
        };
        config = config.with_env_overrides()?;

        if let Some(cache_time) = self.cache_time {
            config.cache_time = cache_time;
        }
        if self.no_token_storage {
            config.use_token_storage = false;
        }
        for (id, token) in &self.tokens {
            config.tokens.insert(id.clone(), *token);
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_token_arg(value: &str) -> std::result::Result<(String, Token), String> {
    let (id, hex) = value
        .split_once('=')
        .ok_or_else(|| format!("expected <id>=<hex>, got {value:?}"))?;
    let token = hex.parse::<Token>().map_err(|e| e.to_string())?;
    Ok((id.to_string(), token))
}

fn print_event(event: &DiscoveryEvent, json: bool) -> Result<()> {
    let record = event.record();
    if json {
        let line = serde_json::json!({
            "event": event.kind(),
            "service": record,
        });
        println!("{}", serde_json::to_string(&line)?);
    } else {
        println!(
            "{:<12} {:<12} {:<21} {:<24} token={}",
            event.kind(),
            record.id,
            record.socket_addr(),
            record.model.as_deref().unwrap_or("-"),
            match (&record.token, record.auto_token) {
                (Some(_), true) => "wire",
                (Some(_), false) => "stored",
                (None, _) => "none",
            }
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.initialize_logging();

    let config = cli.discovery_config()?;
    info!(
        "Starting miio discovery (cache time {}s, token storage {})",
        config.cache_time, config.use_token_storage
    );

    let mut browser = Browser::new(config);
    let mut events = browser.subscribe();
    browser.start().await.context("starting discovery")?;

    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => print_event(&event, cli.json)?,
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    browser.stop().await;
    Ok(())
}
