use std::{io, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use asap_core::config::AsapConfig;
use asap_core::replay::spawn_sweeper;
use asap_core::webhook::WebhookManager;
use asap_server::{bind, serve, AppState};

const NONCE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "asapd", version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// TOML configuration file with an [asap] table
    #[arg(long = "config", value_name = "FILE")]
    config_path: Option<PathBuf>,

    /// Bind host (overrides config and ASAP_HOST)
    #[arg(long = "host", value_name = "HOST")]
    host: Option<String>,

    /// Bind port (overrides config and ASAP_PORT)
    #[arg(long = "port", value_name = "PORT")]
    port: Option<u16>,

    /// Log filter (e.g. info, debug, asap_core=trace)
    #[arg(long = "log-level", value_name = "LEVEL")]
    log_level: Option<String>,

    /// HMAC secret used to sign outbound webhooks
    #[arg(long = "webhook-secret", value_name = "SECRET")]
    webhook_secret: Option<String>,

    /// Reject envelopes that carry no nonce
    #[arg(long = "require-nonce", action = ArgAction::SetTrue)]
    require_nonce: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    let config = load_config(&args)?;
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| {
            format!(
                "Invalid bind address {}:{}",
                config.server.host, config.server.port
            )
        })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let webhooks = if config.webhook.secret.is_some() {
        Some(
            WebhookManager::http(config.webhook.clone())
                .context("Failed to build webhook manager")?,
        )
    } else {
        tracing::warn!("no webhook secret configured, status webhooks are disabled");
        None
    };
    let worker = webhooks
        .as_ref()
        .map(|manager| manager.spawn_worker(shutdown_rx.clone()));

    let state = AppState::new(config, webhooks);
    let sweepers = [
        spawn_sweeper(state.nonce_store(), NONCE_SWEEP_INTERVAL, shutdown_rx.clone()),
        spawn_sweeper(state.delivered_store(), NONCE_SWEEP_INTERVAL, shutdown_rx.clone()),
    ];

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
        }
        let _ = shutdown_tx.send(true);
    });

    let listener = bind(addr).await?;
    serve(listener, state, shutdown_rx).await?;

    for handle in sweepers {
        let _ = handle.await;
    }
    if let Some(worker) = worker {
        let _ = worker.await;
    }
    Ok(())
}

fn load_config(args: &Args) -> Result<AsapConfig> {
    let mut config = AsapConfig::load(args.config_path.as_deref()).with_context(|| {
        match &args.config_path {
            Some(path) => format!("Failed to load configuration from {}", path.display()),
            None => "Failed to load configuration".to_string(),
        }
    })?;

    if let Some(host) = &args.host {
        config.server.host = host.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(secret) = &args.webhook_secret {
        config.webhook.secret = Some(secret.clone());
    }
    if args.require_nonce {
        config.replay.require_nonce = true;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn init_tracing(args: &Args) {
    let filter = match &args.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}
