#![forbid(unsafe_code)]

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use log::{error, info, warn};
use tokio::signal;
use tubescript::{
    api::{AppState, router},
    cache,
    config::{DEFAULT_CONFIG_PATH, Settings, load_settings_from},
    fetch::FetchService,
    security::{ProxySecret, ensure_not_root},
    transcripts::TranscriptStore,
    upstream::HttpUpstream,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve stored YouTube transcripts over HTTP.")]
struct Cli {
    #[arg(long = "config", value_name = "PATH", default_value = DEFAULT_CONFIG_PATH, help = "Path to the env-style config file")]
    config: PathBuf,
    #[arg(long = "host", value_name = "ADDR", help = "Override the listen address")]
    host: Option<String>,
    #[arg(long = "port", value_name = "PORT", help = "Override the listen port")]
    port: Option<u16>,
    #[arg(
        long = "database",
        value_name = "PATH",
        help = "Override the transcript database path"
    )]
    database: Option<PathBuf>,
}

impl Cli {
    fn apply(self, mut settings: Settings) -> Settings {
        if let Some(host) = self.host {
            settings.host = host;
        }
        if let Some(port) = self.port {
            settings.port = port;
        }
        if let Some(database) = self.database {
            settings.database_path = database;
        }
        settings
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    if let Err(err) = run().await {
        error!("{err:#}");
        return Err(err);
    }
    Ok(())
}

async fn run() -> Result<()> {
    ensure_not_root("backend")?;

    let cli = Cli::parse();
    let settings = load_settings_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    let settings = cli.apply(settings);

    let store = TranscriptStore::open(&settings.database_path).with_context(|| {
        format!(
            "opening transcript database {}",
            settings.database_path.display()
        )
    })?;
    let cache = cache::open_backend(settings.cache_backend, &settings.cache_path)?;
    let upstream = HttpUpstream::new(settings.upstream_url.clone(), settings.upstream_timeout);

    let secret = ProxySecret::new(settings.proxy_secret.as_deref());
    if secret.is_open() {
        warn!("no proxy secret configured; all requests are accepted");
    }
    info!(
        "database {}, cache backend {}, upstream {}",
        settings.database_path.display(),
        settings.cache_backend,
        settings.upstream_url
    );

    let service = FetchService::new(store, Arc::new(upstream), cache, settings.cache_ttl);
    let app = router(AppState::new(service, secret));

    let addr = SocketAddr::new(
        settings
            .host
            .parse()
            .with_context(|| format!("parsing listen address {}", settings.host))?,
        settings.port,
    );
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!("API server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    info!("API server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!("Failed to install Ctrl+C handler: {}", err);
    }
}
