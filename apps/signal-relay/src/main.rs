use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use signal_relay::{
    build_router,
    cli::{self, Cli, Commands},
    config::{Config, StoreBackend},
    engine::RtcEngine,
    storage::{InMemoryStore, NegotiationStore, RedisStore},
    websocket::RelayState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to INFO for the relay itself if RUST_LOG is not set
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,signal_relay=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    if let Some(Commands::Probe { url }) = cli.command {
        if let Err(e) = cli::run_probe(url).await {
            error!("Probe error: {}", e);
            std::process::exit(1);
        }
        return Ok(());
    }

    let config = Config::from_env();
    info!("Starting signal relay on {}", config.listen_addr());
    info!("Default room: {}", config.default_room);

    let store = open_store(&config).await;
    let engine = RtcEngine::new(&config.ice_servers).context("initialising media engine")?;
    let addr = config.listen_addr();
    let state = RelayState::new(config, Arc::new(engine), store);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("Signal relay listening on {}", addr);

    axum::serve(listener, app).await.context("serving")?;
    Ok(())
}

async fn open_store(config: &Config) -> Arc<dyn NegotiationStore> {
    match config.store_backend {
        StoreBackend::Memory => {
            info!("Negotiation records kept in memory");
            InMemoryStore::new()
        }
        StoreBackend::Redis => {
            match RedisStore::connect(&config.redis_url, config.session_ttl_seconds).await {
                Ok(store) => {
                    info!(
                        "Redis URL: {} (record TTL {} seconds)",
                        config.redis_url, config.session_ttl_seconds
                    );
                    Arc::new(store)
                }
                Err(e) => {
                    warn!(
                        "Redis at {} unavailable ({}); keeping negotiation records in memory",
                        config.redis_url, e
                    );
                    InMemoryStore::new()
                }
            }
        }
    }
}
