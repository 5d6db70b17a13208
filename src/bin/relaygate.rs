use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use relaygate::RelayConfig;
use relaygate::gateway::settings::{FileSettingsSource, SettingsSource, settings_channel, spawn_settings_reload};
use relaygate::gateway::{
    AdapterSet, BalanceCache, Gateway, GatewayHttpState, GatewayParts, MemoryBalanceCache,
    MemoryStore, OpenAiCompatibleAdapter, router,
};

/// Multi-tenant LLM relay gateway.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (TOML, or JSON by extension)
    #[arg(short, long, env = "RELAYGATE_CONFIG")]
    config: PathBuf,

    /// Listen address; overrides the config file
    #[arg(short, long, env = "RELAYGATE_LISTEN")]
    listen: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, env = "RELAYGATE_JSON_LOGS")]
    json_logs: bool,

    /// Redis URL for the balance cache; overrides the config file
    #[arg(long, env = "RELAYGATE_REDIS")]
    redis: Option<String>,
}

#[cfg(feature = "redis-cache")]
fn balance_cache(redis_url: Option<&str>) -> Result<Arc<dyn BalanceCache>, Box<dyn std::error::Error>> {
    match redis_url {
        Some(url) => {
            info!("using redis balance cache");
            Ok(Arc::new(relaygate::gateway::RedisBalanceCache::new(url)?))
        }
        None => Ok(Arc::new(MemoryBalanceCache::new())),
    }
}

#[cfg(not(feature = "redis-cache"))]
fn balance_cache(redis_url: Option<&str>) -> Result<Arc<dyn BalanceCache>, Box<dyn std::error::Error>> {
    if redis_url.is_some() {
        warn!("redis url ignored: built without the redis-cache feature");
    }
    Ok(Arc::new(MemoryBalanceCache::new()))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    relaygate::telemetry::init_tracing(args.json_logs).map_err(|err| err.to_string())?;

    let config = RelayConfig::load(&args.config)?;
    let listen = args.listen.clone().unwrap_or_else(|| config.listen.clone());
    let redis_url = args.redis.clone().or_else(|| config.redis_url.clone());

    let store = Arc::new(MemoryStore::from_seed(
        config.channels.clone(),
        config.tenants.clone(),
        config.tokens.clone(),
    ));
    let (publisher, settings) = settings_channel(config.settings.clone());
    let publisher = Arc::new(publisher);
    let adapters = AdapterSet::new().with_fallback(Arc::new(OpenAiCompatibleAdapter::new()?));

    let gateway = Gateway::new(GatewayParts {
        channels: store.clone(),
        quota: store.clone(),
        balances: balance_cache(redis_url.as_deref())?,
        adapters,
        settings,
    })?;

    let _reload = config.reload_interval().map(|interval| {
        let source: Arc<dyn SettingsSource> = Arc::new(FileSettingsSource::new(&args.config));
        info!(interval_secs = interval.as_secs(), "settings reload enabled");
        spawn_settings_reload(source, publisher.clone(), interval)
    });

    let tasks = gateway.tasks.clone();
    let app = router(GatewayHttpState::new(gateway, store));
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!(listen = %listen, channels = config.channels.len(), "relaygate listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!(in_flight = tasks.in_flight(), "draining background settlement tasks");
    tasks.wait_idle().await;
    Ok(())
}
