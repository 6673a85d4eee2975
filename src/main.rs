use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use relay_core::collab::AllowAllChannels;
use relay_pubsub::{
    Broker, MemoryBroker, MemorySubscriptionStore, RedisBroker, RedisSubscriptionStore,
    SubscriptionStore,
};
use relay_server::{JwtIdentityDecoder, RelayConfig, RelayServices, ServerConfig};
use relay_store::{Database, MessageRepo};
use relay_telemetry::{init_telemetry, parse_level, LogFormat, TelemetryConfig};

/// Realtime WebSocket relay.
#[derive(Debug, Parser)]
#[command(name = "relay", version)]
struct Cli {
    /// JSON config file, applied over the built-in defaults.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(long)]
    bind: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// Full redis:// URL; overrides REDIS_HOST/REDIS_PORT/REDIS_PASSWORD.
    #[arg(long)]
    redis_url: Option<String>,

    /// Single process, no Redis.
    #[arg(long)]
    memory_broker: bool,

    /// SQLite message database; in-memory when unset.
    #[arg(long, value_name = "FILE")]
    db_path: Option<PathBuf>,

    #[arg(long)]
    log_level: Option<String>,

    /// `json` or `pretty`.
    #[arg(long)]
    log_format: Option<String>,
}

impl Cli {
    fn apply(self, config: &mut RelayConfig) {
        if let Some(bind) = self.bind {
            config.server.bind = bind;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(url) = self.redis_url {
            config.redis.url = Some(url);
        }
        if self.memory_broker {
            config.redis.memory = true;
        }
        if let Some(path) = self.db_path {
            config.store.db_path = Some(path);
        }
        if let Some(level) = self.log_level {
            config.telemetry.log_level = level;
        }
        if let Some(format) = self.log_format {
            config.telemetry.format = format;
        }
    }
}

fn telemetry_config(config: &RelayConfig) -> anyhow::Result<TelemetryConfig> {
    let log_level = parse_level(&config.telemetry.log_level)
        .with_context(|| format!("unknown log level {:?}", config.telemetry.log_level))?;
    let format = match config.telemetry.format.as_str() {
        "pretty" => LogFormat::Pretty,
        _ => LogFormat::Json,
    };
    Ok(TelemetryConfig {
        log_level,
        format,
        ..TelemetryConfig::default()
    })
}

async fn pubsub_backends(
    config: &RelayConfig,
) -> anyhow::Result<(Arc<dyn Broker>, Arc<dyn SubscriptionStore>)> {
    if config.redis.memory {
        tracing::warn!("using the in-memory broker; traffic stays inside this process");
        return Ok((
            Arc::new(MemoryBroker::new()),
            Arc::new(MemorySubscriptionStore::new()),
        ));
    }

    tracing::info!(host = %config.redis.host, port = config.redis.port, "connecting to Redis");
    let url = config.redis.connection_url()?;
    let (client, conn) = relay_pubsub::connect_redis(&url)
        .await
        .context("failed to connect to Redis")?;
    Ok((
        Arc::new(RedisBroker::new(client, conn.clone())),
        Arc::new(RedisSubscriptionStore::new(conn)),
    ))
}

fn open_database(config: &RelayConfig) -> anyhow::Result<Database> {
    let db = match &config.store.db_path {
        Some(path) => Database::open(path)
            .with_context(|| format!("failed to open database at {}", path.display()))?,
        None => {
            tracing::warn!("no database path configured; messages are kept in memory");
            Database::in_memory()?
        }
    };
    Ok(db)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = RelayConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;

    let telemetry = init_telemetry(&telemetry_config(&config)?);
    tracing::info!("starting relay");

    let (broker, subscriptions) = pubsub_backends(&config).await?;
    let db = open_database(&config)?;
    let identity = JwtIdentityDecoder::from_settings(&config.auth)?;

    let services = RelayServices {
        broker,
        subscriptions,
        store: Arc::new(MessageRepo::new(db)),
        identity: Arc::new(identity),
        authorizer: Arc::new(AllowAllChannels),
        metrics: telemetry.metrics(),
    };

    let handle = relay_server::start(ServerConfig::from(&config), services)
        .await
        .context("failed to start server")?;
    tracing::info!(port = handle.port, "relay ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
