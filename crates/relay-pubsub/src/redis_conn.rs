use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::{Client, RedisError};
use relay_core::RelayError;
use tokio::time::timeout;
use tracing::info;

/// Timeout for establishing Redis connections.
pub const REDIS_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) fn broker_error(e: RedisError) -> RelayError {
    RelayError::BrokerUnavailable(e.to_string())
}

/// Open a client and a shared multiplexed connection, verified with PING.
pub async fn connect(redis_url: &str) -> Result<(Client, ConnectionManager), RelayError> {
    let client = Client::open(redis_url).map_err(broker_error)?;

    let mut conn = timeout(REDIS_TIMEOUT, client.get_connection_manager())
        .await
        .map_err(|_| RelayError::BrokerUnavailable("timed out connecting to Redis".into()))?
        .map_err(broker_error)?;

    let pong: String = redis::cmd("PING")
        .query_async(&mut conn)
        .await
        .map_err(broker_error)?;
    info!(reply = %pong, "Redis connected");

    Ok((client, conn))
}
