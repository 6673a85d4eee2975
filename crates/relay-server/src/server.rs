use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use relay_core::collab::{ChannelAuthorizer, IdentityDecoder, MessageStore};
use relay_core::ids::UserId;
use relay_core::RelayError;
use relay_pubsub::{Broker, ListenerConfig, Relay, RelayHandle, SubscriptionStore};
use relay_telemetry::{names, MetricsRecorder};
use tokio::sync::oneshot;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::bearer_token;
use crate::config::RelayConfig;
use crate::handlers::{self, ApiError};
use crate::registry::{self, ConnectionRegistry};
use crate::session::{self, Heartbeat, Session, SessionContext};

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub max_send_queue: usize,
    pub heartbeat: Heartbeat,
    pub cleanup_interval: Duration,
    pub listener: ListenerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 8000,
            max_send_queue: 256,
            heartbeat: Heartbeat::default(),
            cleanup_interval: Duration::from_secs(60),
            listener: ListenerConfig::default(),
        }
    }
}

impl From<&RelayConfig> for ServerConfig {
    fn from(config: &RelayConfig) -> Self {
        Self {
            bind: config.server.bind.clone(),
            port: config.server.port,
            max_send_queue: config.server.max_send_queue,
            heartbeat: Heartbeat {
                interval: config.heartbeat_interval(),
                timeout: config.client_timeout(),
            },
            cleanup_interval: config.cleanup_interval(),
            listener: ListenerConfig {
                reconnect_delay: config.reconnect_delay(),
                shutdown_timeout: config.shutdown_timeout(),
                ..ListenerConfig::default()
            },
        }
    }
}

impl ServerConfig {
    /// Interval timers cannot be built from a zero period.
    fn check_intervals(&self) -> Result<(), std::io::Error> {
        for (name, value) in [
            ("heartbeat interval", self.heartbeat.interval),
            ("cleanup interval", self.cleanup_interval),
            ("reconnect delay", self.listener.reconnect_delay),
        ] {
            if value.is_zero() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("{name} must be non-zero"),
                ));
            }
        }
        Ok(())
    }
}

/// Backends and collaborators the server is wired to.
pub struct RelayServices {
    pub broker: Arc<dyn Broker>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub store: Arc<dyn MessageStore>,
    pub identity: Arc<dyn IdentityDecoder>,
    pub authorizer: Arc<dyn ChannelAuthorizer>,
    pub metrics: Arc<MetricsRecorder>,
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub sessions: Arc<SessionContext>,
    pub identity: Arc<dyn IdentityDecoder>,
    pub metrics: Arc<MetricsRecorder>,
    pub heartbeat: Heartbeat,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_query_handler))
        .route("/ws/{token}", get(ws_path_handler))
        .route("/health", get(handlers::health))
        .route(
            "/channels/{channel_id}/messages",
            get(handlers::history).post(handlers::post_message),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Wire the registry, relay and session context together. The relay is
/// not started.
pub fn build_state(config: &ServerConfig, services: RelayServices) -> (AppState, Arc<Relay>) {
    let registry = Arc::new(ConnectionRegistry::with_observer(
        config.max_send_queue,
        config.heartbeat.timeout,
        services.metrics.clone(),
    ));
    let relay = Arc::new(Relay::new(
        services.broker,
        services.subscriptions,
        registry.clone(),
        services.metrics.clone(),
        config.listener.clone(),
    ));
    let sessions = Arc::new(SessionContext {
        relay: Arc::clone(&relay),
        store: services.store,
        authorizer: services.authorizer,
        observer: services.metrics.clone(),
    });
    let state = AppState {
        registry,
        sessions,
        identity: services.identity,
        metrics: services.metrics,
        heartbeat: config.heartbeat,
    };
    (state, relay)
}

/// Create and start the server. Returns a handle to shut it down.
pub async fn start(config: ServerConfig, services: RelayServices) -> Result<ServerHandle, std::io::Error> {
    config.check_intervals()?;
    let (state, relay) = build_state(&config, services);

    let relay_handle = relay.start();
    let cleanup = registry::start_cleanup_task(Arc::clone(&state.registry), config.cleanup_interval);

    let router = build_router(state.clone());
    let addr = format!("{}:{}", config.bind, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "relay server started");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "server error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        state,
        relay: relay_handle,
        server,
        cleanup,
        shutdown_tx,
        shutdown_timeout: config.listener.shutdown_timeout,
    })
}

/// Handle returned by `start()`; keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    state: AppState,
    relay: RelayHandle,
    server: tokio::task::JoinHandle<()>,
    cleanup: tokio::task::JoinHandle<()>,
    shutdown_tx: oneshot::Sender<()>,
    shutdown_timeout: Duration,
}

impl ServerHandle {
    /// Wait until the relay holds its broker subscription.
    pub async fn ready(&self) -> bool {
        self.relay.ready().await
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Stop accepting connections, stop the relay and the sweep task.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        self.relay.shutdown().await;
        self.cleanup.abort();

        let mut server = self.server;
        if tokio::time::timeout(self.shutdown_timeout, &mut server).await.is_err() {
            tracing::warn!("open connections did not drain in time, aborting server");
            server.abort();
        }
        tracing::info!("relay server stopped");
    }
}

fn unauthorized(err: RelayError) -> Response {
    tracing::info!(error = %err, "rejected WebSocket handshake");
    ApiError(err).into_response()
}

/// `GET /ws/{token}`
async fn ws_path_handler(
    ws: WebSocketUpgrade,
    Path(token): Path<String>,
    State(state): State<AppState>,
) -> Response {
    upgrade(ws, &token, state)
}

/// `GET /ws?token=...` or `Authorization: Bearer ...`
async fn ws_query_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let token = params
        .get("token")
        .map(String::as_str)
        .or_else(|| bearer_token(&headers))
        .unwrap_or_default()
        .to_string();
    upgrade(ws, &token, state)
}

/// The identity is decoded before the upgrade; a bad token never opens a
/// session.
fn upgrade(ws: WebSocketUpgrade, token: &str, state: AppState) -> Response {
    match state.identity.decode_identity(token) {
        Ok(user_id) => ws.on_upgrade(move |socket| handle_socket(socket, user_id, state)),
        Err(e) => unauthorized(e),
    }
}

async fn handle_socket(socket: WebSocket, user_id: UserId, state: AppState) {
    let (connection, rx) = state.registry.register(user_id.clone());
    state.metrics.gauge_add(names::CONNECTIONS_ACTIVE, &[], 1);
    tracing::info!(user_id = %user_id, connection_id = %connection.id, "WebSocket client connected");

    let session = Session::new(Arc::clone(&state.sessions), user_id, connection.id.clone());
    session::run_socket(
        socket,
        session,
        connection,
        rx,
        Arc::clone(&state.registry),
        state.heartbeat,
    )
    .await;

    state.metrics.gauge_add(names::CONNECTIONS_ACTIVE, &[], -1);
}
