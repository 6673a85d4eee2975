//! HTTP routes next to the WebSocket endpoint: health and message history.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use relay_core::ids::{ChannelId, UserId};
use relay_core::RelayError;
use relay_pubsub::RelayState;
use relay_store::{DEFAULT_HISTORY_LIMIT, MAX_HISTORY_LIMIT};
use serde::Deserialize;
use serde_json::json;

use crate::auth::bearer_token;
use crate::server::AppState;

/// `RelayError` rendered as `{status: "error", detail}` with a matching
/// HTTP status.
#[derive(Debug)]
pub struct ApiError(pub RelayError);

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            RelayError::Auth(_) => StatusCode::UNAUTHORIZED,
            RelayError::Protocol(detail) if detail.starts_with("Forbidden") => StatusCode::FORBIDDEN,
            RelayError::Protocol(_) => StatusCode::BAD_REQUEST,
            RelayError::BrokerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::DeliveryFailure { .. } | RelayError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({ "status": "error", "detail": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<UserId, ApiError> {
    let token = bearer_token(headers).ok_or_else(|| RelayError::Auth("missing bearer token".into()))?;
    Ok(state.identity.decode_identity(token)?)
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let relay_state = state.sessions.relay.state();
    let (code, status) = match relay_state {
        RelayState::Listening => (StatusCode::OK, "ok"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "degraded"),
    };
    let body = json!({
        "status": status,
        "relay": format!("{relay_state:?}").to_lowercase(),
        "connections": state.registry.connection_count(),
        "users": state.registry.user_count(),
        "metrics": state.metrics.snapshot(),
    });
    (code, Json(body))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub before_id: Option<i64>,
    pub limit: Option<u32>,
}

pub async fn history(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    Query(query): Query<HistoryQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = authenticate(&state, &headers)?;
    let channel_id = ChannelId::from(channel_id);
    state.sessions.ensure_member(&user_id, &channel_id).await?;

    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let messages = state
        .sessions
        .store
        .history(&channel_id, query.before_id, limit)
        .await?;

    Ok(Json(json!({
        "channel_id": channel_id,
        "messages": messages,
    })))
}

#[derive(Debug, Deserialize)]
pub struct PostMessageBody {
    pub content: String,
}

pub async fn post_message(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<PostMessageBody>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = authenticate(&state, &headers)?;
    let channel_id = ChannelId::from(channel_id);
    let posted = state
        .sessions
        .post_message(&user_id, &channel_id, &body.content)
        .await?;
    let published = posted.published.is_ok();

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": posted.record,
            "published": published,
        })),
    ))
}
