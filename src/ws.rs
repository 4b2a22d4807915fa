//! HTTP surface: the WebSocket upgrade endpoint and the push-RPC endpoint
//! other services call directly instead of routing through the event bus.
//!
//! Token parsing and the authenticated user-id lookup live upstream of this
//! tier per the external interfaces section; `user_id` on the query string
//! here is taken as already verified.

use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;
use bytes::Bytes;
use serde::Deserialize;
use tracing::{info, warn};

use crate::connection;
use crate::events::{BusEvent, EventBusHandle};
use crate::protocol::error_codes;
use crate::shared::Shared;

#[derive(Clone)]
pub struct AppState {
    pub shared: Arc<Shared>,
    pub events: EventBusHandle,
}

#[derive(Deserialize)]
pub struct ConnectQuery {
    user_id: i64,
}

pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let user_id = query.user_id;
    ws.on_upgrade(move |socket| handle_socket(socket, user_id, state))
}

async fn handle_socket(socket: WebSocket, user_id: i64, state: AppState) {
    if let Err(e) = state.shared.user_rpc.connect(user_id).await {
        warn!(code = error_codes::RPC_CONNECT_FAILED, user_id, error = %e, "rejecting connection");
        return;
    }

    let handle = connection::spawn(user_id, socket, state.shared.clone());
    if let Some(old) = state.shared.register(handle) {
        old.close();
    }
    info!(user_id, "connection registered");
}

#[derive(Deserialize)]
pub struct PushMessageReq {
    #[serde(rename = "type")]
    topic: String,
    key: String,
    body: serde_json::Value,
}

/// `PushMessage` RPC: forwards directly into the same dispatch path a
/// bus-delivered event would take.
pub async fn push_handler(
    State(state): State<AppState>,
    Json(req): Json<PushMessageReq>,
) -> impl IntoResponse {
    state.events.push(BusEvent {
        topic: req.topic,
        key: req.key,
        body: Bytes::from(serde_json::to_vec(&req.body).unwrap_or_default()),
    });
    axum::http::StatusCode::OK
}
