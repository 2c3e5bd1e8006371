//! WebSocket feed of live build notifications.

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use shipyard_core::BuildId;
use shipyard_notify::Subscription;
use tracing::{debug, info, warn};

use crate::NotifierState;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsParams {
    client_id: Option<String>,
    build_id: Option<String>,
}

/// `GET /ws?clientId=<id>&buildId=<optional>`.
///
/// Frames flow server to client only. Inbound messages other than close are
/// ignored.
pub async fn ws_handler(
    State(state): State<NotifierState>,
    Query(params): Query<WsParams>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(client_id) = params.client_id.filter(|c| !c.trim().is_empty()) else {
        return ApiError::BadRequest("clientId is required".to_string()).into_response();
    };
    let filter = match params.build_id.as_deref().filter(|b| !b.is_empty()) {
        Some(raw) => match raw.parse::<BuildId>() {
            Ok(id) => Some(id),
            Err(_) => {
                return ApiError::BadRequest(format!("invalid buildId: {}", raw)).into_response();
            }
        },
        None => None,
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let subscription = state.hub.subscribe(client_id, filter);
    ws.on_upgrade(move |socket| handle_socket(socket, state, subscription))
}

async fn handle_socket(socket: WebSocket, state: NotifierState, mut subscription: Subscription) {
    let client_id = subscription.client_id().to_string();
    info!(client_id = %client_id, "WebSocket connection established");

    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            frame = subscription.recv() => {
                // None: replaced by a newer connection with the same client id.
                let Some(frame) = frame else { break };
                if let Err(e) = sender.send(Message::Text(frame.into())).await {
                    debug!(client_id = %client_id, error = %e, "WebSocket send failed");
                    break;
                }
            }
            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(client_id = %client_id, error = %e, "WebSocket error");
                    break;
                }
            },
        }
    }

    state.hub.release(&subscription);
    info!(client_id = %client_id, "WebSocket connection closed");
}
