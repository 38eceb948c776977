//! Per-gateway pub/sub channel over WebSocket.
//!
//! Bridges the gateway's bus topics to a socket the gateway keeps open.
//! Messages published on `gateways/{id}/commands` are pushed as JSON text
//! frames. Every text frame the gateway sends is a progress message; it is
//! published on `gateways/{id}/progress` and takes the same job path as
//! `POST /updates/progress`.

use crate::auth::AuthenticatedUser;
use crate::bus::Subscription;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Extension;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use otter_core::GatewayId;
use otter_core::transport::{commands_topic, progress_topic};

/// Progress messages are a few hundred bytes; logs are one line per event.
const MAX_FRAME_SIZE: usize = 256 * 1024;

/// GET /v1/gateways/{gateway_id}/channel - Open the gateway's command and
/// progress channel.
pub async fn gateway_channel(
    State(state): State<AppState>,
    Path(gateway_id): Path<String>,
    user: Option<Extension<AuthenticatedUser>>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let Some(Extension(user)) = user else {
        return Err(ApiError::Unauthorized("authentication required".to_string()));
    };
    let gateway = GatewayId::parse(&gateway_id).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    user.require_gateway(&gateway)?;

    // Subscribe before the upgrade so nothing published in between is missed.
    let commands = state.bus.subscribe(&commands_topic(&gateway))?;

    Ok(ws
        .max_message_size(MAX_FRAME_SIZE)
        .on_upgrade(move |socket| serve_channel(state, gateway, commands, socket)))
}

async fn serve_channel(
    state: AppState,
    gateway: GatewayId,
    mut commands: Subscription,
    mut socket: WebSocket,
) {
    let progress = progress_topic(&gateway);
    tracing::info!(gateway_id = %gateway, "Gateway channel opened");

    loop {
        tokio::select! {
            msg = commands.recv() => {
                let Some(msg) = msg else { break };
                let text = match String::from_utf8(msg.payload) {
                    Ok(text) => text,
                    Err(_) => {
                        tracing::warn!(gateway_id = %gateway, "Dropping non-UTF-8 command payload");
                        continue;
                    }
                };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            frame = socket.recv() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let payload = text.as_str().as_bytes().to_vec();
                        if let Err(e) = state.bus.publish(&progress, payload).await {
                            tracing::warn!(gateway_id = %gateway, error = %e, "Failed to publish progress");
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(gateway_id = %gateway, error = %e, "Gateway channel error");
                        break;
                    }
                }
            }
        }
    }

    tracing::info!(gateway_id = %gateway, "Gateway channel closed");
}
