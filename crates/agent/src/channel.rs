//! Live command channel to the control plane.
//!
//! A WebSocket to `/v1/gateways/{id}/channel` carrying the gateway's
//! commands topic inbound and its progress topic outbound, one JSON text
//! frame per message. REST polling stays the fallback whenever the channel
//! is down.

use crate::api_client::ApiClient;
use crate::error::{AgentError, AgentResult};
use futures::{SinkExt, StreamExt};
use otter_core::{CommandMessage, ProgressMessage};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

const COMMAND_BUFFER: usize = 16;
const PROGRESS_BUFFER: usize = 64;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// An open channel. Dropping it closes the socket.
pub struct GatewayChannel {
    commands: mpsc::Receiver<CommandMessage>,
    progress: mpsc::Sender<ProgressMessage>,
    task: JoinHandle<()>,
}

impl GatewayChannel {
    /// Open the channel with the client's gateway id and token.
    pub async fn connect(client: &ApiClient) -> AgentResult<Self> {
        let url = client.channel_url()?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| AgentError::Channel(e.to_string()))?;
        if let Some(token) = client.token() {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| AgentError::Config(format!("invalid token: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (socket, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| AgentError::Channel(format!("{url}: {e}")))?;
        tracing::info!(url = %url, "Command channel connected");

        let (commands_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (progress, progress_rx) = mpsc::channel(PROGRESS_BUFFER);
        let task = tokio::spawn(pump(socket, commands_tx, progress_rx));
        Ok(Self {
            commands,
            progress,
            task,
        })
    }

    /// Next pushed command. `None` once the channel has closed.
    pub async fn next_command(&mut self) -> Option<CommandMessage> {
        self.commands.recv().await
    }

    /// Handle for publishing progress on the channel.
    pub fn progress_sender(&self) -> mpsc::Sender<ProgressMessage> {
        self.progress.clone()
    }
}

impl Drop for GatewayChannel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn pump(
    socket: Socket,
    commands: mpsc::Sender<CommandMessage>,
    mut progress: mpsc::Receiver<ProgressMessage>,
) {
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<CommandMessage>(text.as_str()) {
                        Ok(command) => {
                            if commands.send(command).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "Ignoring undecodable command"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Command channel failed");
                    break;
                }
            },
            message = progress.recv() => {
                let Some(message) = message else { break };
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to encode progress");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::text(text)).await {
                    tracing::warn!(error = %e, "Failed to send progress on channel");
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
    tracing::info!("Command channel closed");
}
