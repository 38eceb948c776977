use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use httpmock::Method::POST;
use httpmock::MockServer;
use otter_agent::{ApiClient, ChannelReporter, GatewayChannel, Reporter};
use otter_core::config::DownloadConfig;
use otter_core::{CommandKind, CommandMessage, GatewayId, ProgressMessage, UpdateId, UpdateState};
use serde_json::json;
use std::net::{SocketAddr, TcpListener};
use std::time::Duration;
use tokio::sync::mpsc;

fn can_bind_localhost() -> bool {
    TcpListener::bind("127.0.0.1:0").is_ok()
}

/// What the fake control plane saw on the channel.
#[derive(Debug)]
enum Seen {
    Opened { gateway: String, authorization: String },
    Frame(String),
}

#[derive(Clone)]
struct Relay {
    command: CommandMessage,
    seen: mpsc::UnboundedSender<Seen>,
}

async fn channel(
    State(relay): State<Relay>,
    Path(gateway): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let authorization = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let _ = relay.seen.send(Seen::Opened {
        gateway,
        authorization,
    });
    ws.on_upgrade(move |socket| push_and_record(relay, socket))
}

async fn push_and_record(relay: Relay, mut socket: WebSocket) {
    let text = serde_json::to_string(&relay.command).unwrap();
    if socket.send(Message::Text(text.into())).await.is_err() {
        return;
    }
    while let Some(Ok(frame)) = socket.recv().await {
        if let Message::Text(text) = frame {
            let _ = relay.seen.send(Seen::Frame(text.as_str().to_string()));
        }
    }
}

/// Serve the fake channel under `/fleet/` and return its address.
async fn control_plane(command: CommandMessage) -> (SocketAddr, mpsc::UnboundedReceiver<Seen>) {
    let (seen, rx) = mpsc::unbounded_channel();
    let app = Router::new()
        .route("/fleet/v1/gateways/{gateway}/channel", get(channel))
        .with_state(Relay { command, seen });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, rx)
}

fn command() -> CommandMessage {
    CommandMessage {
        command: CommandKind::Update,
        version: "1.5.0".to_string(),
        manifest_url: "http://fleet.local/artifacts/1.5.0/manifest.json".to_string(),
        signature_url: "http://fleet.local/artifacts/1.5.0/manifest.sig".to_string(),
        update_id: UpdateId::new(),
    }
}

fn client(base_url: &str) -> ApiClient {
    ApiClient::new(
        base_url,
        Some("gw-secret"),
        GatewayId::parse("gw-0042").unwrap(),
        DownloadConfig::default(),
    )
    .unwrap()
}

async fn next_seen(rx: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("channel activity")
        .expect("relay alive")
}

#[tokio::test]
async fn channel_receives_commands_and_sends_progress() {
    if !can_bind_localhost() {
        eprintln!("Skipping channel tests: cannot bind to localhost");
        return;
    }

    let offered = command();
    let (addr, mut seen) = control_plane(offered.clone()).await;
    // No trailing slash: the prefix must still be kept.
    let api = client(&format!("http://{addr}/fleet"));

    let mut channel = GatewayChannel::connect(&api).await.unwrap();
    match next_seen(&mut seen).await {
        Seen::Opened {
            gateway,
            authorization,
        } => {
            assert_eq!(gateway, "gw-0042");
            assert_eq!(authorization, "Bearer gw-secret");
        }
        other => panic!("unexpected: {other:?}"),
    }

    let pushed = tokio::time::timeout(Duration::from_secs(5), channel.next_command())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pushed, offered);

    let message = ProgressMessage::new(offered.update_id, UpdateState::Downloading, 10);
    channel.progress_sender().send(message.clone()).await.unwrap();
    match next_seen(&mut seen).await {
        Seen::Frame(text) => {
            let received: ProgressMessage = serde_json::from_str(&text).unwrap();
            assert_eq!(received, message);
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn reporter_prefers_channel_and_falls_back_to_rest() {
    if !can_bind_localhost() {
        eprintln!("Skipping channel tests: cannot bind to localhost");
        return;
    }

    let offered = command();
    let (addr, mut seen) = control_plane(offered.clone()).await;
    let rest = MockServer::start_async().await;
    let rest_progress = rest
        .mock_async(|when, then| {
            when.method(POST).path("/updates/progress");
            then.status(200)
                .json_body(json!({"result": "applied", "state": "verifying"}));
        })
        .await;

    let channel = GatewayChannel::connect(&client(&format!("http://{addr}/fleet/")))
        .await
        .unwrap();
    let _ = next_seen(&mut seen).await;

    let reporter = ChannelReporter::new(client(&rest.base_url()));
    reporter.attach(channel.progress_sender());

    let downloading = ProgressMessage::new(offered.update_id, UpdateState::Downloading, 10);
    reporter.progress(&downloading).await;
    match next_seen(&mut seen).await {
        Seen::Frame(text) => assert!(text.contains("downloading")),
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(rest_progress.hits_async().await, 0);

    reporter.detach();
    let verifying = ProgressMessage::new(offered.update_id, UpdateState::Verifying, 25);
    reporter.progress(&verifying).await;
    assert_eq!(rest_progress.hits_async().await, 1);
}
