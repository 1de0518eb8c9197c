use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::{Config, HubTuning, StorageBackend};
use crate::frame::{Frame, Status};
use crate::protocol;
use crate::routes;
use crate::services::hub::{self, Hub};
use crate::state::AppState;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

async fn start_server(tuning: HubTuning) -> SocketAddr {
    let config = Config { storage: StorageBackend::Memory, hub: tuning, ..Config::default() };
    let (handle, _task) = hub::spawn(Hub::new(config.hub, None, None));
    let app = routes::app(AppState::new(handle, config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn open(addr: SocketAddr, query: &str) -> Client {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws{query}")).await.unwrap();
    ws
}

async fn recv_frame(ws: &mut Client) -> Frame {
    loop {
        let msg = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("socket error");
        if let WsMessage::Text(text) = msg {
            return serde_json::from_str(text.as_str()).expect("valid frame");
        }
    }
}

async fn send_json(ws: &mut Client, value: serde_json::Value) {
    ws.send(WsMessage::Text(value.to_string().into())).await.unwrap();
}

/// Connect and consume the two welcome frames. Returns the assigned identity.
async fn join(ws: &mut Client) -> String {
    let assigned = recv_frame(ws).await;
    assert_eq!(assigned.syscall, protocol::SESSION_ASSIGNED);
    let state = recv_frame(ws).await;
    assert_eq!(state.syscall, protocol::CANVAS_STATE);
    assigned.data["identity"].as_str().unwrap().to_string()
}

async fn assert_silent(ws: &mut Client) {
    let next = tokio::time::timeout(Duration::from_millis(200), ws.next()).await;
    assert!(next.is_err(), "expected no frame, got {next:?}");
}

async fn http_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn two_clients_draw_scenario() {
    let addr = start_server(HubTuning::default()).await;
    let mut alice = open(addr, "").await;
    let mut bob = open(addr, "").await;
    let alice_id = join(&mut alice).await;
    let bob_id = join(&mut bob).await;
    assert_ne!(alice_id, bob_id);

    send_json(
        &mut alice,
        json!({
            "syscall": protocol::STROKE_DRAW,
            "data": {
                "points": [{"x": 1.0, "y": 1.0}, {"x": 20.0, "y": 20.0}],
                "color": "#ff0000",
                "size": 3.0,
                "brush": "round"
            }
        }),
    )
    .await;

    let added = recv_frame(&mut bob).await;
    assert_eq!(added.syscall, protocol::STROKE_ADDED);
    assert_eq!(added.from.as_deref(), Some(alice_id.as_str()));
    assert_eq!(added.data["color"], "#ff0000");
    assert_silent(&mut alice).await;

    send_json(&mut bob, json!({ "syscall": protocol::CANVAS_HISTORY })).await;
    let history = recv_frame(&mut bob).await;
    assert_eq!(history.status, Status::Done);
    assert_eq!(history.data["strokes"].as_array().map(Vec::len), Some(1));

    alice.close(None).await.unwrap();
    let left = recv_frame(&mut bob).await;
    assert_eq!(left.syscall, protocol::USER_LEFT);
    assert_eq!(left.data["identity"], alice_id.as_str());
}

#[tokio::test]
async fn late_joiner_receives_existing_strokes() {
    let addr = start_server(HubTuning::default()).await;
    let mut alice = open(addr, "").await;
    join(&mut alice).await;
    send_json(
        &mut alice,
        json!({
            "syscall": protocol::STROKE_DRAW,
            "data": {"points": [{"x": 5.0, "y": 5.0}], "color": "#000", "size": 2.0, "brush": "round"}
        }),
    )
    .await;
    // Round-trip a ping so the stroke is known to be applied.
    send_json(&mut alice, json!({ "syscall": protocol::SESSION_PING })).await;
    assert_eq!(recv_frame(&mut alice).await.syscall, protocol::SESSION_PING);

    let mut carol = open(addr, "").await;
    assert_eq!(recv_frame(&mut carol).await.syscall, protocol::SESSION_ASSIGNED);
    let state = recv_frame(&mut carol).await;
    assert_eq!(state.syscall, protocol::CANVAS_STATE);
    assert_eq!(state.data["strokes"].as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn invalid_frames_are_dropped_without_closing() {
    let addr = start_server(HubTuning::default()).await;
    let mut alice = open(addr, "").await;
    join(&mut alice).await;

    alice.send(WsMessage::Text("not json".into())).await.unwrap();
    send_json(&mut alice, json!({ "syscall": "board:join" })).await;
    send_json(&mut alice, json!({ "syscall": protocol::STROKE_DRAW, "data": {"points": []} })).await;

    let request_id = uuid::Uuid::new_v4();
    send_json(&mut alice, json!({ "id": request_id, "syscall": protocol::SESSION_PING })).await;
    let pong = recv_frame(&mut alice).await;
    assert_eq!(pong.parent_id, Some(request_id));
    assert_eq!(pong.status, Status::Done);
}

#[tokio::test]
async fn full_server_refuses_with_try_again_later() {
    let tuning = HubTuning { max_connections: 1, ..HubTuning::default() };
    let addr = start_server(tuning).await;
    let mut first = open(addr, "").await;
    join(&mut first).await;

    let mut second = open(addr, "").await;
    let msg = tokio::time::timeout(RECV_TIMEOUT, second.next()).await.unwrap().unwrap().unwrap();
    let WsMessage::Close(Some(close)) = &msg else {
        panic!("expected close frame, got {msg:?}");
    };
    assert_eq!(u16::from(close.code), 1013);
}

#[tokio::test]
async fn claimed_identity_is_honored() {
    let addr = start_server(HubTuning::default()).await;
    let mut alice = open(addr, "?identity=artist_7").await;
    assert_eq!(join(&mut alice).await, "artist_7");
}

#[tokio::test]
async fn health_and_stats_endpoints() {
    let addr = start_server(HubTuning::default()).await;
    let mut alice = open(addr, "").await;
    join(&mut alice).await;

    let health = http_get(addr, "/healthz").await;
    assert!(health.starts_with("HTTP/1.1 200"), "{health}");

    let stats = http_get(addr, "/api/stats").await;
    assert!(stats.starts_with("HTTP/1.1 200"), "{stats}");
    assert!(stats.contains("\"connected_clients\":1"), "{stats}");
    assert!(stats.contains("\"capacity\":2000"), "{stats}");
}
