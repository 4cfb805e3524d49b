use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use switchboard_hub::config::{Config, RetentionConfig};
use switchboard_hub::{serve, Hub};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestHub {
    addr: SocketAddr,
    hub: Arc<Hub>,
    _shutdown: oneshot::Sender<()>,
}

async fn start(config: Config) -> TestHub {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let hub = Arc::new(Hub::new(config, None));
    let (tx, rx) = oneshot::channel::<()>();
    let server_hub = hub.clone();
    tokio::spawn(async move {
        let _ = serve(listener, server_hub, async move {
            let _ = rx.await;
        })
        .await;
    });
    TestHub {
        addr,
        hub,
        _shutdown: tx,
    }
}

async fn connect(addr: SocketAddr) -> Socket {
    let (socket, _) = connect_async(format!("ws://{addr}/ws")).await.expect("connect");
    socket
}

async fn send(socket: &mut Socket, event: &str, data: Value) {
    send_frame(socket, json!({"version": "1", "event": event, "data": data})).await;
}

async fn send_frame(socket: &mut Socket, frame: Value) {
    socket
        .send(Message::Text(frame.to_string()))
        .await
        .expect("send frame");
}

/// Next frame named `event`; other frames are skipped.
async fn recv_event(socket: &mut Socket, event: &str) -> Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let message = tokio::time::timeout_at(deadline, socket.next())
            .await
            .unwrap_or_else(|_| panic!("no {event} frame before deadline"))
            .expect("socket open")
            .expect("read frame");
        if let Message::Text(text) = message {
            let frame: Value = serde_json::from_str(&text).expect("json frame");
            if frame["event"] == event {
                return frame;
            }
        }
    }
}

async fn get_json(addr: SocketAddr, path: &str) -> (u16, Value) {
    let response = reqwest::get(format!("http://{addr}{path}")).await.expect("http");
    let status = response.status().as_u16();
    let body = response.json::<Value>().await.unwrap_or(Value::Null);
    (status, body)
}

/// Waits until the hub has processed `join` for `agent_id`.
async fn wait_for_agent(hub: &Hub, agent_id: &str) {
    for _ in 0..100 {
        if hub.roster.live_handle(agent_id).await.is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("agent {agent_id} never joined");
}

#[tokio::test]
async fn command_round_trip_over_websocket() {
    let server = start(Config::default()).await;
    let mut agent = connect(server.addr).await;
    send(&mut agent, "join", json!({"agentId": "A1", "model": "X"})).await;
    wait_for_agent(&server.hub, "A1").await;

    let mut controller = connect(server.addr).await;
    send(&mut controller, "adminJoin", Value::Null).await;
    let snapshot = recv_event(&mut controller, "join").await;
    assert_eq!(snapshot["data"]["agentId"], "A1");
    assert_eq!(snapshot["data"]["attributes"]["model"], "X");

    send(
        &mut controller,
        "request",
        json!({"to": "A1", "action": "getInventory", "options": {"timeoutMs": 5000}}),
    )
    .await;

    let command = recv_event(&mut agent, "getInventory").await;
    let token = command["requestId"].as_str().expect("token").to_string();
    send_frame(
        &mut agent,
        json!({"event": "getInventory", "requestId": token, "data": {"agentId": "A1", "data": ["alice", "bob"]}}),
    )
    .await;

    let fanout = recv_event(&mut controller, "getInventory").await;
    assert_eq!(fanout["data"], json!({"agentId": "A1", "data": ["alice", "bob"]}));
    let result = recv_event(&mut controller, "requestResult").await;
    assert_eq!(result["data"]["ok"], true);
    assert_eq!(result["data"]["to"], "A1");
    assert_eq!(result["data"]["result"], json!(["alice", "bob"]));

    let (status, device) = get_json(server.addr, "/device/A1").await;
    assert_eq!(status, 200);
    assert_eq!(device["device"]["payloads"]["inventory"]["value"], json!(["alice", "bob"]));
    assert_eq!(device["device"]["attributes"]["ip"], "127.0.0.1");

    let (status, devices) = get_json(server.addr, "/devices").await;
    assert_eq!(status, 200);
    assert_eq!(devices["ok"], true);
    assert_eq!(devices["devices"].as_array().map(Vec::len), Some(1));

    let (status, logs) = get_json(server.addr, "/logs?limit=2").await;
    assert_eq!(status, 200);
    assert!(logs["logs"].as_array().is_some_and(|logs| logs.len() <= 2 && !logs.is_empty()));

    let (status, _) = get_json(server.addr, "/device/nobody").await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn unknown_target_is_rejected_immediately() {
    let server = start(Config::default()).await;
    let mut controller = connect(server.addr).await;
    send(&mut controller, "adminJoin", Value::Null).await;
    send(
        &mut controller,
        "sendCommand",
        json!({"agentId": "ghost", "command": "getStatus"}),
    )
    .await;
    let result = recv_event(&mut controller, "requestResult").await;
    assert_eq!(result["data"]["ok"], false);
    assert_eq!(result["data"]["reason"], "agent_not_connected");
    assert_eq!(server.hub.pending.total().await, 0);
}

#[tokio::test]
async fn agent_disconnect_clears_handle_and_notifies_controllers() {
    let server = start(Config::default()).await;
    let mut controller = connect(server.addr).await;
    send(&mut controller, "adminJoin", Value::Null).await;

    let mut agent = connect(server.addr).await;
    send(&mut agent, "join", json!({"agentId": "A1"})).await;
    let joined = recv_event(&mut controller, "join").await;
    let handle = joined["data"]["transportHandle"].as_str().expect("handle").to_string();

    agent.close(None).await.expect("close");
    let notice = recv_event(&mut controller, "disconnectClient").await;
    assert_eq!(notice["data"]["socketRef"], handle.as_str());

    let (_, device) = get_json(server.addr, "/device/A1").await;
    assert_eq!(device["device"]["transportHandle"], Value::Null);

    let mut again = connect(server.addr).await;
    send(&mut again, "join", json!({"agentId": "A1"})).await;
    let rejoined = recv_event(&mut controller, "join").await;
    assert_ne!(rejoined["data"]["transportHandle"], handle.as_str());
    assert!(rejoined["data"]["transportHandle"].is_string());
}

#[tokio::test]
async fn malformed_frames_do_not_break_the_connection() {
    let server = start(Config::default()).await;
    let mut agent = connect(server.addr).await;
    agent
        .send(Message::Text("{not json".to_string()))
        .await
        .expect("send garbage");
    send_frame(&mut agent, json!({"event": "", "data": 1})).await;
    // Unattributable event: the connection never joined.
    send(&mut agent, "getStatus", json!("orphan")).await;

    send(&mut agent, "join", json!({"agentId": "A2"})).await;
    wait_for_agent(&server.hub, "A2").await;
}

#[tokio::test]
async fn large_payloads_are_served_from_the_blob_store() {
    let config = Config {
        retention: RetentionConfig {
            inline_payload_limit: 64,
            blob_budget: 1024 * 1024,
        },
        ..Config::default()
    };
    let server = start(config).await;
    let mut agent = connect(server.addr).await;
    send(&mut agent, "join", json!({"agentId": "A1"})).await;
    wait_for_agent(&server.hub, "A1").await;

    let entries = (0..20).map(|n| format!("entry-{n}")).collect::<Vec<_>>();
    send(&mut agent, "getAuditTrail", json!({"agentId": "A1", "data": entries})).await;

    let mut stored = Value::Null;
    for _ in 0..100 {
        let (_, device) = get_json(server.addr, "/device/A1").await;
        stored = device["device"]["payloads"]["auditTrail"].clone();
        if !stored.is_null() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(stored["storage"], "blob");
    assert_eq!(stored["blobId"], "A1/auditTrail");

    let (status, blob) = get_json(server.addr, "/blobs/A1/auditTrail").await;
    assert_eq!(status, 200);
    assert_eq!(blob, json!(entries));

    let (status, _) = get_json(server.addr, "/blobs/A1/missing").await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn health_endpoint_answers() {
    let server = start(Config::default()).await;
    let response = reqwest::get(format!("http://{}/health", server.addr))
        .await
        .expect("health");
    assert!(response.status().is_success());
    assert_eq!(response.text().await.expect("body"), "ok");
}
