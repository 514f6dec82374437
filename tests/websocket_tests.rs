//! Delegate stream integration tests

use futures::{SinkExt, StreamExt};
use conductor::clock::SystemClock;
use conductor::config::DispatchSettings;
use conductor::store::Store;
use conductor::AppState;
use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn setup_server() -> (SocketAddr, Arc<AppState>) {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");

    Store::new(pool.clone())
        .migrate()
        .await
        .expect("Failed to run migrations");

    let state = AppState::new(pool, DispatchSettings::default(), Arc::new(SystemClock));
    let app = conductor::router(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start
    tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

    (addr, state)
}

async fn register(state: &AppState, host: &str) -> uuid::Uuid {
    state
        .registry
        .register(
            "acct",
            conductor::delegate::NewDelegate {
                host_name: host.to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .id
}

async fn connect(addr: SocketAddr, delegate_id: uuid::Uuid) -> Ws {
    let url = format!("ws://{}/accounts/acct/delegates/{}/stream", addr, delegate_id);
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    let hello = next_json(&mut ws).await;
    assert_eq!(hello["type"], "connected");
    ws
}

async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

async fn next_json(ws: &mut Ws) -> Value {
    loop {
        let msg = tokio::time::timeout(std::time::Duration::from_secs(5), ws.next())
            .await
            .expect("Timed out waiting for a message");
        match msg {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
            Some(Ok(_)) => continue,
            other => panic!("Expected text message, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_unknown_delegate_is_rejected() {
    let (addr, _state) = setup_server().await;
    let url = format!(
        "ws://{}/accounts/acct/delegates/{}/stream",
        addr,
        uuid::Uuid::new_v4()
    );
    assert!(tokio_tungstenite::connect_async(&url).await.is_err());
}

#[tokio::test]
async fn test_heartbeat_ack() {
    let (addr, state) = setup_server().await;
    let delegate_id = register(&state, "build-01").await;
    let mut ws = connect(addr, delegate_id).await;

    let connection_id = uuid::Uuid::new_v4();
    send_json(
        &mut ws,
        json!({ "type": "heartbeat", "connection_id": connection_id, "version": "1.2.3" }),
    )
    .await;

    let ack = next_json(&mut ws).await;
    assert_eq!(ack["type"], "heartbeat_ack");
    assert_eq!(ack["connection_id"], connection_id.to_string());

    let connections = state.registry.connections("acct", delegate_id).await.unwrap();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].version, "1.2.3");
}

#[tokio::test]
async fn test_invalid_message_reports_error() {
    let (addr, state) = setup_server().await;
    let delegate_id = register(&state, "build-01").await;
    let mut ws = connect(addr, delegate_id).await;

    ws.send(Message::Text("not json".to_string())).await.unwrap();
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert!(reply["message"].as_str().unwrap().starts_with("Invalid message"));
}

#[tokio::test]
async fn test_broadcast_acquire_and_respond_over_stream() {
    let (addr, state) = setup_server().await;
    let delegate_id = register(&state, "build-01").await;
    let mut ws = connect(addr, delegate_id).await;

    let task = state
        .coordinator
        .queue_task(
            "acct",
            conductor::task::TaskRequest::new(conductor::task::TaskData::new("SHELL", 60_000)),
            None,
        )
        .await
        .unwrap();

    let pushed = next_json(&mut ws).await;
    assert_eq!(pushed["type"], "dispatch");
    assert_eq!(pushed["event"]["type"], "task_broadcast");
    assert_eq!(pushed["event"]["task_id"], task.id.to_string());

    send_json(&mut ws, json!({ "type": "acquire", "task_id": task.id })).await;

    // The assignment event and the acquire reply may arrive in either order
    let mut acquired = None;
    for _ in 0..2 {
        let msg = next_json(&mut ws).await;
        if msg["type"] == "acquired" {
            acquired = Some(msg);
        } else {
            assert_eq!(msg["event"]["type"], "task_assigned");
        }
    }
    let acquired = acquired.expect("No acquire reply");
    assert_eq!(acquired["outcome"]["outcome"], "assigned");

    send_json(
        &mut ws,
        json!({
            "type": "response",
            "task_id": task.id,
            "response": { "response_code": "OK", "data": "done" }
        }),
    )
    .await;
    let accepted = next_json(&mut ws).await;
    assert_eq!(accepted["type"], "response_accepted");

    let stored = state.coordinator.get_task("acct", task.id).await.unwrap();
    assert_eq!(stored.status, conductor::task::TaskStatus::Completed);
}

#[tokio::test]
async fn test_poll_lists_pending_tasks() {
    let (addr, state) = setup_server().await;
    let delegate_id = register(&state, "build-01").await;

    let task = state
        .coordinator
        .queue_task(
            "acct",
            conductor::task::TaskRequest::new(conductor::task::TaskData::new("SHELL", 60_000)),
            None,
        )
        .await
        .unwrap();

    let mut ws = connect(addr, delegate_id).await;
    send_json(&mut ws, json!({ "type": "poll" })).await;

    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "pending");
    assert_eq!(reply["tasks"][0]["task_id"], task.id.to_string());
    assert_eq!(reply["tasks"][0]["is_async"], true);
}
