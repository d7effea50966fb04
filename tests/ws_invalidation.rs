use std::sync::Arc;
use std::time::Duration;

use chat_relay::provider::{EchoModel, ModelRegistry};
use chat_relay::server::{router, AppState};
use chat_relay::{ChatService, Database, StreamHub};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

async fn spawn_server() -> String {
    let db = Database::open_in_memory().unwrap();
    db.initialize().unwrap();
    let service = ChatService::new(
        Arc::new(db),
        Arc::new(StreamHub::new(Duration::from_secs(5))),
        ModelRegistry::new().with(Arc::new(EchoModel::new("echo"))),
        chrono::Duration::seconds(15),
    );

    let app = router(AppState::new(service, "x-user-id"));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr.to_string()
}

async fn connect(
    addr: &str,
    user: &str,
) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
    let mut request = format!("ws://{addr}/ws").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("x-user-id", user.parse().unwrap());
    let (ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .expect("ws connect");
    ws
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chat_changes_reach_the_owner_only() {
    let addr = spawn_server().await;
    let mut alice = connect(&addr, "alice").await;
    let mut bob = connect(&addr, "bob").await;

    // Give the server a moment to subscribe both sockets.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/api/chat"))
        .header("x-user-id", "alice")
        .json(&json!({
            "chatId": "chat_ws",
            "model": "echo",
            "message": { "id": "u1", "role": "user", "content": "hello" },
        }))
        .send()
        .await
        .unwrap();
    response.text().await.unwrap();

    let mut events = Vec::new();
    let deadline = Duration::from_secs(3);
    while let Ok(Some(Ok(Message::Text(text)))) = timeout(deadline, alice.next()).await {
        let event: Value = serde_json::from_str(text.as_str()).unwrap();
        let done = event == json!({ "type": "messages", "chatId": "chat_ws" });
        events.push(event);
        if done {
            break;
        }
    }

    assert!(events.contains(&json!({ "type": "chats" })));
    assert!(events.contains(&json!({ "type": "messages", "chatId": "chat_ws" })));

    let nothing = timeout(Duration::from_millis(200), bob.next()).await;
    assert!(nothing.is_err(), "bob received alice's invalidation");
}

#[tokio::test]
async fn feed_requires_authentication() {
    let addr = spawn_server().await;
    let result = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await;
    assert!(result.is_err());
}
