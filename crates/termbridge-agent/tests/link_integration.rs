//! Cloud link behaviour against a local mock cloud server.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use termbridge_agent::config::Config;
use termbridge_agent::link::CloudLink;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

type ServerWs = WebSocketStream<TcpStream>;

fn config_for(addr: &str) -> Config {
    Config {
        server_url: format!("http://{addr}"),
        api_key: "test-key".to_string(),
        machine_id: "machine-test".to_string(),
        machine_name: "itest".to_string(),
        ..Config::default()
    }
}

/// Accept one WebSocket connection, capturing the request path and the
/// User-Agent header the agent presented.
async fn accept_ws(listener: &TcpListener, seen: Arc<Mutex<Vec<(String, String)>>>) -> ServerWs {
    let (stream, _) = tokio::time::timeout(Duration::from_secs(10), listener.accept())
        .await
        .expect("timed out waiting for agent to dial")
        .expect("accept failed");

    let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        let path = req.uri().to_string();
        let user_agent = req
            .headers()
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        seen.lock().unwrap().push((path, user_agent));
        Ok(resp)
    };

    tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .expect("server handshake failed")
}

/// Next text frame as JSON, skipping control frames.
async fn next_text(ws: &mut ServerWs) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection ended unexpectedly")
            .expect("read error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).expect("valid JSON"),
            Message::Close(_) => panic!("unexpected close frame"),
            _ => continue,
        }
    }
}

/// Read until a close frame arrives.
async fn expect_close(ws: &mut ServerWs) {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for close")
        {
            None => return,
            Some(Ok(Message::Close(_))) => return,
            Some(Ok(_)) => continue,
            Some(Err(_)) => return,
        }
    }
}

#[tokio::test]
async fn register_flows_first_then_queued_messages() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let (link, mut channels) = CloudLink::new(&config_for(&addr), "9.9.9-test");

    // Enqueued while disconnected: must be accepted and flushed after the
    // register message once the link opens.
    link.send_json(&serde_json::json!({"type": "early", "n": 1}))
        .expect("enqueue while disconnected");

    let cancel = CancellationToken::new();
    let driver = tokio::spawn(Arc::clone(&link).run(cancel.clone()));

    let mut ws = accept_ws(&listener, Arc::clone(&seen)).await;

    let register = next_text(&mut ws).await;
    assert_eq!(register["type"], "register");
    assert_eq!(register["machineId"], "machine-test");
    assert_eq!(register["name"], "itest");
    assert_eq!(register["version"], "9.9.9-test");
    assert!(matches!(register["os"].as_str(), Some("linux" | "macos" | "windows")));

    let early = next_text(&mut ws).await;
    assert_eq!(early["type"], "early");

    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "/api/ws/agent?key=test-key");
        assert_eq!(seen[0].1, "termbridge-agent/9.9.9-test");
    }

    // The open signal fires once per successful connection.
    tokio::time::timeout(Duration::from_secs(5), channels.opened.recv())
        .await
        .expect("opened signal")
        .expect("opened channel live");

    // Inbound envelopes are surfaced with their parsed type.
    ws.send(Message::Text(r#"{"type":"ping"}"#.to_string().into()))
        .await
        .unwrap();
    let frame = tokio::time::timeout(Duration::from_secs(5), channels.inbound.recv())
        .await
        .expect("inbound frame")
        .expect("inbound channel live");
    assert_eq!(frame.msg_type, "ping");

    // Malformed JSON is skipped, the link keeps going.
    ws.send(Message::Text("{not json".to_string().into()))
        .await
        .unwrap();
    ws.send(Message::Text(r#"{"type":"after_garbage"}"#.to_string().into()))
        .await
        .unwrap();
    let frame = tokio::time::timeout(Duration::from_secs(5), channels.inbound.recv())
        .await
        .expect("inbound frame")
        .expect("inbound channel live");
    assert_eq!(frame.msg_type, "after_garbage");

    // Cancellation sends a normal close frame.
    cancel.cancel();
    expect_close(&mut ws).await;
    driver.await.unwrap();
}

#[tokio::test]
async fn reconnects_and_registers_again_after_transport_loss() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let (link, mut channels) = CloudLink::new(&config_for(&addr), "9.9.9-test");
    let cancel = CancellationToken::new();
    let driver = tokio::spawn(Arc::clone(&link).run(cancel.clone()));

    // First connection: take the register, then kill the transport.
    let mut ws = accept_ws(&listener, Arc::clone(&seen)).await;
    let register = next_text(&mut ws).await;
    assert_eq!(register["type"], "register");
    channels.opened.recv().await.expect("first open signal");
    drop(ws);

    // Give the agent a moment to notice the dead transport; it then sits in
    // backoff for ~1s, which is when we queue a message.
    tokio::time::sleep(Duration::from_millis(500)).await;
    link.send_json(&serde_json::json!({"type": "queued_during_outage"}))
        .expect("enqueue during outage");

    // The agent redials (first retry after ~1s) and registers before
    // anything else.
    let mut ws = accept_ws(&listener, Arc::clone(&seen)).await;
    let register = next_text(&mut ws).await;
    assert_eq!(register["type"], "register");
    let queued = next_text(&mut ws).await;
    assert_eq!(queued["type"], "queued_during_outage");

    tokio::time::timeout(Duration::from_secs(5), channels.opened.recv())
        .await
        .expect("second open signal")
        .expect("opened channel live");

    assert_eq!(seen.lock().unwrap().len(), 2);

    cancel.cancel();
    expect_close(&mut ws).await;
    driver.await.unwrap();
}

#[tokio::test]
async fn cancellation_during_backoff_stops_the_driver() {
    // No listener at this address: every dial fails and the driver sits in
    // backoff until cancelled.
    let cfg = config_for("127.0.0.1:9");
    let (link, _channels) = CloudLink::new(&cfg, "9.9.9-test");
    let cancel = CancellationToken::new();
    let driver = tokio::spawn(Arc::clone(&link).run(cancel.clone()));

    tokio::time::sleep(Duration::from_millis(300)).await;
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), driver)
        .await
        .expect("driver exits after cancellation")
        .unwrap();
}
