//! Exercises `GeminiLiveConnection` against a local websocket server.

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use gemini_realtime::{
    ClientContent, ConnectionConfig, ConnectionState, DEFAULT_MODEL, GeminiLiveConnection,
    RECEIVE_RETRY_DELAY, RealtimeError,
};
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, tungstenite::Message};

const WAIT: Duration = Duration::from_secs(5);

struct MockServer {
    endpoint: String,
    /// Every frame a client sent, across connections, in arrival order.
    received: mpsc::UnboundedReceiver<Message>,
    /// Frames pushed to whichever client is currently connected.
    outgoing: mpsc::UnboundedSender<Message>,
}

async fn start_mock_server() -> MockServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (received_tx, received) = mpsc::unbounded_channel();
    let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let Ok(ws_stream) = accept_async(stream).await else {
                continue;
            };
            let (mut write, mut read) = ws_stream.split();
            loop {
                tokio::select! {
                    incoming = read.next() => match incoming {
                        Some(Ok(msg)) => {
                            let is_close = matches!(msg, Message::Close(_));
                            let _ = received_tx.send(msg);
                            if is_close {
                                break;
                            }
                        }
                        _ => break,
                    },
                    Some(msg) = outgoing_rx.recv() => {
                        if write.send(msg).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    });

    MockServer {
        endpoint: format!("ws://{}", addr),
        received,
        outgoing,
    }
}

impl MockServer {
    /// Next JSON text frame from the client, skipping control frames.
    async fn next_json(&mut self) -> Value {
        loop {
            let msg = timeout(WAIT, self.received.recv())
                .await
                .expect("timed out waiting for client frame")
                .expect("mock server stopped");
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    async fn next_close(&mut self) {
        loop {
            let msg = timeout(WAIT, self.received.recv())
                .await
                .expect("timed out waiting for close")
                .expect("mock server stopped");
            if matches!(msg, Message::Close(_)) {
                return;
            }
        }
    }

    fn push(&self, frame: Value) {
        self.outgoing
            .send(Message::Text(frame.to_string()))
            .unwrap();
    }
}

/// Adds enough initial context to fill the socket buffers of a peer that
/// is not reading, so the handshake blocks part way through.
fn with_oversized_context(config: ConnectionConfig) -> ConnectionConfig {
    let text = "x".repeat(64 * 1024);
    (0..400).fold(config, |config, _| {
        config.with_initial_message(ClientContent::text("user", text.clone(), false))
    })
}

fn b64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Records callback invocations as labels, in the order they happen.
fn record_events(connection: &GeminiLiveConnection) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();

    let sender = tx.clone();
    connection.on_setup_complete(move || {
        let sender = sender.clone();
        async move {
            let _ = sender.send("setup".to_string());
        }
    });
    let sender = tx.clone();
    connection.on_model_audio(move |audio| {
        let sender = sender.clone();
        async move {
            let _ = sender.send(format!("audio:{:?}", audio.as_ref()));
        }
    });
    let sender = tx.clone();
    connection.on_interrupted(move || {
        let sender = sender.clone();
        async move {
            let _ = sender.send("interrupted".to_string());
        }
    });
    let sender = tx.clone();
    connection.on_turn_complete(move || {
        let sender = sender.clone();
        async move {
            let _ = sender.send("turn_complete".to_string());
        }
    });
    let sender = tx.clone();
    connection.on_transcript(move |transcript| {
        let sender = sender.clone();
        async move {
            let _ = sender.send(format!("transcript:{:?}:{}", transcript.role, transcript.text));
        }
    });
    let sender = tx.clone();
    connection.on_go_away(move |time_left| {
        let sender = sender.clone();
        async move {
            let _ = sender.send(format!("go_away:{:?}", time_left));
        }
    });
    let sender = tx;
    connection.on_closed(move || {
        let sender = sender.clone();
        async move {
            let _ = sender.send("closed".to_string());
        }
    });
    rx
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<String>) -> String {
    timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for callback")
        .expect("callback channel closed")
}

#[tokio::test]
async fn test_handshake_is_sent_in_order_before_audio() {
    let mut server = start_mock_server().await;
    let connection = GeminiLiveConnection::new();
    connection.configure(
        ConnectionConfig::new("test-key")
            .with_endpoint(&server.endpoint)
            .with_system_instruction("You are terse.")
            .with_initial_message(ClientContent::text("user", "first", false))
            .with_initial_message(ClientContent::text("user", "second", true)),
    );

    // Not connected yet: silently dropped.
    connection
        .send_user_audio(Bytes::from_static(&[1, 2]))
        .await
        .unwrap();

    connection.connect().await.unwrap();
    assert!(connection.is_open());
    assert!(connection.handshake_complete());

    let setup = server.next_json().await;
    assert_eq!(setup["setup"]["model"], DEFAULT_MODEL);
    assert_eq!(
        setup["setup"]["systemInstruction"]["parts"][0]["text"],
        "You are terse."
    );
    assert_eq!(
        setup["setup"]["generationConfig"]["responseModalities"],
        json!(["AUDIO"])
    );

    let first = server.next_json().await;
    assert_eq!(first["clientContent"]["turns"][0]["parts"][0]["text"], "first");
    assert_eq!(first["clientContent"]["turnComplete"], false);
    let second = server.next_json().await;
    assert_eq!(second["clientContent"]["turns"][0]["parts"][0]["text"], "second");

    connection
        .send_user_audio(Bytes::from_static(&[7, 8, 9, 10]))
        .await
        .unwrap();
    let audio = server.next_json().await;
    assert_eq!(
        audio["realtimeInput"]["audio"]["mimeType"],
        "audio/pcm;rate=16000"
    );
    assert_eq!(audio["realtimeInput"]["audio"]["data"], b64(&[7, 8, 9, 10]));

    connection.send_end_of_turn().await.unwrap();
    assert_eq!(
        server.next_json().await,
        json!({ "realtimeInput": { "audioStreamEnd": true } })
    );

    connection
        .send_client_content(ClientContent::text("user", "typed", true))
        .await
        .unwrap();
    let typed = server.next_json().await;
    assert_eq!(typed["clientContent"]["turns"][0]["parts"][0]["text"], "typed");
}

#[tokio::test]
async fn test_server_events_reach_callbacks_in_order() {
    let mut server = start_mock_server().await;
    let connection = GeminiLiveConnection::new();
    let mut events = record_events(&connection);
    connection.configure(ConnectionConfig::new("k").with_endpoint(&server.endpoint));
    connection.connect().await.unwrap();
    server.next_json().await;

    server
        .outgoing
        .send(Message::Text("definitely not json".to_string()))
        .unwrap();
    server.push(json!({ "setupComplete": {} }));
    server.push(json!({ "usageMetadata": { "totalTokenCount": 3 } }));
    server.push(json!({
        "serverContent": { "modelTurn": { "parts": [{ "inlineData": { "data": b64(&[1, 2, 3]) } }] } }
    }));
    server.push(json!({ "serverContent": { "interrupted": true } }));
    server.push(json!({ "serverContent": { "outputTranscription": { "text": "hello" } } }));
    server
        .outgoing
        .send(Message::Binary(
            br#"{"serverContent":{"turnComplete":true}}"#.to_vec(),
        ))
        .unwrap();
    server.push(json!({ "goAway": { "timeLeft": "10s" } }));

    assert_eq!(next_event(&mut events).await, "setup");
    assert_eq!(next_event(&mut events).await, "audio:[1, 2, 3]");
    assert_eq!(next_event(&mut events).await, "interrupted");
    assert_eq!(next_event(&mut events).await, "transcript:Model:hello");
    assert_eq!(next_event(&mut events).await, "turn_complete");
    assert_eq!(next_event(&mut events).await, "go_away:Some(\"10s\")");
    assert!(connection.is_open());
}

#[tokio::test]
async fn test_server_close_tears_down_and_allows_reconnect() {
    let mut server = start_mock_server().await;
    let connection = GeminiLiveConnection::new();
    let mut events = record_events(&connection);
    connection.configure(ConnectionConfig::new("k").with_endpoint(&server.endpoint));
    connection.connect().await.unwrap();
    server.next_json().await;

    server.outgoing.send(Message::Close(None)).unwrap();
    assert_eq!(next_event(&mut events).await, "closed");
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert!(!connection.handshake_complete());

    // Dropped, not an error, once closed.
    connection
        .send_user_audio(Bytes::from_static(&[0, 0]))
        .await
        .unwrap();

    connection.connect().await.unwrap();
    let setup = server.next_json().await;
    assert!(setup.get("setup").is_some());
    assert!(connection.is_open());
}

#[tokio::test]
async fn test_disconnect_closes_socket_once() {
    let mut server = start_mock_server().await;
    let connection = GeminiLiveConnection::new();
    let mut events = record_events(&connection);
    connection.configure(ConnectionConfig::new("k").with_endpoint(&server.endpoint));
    connection.connect().await.unwrap();
    server.next_json().await;

    connection.disconnect().await.unwrap();
    server.next_close().await;
    assert_eq!(next_event(&mut events).await, "closed");
    assert_eq!(connection.state(), ConnectionState::Closed);

    connection.disconnect().await.unwrap();
    assert!(
        timeout(Duration::from_millis(200), events.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_second_connect_while_open_is_rejected() {
    let mut server = start_mock_server().await;
    let connection = GeminiLiveConnection::new();
    connection.configure(ConnectionConfig::new("k").with_endpoint(&server.endpoint));
    connection.connect().await.unwrap();
    server.next_json().await;

    assert!(matches!(
        connection.connect().await,
        Err(RealtimeError::AlreadyConnecting)
    ));
    assert!(connection.is_open());
}

#[tokio::test]
async fn test_unreachable_endpoint_reports_connection_failed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let connection = GeminiLiveConnection::new();
    connection.configure(ConnectionConfig::new("k").with_endpoint(format!("ws://{}", addr)));
    assert!(matches!(
        connection.connect().await,
        Err(RealtimeError::ConnectionFailed(_))
    ));
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert!(!connection.handshake_complete());
}

#[tokio::test]
async fn test_disconnect_during_handshake_cancels_connect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("ws://{}", listener.local_addr().unwrap());
    let (accepted_tx, accepted_rx) = oneshot::channel();
    let (drain_tx, drain_rx) = oneshot::channel::<()>();
    let (closed_tx, closed_rx) = oneshot::channel();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws_stream = accept_async(stream).await.unwrap();
        let _ = accepted_tx.send(());
        // Nothing is read until the client has given up.
        let _ = drain_rx.await;
        while let Some(Ok(_)) = ws_stream.next().await {}
        let _ = closed_tx.send(());
    });

    let connection = Arc::new(GeminiLiveConnection::new());
    let mut events = record_events(&connection);
    connection.configure(with_oversized_context(
        ConnectionConfig::new("k").with_endpoint(endpoint),
    ));
    let connecting = tokio::spawn({
        let connection = connection.clone();
        async move { connection.connect().await }
    });

    timeout(WAIT, accepted_rx).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(connection.state(), ConnectionState::Connecting);

    timeout(WAIT, connection.disconnect()).await.unwrap().unwrap();
    let result = timeout(WAIT, connecting).await.unwrap().unwrap();
    assert!(matches!(result, Err(RealtimeError::Cancelled)));
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert!(!connection.handshake_complete());

    // The socket is gone: the server reaches the end of the stream.
    drain_tx.send(()).unwrap();
    timeout(WAIT, closed_rx).await.unwrap().unwrap();
    // A handshake that never finished is not reported as a closed session.
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_server_closing_during_handshake_fails_connect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("ws://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws_stream = accept_async(stream).await.unwrap();
        drop(ws_stream);
    });

    let connection = GeminiLiveConnection::new();
    let mut events = record_events(&connection);
    connection.configure(with_oversized_context(
        ConnectionConfig::new("k").with_endpoint(endpoint),
    ));

    let result = timeout(WAIT, connection.connect()).await.unwrap();
    assert!(matches!(result, Err(RealtimeError::WebSocket(_))));
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert!(!connection.handshake_complete());
    assert!(events.try_recv().is_err());

    // The failed attempt leaves nothing to disconnect.
    connection.disconnect().await.unwrap();
    assert_eq!(connection.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_non_terminal_read_error_waits_before_teardown() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("ws://{}", listener.local_addr().unwrap());
    let (setup_tx, setup_rx) = oneshot::channel();
    let (send_tx, send_rx) = oneshot::channel::<()>();
    let (_hold_tx, hold_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws_stream = accept_async(stream).await.unwrap();
        if let Some(Ok(Message::Text(setup))) = ws_stream.next().await {
            let _ = setup_tx.send(setup);
        }
        let _ = send_rx.await;
        // A final text frame whose payload is not UTF-8.
        ws_stream
            .get_mut()
            .write_all(&[0x81, 0x02, 0xc3, 0x28])
            .await
            .unwrap();
        let _ = hold_rx.await;
    });

    let connection = GeminiLiveConnection::new();
    let mut events = record_events(&connection);
    connection.configure(ConnectionConfig::new("k").with_endpoint(endpoint));
    connection.connect().await.unwrap();
    let setup = timeout(WAIT, setup_rx).await.unwrap().unwrap();
    assert!(setup.contains("\"setup\""));

    let started = Instant::now();
    send_tx.send(()).unwrap();
    assert_eq!(next_event(&mut events).await, "closed");
    assert!(started.elapsed() >= RECEIVE_RETRY_DELAY);
    assert_eq!(connection.state(), ConnectionState::Closed);
}
