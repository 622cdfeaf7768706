//! End-to-end tests over real sockets on the loopback interface.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use parley_session::{handler_fn, Config, MessageConnection, Response, Transport, Value};
use parley_websocket::{
    ServerConfig, WebSocketMessageClient, WebSocketMessageServer, WsClientTransport,
};

async fn echo_server(config: ServerConfig) -> WebSocketMessageServer {
    WebSocketMessageServer::bind(
        "127.0.0.1:0",
        config,
        handler_fn(|_conn, payload: Value| async move {
            let text = payload.as_str().unwrap_or_default().to_owned();
            Ok(Response::Single(Value::from(format!("echo {text}"))))
        }),
    )
    .await
    .expect("bind")
}

#[tokio::test]
async fn round_trip_through_the_client_singleton() {
    let server = echo_server(ServerConfig::new()).await;
    let url = format!("ws://{}", server.local_addr());

    let client = WebSocketMessageClient::create(&url).await;
    let reply = client.request_one(Value::from("hi")).await.unwrap();
    assert_eq!(reply.as_str(), Some("echo hi"));
    assert_eq!(server.connection_count(), 1);

    let again = WebSocketMessageClient::create(&url).await;
    assert_eq!(again.connection().id(), client.connection().id());

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn upgrades_on_unsupported_paths_close_with_1008() {
    let server = echo_server(ServerConfig::new().with_path("/messages")).await;
    let url = format!("ws://{}/elsewhere", server.local_addr());

    let (mut socket, _) = connect_async(&url).await.expect("upgrade");
    let frame = tokio::time::timeout(Duration::from_secs(2), socket.next())
        .await
        .expect("frame before timeout")
        .expect("frame")
        .expect("frame ok");
    match frame {
        WsMessage::Close(Some(close)) => {
            assert_eq!(close.code, CloseCode::Policy);
            assert!(close.reason.to_string().contains("unsupported path"));
        }
        other => panic!("expected a close frame, got {other:?}"),
    }
    assert_eq!(server.connection_count(), 0);

    server.close().await.unwrap();
}

#[tokio::test]
async fn allowed_path_accepts_connections() {
    let server = echo_server(ServerConfig::new().with_path("/messages")).await;
    let url = format!("ws://{}/messages", server.local_addr());

    let client = WebSocketMessageClient::create(&url).await;
    let reply = client.request_one(Value::from("in")).await.unwrap();
    assert_eq!(reply.as_str(), Some("echo in"));

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn client_transport_connects_lazily_and_reconnects() {
    let server = echo_server(ServerConfig::new()).await;
    let url = format!("ws://{}", server.local_addr());

    let transport = Arc::new(WsClientTransport::new(url));
    assert!(!transport.is_open().await);

    let conn = MessageConnection::shared(transport.clone(), Config::default()).await;
    let reply = conn.request_one(Value::from("first")).await.unwrap();
    assert_eq!(reply.as_str(), Some("echo first"));
    assert!(transport.is_open().await);

    // Close, then send again: the transport reconnects on its own.
    transport.close().await.unwrap();
    assert!(!transport.is_open().await);
    let reply = conn.request_one(Value::from("second")).await.unwrap();
    assert_eq!(reply.as_str(), Some("echo second"));
    assert!(transport.is_open().await);

    server.close().await.unwrap();
}

#[tokio::test]
async fn connect_errors_name_the_url() {
    // Nothing is listening here.
    let transport = WsClientTransport::new("ws://127.0.0.1:1/none");
    let err = transport.connect().await.unwrap_err();
    let text = err.to_string();
    assert!(text.contains("ws://127.0.0.1:1/none"), "got: {text}");
}

#[tokio::test]
async fn server_pushes_fan_out_to_every_handler() {
    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel::<MessageConnection>();
    let server = echo_server(ServerConfig::new().on_connect(move |conn| {
        let _ = conn_tx.send(conn);
    }))
    .await;
    let url = format!("ws://{}", server.local_addr());

    let client = WebSocketMessageClient::create(&url).await;
    let (push_tx, mut push_rx) = mpsc::unbounded_channel::<(u8, Value)>();
    let tx1 = push_tx.clone();
    client.add_receive_handler(move |payload| {
        let tx1 = tx1.clone();
        async move {
            let _ = tx1.send((1, payload));
        }
    });
    let tx2 = push_tx;
    client.add_receive_handler(move |payload| {
        let tx2 = tx2.clone();
        async move {
            let _ = tx2.send((2, payload));
        }
    });

    // Drive the connection so the server side exists.
    let _ = client.request_one(Value::from("hello")).await.unwrap();
    eprintln!("DEBUG: request_one done, waiting for conn_rx");
    let server_side = tokio::time::timeout(Duration::from_secs(2), conn_rx.recv())
        .await
        .expect("conn_rx timeout")
        .unwrap();
    eprintln!("DEBUG: got server_side conn");

    server_side.send(Value::from("pushed")).await.unwrap();
    eprintln!("DEBUG: server_side.send done");

    let mut seen = Vec::new();
    for i in 0..2 {
        eprintln!("DEBUG test: waiting for push {i}");
        let (id, payload) = tokio::time::timeout(Duration::from_secs(2), push_rx.recv())
            .await
            .expect("push before timeout")
            .expect("push");
        eprintln!("DEBUG test: got push {i} id={id}");
        assert_eq!(payload.as_str(), Some("pushed"));
        seen.push(id);
    }
    eprintln!("DEBUG test: loop done");
    seen.sort_unstable();
    assert_eq!(seen, vec![1, 2]);

    eprintln!("DEBUG test: closing client");
    client.close().await.unwrap();
    eprintln!("DEBUG test: closing server");
    server.close().await.unwrap();
    eprintln!("DEBUG test: all closed");
}

#[tokio::test]
async fn disconnect_hook_fires_and_deregisters() {
    let (gone_tx, mut gone_rx) = mpsc::unbounded_channel::<String>();
    let server = echo_server(ServerConfig::new().on_disconnect(move |id| {
        let _ = gone_tx.send(id);
    }))
    .await;
    let url = format!("ws://{}", server.local_addr());

    let transport = Arc::new(WsClientTransport::new(url));
    let conn = MessageConnection::shared(transport.clone(), Config::default()).await;
    let _ = conn.request_one(Value::from("hi")).await.unwrap();
    assert_eq!(server.connection_count(), 1);

    transport.close().await.unwrap();

    let gone = tokio::time::timeout(Duration::from_secs(2), gone_rx.recv())
        .await
        .expect("disconnect before timeout")
        .expect("disconnect id");
    assert!(!gone.is_empty());
    assert_eq!(server.connection_count(), 0);

    server.close().await.unwrap();
}

#[tokio::test]
async fn streamed_responses_cross_the_socket() {
    let server = WebSocketMessageServer::bind(
        "127.0.0.1:0",
        ServerConfig::new(),
        handler_fn(|_conn, _payload| async move {
            Ok(Response::stream_of([
                Value::from("a"),
                Value::from("b"),
                Value::from("c"),
            ]))
        }),
    )
    .await
    .expect("bind");
    let url = format!("ws://{}", server.local_addr());

    let client = WebSocketMessageClient::create(&url).await;
    let stream = client.request_multi(Value::from("go")).await.unwrap();
    let items: Vec<String> = stream
        .map(|item| item.unwrap().as_str().unwrap().to_owned())
        .collect()
        .await;
    assert_eq!(items, vec!["a", "b", "c"]);

    client.close().await.unwrap();
    server.close().await.unwrap();
}
