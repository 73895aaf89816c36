// Copyright (C) 2025 The Wizard Pipeline Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Frame and transport tests for wizard-protocol over real loopback sockets.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Notify, mpsc};
use wizard_protocol::frame::{Frame, HEADER_SIZE};
use wizard_protocol::transport::{
    BOTTLE_TIMEOUT, Endpoint, SIGNAL_TIMEOUT, get_connection, recv_signal, send_bottle,
    send_signal, send_signal_with_conn,
};
use wizard_protocol::{FramedServer, FramedServerConfig};

async fn start_echo_server() -> (Endpoint, Arc<Notify>) {
    let server = FramedServer::bind(FramedServerConfig::loopback(0))
        .await
        .unwrap();
    let endpoint = Endpoint::from(server.local_addr());
    let shutdown = Arc::new(Notify::new());
    tokio::spawn(server.run(
        |mut conn, _| async move {
            if let Ok(value) = conn.read_value().await {
                let _ = conn.respond(&value).await;
            }
        },
        shutdown.clone(),
    ));
    (endpoint, shutdown)
}

#[test]
fn test_wire_bytes_match_length_prefix() {
    let frame = Frame::new(&json!({"request": "sql_cmd"})).unwrap();
    let encoded = frame.encode();
    assert_eq!(&encoded[..HEADER_SIZE], &[0, 0, 0, 21]);
    assert_eq!(&encoded[HEADER_SIZE..], br#"{"request":"sql_cmd"}"#);
}

#[tokio::test]
async fn test_send_signal_round_trips_json_values() {
    let (endpoint, shutdown) = start_echo_server().await;

    let values = [
        json!(1),
        json!("plain"),
        json!([1, 2.5, "ünïcödé", null, true]),
        json!({"nested": {"rows": [[1, "a"], [2, "b"]]}, "emoji": "🎬"}),
    ];
    for value in values {
        let reply = send_signal(&endpoint, &value, SIGNAL_TIMEOUT).await;
        assert_eq!(reply, Some(value));
    }

    shutdown.notify_one();
}

#[tokio::test]
async fn test_send_signal_large_payload() {
    let (endpoint, shutdown) = start_echo_server().await;

    let big = "x".repeat(4 * 1024 * 1024);
    let reply = send_signal(&endpoint, &json!({"blob": big}), SIGNAL_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(reply["blob"].as_str().unwrap().len(), 4 * 1024 * 1024);

    shutdown.notify_one();
}

#[tokio::test]
async fn test_send_signal_to_closed_port_is_none() {
    let port = wizard_protocol::transport::probe_free_port("127.0.0.1", 30000, &[]).unwrap();
    let reply = send_signal(
        &Endpoint::localhost(port),
        &json!({"x": 1}),
        Duration::from_millis(200),
    )
    .await;
    assert!(reply.is_none());
}

#[tokio::test]
async fn test_bottles_reach_listener() {
    let server = FramedServer::bind(FramedServerConfig::loopback(0))
        .await
        .unwrap();
    let endpoint = Endpoint::from(server.local_addr());
    let shutdown = Arc::new(Notify::new());
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    tokio::spawn(server.run(
        move |mut conn, _| {
            let tx = tx.clone();
            async move {
                if let Ok(value) = conn.read_value().await {
                    let _ = tx.send(value);
                }
            }
        },
        shutdown.clone(),
    ));

    for i in 0..3 {
        assert!(send_bottle(&endpoint, &json!(["1", "percent", i])).await);
    }
    for _ in 0..3 {
        let value = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value[1], "percent");
    }

    shutdown.notify_one();
}

#[tokio::test]
async fn test_send_signal_with_conn_keeps_connection_open() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = Endpoint::from(listener.local_addr().unwrap());

    let reader = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut seen = Vec::new();
        while let Some(value) = recv_signal(&mut stream).await {
            seen.push(value);
        }
        seen
    });

    let mut stream = get_connection(&endpoint, BOTTLE_TIMEOUT * 100)
        .await
        .unwrap();
    assert!(send_signal_with_conn(&mut stream, &json!({"type": "new_client"})).await);
    assert!(send_signal_with_conn(&mut stream, &json!({"type": "refresh_team"})).await);
    stream.shutdown().await.unwrap();
    drop(stream);

    let seen = reader.await.unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1]["type"], "refresh_team");
}

#[tokio::test]
async fn test_recv_signal_partial_frame_is_none() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let writer = tokio::spawn(async move {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream.write_all(&[0, 0, 1, 0]).await.unwrap();
        stream.write_all(b"{\"only\": \"part").await.unwrap();
    });

    let (mut stream, _) = listener.accept().await.unwrap();
    writer.await.unwrap();
    assert!(recv_signal(&mut stream).await.is_none());
}
