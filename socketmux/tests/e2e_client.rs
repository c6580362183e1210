//! End-to-end tests driving the bundled client against the server.

mod fixture;

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use fixture::create_server;
use socketmux::{
    client::{ClientBuilder, ClientSocket},
    AckSender, Socket, Value,
};
use tokio::sync::mpsc;

#[tokio::test]
async fn client_connects_and_echoes() {
    let io = create_server(3150).await;
    io.ns("/").on(
        "echo",
        |_s: Arc<Socket>, args: Vec<Value>, ack: Option<AckSender<Socket>>| async move {
            if let Some(ack) = ack {
                ack.send(args).await.ok();
            }
        },
    );

    let client = ClientBuilder::new("http://127.0.0.1:3150")
        .reconnect(false)
        .connect()
        .await
        .unwrap();
    let socket = client.ns("/");

    let (tx, mut rx) = mpsc::channel::<()>(1);
    socket.on_connect(move |_s| {
        tx.try_send(()).ok();
    });
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("client should connect")
        .unwrap();

    let ack = socket
        .emit_with_ack::<String>("echo", "hi")
        .await
        .unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(1), ack)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, "hi");

    client.close();
}

#[tokio::test]
async fn binary_roundtrip_through_both_sides() {
    let io = create_server(3151).await;
    io.ns("/").on(
        "blob",
        |_s: Arc<Socket>, args: Vec<Value>, ack: Option<AckSender<Socket>>| async move {
            let blob = args[0].as_bytes().cloned().unwrap_or_default();
            if let Some(ack) = ack {
                // Send the payload back, still binary.
                ack.send(Bytes::from(blob.to_vec())).await.ok();
            }
        },
    );

    let client = ClientBuilder::new("http://127.0.0.1:3151")
        .reconnect(false)
        .connect()
        .await
        .unwrap();
    let socket = client.ns("/");
    wait_connected(&socket).await;

    let ack = socket
        .emit_with_ack::<Bytes>("blob", Bytes::from_static(&[1, 2, 3, 4]))
        .await
        .unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(1), ack)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, Bytes::from_static(&[1, 2, 3, 4]));

    client.close();
}

#[tokio::test]
async fn server_initiated_ack() {
    let io = create_server(3152).await;
    let (tx, mut rx) = mpsc::channel::<String>(1);
    io.ns("/").on_connect(move |socket: Arc<Socket>| {
        let tx = tx.clone();
        async move {
            let ack = socket
                .emit_with_ack::<String>("question", "ready?")
                .await
                .unwrap();
            if let Ok(answer) = ack.await {
                tx.try_send(answer).ok();
            }
        }
    });

    let client = ClientBuilder::new("http://127.0.0.1:3152")
        .reconnect(false)
        .connect()
        .await
        .unwrap();
    let socket = client.ns("/");
    socket.on(
        "question",
        |_s: Arc<ClientSocket>, _args: Vec<Value>, ack: Option<AckSender<ClientSocket>>| async move {
            if let Some(ack) = ack {
                ack.send("yes").await.ok();
            }
        },
    );

    let answer = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("server should receive the ack")
        .unwrap();
    assert_eq!(answer, "yes");

    client.close();
}

#[tokio::test]
async fn events_are_delivered_in_emit_order() {
    let io = create_server(3153).await;
    io.ns("/").on_connect(|socket: Arc<Socket>| async move {
        for i in 0..10i64 {
            socket.emit("seq", i).await.ok();
        }
    });

    let client = ClientBuilder::new("http://127.0.0.1:3153")
        .reconnect(false)
        .connect()
        .await
        .unwrap();
    let socket = client.ns("/");

    let (tx, mut rx) = mpsc::channel::<i64>(16);
    socket.on(
        "seq",
        move |_s: Arc<ClientSocket>, args: Vec<Value>, _ack: Option<AckSender<ClientSocket>>| {
            let tx = tx.clone();
            async move {
                if let Some(n) = args.first().and_then(|v| match v {
                    Value::Number(n) => n.as_i64(),
                    _ => None,
                }) {
                    tx.try_send(n).ok();
                }
            }
        },
    );

    let mut seen = Vec::new();
    for _ in 0..10 {
        let n = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("missing event")
            .unwrap();
        seen.push(n);
    }
    assert_eq!(seen, (0..10).collect::<Vec<_>>());

    client.close();
}

#[tokio::test]
async fn client_disconnect_fires_server_hook() {
    let io = create_server(3154).await;
    let (tx, mut rx) = mpsc::channel::<socketmux::DisconnectReason>(1);
    io.ns("/").on_disconnect(move |_s: Arc<Socket>, reason| {
        let tx = tx.clone();
        async move {
            tx.try_send(reason).ok();
        }
    });

    let client = ClientBuilder::new("http://127.0.0.1:3154")
        .reconnect(false)
        .connect()
        .await
        .unwrap();
    let socket = client.ns("/");
    tokio::time::sleep(Duration::from_millis(200)).await;

    socket.disconnect().await.ok();
    let reason = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("disconnect hook should fire")
        .unwrap();
    assert_eq!(reason, socketmux::DisconnectReason::ClientNSDisconnect);

    client.close();
}

#[tokio::test]
async fn msgpack_parser_end_to_end() {
    let io = create_server_with_msgpack(3155).await;
    io.ns("/").on(
        "echo",
        |_s: Arc<Socket>, args: Vec<Value>, ack: Option<AckSender<Socket>>| async move {
            if let Some(ack) = ack {
                ack.send(args).await.ok();
            }
        },
    );

    let client = ClientBuilder::new("http://127.0.0.1:3155")
        .parser(socketmux::parser::Parser::MsgPack)
        .reconnect(false)
        .connect()
        .await
        .unwrap();
    let socket = client.ns("/");
    wait_connected(&socket).await;

    let ack = socket
        .emit_with_ack::<(String, Bytes)>("echo", ("mixed", Bytes::from_static(&[7, 7])))
        .await
        .unwrap();
    let (text, blob) = tokio::time::timeout(Duration::from_secs(1), ack)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(text, "mixed");
    assert_eq!(blob, Bytes::from_static(&[7, 7]));

    client.close();
}

/// Park until the namespace CONNECT is acknowledged.
async fn wait_connected(socket: &Arc<ClientSocket>) {
    let (tx, mut rx) = mpsc::channel::<()>(1);
    socket.on_connect(move |_s| {
        tx.try_send(()).ok();
    });
    if socket.connected() {
        return;
    }
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("namespace should connect")
        .unwrap();
}

async fn create_server_with_msgpack(port: u16) -> socketmux::SocketMux {
    fixture::create_server_with(
        port,
        socketmux::SocketMux::builder()
            .ping_interval(Duration::from_millis(300))
            .ping_timeout(Duration::from_millis(200))
            .parser(socketmux::parser::Parser::MsgPack),
    )
    .await
}
