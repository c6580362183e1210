mod fixture;

use std::{sync::Arc, time::Duration};

use fixture::{create_server, create_ws_connection, next_msg, send_msg};
use socketmux::{AckSender, Socket, Value};
use tokio::sync::mpsc;

#[tokio::test]
async fn connect_root_namespace() {
    let io = create_server(3100).await;
    let (tx, mut rx) = mpsc::channel::<String>(1);
    io.ns("/").on_connect(move |socket: Arc<Socket>| {
        let tx = tx.clone();
        async move {
            tx.try_send(socket.id.to_string()).ok();
        }
    });

    let mut ws = create_ws_connection(3100).await;
    send_msg(&mut ws, "0").await;

    let reply = next_msg(&mut ws).await.unwrap();
    assert!(reply.starts_with("0{\"sid\":"), "unexpected reply: {reply}");

    let sid = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(reply.contains(&sid));
}

#[tokio::test]
async fn connect_custom_namespace() {
    let io = create_server(3101).await;
    let (tx, mut rx) = mpsc::channel::<String>(1);
    io.ns("/ditto").on_connect(move |socket: Arc<Socket>| {
        let tx = tx.clone();
        async move {
            tx.try_send(socket.ns().to_string()).ok();
        }
    });

    let mut ws = create_ws_connection(3101).await;
    send_msg(&mut ws, "0/ditto,").await;

    let reply = next_msg(&mut ws).await.unwrap();
    assert!(reply.starts_with("0/ditto,"), "unexpected reply: {reply}");
    assert_eq!(
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap(),
        "/ditto"
    );
}

#[tokio::test]
async fn connect_unknown_namespace_is_rejected() {
    let _io = create_server(3102).await;
    let mut ws = create_ws_connection(3102).await;
    send_msg(&mut ws, "0/nope").await;

    let reply = next_msg(&mut ws).await.unwrap();
    assert_eq!(reply, "4/nope,\"Invalid namespace\"");
}

#[tokio::test]
async fn event_after_disconnect_is_rejected() {
    let io = create_server(3103).await;
    let (tx, mut rx) = mpsc::channel::<()>(1);
    io.ns("/ditto")
        .on(
            "ping",
            |_s: Arc<Socket>, _args: Vec<Value>, _ack: Option<AckSender<Socket>>| async move {},
        )
        .on_disconnect(move |_s: Arc<Socket>, _reason| {
            let tx = tx.clone();
            async move {
                tx.try_send(()).ok();
            }
        });

    let mut ws = create_ws_connection(3103).await;
    send_msg(&mut ws, "0/ditto,").await;
    next_msg(&mut ws).await.unwrap();

    send_msg(&mut ws, "1/ditto").await;
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("disconnect hook should fire")
        .unwrap();

    // Events for the torn down namespace now bounce with an error packet.
    send_msg(&mut ws, "2/ditto,[\"ping\"]").await;
    let reply = next_msg(&mut ws).await.unwrap();
    assert_eq!(reply, "4/ditto,\"Invalid namespace\"");
}

#[tokio::test]
async fn connect_hook_can_reject() {
    let io = create_server(3104).await;
    io.ns("/private").on_connect(|_socket: Arc<Socket>| async move {
        Err::<(), _>("go away".to_string())
    });

    let mut ws = create_ws_connection(3104).await;
    send_msg(&mut ws, "0/private,").await;

    let reply = next_msg(&mut ws).await.unwrap();
    assert_eq!(reply, "4/private,\"go away\"");
}

#[tokio::test]
async fn multiple_handlers_run_in_registration_order() {
    let io = create_server(3105).await;
    let (tx, mut rx) = mpsc::channel::<&'static str>(2);
    let tx2 = tx.clone();
    io.ns("/")
        .on(
            "evt",
            move |_s: Arc<Socket>, _args: Vec<Value>, _ack: Option<AckSender<Socket>>| {
                let tx = tx.clone();
                async move {
                    tx.try_send("first").ok();
                }
            },
        )
        .on(
            "evt",
            move |_s: Arc<Socket>, _args: Vec<Value>, _ack: Option<AckSender<Socket>>| {
                let tx = tx2.clone();
                async move {
                    tx.try_send("second").ok();
                }
            },
        );

    let mut ws = create_ws_connection(3105).await;
    send_msg(&mut ws, "0").await;
    next_msg(&mut ws).await.unwrap();

    send_msg(&mut ws, "2[\"evt\"]").await;
    let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let second = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!((first, second), ("first", "second"));
}
