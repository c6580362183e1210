mod fixture;

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use fixture::{create_server, create_ws_connection, next_bin, next_msg, send_msg};
use socketmux::{AckSender, Socket, Value};
use tokio::sync::mpsc;

#[tokio::test]
async fn event_with_id_gets_exactly_one_ack() {
    let io = create_server(3110).await;
    io.ns("/x").on(
        "echo",
        |_s: Arc<Socket>, args: Vec<Value>, ack: Option<AckSender<Socket>>| async move {
            if let Some(ack) = ack {
                ack.send(args).await.ok();
            }
        },
    );

    let mut ws = create_ws_connection(3110).await;
    send_msg(&mut ws, "0/x,").await;
    next_msg(&mut ws).await.unwrap();

    send_msg(&mut ws, "2/x,7[\"echo\",\"hi\"]").await;
    let reply = next_msg(&mut ws).await.unwrap();
    assert_eq!(reply, "3/x,7[\"hi\"]");
}

#[tokio::test]
async fn only_first_handler_owns_the_ack() {
    let io = create_server(3111).await;
    let (tx, mut rx) = mpsc::channel::<bool>(2);
    let tx2 = tx.clone();
    io.ns("/")
        .on(
            "q",
            move |_s: Arc<Socket>, _args: Vec<Value>, ack: Option<AckSender<Socket>>| {
                let tx = tx.clone();
                async move {
                    tx.try_send(ack.is_some()).ok();
                    if let Some(ack) = ack {
                        ack.send("first").await.ok();
                    }
                }
            },
        )
        .on(
            "q",
            move |_s: Arc<Socket>, _args: Vec<Value>, ack: Option<AckSender<Socket>>| {
                let tx = tx2.clone();
                async move {
                    tx.try_send(ack.is_some()).ok();
                }
            },
        );

    let mut ws = create_ws_connection(3111).await;
    send_msg(&mut ws, "0").await;
    next_msg(&mut ws).await.unwrap();

    send_msg(&mut ws, "23[\"q\"]").await;
    assert_eq!(next_msg(&mut ws).await.unwrap(), "33[\"first\"]");

    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    assert!(first);
    assert!(!second);
}

#[tokio::test]
async fn binary_event_reassembles_attachments() {
    let io = create_server(3112).await;
    let (tx, mut rx) = mpsc::channel::<(String, Bytes)>(1);
    io.ns("/").on(
        "binary",
        move |_s: Arc<Socket>, args: Vec<Value>, _ack: Option<AckSender<Socket>>| {
            let tx = tx.clone();
            async move {
                let name = args[0].as_str().unwrap_or_default().to_string();
                let blob = args[1].as_bytes().cloned().unwrap_or_default();
                tx.try_send((name, blob)).ok();
            }
        },
    );

    let mut ws = create_ws_connection(3112).await;
    send_msg(&mut ws, "0").await;
    next_msg(&mut ws).await.unwrap();

    send_msg(
        &mut ws,
        "51-[\"binary\",\"label\",{\"_placeholder\":true,\"num\":0}]",
    )
    .await;
    use futures_util::SinkExt;
    ws.send(tokio_tungstenite::tungstenite::Message::Binary(vec![
        4, 1, 2, 3, 4,
    ]))
    .await
    .unwrap();

    let (name, blob) = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(name, "label");
    assert_eq!(blob, Bytes::from_static(&[1, 2, 3, 4]));
}

#[tokio::test]
async fn binary_ack_emits_header_then_attachment() {
    let io = create_server(3113).await;
    io.ns("/").on(
        "fetch",
        |_s: Arc<Socket>, _args: Vec<Value>, ack: Option<AckSender<Socket>>| async move {
            if let Some(ack) = ack {
                ack.send(Bytes::from_static(&[9, 8, 7])).await.ok();
            }
        },
    );

    let mut ws = create_ws_connection(3113).await;
    send_msg(&mut ws, "0").await;
    next_msg(&mut ws).await.unwrap();

    send_msg(&mut ws, "25[\"fetch\"]").await;
    let head = next_msg(&mut ws).await.unwrap();
    assert_eq!(head, "61-5[{\"_placeholder\":true,\"num\":0}]");
    let blob = next_bin(&mut ws).await.unwrap();
    assert_eq!(blob, vec![9, 8, 7]);
}
