mod fixture;

use std::{sync::Arc, time::Duration};

use fixture::{create_server, create_ws_connection, next_msg, send_msg, WsStream};
use socketmux::{AckSender, Socket, Value};

async fn join_root(port: u16) -> WsStream {
    let mut ws = create_ws_connection(port).await;
    send_msg(&mut ws, "0").await;
    next_msg(&mut ws).await.unwrap();
    send_msg(&mut ws, "2[\"join\"]").await;
    ws
}

fn setup_handlers(io: &socketmux::SocketMux) {
    io.ns("/")
        .on(
            "join",
            |socket: Arc<Socket>, _args: Vec<Value>, _ack: Option<AckSender<Socket>>| async move {
                socket.join("r");
            },
        )
        .on(
            "send",
            |socket: Arc<Socket>, _args: Vec<Value>, _ack: Option<AckSender<Socket>>| async move {
                socket.to("r").emit("msg", "hello").ok();
            },
        )
        .on(
            "leave",
            |socket: Arc<Socket>, _args: Vec<Value>, _ack: Option<AckSender<Socket>>| async move {
                socket.leave("r");
            },
        );
}

#[tokio::test]
async fn room_broadcast_excludes_the_sender() {
    let io = create_server(3120).await;
    setup_handlers(&io);

    let mut a = join_root(3120).await;
    let mut b = join_root(3120).await;
    let mut c = join_root(3120).await;
    // Make sure every join was processed before broadcasting.
    tokio::time::sleep(Duration::from_millis(100)).await;

    send_msg(&mut a, "2[\"send\"]").await;

    let expect = "2[\"msg\",\"hello\"]";
    assert_eq!(next_msg(&mut b).await.unwrap(), expect);
    assert_eq!(next_msg(&mut c).await.unwrap(), expect);

    // The sender gets nothing but heartbeats.
    let silence = tokio::time::timeout(Duration::from_millis(400), next_msg(&mut a)).await;
    assert!(silence.is_err(), "sender received its own broadcast");
}

#[tokio::test]
async fn leaving_removes_from_the_room() {
    let io = create_server(3121).await;
    setup_handlers(&io);

    let mut a = join_root(3121).await;
    let mut b = join_root(3121).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    send_msg(&mut b, "2[\"leave\"]").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    send_msg(&mut a, "2[\"send\"]").await;

    let silence = tokio::time::timeout(Duration::from_millis(400), next_msg(&mut b)).await;
    assert!(silence.is_err(), "socket received a broadcast after leaving");
}

#[tokio::test]
async fn server_broadcast_reaches_the_room() {
    let io = create_server(3122).await;
    setup_handlers(&io);

    let mut a = join_root(3122).await;
    let mut b = join_root(3122).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    io.broadcast_to_room("/", "r", "news", "flash").unwrap();

    let expect = "2[\"news\",\"flash\"]";
    assert_eq!(next_msg(&mut a).await.unwrap(), expect);
    assert_eq!(next_msg(&mut b).await.unwrap(), expect);
}

#[tokio::test]
async fn namespace_broadcast_reaches_everyone() {
    let io = create_server(3123).await;
    setup_handlers(&io);

    let mut a = join_root(3123).await;
    let mut b = create_ws_connection(3123).await;
    send_msg(&mut b, "0").await;
    next_msg(&mut b).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    io.broadcast_to("/", "news", "flash").unwrap();

    let expect = "2[\"news\",\"flash\"]";
    assert_eq!(next_msg(&mut a).await.unwrap(), expect);
    assert_eq!(next_msg(&mut b).await.unwrap(), expect);
}
