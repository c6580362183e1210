use std::{
    convert::Infallible,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use socketmux::{SocketMux, SocketMuxBuilder};
use tokio::net::TcpStream;
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Boot a server on `port` with short heartbeats suitable for tests.
pub async fn create_server(port: u16) -> SocketMux {
    create_server_with(
        port,
        SocketMux::builder()
            .ping_interval(Duration::from_millis(300))
            .ping_timeout(Duration::from_millis(200)),
    )
    .await
}

pub async fn create_server_with(port: u16, builder: SocketMuxBuilder) -> SocketMux {
    let (svc, io) = builder.build_svc();
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);

    let make = make_service_fn(move |conn: &AddrStream| {
        let svc = svc.clone();
        let remote = conn.remote_addr();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let svc = svc.clone();
                async move { Ok::<_, Infallible>(svc.handle(req, Some(remote)).await) }
            }))
        }
    });
    let server = hyper::Server::bind(&addr).serve(make);
    tokio::spawn(async move {
        server.await.ok();
    });
    io
}

/// Open a raw websocket engine session and consume the OPEN packet.
pub async fn create_ws_connection(port: u16) -> WsStream {
    let mut ws = tokio_tungstenite::connect_async(format!(
        "ws://127.0.0.1:{port}/socket.io/?EIO=4&transport=websocket"
    ))
    .await
    .unwrap()
    .0;

    let open = next_frame(&mut ws).await.expect("open packet");
    assert!(open.starts_with("0{"), "unexpected handshake frame: {open}");
    ws
}

/// The next text frame, raw.
pub async fn next_frame(ws: &mut WsStream) -> Option<String> {
    loop {
        match ws.next().await? {
            Ok(Message::Text(msg)) => return Some(msg),
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

/// The next application message, transparently answering heartbeats and
/// skipping NOOPs.
pub async fn next_msg(ws: &mut WsStream) -> Option<String> {
    loop {
        let frame = next_frame(ws).await?;
        match frame.as_bytes().first() {
            Some(b'2') => {
                ws.send(Message::Text("3".to_string())).await.ok();
            }
            Some(b'6') => continue,
            Some(b'4') => return Some(frame[1..].to_string()),
            Some(b'1') => return None,
            _ => continue,
        }
    }
}

/// The next binary frame, answering heartbeats in between. The leading
/// opcode byte is stripped.
pub async fn next_bin(ws: &mut WsStream) -> Option<Vec<u8>> {
    loop {
        match ws.next().await? {
            Ok(Message::Binary(frame)) => return Some(frame[1..].to_vec()),
            Ok(Message::Text(msg)) if msg.starts_with('2') => {
                ws.send(Message::Text("3".to_string())).await.ok();
            }
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

/// Send an application message over the engine session.
pub async fn send_msg(ws: &mut WsStream, msg: &str) {
    ws.send(Message::Text(format!("4{msg}"))).await.unwrap();
}
