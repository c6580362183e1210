//! Engine client: dials a server over websocket, runs the handshake and
//! exposes the session as a sender handle plus an ingress event stream.
//!
//! Reconnection is the caller's loop; [`Backoff`] provides the delay
//! schedule so the loop stays a flat state machine.

use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http::Uri;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use crate::{
    errors::Error,
    packet::{OpenPacket, Packet},
    session::DisconnectReason,
    sid::Sid,
    transport::TransportType,
};

/// Ingress events surfaced to the layer above the engine client.
#[derive(Debug)]
pub enum ClientEvent {
    /// An application text message.
    Message(String),
    /// An application binary message.
    Binary(Bytes),
    /// The session ended; no further events follow.
    Closed(DisconnectReason),
}

/// A connected engine client session.
#[derive(Debug, Clone)]
pub struct EngineClient {
    /// The handshake parameters the server answered with.
    pub handshake: OpenPacket,
    tx: mpsc::Sender<Packet>,
}

impl EngineClient {
    pub fn sid(&self) -> Sid {
        self.handshake.sid
    }

    pub fn transport_type(&self) -> TransportType {
        TransportType::Websocket
    }

    /// Enqueue one packet, suspending while the egress queue is full.
    pub async fn send(&self, packet: Packet) -> Result<(), Error> {
        self.tx.send(packet).await.map_err(|_| Error::SessionClosed)
    }

    /// Enqueue a contiguous batch of packets; a message header and its
    /// binary attachments must not interleave with other writers.
    pub async fn send_all<I>(&self, packets: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = Packet>,
        I::IntoIter: ExactSizeIterator,
    {
        let packets = packets.into_iter();
        let permits = self
            .tx
            .reserve_many(packets.len())
            .await
            .map_err(|_| Error::SessionClosed)?;
        for (permit, packet) in permits.zip(packets) {
            permit.send(packet);
        }
        Ok(())
    }

    /// Gracefully close the session.
    pub async fn close(&self) {
        self.tx.send(Packet::Close).await.ok();
    }
}

/// Dial `url` (an `http://` or `https://` base) and run the engine
/// handshake over websocket.
///
/// Returns the client handle and the ingress event stream. The session
/// runs on a spawned task until either side closes or the transport fails;
/// the last event is always [`ClientEvent::Closed`].
pub async fn connect(
    url: &str,
    req_path: &str,
    buffer_size: usize,
) -> Result<(EngineClient, mpsc::Receiver<ClientEvent>), Error> {
    let url = ws_url(url, req_path)?;
    debug!("dialing {url}");
    let (mut ws, _res) = connect_async(url.as_str()).await?;

    let handshake = match ws.next().await {
        Some(Ok(Message::Text(msg))) => match Packet::from_text(&msg)? {
            Packet::Open(open) => open,
            _ => return Err(Error::BadHandshake("expected an open packet")),
        },
        Some(Ok(_)) => return Err(Error::BadHandshake("expected a text frame")),
        Some(Err(e)) => return Err(e.into()),
        None => return Err(Error::BadHandshake("connection closed during handshake")),
    };
    debug!("[sid={}] session open", handshake.sid);

    let (tx, rx) = mpsc::channel(buffer_size);
    let (event_tx, event_rx) = mpsc::channel(buffer_size);
    tokio::spawn(session_task(ws, rx, event_tx));

    Ok((EngineClient { handshake, tx }, event_rx))
}

/// The client session pump: drains egress to the websocket and forwards
/// ingress frames, answering heartbeats synchronously so a slow consumer
/// never kills the session.
async fn session_task(
    mut ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    mut rx: mpsc::Receiver<Packet>,
    event_tx: mpsc::Sender<ClientEvent>,
) {
    let reason = loop {
        tokio::select! {
            outgoing = rx.recv() => match outgoing {
                Some(Packet::Close) | None => {
                    ws.send(Message::Close(None)).await.ok();
                    break DisconnectReason::TransportClose;
                }
                Some(packet) if packet.is_binary() => {
                    if ws.send(Message::Binary(packet.into_binary().to_vec())).await.is_err() {
                        break DisconnectReason::TransportError;
                    }
                }
                Some(packet) => {
                    let text = match packet.into_text() {
                        Ok(text) => text,
                        Err(_) => continue,
                    };
                    if ws.send(Message::Text(text)).await.is_err() {
                        break DisconnectReason::TransportError;
                    }
                }
            },
            incoming = ws.next() => match incoming {
                Some(Ok(Message::Text(msg))) => match Packet::from_text(&msg) {
                    Ok(Packet::Ping) => {
                        if ws.send(Message::Text(Packet::Pong.into_text().unwrap_or_default()))
                            .await
                            .is_err()
                        {
                            break DisconnectReason::TransportError;
                        }
                    }
                    Ok(Packet::Close) => break DisconnectReason::TransportClose,
                    Ok(Packet::Message(msg)) => {
                        if event_tx.send(ClientEvent::Message(msg)).await.is_err() {
                            break DisconnectReason::TransportClose;
                        }
                    }
                    Ok(packet) => debug!("ignoring unexpected packet: {packet:?}"),
                    Err(e) => {
                        debug!("corrupt frame from server: {e:?}");
                        break DisconnectReason::PacketParsingError;
                    }
                },
                Some(Ok(Message::Binary(frame))) => match Packet::from_binary(frame.into()) {
                    Ok(Packet::Binary(data)) => {
                        if event_tx.send(ClientEvent::Binary(data)).await.is_err() {
                            break DisconnectReason::TransportClose;
                        }
                    }
                    _ => break DisconnectReason::PacketParsingError,
                },
                Some(Ok(Message::Close(_))) | None => break DisconnectReason::TransportClose,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("websocket error: {e:?}");
                    break DisconnectReason::TransportError;
                }
            },
        }
    };
    event_tx.send(ClientEvent::Closed(reason)).await.ok();
}

/// Turn an http(s) base url into the websocket handshake url.
fn ws_url(url: &str, req_path: &str) -> Result<String, Error> {
    let uri: Uri = url
        .parse()
        .map_err(|_| Error::BadHandshake("invalid server url"))?;
    let scheme = match uri.scheme_str() {
        Some("https") | Some("wss") => "wss",
        Some("http") | Some("ws") | None => "ws",
        Some(_) => return Err(Error::BadHandshake("unsupported url scheme")),
    };
    let authority = uri
        .authority()
        .ok_or(Error::BadHandshake("missing host in server url"))?;
    Ok(format!(
        "{scheme}://{authority}{req_path}?EIO=4&transport=websocket"
    ))
}

/// Exponential reconnect backoff: doubles from `base` up to `max`.
///
/// The reconnect loop around it stays a single state machine; dropping the
/// loop is all it takes to cancel.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// The delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(16);
        self.attempt = self.attempt.saturating_add(1);
        self.base
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max)
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_schemes() {
        assert_eq!(
            ws_url("http://localhost:3000", "/socket.io/").unwrap(),
            "ws://localhost:3000/socket.io/?EIO=4&transport=websocket"
        );
        assert_eq!(
            ws_url("https://example.com", "/rt/").unwrap(),
            "wss://example.com/rt/?EIO=4&transport=websocket"
        );
        assert!(ws_url("ftp://example.com", "/socket.io/").is_err());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        assert_eq!(backoff.next_delay(), Duration::from_millis(800));
        assert_eq!(backoff.next_delay(), Duration::from_millis(1600));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }

    #[test]
    fn backoff_reset() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(2));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }
}
