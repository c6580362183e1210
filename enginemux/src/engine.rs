use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, RwLock},
};

use futures_util::{SinkExt, StreamExt};
use http::{Request, Response, StatusCode};
use hyper::{upgrade::Upgraded, Body};
use tokio_tungstenite::{
    tungstenite::{protocol::Role, protocol::WebSocketConfig, Message},
    WebSocketStream,
};
use tracing::debug;

use crate::{
    config::EngineConfig,
    errors::Error,
    handler::EngineHandler,
    packet::{OpenPacket, Packet},
    payload,
    service::http_response,
    session::{DisconnectReason, Session, SessionReq},
    sid::Sid,
    transport::TransportType,
};

type SessionMap<D> = RwLock<HashMap<Sid, Arc<Session<D>>>>;

/// The engine server: owns the session registry and turns HTTP requests and
/// websocket streams into per-session packet flows.
pub(crate) struct Engine<H: EngineHandler> {
    sessions: SessionMap<H::Data>,
    handler: Arc<H>,
    pub(crate) config: EngineConfig,
}

impl<H: EngineHandler> Engine<H> {
    pub(crate) fn new(handler: Arc<H>, config: EngineConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            handler,
            config,
        }
    }

    /// Handshake request on the polling transport: allocate a session,
    /// start its heartbeat and answer with an OPEN packet.
    pub(crate) fn on_open_request(
        self: Arc<Self>,
        req: Request<Body>,
        remote_addr: Option<SocketAddr>,
    ) -> Result<Response<Body>, Error> {
        let (parts, _) = req.into_parts();
        let session = Self::create_session(
            &self,
            TransportType::Polling,
            SessionReq::new(&parts, remote_addr),
        );
        debug!("[sid={}] new polling session", session.sid);
        self.handler.clone().on_connect(session.clone());

        let open = OpenPacket::new(TransportType::Polling, session.sid, &self.config);
        let body = payload::encode([Packet::Open(open).into_text()?]);
        http_response(StatusCode::OK, body)
    }

    /// Polling read: drain buffered packets, or park until one shows up.
    pub(crate) async fn on_polling_request(
        self: Arc<Self>,
        sid: Sid,
    ) -> Result<Response<Body>, Error> {
        let session = self.polling_session(sid)?;

        // A second concurrent read on the same session is a protocol
        // violation and kills the session.
        let mut rx = match session.internal_rx.try_lock() {
            Ok(rx) => rx,
            Err(_) => {
                session.close(DisconnectReason::MultiplePollingError);
                return Err(Error::HttpErrorResponse(StatusCode::BAD_REQUEST));
            }
        };
        debug!("[sid={sid}] polling read");

        let mut packets = Vec::new();
        while let Ok(packet) = rx.try_recv() {
            packets.push(packet);
        }
        if packets.is_empty() && !session.is_closed() {
            let mut closed = session.closed_watch();
            tokio::select! {
                packet = rx.recv() => match packet {
                    Some(packet) => packets.push(packet),
                    None => return Err(Error::SessionClosed),
                },
                _ = closed.wait_for(|closed| *closed) => {}
            }
            while let Ok(packet) = rx.try_recv() {
                packets.push(packet);
            }
        }
        if packets.is_empty() {
            return Err(Error::SessionClosed);
        }

        let encoded = packets
            .into_iter()
            .map(Packet::into_text)
            .collect::<Result<Vec<_>, _>>()?;
        http_response(StatusCode::OK, payload::encode(encoded))
    }

    /// Polling write: split the body into packets and feed them to the
    /// session.
    pub(crate) async fn on_post_request(
        self: Arc<Self>,
        sid: Sid,
        req: Request<Body>,
    ) -> Result<Response<Body>, Error> {
        let body = hyper::body::to_bytes(req.into_body()).await?;
        if body.len() as u64 > self.config.max_payload {
            return Err(Error::PayloadTooLarge(body.len()));
        }
        let session = self.polling_session(sid)?;

        let body = match std::str::from_utf8(&body) {
            Ok(body) => body,
            Err(e) => {
                session.close(DisconnectReason::PacketParsingError);
                return Err(e.into());
            }
        };

        for raw in payload::decode(body) {
            let packet = raw.and_then(Packet::from_text);
            let packet = match packet {
                Ok(packet) => packet,
                Err(e) => {
                    debug!("[sid={sid}] corrupt polling payload: {e:?}");
                    session.close(DisconnectReason::PacketParsingError);
                    return Err(e);
                }
            };
            match packet {
                Packet::Close => {
                    debug!("[sid={sid}] received close");
                    // A NOOP lets any parked read complete before the
                    // session is torn down.
                    session.try_send(Packet::Noop).ok();
                    session.close(DisconnectReason::TransportClose);
                    break;
                }
                Packet::Ping => {
                    session.try_send(Packet::Pong).ok();
                }
                Packet::Pong => {
                    session.pong_tx.try_send(()).ok();
                }
                Packet::Message(msg) => self.handler.on_message(msg, session.clone()),
                Packet::Binary(data) => self.handler.on_binary(data, session.clone()),
                packet => {
                    debug!("[sid={sid}] unexpected packet on polling: {packet:?}");
                    session.close(DisconnectReason::PacketParsingError);
                    return Err(Error::InvalidFrame);
                }
            }
        }
        http_response(StatusCode::OK, "ok")
    }

    /// Run a freshly upgraded websocket stream, either as a brand new
    /// session or as the upgrade target of an existing polling session.
    pub(crate) async fn on_ws_connection(
        self: Arc<Self>,
        conn: Upgraded,
        sid: Option<Sid>,
        req: SessionReq,
    ) -> Result<(), Error> {
        let ws_config = WebSocketConfig {
            max_message_size: Some(self.config.max_payload as usize),
            ..Default::default()
        };
        let mut ws =
            WebSocketStream::from_raw_socket(conn, Role::Server, Some(ws_config)).await;

        let session = if let Some(sid) = sid {
            let session = self
                .get_session(sid)
                .ok_or(Error::UnknownSession(sid))?;
            if session.is_ws() {
                return Err(Error::UpgradeFailed);
            }
            debug!("[sid={sid}] websocket upgrade requested");
            self.upgrade_handshake(&session, &mut ws).await?;
            session
        } else {
            let session = Self::create_session(&self, TransportType::Websocket, req);
            debug!("[sid={}] new websocket session", session.sid);
            let open = OpenPacket::new(TransportType::Websocket, session.sid, &self.config);
            ws.send(Message::Text(Packet::Open(open).into_text()?))
                .await?;
            self.handler.clone().on_connect(session.clone());
            session
        };

        let (sink, stream) = ws.split();
        let writer = tokio::spawn(writer_pump(session.clone(), sink));

        if let Err(e) = self.reader_pump(stream, &session).await {
            debug!("[sid={}] websocket reader error: {:?}", session.sid, e);
            let reason = match e {
                Error::Ws(_) => DisconnectReason::TransportError,
                _ => DisconnectReason::PacketParsingError,
            };
            session.close(reason);
        }
        // The writer observes the closed flag and exits on its own; make
        // sure the flag is set even on a silent peer disappearance.
        session.close(DisconnectReason::TransportClose);
        writer.await.ok();
        Ok(())
    }

    /// The upgrade handshake, driven by the client:
    ///
    /// ```text
    /// client ── 2probe ──► server      (ping on the new transport)
    /// client ◄── 3probe ── server      (pong on the new transport)
    /// client ──── 5 ─────► server      (commit the upgrade)
    /// ```
    ///
    /// Before committing, a NOOP is flushed to the polling transport so a
    /// parked read completes, and the swap waits for the polling drain to
    /// release the egress queue.
    async fn upgrade_handshake(
        &self,
        session: &Arc<Session<H::Data>>,
        ws: &mut WebSocketStream<Upgraded>,
    ) -> Result<(), Error> {
        session.try_send(Packet::Noop).ok();

        match next_text_packet(ws).await? {
            Packet::PingProbe => {
                ws.send(Message::Text(Packet::PongProbe.into_text()?))
                    .await?;
            }
            _ => return Err(Error::UpgradeFailed),
        }
        match next_text_packet(ws).await? {
            Packet::Upgrade => debug!("[sid={}] websocket upgrade complete", session.sid),
            _ => return Err(Error::UpgradeFailed),
        }

        // Wait for any in-flight polling read to finish draining, then
        // swap. Writes enqueued during the handshake stay buffered and are
        // flushed by the websocket writer pump.
        drop(session.internal_rx.lock().await);
        session.upgrade_to_websocket();
        Ok(())
    }

    /// Forward incoming websocket frames to the handler, answering
    /// heartbeats inline.
    async fn reader_pump(
        &self,
        mut stream: futures_util::stream::SplitStream<WebSocketStream<Upgraded>>,
        session: &Arc<Session<H::Data>>,
    ) -> Result<(), Error> {
        while let Some(msg) = stream.next().await.transpose()? {
            match msg {
                Message::Text(msg) => match Packet::from_text(&msg)? {
                    Packet::Close => {
                        session.close(DisconnectReason::TransportClose);
                        break;
                    }
                    Packet::Ping => {
                        session.try_send(Packet::Pong).ok();
                    }
                    Packet::PingProbe => {
                        session.try_send(Packet::PongProbe).ok();
                    }
                    Packet::Pong | Packet::PongProbe => {
                        session.pong_tx.try_send(()).ok();
                    }
                    Packet::Message(msg) => self.handler.on_message(msg, session.clone()),
                    packet => {
                        debug!("[sid={}] bad packet received: {:?}", session.sid, packet);
                        session.close(DisconnectReason::PacketParsingError);
                        break;
                    }
                },
                Message::Binary(data) => match Packet::from_binary(data.into())? {
                    Packet::Binary(data) => self.handler.on_binary(data, session.clone()),
                    _ => unreachable!("from_binary only yields binary messages"),
                },
                Message::Close(_) => {
                    session.close(DisconnectReason::TransportClose);
                    break;
                }
                _ => (),
            }
            if session.is_closed() {
                break;
            }
        }
        Ok(())
    }

    fn create_session(
        engine: &Arc<Self>,
        transport: TransportType,
        req: SessionReq,
    ) -> Arc<Session<H::Data>> {
        let close_engine = engine.clone();
        let close_fn = Box::new(move |sid: Sid, reason: DisconnectReason| {
            close_engine.close_session(sid, reason)
        });
        let session = Arc::new(Session::new(
            Sid::new(),
            transport,
            &engine.config,
            req,
            close_fn,
        ));
        engine
            .sessions
            .write()
            .unwrap()
            .insert(session.sid, session.clone());
        session
            .clone()
            .spawn_heartbeat(engine.config.ping_interval, engine.config.ping_timeout);
        session
    }

    /// Unregister a session and notify the handler. Runs as the session's
    /// close callback, so it fires exactly once per session.
    fn close_session(&self, sid: Sid, reason: DisconnectReason) {
        let session = self.sessions.write().unwrap().remove(&sid);
        if let Some(session) = session {
            session.abort_heartbeat();
            self.handler.on_disconnect(session, reason);
            debug!(
                "[sid={sid}] session removed, {} remaining",
                self.sessions.read().unwrap().len()
            );
        }
    }

    /// Close every session, e.g. on server shutdown.
    pub(crate) fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.read().unwrap().values().cloned().collect();
        for session in sessions {
            session.close(DisconnectReason::ClosingServer);
        }
    }

    pub(crate) fn get_session(&self, sid: Sid) -> Option<Arc<Session<H::Data>>> {
        self.sessions.read().unwrap().get(&sid).cloned()
    }

    fn polling_session(&self, sid: Sid) -> Result<Arc<Session<H::Data>>, Error> {
        let session = self.get_session(sid).ok_or(Error::UnknownSession(sid))?;
        if session.is_ws() {
            return Err(Error::TransportMismatch);
        }
        Ok(session)
    }
}

/// Drain the session egress queue into the websocket sink until the
/// session closes.
async fn writer_pump<D: Default + Send + Sync + 'static>(
    session: Arc<Session<D>>,
    mut sink: futures_util::stream::SplitSink<WebSocketStream<Upgraded>, Message>,
) {
    let mut rx = session.internal_rx.lock().await;
    let mut closed = session.closed_watch();
    loop {
        let packet = tokio::select! {
            packet = rx.recv() => packet,
            _ = async { closed.wait_for(|closed| *closed).await.ok(); } => {
                // Flush whatever is already buffered before shutting the
                // stream down.
                while let Ok(packet) = rx.try_recv() {
                    if send_frame(&mut sink, packet).await.is_err() {
                        break;
                    }
                }
                sink.send(Message::Close(None)).await.ok();
                break;
            }
        };
        let Some(packet) = packet else { break };
        if packet == Packet::Close {
            sink.send(Message::Close(None)).await.ok();
            break;
        }
        if let Err(e) = send_frame(&mut sink, packet).await {
            debug!("[sid={}] websocket write error: {:?}", session.sid, e);
            session.close(DisconnectReason::TransportError);
            break;
        }
    }
}

async fn send_frame(
    sink: &mut futures_util::stream::SplitSink<WebSocketStream<Upgraded>, Message>,
    packet: Packet,
) -> Result<(), Error> {
    let msg = match packet {
        Packet::Close => Message::Close(None),
        packet if packet.is_binary() => Message::Binary(packet.into_binary().to_vec()),
        packet => Message::Text(packet.into_text()?),
    };
    sink.send(msg).await?;
    Ok(())
}

async fn next_text_packet(ws: &mut WebSocketStream<Upgraded>) -> Result<Packet, Error> {
    match ws.next().await {
        Some(Ok(Message::Text(msg))) => Packet::from_text(&msg),
        Some(Ok(Message::Close(_))) | None => Err(Error::UpgradeFailed),
        Some(Ok(_)) => Err(Error::UpgradeFailed),
        Some(Err(e)) => Err(e.into()),
    }
}
