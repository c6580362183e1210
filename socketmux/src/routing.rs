//! The glue between the engine layer and the namespaces: decodes engine
//! messages with the configured parser, reassembles packets split into
//! attachment frames and routes them to their namespace.

use std::{
    borrow::Cow,
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};

use bytes::Bytes;
use enginemux::{EngineHandler, Session};
use tracing::debug;

use crate::{
    errors::Error,
    ns::Namespace,
    packet::{Packet, PacketData},
    parser::{Decoded, Parse, ParseError, Parser, PartialPacket},
    socket::{encode_frames, DisconnectReason},
};

/// Per-session state owned by the application layer.
#[derive(Debug, Default)]
pub struct SessionData {
    /// A binary packet whose header arrived but whose attachment frames
    /// have not all shown up yet.
    partial: Mutex<Option<PartialPacket>>,
}

/// The application endpoint plugged into the engine server.
pub(crate) struct Client {
    parser: Parser,
    ns: RwLock<HashMap<Cow<'static, str>, Arc<Namespace>>>,
}

impl Client {
    pub(crate) fn new(parser: Parser) -> Self {
        Self {
            parser,
            ns: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create the namespace registration for `path`.
    pub(crate) fn add_ns(&self, path: Cow<'static, str>) -> Arc<Namespace> {
        self.ns
            .write()
            .unwrap()
            .entry(path.clone())
            .or_insert_with(|| Namespace::new(path))
            .clone()
    }

    pub(crate) fn get_ns(&self, path: &str) -> Option<Arc<Namespace>> {
        self.ns.read().unwrap().get(path).cloned()
    }

    /// Close every namespace; used on server shutdown.
    pub(crate) async fn close(&self) {
        let namespaces: Vec<_> = self.ns.read().unwrap().values().cloned().collect();
        for ns in namespaces {
            ns.close(DisconnectReason::ClosingServer).await;
        }
    }

    /// Route a complete packet to its namespace.
    fn dispatch(&self, packet: Packet, session: &Arc<Session<SessionData>>) {
        match packet.inner {
            PacketData::Connect(auth) => match self.get_ns(&packet.ns) {
                Some(ns) => {
                    let session = session.clone();
                    let parser = self.parser.clone();
                    tokio::spawn(ns.connect(session, parser, auth));
                }
                None => {
                    debug!("connect to unknown namespace {}", packet.ns);
                    self.send_error_packet(session, Packet::invalid_namespace(packet.ns));
                }
            },
            inner => match self.get_ns(&packet.ns) {
                Some(ns) => match ns.recv(session.sid, inner) {
                    Ok(()) => {}
                    Err(Error::SocketGone(_)) => {
                        debug!("[sid={}] packet for dead socket on {}", session.sid, packet.ns);
                        self.send_error_packet(session, Packet::invalid_namespace(packet.ns));
                    }
                    Err(err) => {
                        debug!("[sid={}] error routing packet: {}", session.sid, err);
                    }
                },
                None => {
                    self.send_error_packet(session, Packet::invalid_namespace(packet.ns));
                }
            },
        }
    }

    /// Surface a namespace-scoped error on its error hook when the socket
    /// is known; otherwise log and move on. The session stays up either
    /// way.
    fn surface_error(&self, session: &Arc<Session<SessionData>>, ns_path: &str, err: Error) {
        match self
            .get_ns(ns_path)
            .and_then(|ns| ns.get_socket(session.sid).map(|socket| (ns, socket)))
        {
            Some((ns, socket)) => ns.handle_error(socket, err),
            None => debug!("[sid={}] decode error on {}: {}", session.sid, ns_path, err),
        }
    }

    fn send_error_packet(&self, session: &Arc<Session<SessionData>>, packet: Packet) {
        match encode_frames(&self.parser, packet) {
            Ok(frames) => {
                session.try_send_all(frames).ok();
            }
            Err(e) => debug!("[sid={}] could not encode error packet: {}", session.sid, e),
        }
    }
}

impl EngineHandler for Client {
    type Data = SessionData;

    fn on_connect(self: Arc<Self>, session: Arc<Session<SessionData>>) {
        debug!("[sid={}] engine session open", session.sid);
    }

    fn on_disconnect(&self, session: Arc<Session<SessionData>>, reason: enginemux::DisconnectReason) {
        debug!("[sid={}] engine session closed: {:?}", session.sid, reason);
        let namespaces: Vec<_> = self.ns.read().unwrap().values().cloned().collect();
        for ns in namespaces {
            if let Some(socket) = ns.get_socket(session.sid) {
                socket.close(reason.into());
            }
        }
    }

    fn on_message(&self, msg: String, session: Arc<Session<SessionData>>) {
        // A text frame while attachments are outstanding means the peer
        // never delivered them all.
        if let Some(stale) = session.data.partial.lock().unwrap().take() {
            let ns_path = stale.ns().to_string();
            self.surface_error(&session, &ns_path, ParseError::AttachmentMismatch.into());
        }

        match self.parser.decode_text(&msg) {
            Ok(Decoded::Packet(packet)) => self.dispatch(packet, &session),
            Ok(Decoded::Partial(partial)) => {
                session.data.partial.lock().unwrap().replace(partial);
            }
            Err(e) => {
                // One bad packet does not kill the session.
                debug!("[sid={}] undecodable packet: {}", session.sid, e);
            }
        }
    }

    fn on_binary(&self, data: Bytes, session: Arc<Session<SessionData>>) {
        let pending = session.data.partial.lock().unwrap().take();
        match pending {
            Some(partial) => {
                let ns_path = partial.ns().to_string();
                match partial.add_attachment(data) {
                    Ok(Decoded::Packet(packet)) => self.dispatch(packet, &session),
                    Ok(Decoded::Partial(partial)) => {
                        session.data.partial.lock().unwrap().replace(partial);
                    }
                    Err(e) => self.surface_error(&session, &ns_path, e.into()),
                }
            }
            None => match self.parser.decode_binary(data) {
                Ok(Decoded::Packet(packet)) => self.dispatch(packet, &session),
                Ok(Decoded::Partial(_)) => {
                    debug!("[sid={}] unexpected partial binary decode", session.sid);
                }
                Err(e) => {
                    debug!("[sid={}] undecodable binary frame: {}", session.sid, e);
                }
            },
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("parser", &self.parser)
            .field("namespaces", &self.ns.read().unwrap().len())
            .finish()
    }
}
