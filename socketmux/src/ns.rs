use std::{
    borrow::Cow,
    collections::HashMap,
    sync::{Arc, RwLock},
};

use enginemux::{Session, Sid};
use tracing::debug;

use crate::{
    routing::SessionData,
    errors::Error,
    handler::{BoxedErrorHandler, DisconnectHandler, ErasedConnectHandler, MessageHandler},
    packet::{Packet, PacketData},
    parser::Parser,
    rooms::Rooms,
    socket::{DisconnectReason, Socket},
};

/// A routing domain inside an engine session: hooks, event handlers, the
/// connected sockets and their rooms.
pub struct Namespace {
    pub path: Cow<'static, str>,
    pub(crate) rooms: Rooms,
    sockets: RwLock<HashMap<Sid, Arc<Socket>>>,
    connect_handler: RwLock<Option<Arc<dyn ErasedConnectHandler>>>,
    disconnect_handler: RwLock<Option<Arc<dyn DisconnectHandler>>>,
    error_handler: RwLock<Option<BoxedErrorHandler>>,
    handlers: RwLock<HashMap<String, Vec<Arc<dyn MessageHandler<Socket>>>>>,
}

impl Namespace {
    pub(crate) fn new(path: Cow<'static, str>) -> Arc<Self> {
        Arc::new(Self {
            path,
            rooms: Rooms::default(),
            sockets: RwLock::new(HashMap::new()),
            connect_handler: RwLock::new(None),
            disconnect_handler: RwLock::new(None),
            error_handler: RwLock::new(None),
            handlers: RwLock::new(HashMap::new()),
        })
    }

    pub(crate) fn set_connect_handler(&self, handler: Arc<dyn ErasedConnectHandler>) {
        self.connect_handler.write().unwrap().replace(handler);
    }

    pub(crate) fn set_disconnect_handler(&self, handler: Arc<dyn DisconnectHandler>) {
        self.disconnect_handler.write().unwrap().replace(handler);
    }

    pub(crate) fn set_error_handler(&self, handler: BoxedErrorHandler) {
        self.error_handler.write().unwrap().replace(handler);
    }

    /// Register an event handler. Multiple handlers per event are allowed
    /// and run in registration order.
    pub(crate) fn add_handler(&self, event: String, handler: Arc<dyn MessageHandler<Socket>>) {
        self.handlers
            .write()
            .unwrap()
            .entry(event)
            .or_default()
            .push(handler);
    }

    pub(crate) fn event_handlers(&self, event: &str) -> Vec<Arc<dyn MessageHandler<Socket>>> {
        self.handlers
            .read()
            .unwrap()
            .get(event)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn disconnect_handler(&self) -> Option<Arc<dyn DisconnectHandler>> {
        self.disconnect_handler.read().unwrap().clone()
    }

    /// Route an error to the namespace error hook, or log it when none is
    /// registered.
    pub(crate) fn handle_error(&self, socket: Arc<Socket>, err: Error) {
        let handler = self.error_handler.read().unwrap().clone();
        match handler {
            Some(handler) => handler(socket, err),
            None => debug!("[ns={}] unhandled error: {}", self.path, err),
        }
    }

    /// Run the connect handshake for a session: create the socket, consult
    /// the connect hook, then answer CONNECT or CONNECT_ERROR.
    pub(crate) async fn connect(
        self: Arc<Self>,
        esession: Arc<Session<SessionData>>,
        parser: Parser,
        auth: Option<crate::value::Value>,
    ) {
        let socket = Socket::create(self.clone(), esession, parser, auth);
        // The socket is routable while the hook runs so replies it awaits
        // (e.g. an acknowledgement) can reach it; a rejection takes it
        // back out.
        self.sockets
            .write()
            .unwrap()
            .insert(socket.id, socket.clone());

        let hook = self.connect_handler.read().unwrap().clone();
        let accepted = match hook {
            Some(hook) => hook.call(socket.clone()).await,
            None => Ok(()),
        };

        match accepted {
            Ok(()) => {
                socket.mark_connected();
                debug!("[ns={}] socket {} connected", self.path, socket.id);
                if socket
                    .send_packet(Packet::connect(self.path.clone(), socket.id))
                    .await
                    .is_err()
                {
                    socket.close(DisconnectReason::TransportError);
                }
            }
            Err(message) => {
                debug!("[ns={}] connection rejected: {}", self.path, message);
                socket
                    .send_packet(Packet::connect_error(self.path.clone(), message))
                    .await
                    .ok();
                socket.close(DisconnectReason::ServerNSDisconnect);
            }
        }
    }

    /// Route a non-connect packet to its socket.
    pub(crate) fn recv(&self, sid: Sid, data: PacketData) -> Result<(), Error> {
        match data {
            PacketData::Connect(_) => Err(Error::Parse(
                crate::parser::ParseError::InvalidPacketType,
            )),
            data => self
                .get_socket(sid)
                .ok_or(Error::SocketGone(sid))?
                .recv(data),
        }
    }

    #[cfg(test)]
    pub(crate) fn insert_socket(&self, socket: Arc<Socket>) {
        self.sockets.write().unwrap().insert(socket.id, socket);
    }

    pub(crate) fn get_socket(&self, sid: Sid) -> Option<Arc<Socket>> {
        self.sockets.read().unwrap().get(&sid).cloned()
    }

    pub(crate) fn sockets(&self) -> Vec<Arc<Socket>> {
        self.sockets.read().unwrap().values().cloned().collect()
    }

    /// Drop a socket from the namespace and all its rooms.
    pub(crate) fn remove_socket(&self, sid: Sid) {
        self.sockets.write().unwrap().remove(&sid);
        self.rooms.leave_all(sid);
    }

    /// Disconnect every socket, e.g. when the server closes.
    pub(crate) async fn close(&self, reason: DisconnectReason) {
        let sockets = self.sockets();
        debug!("[ns={}] closing {} sockets", self.path, sockets.len());
        for socket in sockets {
            socket
                .send_packet(Packet::disconnect(self.path.clone()))
                .await
                .ok();
            socket.close(reason);
        }
    }
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("path", &self.path)
            .field("sockets", &self.sockets.read().unwrap().len())
            .finish()
    }
}
