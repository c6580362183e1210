//! A [`Socket`] is one (engine session, namespace) pair: the unit event
//! handlers are dispatched to and acknowledgements are correlated on.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};

use enginemux::{Session, Sid, TransportType};
use futures::future::BoxFuture;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    ack::{AckFuture, AckSender, AckTable},
    routing::SessionData,
    errors::{Error, SendError},
    handler::{panic_message, PacketSender},
    ns::Namespace,
    operators::Broadcast,
    packet::{Packet, PacketData},
    parser::{Parse, Parser, Payload},
    rooms::{Room, RoomParam},
    value::{self, Value},
};

/// All the causes for a socket to be disconnected from its namespace.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DisconnectReason {
    /// The peer gracefully closed the engine session.
    TransportClose,
    /// The engine transport failed.
    TransportError,
    /// No pong arrived in time on the engine session.
    HeartbeatTimeout,
    /// The engine framing was corrupt and the session was killed.
    PacketParsingError,
    /// The peer issued simultaneous polling reads.
    MultiplePollingError,
    /// The peer sent a DISCONNECT packet for this namespace.
    ClientNSDisconnect,
    /// The socket was disconnected locally with [`Socket::disconnect`].
    ServerNSDisconnect,
    /// The local endpoint is shutting down.
    ClosingServer,
}

impl From<enginemux::DisconnectReason> for DisconnectReason {
    fn from(reason: enginemux::DisconnectReason) -> Self {
        use enginemux::DisconnectReason as E;
        match reason {
            E::TransportClose => DisconnectReason::TransportClose,
            E::TransportError => DisconnectReason::TransportError,
            E::HeartbeatTimeout => DisconnectReason::HeartbeatTimeout,
            E::PacketParsingError => DisconnectReason::PacketParsingError,
            E::MultiplePollingError => DisconnectReason::MultiplePollingError,
            E::ClosingServer => DisconnectReason::ClosingServer,
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use DisconnectReason::*;
        let s = match self {
            TransportClose => "peer closed the connection",
            TransportError => "the connection was abruptly closed",
            HeartbeatTimeout => "no pong within the heartbeat deadline",
            PacketParsingError => "corrupt engine framing",
            MultiplePollingError => "simultaneous polling requests",
            ClientNSDisconnect => "peer left the namespace",
            ServerNSDisconnect => "socket was disconnected locally",
            ClosingServer => "endpoint is shutting down",
        };
        f.write_str(s)
    }
}

const STATE_CONNECTING: u8 = 0;
const STATE_CONNECTED: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Items processed by the per-socket dispatch task.
enum DispatchItem {
    Event {
        event: String,
        args: Vec<Value>,
        ack_id: Option<i64>,
    },
    Close {
        reason: DisconnectReason,
        was_connected: bool,
    },
}

/// A client connected to a namespace.
pub struct Socket {
    /// The engine session id; sockets of one session share it.
    pub id: Sid,
    pub(crate) ns: Arc<Namespace>,
    esession: Arc<Session<SessionData>>,
    parser: Parser,
    auth: Option<Value>,
    state: AtomicU8,
    acks: AckTable,
    dispatch_tx: mpsc::UnboundedSender<DispatchItem>,
}

impl Socket {
    /// Build the socket and spawn its dispatch task.
    ///
    /// Handlers run on that task one event at a time, in arrival order, so
    /// a slow handler never stalls the engine reader or another socket.
    pub(crate) fn create(
        ns: Arc<Namespace>,
        esession: Arc<Session<SessionData>>,
        parser: Parser,
        auth: Option<Value>,
    ) -> Arc<Self> {
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let socket = Arc::new(Self {
            id: esession.sid,
            ns,
            esession,
            parser,
            auth,
            state: AtomicU8::new(STATE_CONNECTING),
            acks: AckTable::default(),
            dispatch_tx,
        });
        tokio::spawn(dispatch_task(socket.clone(), dispatch_rx));
        socket
    }

    /// The namespace path this socket is bound to.
    pub fn ns(&self) -> &str {
        &self.ns.path
    }

    /// The engine session id.
    pub fn sid(&self) -> Sid {
        self.id
    }

    /// The auth payload the peer sent with its CONNECT packet.
    pub fn auth(&self) -> Option<&Value> {
        self.auth.as_ref()
    }

    /// The peer address of the underlying engine session, when the HTTP
    /// accept loop provided one.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.esession.remote_addr()
    }

    /// The transport the engine session currently runs on.
    pub fn transport_type(&self) -> TransportType {
        self.esession.transport_type()
    }

    pub fn connected(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_CONNECTED
    }

    /// Emit an event to the peer. A top-level array or tuple spreads into
    /// multiple arguments; binary leaves promote the packet to a binary
    /// event transparently.
    pub async fn emit<T: Serialize>(
        &self,
        event: impl Into<String>,
        data: T,
    ) -> Result<(), SendError> {
        let args = value::to_args(data)?;
        self.send_packet(Packet::event(self.ns.path.clone(), event.into(), args))
            .await
    }

    /// Emit an event and return a future resolving to the peer's
    /// acknowledgement.
    ///
    /// No timeout is applied; wrap the future if you need one. If the
    /// socket disconnects first the future resolves to
    /// [`AckError::Closed`](crate::AckError::Closed).
    pub async fn emit_with_ack<V: DeserializeOwned>(
        &self,
        event: impl Into<String>,
        data: impl Serialize,
    ) -> Result<AckFuture<V>, SendError> {
        let args = value::to_args(data)?;
        let (id, rx) = self.acks.register();
        let mut packet = Packet::event(self.ns.path.clone(), event.into(), args);
        packet.inner.set_ack_id(id);
        match self.send_packet(packet).await {
            Ok(()) => Ok(AckFuture::new(rx)),
            Err(e) => {
                self.acks.forget(id);
                Err(e)
            }
        }
    }

    // Room membership

    /// Join the given rooms, creating them on demand.
    pub fn join(&self, rooms: impl RoomParam) {
        self.ns.rooms.join(self.id, rooms);
    }

    /// Leave the given rooms.
    pub fn leave(&self, rooms: impl RoomParam) {
        self.ns.rooms.leave(self.id, rooms);
    }

    /// Leave every joined room.
    pub fn leave_all(&self) {
        self.ns.rooms.leave_all(self.id);
    }

    /// The rooms this socket has joined.
    pub fn rooms(&self) -> Vec<Room> {
        self.ns.rooms.rooms_of(self.id)
    }

    /// Target the members of the given rooms, excluding this socket.
    pub fn to(&self, rooms: impl RoomParam) -> Broadcast {
        Broadcast::from_socket(self.ns.clone(), self.id).to(rooms)
    }

    /// Target the members of the given rooms, including this socket.
    pub fn within(&self, rooms: impl RoomParam) -> Broadcast {
        Broadcast::from_socket(self.ns.clone(), self.id).within(rooms)
    }

    /// Exclude the members of the given rooms from the broadcast.
    pub fn except(&self, rooms: impl RoomParam) -> Broadcast {
        Broadcast::from_socket(self.ns.clone(), self.id).except(rooms)
    }

    /// Target every socket of the namespace except this one.
    pub fn broadcast(&self) -> Broadcast {
        Broadcast::from_socket(self.ns.clone(), self.id).broadcast()
    }

    /// Disconnect the socket from its namespace, sending a DISCONNECT
    /// packet to the peer. The engine session stays up for other
    /// namespaces.
    pub async fn disconnect(self: Arc<Self>) -> Result<(), SendError> {
        let res = self
            .send_packet(Packet::disconnect(self.ns.path.clone()))
            .await;
        self.close(DisconnectReason::ServerNSDisconnect);
        res
    }

    pub(crate) fn mark_connected(&self) {
        self.state
            .compare_exchange(
                STATE_CONNECTING,
                STATE_CONNECTED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .ok();
    }

    /// Tear the socket down: fail pending acks, stop the dispatch task
    /// (firing the disconnect hook when the socket had connected) and
    /// unregister from the namespace. Idempotent.
    pub(crate) fn close(&self, reason: DisconnectReason) {
        let prev = self.state.swap(STATE_CLOSED, Ordering::SeqCst);
        if prev == STATE_CLOSED {
            return;
        }
        debug!("[sid={}] socket closed: {}", self.id, reason);
        self.acks.fail_all();
        self.dispatch_tx
            .send(DispatchItem::Close {
                reason,
                was_connected: prev == STATE_CONNECTED,
            })
            .ok();
        self.ns.remove_socket(self.id);
    }

    /// Feed one received packet to the socket. Events go through the
    /// dispatch queue; acks resolve immediately in arrival order.
    pub(crate) fn recv(self: Arc<Self>, data: PacketData) -> Result<(), Error> {
        match data {
            PacketData::Event(event, args, ack_id)
            | PacketData::BinaryEvent(event, args, ack_id) => {
                self.dispatch_tx
                    .send(DispatchItem::Event {
                        event,
                        args,
                        ack_id,
                    })
                    .ok();
                Ok(())
            }
            PacketData::EventAck(args, id) | PacketData::BinaryAck(args, id) => {
                if !self.acks.resolve(id, args) {
                    self.ns
                        .handle_error(self.clone(), Error::UnknownAckId(id));
                }
                Ok(())
            }
            PacketData::Disconnect => {
                self.close(DisconnectReason::ClientNSDisconnect);
                Ok(())
            }
            PacketData::Connect(_) | PacketData::ConnectError(_) => Err(Error::Parse(
                crate::parser::ParseError::InvalidPacketType,
            )),
        }
    }

    /// Encode a packet with the socket's parser and push the resulting
    /// frames onto the engine session as one contiguous run.
    pub(crate) async fn send_packet(&self, packet: Packet) -> Result<(), SendError> {
        if self.state.load(Ordering::SeqCst) == STATE_CLOSED {
            return Err(SendError::Closed);
        }
        let frames = encode_frames(&self.parser, packet)?;
        self.esession.send_all(frames).await.map_err(Into::into)
    }

    /// Like [`send_packet`](Self::send_packet) but never suspends; used by
    /// broadcasts so one saturated socket cannot stall the others.
    pub(crate) fn try_send_packet(&self, packet: Packet) -> Result<(), SendError> {
        if self.state.load(Ordering::SeqCst) == STATE_CLOSED {
            return Err(SendError::Closed);
        }
        let frames = encode_frames(&self.parser, packet)?;
        self.esession.try_send_all(frames).map_err(Into::into)
    }
}

/// Encode an application packet into engine frames: the head frame
/// followed by one binary frame per attachment.
pub(crate) fn encode_frames(
    parser: &Parser,
    packet: Packet,
) -> Result<Vec<enginemux::Packet>, SendError> {
    let (head, attachments) = parser.encode(packet)?;
    let mut frames = Vec::with_capacity(1 + attachments.len());
    frames.push(match head {
        Payload::Text(text) => enginemux::Packet::Message(text),
        Payload::Binary(data) => enginemux::Packet::Binary(data),
    });
    frames.extend(attachments.into_iter().map(enginemux::Packet::Binary));
    Ok(frames)
}

impl PacketSender for Socket {
    fn ns_path(&self) -> &str {
        &self.ns.path
    }

    fn send_packet(&self, packet: Packet) -> BoxFuture<'static, Result<(), SendError>> {
        let parser = self.parser.clone();
        let esession = self.esession.clone();
        Box::pin(async move {
            let frames = encode_frames(&parser, packet)?;
            esession.send_all(frames).await.map_err(Into::into)
        })
    }
}

/// The per-socket dispatch loop: events are handled strictly one at a
/// time, in arrival order. Handlers run here, off the engine reader, and a
/// panicking handler is contained and reported to the namespace error
/// hook.
async fn dispatch_task(socket: Arc<Socket>, mut rx: mpsc::UnboundedReceiver<DispatchItem>) {
    while let Some(item) = rx.recv().await {
        match item {
            DispatchItem::Event {
                event,
                args,
                ack_id,
            } => {
                let handlers = socket.ns.event_handlers(&event);
                if handlers.is_empty() {
                    debug!("[sid={}] no handler for event {:?}", socket.id, event);
                    continue;
                }
                // Only the first handler is offered the ack; the others
                // run for their side effects.
                let mut ack = ack_id.map(|id| AckSender::new(socket.clone(), id));
                for handler in handlers {
                    let fut = handler.call(socket.clone(), args.clone(), ack.take());
                    if let Err(panic) = std::panic::AssertUnwindSafe(fut).catch_unwind().await {
                        socket.ns.handle_error(
                            socket.clone(),
                            Error::HandlerPanic(panic_message(panic)),
                        );
                    }
                }
            }
            DispatchItem::Close {
                reason,
                was_connected,
            } => {
                if was_connected {
                    if let Some(handler) = socket.ns.disconnect_handler() {
                        let fut = handler.call(socket.clone(), reason);
                        if let Err(panic) = std::panic::AssertUnwindSafe(fut).catch_unwind().await
                        {
                            socket.ns.handle_error(
                                socket.clone(),
                                Error::HandlerPanic(panic_message(panic)),
                            );
                        }
                    }
                }
                break;
            }
        }
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("sid", &self.id)
            .field("ns", &self.ns.path)
            .field("connected", &self.connected())
            .finish()
    }
}

impl PartialEq for Socket {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.ns.path == other.ns.path
    }
}
