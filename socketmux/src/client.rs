//! The client façade: dial a server, multiplex namespaces over one engine
//! session, reconnect with bounded exponential backoff.

use std::{
    borrow::Cow,
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock, Weak,
    },
    time::Duration,
};

use bytes::Bytes;
use enginemux::client::{Backoff, ClientEvent, EngineClient};
use futures::future::BoxFuture;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::{
    ack::{AckFuture, AckSender, AckTable},
    errors::{Error, SendError},
    handler::{panic_message, MessageHandler, PacketSender},
    packet::{Packet, PacketData},
    parser::{Decoded, Parse, ParseError, Parser, PartialPacket},
    socket::{encode_frames, DisconnectReason},
    value::{self, Value},
};

/// Builder for a [`Client`].
pub struct ClientBuilder {
    url: String,
    req_path: String,
    parser: Parser,
    reconnect: bool,
    base_backoff: Duration,
    max_backoff: Duration,
    buffer_size: usize,
}

impl ClientBuilder {
    /// `url` is the http(s) base of the server, e.g.
    /// `http://localhost:3000`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            req_path: "/socket.io/".to_string(),
            parser: Parser::default(),
            reconnect: true,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            buffer_size: 128,
        }
    }

    /// The server endpoint path. Defaults to "/socket.io/".
    pub fn req_path(mut self, req_path: impl Into<String>) -> Self {
        self.req_path = req_path.into();
        self
    }

    /// The packet parser; must match the server.
    pub fn parser(mut self, parser: Parser) -> Self {
        self.parser = parser;
        self
    }

    /// Whether to reconnect automatically after a lost session.
    /// Defaults to true.
    pub fn reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Reconnect backoff schedule: starts at `base`, doubles up to `max`.
    pub fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.max_backoff = max;
        self
    }

    /// Depth of the egress queue.
    pub fn max_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Dial the server. The first connection attempt is not retried; the
    /// reconnect loop only takes over once a session existed.
    pub async fn connect(self) -> Result<Client, enginemux::Error> {
        let conn =
            enginemux::client::connect(&self.url, &self.req_path, self.buffer_size).await?;

        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let (cancel, _) = watch::channel(false);
        let inner = Arc::new(ClientInner {
            url: self.url,
            req_path: self.req_path,
            parser: self.parser,
            reconnect: self.reconnect,
            base_backoff: self.base_backoff,
            max_backoff: self.max_backoff,
            buffer_size: self.buffer_size,
            engine: Mutex::new(Some(conn.0.clone())),
            sockets: RwLock::new(HashMap::new()),
            partial: Mutex::new(None),
            dispatch_tx,
            cancel,
        });
        tokio::spawn(dispatch_task(dispatch_rx));
        tokio::spawn(run_loop(inner.clone(), Some(conn)));
        Ok(Client { inner })
    }
}

/// A connected client. Namespace sockets are obtained with
/// [`Client::ns`]; dropping the handle does not stop the session, call
/// [`Client::close`].
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Open (or return) the socket for a namespace and send its CONNECT.
    pub fn ns(&self, path: impl Into<Cow<'static, str>>) -> Arc<ClientSocket> {
        self.ns_with_auth(path, None)
    }

    /// Like [`ns`](Client::ns) with an auth payload carried in the
    /// CONNECT packet.
    pub fn ns_with_auth(
        &self,
        path: impl Into<Cow<'static, str>>,
        auth: Option<Value>,
    ) -> Arc<ClientSocket> {
        let path = normalize(path.into());
        if let Some(socket) = self.inner.socket_for(&path) {
            return socket;
        }
        let socket = Arc::new(ClientSocket {
            path: path.clone(),
            auth: auth.clone(),
            client: Arc::downgrade(&self.inner),
            connected: AtomicBool::new(false),
            handlers: RwLock::new(HashMap::new()),
            connect_cb: RwLock::new(None),
            disconnect_cb: RwLock::new(None),
            error_cb: RwLock::new(None),
            acks: AckTable::default(),
        });
        self.inner
            .sockets
            .write()
            .unwrap()
            .insert(path.clone(), socket.clone());

        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner
                .send_packet(Packet::connect_request(path, auth))
                .await
                .ok();
        });
        socket
    }

    /// The engine session id, when currently connected.
    pub fn sid(&self) -> Option<enginemux::Sid> {
        self.inner
            .engine
            .lock()
            .unwrap()
            .as_ref()
            .map(|e| e.sid())
    }

    /// Stop the session and the reconnect loop. Every namespace socket
    /// sees its disconnect callback.
    pub fn close(&self) {
        self.inner.cancel.send_replace(true);
    }
}

/// A client-side socket bound to one namespace.
pub struct ClientSocket {
    path: Cow<'static, str>,
    auth: Option<Value>,
    client: Weak<ClientInner>,
    connected: AtomicBool,
    handlers: RwLock<HashMap<String, Vec<Arc<dyn MessageHandler<ClientSocket>>>>>,
    connect_cb: RwLock<Option<Arc<dyn Fn(Arc<ClientSocket>) + Send + Sync>>>,
    disconnect_cb: RwLock<Option<Arc<dyn Fn(Arc<ClientSocket>, DisconnectReason) + Send + Sync>>>,
    error_cb: RwLock<Option<Arc<dyn Fn(Arc<ClientSocket>, Error) + Send + Sync>>>,
    acks: AckTable,
}

impl ClientSocket {
    /// The namespace path.
    pub fn ns(&self) -> &str {
        &self.path
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Register an event handler; multiple handlers per event run in
    /// registration order and the first one gets the ack sender.
    pub fn on(&self, event: impl Into<String>, handler: impl MessageHandler<ClientSocket>) -> &Self {
        self.handlers
            .write()
            .unwrap()
            .entry(event.into())
            .or_default()
            .push(Arc::new(handler));
        self
    }

    /// Called once the namespace CONNECT is acknowledged, including after
    /// every reconnect.
    pub fn on_connect(&self, cb: impl Fn(Arc<ClientSocket>) + Send + Sync + 'static) -> &Self {
        self.connect_cb.write().unwrap().replace(Arc::new(cb));
        self
    }

    /// Called when the namespace disconnects, with the reason.
    pub fn on_disconnect(
        &self,
        cb: impl Fn(Arc<ClientSocket>, DisconnectReason) + Send + Sync + 'static,
    ) -> &Self {
        self.disconnect_cb.write().unwrap().replace(Arc::new(cb));
        self
    }

    /// Called for namespace-scoped errors: rejected connects, decode
    /// errors, handler panics.
    pub fn on_error(
        &self,
        cb: impl Fn(Arc<ClientSocket>, Error) + Send + Sync + 'static,
    ) -> &Self {
        self.error_cb.write().unwrap().replace(Arc::new(cb));
        self
    }

    /// Emit an event to the server.
    pub async fn emit<T: Serialize>(
        &self,
        event: impl Into<String>,
        data: T,
    ) -> Result<(), SendError> {
        let args = value::to_args(data)?;
        self.send_raw(Packet::event(self.path.clone(), event.into(), args))
            .await
    }

    /// Emit an event and await the server acknowledgement. No timeout is
    /// built in.
    pub async fn emit_with_ack<V: DeserializeOwned>(
        &self,
        event: impl Into<String>,
        data: impl Serialize,
    ) -> Result<AckFuture<V>, SendError> {
        let args = value::to_args(data)?;
        let (id, rx) = self.acks.register();
        let mut packet = Packet::event(self.path.clone(), event.into(), args);
        packet.inner.set_ack_id(id);
        match self.send_raw(packet).await {
            Ok(()) => Ok(AckFuture::new(rx)),
            Err(e) => {
                self.acks.forget(id);
                Err(e)
            }
        }
    }

    /// Leave the namespace; the engine session stays up for the others.
    pub async fn disconnect(self: Arc<Self>) -> Result<(), SendError> {
        let res = self.send_raw(Packet::disconnect(self.path.clone())).await;
        if let Some(inner) = self.client.upgrade() {
            inner.sockets.write().unwrap().remove(&self.path);
        }
        self.drop_connection(DisconnectReason::ClientNSDisconnect);
        res
    }

    async fn send_raw(&self, packet: Packet) -> Result<(), SendError> {
        let inner = self.client.upgrade().ok_or(SendError::Closed)?;
        inner.send_packet(packet).await
    }

    fn handlers_for(&self, event: &str) -> Vec<Arc<dyn MessageHandler<ClientSocket>>> {
        self.handlers
            .read()
            .unwrap()
            .get(event)
            .cloned()
            .unwrap_or_default()
    }

    fn emit_error(self: Arc<Self>, err: Error) {
        let cb = self.error_cb.read().unwrap().clone();
        match cb {
            Some(cb) => cb(self, err),
            None => debug!("[ns={}] unhandled client error: {}", self.path, err),
        }
    }

    /// Mark the socket disconnected, fail pending acks and fire the
    /// disconnect callback once.
    fn drop_connection(self: Arc<Self>, reason: DisconnectReason) {
        self.acks.fail_all();
        if self.connected.swap(false, Ordering::SeqCst) {
            let cb = self.disconnect_cb.read().unwrap().clone();
            if let Some(cb) = cb {
                cb(self, reason);
            }
        }
    }
}

impl PacketSender for ClientSocket {
    fn ns_path(&self) -> &str {
        &self.path
    }

    fn send_packet(&self, packet: Packet) -> BoxFuture<'static, Result<(), SendError>> {
        let client = self.client.clone();
        Box::pin(async move {
            let inner = client.upgrade().ok_or(SendError::Closed)?;
            inner.send_packet(packet).await
        })
    }
}

impl std::fmt::Debug for ClientSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSocket")
            .field("ns", &self.path)
            .field("connected", &self.connected())
            .finish()
    }
}

struct ClientInner {
    url: String,
    req_path: String,
    parser: Parser,
    reconnect: bool,
    base_backoff: Duration,
    max_backoff: Duration,
    buffer_size: usize,
    engine: Mutex<Option<EngineClient>>,
    sockets: RwLock<HashMap<Cow<'static, str>, Arc<ClientSocket>>>,
    partial: Mutex<Option<PartialPacket>>,
    dispatch_tx: mpsc::UnboundedSender<DispatchEvent>,
    cancel: watch::Sender<bool>,
}

struct DispatchEvent {
    socket: Arc<ClientSocket>,
    event: String,
    args: Vec<Value>,
    ack_id: Option<i64>,
}

impl ClientInner {
    fn socket_for(&self, path: &str) -> Option<Arc<ClientSocket>> {
        self.sockets.read().unwrap().get(path).cloned()
    }

    async fn send_packet(&self, packet: Packet) -> Result<(), SendError> {
        let engine = self
            .engine
            .lock()
            .unwrap()
            .clone()
            .ok_or(SendError::Closed)?;
        let frames = encode_frames(&self.parser, packet)?;
        engine.send_all(frames).await.map_err(Into::into)
    }

    /// Re-issue the CONNECT of every known namespace; used after each
    /// (re)connection.
    async fn announce_namespaces(&self) {
        let sockets: Vec<_> = self.sockets.read().unwrap().values().cloned().collect();
        for socket in sockets {
            self.send_packet(Packet::connect_request(
                socket.path.clone(),
                socket.auth.clone(),
            ))
            .await
            .ok();
        }
    }

    fn on_text(&self, msg: String) {
        if let Some(stale) = self.partial.lock().unwrap().take() {
            self.surface_parse_error(stale.ns(), ParseError::AttachmentMismatch);
        }
        match self.parser.decode_text(&msg) {
            Ok(Decoded::Packet(packet)) => self.dispatch(packet),
            Ok(Decoded::Partial(partial)) => {
                self.partial.lock().unwrap().replace(partial);
            }
            Err(e) => debug!("undecodable packet from server: {e}"),
        }
    }

    fn on_binary(&self, data: Bytes) {
        let pending = self.partial.lock().unwrap().take();
        match pending {
            Some(partial) => {
                let ns = partial.ns().to_string();
                match partial.add_attachment(data) {
                    Ok(Decoded::Packet(packet)) => self.dispatch(packet),
                    Ok(Decoded::Partial(partial)) => {
                        self.partial.lock().unwrap().replace(partial);
                    }
                    Err(e) => self.surface_parse_error(&ns, e),
                }
            }
            None => match self.parser.decode_binary(data) {
                Ok(Decoded::Packet(packet)) => self.dispatch(packet),
                Ok(Decoded::Partial(_)) => debug!("unexpected partial binary decode"),
                Err(e) => debug!("undecodable binary frame from server: {e}"),
            },
        }
    }

    fn surface_parse_error(&self, ns: &str, err: ParseError) {
        match self.socket_for(ns) {
            Some(socket) => socket.emit_error(err.into()),
            None => debug!("[ns={ns}] decode error: {err}"),
        }
    }

    fn dispatch(&self, packet: Packet) {
        let Some(socket) = self.socket_for(&packet.ns) else {
            debug!("packet for unknown namespace {}", packet.ns);
            return;
        };
        match packet.inner {
            PacketData::Connect(_) => {
                socket.connected.store(true, Ordering::SeqCst);
                debug!("[ns={}] namespace connected", socket.path);
                let cb = socket.connect_cb.read().unwrap().clone();
                if let Some(cb) = cb {
                    cb(socket.clone());
                }
            }
            PacketData::ConnectError(message) => {
                socket.connected.store(false, Ordering::SeqCst);
                socket.emit_error(Error::ConnectRejected(message));
            }
            PacketData::Event(event, args, ack_id)
            | PacketData::BinaryEvent(event, args, ack_id) => {
                self.dispatch_tx
                    .send(DispatchEvent {
                        socket,
                        event,
                        args,
                        ack_id,
                    })
                    .ok();
            }
            PacketData::EventAck(args, id) | PacketData::BinaryAck(args, id) => {
                if !socket.acks.resolve(id, args) {
                    socket.emit_error(Error::UnknownAckId(id));
                }
            }
            PacketData::Disconnect => {
                socket.drop_connection(DisconnectReason::ServerNSDisconnect);
            }
        }
    }

    /// Fail every namespace socket after the engine session died.
    fn drop_sockets(&self, reason: DisconnectReason) {
        let sockets: Vec<_> = self.sockets.read().unwrap().values().cloned().collect();
        for socket in sockets {
            socket.drop_connection(reason);
        }
    }
}

/// The connection state machine: one flat loop that owns the current
/// engine session and sleeps through backoff between attempts.
/// Cancellation (via [`Client::close`]) is observable at every await
/// point.
async fn run_loop(
    inner: Arc<ClientInner>,
    mut first: Option<(EngineClient, mpsc::Receiver<ClientEvent>)>,
) {
    let mut backoff = Backoff::new(inner.base_backoff, inner.max_backoff);
    let mut cancel = inner.cancel.subscribe();
    loop {
        let (engine, mut events) = match first.take() {
            Some(conn) => conn,
            None => {
                match enginemux::client::connect(&inner.url, &inner.req_path, inner.buffer_size)
                    .await
                {
                    Ok(conn) => conn,
                    Err(e) => {
                        debug!("reconnect attempt failed: {e}");
                        if !wait_backoff(&mut backoff, &mut cancel).await {
                            return;
                        }
                        continue;
                    }
                }
            }
        };
        debug!("[sid={}] client session open", engine.sid());
        inner.engine.lock().unwrap().replace(engine.clone());
        backoff.reset();
        inner.announce_namespaces().await;

        let reason = loop {
            tokio::select! {
                _ = async { cancel.wait_for(|c| *c).await.ok(); } => {
                    engine.close().await;
                    break DisconnectReason::ClosingServer;
                }
                event = events.recv() => match event {
                    Some(ClientEvent::Message(msg)) => inner.on_text(msg),
                    Some(ClientEvent::Binary(data)) => inner.on_binary(data),
                    Some(ClientEvent::Closed(reason)) => break reason.into(),
                    None => break DisconnectReason::TransportError,
                },
            }
        };
        debug!("client session ended: {reason}");
        inner.engine.lock().unwrap().take();
        inner.partial.lock().unwrap().take();
        inner.drop_sockets(reason);

        if *cancel.borrow() || !inner.reconnect {
            return;
        }
        if !wait_backoff(&mut backoff, &mut cancel).await {
            return;
        }
    }
}

/// Sleep through the next backoff delay; false when cancelled.
async fn wait_backoff(backoff: &mut Backoff, cancel: &mut watch::Receiver<bool>) -> bool {
    let delay = backoff.next_delay();
    tokio::select! {
        _ = cancel.wait_for(|c| *c) => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Run the event handlers of all client sockets, one event at a time per
/// client, preserving per-socket arrival order.
async fn dispatch_task(mut rx: mpsc::UnboundedReceiver<DispatchEvent>) {
    while let Some(DispatchEvent {
        socket,
        event,
        args,
        ack_id,
    }) = rx.recv().await
    {
        let handlers = socket.handlers_for(&event);
        if handlers.is_empty() {
            debug!("[ns={}] no handler for event {:?}", socket.path, event);
            continue;
        }
        let mut ack = ack_id.map(|id| AckSender::new(socket.clone(), id));
        for handler in handlers {
            let fut = handler.call(socket.clone(), args.clone(), ack.take());
            if let Err(panic) = std::panic::AssertUnwindSafe(fut).catch_unwind().await {
                socket
                    .clone()
                    .emit_error(Error::HandlerPanic(panic_message(panic)));
            }
        }
    }
}

fn normalize(path: Cow<'static, str>) -> Cow<'static, str> {
    if path.starts_with('/') {
        path
    } else {
        Cow::Owned(format!("/{path}"))
    }
}
