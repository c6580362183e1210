use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use http::{request::Parts, HeaderMap, Uri};
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::debug;

use crate::{config::EngineConfig, errors::Error, packet::Packet, sid::Sid, transport::TransportType};

/// All the causes for a session to be closed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer gracefully closed the session with a CLOSE packet.
    TransportClose,
    /// The underlying transport failed or was torn down.
    TransportError,
    /// No pong arrived within `ping_interval + ping_timeout`.
    HeartbeatTimeout,
    /// The engine framing itself was corrupt.
    PacketParsingError,
    /// The peer issued two simultaneous polling reads.
    MultiplePollingError,
    /// The server is shutting down.
    ClosingServer,
}

/// Request data captured when the session was opened.
#[derive(Debug, Default)]
pub struct SessionReq {
    pub uri: Uri,
    pub headers: HeaderMap,
    pub remote_addr: Option<SocketAddr>,
}

impl SessionReq {
    pub(crate) fn new(parts: &Parts, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            uri: parts.uri.clone(),
            headers: parts.headers.clone(),
            remote_addr,
        }
    }
}

/// A transport-agnostic engine session.
///
/// The session owns a bounded egress queue drained by the current
/// transport: a websocket writer pump, or the next parked polling read.
/// Producers suspend while the queue is full and are released with a
/// [`Error::SessionClosed`] when the session dies.
pub struct Session<D> {
    /// The session id exchanged during the handshake.
    pub sid: Sid,

    /// Current transport, stored as a [`TransportType`] discriminant so an
    /// upgrade can swap it without locking.
    transport: AtomicU8,

    /// Egress queue producer half.
    tx: mpsc::Sender<Packet>,
    /// Egress queue consumer half.
    ///
    /// Locked by whichever task currently owns the transport: for polling
    /// it is taken and released per GET request, for websocket the writer
    /// pump holds it until the session dies. The upgrade handshake waits on
    /// this lock to guarantee the old transport finished draining before
    /// the swap.
    pub(crate) internal_rx: Mutex<mpsc::Receiver<Packet>>,

    /// Signals received pongs to the heartbeat job.
    pub(crate) pong_tx: mpsc::Sender<()>,
    pong_rx: Mutex<mpsc::Receiver<()>>,
    heartbeat_handle: std::sync::Mutex<Option<JoinHandle<()>>>,

    /// Closed flag; producers and pumps watch it for cancellation.
    closed_tx: watch::Sender<bool>,

    /// Called once when the session closes, with the close reason.
    close_fn: Box<dyn Fn(Sid, DisconnectReason) + Send + Sync>,

    /// Per-session state owned by the application layer.
    pub data: D,

    /// Request data captured at handshake time.
    pub req: SessionReq,
}

impl<D: Default + Send + Sync + 'static> Session<D> {
    pub(crate) fn new(
        sid: Sid,
        transport: TransportType,
        config: &EngineConfig,
        req: SessionReq,
        close_fn: Box<dyn Fn(Sid, DisconnectReason) + Send + Sync>,
    ) -> Self {
        let (tx, internal_rx) = mpsc::channel(config.max_buffer_size);
        let (pong_tx, pong_rx) = mpsc::channel(1);
        let (closed_tx, _) = watch::channel(false);

        Self {
            sid,
            transport: AtomicU8::new(transport as u8),
            tx,
            internal_rx: Mutex::new(internal_rx),
            pong_tx,
            pong_rx: Mutex::new(pong_rx),
            heartbeat_handle: std::sync::Mutex::new(None),
            closed_tx,
            close_fn,
            data: D::default(),
            req,
        }
    }

    /// The transport the session is currently bound to.
    pub fn transport_type(&self) -> TransportType {
        if self.transport.load(Ordering::Relaxed) == TransportType::Websocket as u8 {
            TransportType::Websocket
        } else {
            TransportType::Polling
        }
    }

    pub(crate) fn is_ws(&self) -> bool {
        self.transport_type() == TransportType::Websocket
    }

    /// Marks the session as upgraded to websocket.
    pub(crate) fn upgrade_to_websocket(&self) {
        self.transport
            .store(TransportType::Websocket as u8, Ordering::Relaxed);
    }

    /// The peer address captured at handshake time, if the caller provided
    /// one.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.req.remote_addr
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    pub(crate) fn closed_watch(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Enqueue a single packet, suspending while the egress queue is full.
    pub async fn send(&self, packet: Packet) -> Result<(), Error> {
        self.send_all([packet]).await
    }

    /// Enqueue a batch of packets as one contiguous run, suspending while
    /// the queue lacks capacity for all of them.
    ///
    /// Contiguity matters to the application layer: a message header and
    /// its binary attachments must not interleave with packets enqueued by
    /// another task.
    pub async fn send_all<I>(&self, packets: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = Packet>,
        I::IntoIter: ExactSizeIterator,
    {
        let packets = packets.into_iter();
        let mut closed_rx = self.closed_tx.subscribe();
        if *closed_rx.borrow() {
            return Err(Error::SessionClosed);
        }
        let permits = tokio::select! {
            res = self.tx.reserve_many(packets.len()) => res.map_err(|_| Error::SessionClosed)?,
            _ = closed_rx.changed() => return Err(Error::SessionClosed),
        };
        for (permit, packet) in permits.zip(packets) {
            permit.send(packet);
        }
        Ok(())
    }

    /// Enqueue a single packet without suspending.
    pub fn try_send(&self, packet: Packet) -> Result<(), Error> {
        self.try_send_all([packet])
    }

    /// Enqueue a contiguous batch without suspending; fails if the queue
    /// cannot take the whole batch at once.
    pub fn try_send_all<I>(&self, packets: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = Packet>,
        I::IntoIter: ExactSizeIterator,
    {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        let packets = packets.into_iter();
        let permits = self
            .tx
            .try_reserve_many(packets.len())
            .map_err(|_| Error::SessionClosed)?;
        for (permit, packet) in permits.zip(packets) {
            permit.send(packet);
        }
        Ok(())
    }

    /// Send an application text message.
    pub async fn emit(&self, msg: String) -> Result<(), Error> {
        self.send(Packet::Message(msg)).await
    }

    /// Send an application binary message.
    pub async fn emit_binary(&self, data: Bytes) -> Result<(), Error> {
        self.send(Packet::Binary(data)).await
    }

    /// Close the session.
    ///
    /// Idempotent. A CLOSE packet is flushed to the peer on a best-effort
    /// basis, blocked producers are woken with [`Error::SessionClosed`],
    /// the heartbeat is aborted and the registered close callback runs with
    /// `reason`.
    pub fn close(&self, reason: DisconnectReason) {
        if self.closed_tx.send_replace(true) {
            return;
        }
        debug!("[sid={}] closing session: {:?}", self.sid, reason);
        // Buffered packets, including this one, still drain to the
        // transport before the pumps observe the closed flag.
        self.tx.try_send(Packet::Close).ok();
        self.abort_heartbeat();
        (self.close_fn)(self.sid, reason);
    }

    pub(crate) fn abort_heartbeat(&self) {
        if let Some(handle) = self.heartbeat_handle.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Spawn the server-side heartbeat job, keeping its handle so closing
    /// the session aborts it.
    pub(crate) fn spawn_heartbeat(self: Arc<Self>, interval: Duration, timeout: Duration) {
        let session = self.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = session.heartbeat_job(interval, timeout).await {
                debug!("[sid={}] heartbeat error: {:?}", session.sid, e);
                session.close(DisconnectReason::HeartbeatTimeout);
            }
        });
        self.heartbeat_handle
            .lock()
            .unwrap()
            .replace(handle);
    }

    /// Send a PING every `interval`; the session is dead if no PONG shows
    /// up within `timeout` of a PING.
    async fn heartbeat_job(&self, interval: Duration, timeout: Duration) -> Result<(), Error> {
        let mut pong_rx = self
            .pong_rx
            .try_lock()
            .expect("pong receiver should only be locked by the heartbeat job");
        debug!("[sid={}] heartbeat routine started", self.sid);
        loop {
            tokio::time::sleep(interval).await;
            // Drop any pong that arrived outside a ping window.
            pong_rx.try_recv().ok();
            self.try_send(Packet::Ping)?;
            tokio::time::timeout(timeout, pong_rx.recv())
                .await
                .map_err(|_| Error::HeartbeatTimeout)?
                .ok_or(Error::HeartbeatTimeout)?;
        }
    }
}

impl<D: Default + Send + Sync + 'static> std::fmt::Debug for Session<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("sid", &self.sid)
            .field("transport", &self.transport_type())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(any(test, feature = "__test_harness"))]
impl<D: Default + Send + Sync + 'static> Session<D> {
    /// Build a detached session for tests: no transport, no heartbeat.
    /// Sent packets accumulate in the egress queue and can be read back
    /// with [`Session::dummy_recv`].
    #[doc(hidden)]
    pub fn new_dummy(
        sid: Sid,
        close_fn: Box<dyn Fn(Sid, DisconnectReason) + Send + Sync>,
    ) -> Arc<Self> {
        let config = EngineConfig {
            max_buffer_size: 256,
            ..Default::default()
        };
        Arc::new(Session::new(
            sid,
            TransportType::Websocket,
            &config,
            SessionReq::default(),
            close_fn,
        ))
    }

    /// Pop the next packet buffered by a dummy session.
    #[doc(hidden)]
    pub async fn dummy_recv(&self) -> Option<Packet> {
        self.internal_rx.lock().await.try_recv().ok()
    }
}
