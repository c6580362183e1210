//! Acknowledgement plumbing.
//!
//! An EVENT carrying an id obliges the receiver to answer with exactly one
//! ACK bearing the same id. On the receiving side the id materializes as an
//! [`AckSender`] handed to the first event handler; on the emitting side it
//! materializes as an [`AckFuture`] resolving to the reply payload.
//!
//! No timeout is built in: wrap the future in `tokio::time::timeout` if you
//! need one. When the socket disconnects first, the future resolves to
//! [`AckError::Closed`].

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::errors::{AckError, SendError};
use crate::handler::PacketSender;
use crate::packet::Packet;
use crate::value::{self, Value};

pub(crate) type AckResult = Result<Vec<Value>, AckError>;

/// A send-once handle that answers an EVENT with the matching ACK.
///
/// Consumed by [`send`](AckSender::send); dropping it without sending
/// leaves the peer without a reply.
pub struct AckSender<S: ?Sized> {
    socket: Arc<S>,
    id: i64,
}

impl<S: PacketSender> AckSender<S> {
    pub(crate) fn new(socket: Arc<S>, id: i64) -> Self {
        Self { socket, id }
    }

    /// The ack id being answered.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Send the reply. Binary leaves in `data` promote the reply to a
    /// binary ack transparently.
    pub async fn send<T: Serialize>(self, data: T) -> Result<(), SendError> {
        let args = value::to_args(data)?;
        let packet = Packet::ack(self.socket.ns_path().to_string(), args, self.id);
        self.socket.send_packet(packet).await
    }
}

/// Resolves to the typed ACK payload of an [`emit_with_ack`] call.
///
/// A single reply argument decodes as itself, several decode as a tuple or
/// array.
///
/// [`emit_with_ack`]: crate::Socket::emit_with_ack
pub struct AckFuture<V> {
    rx: oneshot::Receiver<AckResult>,
    _marker: PhantomData<fn() -> V>,
}

impl<V> AckFuture<V> {
    pub(crate) fn new(rx: oneshot::Receiver<AckResult>) -> Self {
        Self {
            rx,
            _marker: PhantomData,
        }
    }
}

impl<V: DeserializeOwned> Future for AckFuture<V> {
    type Output = Result<V, AckError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|res| match res {
            Ok(Ok(args)) => value::from_args(args).map_err(AckError::from),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AckError::Closed),
        })
    }
}

/// The pending-ack table of one socket: a monotonically increasing id
/// counter plus the reply channels keyed by id.
#[derive(Debug, Default)]
pub(crate) struct AckTable {
    counter: std::sync::atomic::AtomicI64,
    pending: std::sync::Mutex<std::collections::HashMap<i64, oneshot::Sender<AckResult>>>,
}

impl AckTable {
    /// Allocate the next outbound id and register its reply channel.
    pub(crate) fn register(&self) -> (i64, oneshot::Receiver<AckResult>) {
        let id = self
            .counter
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);
        (id, rx)
    }

    pub(crate) fn forget(&self, id: i64) {
        self.pending.lock().unwrap().remove(&id);
    }

    /// Resolve a received ACK. Returns false when the id is unknown.
    pub(crate) fn resolve(&self, id: i64, args: Vec<Value>) -> bool {
        match self.pending.lock().unwrap().remove(&id) {
            Some(tx) => {
                tx.send(Ok(args)).ok();
                true
            }
            None => false,
        }
    }

    /// Fail every pending ack with a terminal error; used when the socket
    /// disconnects.
    pub(crate) fn fail_all(&self) {
        for (_, tx) in self.pending.lock().unwrap().drain() {
            tx.send(Err(AckError::Closed)).ok();
        }
    }
}
