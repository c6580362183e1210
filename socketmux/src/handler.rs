//! Handler traits for events and lifecycle hooks.
//!
//! Event handlers are async closures taking the socket, the decoded
//! argument list and an optional ack sender. They are generic over the
//! socket type so the same machinery serves the server socket and the
//! client socket. Many handlers may be registered for one event; they run
//! in registration order and only the first one is handed the ack sender.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::ack::AckSender;
use crate::errors::SendError;
use crate::packet::Packet;
use crate::socket::Socket;
use crate::value::Value;

/// Implemented by socket types that can carry packets back to their peer;
/// this is what [`AckSender`] and the handler machinery emit through.
pub trait PacketSender: Send + Sync + 'static {
    /// The namespace path the socket is bound to.
    fn ns_path(&self) -> &str;

    /// Encode and send one application packet.
    fn send_packet(&self, packet: Packet) -> BoxFuture<'static, Result<(), SendError>>;
}

/// An event handler bound to socket type `S`.
pub trait MessageHandler<S>: Send + Sync + 'static {
    fn call(
        &self,
        socket: Arc<S>,
        args: Vec<Value>,
        ack: Option<AckSender<S>>,
    ) -> BoxFuture<'static, ()>;
}

impl<S, F, Fut> MessageHandler<S> for F
where
    S: PacketSender,
    F: Fn(Arc<S>, Vec<Value>, Option<AckSender<S>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(
        &self,
        socket: Arc<S>,
        args: Vec<Value>,
        ack: Option<AckSender<S>>,
    ) -> BoxFuture<'static, ()> {
        Box::pin(self(socket, args, ack))
    }
}

/// A connect hook. Returning an error rejects the connection: the peer
/// receives a CONNECT_ERROR packet with the message instead of a CONNECT
/// reply.
///
/// The `T` parameter only disambiguates the blanket impls for infallible
/// and fallible closures; it is inferred at the registration site.
pub trait ConnectHandler<T>: Send + Sync + 'static {
    fn call(&self, socket: Arc<Socket>) -> BoxFuture<'static, Result<(), String>>;
}

#[doc(hidden)]
pub struct Infallible;
#[doc(hidden)]
pub struct Fallible;

impl<F, Fut> ConnectHandler<Infallible> for F
where
    F: Fn(Arc<Socket>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, socket: Arc<Socket>) -> BoxFuture<'static, Result<(), String>> {
        let fut = self(socket);
        Box::pin(async move {
            fut.await;
            Ok(())
        })
    }
}

impl<F, Fut> ConnectHandler<Fallible> for F
where
    F: Fn(Arc<Socket>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    fn call(&self, socket: Arc<Socket>) -> BoxFuture<'static, Result<(), String>> {
        Box::pin(self(socket))
    }
}

/// The type-erased form of [`ConnectHandler`] stored by a namespace.
pub(crate) trait ErasedConnectHandler: Send + Sync + 'static {
    fn call(&self, socket: Arc<Socket>) -> BoxFuture<'static, Result<(), String>>;
}

pub(crate) struct MakeErasedConnectHandler<H, T> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<H, T> MakeErasedConnectHandler<H, T>
where
    H: ConnectHandler<T>,
    T: Send + Sync + 'static,
{
    pub(crate) fn boxed(handler: H) -> Arc<dyn ErasedConnectHandler> {
        Arc::new(Self {
            handler,
            _marker: PhantomData,
        })
    }
}

impl<H, T> ErasedConnectHandler for MakeErasedConnectHandler<H, T>
where
    H: ConnectHandler<T>,
    T: Send + Sync + 'static,
{
    fn call(&self, socket: Arc<Socket>) -> BoxFuture<'static, Result<(), String>> {
        self.handler.call(socket)
    }
}

/// A disconnect hook, invoked at most once per socket with the reason.
pub trait DisconnectHandler: Send + Sync + 'static {
    fn call(
        &self,
        socket: Arc<Socket>,
        reason: crate::socket::DisconnectReason,
    ) -> BoxFuture<'static, ()>;
}

impl<F, Fut> DisconnectHandler for F
where
    F: Fn(Arc<Socket>, crate::socket::DisconnectReason) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(
        &self,
        socket: Arc<Socket>,
        reason: crate::socket::DisconnectReason,
    ) -> BoxFuture<'static, ()> {
        Box::pin(self(socket, reason))
    }
}

/// An error hook: decode failures, protocol violations and handler panics
/// scoped to a namespace land here.
pub(crate) type BoxedErrorHandler =
    Arc<dyn Fn(Arc<Socket>, crate::errors::Error) + Send + Sync>;

/// Extract a printable message from a caught handler panic.
pub(crate) fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "opaque panic payload".to_string()
    }
}
