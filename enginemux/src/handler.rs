use std::sync::Arc;

use bytes::Bytes;

use crate::session::{DisconnectReason, Session};

/// The interface the application layer implements to consume engine
/// sessions.
///
/// `on_message` and `on_binary` are called from the session reader and must
/// not block: hand the payload off to your own dispatch task if handling it
/// involves user code.
pub trait EngineHandler: Send + Sync + 'static {
    /// Per-session state owned by the application layer.
    type Data: Default + Send + Sync + 'static;

    /// Called when a session completes its handshake.
    fn on_connect(self: Arc<Self>, session: Arc<Session<Self::Data>>);

    /// Called exactly once when a session is closed, whatever the cause.
    fn on_disconnect(&self, session: Arc<Session<Self::Data>>, reason: DisconnectReason);

    /// Called for each message packet received on the session.
    fn on_message(&self, msg: String, session: Arc<Session<Self::Data>>);

    /// Called for each binary packet received on the session.
    fn on_binary(&self, data: Bytes, session: Arc<Session<Self::Data>>);
}
