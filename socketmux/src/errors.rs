use enginemux::Sid;

use crate::parser::ParseError;
use crate::value::ValueError;

/// Errors surfaced through a namespace error hook or returned by the
/// routing layer.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A packet could not be decoded. The engine session survives; only
    /// corrupt engine framing kills a session.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// An ACK referenced an id with no pending entry.
    #[error("received ack with unknown id {0}")]
    UnknownAckId(i64),

    /// A packet was routed to a socket that is not connected.
    #[error("no socket {0} on this namespace")]
    SocketGone(Sid),

    /// The server rejected the namespace connection.
    #[error("connection rejected: {0}")]
    ConnectRejected(String),

    /// An event handler panicked. The panic is contained; the socket and
    /// session stay up.
    #[error("handler panicked: {0}")]
    HandlerPanic(String),

    #[error("engine error: {0}")]
    Engine(#[from] enginemux::Error),
}

/// Errors returned when emitting a packet.
#[derive(thiserror::Error, Debug)]
pub enum SendError {
    #[error("error encoding packet: {0}")]
    Encode(#[from] ParseError),

    #[error(transparent)]
    Value(#[from] ValueError),

    /// The socket or its engine session is closed.
    #[error("socket closed")]
    Closed,
}

impl From<enginemux::Error> for SendError {
    fn from(_: enginemux::Error) -> Self {
        SendError::Closed
    }
}

/// Errors returned by a broadcast; per-target failures are collected, the
/// remaining targets still receive the packet.
#[derive(thiserror::Error, Debug)]
pub enum BroadcastError {
    #[error("sending error to {} sockets", .0.len())]
    Send(Vec<SendError>),

    #[error("error encoding packet: {0}")]
    Encode(#[from] ParseError),

    #[error(transparent)]
    Value(#[from] ValueError),
}

/// Errors resolving an acknowledgement.
#[derive(thiserror::Error, Debug)]
pub enum AckError {
    /// The socket disconnected before the ack arrived.
    #[error("socket closed before the ack arrived")]
    Closed,

    /// The ack arrived but its payload did not decode as the expected
    /// type.
    #[error(transparent)]
    Decode(#[from] ValueError),
}
