//! Engine layer for realtime bidirectional messaging: a transport-agnostic
//! session protocol carrying opaque text or binary messages over websocket
//! (full duplex) or HTTP long-polling (server side only), compatible with
//! the engine.io revision 4 wire format.
//!
//! The entry points are:
//! * [`EngineService`](service::EngineService) on the server: an HTTP
//!   handler that performs the open handshake, routes polling reads/writes
//!   and upgrades sessions to websocket.
//! * [`client::connect`] on the client: dials a server over websocket and
//!   returns an [`EngineClient`](client::EngineClient) handle plus an
//!   ingress event stream.
//!
//! Everything above raw messages (multiplexing, acknowledgements, rooms) is
//! the responsibility of the application layer built on top of the
//! [`EngineHandler`](handler::EngineHandler) trait.

pub mod client;
pub mod config;
pub mod errors;
pub mod handler;
pub mod service;
pub mod session;
pub mod sid;
pub mod transport;

mod engine;
mod packet;
mod payload;

pub use config::{EngineConfig, EngineConfigBuilder};
pub use errors::Error;
pub use handler::EngineHandler;
pub use packet::{OpenPacket, Packet};
pub use session::{DisconnectReason, Session};
pub use sid::Sid;
pub use transport::TransportType;
