//! Namespace-multiplexed, event-oriented messaging over the
//! [`enginemux`] transport layer, compatible with the socket.io revision 4
//! wire format.
//!
//! Many logical sockets ride one engine session, each bound to a
//! namespace path. Sockets dispatch named events to registered handlers,
//! correlate acknowledgements, and join process-local broadcast rooms.
//!
//! # Server
//!
//! ```no_run
//! use socketmux::{SocketMux, AckSender, Socket, Value};
//! use std::sync::Arc;
//!
//! let (svc, io) = SocketMux::builder().build_svc();
//! io.ns("/")
//!     .on_connect(|socket: Arc<Socket>| async move {
//!         println!("connected: {}", socket.id);
//!     })
//!     .on("echo", |_socket: Arc<Socket>, args: Vec<Value>, ack: Option<AckSender<Socket>>| async move {
//!         if let Some(ack) = ack {
//!             ack.send(args).await.ok();
//!         }
//!     });
//! // `svc` handles HTTP requests under /socket.io/ on any hyper server.
//! # drop(svc);
//! ```
//!
//! # Client
//!
//! ```no_run
//! use socketmux::client::ClientBuilder;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ClientBuilder::new("http://localhost:3000").connect().await?;
//! let socket = client.ns("/");
//! socket.emit("echo", "hi").await?;
//! # Ok(()) }
//! ```

pub mod client;
pub mod parser;
pub mod value;

mod ack;
mod errors;
mod handler;
mod io;
mod ns;
mod operators;
mod packet;
mod rooms;
mod routing;
mod socket;

pub use ack::{AckFuture, AckSender};
pub use errors::{AckError, BroadcastError, Error, SendError};
pub use handler::{ConnectHandler, DisconnectHandler, MessageHandler, PacketSender};
pub use io::{NamespaceHandle, SocketMux, SocketMuxBuilder, SocketMuxService};
pub use operators::Broadcast;
pub use packet::{Packet, PacketData};
pub use rooms::{Room, RoomParam};
pub use routing::SessionData;
pub use socket::{DisconnectReason, Socket};
pub use value::Value;

pub use enginemux::TransportType;
