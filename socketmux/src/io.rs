//! The server façade: configuration, the HTTP service and the namespace
//! registration surface.

use std::{
    borrow::Cow,
    future::Future,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use enginemux::{service::EngineService, EngineConfigBuilder, TransportType};
use http::{Request, Response, StatusCode};
use hyper::Body;
use serde::Serialize;

use crate::{
    routing::Client,
    errors::BroadcastError,
    handler::{
        ConnectHandler, DisconnectHandler, MakeErasedConnectHandler, MessageHandler,
    },
    ns::Namespace,
    operators::Broadcast,
    rooms::RoomParam,
    socket::Socket,
    parser::Parser,
};

/// Builder for a [`SocketMux`] server.
pub struct SocketMuxBuilder {
    engine_config: EngineConfigBuilder,
    parser: Parser,
}

impl SocketMuxBuilder {
    pub fn new() -> Self {
        Self {
            engine_config: EngineConfigBuilder::new().req_path("/socket.io/"),
            parser: Parser::default(),
        }
    }

    /// The path to listen for requests on. Defaults to "/socket.io/".
    pub fn req_path(mut self, req_path: impl Into<String>) -> Self {
        self.engine_config = self.engine_config.req_path(req_path);
        self
    }

    /// The interval at which the server pings its clients.
    /// Defaults to 25 seconds.
    pub fn ping_interval(mut self, ping_interval: Duration) -> Self {
        self.engine_config = self.engine_config.ping_interval(ping_interval);
        self
    }

    /// How long the server waits for a pong before declaring a session
    /// dead. Defaults to 20 seconds.
    pub fn ping_timeout(mut self, ping_timeout: Duration) -> Self {
        self.engine_config = self.engine_config.ping_timeout(ping_timeout);
        self
    }

    /// Depth of the per-session egress queue. Defaults to 128 packets.
    pub fn max_buffer_size(mut self, max_buffer_size: usize) -> Self {
        self.engine_config = self.engine_config.max_buffer_size(max_buffer_size);
        self
    }

    /// The maximum accepted packet or request body size.
    /// Defaults to 100kB.
    pub fn max_payload(mut self, max_payload: u64) -> Self {
        self.engine_config = self.engine_config.max_payload(max_payload);
        self
    }

    /// Restrict the accepted transports.
    pub fn transports<const N: usize>(mut self, transports: [TransportType; N]) -> Self {
        self.engine_config = self.engine_config.transports(transports);
        self
    }

    /// Authorization hook for engine handshakes; rejected requests get a
    /// 403.
    pub fn allow_request(
        mut self,
        f: impl Fn(&http::request::Parts) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.engine_config = self.engine_config.allow_request(f);
        self
    }

    /// The packet parser shared by all sessions. Defaults to the textual
    /// parser with binary attachments.
    pub fn parser(mut self, parser: Parser) -> Self {
        self.parser = parser;
        self
    }

    /// Build the HTTP service and the server handle.
    pub fn build_svc(self) -> (SocketMuxService, SocketMux) {
        let client = Arc::new(Client::new(self.parser));
        let svc = EngineService::new(client.clone(), self.engine_config.build());
        (
            SocketMuxService { engine: svc.clone() },
            SocketMux {
                client,
                engine: svc,
            },
        )
    }
}

impl Default for SocketMuxBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The server handle: registers namespaces, broadcasts, shuts down.
/// Cheap to clone and share.
pub struct SocketMux {
    client: Arc<Client>,
    engine: EngineService<Client>,
}

impl SocketMux {
    pub fn builder() -> SocketMuxBuilder {
        SocketMuxBuilder::new()
    }

    /// Get or create the namespace registration handle for `path`.
    pub fn ns(&self, path: impl Into<Cow<'static, str>>) -> NamespaceHandle {
        NamespaceHandle {
            ns: self.client.add_ns(normalize(path.into())),
        }
    }

    /// Emit an event to every socket of a namespace.
    pub fn broadcast_to<T: Serialize>(
        &self,
        path: &str,
        event: impl Into<String>,
        data: T,
    ) -> Result<(), BroadcastError> {
        match self.client.get_ns(path) {
            Some(ns) => Broadcast::from_server(ns).emit(event, data),
            None => Ok(()),
        }
    }

    /// Emit an event to every socket joined to `rooms` in a namespace.
    pub fn broadcast_to_room<T: Serialize>(
        &self,
        path: &str,
        rooms: impl RoomParam,
        event: impl Into<String>,
        data: T,
    ) -> Result<(), BroadcastError> {
        match self.client.get_ns(path) {
            Some(ns) => Broadcast::from_server(ns).within(rooms).emit(event, data),
            None => Ok(()),
        }
    }

    /// Disconnect every socket and close every engine session.
    pub async fn close(&self) {
        self.client.close().await;
        self.engine.close();
    }
}

impl Clone for SocketMux {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            engine: self.engine.clone(),
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

/// The registration surface of one namespace.
#[derive(Clone)]
pub struct NamespaceHandle {
    ns: Arc<Namespace>,
}

impl NamespaceHandle {
    /// Set the connect hook. An infallible closure accepts every
    /// connection; a closure returning `Result<(), String>` can reject it,
    /// answering the peer with a CONNECT_ERROR carrying the message.
    pub fn on_connect<T>(&self, handler: impl ConnectHandler<T>) -> &Self
    where
        T: Send + Sync + 'static,
    {
        self.ns
            .set_connect_handler(MakeErasedConnectHandler::boxed(handler));
        self
    }

    /// Set the disconnect hook, invoked at most once per socket.
    pub fn on_disconnect(&self, handler: impl DisconnectHandler) -> &Self {
        self.ns.set_disconnect_handler(Arc::new(handler));
        self
    }

    /// Set the error hook: decode errors, protocol violations and handler
    /// panics scoped to this namespace.
    pub fn on_error(
        &self,
        handler: impl Fn(Arc<Socket>, crate::errors::Error) + Send + Sync + 'static,
    ) -> &Self {
        self.ns.set_error_handler(Arc::new(handler));
        self
    }

    /// Register an event handler. May be called repeatedly for the same
    /// event: handlers run in registration order and the first one gets
    /// the ack sender.
    pub fn on(&self, event: impl Into<String>, handler: impl MessageHandler<Socket>) -> &Self {
        self.ns.add_handler(event.into(), Arc::new(handler));
        self
    }

    /// The namespace path.
    pub fn path(&self) -> &str {
        &self.ns.path
    }
}

/// The HTTP entry point. Hand it requests from any hyper server; anything
/// outside the configured path gets a 404.
pub struct SocketMuxService {
    engine: EngineService<Client>,
}

impl SocketMuxService {
    /// Whether the request is addressed to this service.
    pub fn matches(&self, req: &Request<Body>) -> bool {
        self.engine.matches(req)
    }

    /// Handle one request. `remote_addr` is recorded on the session and
    /// surfaced through [`Socket::remote_addr`].
    pub async fn handle(
        &self,
        req: Request<Body>,
        remote_addr: Option<SocketAddr>,
    ) -> Response<Body> {
        self.engine.handle(req, remote_addr).await
    }
}

impl Clone for SocketMuxService {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
        }
    }
}

impl hyper::service::Service<Request<Body>> for SocketMuxService {
    type Response = Response<Body>;
    type Error = std::convert::Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let svc = self.clone();
        Box::pin(async move {
            if svc.matches(&req) {
                Ok(svc.handle(req, None).await)
            } else {
                Ok(Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Body::empty())
                    .unwrap())
            }
        })
    }
}
