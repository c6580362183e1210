use std::{sync::Arc, time::Duration};

use http::request::Parts;

use crate::transport::TransportType;

/// Authorization hook called with the handshake request before a session is
/// created. Returning `false` rejects the request with a 403.
pub type AllowRequestFn = Arc<dyn Fn(&Parts) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct EngineConfig {
    /// The path to listen for engine requests on.
    /// Defaults to "/socket.io/".
    pub req_path: String,

    /// The interval at which the server will send a ping packet to the client.
    /// Defaults to 25 seconds.
    pub ping_interval: Duration,

    /// The amount of time the server will wait for a pong after a ping
    /// before closing the session. Defaults to 20 seconds.
    pub ping_timeout: Duration,

    /// Depth of the per-session egress queue. Producers suspend when it is
    /// full. Defaults to 128 packets.
    pub max_buffer_size: usize,

    /// The maximum number of bytes accepted per packet or polling request
    /// body. Defaults to 100kB.
    pub max_payload: u64,

    /// The transports accepted by this server.
    /// Defaults to polling + websocket.
    pub transports: [Option<TransportType>; 2],

    /// Optional authorization hook for handshake requests.
    pub allow_request: Option<AllowRequestFn>,
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("req_path", &self.req_path)
            .field("ping_interval", &self.ping_interval)
            .field("ping_timeout", &self.ping_timeout)
            .field("max_buffer_size", &self.max_buffer_size)
            .field("max_payload", &self.max_payload)
            .field("transports", &self.transports)
            .field("allow_request", &self.allow_request.as_ref().map(|_| ".."))
            .finish()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            req_path: "/socket.io/".to_string(),
            ping_interval: Duration::from_millis(25000),
            ping_timeout: Duration::from_millis(20000),
            max_buffer_size: 128,
            max_payload: 1e5 as u64,
            transports: [Some(TransportType::Polling), Some(TransportType::Websocket)],
            allow_request: None,
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    /// Whether the given transport is accepted by this server.
    pub fn allows_transport(&self, transport: TransportType) -> bool {
        self.transports.iter().flatten().any(|t| *t == transport)
    }

    /// The transports a session on `current` may upgrade to.
    pub(crate) fn upgrades(&self, current: TransportType) -> Vec<String> {
        if current == TransportType::Polling && self.allows_transport(TransportType::Websocket) {
            vec![TransportType::Websocket.name().to_string()]
        } else {
            vec![]
        }
    }
}

pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    /// The path to listen for engine requests on.
    pub fn req_path(mut self, req_path: impl Into<String>) -> Self {
        self.config.req_path = req_path.into();
        self
    }

    /// The interval at which the server will send a ping packet to the client.
    pub fn ping_interval(mut self, ping_interval: Duration) -> Self {
        self.config.ping_interval = ping_interval;
        self
    }

    /// The amount of time the server will wait for a pong before closing
    /// the session.
    pub fn ping_timeout(mut self, ping_timeout: Duration) -> Self {
        self.config.ping_timeout = ping_timeout;
        self
    }

    /// Depth of the per-session egress queue.
    pub fn max_buffer_size(mut self, max_buffer_size: usize) -> Self {
        self.config.max_buffer_size = max_buffer_size;
        self
    }

    /// The maximum number of bytes accepted per packet or polling body.
    pub fn max_payload(mut self, max_payload: u64) -> Self {
        self.config.max_payload = max_payload;
        self
    }

    /// Restrict the accepted transports.
    pub fn transports<const N: usize>(mut self, transports: [TransportType; N]) -> Self {
        assert!(N > 0 && N <= 2, "transports array should be of size 1 or 2");
        self.config.transports = [None, None];
        for (slot, t) in self.config.transports.iter_mut().zip(transports) {
            *slot = Some(t);
        }
        self
    }

    /// Authorization hook for handshake requests; a `false` return rejects
    /// the request with a 403.
    pub fn allow_request(mut self, f: impl Fn(&Parts) -> bool + Send + Sync + 'static) -> Self {
        self.config.allow_request = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
