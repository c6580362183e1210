use std::{
    future::Future,
    net::SocketAddr,
    pin::Pin,
    str::FromStr,
    sync::Arc,
    task::{Context, Poll},
};

use http::{
    header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, SEC_WEBSOCKET_ACCEPT, UPGRADE},
    HeaderValue, Method, Request, Response, StatusCode,
};
use hyper::Body;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tracing::debug;

use crate::{
    config::EngineConfig,
    engine::Engine,
    errors::Error,
    handler::EngineHandler,
    session::SessionReq,
    sid::Sid,
    transport::TransportType,
};

/// The HTTP entry point of the engine server.
///
/// The surrounding HTTP server is not this crate's concern: hand requests
/// arriving under the configured path to [`EngineService::handle`] and
/// return the response it produces. Websocket upgrades are driven through
/// hyper's upgrade machinery from inside the handler.
pub struct EngineService<H: EngineHandler> {
    engine: Arc<Engine<H>>,
}

impl<H: EngineHandler> Clone for EngineService<H> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
        }
    }
}

impl<H: EngineHandler> EngineService<H> {
    pub fn new(handler: Arc<H>, config: EngineConfig) -> Self {
        Self {
            engine: Arc::new(Engine::new(handler, config)),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.engine.config
    }

    /// Whether this request is addressed to the engine endpoint.
    pub fn matches(&self, req: &Request<Body>) -> bool {
        req.uri().path().starts_with(&self.engine.config.req_path)
    }

    /// Close every session.
    pub fn close(&self) {
        self.engine.close_all();
    }

    /// Handle one engine HTTP request.
    ///
    /// `remote_addr` is whatever peer address the caller's accept loop can
    /// provide; it is only recorded on the session for the application
    /// layer.
    pub async fn handle(
        &self,
        req: Request<Body>,
        remote_addr: Option<SocketAddr>,
    ) -> Response<Body> {
        let info = match RequestInfo::parse(&req, &self.engine.config) {
            Ok(info) => info,
            Err(status) => return empty_response(status),
        };

        let res = match (info.transport, info.sid) {
            (TransportType::Polling, None) if info.method == Method::GET => {
                if !self.authorized(&req) {
                    return empty_response(StatusCode::FORBIDDEN);
                }
                self.engine.clone().on_open_request(req, remote_addr)
            }
            (TransportType::Polling, Some(sid)) if info.method == Method::GET => {
                self.engine.clone().on_polling_request(sid).await
            }
            (TransportType::Polling, Some(sid)) if info.method == Method::POST => {
                self.engine.clone().on_post_request(sid, req).await
            }
            (TransportType::Websocket, sid) if info.method == Method::GET => {
                if sid.is_none() && !self.authorized(&req) {
                    return empty_response(StatusCode::FORBIDDEN);
                }
                self.on_ws_request(sid, req, remote_addr)
            }
            _ => Err(Error::HttpErrorResponse(StatusCode::BAD_REQUEST)),
        };
        res.unwrap_or_else(Response::from)
    }

    fn authorized(&self, req: &Request<Body>) -> bool {
        match &self.engine.config.allow_request {
            // The hook sees the request head only; cloning the parts here
            // keeps the body available for the engine.
            Some(allow) => {
                let (parts, _) = clone_request_head(req);
                allow(&parts)
            }
            None => true,
        }
    }

    /// Answer the websocket handshake and spawn the upgraded connection
    /// onto the engine.
    fn on_ws_request(
        &self,
        sid: Option<Sid>,
        req: Request<Body>,
        remote_addr: Option<SocketAddr>,
    ) -> Result<Response<Body>, Error> {
        let (parts, body) = req.into_parts();
        let ws_key = parts
            .headers
            .get("Sec-WebSocket-Key")
            .cloned()
            .ok_or(Error::HttpErrorResponse(StatusCode::BAD_REQUEST))?;
        let session_req = SessionReq::new(&parts, remote_addr);

        let req = Request::from_parts(parts, body);
        let engine = self.engine.clone();
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(conn) => match engine.on_ws_connection(conn, sid, session_req).await {
                    Ok(()) => debug!("websocket connection closed"),
                    Err(e) => debug!("websocket connection closed with error: {e:?}"),
                },
                Err(e) => debug!("websocket upgrade error: {e}"),
            }
        });

        ws_response(&ws_key)
    }
}

/// hyper service impl so the engine can be served standalone. The peer
/// address is not available through this path; use
/// [`EngineService::handle`] from a `make_service_fn` closure to record it.
impl<H: EngineHandler> hyper::service::Service<Request<Body>> for EngineService<H> {
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
                Ok(empty_response(StatusCode::NOT_FOUND))
            }
        })
    }
}

/// The request parameters of the engine query string.
#[derive(Debug)]
struct RequestInfo {
    sid: Option<Sid>,
    transport: TransportType,
    method: Method,
}

impl RequestInfo {
    fn parse(req: &Request<Body>, config: &EngineConfig) -> Result<Self, StatusCode> {
        let query = req.uri().query().ok_or(StatusCode::BAD_REQUEST)?;
        if !query.split('&').any(|s| s == "EIO=4") {
            return Err(StatusCode::BAD_REQUEST);
        }

        let sid = match query_param(query, "sid") {
            Some(raw) => Some(Sid::from_str(raw).map_err(|_| StatusCode::BAD_REQUEST)?),
            None => None,
        };

        let transport = query_param(query, "transport")
            .and_then(|t| t.parse::<TransportType>().ok())
            .ok_or(StatusCode::BAD_REQUEST)?;
        if !config.allows_transport(transport) {
            return Err(StatusCode::BAD_REQUEST);
        }

        Ok(RequestInfo {
            sid,
            transport,
            method: req.method().clone(),
        })
    }
}

fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|s| s.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

fn clone_request_head(req: &Request<Body>) -> (http::request::Parts, ()) {
    let mut builder = Request::builder()
        .method(req.method().clone())
        .uri(req.uri().clone());
    if let Some(headers) = builder.headers_mut() {
        headers.extend(req.headers().clone());
    }
    builder
        .body(())
        .expect("request head rebuild cannot fail")
        .into_parts()
}

pub(crate) fn empty_response(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .unwrap()
}

/// Build a plain-text engine response.
pub(crate) fn http_response(
    status: StatusCode,
    body: impl Into<String>,
) -> Result<Response<Body>, Error> {
    let body = body.into();
    Response::builder()
        .status(status)
        .header(CONTENT_LENGTH, body.len())
        .header(CONTENT_TYPE, "text/plain; charset=UTF-8")
        .body(Body::from(body))
        .map_err(Error::Http)
}

/// Build the 101 response of a websocket upgrade.
fn ws_response(ws_key: &HeaderValue) -> Result<Response<Body>, Error> {
    let accept = derive_accept_key(ws_key.as_bytes());
    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(UPGRADE, HeaderValue::from_static("websocket"))
        .header(CONNECTION, HeaderValue::from_static("Upgrade"))
        .header(
            SEC_WEBSOCKET_ACCEPT,
            accept.parse::<HeaderValue>().expect("valid accept key"),
        )
        .body(Body::empty())
        .map_err(Error::Http)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(path: &str) -> Request<Body> {
        Request::get(path).body(Body::empty()).unwrap()
    }

    #[test]
    fn request_info_open() {
        let req = get("http://localhost/socket.io/?EIO=4&transport=polling");
        let info = RequestInfo::parse(&req, &EngineConfig::default()).unwrap();
        assert_eq!(info.sid, None);
        assert_eq!(info.transport, TransportType::Polling);
        assert_eq!(info.method, Method::GET);
    }

    #[test]
    fn request_info_with_sid() {
        let sid = Sid::new();
        let req = get(&format!(
            "http://localhost/socket.io/?EIO=4&transport=websocket&sid={sid}"
        ));
        let info = RequestInfo::parse(&req, &EngineConfig::default()).unwrap();
        assert_eq!(info.sid, Some(sid));
        assert_eq!(info.transport, TransportType::Websocket);
    }

    #[test]
    fn request_info_rejects_bad_sid() {
        let req = get("http://localhost/socket.io/?EIO=4&transport=polling&sid=no");
        assert_eq!(
            RequestInfo::parse(&req, &EngineConfig::default()).unwrap_err(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn request_info_rejects_bad_transport() {
        let req = get("http://localhost/socket.io/?EIO=4&transport=smoke-signal");
        assert_eq!(
            RequestInfo::parse(&req, &EngineConfig::default()).unwrap_err(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn request_info_rejects_wrong_protocol() {
        let req = get("http://localhost/socket.io/?EIO=3&transport=polling");
        assert_eq!(
            RequestInfo::parse(&req, &EngineConfig::default()).unwrap_err(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn request_info_respects_transport_allowlist() {
        let config = EngineConfig::builder()
            .transports([TransportType::Websocket])
            .build();
        let req = get("http://localhost/socket.io/?EIO=4&transport=polling");
        assert_eq!(
            RequestInfo::parse(&req, &config).unwrap_err(),
            StatusCode::BAD_REQUEST
        );
    }
}
