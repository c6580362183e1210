use http::{Response, StatusCode};
use hyper::Body;
use tokio_tungstenite::tungstenite;

use crate::sid::Sid;

/// Error type for the engine layer.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("error serializing handshake packet: {0:?}")]
    Serialize(#[from] serde_json::Error),

    #[error("error decoding base64 packet body: {0:?}")]
    Base64(#[from] base64::DecodeError),

    #[error("packet frame is not valid utf-8: {0:?}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("invalid packet frame")]
    InvalidFrame,

    #[error("invalid packet opcode: {0}")]
    InvalidOpcode(u8),

    #[error("invalid payload length prefix")]
    InvalidLengthPrefix,

    #[error("payload of {0} bytes exceeds the configured maximum")]
    PayloadTooLarge(usize),

    #[error("unknown session id: {0}")]
    UnknownSession(Sid),

    #[error("request transport does not match the session transport")]
    TransportMismatch,

    #[error("session is closed")]
    SessionClosed,

    #[error("heartbeat timeout")]
    HeartbeatTimeout,

    #[error("upgrade handshake failed")]
    UpgradeFailed,

    #[error("bad handshake: {0}")]
    BadHandshake(&'static str),

    #[error("ws transport error: {0:?}")]
    Ws(#[from] tungstenite::Error),

    #[error("http transport error: {0:?}")]
    HttpTransport(#[from] hyper::Error),

    #[error("http error: {0:?}")]
    Http(#[from] http::Error),

    #[error("http error response: {0:?}")]
    HttpErrorResponse(StatusCode),
}

/// Convert an engine error into an http response.
///
/// Known request-level errors map to their status code, anything else is a
/// 500 so a misbehaving client cannot learn about server internals.
impl From<Error> for Response<Body> {
    fn from(err: Error) -> Self {
        let status = match err {
            Error::HttpErrorResponse(code) => code,
            Error::UnknownSession(_)
            | Error::TransportMismatch
            | Error::InvalidLengthPrefix
            | Error::SessionClosed => StatusCode::BAD_REQUEST,
            Error::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            e => {
                tracing::debug!("uncaught error: {e:?}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Response::builder()
            .status(status)
            .body(Body::empty())
            .unwrap()
    }
}
