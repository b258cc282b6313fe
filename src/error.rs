//! Unified error handling for Pike.

use std::fmt;

use http::StatusCode;

/// Client-facing error kinds the data-plane core can surface.
#[derive(Debug)]
pub enum PikeError {
    /// Admission control rejected the request (503).
    TooManyRequests,

    /// No healthy backend for the selected director (502).
    NoHealthyBackend(String),

    /// Upstream fetch exceeded the configured timeout (504).
    GatewayTimeout,

    /// Upstream response used a `Content-Encoding` we don't stock (502).
    UnsupportedEncoding(String),

    /// Any unclassified failure (500).
    InternalError(String),

    /// Configuration is malformed or fails validation. Fatal at startup,
    /// logged-and-ignored on reload.
    Configuration(String),

    /// Wraps a Pingora framework error so it can flow through `?`.
    Pingora(pingora_error::Error),
}

impl PikeError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            PikeError::TooManyRequests => StatusCode::SERVICE_UNAVAILABLE,
            PikeError::NoHealthyBackend(_) => StatusCode::BAD_GATEWAY,
            PikeError::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            PikeError::UnsupportedEncoding(_) => StatusCode::BAD_GATEWAY,
            PikeError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            PikeError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            PikeError::Pingora(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// A short, stable label usable for logging and `Server-Timing` tags.
    pub fn label(&self) -> &'static str {
        match self {
            PikeError::TooManyRequests => "too_many_requests",
            PikeError::NoHealthyBackend(_) => "no_healthy_backend",
            PikeError::GatewayTimeout => "gateway_timeout",
            PikeError::UnsupportedEncoding(_) => "unsupported_encoding",
            PikeError::InternalError(_) => "internal_error",
            PikeError::Configuration(_) => "configuration",
            PikeError::Pingora(_) => "pingora",
        }
    }
}

impl fmt::Display for PikeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PikeError::TooManyRequests => write!(f, "too many concurrent requests"),
            PikeError::NoHealthyBackend(name) => write!(f, "no healthy backend for {name}"),
            PikeError::GatewayTimeout => write!(f, "upstream fetch timed out"),
            PikeError::UnsupportedEncoding(enc) => {
                write!(f, "unsupported upstream content-encoding: {enc}")
            }
            PikeError::InternalError(msg) => write!(f, "internal error: {msg}"),
            PikeError::Configuration(msg) => write!(f, "configuration error: {msg}"),
            PikeError::Pingora(err) => write!(f, "pingora error: {err}"),
        }
    }
}

impl std::error::Error for PikeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PikeError::Pingora(err) => Some(err),
            _ => None,
        }
    }
}

impl From<pingora_error::Error> for PikeError {
    fn from(err: pingora_error::Error) -> Self {
        PikeError::Pingora(err)
    }
}

impl From<PikeError> for Box<pingora_error::Error> {
    fn from(err: PikeError) -> Self {
        match err {
            PikeError::Pingora(pingora_err) => Box::new(pingora_err),
            other => Box::new(pingora_error::Error::new_str(Box::leak(
                other.to_string().into_boxed_str(),
            ))),
        }
    }
}

pub type PikeResult<T> = std::result::Result<T, PikeError>;
