use crate::handler::TransportKind;
use crate::name::ClientName;
use std::time::Duration;
use thiserror::Error;

/// Errors that fail a client build.
///
/// A build either produces a fully configured client or one of these; a
/// half-hardened client is never cached or handed out.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConfigError {
    /// The primary handler is not the transport the build path requires
    #[error("client '{client}': primary handler must be a {expected} transport, found {found}")]
    UnexpectedTransport {
        client: ClientName,
        expected: TransportKind,
        found: TransportKind,
    },

    /// The primary handler of the back-channel client is not the hardened
    /// transport, because a build stage swapped it out or nothing hardened it
    #[error("client '{client}': primary handler is not the hardened transport")]
    PrimaryReplaced { client: ClientName },

    /// A user layer dropped the handler it was given instead of delegating to it
    #[error("client '{client}': layer '{layer}' does not delegate to the inner handler")]
    LayerBypassesHandler { client: ClientName, layer: String },

    /// A configuration action rejected the build
    #[error("invalid client configuration: {0}")]
    Invalid(String),

    /// Invalid default header value
    #[error("invalid default header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    /// TLS connector could not be initialized
    #[error("TLS error: {0}")]
    Tls(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Request-level errors
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpError {
    /// Request building failed
    #[error("Failed to build request: {0}")]
    RequestBuild(#[from] http::Error),

    #[error("Invalid header name: {0}")]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),

    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    /// URL is not an absolute `http(s)` URI
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUri { url: String, reason: String },

    /// A single attempt exceeded the client timeout
    #[error("Request attempt timed out after {0:?}")]
    Timeout(Duration),

    /// Transport error (network, connection, TLS handshake)
    #[error("Transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Response body exceeded the client's buffer cap
    #[error("Response body too large: limit {limit} bytes, got {actual} bytes")]
    BodyTooLarge { limit: usize, actual: usize },

    /// Non-2xx status, produced only by the checked body readers
    #[error("HTTP {status}: {body_preview}")]
    HttpStatus {
        status: http::StatusCode,
        body_preview: String,
        content_type: Option<String>,
        retry_after: Option<Duration>,
    },

    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Form encoding failed: {0}")]
    FormEncode(#[from] serde_urlencoded::ser::Error),

    /// The client's request buffer worker is gone
    #[error("Service unavailable: internal failure")]
    ServiceClosed,
}

impl From<hyper::Error> for HttpError {
    fn from(err: hyper::Error) -> Self {
        HttpError::Transport(Box::new(err))
    }
}

impl From<hyper_util::client::legacy::Error> for HttpError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        HttpError::Transport(Box::new(err))
    }
}
