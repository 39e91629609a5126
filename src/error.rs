use std::fmt;

use http::StatusCode;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures while mapping a header set between HTTP/1.1 and HTTP/2.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranslationError {
    #[error("request has neither :authority nor Host")]
    MissingAuthority,

    #[error("required pseudo header is missing: {0}")]
    MissingPseudoHeader(&'static str),

    #[error("invalid header {0}")]
    InvalidHeader(String),

    #[error("invalid status code: {0}")]
    InvalidStatus(String),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("HTTP/2 error: {0}")]
    H2(#[from] h2::Error),

    #[error("HTTP message error: {0}")]
    HttpMessage(#[from] http::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] openssl::error::ErrorStack),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("Header translation error: {0}")]
    Translation(#[from] TranslationError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error("Tunnel error: {0}")]
    Tunnel(String),

    #[error("Resource limit exceeded: {0}")]
    ResourceLimit(String),

    #[error("Forwarding failed: {0}")]
    ForwardingFailed(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Filter error: {0}")]
    Filter(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn protocol<T: fmt::Display>(msg: T) -> Self {
        Error::Protocol(msg.to_string())
    }

    pub fn handshake<T: fmt::Display>(msg: T) -> Self {
        Error::Handshake(msg.to_string())
    }

    pub fn tunnel<T: fmt::Display>(msg: T) -> Self {
        Error::Tunnel(msg.to_string())
    }

    pub fn resource_limit<T: fmt::Display>(msg: T) -> Self {
        Error::ResourceLimit(msg.to_string())
    }

    pub fn forwarding_failed<T: fmt::Display>(msg: T) -> Self {
        Error::ForwardingFailed(msg.to_string())
    }

    pub fn timeout<T: fmt::Display>(msg: T) -> Self {
        Error::Timeout(msg.to_string())
    }

    pub fn certificate<T: fmt::Display>(msg: T) -> Self {
        Error::Certificate(msg.to_string())
    }

    pub fn filter<T: fmt::Display>(msg: T) -> Self {
        Error::Filter(msg.to_string())
    }

    pub fn internal<T: fmt::Display>(msg: T) -> Self {
        Error::Internal(msg.to_string())
    }

    /// Malformed input from the peer. Only the offending stream or connection is torn down.
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Error::Protocol(_) | Error::Translation(_))
    }

    /// The caller may retry the same operation; nothing about the request itself was wrong.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::ForwardingFailed(_))
    }

    /// Status used when the error is reported on the exchange that caused it.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Protocol(_) | Error::Translation(_) => StatusCode::BAD_REQUEST,
            Error::Tunnel(_) | Error::ForwardingFailed(_) | Error::Handshake(_) => {
                StatusCode::BAD_GATEWAY
            }
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::ResourceLimit(_) => StatusCode::LOOP_DETECTED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
