//! HTTP transport for the job backend: envelope decoding, typed errors, endpoints.

pub mod client;
pub mod models;

pub use self::client::ApiClient;

use serde::Deserialize;
use thiserror::Error;

/// Path prefix every backend endpoint lives under.
pub const API_PREFIX: &str = "/api/v1";

/// Uniform wrapper returned by every JSON endpoint.
///
/// `code == 200` together with a present `result` is the only success shape.
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    pub result: Option<T>,
    pub detail: Option<String>,
}

/// What went wrong on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Connection, DNS, TLS or timeout failure; no response was read.
    Network,
    /// The server answered with a non-2xx HTTP status.
    Http,
    /// The body could not be decoded as the expected JSON shape.
    Decode,
    /// A well-formed envelope reported failure (`code != 200` or no `result`).
    Envelope,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportErrorKind::Network => write!(f, "network"),
            TransportErrorKind::Http => write!(f, "http"),
            TransportErrorKind::Decode => write!(f, "decode"),
            TransportErrorKind::Envelope => write!(f, "envelope"),
        }
    }
}

/// Error surfaced by every backend call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} error: {message}{}", status_suffix(.http_status))]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
    pub http_status: Option<u16>,
    pub code: Option<i64>,
    pub detail: Option<String>,
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

impl TransportError {
    pub fn network(err: &reqwest::Error) -> Self {
        Self {
            kind: TransportErrorKind::Network,
            message: err.to_string(),
            http_status: None,
            code: None,
            detail: None,
        }
    }

    pub fn decode(message: impl Into<String>, http_status: u16) -> Self {
        Self {
            kind: TransportErrorKind::Decode,
            message: message.into(),
            http_status: Some(http_status),
            code: None,
            detail: None,
        }
    }

    /// HTTP 404: for artifact fetches this means "not produced yet".
    pub fn is_absence(&self) -> bool {
        self.http_status == Some(404)
    }

    /// Human-facing text, preferring the server's `detail` when it sent one.
    pub fn display_message(&self) -> String {
        match &self.detail {
            Some(detail) if !detail.is_empty() => format!("{} ({})", self.message, detail),
            _ => self.message.clone(),
        }
    }
}

/// A locally detected malformed backend address, raised before any request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("backend address is empty")]
    EmptyAddress,

    #[error("backend address '{address}' is not a valid URL: {reason}")]
    InvalidUrl { address: String, reason: String },

    #[error("backend address '{address}' must use http or https, got '{scheme}'")]
    UnsupportedScheme { address: String, scheme: String },

    #[error("backend address '{address}' has no host")]
    MissingHost { address: String },

    #[error("backend address '{address}' must not carry a query or fragment")]
    UnexpectedSuffix { address: String },
}
