//! The HTTP transport seam.
//!
//! The call engine drives a narrow contract: [`Transport::send`] takes a
//! request whose body is a [`TransportBody`] and resolves to a response with
//! a boxed streaming body that can surface trailers. Dropping the response
//! body aborts the underlying stream (RST_STREAM on HTTP/2), which is how
//! call cancellation reaches the server.
//!
//! [`HyperTransport`] is the default implementation, built on hyper_util's
//! legacy client. TLS and name resolution are deliberately outside this
//! crate: callers needing them implement [`Transport`] over their own stack.

mod body;
mod hyper;

use std::error::Error;
use std::fmt;

use bytes::Bytes;
use futures::future::BoxFuture;

pub use body::TransportBody;
pub use hyper::{HyperTransport, HyperTransportBuilder};

/// Boxed error type used across the transport seam.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Response body type produced by transports.
pub type ResponseBody = http_body_util::combinators::UnsyncBoxBody<Bytes, BoxError>;

/// A transport-level failure, carrying the cause chain the status mapper
/// walks.
#[derive(Debug)]
pub struct TransportError {
    message: String,
    source: Option<BoxError>,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        TransportError {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        TransportError {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{}: {}", self.message, source),
            None => f.write_str(&self.message),
        }
    }
}

impl Error for TransportError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source.as_deref().map(|err| err as _)
    }
}

/// A request/response transport capable of HTTP/2 semantics: streaming
/// bodies in both directions, trailers, and abort-on-drop.
pub trait Transport: Send + Sync + 'static {
    fn send(
        &self,
        request: http::Request<TransportBody>,
    ) -> BoxFuture<'static, Result<http::Response<ResponseBody>, TransportError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_display_includes_source() {
        let plain = TransportError::new("request failed");
        assert_eq!(plain.to_string(), "request failed");
        assert!(plain.source().is_none());

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let wrapped = TransportError::with_source("request failed", io);
        assert!(wrapped.to_string().contains("reset"));
        assert!(wrapped.source().is_some());
    }
}
