//! Client-side call errors.

use std::error::Error;

use grpc_hyper_core::{Code, Status};

/// Error surfaced by call operations.
///
/// RPC failures carry a [`Status`]; local cancellation can be surfaced as
/// [`CallError::Cancelled`] when the channel is configured for cancellation
/// results; API misuse (overlapping reads, writing after completion,
/// trailers before completion) is an [`CallError::InvalidOperation`] and is
/// never conflated with an RPC status.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// The RPC finished with a non-OK status.
    #[error("{0}")]
    Rpc(Status),

    /// The call was cancelled locally and the channel is configured to
    /// surface cancellation rather than an RPC error.
    #[error("call cancelled")]
    Cancelled,

    /// The call surface was used incorrectly.
    #[error("{0}")]
    InvalidOperation(String),
}

impl CallError {
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        CallError::InvalidOperation(message.into())
    }

    /// The status carried by this error, if it is an RPC failure.
    pub fn status(&self) -> Option<&Status> {
        match self {
            CallError::Rpc(status) => Some(status),
            _ => None,
        }
    }

    /// The status code, treating local cancellation as [`Code::Cancelled`].
    pub fn code(&self) -> Option<Code> {
        match self {
            CallError::Rpc(status) => Some(status.code()),
            CallError::Cancelled => Some(Code::Cancelled),
            CallError::InvalidOperation(_) => None,
        }
    }
}

impl From<Status> for CallError {
    fn from(status: Status) -> Self {
        CallError::Rpc(status)
    }
}

/// Resolve a transport-layer error into a gRPC status by walking its source
/// chain.
///
/// HTTP/2 stream errors map by RST_STREAM reason, hyper-level cancellation
/// and keep-alive timeouts map to `Cancelled` and `Unavailable`, socket and
/// I/O failures map to `Unavailable`, and anything unrecognized is
/// `Internal`.
pub fn status_from_transport_error(err: &(dyn Error + 'static)) -> Status {
    let message = format!("Error starting gRPC call. {err}");
    let mut source: Option<&(dyn Error + 'static)> = Some(err);
    while let Some(current) = source {
        if let Some(h2_err) = current.downcast_ref::<h2::Error>() {
            return Status::new(code_for_h2_error(h2_err), message);
        }
        if let Some(hyper_err) = current.downcast_ref::<hyper::Error>() {
            if hyper_err.is_canceled() {
                return Status::cancelled(message);
            }
            // An expired keep-alive PING closes every call on the connection
            // with UNAVAILABLE per the gRPC spec.
            if hyper_err.is_timeout() {
                return Status::unavailable(message);
            }
        }
        if current.downcast_ref::<std::io::Error>().is_some() {
            return Status::unavailable(message);
        }
        source = current.source();
    }
    Status::internal(message)
}

fn code_for_h2_error(err: &h2::Error) -> Code {
    if err.is_io() {
        return Code::Unavailable;
    }
    match err.reason() {
        Some(h2::Reason::REFUSED_STREAM) => Code::Unavailable,
        Some(h2::Reason::CANCEL) => Code::Cancelled,
        Some(h2::Reason::ENHANCE_YOUR_CALM) => Code::ResourceExhausted,
        Some(h2::Reason::INADEQUATE_SECURITY) => Code::PermissionDenied,
        _ => Code::Internal,
    }
}
