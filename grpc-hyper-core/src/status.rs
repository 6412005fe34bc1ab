//! gRPC status codes and the [`Status`] type.
//!
//! A `Status` is the terminal result of an RPC: a [`Code`], an optional
//! message carried in the `grpc-message` header (percent-encoded on the
//! wire), the trailing metadata of the call, and an optional source error.

use std::borrow::Cow;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use http::HeaderMap;
use http::header::HeaderName;
use percent_encoding::{AsciiSet, CONTROLS, percent_decode, percent_encode};

use crate::metadata::Metadata;

/// Characters that must be percent-encoded in a `grpc-message` value.
const MESSAGE_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'?')
    .add(b'{')
    .add(b'}');

/// gRPC status codes.
///
/// These variants match the [gRPC status codes].
///
/// [gRPC status codes]: https://github.com/grpc/grpc/blob/master/doc/statuscodes.md
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Code {
    /// The operation completed successfully.
    Ok = 0,
    /// The operation was cancelled, typically by the caller.
    Cancelled = 1,
    /// Unknown error.
    Unknown = 2,
    /// Client specified an invalid argument.
    InvalidArgument = 3,
    /// Deadline expired before the operation could complete.
    DeadlineExceeded = 4,
    /// Some requested entity was not found.
    NotFound = 5,
    /// The entity that a client attempted to create already exists.
    AlreadyExists = 6,
    /// The caller does not have permission to execute the operation.
    PermissionDenied = 7,
    /// Some resource has been exhausted.
    ResourceExhausted = 8,
    /// The system is not in a state required for the operation's execution.
    FailedPrecondition = 9,
    /// The operation was aborted.
    Aborted = 10,
    /// The operation was attempted past the valid range.
    OutOfRange = 11,
    /// The operation is not implemented or not supported.
    Unimplemented = 12,
    /// Internal error.
    Internal = 13,
    /// The service is currently unavailable.
    Unavailable = 14,
    /// Unrecoverable data loss or corruption.
    DataLoss = 15,
    /// The request does not have valid authentication credentials.
    Unauthenticated = 16,
}

impl Code {
    /// The numeric wire value carried in the `grpc-status` header.
    pub fn value(&self) -> i32 {
        *self as i32
    }

    /// Parse a numeric wire value. Out-of-range values map to [`Code::Unknown`].
    pub fn from_value(value: i32) -> Code {
        match value {
            0 => Code::Ok,
            1 => Code::Cancelled,
            2 => Code::Unknown,
            3 => Code::InvalidArgument,
            4 => Code::DeadlineExceeded,
            5 => Code::NotFound,
            6 => Code::AlreadyExists,
            7 => Code::PermissionDenied,
            8 => Code::ResourceExhausted,
            9 => Code::FailedPrecondition,
            10 => Code::Aborted,
            11 => Code::OutOfRange,
            12 => Code::Unimplemented,
            13 => Code::Internal,
            14 => Code::Unavailable,
            15 => Code::DataLoss,
            16 => Code::Unauthenticated,
            _ => Code::Unknown,
        }
    }

    /// Canonical name of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Ok => "OK",
            Code::Cancelled => "Cancelled",
            Code::Unknown => "Unknown",
            Code::InvalidArgument => "InvalidArgument",
            Code::DeadlineExceeded => "DeadlineExceeded",
            Code::NotFound => "NotFound",
            Code::AlreadyExists => "AlreadyExists",
            Code::PermissionDenied => "PermissionDenied",
            Code::ResourceExhausted => "ResourceExhausted",
            Code::FailedPrecondition => "FailedPrecondition",
            Code::Aborted => "Aborted",
            Code::OutOfRange => "OutOfRange",
            Code::Unimplemented => "Unimplemented",
            Code::Internal => "Internal",
            Code::Unavailable => "Unavailable",
            Code::DataLoss => "DataLoss",
            Code::Unauthenticated => "Unauthenticated",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A gRPC status describing the result of an RPC call.
///
/// ```
/// use grpc_hyper_core::{Code, Status};
///
/// let status = Status::invalid_argument("name is invalid");
/// assert_eq!(status.code(), Code::InvalidArgument);
/// ```
#[derive(Clone)]
pub struct Status(Box<StatusInner>);

// Boxed so that Result<T, Status> stays a pointer wide on the error side.
#[derive(Clone)]
struct StatusInner {
    code: Code,
    message: String,
    trailers: Metadata,
    source: Option<Arc<dyn Error + Send + Sync + 'static>>,
}

impl Status {
    /// Header carrying the numeric status code.
    pub const GRPC_STATUS: HeaderName = HeaderName::from_static("grpc-status");
    /// Header carrying the percent-encoded status message.
    pub const GRPC_MESSAGE: HeaderName = HeaderName::from_static("grpc-message");

    /// Create a new `Status` with the given code and message.
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Status(Box::new(StatusInner {
            code,
            message: message.into(),
            trailers: Metadata::new(),
            source: None,
        }))
    }

    pub fn ok() -> Self {
        Status::new(Code::Ok, "")
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Status::new(Code::Cancelled, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Status::new(Code::Unknown, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Status::new(Code::InvalidArgument, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Status::new(Code::DeadlineExceeded, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Status::new(Code::PermissionDenied, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Status::new(Code::ResourceExhausted, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Status::new(Code::Unimplemented, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Status::new(Code::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Status::new(Code::Unavailable, message)
    }

    /// The status code.
    pub fn code(&self) -> Code {
        self.0.code
    }

    /// The status message. Empty when the server sent none.
    pub fn message(&self) -> &str {
        &self.0.message
    }

    /// The trailing metadata attached to this status.
    pub fn trailers(&self) -> &Metadata {
        &self.0.trailers
    }

    /// Attach trailing metadata.
    pub fn with_trailers(mut self, trailers: Metadata) -> Self {
        self.0.trailers = trailers;
        self
    }

    /// Attach an underlying error.
    pub fn with_source(mut self, source: Arc<dyn Error + Send + Sync + 'static>) -> Self {
        self.0.source = Some(source);
        self
    }

    /// Extract a `Status` from a header or trailer map.
    ///
    /// Returns `None` when no `grpc-status` header is present. An unparsable
    /// code value yields a `Cancelled` status describing the failure, which
    /// keeps a malformed server from wedging status retrieval.
    pub fn from_headers(headers: &HeaderMap) -> Option<Status> {
        let raw = headers.get(&Self::GRPC_STATUS)?;
        let code = match std::str::from_utf8(raw.as_bytes())
            .ok()
            .and_then(|s| s.parse::<i32>().ok())
        {
            Some(value) => Code::from_value(value),
            None => {
                return Some(Status::cancelled(format!(
                    "Unexpected grpc-status value: {:?}",
                    String::from_utf8_lossy(raw.as_bytes())
                )));
            }
        };

        let message = match headers.get(&Self::GRPC_MESSAGE) {
            Some(value) => match percent_decode(value.as_bytes()).decode_utf8() {
                Ok(decoded) => decoded.into_owned(),
                Err(err) => {
                    tracing::warn!("error decoding grpc-message header: {err}");
                    String::new()
                }
            },
            None => String::new(),
        };

        Some(Status::new(code, message))
    }

    /// Percent-encode a status message for the `grpc-message` header.
    pub fn encode_message(message: &str) -> Cow<'_, str> {
        Cow::from(percent_encode(message.as_bytes(), MESSAGE_ENCODE_SET))
    }

    /// The underlying error, when this status wraps one.
    pub fn source_err(&self) -> Option<&(dyn Error + Send + Sync + 'static)> {
        self.0.source.as_deref()
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("Status");
        builder.field("code", &self.0.code);
        if !self.0.message.is_empty() {
            builder.field("message", &self.0.message);
        }
        if !self.0.trailers.is_empty() {
            builder.field("trailers", &self.0.trailers);
        }
        if let Some(source) = &self.0.source {
            builder.field("source", source);
        }
        builder.finish()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status: {}", self.code())?;
        if !self.message().is_empty() {
            write!(f, ", message: {:?}", self.message())?;
        }
        Ok(())
    }
}

impl Error for Status {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.0.source.as_ref().map(|err| (&**err) as _)
    }
}

impl PartialEq for Status {
    fn eq(&self, other: &Self) -> bool {
        self.0.code == other.0.code && self.0.message == other.0.message
    }
}
