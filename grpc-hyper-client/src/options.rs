//! Per-call options.

use std::sync::Arc;
use std::time::SystemTime;

use grpc_hyper_core::Metadata;

use crate::cancellation::CancellationSignal;
use crate::credentials::CallCredentials;

/// Options for a single write on a request stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Suppress per-message compression for this write even when the call
    /// negotiated a compressed request encoding.
    pub no_compress: bool,
}

impl WriteOptions {
    pub fn new() -> Self {
        WriteOptions::default()
    }

    pub fn no_compress(mut self, no_compress: bool) -> Self {
        self.no_compress = no_compress;
        self
    }
}

/// Options for a single RPC.
///
/// # Example
///
/// ```
/// use std::time::{Duration, SystemTime};
/// use grpc_hyper_client::CallOptions;
///
/// let options = CallOptions::new()
///     .deadline(SystemTime::now() + Duration::from_secs(5))
///     .header("x-request-id", "abc-123");
/// ```
#[derive(Clone, Default)]
pub struct CallOptions {
    pub(crate) metadata: Metadata,
    /// Absolute deadline; `None` means never.
    pub(crate) deadline: Option<SystemTime>,
    pub(crate) cancellation: Option<CancellationSignal>,
    pub(crate) credentials: Option<Arc<dyn CallCredentials>>,
    pub(crate) write_options: WriteOptions,
    pub(crate) wait_for_ready: bool,
}

impl CallOptions {
    pub fn new() -> Self {
        CallOptions::default()
    }

    /// Replace the request metadata.
    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Append one ASCII metadata entry.
    ///
    /// Names beginning with `grpc-` are reserved for the protocol; the call
    /// engine filters `grpc-timeout` and translates
    /// `grpc-internal-encoding-request` instead of sending them verbatim.
    ///
    /// # Panics
    ///
    /// Panics if the name is not a valid header name. Use
    /// [`CallOptions::try_header`] for dynamically built names.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.add(name, value);
        self
    }

    /// Try to append one ASCII metadata entry.
    ///
    /// Returns `None` when the header name or value is invalid.
    pub fn try_header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Option<Self> {
        self.metadata.try_add(name, value)?;
        Some(self)
    }

    /// Set the absolute deadline for the call.
    pub fn deadline(mut self, deadline: SystemTime) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Attach an external cancellation signal.
    pub fn cancellation(mut self, signal: CancellationSignal) -> Self {
        self.cancellation = Some(signal);
        self
    }

    /// Attach per-call credentials, run before the request is sent when the
    /// transport is secure.
    pub fn credentials(mut self, credentials: Arc<dyn CallCredentials>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Default write options for the request stream.
    pub fn write_options(mut self, write_options: WriteOptions) -> Self {
        self.write_options = write_options;
        self
    }

    /// Ask the transport to wait for a usable connection instead of failing
    /// fast. Advisory: honored by transports that support it.
    pub fn wait_for_ready(mut self, wait_for_ready: bool) -> Self {
        self.wait_for_ready = wait_for_ready;
        self
    }

    pub fn get_metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn get_deadline(&self) -> Option<SystemTime> {
        self.deadline
    }

    pub fn get_write_options(&self) -> WriteOptions {
        self.write_options
    }
}

impl std::fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOptions")
            .field("metadata", &self.metadata)
            .field("deadline", &self.deadline)
            .field("has_cancellation", &self.cancellation.is_some())
            .field("has_credentials", &self.credentials.is_some())
            .field("write_options", &self.write_options)
            .field("wait_for_ready", &self.wait_for_ready)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn defaults() {
        let options = CallOptions::new();
        assert!(options.deadline.is_none());
        assert!(options.metadata.is_empty());
        assert!(!options.wait_for_ready);
        assert!(!options.write_options.no_compress);
    }

    #[test]
    fn try_header_accepts_valid_entries() {
        let options = CallOptions::new()
            .try_header("authorization", "Bearer token")
            .unwrap()
            .try_header("x-custom", "value")
            .unwrap();

        assert_eq!(options.metadata.get("authorization"), Some("Bearer token"));
        assert_eq!(options.metadata.get("x-custom"), Some("value"));
    }

    #[test]
    fn try_header_rejects_invalid_names() {
        assert!(CallOptions::new().try_header("invalid\0name", "value").is_none());
        assert!(CallOptions::new().try_header("x-ok", "line\nbreak").is_none());
    }

    #[test]
    fn builder_accumulates() {
        let deadline = SystemTime::now() + Duration::from_secs(1);
        let options = CallOptions::new()
            .deadline(deadline)
            .header("x-a", "1")
            .header("x-b", "2")
            .write_options(WriteOptions::new().no_compress(true))
            .wait_for_ready(true);

        assert_eq!(options.deadline, Some(deadline));
        assert_eq!(options.metadata.get("x-a"), Some("1"));
        assert_eq!(options.metadata.get("x-b"), Some("2"));
        assert!(options.write_options.no_compress);
        assert!(options.wait_for_ready);
    }
}
