//! The channel: shared configuration and per-call bookkeeping.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime};

use http::header::HeaderValue;
use http::Uri;

use grpc_hyper_core::compression::CompressionProviders;
use grpc_hyper_core::marshal::BufferPool;
use grpc_hyper_core::Status;

use crate::call::CallContext;
use crate::credentials::CallCredentials;
use crate::invoker::CallInvoker;
use crate::method::Method;
use crate::retry::{MethodConfig, RetryThrottle};
use crate::transport::{HyperTransport, Transport};

/// Default limit on received message payloads (4 MiB). Sends are unlimited
/// by default.
pub const DEFAULT_MAX_RECEIVE_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Ceiling applied to per-method retry and hedging attempt counts.
pub const DEFAULT_MAX_RETRY_ATTEMPTS_LIMIT: u32 = 5;

/// Past this many distinct methods the info cache switches from a linear
/// scan to a hash map.
const METHOD_CACHE_UPGRADE_THRESHOLD: usize = 10;

/// Time source for deadlines, injectable for tests.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> SystemTime;
}

/// The wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Errors produced while building or using a channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("invalid channel address: {0}")]
    InvalidAddress(String),
    #[error("invalid channel configuration: {0}")]
    InvalidConfiguration(String),
}

/// Per-method state cached on first use.
#[derive(Debug)]
pub(crate) struct MethodInfo {
    pub uri: Uri,
    pub full_name: String,
    pub service_name: String,
    pub method_name: String,
    pub method_config: Option<MethodConfig>,
}

// Most processes call a handful of methods; a short array beats allocating
// a map until the surface grows past the threshold.
enum MethodCache {
    Array(Vec<(String, Arc<MethodInfo>)>),
    Map(HashMap<String, Arc<MethodInfo>>),
}

impl MethodCache {
    fn get(&self, full_name: &str) -> Option<Arc<MethodInfo>> {
        match self {
            MethodCache::Array(entries) => entries
                .iter()
                .find(|(name, _)| name == full_name)
                .map(|(_, info)| Arc::clone(info)),
            MethodCache::Map(entries) => entries.get(full_name).cloned(),
        }
    }

    fn insert(&mut self, full_name: String, info: Arc<MethodInfo>) {
        match self {
            MethodCache::Array(entries) => {
                entries.push((full_name, info));
                if entries.len() > METHOD_CACHE_UPGRADE_THRESHOLD {
                    let map = std::mem::take(entries).into_iter().collect();
                    *self = MethodCache::Map(map);
                }
            }
            MethodCache::Map(entries) => {
                entries.insert(full_name, info);
            }
        }
    }
}

struct ChannelInner {
    base_uri: Uri,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    buffer_pool: Arc<BufferPool>,
    max_send_message_size: Option<usize>,
    max_receive_message_size: Option<usize>,
    compression_providers: CompressionProviders,
    call_credentials: Vec<Arc<dyn CallCredentials>>,
    user_agent: HeaderValue,
    use_cancellation_errors: bool,
    disable_client_deadline: bool,
    max_timer_due: Duration,
    retry_enabled: bool,
    max_retry_attempts_limit: u32,
    retry_throttle: Option<Arc<RetryThrottle>>,
    method_configs: Vec<MethodConfig>,
    method_infos: Mutex<MethodCache>,
    active_calls: Mutex<HashMap<u64, Weak<CallContext>>>,
    next_call_id: AtomicU64,
    disposed: AtomicBool,
}

/// A client channel: the shared half of every call made against one
/// address. Cheap to clone.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Start building a channel for the given base address.
    pub fn builder(address: impl Into<String>) -> ChannelBuilder {
        ChannelBuilder::new(address)
    }

    /// A call invoker bound to this channel.
    pub fn invoker(&self) -> CallInvoker {
        CallInvoker::new(self.clone())
    }

    /// Whether the base address uses a secure scheme.
    pub fn is_secure(&self) -> bool {
        self.inner.base_uri.scheme_str() == Some("https")
    }

    pub fn base_uri(&self) -> &Uri {
        &self.inner.base_uri
    }

    /// Mark the channel disposed: future calls fail, active calls are
    /// cancelled.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let active: Vec<Weak<CallContext>> = {
            let mut calls = self
                .inner
                .active_calls
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            calls.drain().map(|(_, weak)| weak).collect()
        };
        for weak in active {
            if let Some(context) = weak.upgrade() {
                context.cancel_with_status(Status::cancelled("gRPC call disposed."));
            }
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Number of calls currently registered, for diagnostics.
    pub fn active_call_count(&self) -> usize {
        self.inner
            .active_calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub(crate) fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.inner.buffer_pool
    }

    pub(crate) fn max_send_message_size(&self) -> Option<usize> {
        self.inner.max_send_message_size
    }

    pub(crate) fn max_receive_message_size(&self) -> Option<usize> {
        self.inner.max_receive_message_size
    }

    pub(crate) fn compression_providers(&self) -> &CompressionProviders {
        &self.inner.compression_providers
    }

    pub(crate) fn call_credentials(&self) -> &[Arc<dyn CallCredentials>] {
        &self.inner.call_credentials
    }

    pub(crate) fn user_agent(&self) -> &HeaderValue {
        &self.inner.user_agent
    }

    pub(crate) fn use_cancellation_errors(&self) -> bool {
        self.inner.use_cancellation_errors
    }

    pub(crate) fn disable_client_deadline(&self) -> bool {
        self.inner.disable_client_deadline
    }

    pub(crate) fn max_timer_due(&self) -> Duration {
        self.inner.max_timer_due
    }

    pub(crate) fn retry_enabled(&self) -> bool {
        self.inner.retry_enabled
    }

    pub(crate) fn max_retry_attempts_limit(&self) -> u32 {
        self.inner.max_retry_attempts_limit
    }

    pub(crate) fn retry_throttle(&self) -> Option<&Arc<RetryThrottle>> {
        self.inner.retry_throttle.as_ref()
    }

    /// Fetch or lazily create the cached info for a method.
    pub(crate) fn get_method_info<Req, Res>(
        &self,
        method: &Method<Req, Res>,
    ) -> Result<Arc<MethodInfo>, ChannelError> {
        {
            let cache = self
                .inner
                .method_infos
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(info) = cache.get(method.full_name()) {
                return Ok(info);
            }
        }

        let uri = self.build_call_uri(&method.path())?;
        let info = Arc::new(MethodInfo {
            uri,
            full_name: method.full_name().to_owned(),
            service_name: method.service_name().to_owned(),
            method_name: method.method_name().to_owned(),
            method_config: self.resolve_method_config(method.service_name(), method.method_name()),
        });

        let mut cache = self
            .inner
            .method_infos
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        // Recheck under the construction lock; first writer wins.
        if let Some(existing) = cache.get(method.full_name()) {
            return Ok(existing);
        }
        cache.insert(method.full_name().to_owned(), Arc::clone(&info));
        Ok(info)
    }

    fn build_call_uri(&self, path: &str) -> Result<Uri, ChannelError> {
        let base = &self.inner.base_uri;
        Uri::builder()
            .scheme(base.scheme_str().unwrap_or("http"))
            .authority(
                base.authority()
                    .map(|a| a.as_str())
                    .unwrap_or_default(),
            )
            .path_and_query(path)
            .build()
            .map_err(|err| ChannelError::InvalidAddress(err.to_string()))
    }

    fn resolve_method_config(&self, service: &str, method: &str) -> Option<MethodConfig> {
        let configs = &self.inner.method_configs;
        configs
            .iter()
            .find(|config| config.matches_method(service, method))
            .or_else(|| configs.iter().find(|config| config.matches_service(service)))
            .or_else(|| configs.iter().find(|config| config.is_catch_all()))
            .cloned()
    }

    pub(crate) fn register_call(&self, context: &Arc<CallContext>) -> u64 {
        let id = self.inner.next_call_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .active_calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::downgrade(context));
        id
    }

    pub(crate) fn unregister_call(&self, id: u64) {
        self.inner
            .active_calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("base_uri", &self.inner.base_uri)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Channel`].
pub struct ChannelBuilder {
    address: String,
    transport: Option<Arc<dyn Transport>>,
    clock: Arc<dyn Clock>,
    max_send_message_size: Option<usize>,
    max_receive_message_size: Option<usize>,
    compression_providers: CompressionProviders,
    call_credentials: Vec<Arc<dyn CallCredentials>>,
    user_agent: Option<HeaderValue>,
    use_cancellation_errors: bool,
    disable_client_deadline: bool,
    max_timer_due: Duration,
    retry_enabled: bool,
    max_retry_attempts_limit: u32,
    retry_throttle: Option<Arc<RetryThrottle>>,
    method_configs: Vec<MethodConfig>,
}

impl ChannelBuilder {
    pub fn new(address: impl Into<String>) -> Self {
        ChannelBuilder {
            address: address.into(),
            transport: None,
            clock: Arc::new(SystemClock),
            max_send_message_size: None,
            max_receive_message_size: Some(DEFAULT_MAX_RECEIVE_MESSAGE_SIZE),
            compression_providers: CompressionProviders::default(),
            call_credentials: Vec::new(),
            user_agent: None,
            use_cancellation_errors: false,
            disable_client_deadline: false,
            max_timer_due: Duration::from_millis(u32::MAX as u64),
            retry_enabled: true,
            max_retry_attempts_limit: DEFAULT_MAX_RETRY_ATTEMPTS_LIMIT,
            retry_throttle: None,
            method_configs: Vec::new(),
        }
    }

    pub fn transport(mut self, transport: impl Transport) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn max_send_message_size(mut self, limit: usize) -> Self {
        self.max_send_message_size = Some(limit);
        self
    }

    pub fn max_receive_message_size(mut self, limit: usize) -> Self {
        self.max_receive_message_size = Some(limit);
        self
    }

    /// Remove the receive-size limit.
    pub fn unlimited_receive_message_size(mut self) -> Self {
        self.max_receive_message_size = None;
        self
    }

    pub fn compression_providers(mut self, providers: CompressionProviders) -> Self {
        self.compression_providers = providers;
        self
    }

    /// Append a channel-level credential source. Composite credentials are
    /// expressed by calling this repeatedly; sources run in registration
    /// order.
    pub fn call_credentials(mut self, credentials: impl CallCredentials) -> Self {
        self.call_credentials.push(Arc::new(credentials));
        self
    }

    /// Surface local cancellation and deadline expiry as
    /// [`CallError::Cancelled`](crate::CallError::Cancelled) instead of an
    /// RPC status error.
    pub fn use_cancellation_errors(mut self, enabled: bool) -> Self {
        self.use_cancellation_errors = enabled;
        self
    }

    /// Disable the client-side deadline timer. The `grpc-timeout` header is
    /// still sent; only the server enforces the deadline.
    pub fn disable_client_deadline(mut self, disabled: bool) -> Self {
        self.disable_client_deadline = disabled;
        self
    }

    /// Upper bound on a single timer sleep; longer deadlines reschedule.
    pub fn max_timer_due(mut self, max: Duration) -> Self {
        self.max_timer_due = max;
        self
    }

    /// Disable retry and hedging policies for this channel.
    pub fn disable_retries(mut self) -> Self {
        self.retry_enabled = false;
        self
    }

    /// Cap per-method `max_attempts` values.
    pub fn max_retry_attempts_limit(mut self, limit: u32) -> Self {
        self.max_retry_attempts_limit = limit;
        self
    }

    /// Enable the channel-wide retry throttling token bucket.
    pub fn retry_throttling(mut self, throttle: RetryThrottle) -> Self {
        self.retry_throttle = Some(Arc::new(throttle));
        self
    }

    /// Register a method config carrying a retry or hedging policy.
    pub fn method_config(mut self, config: MethodConfig) -> Self {
        self.method_configs.push(config);
        self
    }

    pub fn user_agent(mut self, user_agent: HeaderValue) -> Self {
        self.user_agent = Some(user_agent);
        self
    }

    pub fn build(self) -> Result<Channel, ChannelError> {
        let base_uri: Uri = self
            .address
            .parse()
            .map_err(|err| ChannelError::InvalidAddress(format!("{}: {err}", self.address)))?;
        match base_uri.scheme_str() {
            Some("http") | Some("https") => {}
            other => {
                return Err(ChannelError::InvalidAddress(format!(
                    "unsupported scheme {other:?}, expected http or https"
                )));
            }
        }
        if base_uri.authority().is_none() {
            return Err(ChannelError::InvalidAddress(
                "address is missing an authority".to_owned(),
            ));
        }

        let user_agent = match self.user_agent {
            Some(user_agent) => user_agent,
            None => default_user_agent()?,
        };

        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(HyperTransport::new()));

        Ok(Channel {
            inner: Arc::new(ChannelInner {
                base_uri,
                transport,
                clock: self.clock,
                buffer_pool: BufferPool::new(),
                max_send_message_size: self.max_send_message_size,
                max_receive_message_size: self.max_receive_message_size,
                compression_providers: self.compression_providers,
                call_credentials: self.call_credentials,
                user_agent,
                use_cancellation_errors: self.use_cancellation_errors,
                disable_client_deadline: self.disable_client_deadline,
                max_timer_due: self.max_timer_due,
                retry_enabled: self.retry_enabled,
                max_retry_attempts_limit: self.max_retry_attempts_limit,
                retry_throttle: self.retry_throttle,
                method_configs: self.method_configs,
                method_infos: Mutex::new(MethodCache::Array(Vec::new())),
                active_calls: Mutex::new(HashMap::new()),
                next_call_id: AtomicU64::new(1),
                disposed: AtomicBool::new(false),
            }),
        })
    }
}

/// `grpc-<impl>/<version> (<runtime info>)`, built once per channel.
fn default_user_agent() -> Result<HeaderValue, ChannelError> {
    let value = format!(
        "grpc-hyper/{} (rust; {}; {})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH,
    );
    HeaderValue::try_from(value)
        .map_err(|err| ChannelError::InvalidConfiguration(format!("invalid user-agent: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use grpc_hyper_core::Marshaller;

    use crate::method::MethodType;

    fn test_channel() -> Channel {
        Channel::builder("http://localhost:50051").build().unwrap()
    }

    fn bytes_method(service: &str, name: &str) -> Method<Bytes, Bytes> {
        Method::new(
            MethodType::Unary,
            service,
            name,
            Marshaller::bytes(),
            Marshaller::bytes(),
        )
    }

    #[test]
    fn builder_rejects_bad_addresses() {
        assert!(Channel::builder("not a uri").build().is_err());
        assert!(Channel::builder("ftp://example.com").build().is_err());
        assert!(Channel::builder("http://").build().is_err());
        assert!(Channel::builder("https://example.com").build().is_ok());
    }

    #[test]
    fn secure_follows_scheme() {
        assert!(!test_channel().is_secure());
        assert!(
            Channel::builder("https://example.com")
                .build()
                .unwrap()
                .is_secure()
        );
    }

    #[test]
    fn user_agent_has_grpc_shape() {
        let channel = test_channel();
        let agent = channel.user_agent().to_str().unwrap();
        assert!(agent.starts_with("grpc-hyper/"), "{agent}");
        assert!(agent.contains('('), "{agent}");
    }

    #[test]
    fn method_info_builds_call_uri() {
        let channel = test_channel();
        let method = bytes_method("greet.Greeter", "SayHello");
        let info = channel.get_method_info(&method).unwrap();
        assert_eq!(
            info.uri.to_string(),
            "http://localhost:50051/greet.Greeter/SayHello"
        );
        assert_eq!(info.full_name, "greet.Greeter/SayHello");
    }

    #[test]
    fn method_info_is_cached_and_shared() {
        let channel = test_channel();
        let method = bytes_method("svc", "A");
        let first = channel.get_method_info(&method).unwrap();
        let second = channel.get_method_info(&method).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn method_cache_upgrades_past_threshold() {
        let channel = test_channel();
        for i in 0..20 {
            let method = bytes_method("svc", &format!("Method{i}"));
            channel.get_method_info(&method).unwrap();
        }
        // Entries created before the upgrade are still served.
        let method = bytes_method("svc", "Method0");
        let info = channel.get_method_info(&method).unwrap();
        assert_eq!(info.method_name, "Method0");
    }

    #[test]
    fn dispose_is_idempotent() {
        let channel = test_channel();
        assert!(!channel.is_disposed());
        channel.dispose();
        channel.dispose();
        assert!(channel.is_disposed());
    }
}
