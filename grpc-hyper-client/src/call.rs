//! The per-attempt call state machine.
//!
//! A call moves through `Created -> Started -> (HeadersReceived) ->
//! ResponseFinished -> Cleaned`, with cancellation reachable from any state
//! before cleanup. [`CallContext`] holds the non-generic state every
//! collaborator shares: the latches (final status, response headers), the
//! cancellation flag, trailers, the deadline timer, and channel
//! registration. [`GrpcCall`] adds the typed surface: marshallers, the
//! response future and the stream handoff.
//!
//! The run loop is a spawned task. It owns the HTTP exchange end to end and
//! resolves every outcome into a final [`Status`] committed exactly once;
//! waiters observe the status latch before any dependent future errors out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::SystemTime;

use bytes::Bytes;
use http::header::HeaderValue;
use tokio::sync::{oneshot, watch};
use tracing::Instrument;

use grpc_hyper_core::marshal::DeserializationContext;
use grpc_hyper_core::metadata::Metadata;
use grpc_hyper_core::protocol::{
    GRPC_ACCEPT_ENCODING, GRPC_CONTENT_TYPE_VALUE, GRPC_ENCODING, GRPC_INTERNAL_ENCODING_REQUEST,
    GRPC_PREVIOUS_RPC_ATTEMPTS, GRPC_TIMEOUT, ResponseValidation, TE_TRAILERS,
    validate_response_headers,
};
use grpc_hyper_core::timeout::encode_timeout;
use grpc_hyper_core::{Code, Status};

use crate::channel::{Channel, MethodInfo};
use crate::credentials::auth_context;
use crate::error::{CallError, status_from_transport_error};
use crate::frame::{FrameReader, encode_message};
use crate::method::Method;
use crate::options::CallOptions;
use crate::retry::{self, Pushback};
use crate::transport::{ResponseBody, TransportBody};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallLifecycle {
    Created,
    Started,
    HeadersReceived,
    ResponseFinished,
    Cleaned,
}

/// How the request body of an attempt is produced.
pub(crate) enum RequestSource<Req> {
    /// A single message, serialized by the run loop.
    Message(Req),
    /// A pre-encoded frame, reused across retry attempts.
    Frame(Bytes),
    /// A streaming body fed by a stream writer.
    Body(TransportBody),
}

/// Handed from the run loop to the stream reader once response headers are
/// validated.
pub(crate) struct StreamHandoff {
    pub body: ResponseBody,
    pub grpc_encoding: Option<String>,
}

/// Explicit cancellation variant so control flow never round-trips through
/// a synthetic error.
enum RunError {
    Cancelled,
    Status(Status),
}

impl From<Status> for RunError {
    fn from(status: Status) -> Self {
        RunError::Status(status)
    }
}

struct TimerState {
    disposed: bool,
}

/// Shared, non-generic per-call state.
pub(crate) struct CallContext {
    channel: Channel,
    info: Arc<MethodInfo>,
    options: CallOptions,
    attempt: u32,
    deadline: Option<SystemTime>,
    request_encoding: Option<String>,
    call_id: OnceLock<u64>,
    lifecycle: Mutex<CallLifecycle>,
    status_tx: watch::Sender<Option<Status>>,
    headers_tx: watch::Sender<Option<Result<Metadata, Status>>>,
    cancel_tx: watch::Sender<bool>,
    trailers: Mutex<Option<Metadata>>,
    pushback: Mutex<Option<Pushback>>,
    timer: Mutex<TimerState>,
    cleaned: AtomicBool,
}

impl CallContext {
    pub(crate) fn new(
        channel: Channel,
        info: Arc<MethodInfo>,
        options: CallOptions,
        attempt: u32,
    ) -> Arc<Self> {
        let request_encoding = options
            .metadata
            .get(GRPC_INTERNAL_ENCODING_REQUEST)
            .map(str::to_owned);
        let deadline = options.deadline;
        let context = Arc::new(CallContext {
            channel,
            info,
            options,
            attempt,
            deadline,
            request_encoding,
            call_id: OnceLock::new(),
            lifecycle: Mutex::new(CallLifecycle::Created),
            status_tx: watch::Sender::new(None),
            headers_tx: watch::Sender::new(None),
            cancel_tx: watch::Sender::new(false),
            trailers: Mutex::new(None),
            pushback: Mutex::new(None),
            timer: Mutex::new(TimerState { disposed: false }),
            cleaned: AtomicBool::new(false),
        });
        let id = context.channel.register_call(&context);
        let _ = context.call_id.set(id);
        context
    }

    pub(crate) fn channel(&self) -> &Channel {
        &self.channel
    }

    pub(crate) fn info(&self) -> &Arc<MethodInfo> {
        &self.info
    }

    pub(crate) fn options(&self) -> &CallOptions {
        &self.options
    }

    pub(crate) fn attempt(&self) -> u32 {
        self.attempt
    }

    pub(crate) fn request_encoding(&self) -> Option<&str> {
        self.request_encoding.as_deref()
    }

    pub(crate) fn deadline(&self) -> Option<SystemTime> {
        self.deadline
    }

    pub(crate) fn final_status(&self) -> Option<Status> {
        self.status_tx.borrow().clone()
    }

    pub(crate) fn response_finished(&self) -> bool {
        self.status_tx.borrow().is_some()
    }

    pub(crate) fn is_cancellation_requested(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Resolves when cancellation is requested.
    pub(crate) async fn cancelled(&self) {
        let mut rx = self.cancel_tx.subscribe();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Resolves with the final status once it commits.
    pub(crate) async fn wait_status(&self) -> Status {
        let mut rx = self.status_tx.subscribe();
        match rx.wait_for(|status| status.is_some()).await {
            Ok(value) => value.clone().unwrap_or_else(Status::ok),
            Err(_) => Status::cancelled("Call canceled by the client."),
        }
    }

    /// Resolves once the response headers latch is set.
    pub(crate) async fn wait_headers(&self) -> Result<Metadata, Status> {
        let mut rx = self.headers_tx.subscribe();
        match rx.wait_for(|headers| headers.is_some()).await {
            Ok(value) => value
                .clone()
                .unwrap_or_else(|| Err(Status::cancelled("Call canceled by the client."))),
            Err(_) => Err(Status::cancelled("Call canceled by the client.")),
        }
    }

    pub(crate) fn headers_snapshot(&self) -> Option<Result<Metadata, Status>> {
        self.headers_tx.borrow().clone()
    }

    /// Commit the final status. Returns false if a status was already
    /// committed; the first commit is the call's observable result.
    pub(crate) fn try_commit_status(&self, status: Status) -> bool {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        if self.status_tx.borrow().is_some() {
            return false;
        }
        self.status_tx.send_replace(Some(status));
        if !matches!(*lifecycle, CallLifecycle::Cleaned) {
            *lifecycle = CallLifecycle::ResponseFinished;
        }
        true
    }

    /// Cancel the call: commit a terminal status (unless one exists),
    /// signal every subordinate task, and release latch waiters.
    /// Idempotent.
    pub(crate) fn cancel_with_status(&self, status: Status) {
        let status = self.resolve_terminal_status(status);
        self.try_commit_status(status);
        self.cancel_tx.send_replace(true);
        self.fail_unresolved_latches();
    }

    /// A local `Cancelled` result is rewritten to `DeadlineExceeded` when
    /// the clock shows the deadline actually passed.
    pub(crate) fn resolve_terminal_status(&self, status: Status) -> Status {
        if status.code() == Code::Cancelled {
            if let Some(deadline) = self.deadline {
                if self.channel.clock().now() >= deadline {
                    return Status::deadline_exceeded("");
                }
            }
        }
        status
    }

    pub(crate) fn publish_headers(&self, result: Result<Metadata, Status>) {
        let mut value = Some(result);
        self.headers_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = value.take();
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn mark_headers_received(&self) {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(*lifecycle, CallLifecycle::Started) {
            *lifecycle = CallLifecycle::HeadersReceived;
        }
    }

    pub(crate) fn mark_started(&self) {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(*lifecycle, CallLifecycle::Created) {
            *lifecycle = CallLifecycle::Started;
        }
    }

    pub(crate) fn set_trailers(&self, trailers: Metadata) {
        let mut slot = self.trailers.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(trailers);
        }
    }

    pub(crate) fn set_pushback(&self, pushback: Pushback) {
        let mut slot = self.pushback.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(pushback);
    }

    pub(crate) fn take_pushback(&self) -> Option<Pushback> {
        self.pushback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// `get_status`: fails until the call is complete.
    pub(crate) fn get_status(&self) -> Result<Status, CallError> {
        self.final_status().ok_or_else(|| {
            CallError::invalid_operation("Unable to get the status because the call is not complete.")
        })
    }

    /// `get_trailers`: fails until the call is complete.
    pub(crate) fn get_trailers(&self) -> Result<Metadata, CallError> {
        if !self.response_finished() {
            return Err(CallError::invalid_operation(
                "Can't get the call trailers because the call has not completed successfully.",
            ));
        }
        let slot = self.trailers.lock().unwrap_or_else(|e| e.into_inner());
        Ok(slot.clone().unwrap_or_default())
    }

    /// Map a terminal status to the error a waiter observes.
    pub(crate) fn error_from_status(&self, status: &Status) -> CallError {
        match status.code() {
            Code::Cancelled | Code::DeadlineExceeded if self.channel.use_cancellation_errors() => {
                CallError::Cancelled
            }
            _ => CallError::Rpc(status.clone()),
        }
    }

    fn fail_unresolved_latches(&self) {
        if let Some(status) = self.final_status() {
            if status.code() == Code::Ok {
                self.publish_headers(Ok(Metadata::new()));
            } else {
                self.publish_headers(Err(status));
            }
        }
    }

    /// Exactly-once teardown. Commits the status when the response never
    /// finished, releases latch waiters, disposes the deadline timer under
    /// its lock and unregisters from the channel. The cancellation flag is
    /// left in place so late waiters still observe it.
    pub(crate) fn finish_cleanup(&self, final_status: Status) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        if !self.response_finished() {
            let status = self.resolve_terminal_status(final_status);
            self.try_commit_status(status);
            self.cancel_tx.send_replace(true);
        }
        self.fail_unresolved_latches();
        {
            let mut timer = self.timer.lock().unwrap_or_else(|e| e.into_inner());
            timer.disposed = true;
        }
        if let Some(id) = self.call_id.get() {
            self.channel.unregister_call(*id);
        }
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        *lifecycle = CallLifecycle::Cleaned;
    }

    /// Schedule the deadline timer. Sleeps are bounded by the channel's
    /// `max_timer_due`; a longer deadline reschedules until it is actually
    /// due. Must run after the stream writer and reader exist so firing
    /// cannot cancel them mid-construction.
    pub(crate) fn start_deadline_timer(self: &Arc<Self>) {
        let Some(deadline) = self.deadline else {
            return;
        };
        if self.channel.disable_client_deadline() {
            return;
        }
        let weak = Arc::downgrade(self);
        let max_due = self.channel.max_timer_due();
        tokio::spawn(async move {
            loop {
                let Some(context) = weak.upgrade() else {
                    return;
                };
                let now = context.channel.clock().now();
                let remaining = deadline
                    .duration_since(now)
                    .unwrap_or_default();
                let sleep_for = remaining.min(max_due);
                drop(context);
                tokio::time::sleep(sleep_for).await;

                let Some(context) = weak.upgrade() else {
                    return;
                };
                {
                    let timer = context.timer.lock().unwrap_or_else(|e| e.into_inner());
                    if timer.disposed {
                        return;
                    }
                }
                if context.response_finished() || context.is_cancellation_requested() {
                    return;
                }
                if context.channel.clock().now() >= deadline {
                    tracing::debug!(
                        method = %context.info.full_name,
                        "deadline exceeded, canceling call"
                    );
                    context.cancel_with_status(Status::deadline_exceeded(""));
                    return;
                }
                // Bounded due time: fall through and reschedule.
            }
        });
    }

    /// Hook the external cancellation signal up to the call. Registered
    /// after the writer exists so a cancellation also releases pending
    /// writes.
    pub(crate) fn register_external_cancellation(self: &Arc<Self>) {
        let Some(signal) = self.options.cancellation.clone() else {
            return;
        };
        let weak = Arc::downgrade(self);
        let mut status_rx = self.status_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = signal.cancelled() => {
                    if let Some(context) = weak.upgrade() {
                        context.cancel_with_status(Status::cancelled("Call canceled by the client."));
                    }
                }
                _ = status_rx.wait_for(|status| status.is_some()) => {}
            }
        });
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("method", &self.info.full_name)
            .field("attempt", &self.attempt)
            .field("finished", &self.response_finished())
            .finish_non_exhaustive()
    }
}

/// One typed call attempt.
pub(crate) struct GrpcCall<Req, Res> {
    context: Arc<CallContext>,
    method: Arc<Method<Req, Res>>,
    response_tx: Option<oneshot::Sender<Result<Res, CallError>>>,
    response_rx: Option<oneshot::Receiver<Result<Res, CallError>>>,
    handoff_tx: Option<oneshot::Sender<StreamHandoff>>,
    handoff_rx: Option<oneshot::Receiver<StreamHandoff>>,
}

impl<Req, Res> GrpcCall<Req, Res>
where
    Req: Send + 'static,
    Res: Send + 'static,
{
    pub(crate) fn new(
        channel: Channel,
        info: Arc<MethodInfo>,
        method: Arc<Method<Req, Res>>,
        options: CallOptions,
        attempt: u32,
    ) -> Self {
        let context = CallContext::new(channel, info, options, attempt);
        let (response_tx, response_rx) = if method.method_type().has_response_stream() {
            (None, None)
        } else {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        };
        let (handoff_tx, handoff_rx) = if method.method_type().has_response_stream() {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        GrpcCall {
            context,
            method,
            response_tx,
            response_rx,
            handoff_tx,
            handoff_rx,
        }
    }

    pub(crate) fn context(&self) -> &Arc<CallContext> {
        &self.context
    }

    pub(crate) fn take_response_rx(
        &mut self,
    ) -> Option<oneshot::Receiver<Result<Res, CallError>>> {
        self.response_rx.take()
    }

    pub(crate) fn take_handoff_rx(&mut self) -> Option<oneshot::Receiver<StreamHandoff>> {
        self.handoff_rx.take()
    }

    /// Start the attempt: transition the lifecycle, schedule the deadline
    /// timer, register external cancellation and spawn the run loop. The
    /// caller constructs any stream writer and reader before this point.
    pub(crate) fn start(&mut self, source: RequestSource<Req>) {
        self.context.mark_started();
        self.context.start_deadline_timer();
        self.context.register_external_cancellation();

        let context = Arc::clone(&self.context);
        let method = Arc::clone(&self.method);
        let response_tx = self.response_tx.take();
        let handoff_tx = self.handoff_tx.take();
        tokio::spawn(run_call(context, method, source, response_tx, handoff_tx));
    }
}

/// Await a response future, falling back to the committed status when the
/// run loop dropped the sender.
pub(crate) async fn await_response<Res>(
    context: &Arc<CallContext>,
    rx: oneshot::Receiver<Result<Res, CallError>>,
) -> Result<Res, CallError> {
    match rx.await {
        Ok(result) => result,
        Err(_) => {
            let status = context.wait_status().await;
            Err(context.error_from_status(&status))
        }
    }
}

async fn run_call<Req, Res>(
    context: Arc<CallContext>,
    method: Arc<Method<Req, Res>>,
    source: RequestSource<Req>,
    mut response_tx: Option<oneshot::Sender<Result<Res, CallError>>>,
    handoff_tx: Option<oneshot::Sender<StreamHandoff>>,
) where
    Req: Send + 'static,
    Res: Send + 'static,
{
    let span = tracing::info_span!(
        "grpc_call",
        method = %context.info().full_name,
        attempt = context.attempt(),
    );
    let outcome = run_call_core(&context, &method, source, &mut response_tx, handoff_tx)
        .instrument(span.clone())
        .await;

    let final_status = match outcome {
        Ok(()) => context.final_status().unwrap_or_else(Status::ok),
        Err(RunError::Cancelled) => context
            .final_status()
            .unwrap_or_else(|| Status::cancelled("Call canceled by the client.")),
        Err(RunError::Status(status)) => context.resolve_terminal_status(status),
    };

    if let Some(tx) = response_tx.take() {
        if final_status.code() != Code::Ok {
            let _ = tx.send(Err(context.error_from_status(&final_status)));
        }
    }

    let _entered = span.enter();
    if final_status.code() == Code::Ok {
        tracing::debug!("finished gRPC call");
    } else {
        tracing::debug!(
            status_code = %final_status.code(),
            status_message = final_status.message(),
            "gRPC call failed"
        );
    }
    context.finish_cleanup(final_status);
}

async fn run_call_core<Req, Res>(
    context: &Arc<CallContext>,
    method: &Arc<Method<Req, Res>>,
    source: RequestSource<Req>,
    response_tx: &mut Option<oneshot::Sender<Result<Res, CallError>>>,
    handoff_tx: Option<oneshot::Sender<StreamHandoff>>,
) -> Result<(), RunError>
where
    Req: Send + 'static,
    Res: Send + 'static,
{
    tracing::debug!("starting gRPC call");
    let channel = context.channel().clone();

    // Fail fast when the deadline already elapsed; nothing is sent.
    if let Some(deadline) = context.deadline() {
        if channel.clock().now() >= deadline {
            return Err(Status::deadline_exceeded("").into());
        }
    }

    let body = match source {
        RequestSource::Message(message) => {
            let frame = encode_message(
                &message,
                method.request_marshaller(),
                channel.buffer_pool(),
                context.request_encoding(),
                channel.compression_providers(),
                context.options().write_options,
                channel.max_send_message_size(),
            )?;
            TransportBody::full(frame)
        }
        RequestSource::Frame(frame) => TransportBody::full(frame),
        RequestSource::Body(body) => body,
    };

    let mut request = build_request(context, body)?;
    apply_credentials(context, &mut request).await?;

    let response = tokio::select! {
        biased;
        _ = context.cancelled() => return Err(RunError::Cancelled),
        result = channel.transport().send(request) => {
            result.map_err(|err| RunError::Status(status_from_transport_error(&err)))?
        }
    };

    let (parts, body) = response.into_parts();
    if let Some(pushback) = retry::parse_pushback(&parts.headers) {
        context.set_pushback(pushback);
    }

    match validate_response_headers(parts.version, parts.status, &parts.headers) {
        ResponseValidation::Failed(status) => Err(status.into()),
        ResponseValidation::TrailersOnly { status, trailers } => {
            tracing::debug!("received trailers-only response");
            context.set_trailers(trailers);
            // The status arrived in the header block; the call is finished
            // before any body exists.
            context.try_commit_status(status.clone());
            if status.code() == Code::Ok {
                context.publish_headers(Ok(Metadata::new()));
                if let Some(tx) = response_tx.take() {
                    // OK without a response message is forbidden for unary
                    // shapes.
                    let _ = tx.send(Err(CallError::Rpc(Status::internal(
                        "Failed to deserialize response message.",
                    ))));
                }
            } else {
                context.publish_headers(Err(status.clone()));
                if let Some(tx) = response_tx.take() {
                    let _ = tx.send(Err(context.error_from_status(&status)));
                }
            }
            // Streaming readers observe the committed status directly; the
            // dropped handoff sender is their signal.
            drop(handoff_tx);
            Ok(())
        }
        ResponseValidation::InProgress => {
            context.mark_headers_received();
            context.publish_headers(Ok(Metadata::from_headers_lossy(&parts.headers)));
            let grpc_encoding = parts
                .headers
                .get(&GRPC_ENCODING)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned);

            if let Some(handoff_tx) = handoff_tx {
                let _ = handoff_tx.send(StreamHandoff {
                    body,
                    grpc_encoding,
                });
                // The stream reader drives the body and commits the final
                // status; wait for it (or for cancellation).
                tokio::select! {
                    biased;
                    _ = context.cancelled() => Err(RunError::Cancelled),
                    _ = context.wait_status() => Ok(()),
                }
            } else {
                read_unary_response(context, method, body, grpc_encoding, response_tx).await
            }
        }
    }
}

/// Read exactly one framed message and the trailers, then resolve the
/// response future.
async fn read_unary_response<Req, Res>(
    context: &Arc<CallContext>,
    method: &Arc<Method<Req, Res>>,
    body: ResponseBody,
    grpc_encoding: Option<String>,
    response_tx: &mut Option<oneshot::Sender<Result<Res, CallError>>>,
) -> Result<(), RunError>
where
    Req: Send + 'static,
    Res: Send + 'static,
{
    let channel = context.channel();
    let providers = channel.compression_providers();
    let max_receive = channel.max_receive_message_size();
    let mut reader = FrameReader::new(body);

    let payload = tokio::select! {
        biased;
        _ = context.cancelled() => return Err(RunError::Cancelled),
        result = reader.next_message(grpc_encoding.as_deref(), providers, max_receive) => result?,
    };

    let Some(payload) = payload else {
        // Empty response body: the status comes from the trailers, but OK
        // with no message is rewritten to an internal error.
        let status = status_from_trailers(reader.trailers());
        context.set_trailers(status.trailers().clone());
        let status = if status.code() == Code::Ok {
            Status::internal("Failed to deserialize response message.")
                .with_trailers(status.trailers().clone())
        } else {
            status
        };
        return Err(status.into());
    };

    // A unary response carries exactly one message; trailers are only
    // trustworthy once the body is drained.
    let extra = tokio::select! {
        biased;
        _ = context.cancelled() => return Err(RunError::Cancelled),
        result = reader.next_message(grpc_encoding.as_deref(), providers, max_receive) => result?,
    };
    if extra.is_some() {
        return Err(Status::internal("Unexpected data after finished reading message.").into());
    }

    let status = status_from_trailers(reader.trailers());
    context.set_trailers(status.trailers().clone());

    if status.code() != Code::Ok {
        return Err(status.into());
    }

    let message = method
        .response_marshaller()
        .deserialize(DeserializationContext::new(payload))
        .map_err(|err| {
            RunError::Status(Status::internal(format!(
                "Error deserializing response message: {err}"
            )))
        })?;

    // A concurrent cancellation may have committed first; its status stays
    // authoritative and the failure is delivered by the caller.
    if context.try_commit_status(status) {
        if let Some(tx) = response_tx.take() {
            let _ = tx.send(Ok(message));
        }
    }
    Ok(())
}

/// Compute the final status from a trailers frame.
pub(crate) fn status_from_trailers(trailers: Option<&http::HeaderMap>) -> Status {
    match trailers {
        Some(map) => {
            let metadata = Metadata::from_headers_lossy(map);
            match Status::from_headers(map) {
                Some(status) => status.with_trailers(metadata),
                None => {
                    Status::cancelled("No grpc-status found on response.").with_trailers(metadata)
                }
            }
        }
        None => Status::cancelled("No grpc-status found on response."),
    }
}

fn build_request(
    context: &CallContext,
    body: TransportBody,
) -> Result<http::Request<TransportBody>, RunError> {
    let channel = context.channel();
    let mut request = http::Request::builder()
        .method(http::Method::POST)
        .uri(context.info().uri.clone())
        .version(http::Version::HTTP_2)
        .body(body)
        .map_err(|err| {
            RunError::Status(Status::internal(format!("Error constructing request: {err}")))
        })?;

    let headers = request.headers_mut();
    headers.insert(http::header::USER_AGENT, channel.user_agent().clone());
    headers.insert(http::header::TE, TE_TRAILERS);
    headers.insert(http::header::CONTENT_TYPE, GRPC_CONTENT_TYPE_VALUE);
    if let Ok(accept) = HeaderValue::try_from(channel.compression_providers().accept_encoding()) {
        headers.insert(GRPC_ACCEPT_ENCODING, accept);
    }
    if let Some(encoding) = context.request_encoding() {
        if let Ok(value) = HeaderValue::try_from(encoding) {
            headers.insert(GRPC_ENCODING, value);
        }
    }
    if context.attempt() > 1 {
        headers.insert(
            GRPC_PREVIOUS_RPC_ATTEMPTS,
            HeaderValue::from(context.attempt() - 1),
        );
    }
    if let Some(deadline) = context.deadline() {
        let remaining = deadline
            .duration_since(channel.clock().now())
            .unwrap_or_default();
        if let Ok(value) = HeaderValue::try_from(encode_timeout(remaining)) {
            headers.insert(GRPC_TIMEOUT, value);
        }
    }
    // User metadata last; the reserved timeout header and the internal
    // compression request never go on the wire verbatim.
    context.options().metadata.append_to_headers(
        headers,
        &["grpc-timeout", GRPC_INTERNAL_ENCODING_REQUEST],
    );
    Ok(request)
}

/// Run channel-level then per-call credentials, appending their metadata to
/// the request. Credentials never run over an insecure transport.
async fn apply_credentials(
    context: &Arc<CallContext>,
    request: &mut http::Request<TransportBody>,
) -> Result<(), RunError> {
    let channel = context.channel();
    let per_call = context.options().credentials.clone();
    if channel.call_credentials().is_empty() && per_call.is_none() {
        return Ok(());
    }
    if !channel.is_secure() {
        tracing::warn!(
            "The configured call credentials were not used because the transport is not secure."
        );
        return Ok(());
    }

    let info = context.info();
    let auth = auth_context(channel.base_uri(), &info.service_name, &info.method_name);
    let sources = channel
        .call_credentials()
        .iter()
        .cloned()
        .chain(per_call)
        .collect::<Vec<_>>();
    for credentials in sources {
        let metadata = tokio::select! {
            biased;
            _ = context.cancelled() => return Err(RunError::Cancelled),
            result = credentials.get_metadata(&auth) => result.map_err(|err| {
                RunError::Status(status_from_transport_error(err.as_ref()))
            })?,
        };
        metadata.append_to_headers(request.headers_mut(), &[]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use grpc_hyper_core::Marshaller;

    use crate::method::MethodType;

    fn test_context() -> Arc<CallContext> {
        let channel = Channel::builder("http://localhost:50051").build().unwrap();
        let method = Method::new(
            MethodType::Unary,
            "svc",
            "M",
            Marshaller::bytes(),
            Marshaller::bytes(),
        );
        let info = channel.get_method_info(&method).unwrap();
        CallContext::new(channel, info, CallOptions::new(), 1)
    }

    #[tokio::test]
    async fn status_commits_exactly_once() {
        let context = test_context();
        assert!(context.try_commit_status(Status::ok()));
        assert!(!context.try_commit_status(Status::unavailable("late")));
        assert_eq!(context.final_status().unwrap().code(), Code::Ok);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_releases_waiters() {
        let context = test_context();
        let waiter = {
            let context = Arc::clone(&context);
            tokio::spawn(async move { context.wait_status().await })
        };

        context.cancel_with_status(Status::cancelled("Call canceled by the client."));
        context.cancel_with_status(Status::cancelled("again"));

        let status = waiter.await.unwrap();
        assert_eq!(status.code(), Code::Cancelled);
        assert_eq!(status.message(), "Call canceled by the client.");
        assert!(context.is_cancellation_requested());

        // Headers waiters observe the failure, not a hang.
        let headers = context.wait_headers().await;
        assert_eq!(headers.unwrap_err().code(), Code::Cancelled);
    }

    #[tokio::test]
    async fn headers_latch_resolves_at_most_once() {
        let context = test_context();
        let mut metadata = Metadata::new();
        metadata.add("x-first", "1");
        context.publish_headers(Ok(metadata));
        context.publish_headers(Err(Status::internal("late")));

        let headers = context.wait_headers().await.unwrap();
        assert_eq!(headers.get("x-first"), Some("1"));
    }

    #[tokio::test]
    async fn trailers_fail_before_completion() {
        let context = test_context();
        assert!(matches!(
            context.get_trailers(),
            Err(CallError::InvalidOperation(_))
        ));
        assert!(matches!(
            context.get_status(),
            Err(CallError::InvalidOperation(_))
        ));

        let mut trailers = Metadata::new();
        trailers.add("x-t", "v");
        context.set_trailers(trailers);
        context.try_commit_status(Status::ok());

        assert_eq!(context.get_trailers().unwrap().get("x-t"), Some("v"));
        assert_eq!(context.get_status().unwrap().code(), Code::Ok);
    }

    #[tokio::test]
    async fn cancelled_rewrites_to_deadline_exceeded_when_deadline_passed() {
        let channel = Channel::builder("http://localhost:50051").build().unwrap();
        let method = Method::new(
            MethodType::Unary,
            "svc",
            "M",
            Marshaller::bytes(),
            Marshaller::bytes(),
        );
        let info = channel.get_method_info(&method).unwrap();
        let options = CallOptions::new()
            .deadline(SystemTime::now() - std::time::Duration::from_secs(1));
        let context = CallContext::new(channel, info, options, 1);

        context.cancel_with_status(Status::cancelled("Call canceled by the client."));
        assert_eq!(
            context.final_status().unwrap().code(),
            Code::DeadlineExceeded
        );
    }

    #[tokio::test]
    async fn cleanup_unregisters_from_channel() {
        let channel = Channel::builder("http://localhost:50051").build().unwrap();
        let method = Method::new(
            MethodType::Unary,
            "svc",
            "M",
            Marshaller::bytes(),
            Marshaller::bytes(),
        );
        let info = channel.get_method_info(&method).unwrap();
        let context = CallContext::new(channel.clone(), info, CallOptions::new(), 1);
        assert_eq!(channel.active_call_count(), 1);

        context.finish_cleanup(Status::ok());
        assert_eq!(channel.active_call_count(), 0);
        // Second cleanup is a no-op.
        context.finish_cleanup(Status::internal("ignored"));
        assert_eq!(context.final_status().unwrap().code(), Code::Ok);
    }

    #[test]
    fn trailer_status_parsing() {
        let mut trailers = http::HeaderMap::new();
        trailers.insert("grpc-status", "0".parse().unwrap());
        trailers.insert("x-extra", "v".parse().unwrap());
        let status = status_from_trailers(Some(&trailers));
        assert_eq!(status.code(), Code::Ok);
        assert_eq!(status.trailers().get("x-extra"), Some("v"));

        let status = status_from_trailers(None);
        assert_eq!(status.code(), Code::Cancelled);
        assert_eq!(status.message(), "No grpc-status found on response.");

        let empty = http::HeaderMap::new();
        let status = status_from_trailers(Some(&empty));
        assert_eq!(status.code(), Code::Cancelled);
    }
}
