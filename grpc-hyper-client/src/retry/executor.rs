//! Retrying and hedging call executors.
//!
//! Both executors present the same observable surface as a single call: a
//! wrapper [`CallContext`] owns the latches the user awaits, while an
//! orchestrator task starts per-attempt calls and mirrors exactly one
//! attempt's result onto the wrapper. Commit is exclusive: once an attempt
//! is chosen, the others are cancelled before its result is observed.
//!
//! An attempt commits when its response headers arrive (a server that
//! started responding owns the call) or, for trailers-only and transport
//! failures, when its final status is not eligible for another attempt.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use grpc_hyper_core::{Code, Status};

use crate::call::{CallContext, GrpcCall, RequestSource, StreamHandoff, await_response};
use crate::channel::{Channel, MethodInfo};
use crate::error::CallError;
use crate::frame::encode_message;
use crate::method::Method;
use crate::options::CallOptions;
use crate::transport::TransportBody;

use super::buffer::WriteBuffer;
use super::throttle::RetryThrottle;
use super::{HedgingPolicy, Pushback, RetryKind, RetryPolicy};

type ResponseSender<Res> = oneshot::Sender<Result<Res, CallError>>;
type ResponseReceiver<Res> = oneshot::Receiver<Result<Res, CallError>>;

/// How each attempt reproduces the request.
#[derive(Clone)]
enum AttemptSeed {
    /// The request message, encoded once and replayed per attempt.
    Frame(Bytes),
    /// The shared write log for streaming requests.
    Buffered(Arc<WriteBuffer>),
}

enum AttemptSignal {
    /// Response headers arrived: the attempt owns the call.
    HeadersOk,
    /// The attempt finished without a response body.
    Finished(Status),
}

/// Surface pieces of a retrying or hedging call, handed to the invoker.
pub(crate) struct RetryableCall<Res> {
    pub context: Arc<CallContext>,
    pub response_rx: Option<ResponseReceiver<Res>>,
    pub handoff_rx: Option<oneshot::Receiver<StreamHandoff>>,
    pub write_buffer: Option<Arc<WriteBuffer>>,
}

impl<Res> RetryableCall<Res>
where
    Res: Send + 'static,
{
    /// Build the wrapper surface and spawn the orchestrator.
    ///
    /// `initial` carries the request message for the non-streaming-request
    /// shapes; it is serialized once here so every attempt replays the same
    /// frame.
    pub(crate) fn start<Req>(
        channel: Channel,
        info: Arc<MethodInfo>,
        method: Arc<Method<Req, Res>>,
        options: CallOptions,
        kind: RetryKind,
        initial: Option<Req>,
    ) -> Result<Self, CallError>
    where
        Req: Send + 'static,
    {
        let wrapper = CallContext::new(channel.clone(), Arc::clone(&info), options.clone(), 0);
        wrapper.mark_started();
        wrapper.start_deadline_timer();
        wrapper.register_external_cancellation();

        let seed = if method.method_type().has_request_stream() {
            AttemptSeed::Buffered(WriteBuffer::new())
        } else {
            let Some(message) = initial else {
                return Err(CallError::invalid_operation(
                    "A request message is required for this call shape.",
                ));
            };
            let frame = encode_message(
                &message,
                method.request_marshaller(),
                channel.buffer_pool(),
                wrapper.request_encoding(),
                channel.compression_providers(),
                options.write_options,
                channel.max_send_message_size(),
            )
            .map_err(|status| {
                wrapper.finish_cleanup(status.clone());
                CallError::Rpc(status)
            })?;
            AttemptSeed::Frame(frame)
        };

        let write_buffer = match &seed {
            AttemptSeed::Buffered(buffer) => Some(Arc::clone(buffer)),
            AttemptSeed::Frame(_) => None,
        };

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

        let orchestrator = Orchestrator {
            channel,
            info,
            method,
            options,
            wrapper: Arc::clone(&wrapper),
            seed,
            response_tx,
            handoff_tx,
        };
        match kind {
            RetryKind::Retry(policy) => {
                tokio::spawn(orchestrator.run_retry(policy));
            }
            RetryKind::Hedging(policy) => {
                tokio::spawn(orchestrator.run_hedging(policy));
            }
        }

        Ok(RetryableCall {
            context: wrapper,
            response_rx,
            handoff_rx,
            write_buffer,
        })
    }
}

struct Orchestrator<Req, Res> {
    channel: Channel,
    info: Arc<MethodInfo>,
    method: Arc<Method<Req, Res>>,
    options: CallOptions,
    wrapper: Arc<CallContext>,
    seed: AttemptSeed,
    response_tx: Option<ResponseSender<Res>>,
    handoff_tx: Option<oneshot::Sender<StreamHandoff>>,
}

impl<Req, Res> Orchestrator<Req, Res>
where
    Req: Send + 'static,
    Res: Send + 'static,
{
    fn start_attempt(&self, attempt_no: u32) -> GrpcCall<Req, Res> {
        let mut call = GrpcCall::new(
            self.channel.clone(),
            Arc::clone(&self.info),
            Arc::clone(&self.method),
            self.options.clone(),
            attempt_no,
        );
        let source = match &self.seed {
            AttemptSeed::Frame(frame) => RequestSource::Frame(frame.clone()),
            AttemptSeed::Buffered(buffer) => {
                // The cursor id is the attempt number, so a commit can
                // single this attempt's body out.
                RequestSource::Body(TransportBody::streaming(buffer.replay_stream(attempt_no)))
            }
        };
        call.start(source);
        call
    }

    async fn run_retry(mut self, policy: RetryPolicy) {
        let throttle = self.channel.retry_throttle().cloned();
        let max_attempts = policy
            .max_attempts()
            .min(self.channel.max_retry_attempts_limit());
        let mut attempt_no = 1;

        loop {
            let mut attempt = self.start_attempt(attempt_no);
            let signal = tokio::select! {
                biased;
                _ = self.wrapper.cancelled() => {
                    let status = self.wrapper.wait_status().await;
                    attempt.context().cancel_with_status(status.clone());
                    self.finish_cancelled(status);
                    return;
                }
                signal = attempt_signal(attempt.context()) => signal,
            };

            match signal {
                AttemptSignal::HeadersOk => {
                    tracing::debug!(attempt = attempt_no, "call committed: response received");
                    self.commit(attempt, true, throttle.as_ref()).await;
                    return;
                }
                AttemptSignal::Finished(status) => {
                    if status.code() != Code::Ok {
                        if let Some(throttle) = &throttle {
                            throttle.call_failure();
                        }
                    }
                    let pushback = attempt.context().take_pushback();
                    let throttled = throttle
                        .as_ref()
                        .is_some_and(|throttle| throttle.is_retry_throttled());
                    let can_retry = status.code() != Code::Ok
                        && policy.is_retryable(status.code())
                        && attempt_no < max_attempts
                        && !throttled
                        && pushback != Some(Pushback::Stop);
                    if !can_retry {
                        tracing::debug!(
                            attempt = attempt_no,
                            status_code = %status.code(),
                            "call committed: no more retry attempts"
                        );
                        self.commit(attempt, false, throttle.as_ref()).await;
                        return;
                    }

                    let delay = match pushback {
                        Some(Pushback::Delay(delay)) => delay,
                        _ => policy.backoff_for_attempt(attempt_no),
                    };
                    tracing::debug!(
                        attempt = attempt_no,
                        delay_ms = delay.as_millis() as u64,
                        status_code = %status.code(),
                        "scheduling retry attempt"
                    );
                    tokio::select! {
                        biased;
                        _ = self.wrapper.cancelled() => {
                            let status = self.wrapper.wait_status().await;
                            self.finish_cancelled(status);
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt_no += 1;
                }
            }
        }
    }

    async fn run_hedging(mut self, policy: HedgingPolicy) {
        let throttle = self.channel.retry_throttle().cloned();
        let max_attempts = policy
            .max_attempts()
            .min(self.channel.max_retry_attempts_limit());
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<(usize, AttemptSignal)>();

        let mut attempts: Vec<Option<GrpcCall<Req, Res>>> = Vec::new();
        let mut started: u32 = 0;
        let mut finished: u32 = 0;
        let mut stop_spawning = false;
        let mut hedging_delay = policy.hedging_delay();

        spawn_hedged_attempt(&self, &mut attempts, &mut started, &events_tx);

        let sleep = tokio::time::sleep(hedging_delay);
        tokio::pin!(sleep);

        loop {
            let can_spawn = !stop_spawning && started < max_attempts;
            tokio::select! {
                biased;
                _ = self.wrapper.cancelled() => {
                    // Deadline, dispose or external cancel: every child
                    // attempt is cancelled exactly once.
                    let status = self.wrapper.wait_status().await;
                    tracing::debug!(status_code = %status.code(), "hedged call committed: call cancelled");
                    for attempt in attempts.iter().flatten() {
                        attempt.context().cancel_with_status(status.clone());
                    }
                    self.finish_cancelled(status);
                    return;
                }
                event = events_rx.recv() => {
                    let Some((index, signal)) = event else { return };
                    match signal {
                        AttemptSignal::HeadersOk => {
                            let Some(attempt) = attempts[index].take() else { continue };
                            cancel_attempts(&mut attempts);
                            tracing::debug!(
                                attempt = index + 1,
                                "hedged call committed: response received"
                            );
                            self.commit(attempt, true, throttle.as_ref()).await;
                            return;
                        }
                        AttemptSignal::Finished(status) => {
                            finished += 1;
                            if status.code() != Code::Ok {
                                if let Some(throttle) = &throttle {
                                    throttle.call_failure();
                                }
                            }
                            match attempts[index]
                                .as_ref()
                                .and_then(|attempt| attempt.context().take_pushback())
                            {
                                Some(Pushback::Stop) => stop_spawning = true,
                                Some(Pushback::Delay(delay)) => hedging_delay = delay,
                                None => {}
                            }

                            if status.code() == Code::Ok || policy.is_fatal(status.code()) {
                                let Some(attempt) = attempts[index].take() else { continue };
                                cancel_attempts(&mut attempts);
                                tracing::debug!(
                                    attempt = index + 1,
                                    status_code = %status.code(),
                                    "hedged call committed: fatal status"
                                );
                                self.commit(attempt, false, throttle.as_ref()).await;
                                return;
                            }

                            // Throttling is evaluated at spawn time; here only
                            // hard exhaustion commits, so a throttled pause
                            // with attempts still in flight can wait them out.
                            let no_more_attempts = started >= max_attempts || stop_spawning;
                            if no_more_attempts && finished >= started {
                                let Some(attempt) = attempts[index].take() else { continue };
                                tracing::debug!(
                                    attempt = index + 1,
                                    status_code = %status.code(),
                                    "hedged call committed: attempts exhausted"
                                );
                                self.commit(attempt, false, throttle.as_ref()).await;
                                return;
                            }
                        }
                    }
                }
                _ = &mut sleep, if can_spawn => {
                    let throttled = throttle
                        .as_ref()
                        .is_some_and(|throttle| throttle.is_retry_throttled());
                    if throttled {
                        if finished >= started {
                            // Nothing in flight and nothing more may start.
                            let status = Status::cancelled(
                                "Retries stopped because retry throttling is active.",
                            );
                            tracing::debug!("hedged call committed: retry throttling active");
                            self.finish_cancelled(status);
                            return;
                        }
                        stop_spawning = true;
                    } else {
                        spawn_hedged_attempt(&self, &mut attempts, &mut started, &events_tx);
                        sleep.as_mut().reset(tokio::time::Instant::now() + hedging_delay);
                    }
                }
            }
        }
    }

    /// Mirror one attempt onto the wrapper surface. `live` is true when the
    /// attempt committed on response headers and its body is still being
    /// consumed.
    async fn commit(
        &mut self,
        mut attempt: GrpcCall<Req, Res>,
        live: bool,
        throttle: Option<&Arc<RetryThrottle>>,
    ) {
        // The commit releases the write-replay log: the committed attempt's
        // cursor drains it from here on and losing cursors end.
        if let AttemptSeed::Buffered(buffer) = &self.seed {
            buffer.commit(attempt.context().attempt());
        }
        if let Some(headers) = attempt.context().headers_snapshot() {
            self.wrapper.publish_headers(headers);
        }

        if let Some(handoff_tx) = self.handoff_tx.take() {
            if live {
                if let Some(handoff_rx) = attempt.take_handoff_rx() {
                    if let Ok(handoff) = handoff_rx.await {
                        let _ = handoff_tx.send(handoff);
                    }
                }
                // The wrapper's reader drives the body and commits the
                // wrapper status; mirror it back so the attempt's run loop
                // can finish.
                let status = self.wrapper.wait_status().await;
                attempt.context().try_commit_status(status.clone());
                if status.code() == Code::Ok {
                    if let Some(throttle) = throttle {
                        throttle.call_success();
                    }
                }
                self.wrapper.finish_cleanup(status);
            } else {
                let status = attempt
                    .context()
                    .final_status()
                    .unwrap_or_else(Status::ok);
                if let Ok(trailers) = attempt.context().get_trailers() {
                    self.wrapper.set_trailers(trailers);
                }
                self.wrapper.try_commit_status(status.clone());
                if status.code() == Code::Ok {
                    if let Some(throttle) = throttle {
                        throttle.call_success();
                    }
                }
                // Dropping the handoff sender points the reader at the
                // committed status.
                self.wrapper.finish_cleanup(status);
            }
        } else {
            let status = attempt.context().wait_status().await;
            if let Ok(trailers) = attempt.context().get_trailers() {
                self.wrapper.set_trailers(trailers);
            }
            self.wrapper.try_commit_status(status.clone());
            if status.code() == Code::Ok {
                if let Some(throttle) = throttle {
                    throttle.call_success();
                }
            }
            let result = match attempt.take_response_rx() {
                Some(response_rx) => await_response(attempt.context(), response_rx).await,
                None => Err(self.wrapper.error_from_status(&status)),
            };
            if let Some(response_tx) = self.response_tx.take() {
                let _ = response_tx.send(result);
            }
            self.wrapper.finish_cleanup(status);
        }
    }

    fn finish_cancelled(&mut self, status: Status) {
        self.wrapper.try_commit_status(status.clone());
        if let Some(response_tx) = self.response_tx.take() {
            let _ = response_tx.send(Err(self.wrapper.error_from_status(&status)));
        }
        self.wrapper.finish_cleanup(status);
    }
}

fn spawn_hedged_attempt<Req, Res>(
    orchestrator: &Orchestrator<Req, Res>,
    attempts: &mut Vec<Option<GrpcCall<Req, Res>>>,
    started: &mut u32,
    events_tx: &mpsc::UnboundedSender<(usize, AttemptSignal)>,
) where
    Req: Send + 'static,
    Res: Send + 'static,
{
    let index = attempts.len();
    let attempt = orchestrator.start_attempt(index as u32 + 1);
    let context = Arc::clone(attempt.context());
    let events_tx = events_tx.clone();
    tokio::spawn(async move {
        let signal = attempt_signal(&context).await;
        let _ = events_tx.send((index, signal));
    });
    attempts.push(Some(attempt));
    *started += 1;
}

fn cancel_attempts<Req, Res>(attempts: &mut [Option<GrpcCall<Req, Res>>])
where
    Req: Send + 'static,
    Res: Send + 'static,
{
    for attempt in attempts.iter().flatten() {
        attempt
            .context()
            .cancel_with_status(Status::cancelled("Call canceled by the client."));
    }
}

/// Wait for an attempt's commit signal: response headers (ownership) or a
/// terminal status.
async fn attempt_signal(context: &Arc<CallContext>) -> AttemptSignal {
    tokio::select! {
        biased;
        status = context.wait_status() => AttemptSignal::Finished(status),
        headers = context.wait_headers() => match headers {
            Ok(_) => AttemptSignal::HeadersOk,
            // A failed headers latch always resolves alongside a status.
            Err(_) => AttemptSignal::Finished(context.wait_status().await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grpc_hyper_core::{Marshaller, Metadata};

    use crate::method::MethodType;

    fn test_context() -> Arc<CallContext> {
        let channel = Channel::builder("http://localhost:50051").build().unwrap();
        let method = Method::new(
            MethodType::Unary,
            "svc",
            "M",
            Marshaller::<Bytes>::bytes(),
            Marshaller::<Bytes>::bytes(),
        );
        let info = channel.get_method_info(&method).unwrap();
        CallContext::new(channel, info, CallOptions::new(), 1)
    }

    #[tokio::test]
    async fn signal_is_headers_ok_for_in_progress_response() {
        let context = test_context();
        context.publish_headers(Ok(Metadata::new()));
        assert!(matches!(
            attempt_signal(&context).await,
            AttemptSignal::HeadersOk
        ));
    }

    #[tokio::test]
    async fn signal_is_finished_for_terminal_status() {
        let context = test_context();
        context.try_commit_status(Status::unavailable("down"));
        match attempt_signal(&context).await {
            AttemptSignal::Finished(status) => assert_eq!(status.code(), Code::Unavailable),
            AttemptSignal::HeadersOk => panic!("expected finished"),
        }
    }

    #[tokio::test]
    async fn signal_follows_failed_headers_to_status() {
        let context = test_context();
        // Trailers-only failure order: status commit, then failed headers.
        context.try_commit_status(Status::permission_denied("no"));
        context.publish_headers(Err(Status::permission_denied("no")));
        match attempt_signal(&context).await {
            AttemptSignal::Finished(status) => {
                assert_eq!(status.code(), Code::PermissionDenied);
            }
            AttemptSignal::HeadersOk => panic!("expected finished"),
        }
    }
}
