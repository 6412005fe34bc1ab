//! Client stream writer and server stream reader.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

use grpc_hyper_core::marshal::{DeserializationContext, Marshaller};
use grpc_hyper_core::{Code, Status};

use crate::call::{CallContext, StreamHandoff, status_from_trailers};
use crate::cancellation::CancellationSignal;
use crate::error::CallError;
use crate::frame::{FrameReader, encode_message};
use crate::options::WriteOptions;
use crate::retry::WriteBuffer;
use crate::transport::TransportBody;

/// Where a writer's encoded frames go.
pub(crate) enum WriterSink {
    /// A bounded channel feeding the request body directly. The single slot
    /// is the transport handshake: a write completes only once the body has
    /// taken the frame, and dropping the sender ends the stream.
    Direct(std::sync::Mutex<Option<mpsc::Sender<Bytes>>>),
    /// The replay log used when a retry or hedging policy owns the
    /// attempts. Until a commit, frames are retained for replay by new
    /// attempts; after it, the log drains through the committed attempt's
    /// body and each frame is freed once consumed.
    Buffered(Arc<WriteBuffer>),
}

/// Create the direct sink and the request body it feeds.
pub(crate) fn direct_sink() -> (WriterSink, TransportBody) {
    let (tx, rx) = mpsc::channel::<Bytes>(1);
    (
        WriterSink::Direct(std::sync::Mutex::new(Some(tx))),
        TransportBody::streaming(ReceiverStream::new(rx)),
    )
}

/// Producer side of a client-streaming or duplex call.
///
/// At most one write may be in flight; [`complete`](Self::complete) is
/// final and causes END_STREAM once the body drains.
pub struct ClientStreamWriter<Req> {
    context: Arc<CallContext>,
    marshaller: Marshaller<Req>,
    sink: WriterSink,
    write_lock: tokio::sync::Mutex<()>,
    completed: AtomicBool,
    default_write_options: WriteOptions,
}

impl<Req> ClientStreamWriter<Req>
where
    Req: Send + 'static,
{
    pub(crate) fn new(
        context: Arc<CallContext>,
        marshaller: Marshaller<Req>,
        sink: WriterSink,
    ) -> Self {
        let default_write_options = context.options().write_options;
        ClientStreamWriter {
            context,
            marshaller,
            sink,
            write_lock: tokio::sync::Mutex::new(()),
            completed: AtomicBool::new(false),
            default_write_options,
        }
    }

    /// Write one message using the call's write options.
    pub async fn write(&self, message: Req) -> Result<(), CallError> {
        self.write_with_options(message, self.default_write_options)
            .await
    }

    /// Write one message with explicit write options.
    pub async fn write_with_options(
        &self,
        message: Req,
        write_options: WriteOptions,
    ) -> Result<(), CallError> {
        if let Some(status) = self.context.final_status() {
            return Err(self.call_complete_error(&status));
        }
        if self.completed.load(Ordering::SeqCst) {
            return Err(CallError::invalid_operation(
                "Request stream has already been completed.",
            ));
        }
        let Ok(_guard) = self.write_lock.try_lock() else {
            return Err(CallError::invalid_operation(
                "Can't write the message because the previous write is in progress.",
            ));
        };
        if self.completed.load(Ordering::SeqCst) {
            return Err(CallError::invalid_operation(
                "Request stream has already been completed.",
            ));
        }

        let channel = self.context.channel();
        let frame = encode_message(
            &message,
            &self.marshaller,
            channel.buffer_pool(),
            self.context.request_encoding(),
            channel.compression_providers(),
            write_options,
            channel.max_send_message_size(),
        )
        .map_err(CallError::Rpc)?;

        match &self.sink {
            WriterSink::Direct(sender) => {
                let sender = {
                    let slot = sender.lock().unwrap_or_else(|e| e.into_inner());
                    slot.clone()
                };
                let Some(sender) = sender else {
                    return Err(CallError::invalid_operation(
                        "Request stream has already been completed.",
                    ));
                };
                tokio::select! {
                    biased;
                    _ = self.context.cancelled() => Err(self.aborted_error()),
                    result = sender.send(frame) => {
                        result.map_err(|_| self.aborted_error())
                    }
                }
            }
            WriterSink::Buffered(buffer) => {
                buffer.push(frame);
                Ok(())
            }
        }
    }

    /// Complete the request stream. No further writes are accepted and the
    /// transport sends END_STREAM once buffered frames drain.
    pub fn complete(&self) -> Result<(), CallError> {
        let Ok(_guard) = self.write_lock.try_lock() else {
            return Err(CallError::invalid_operation(
                "Can't complete the client stream writer because the previous write is in progress.",
            ));
        };
        if self.completed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match &self.sink {
            WriterSink::Direct(sender) => {
                let mut slot = sender.lock().unwrap_or_else(|e| e.into_inner());
                // Dropping the sender ends the receiver stream, which ends
                // the request body.
                slot.take();
            }
            WriterSink::Buffered(buffer) => buffer.close(),
        }
        Ok(())
    }

    fn call_complete_error(&self, status: &Status) -> CallError {
        match status.code() {
            Code::Ok => CallError::invalid_operation(
                "Can't write the message because the call is complete.",
            ),
            _ => self.context.error_from_status(status),
        }
    }

    fn aborted_error(&self) -> CallError {
        let status = self
            .context
            .final_status()
            .unwrap_or_else(|| Status::cancelled("Call canceled by the client."));
        self.context.error_from_status(&status)
    }
}

impl<Req> std::fmt::Debug for ClientStreamWriter<Req> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientStreamWriter")
            .field("completed", &self.completed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

enum ReaderState {
    Waiting(oneshot::Receiver<StreamHandoff>),
    Active {
        frames: FrameReader,
        grpc_encoding: Option<String>,
    },
    Finished,
}

/// Consumer side of a server-streaming or duplex call.
///
/// At most one [`next`](Self::next) may be in flight; the end of the body
/// is converted into the call's final status.
pub struct ServerStreamReader<Res> {
    context: Arc<CallContext>,
    marshaller: Marshaller<Res>,
    state: tokio::sync::Mutex<ReaderState>,
}

impl<Res> ServerStreamReader<Res>
where
    Res: Send + 'static,
{
    pub(crate) fn new(
        context: Arc<CallContext>,
        marshaller: Marshaller<Res>,
        handoff: oneshot::Receiver<StreamHandoff>,
    ) -> Self {
        ServerStreamReader {
            context,
            marshaller,
            state: tokio::sync::Mutex::new(ReaderState::Waiting(handoff)),
        }
    }

    /// Read the next message; `Ok(None)` is the end of the stream with an
    /// OK status.
    pub async fn next(&self) -> Result<Option<Res>, CallError> {
        // A committed status short-circuits: OK means end of stream,
        // anything else is the call's error.
        if let Some(status) = self.context.final_status() {
            return if status.code() == Code::Ok {
                Ok(None)
            } else {
                Err(self.context.error_from_status(&status))
            };
        }
        if self.context.is_cancellation_requested() {
            let status = self.context.wait_status().await;
            return Err(self.context.error_from_status(&status));
        }

        let Ok(mut state) = self.state.try_lock() else {
            return Err(CallError::invalid_operation(
                "Can't read the next message because the previous read is still in progress.",
            ));
        };

        if matches!(&*state, ReaderState::Waiting(_)) {
            let taken = std::mem::replace(&mut *state, ReaderState::Finished);
            let ReaderState::Waiting(handoff) = taken else {
                return Ok(None);
            };
            let received = tokio::select! {
                biased;
                _ = self.context.cancelled() => {
                    let status = self.context.wait_status().await;
                    return Err(self.context.error_from_status(&status));
                }
                received = handoff => received,
            };
            match received {
                Ok(StreamHandoff {
                    body,
                    grpc_encoding,
                }) => {
                    *state = ReaderState::Active {
                        frames: FrameReader::new(body),
                        grpc_encoding,
                    };
                }
                Err(_) => {
                    // The run loop finished without a body (trailers-only
                    // response or failure); the committed status is the
                    // answer.
                    let status = self.context.wait_status().await;
                    return if status.code() == Code::Ok {
                        Ok(None)
                    } else {
                        Err(self.context.error_from_status(&status))
                    };
                }
            }
        }

        let ReaderState::Active {
            frames,
            grpc_encoding,
        } = &mut *state
        else {
            // Finished without a committed status cannot happen; treat as
            // end of stream.
            return Ok(None);
        };

        let channel = self.context.channel();
        let providers = channel.compression_providers();
        let max_receive = channel.max_receive_message_size();

        let read = tokio::select! {
            biased;
            _ = self.context.cancelled() => {
                let status = self.context.wait_status().await;
                return Err(self.context.error_from_status(&status));
            }
            result = frames.next_message(grpc_encoding.as_deref(), providers, max_receive) => result,
        };

        match read {
            Ok(Some(payload)) => {
                match self
                    .marshaller
                    .deserialize(DeserializationContext::new(payload))
                {
                    Ok(message) => Ok(Some(message)),
                    Err(err) => {
                        let status =
                            Status::internal(format!("Error deserializing response message: {err}"));
                        *state = ReaderState::Finished;
                        self.context.cancel_with_status(status.clone());
                        Err(self.context.error_from_status(&status))
                    }
                }
            }
            Ok(None) => {
                // End of body: the trailers carry the authoritative status.
                let status = status_from_trailers(frames.trailers());
                self.context.set_trailers(status.trailers().clone());
                *state = ReaderState::Finished;
                self.context.try_commit_status(status.clone());
                if status.code() == Code::Ok {
                    Ok(None)
                } else {
                    Err(self.context.error_from_status(&status))
                }
            }
            Err(status) => {
                let status = self.context.resolve_terminal_status(status);
                *state = ReaderState::Finished;
                self.context.cancel_with_status(status.clone());
                Err(self.context.error_from_status(&status))
            }
        }
    }

    /// Like [`next`](Self::next), with a read-scoped cancellation signal
    /// that also cancels the call.
    pub async fn next_with_cancellation(
        &self,
        signal: &CancellationSignal,
    ) -> Result<Option<Res>, CallError> {
        tokio::select! {
            biased;
            _ = signal.cancelled() => {
                self.context
                    .cancel_with_status(Status::cancelled("Call canceled by the client."));
                let status = self.context.wait_status().await;
                Err(self.context.error_from_status(&status))
            }
            result = self.next() => result,
        }
    }
}

impl<Res> std::fmt::Debug for ServerStreamReader<Res> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerStreamReader").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use grpc_hyper_core::Marshaller;

    use crate::call::CallContext;
    use crate::channel::Channel;
    use crate::method::{Method, MethodType};
    use crate::options::CallOptions;

    fn test_context(options: CallOptions) -> Arc<CallContext> {
        let channel = Channel::builder("http://localhost:50051").build().unwrap();
        let method = Method::new(
            MethodType::DuplexStreaming,
            "svc",
            "Stream",
            Marshaller::<Bytes>::bytes(),
            Marshaller::<Bytes>::bytes(),
        );
        let info = channel.get_method_info(&method).unwrap();
        CallContext::new(channel, info, options, 1)
    }

    fn writer_with_direct_sink() -> (ClientStreamWriter<Bytes>, TransportBody) {
        let context = test_context(CallOptions::new());
        let (sink, body) = direct_sink();
        (
            ClientStreamWriter::new(context, Marshaller::bytes(), sink),
            body,
        )
    }

    #[tokio::test]
    async fn write_then_complete_frames_the_body() {
        let (writer, body) = writer_with_direct_sink();

        let collect = tokio::spawn(async move {
            use http_body_util::BodyExt;
            body.collect().await.unwrap().to_bytes()
        });

        writer.write(Bytes::from_static(b"hello")).await.unwrap();
        writer.complete().unwrap();

        let collected = collect.await.unwrap();
        assert_eq!(collected[0], 0x00);
        assert_eq!(&collected[5..], b"hello");
    }

    #[tokio::test]
    async fn write_after_complete_is_rejected() {
        let (writer, _body) = writer_with_direct_sink();
        writer.complete().unwrap();

        let err = writer.write(Bytes::from_static(b"late")).await.unwrap_err();
        assert!(matches!(err, CallError::InvalidOperation(message)
            if message == "Request stream has already been completed."));
    }

    #[tokio::test]
    async fn write_after_ok_completion_is_a_usage_error() {
        let (writer, _body) = writer_with_direct_sink();
        writer.context.try_commit_status(Status::ok());

        let err = writer.write(Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, CallError::InvalidOperation(message)
            if message == "Can't write the message because the call is complete."));
    }

    #[tokio::test]
    async fn write_after_failed_completion_is_the_rpc_error() {
        let (writer, _body) = writer_with_direct_sink();
        writer
            .context
            .try_commit_status(Status::unavailable("gone"));

        let err = writer.write(Bytes::from_static(b"x")).await.unwrap_err();
        assert_eq!(err.code(), Some(Code::Unavailable));
    }

    #[tokio::test]
    async fn overlapping_write_is_rejected() {
        let context = test_context(CallOptions::new());
        let (sink, body) = direct_sink();
        let writer = Arc::new(ClientStreamWriter::<Bytes>::new(
            context,
            Marshaller::bytes(),
            sink,
        ));

        // Fill the single sink slot so the next write blocks on the body.
        writer.write(Bytes::from_static(b"first")).await.unwrap();

        let blocked = {
            let writer = Arc::clone(&writer);
            tokio::spawn(async move { writer.write(Bytes::from_static(b"second")).await })
        };
        tokio::task::yield_now().await;

        let err = writer.write(Bytes::from_static(b"third")).await.unwrap_err();
        assert!(matches!(err, CallError::InvalidOperation(message)
            if message == "Can't write the message because the previous write is in progress."));

        // Draining the body lets the blocked write finish.
        let drain = tokio::spawn(async move {
            use http_body_util::BodyExt;
            let mut body = body;
            while body.frame().await.is_some() {}
        });
        blocked.await.unwrap().unwrap();
        writer.complete().unwrap();
        drain.await.unwrap();
    }

    #[tokio::test]
    async fn buffered_writes_land_in_replay_log() {
        let context = test_context(CallOptions::new());
        let buffer = WriteBuffer::new();
        let writer = ClientStreamWriter::<Bytes>::new(
            context,
            Marshaller::bytes(),
            WriterSink::Buffered(Arc::clone(&buffer)),
        );

        writer.write(Bytes::from_static(b"one")).await.unwrap();
        writer.write(Bytes::from_static(b"two")).await.unwrap();
        writer.complete().unwrap();
        assert!(buffer.is_closed());

        let frames: Vec<Bytes> = buffer.replay_stream(1).collect().await;
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][5..], b"one");
        assert_eq!(&frames[1][5..], b"two");
    }

    #[tokio::test]
    async fn reader_short_circuits_on_committed_status() {
        let context = test_context(CallOptions::new());
        let (_handoff_tx, handoff_rx) = oneshot::channel();
        let reader =
            ServerStreamReader::<Bytes>::new(Arc::clone(&context), Marshaller::bytes(), handoff_rx);

        context.try_commit_status(Status::ok());
        assert!(reader.next().await.unwrap().is_none());

        // Repeated reads after the end keep returning None.
        assert!(reader.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reader_reports_committed_error() {
        let context = test_context(CallOptions::new());
        let (_handoff_tx, handoff_rx) = oneshot::channel();
        let reader =
            ServerStreamReader::<Bytes>::new(Arc::clone(&context), Marshaller::bytes(), handoff_rx);

        context.try_commit_status(Status::unavailable("down"));
        let err = reader.next().await.unwrap_err();
        assert_eq!(err.code(), Some(Code::Unavailable));
    }

    #[tokio::test]
    async fn dropped_handoff_falls_back_to_final_status() {
        let context = test_context(CallOptions::new());
        let (handoff_tx, handoff_rx) = oneshot::channel::<StreamHandoff>();
        let reader =
            ServerStreamReader::<Bytes>::new(Arc::clone(&context), Marshaller::bytes(), handoff_rx);

        let pending = {
            let context = Arc::clone(&context);
            tokio::spawn(async move {
                // Simulate the run loop failing before the handoff.
                drop(handoff_tx);
                context.try_commit_status(Status::unavailable("connect error"));
            })
        };

        let err = reader.next().await.unwrap_err();
        assert_eq!(err.code(), Some(Code::Unavailable));
        pending.await.unwrap();
    }
}
