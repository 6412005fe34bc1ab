//! The call invoker: entry point for the four call shapes.

use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use grpc_hyper_core::{Metadata, Status};

use crate::call::{CallContext, GrpcCall, RequestSource, await_response};
use crate::channel::{Channel, MethodInfo};
use crate::error::CallError;
use crate::method::{Method, MethodType};
use crate::options::CallOptions;
use crate::retry::{RetryKind, RetryableCall};
use crate::streaming::{ClientStreamWriter, ServerStreamReader, WriterSink, direct_sink};

type ResponseReceiver<Res> = oneshot::Receiver<Result<Res, CallError>>;

/// Starts calls on a channel, attaching a retry or hedging wrapper when the
/// resolved method config carries a policy.
#[derive(Clone)]
pub struct CallInvoker {
    channel: Channel,
}

impl CallInvoker {
    pub(crate) fn new(channel: Channel) -> Self {
        CallInvoker { channel }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    fn prepare<Req, Res>(
        &self,
        method: &Method<Req, Res>,
        expected: MethodType,
    ) -> Result<(Arc<MethodInfo>, Arc<Method<Req, Res>>), CallError> {
        if self.channel.is_disposed() {
            return Err(CallError::invalid_operation("gRPC channel disposed."));
        }
        if method.method_type() != expected {
            return Err(CallError::invalid_operation(format!(
                "Expected a {expected:?} method, got {:?}.",
                method.method_type()
            )));
        }
        let info = self
            .channel
            .get_method_info(method)
            .map_err(|err| CallError::invalid_operation(err.to_string()))?;
        Ok((info, Arc::new(method.clone())))
    }

    fn retry_kind(&self, info: &MethodInfo) -> Option<RetryKind> {
        if !self.channel.retry_enabled() {
            return None;
        }
        info.method_config.as_ref().map(|config| config.kind().clone())
    }

    /// Start a unary call.
    pub fn unary<Req, Res>(
        &self,
        method: &Method<Req, Res>,
        options: CallOptions,
        request: Req,
    ) -> Result<UnaryCall<Res>, CallError>
    where
        Req: Send + 'static,
        Res: Send + 'static,
    {
        let (info, method) = self.prepare(method, MethodType::Unary)?;
        match self.retry_kind(&info) {
            Some(kind) => {
                let parts = RetryableCall::start(
                    self.channel.clone(),
                    info,
                    method,
                    options,
                    kind,
                    Some(request),
                )?;
                Ok(UnaryCall {
                    context: parts.context,
                    response_rx: Mutex::new(parts.response_rx),
                })
            }
            None => {
                let mut call = GrpcCall::new(self.channel.clone(), info, method, options, 1);
                let response_rx = call.take_response_rx();
                let context = Arc::clone(call.context());
                call.start(RequestSource::Message(request));
                Ok(UnaryCall {
                    context,
                    response_rx: Mutex::new(response_rx),
                })
            }
        }
    }

    /// Start a client-streaming call.
    pub fn client_streaming<Req, Res>(
        &self,
        method: &Method<Req, Res>,
        options: CallOptions,
    ) -> Result<ClientStreamingCall<Req, Res>, CallError>
    where
        Req: Send + 'static,
        Res: Send + 'static,
    {
        let (info, method) = self.prepare(method, MethodType::ClientStreaming)?;
        match self.retry_kind(&info) {
            Some(kind) => {
                let parts = RetryableCall::<Res>::start(
                    self.channel.clone(),
                    info,
                    Arc::clone(&method),
                    options,
                    kind,
                    None,
                )?;
                let buffer = parts.write_buffer.ok_or_else(|| {
                    CallError::invalid_operation("Streaming request is missing its write log.")
                })?;
                let writer = Arc::new(ClientStreamWriter::new(
                    Arc::clone(&parts.context),
                    method.request_marshaller().clone(),
                    WriterSink::Buffered(buffer),
                ));
                Ok(ClientStreamingCall {
                    context: parts.context,
                    response_rx: Mutex::new(parts.response_rx),
                    writer,
                })
            }
            None => {
                let mut call = GrpcCall::new(
                    self.channel.clone(),
                    info,
                    Arc::clone(&method),
                    options,
                    1,
                );
                let (sink, body) = direct_sink();
                // The writer exists before the call starts so the deadline
                // timer and cancellation hooks can never race its
                // construction.
                let writer = Arc::new(ClientStreamWriter::new(
                    Arc::clone(call.context()),
                    method.request_marshaller().clone(),
                    sink,
                ));
                let response_rx = call.take_response_rx();
                let context = Arc::clone(call.context());
                call.start(RequestSource::Body(body));
                Ok(ClientStreamingCall {
                    context,
                    response_rx: Mutex::new(response_rx),
                    writer,
                })
            }
        }
    }

    /// Start a server-streaming call.
    pub fn server_streaming<Req, Res>(
        &self,
        method: &Method<Req, Res>,
        options: CallOptions,
        request: Req,
    ) -> Result<ServerStreamingCall<Res>, CallError>
    where
        Req: Send + 'static,
        Res: Send + 'static,
    {
        let (info, method) = self.prepare(method, MethodType::ServerStreaming)?;
        match self.retry_kind(&info) {
            Some(kind) => {
                let parts = RetryableCall::start(
                    self.channel.clone(),
                    info,
                    Arc::clone(&method),
                    options,
                    kind,
                    Some(request),
                )?;
                let handoff_rx = parts.handoff_rx.ok_or_else(|| {
                    CallError::invalid_operation("Streaming response is missing its handoff.")
                })?;
                let reader = Arc::new(ServerStreamReader::new(
                    Arc::clone(&parts.context),
                    method.response_marshaller().clone(),
                    handoff_rx,
                ));
                Ok(ServerStreamingCall {
                    context: parts.context,
                    reader,
                })
            }
            None => {
                let mut call = GrpcCall::new(
                    self.channel.clone(),
                    info,
                    Arc::clone(&method),
                    options,
                    1,
                );
                let handoff_rx = call.take_handoff_rx().ok_or_else(|| {
                    CallError::invalid_operation("Streaming response is missing its handoff.")
                })?;
                let reader = Arc::new(ServerStreamReader::new(
                    Arc::clone(call.context()),
                    method.response_marshaller().clone(),
                    handoff_rx,
                ));
                let context = Arc::clone(call.context());
                call.start(RequestSource::Message(request));
                Ok(ServerStreamingCall { context, reader })
            }
        }
    }

    /// Start a duplex-streaming call.
    pub fn duplex_streaming<Req, Res>(
        &self,
        method: &Method<Req, Res>,
        options: CallOptions,
    ) -> Result<DuplexStreamingCall<Req, Res>, CallError>
    where
        Req: Send + 'static,
        Res: Send + 'static,
    {
        let (info, method) = self.prepare(method, MethodType::DuplexStreaming)?;
        match self.retry_kind(&info) {
            Some(kind) => {
                let parts = RetryableCall::<Res>::start(
                    self.channel.clone(),
                    info,
                    Arc::clone(&method),
                    options,
                    kind,
                    None,
                )?;
                let buffer = parts.write_buffer.ok_or_else(|| {
                    CallError::invalid_operation("Streaming request is missing its write log.")
                })?;
                let handoff_rx = parts.handoff_rx.ok_or_else(|| {
                    CallError::invalid_operation("Streaming response is missing its handoff.")
                })?;
                let writer = Arc::new(ClientStreamWriter::new(
                    Arc::clone(&parts.context),
                    method.request_marshaller().clone(),
                    WriterSink::Buffered(buffer),
                ));
                let reader = Arc::new(ServerStreamReader::new(
                    Arc::clone(&parts.context),
                    method.response_marshaller().clone(),
                    handoff_rx,
                ));
                Ok(DuplexStreamingCall {
                    context: parts.context,
                    writer,
                    reader,
                })
            }
            None => {
                let mut call = GrpcCall::new(
                    self.channel.clone(),
                    info,
                    Arc::clone(&method),
                    options,
                    1,
                );
                let (sink, body) = direct_sink();
                let writer = Arc::new(ClientStreamWriter::new(
                    Arc::clone(call.context()),
                    method.request_marshaller().clone(),
                    sink,
                ));
                let handoff_rx = call.take_handoff_rx().ok_or_else(|| {
                    CallError::invalid_operation("Streaming response is missing its handoff.")
                })?;
                let reader = Arc::new(ServerStreamReader::new(
                    Arc::clone(call.context()),
                    method.response_marshaller().clone(),
                    handoff_rx,
                ));
                let context = Arc::clone(call.context());
                call.start(RequestSource::Body(body));
                Ok(DuplexStreamingCall {
                    context,
                    writer,
                    reader,
                })
            }
        }
    }
}

impl std::fmt::Debug for CallInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallInvoker")
            .field("channel", &self.channel)
            .finish()
    }
}

macro_rules! call_surface {
    (<$($generic:ident),*> $name:ident) => {
        impl<$($generic),*> $name<$($generic),*> {
            /// The response headers, once the server sends them. After a
            /// failure this surfaces the call's error rather than hanging.
            pub async fn response_headers(&self) -> Result<Metadata, CallError> {
                match self.context.wait_headers().await {
                    Ok(metadata) => Ok(metadata),
                    Err(status) => Err(self.context.error_from_status(&status)),
                }
            }

            /// The final status. Fails until the call completes.
            pub fn status(&self) -> Result<Status, CallError> {
                self.context.get_status()
            }

            /// The trailing metadata. Fails until the call completes.
            pub fn trailers(&self) -> Result<Metadata, CallError> {
                self.context.get_trailers()
            }

            /// Cancel the call if it has not completed. Idempotent; also
            /// run on drop.
            pub fn dispose(&self) {
                if !self.context.response_finished() {
                    self.context
                        .cancel_with_status(Status::cancelled("gRPC call disposed."));
                }
            }
        }
    };
}

/// Handle for a unary call.
#[derive(Debug)]
pub struct UnaryCall<Res> {
    context: Arc<CallContext>,
    response_rx: Mutex<Option<ResponseReceiver<Res>>>,
}

impl<Res> UnaryCall<Res> {
    /// Await the single response message. May be awaited once.
    pub async fn response(&self) -> Result<Res, CallError> {
        let receiver = self
            .response_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match receiver {
            Some(receiver) => await_response(&self.context, receiver).await,
            None => Err(CallError::invalid_operation(
                "Response has already been awaited.",
            )),
        }
    }
}

call_surface!(<Res> UnaryCall);

impl<Res> Drop for UnaryCall<Res> {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Handle for a client-streaming call.
#[derive(Debug)]
pub struct ClientStreamingCall<Req, Res> {
    context: Arc<CallContext>,
    response_rx: Mutex<Option<ResponseReceiver<Res>>>,
    writer: Arc<ClientStreamWriter<Req>>,
}

impl<Req, Res> ClientStreamingCall<Req, Res> {
    /// The request stream writer.
    pub fn request_stream(&self) -> Arc<ClientStreamWriter<Req>> {
        Arc::clone(&self.writer)
    }

    /// Await the single response message. May be awaited once.
    pub async fn response(&self) -> Result<Res, CallError> {
        let receiver = self
            .response_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match receiver {
            Some(receiver) => await_response(&self.context, receiver).await,
            None => Err(CallError::invalid_operation(
                "Response has already been awaited.",
            )),
        }
    }
}

call_surface!(<Req, Res> ClientStreamingCall);

impl<Req, Res> Drop for ClientStreamingCall<Req, Res> {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Handle for a server-streaming call.
#[derive(Debug)]
pub struct ServerStreamingCall<Res> {
    context: Arc<CallContext>,
    reader: Arc<ServerStreamReader<Res>>,
}

impl<Res> ServerStreamingCall<Res> {
    /// The response stream reader.
    pub fn response_stream(&self) -> Arc<ServerStreamReader<Res>> {
        Arc::clone(&self.reader)
    }
}

call_surface!(<Res> ServerStreamingCall);

impl<Res> Drop for ServerStreamingCall<Res> {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Handle for a duplex-streaming call.
#[derive(Debug)]
pub struct DuplexStreamingCall<Req, Res> {
    context: Arc<CallContext>,
    writer: Arc<ClientStreamWriter<Req>>,
    reader: Arc<ServerStreamReader<Res>>,
}

impl<Req, Res> DuplexStreamingCall<Req, Res> {
    /// The request stream writer.
    pub fn request_stream(&self) -> Arc<ClientStreamWriter<Req>> {
        Arc::clone(&self.writer)
    }

    /// The response stream reader.
    pub fn response_stream(&self) -> Arc<ServerStreamReader<Res>> {
        Arc::clone(&self.reader)
    }
}

call_surface!(<Req, Res> DuplexStreamingCall);

impl<Req, Res> Drop for DuplexStreamingCall<Req, Res> {
    fn drop(&mut self) {
        self.dispose();
    }
}
