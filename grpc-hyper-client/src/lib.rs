//! Client-side gRPC call engine over HTTP/2.
//!
//! This crate implements the per-call machinery of a gRPC client: framed
//! requests, response validation with trailers-only and HTTP status
//! handling, length-prefixed message framing with optional per-message
//! compression, deadlines and cancellation, status and trailer surfacing,
//! and the four call shapes behind one invoker. Retry and hedging policies
//! layer on top through the same call surface.
//!
//! The HTTP layer is a narrow seam: [`Transport`](transport::Transport)
//! takes a request and resolves to a response with a streaming,
//! trailers-capable body. [`HyperTransport`](transport::HyperTransport) is
//! the bundled plaintext implementation; TLS, name resolution and load
//! balancing belong to the caller's transport.
//!
//! # Example
//!
//! ```ignore
//! use grpc_hyper_client::{CallOptions, Channel, Method, MethodType};
//! use grpc_hyper_core::Marshaller;
//!
//! let channel = Channel::builder("http://localhost:50051").build()?;
//! let method = Method::new(
//!     MethodType::Unary,
//!     "greet.Greeter",
//!     "SayHello",
//!     Marshaller::prost::<HelloRequest>(),
//!     Marshaller::prost::<HelloReply>(),
//! );
//!
//! let call = channel.invoker().unary(
//!     &method,
//!     CallOptions::new(),
//!     HelloRequest { name: "world".into() },
//! )?;
//! let reply = call.response().await?;
//! let status = call.status()?;
//! ```

mod call;
mod cancellation;
mod channel;
mod credentials;
mod error;
mod frame;
mod invoker;
mod method;
mod options;
mod retry;
mod streaming;
pub mod transport;

pub use cancellation::{CancellationSignal, CancellationSource};
pub use channel::{
    Channel, ChannelBuilder, ChannelError, Clock, DEFAULT_MAX_RECEIVE_MESSAGE_SIZE,
    DEFAULT_MAX_RETRY_ATTEMPTS_LIMIT, SystemClock,
};
pub use credentials::{AuthContext, CallCredentials};
pub use error::CallError;
pub use invoker::{
    CallInvoker, ClientStreamingCall, DuplexStreamingCall, ServerStreamingCall, UnaryCall,
};
pub use method::{Method, MethodType};
pub use options::{CallOptions, WriteOptions};
pub use retry::{
    HedgingPolicy, MethodConfig, MethodName, PolicyError, RetryPolicy, RetryThrottle,
};
pub use streaming::{ClientStreamWriter, ServerStreamReader};

// The protocol-level building blocks live in grpc-hyper-core; the common
// ones are re-exported for convenience.
pub use grpc_hyper_core::{Code, Marshaller, Metadata, Status};
