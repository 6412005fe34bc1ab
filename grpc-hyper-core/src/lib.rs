//! Protocol building blocks for the grpc-hyper client.
//!
//! This crate holds everything below the per-call engine: gRPC status codes
//! and [`Status`], ordered [`Metadata`] with binary (`-bin`) values, the
//! 5-byte length-prefixed message frame, the compression provider registry,
//! `grpc-timeout` encoding, content-type matching and response-header
//! validation, and the marshalling contexts with their buffer pool.
//!
//! The per-call state machine, channel, retry/hedging and transport live in
//! `grpc-hyper-client`.

pub mod compression;
pub mod frame;
pub mod marshal;
pub mod metadata;
pub mod protocol;
pub mod status;
pub mod timeout;

pub use compression::{CompressionProvider, CompressionProviders, GzipProvider, IdentityProvider};
pub use frame::{FRAME_HEADER_SIZE, FrameError, FrameHeader};
pub use marshal::{
    BufferPool, DeserializationContext, MarshalError, Marshaller, PooledBuffer,
    SerializationContext, SerializedMessage,
};
pub use metadata::{BINARY_HEADER_SUFFIX, InvalidMetadata, Metadata, MetadataValue};
pub use protocol::{ResponseValidation, is_grpc_content_type, validate_response_headers};
pub use status::{Code, Status};
pub use timeout::{decode_timeout, encode_timeout};
