//! Marshalling contexts and the message buffer pool.
//!
//! A [`Marshaller`] bridges user message types and the framed codec through
//! two contexts. The serialization context is a small state machine driven
//! by the marshaller:
//!
//! ```text
//! Initialized -> CompleteArray
//! Initialized -> IncompleteBufferWriter -> CompleteBufferWriter
//! ```
//!
//! A marshaller either hands over a precomputed byte array via
//! [`SerializationContext::complete`], or writes through the buffer-writer
//! interface, optionally declaring the payload size up front with
//! [`SerializationContext::set_payload_length`]. The size hint enables the
//! direct-write path: when the message will not be compressed, the frame
//! header is written inline and the payload lands directly behind it.
//!
//! Buffers are rented from a shared [`BufferPool`] and returned exactly once
//! by a guard, including when a call is torn down mid-serialization.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use bytes::{BufMut, Bytes, BytesMut};

use crate::frame::{FRAME_HEADER_SIZE, encode_frame_header};

const MAX_POOLED_BUFFERS: usize = 32;
const MAX_POOLED_CAPACITY: usize = 1 << 20;

/// Errors produced by the marshalling contexts and marshallers.
#[derive(Debug, thiserror::Error)]
pub enum MarshalError {
    #[error("serialization context is in an invalid state for {operation}")]
    InvalidState { operation: &'static str },
    #[error("declared payload length {declared} differs from written payload length {written}")]
    PayloadLengthMismatch { declared: usize, written: usize },
    #[error("{0}")]
    Message(String),
}

/// A thread-safe pool of message buffers.
#[derive(Debug, Default)]
pub struct BufferPool {
    buffers: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new() -> Arc<Self> {
        Arc::new(BufferPool::default())
    }

    /// Rent a buffer with at least `capacity` bytes available.
    pub fn rent(self: &Arc<Self>, capacity: usize) -> PooledBuffer {
        let mut buffer = {
            let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
            buffers.pop().unwrap_or_default()
        };
        buffer.reserve(capacity);
        PooledBuffer {
            pool: Arc::clone(self),
            buffer: Some(buffer),
        }
    }

    fn give_back(&self, buffer: BytesMut) {
        if buffer.capacity() > MAX_POOLED_CAPACITY {
            return;
        }
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        if buffers.len() < MAX_POOLED_BUFFERS {
            buffers.push(buffer);
        }
    }

    #[cfg(test)]
    fn pooled_count(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }
}

/// A buffer lease. Dropping the guard clears the buffer and returns it to
/// the pool; the `Option` take makes a double return impossible.
#[derive(Debug)]
pub struct PooledBuffer {
    pool: Arc<BufferPool>,
    buffer: Option<BytesMut>,
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        self.buffer.as_ref().expect("buffer present until drop")
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buffer.as_mut().expect("buffer present until drop")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(mut buffer) = self.buffer.take() {
            buffer.clear();
            self.pool.give_back(buffer);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SerializationState {
    Initialized,
    CompleteArray,
    IncompleteBufferWriter,
    CompleteBufferWriter,
}

/// The finished output of a serialization context.
pub struct SerializedMessage {
    /// The serialized bytes: the bare payload, or a complete frame when the
    /// direct-write path was taken.
    pub bytes: Bytes,
    /// Whether `bytes` already carries the 5-byte frame header.
    pub framed: bool,
    /// Length of the payload, excluding any frame header.
    pub payload_length: usize,
}

/// Buffer-pooled serialization state machine handed to request marshallers.
pub struct SerializationContext {
    state: SerializationState,
    buffer: PooledBuffer,
    payload_length: Option<usize>,
    direct_frame: bool,
    frame_written: bool,
}

impl SerializationContext {
    /// Create a context. `direct_frame` is set by the codec when the message
    /// will be written uncompressed, allowing the frame header to be emitted
    /// inline as soon as the payload length is known.
    pub fn new(pool: &Arc<BufferPool>, direct_frame: bool) -> Self {
        SerializationContext {
            state: SerializationState::Initialized,
            buffer: pool.rent(FRAME_HEADER_SIZE),
            payload_length: None,
            direct_frame,
            frame_written: false,
        }
    }

    /// Declare the exact payload length before writing.
    ///
    /// Only honored before the first write; afterwards the hint is ignored
    /// and the slow path assembles the frame separately.
    pub fn set_payload_length(&mut self, length: usize) {
        if self.state != SerializationState::Initialized {
            return;
        }
        self.payload_length = Some(length);
        if self.direct_frame && !self.frame_written {
            self.buffer
                .put_slice(&encode_frame_header(false, length as u32));
            self.frame_written = true;
        }
    }

    /// Supply the entire payload as one array.
    pub fn complete(&mut self, payload: &[u8]) -> Result<(), MarshalError> {
        if self.state != SerializationState::Initialized {
            return Err(MarshalError::InvalidState {
                operation: "complete",
            });
        }
        self.buffer.put_slice(payload);
        self.state = SerializationState::CompleteArray;
        Ok(())
    }

    /// Borrow the underlying buffer writer.
    pub fn buffer_writer(&mut self) -> Result<&mut BytesMut, MarshalError> {
        match self.state {
            SerializationState::Initialized | SerializationState::IncompleteBufferWriter => {
                self.state = SerializationState::IncompleteBufferWriter;
                if let Some(length) = self.payload_length {
                    self.buffer.reserve(length);
                }
                Ok(&mut self.buffer)
            }
            _ => Err(MarshalError::InvalidState {
                operation: "buffer_writer",
            }),
        }
    }

    /// Mark buffer-writer serialization as finished.
    pub fn complete_buffer_writer(&mut self) -> Result<(), MarshalError> {
        if self.state != SerializationState::IncompleteBufferWriter {
            return Err(MarshalError::InvalidState {
                operation: "complete_buffer_writer",
            });
        }
        self.state = SerializationState::CompleteBufferWriter;
        Ok(())
    }

    /// Take the serialized output. The pooled buffer is copied out and
    /// returned to the pool when the context drops.
    pub fn finish(self) -> Result<SerializedMessage, MarshalError> {
        match self.state {
            SerializationState::CompleteArray | SerializationState::CompleteBufferWriter => {}
            _ => {
                return Err(MarshalError::InvalidState { operation: "finish" });
            }
        }
        let header_len = if self.frame_written { FRAME_HEADER_SIZE } else { 0 };
        let payload_length = self.buffer.len() - header_len;
        if let Some(declared) = self.payload_length {
            if declared != payload_length {
                return Err(MarshalError::PayloadLengthMismatch {
                    declared,
                    written: payload_length,
                });
            }
        }
        Ok(SerializedMessage {
            bytes: Bytes::copy_from_slice(&self.buffer),
            framed: self.frame_written,
            payload_length,
        })
    }
}

/// Owns the decompressed payload of a received message for the duration of
/// the marshaller call; the backing memory is released when the context is
/// dropped.
pub struct DeserializationContext {
    payload: Bytes,
}

impl DeserializationContext {
    pub fn new(payload: Bytes) -> Self {
        DeserializationContext { payload }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_length(&self) -> usize {
        self.payload.len()
    }

    pub fn into_bytes(self) -> Bytes {
        self.payload
    }
}

type SerializeFn<T> = dyn Fn(&T, &mut SerializationContext) -> Result<(), MarshalError> + Send + Sync;
type DeserializeFn<T> = dyn Fn(DeserializationContext) -> Result<T, MarshalError> + Send + Sync;

/// A pair of contextual message codecs for one message type.
pub struct Marshaller<T> {
    serializer: Arc<SerializeFn<T>>,
    deserializer: Arc<DeserializeFn<T>>,
}

impl<T> Clone for Marshaller<T> {
    fn clone(&self) -> Self {
        Marshaller {
            serializer: Arc::clone(&self.serializer),
            deserializer: Arc::clone(&self.deserializer),
        }
    }
}

impl<T> std::fmt::Debug for Marshaller<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Marshaller").finish_non_exhaustive()
    }
}

impl<T> Marshaller<T> {
    pub fn new(
        serializer: impl Fn(&T, &mut SerializationContext) -> Result<(), MarshalError>
        + Send
        + Sync
        + 'static,
        deserializer: impl Fn(DeserializationContext) -> Result<T, MarshalError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Marshaller {
            serializer: Arc::new(serializer),
            deserializer: Arc::new(deserializer),
        }
    }

    pub fn serialize(
        &self,
        message: &T,
        context: &mut SerializationContext,
    ) -> Result<(), MarshalError> {
        (self.serializer)(message, context)
    }

    pub fn deserialize(&self, context: DeserializationContext) -> Result<T, MarshalError> {
        (self.deserializer)(context)
    }
}

impl<T> Marshaller<T>
where
    T: prost::Message + Default + 'static,
{
    /// Marshaller for protobuf messages. Uses the length hint so
    /// uncompressed messages take the direct-write path.
    pub fn prost() -> Self {
        Marshaller::new(
            |message: &T, context: &mut SerializationContext| {
                context.set_payload_length(message.encoded_len());
                let writer = context.buffer_writer()?;
                message
                    .encode(writer)
                    .map_err(|err| MarshalError::Message(err.to_string()))?;
                context.complete_buffer_writer()
            },
            |context: DeserializationContext| {
                T::decode(context.payload()).map_err(|err| MarshalError::Message(err.to_string()))
            },
        )
    }
}

impl Marshaller<Bytes> {
    /// Pass-through marshaller for raw payloads.
    pub fn bytes() -> Self {
        Marshaller::new(
            |message: &Bytes, context: &mut SerializationContext| context.complete(message),
            |context: DeserializationContext| Ok(context.into_bytes()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_array_path() {
        let pool = BufferPool::new();
        let mut context = SerializationContext::new(&pool, false);
        context.complete(b"payload").unwrap();

        let message = context.finish().unwrap();
        assert!(!message.framed);
        assert_eq!(message.payload_length, 7);
        assert_eq!(&message.bytes[..], b"payload");
    }

    #[test]
    fn direct_frame_path_writes_header_inline() {
        let pool = BufferPool::new();
        let mut context = SerializationContext::new(&pool, true);
        context.set_payload_length(5);
        context.buffer_writer().unwrap().put_slice(b"hello");
        context.complete_buffer_writer().unwrap();

        let message = context.finish().unwrap();
        assert!(message.framed);
        assert_eq!(message.payload_length, 5);
        assert_eq!(message.bytes[0], 0x00);
        assert_eq!(
            u32::from_be_bytes([
                message.bytes[1],
                message.bytes[2],
                message.bytes[3],
                message.bytes[4]
            ]),
            5
        );
        assert_eq!(&message.bytes[5..], b"hello");
    }

    #[test]
    fn hint_without_direct_frame_stays_unframed() {
        let pool = BufferPool::new();
        let mut context = SerializationContext::new(&pool, false);
        context.set_payload_length(5);
        context.buffer_writer().unwrap().put_slice(b"hello");
        context.complete_buffer_writer().unwrap();

        let message = context.finish().unwrap();
        assert!(!message.framed);
        assert_eq!(&message.bytes[..], b"hello");
    }

    #[test]
    fn invalid_transitions_fail_fast() {
        let pool = BufferPool::new();

        let mut context = SerializationContext::new(&pool, false);
        context.complete(b"x").unwrap();
        assert!(matches!(
            context.complete(b"y"),
            Err(MarshalError::InvalidState { .. })
        ));
        assert!(matches!(
            context.buffer_writer(),
            Err(MarshalError::InvalidState { .. })
        ));

        let context = SerializationContext::new(&pool, false);
        assert!(matches!(
            context.finish(),
            Err(MarshalError::InvalidState { .. })
        ));

        let mut context = SerializationContext::new(&pool, false);
        assert!(matches!(
            context.complete_buffer_writer(),
            Err(MarshalError::InvalidState { .. })
        ));
    }

    #[test]
    fn length_hint_mismatch_is_rejected() {
        let pool = BufferPool::new();
        let mut context = SerializationContext::new(&pool, false);
        context.set_payload_length(3);
        context.buffer_writer().unwrap().put_slice(b"toolong");
        context.complete_buffer_writer().unwrap();
        assert!(matches!(
            context.finish(),
            Err(MarshalError::PayloadLengthMismatch {
                declared: 3,
                written: 7
            })
        ));
    }

    #[test]
    fn pooled_buffers_return_exactly_once() {
        let pool = BufferPool::new();
        {
            let _a = pool.rent(16);
            let _b = pool.rent(16);
            assert_eq!(pool.pooled_count(), 0);
        }
        assert_eq!(pool.pooled_count(), 2);

        // Reuse drains the pool again.
        let lease = pool.rent(16);
        assert_eq!(pool.pooled_count(), 1);
        drop(lease);
        assert_eq!(pool.pooled_count(), 2);
    }

    #[test]
    fn dropping_mid_serialization_still_returns_buffer() {
        let pool = BufferPool::new();
        {
            let mut context = SerializationContext::new(&pool, false);
            let _ = context.buffer_writer().unwrap().put_slice(b"partial");
            // Dropped without finish: simulates cancellation during write.
        }
        assert_eq!(pool.pooled_count(), 1);
    }

    #[test]
    fn bytes_marshaller_round_trip() {
        let pool = BufferPool::new();
        let marshaller = Marshaller::bytes();

        let mut context = SerializationContext::new(&pool, false);
        marshaller
            .serialize(&Bytes::from_static(b"abc"), &mut context)
            .unwrap();
        let message = context.finish().unwrap();

        let decoded = marshaller
            .deserialize(DeserializationContext::new(message.bytes))
            .unwrap();
        assert_eq!(&decoded[..], b"abc");
    }

    #[test]
    fn deserialization_context_exposes_payload() {
        let context = DeserializationContext::new(Bytes::from_static(b"xyz"));
        assert_eq!(context.payload(), b"xyz");
        assert_eq!(context.payload_length(), 3);
    }
}
