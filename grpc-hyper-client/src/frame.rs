//! Framed message encode/decode against transport bodies.
//!
//! The write path serializes a message through its marshaller, applies the
//! per-message compression decision, enforces the send-size limit and
//! produces one complete frame. The read path, [`FrameReader`], buffers an
//! HTTP response body incrementally, yields decompressed payloads one frame
//! at a time, and captures the trailers frame for status assembly.

use std::error::Error;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::HeaderMap;
use http_body_util::BodyExt;

use grpc_hyper_core::compression::{CompressionProviders, IDENTITY};
use grpc_hyper_core::frame::{FRAME_HEADER_SIZE, parse_frame_header, wrap_frame};
use grpc_hyper_core::marshal::{BufferPool, Marshaller, SerializationContext};
use grpc_hyper_core::{Code, Status};

use crate::error::status_from_transport_error;
use crate::options::WriteOptions;
use crate::transport::ResponseBody;

/// Serialize one message into a complete frame.
///
/// Compression applies only when the call negotiated a non-identity
/// `grpc-encoding` with a known provider and the write options do not
/// suppress it. The send-size limit is enforced on the serialized payload
/// before compression. When the marshaller declares the payload length and
/// no compression applies, the frame header is written inline and the
/// payload is serialized directly behind it.
pub(crate) fn encode_message<T>(
    message: &T,
    marshaller: &Marshaller<T>,
    pool: &Arc<BufferPool>,
    encoding: Option<&str>,
    providers: &CompressionProviders,
    write_options: WriteOptions,
    max_send_size: Option<usize>,
) -> Result<Bytes, Status> {
    let provider = match encoding {
        Some(name) if !write_options.no_compress && name != IDENTITY => providers.get(name).cloned(),
        _ => None,
    };
    let compress = provider.is_some();

    let mut context = SerializationContext::new(pool, !compress);
    marshaller
        .serialize(message, &mut context)
        .map_err(|err| Status::internal(format!("Error serializing request message: {err}")))?;
    let serialized = context
        .finish()
        .map_err(|err| Status::internal(format!("Error serializing request message: {err}")))?;

    if let Some(max) = max_send_size {
        if serialized.payload_length > max {
            return Err(Status::resource_exhausted(
                "Sending message exceeds the maximum configured message size.",
            ));
        }
    }

    if serialized.framed {
        return Ok(serialized.bytes);
    }

    if let Some(provider) = provider {
        let compressed = provider
            .compress(&serialized.bytes)
            .map_err(|err| Status::internal(format!("Error compressing message: {err}")))?;
        Ok(wrap_frame(&compressed, true))
    } else {
        Ok(wrap_frame(&serialized.bytes, false))
    }
}

/// Incremental frame reader over a response body.
pub(crate) struct FrameReader {
    body: ResponseBody,
    buffer: BytesMut,
    trailers: Option<HeaderMap>,
    eos: bool,
}

impl FrameReader {
    pub fn new(body: ResponseBody) -> Self {
        FrameReader {
            body,
            buffer: BytesMut::new(),
            trailers: None,
            eos: false,
        }
    }

    /// The trailers frame, once the body has ended.
    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.trailers.as_ref()
    }

    /// Read the next message payload, decompressed.
    ///
    /// Returns `Ok(None)` at a clean end of stream. Every protocol violation
    /// maps to the status the caller surfaces unchanged.
    pub async fn next_message(
        &mut self,
        encoding: Option<&str>,
        providers: &CompressionProviders,
        max_receive_size: Option<usize>,
    ) -> Result<Option<Bytes>, Status> {
        loop {
            if self.buffer.len() >= FRAME_HEADER_SIZE {
                let header = parse_frame_header(&self.buffer)
                    .map_err(|err| Status::internal(err.to_string()))?;
                let length = header.length as usize;

                if let Some(max) = max_receive_size {
                    if length > max {
                        return Err(Status::resource_exhausted(
                            "Received message exceeds the maximum configured message size.",
                        ));
                    }
                }

                if self.buffer.len() >= FRAME_HEADER_SIZE + length {
                    let mut frame = self.buffer.split_to(FRAME_HEADER_SIZE + length);
                    let payload = frame.split_off(FRAME_HEADER_SIZE).freeze();
                    let payload = if header.compressed {
                        decompress_payload(payload, encoding, providers)?
                    } else {
                        payload
                    };
                    return Ok(Some(payload));
                }
            }

            if self.eos {
                return self.end_of_stream();
            }

            match self.body.frame().await {
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(data) => self.buffer.extend_from_slice(&data),
                    Err(frame) => {
                        if let Ok(trailers) = frame.into_trailers() {
                            self.trailers = Some(trailers);
                        }
                    }
                },
                Some(Err(err)) => {
                    self.eos = true;
                    let err: &(dyn Error + 'static) = err.as_ref();
                    return Err(status_from_transport_error(err));
                }
                None => {
                    self.eos = true;
                }
            }
        }
    }

    fn end_of_stream(&self) -> Result<Option<Bytes>, Status> {
        if self.buffer.is_empty() {
            Ok(None)
        } else if self.buffer.len() < FRAME_HEADER_SIZE {
            Err(Status::internal(
                "Unexpected end of content while reading the message header.",
            ))
        } else {
            Err(Status::internal(
                "Unexpected end of content while reading the message.",
            ))
        }
    }
}

fn decompress_payload(
    payload: Bytes,
    encoding: Option<&str>,
    providers: &CompressionProviders,
) -> Result<Bytes, Status> {
    let Some(name) = encoding else {
        return Err(Status::internal(
            "Request did not include grpc-encoding value with compressed message.",
        ));
    };
    if name == IDENTITY {
        return Err(Status::internal(
            "Request sent 'identity' grpc-encoding value with compressed message.",
        ));
    }
    let Some(provider) = providers.get(name) else {
        return Err(Status::new(
            Code::Unimplemented,
            format!(
                "Unsupported grpc-encoding value '{name}'. Supported encodings: {}",
                providers.accept_encoding()
            ),
        ));
    };
    // Decompressed payloads land in a fresh buffer owned by the
    // deserialization context.
    provider
        .decompress(&payload)
        .map_err(|err| Status::internal(format!("Error decompressing message: {err}")))
}
