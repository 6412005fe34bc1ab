//! gRPC length-prefixed message framing.
//!
//! Every message on an HTTP/2 body is wrapped in a frame:
//!
//! ```text
//! [flags:1][length:4, big-endian][payload:length]
//! ```
//!
//! Bit 0 of `flags` marks a compressed payload. All other bits are reserved:
//! they must be zero on send, and any other value received is a protocol
//! error.

use bytes::{BufMut, Bytes, BytesMut};

/// Frame header size: one flag byte plus a u32 length.
pub const FRAME_HEADER_SIZE: usize = 5;

/// Frame flag values.
pub mod frame_flags {
    /// Uncompressed message.
    pub const UNCOMPRESSED: u8 = 0x00;
    /// Message compressed with the negotiated `grpc-encoding`.
    pub const COMPRESSED: u8 = 0x01;
}

/// Errors produced while parsing frame headers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("incomplete frame header: expected {expected} bytes, got {actual}")]
    IncompleteHeader { expected: usize, actual: usize },
    #[error("unexpected compressed flag value in message header: 0x{0:02x}")]
    InvalidFlags(u8),
}

/// A parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub compressed: bool,
    pub length: u32,
}

/// Parse a frame header from the start of `data`.
pub fn parse_frame_header(data: &[u8]) -> Result<FrameHeader, FrameError> {
    if data.len() < FRAME_HEADER_SIZE {
        return Err(FrameError::IncompleteHeader {
            expected: FRAME_HEADER_SIZE,
            actual: data.len(),
        });
    }
    let compressed = match data[0] {
        frame_flags::UNCOMPRESSED => false,
        frame_flags::COMPRESSED => true,
        other => return Err(FrameError::InvalidFlags(other)),
    };
    let length = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
    Ok(FrameHeader { compressed, length })
}

/// Encode a frame header into a 5-byte array.
pub fn encode_frame_header(compressed: bool, length: u32) -> [u8; FRAME_HEADER_SIZE] {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    header[0] = if compressed {
        frame_flags::COMPRESSED
    } else {
        frame_flags::UNCOMPRESSED
    };
    header[1..].copy_from_slice(&length.to_be_bytes());
    header
}

/// Wrap a payload in a complete frame.
pub fn wrap_frame(payload: &[u8], compressed: bool) -> Bytes {
    let mut frame = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.put_slice(&encode_frame_header(compressed, payload.len() as u32));
    frame.put_slice(payload);
    frame.freeze()
}
