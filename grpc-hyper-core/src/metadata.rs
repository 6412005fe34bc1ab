//! Custom call metadata.
//!
//! [`Metadata`] is an ordered sequence of name/value entries. Names are
//! ASCII and compared case-insensitively; a name ending in `-bin` carries an
//! opaque byte value, base64-encoded on the wire. Duplicate names are
//! allowed and order is preserved.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};

/// Suffix marking a metadata entry as binary-valued.
pub const BINARY_HEADER_SUFFIX: &str = "-bin";

/// Headers owned by the gRPC protocol itself, filtered out of user metadata.
const RESERVED_HEADERS: &[&str] = &[
    "grpc-status",
    "grpc-message",
    "grpc-encoding",
    "grpc-accept-encoding",
    "content-encoding",
    "content-type",
];

/// A single metadata value: UTF-8 text, or raw bytes for `-bin` entries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetadataValue {
    Ascii(String),
    Binary(Bytes),
}

/// Error produced when headers cannot be converted into [`Metadata`].
#[derive(Debug, thiserror::Error)]
pub enum InvalidMetadata {
    #[error("invalid base64 in binary header {name:?}: {reason}")]
    InvalidBase64 { name: String, reason: String },
    #[error("metadata value for {name:?} is not valid UTF-8")]
    InvalidUtf8 { name: String },
}

/// Ordered, duplicate-preserving call metadata.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Metadata {
    entries: Vec<(String, MetadataValue)>,
}

impl Metadata {
    pub fn new() -> Self {
        Metadata::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an ASCII entry.
    ///
    /// # Panics
    ///
    /// Panics if the name is not a valid header name or carries the binary
    /// suffix. Use [`Metadata::try_add`] for dynamically built names and
    /// [`Metadata::add_binary`] for `-bin` entries.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let name = normalize_name(name.into());
        assert!(
            !name.ends_with(BINARY_HEADER_SUFFIX),
            "binary metadata must be added with add_binary"
        );
        self.entries.push((name, MetadataValue::Ascii(value.into())));
        self
    }

    /// Try to append an ASCII entry.
    ///
    /// Returns `None`, leaving the metadata unchanged, when the name is not
    /// a valid header name, carries the binary suffix, or the value cannot
    /// be carried in a header.
    pub fn try_add(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Option<&mut Self> {
        let name = checked_name(&name.into())?;
        if name.ends_with(BINARY_HEADER_SUFFIX) {
            return None;
        }
        let value = value.into();
        HeaderValue::try_from(value.as_str()).ok()?;
        self.entries.push((name, MetadataValue::Ascii(value)));
        Some(self)
    }

    /// Append a binary entry. The name must end with `-bin`.
    ///
    /// # Panics
    ///
    /// Panics if the name is not a valid header name or lacks the binary
    /// suffix. Use [`Metadata::try_add_binary`] for dynamically built names.
    pub fn add_binary(&mut self, name: impl Into<String>, value: impl Into<Bytes>) -> &mut Self {
        let name = normalize_name(name.into());
        assert!(
            name.ends_with(BINARY_HEADER_SUFFIX),
            "binary metadata names must end with {BINARY_HEADER_SUFFIX:?}"
        );
        self.entries.push((name, MetadataValue::Binary(value.into())));
        self
    }

    /// Try to append a binary entry.
    ///
    /// Returns `None`, leaving the metadata unchanged, when the name is not
    /// a valid header name or lacks the binary suffix.
    pub fn try_add_binary(
        &mut self,
        name: impl Into<String>,
        value: impl Into<Bytes>,
    ) -> Option<&mut Self> {
        let name = checked_name(&name.into())?;
        if !name.ends_with(BINARY_HEADER_SUFFIX) {
            return None;
        }
        self.entries.push((name, MetadataValue::Binary(value.into())));
        Some(self)
    }

    /// First ASCII value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.iter().find_map(|(key, value)| {
            if key.eq_ignore_ascii_case(name) {
                match value {
                    MetadataValue::Ascii(text) => Some(text.as_str()),
                    MetadataValue::Binary(_) => None,
                }
            } else {
                None
            }
        })
    }

    /// First binary value for `name`, if any.
    pub fn get_binary(&self, name: &str) -> Option<&Bytes> {
        self.iter().find_map(|(key, value)| {
            if key.eq_ignore_ascii_case(name) {
                match value {
                    MetadataValue::Binary(bytes) => Some(bytes),
                    MetadataValue::Ascii(_) => None,
                }
            } else {
                None
            }
        })
    }

    /// All values for `name`, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a MetadataValue> {
        self.iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, MetadataValue)> {
        self.entries.iter()
    }

    /// Build user-visible metadata from response headers or trailers.
    ///
    /// Pseudo-headers, gRPC protocol headers, `content-encoding` and
    /// `content-type` are dropped; remaining multi-valued headers are kept in
    /// order and `-bin` values are base64-decoded.
    pub fn from_headers(headers: &HeaderMap) -> Result<Metadata, InvalidMetadata> {
        let mut metadata = Metadata::new();
        for (name, value) in headers.iter() {
            let name = name.as_str();
            if name.starts_with(':') || RESERVED_HEADERS.contains(&name) {
                continue;
            }
            if name.ends_with(BINARY_HEADER_SUFFIX) {
                let decoded = parse_binary_header(value.as_bytes()).map_err(|reason| {
                    InvalidMetadata::InvalidBase64 {
                        name: name.to_owned(),
                        reason,
                    }
                })?;
                metadata
                    .entries
                    .push((name.to_owned(), MetadataValue::Binary(decoded)));
            } else {
                let text = value
                    .to_str()
                    .map_err(|_| InvalidMetadata::InvalidUtf8 {
                        name: name.to_owned(),
                    })?
                    .to_owned();
                metadata
                    .entries
                    .push((name.to_owned(), MetadataValue::Ascii(text)));
            }
        }
        Ok(metadata)
    }

    /// Like [`Metadata::from_headers`], but a parse failure is logged and an
    /// empty instance returned so status assembly can never deadlock on bad
    /// trailers.
    pub fn from_headers_lossy(headers: &HeaderMap) -> Metadata {
        match Metadata::from_headers(headers) {
            Ok(metadata) => metadata,
            Err(err) => {
                tracing::warn!("error parsing metadata from headers: {err}");
                Metadata::new()
            }
        }
    }

    /// Append these entries to an outgoing header map, skipping `reserved`
    /// names. Invalid values are logged and skipped rather than failing the
    /// whole request.
    pub fn append_to_headers(&self, headers: &mut HeaderMap, reserved: &[&str]) {
        for (name, value) in self.iter() {
            if reserved.iter().any(|r| name.eq_ignore_ascii_case(r)) {
                continue;
            }
            let Ok(header_name) = HeaderName::try_from(name.as_str()) else {
                tracing::warn!("skipping metadata entry with invalid name {name:?}");
                continue;
            };
            let header_value = match value {
                MetadataValue::Ascii(text) => HeaderValue::try_from(text.as_str()),
                MetadataValue::Binary(bytes) => HeaderValue::try_from(BASE64.encode(bytes)),
            };
            match header_value {
                Ok(header_value) => {
                    headers.append(header_name, header_value);
                }
                Err(_) => {
                    tracing::warn!("skipping metadata entry {name:?} with invalid value");
                }
            }
        }
    }
}

fn normalize_name(name: String) -> String {
    match checked_name(&name) {
        Some(normalized) => normalized,
        None => panic!("invalid metadata name {name:?}"),
    }
}

/// Lowercase and validate a metadata name, or `None` if it cannot be a
/// header name.
fn checked_name(name: &str) -> Option<String> {
    let normalized = name.to_ascii_lowercase();
    HeaderName::try_from(normalized.as_str()).ok()?;
    Some(normalized)
}

/// Decode a base64 binary header value, tolerating missing padding.
///
/// Per the gRPC wire spec senders may omit base64 padding, so the value is
/// re-padded based on `len % 4` before decoding; a remainder of 1 can never
/// be valid base64.
pub fn parse_binary_header(value: &[u8]) -> Result<Bytes, String> {
    let mut padded = Vec::with_capacity(value.len() + 2);
    padded.extend_from_slice(value);
    match value.len() % 4 {
        0 => {}
        2 => padded.extend_from_slice(b"=="),
        3 => padded.push(b'='),
        _ => return Err("invalid base64 length".to_owned()),
    }
    BASE64
        .decode(&padded)
        .map(Bytes::from)
        .map_err(|err| err.to_string())
}
