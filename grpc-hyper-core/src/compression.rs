//! Per-message compression providers.
//!
//! A [`CompressionProvider`] pairs an encoding name (the `grpc-encoding`
//! token) with compress/decompress operations. [`CompressionProviders`] is
//! the ordered registry a channel consults, with the
//! `grpc-accept-encoding` header value cached at construction.
//!
//! The default registry holds `identity` and gzip at the fastest level.
//! Deflate is deliberately absent: the raw-deflate vs. zlib ambiguity makes
//! it incompatible across implementations.

use std::io;
use std::io::{Read, Write};
use std::sync::Arc;

use bytes::Bytes;
use flate2::Compression as GzipLevel;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

/// Encoding name for the no-op provider.
pub const IDENTITY: &str = "identity";

/// A named per-message compression algorithm.
pub trait CompressionProvider: Send + Sync + 'static {
    /// The `grpc-encoding` token for this provider.
    fn encoding_name(&self) -> &'static str;

    fn compress(&self, data: &[u8]) -> io::Result<Bytes>;

    fn decompress(&self, data: &[u8]) -> io::Result<Bytes>;
}

/// No-op provider. Present in the registry so the accept-encoding list and
/// lookups know the name, but payloads are never run through it.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityProvider;

impl CompressionProvider for IdentityProvider {
    fn encoding_name(&self) -> &'static str {
        IDENTITY
    }

    fn compress(&self, data: &[u8]) -> io::Result<Bytes> {
        Ok(Bytes::copy_from_slice(data))
    }

    fn decompress(&self, data: &[u8]) -> io::Result<Bytes> {
        Ok(Bytes::copy_from_slice(data))
    }
}

/// Gzip provider backed by flate2.
#[derive(Debug, Clone, Copy)]
pub struct GzipProvider {
    /// Compression level, 0-9.
    pub level: u32,
}

impl Default for GzipProvider {
    fn default() -> Self {
        // Fastest level: message compression sits on the latency path.
        Self { level: 1 }
    }
}

impl GzipProvider {
    pub fn with_level(level: u32) -> Self {
        Self {
            level: level.min(9),
        }
    }
}

impl CompressionProvider for GzipProvider {
    fn encoding_name(&self) -> &'static str {
        "gzip"
    }

    fn compress(&self, data: &[u8]) -> io::Result<Bytes> {
        let mut encoder = GzEncoder::new(Vec::new(), GzipLevel::new(self.level));
        encoder.write_all(data)?;
        Ok(Bytes::from(encoder.finish()?))
    }

    fn decompress(&self, data: &[u8]) -> io::Result<Bytes> {
        let mut decoder = GzDecoder::new(data);
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed)?;
        Ok(Bytes::from(decompressed))
    }
}

/// Ordered registry of compression providers.
#[derive(Clone)]
pub struct CompressionProviders {
    providers: Vec<Arc<dyn CompressionProvider>>,
    accept_encoding: String,
}

impl CompressionProviders {
    /// Build a registry from an ordered provider list. The
    /// `grpc-accept-encoding` value is cached here as
    /// `identity[,<name>...]`.
    pub fn new(providers: Vec<Arc<dyn CompressionProvider>>) -> Self {
        let mut accept_encoding = String::from(IDENTITY);
        for provider in &providers {
            if provider.encoding_name() != IDENTITY {
                accept_encoding.push(',');
                accept_encoding.push_str(provider.encoding_name());
            }
        }
        Self {
            providers,
            accept_encoding,
        }
    }

    /// Look up a provider by encoding name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn CompressionProvider>> {
        self.providers
            .iter()
            .find(|provider| provider.encoding_name() == name)
    }

    /// Whether a non-identity provider exists for `name`.
    pub fn supports_compression(&self, name: &str) -> bool {
        name != IDENTITY && self.get(name).is_some()
    }

    /// The cached `grpc-accept-encoding` header value.
    pub fn accept_encoding(&self) -> &str {
        &self.accept_encoding
    }
}

impl Default for CompressionProviders {
    fn default() -> Self {
        CompressionProviders::new(vec![
            Arc::new(IdentityProvider),
            Arc::new(GzipProvider::default()),
        ])
    }
}

impl std::fmt::Debug for CompressionProviders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressionProviders")
            .field(
                "providers",
                &self
                    .providers
                    .iter()
                    .map(|p| p.encoding_name())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}
