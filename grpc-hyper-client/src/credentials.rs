//! Per-call credential seam.
//!
//! Credential providers asynchronously contribute metadata (typically an
//! `authorization` header) before a request is sent. The engine never
//! invokes them over an insecure transport.

use futures::future::BoxFuture;
use http::Uri;

use grpc_hyper_core::Metadata;

use crate::transport::BoxError;

/// Context handed to a credential provider.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// `scheme://authority/service/`, with a default `:443` stripped for
    /// https addresses.
    pub service_url: String,
    /// The bare method name being invoked.
    pub method_name: String,
}

/// A source of per-call authorization metadata.
///
/// Channel-level credentials run first, in registration order, followed by
/// the per-call credentials from [`CallOptions`](crate::CallOptions).
pub trait CallCredentials: Send + Sync + 'static {
    /// Produce metadata to append to the request. Errors are resolved into
    /// the call's status through the transport error mapping.
    fn get_metadata<'a>(
        &'a self,
        context: &'a AuthContext,
    ) -> BoxFuture<'a, Result<Metadata, BoxError>>;
}

/// Build the credential context URL for a method.
pub fn auth_context(base: &Uri, service_name: &str, method_name: &str) -> AuthContext {
    let scheme = base.scheme_str().unwrap_or("https");
    let mut authority = base
        .authority()
        .map(|a| a.as_str())
        .unwrap_or_default()
        .to_owned();
    if scheme == "https" {
        if let Some(stripped) = authority.strip_suffix(":443") {
            authority = stripped.to_owned();
        }
    }
    AuthContext {
        service_url: format!("{scheme}://{authority}/{service_name}/"),
        method_name: method_name.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_default_https_port() {
        let base: Uri = "https://example.com:443".parse().unwrap();
        let context = auth_context(&base, "greet.Greeter", "SayHello");
        assert_eq!(context.service_url, "https://example.com/greet.Greeter/");
        assert_eq!(context.method_name, "SayHello");
    }

    #[test]
    fn keeps_explicit_ports() {
        let base: Uri = "https://example.com:8443".parse().unwrap();
        let context = auth_context(&base, "svc", "M");
        assert_eq!(context.service_url, "https://example.com:8443/svc/");

        let base: Uri = "http://example.com:443".parse().unwrap();
        let context = auth_context(&base, "svc", "M");
        assert_eq!(context.service_url, "http://example.com:443/svc/");
    }
}
