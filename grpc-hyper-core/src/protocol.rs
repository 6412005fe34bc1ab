//! Wire constants and response-header validation.

use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{StatusCode, Version};

use crate::metadata::Metadata;
use crate::status::{Code, Status};

/// The gRPC content type without a subtype.
pub const GRPC_CONTENT_TYPE: &str = "application/grpc";

/// `content-type: application/grpc` as a header value.
pub const GRPC_CONTENT_TYPE_VALUE: HeaderValue = HeaderValue::from_static(GRPC_CONTENT_TYPE);

/// `te: trailers`, required on every gRPC request.
pub const TE_TRAILERS: HeaderValue = HeaderValue::from_static("trailers");

pub const GRPC_ENCODING: HeaderName = HeaderName::from_static("grpc-encoding");
pub const GRPC_ACCEPT_ENCODING: HeaderName = HeaderName::from_static("grpc-accept-encoding");
pub const GRPC_TIMEOUT: HeaderName = HeaderName::from_static("grpc-timeout");
pub const GRPC_PREVIOUS_RPC_ATTEMPTS: HeaderName =
    HeaderName::from_static("grpc-previous-rpc-attempts");
pub const GRPC_RETRY_PUSHBACK_MS: HeaderName = HeaderName::from_static("grpc-retry-pushback-ms");

/// Request header translated into `grpc-encoding` by the call engine rather
/// than forwarded as user metadata.
pub const GRPC_INTERNAL_ENCODING_REQUEST: &str = "grpc-internal-encoding-request";

/// Whether a `content-type` value denotes gRPC.
///
/// Accepts the exact type, a parameter list (`application/grpc;…`) or a
/// subtype (`application/grpc+proto`), matching case-insensitively.
pub fn is_grpc_content_type(value: &str) -> bool {
    if value.len() < GRPC_CONTENT_TYPE.len() {
        return false;
    }
    let (prefix, rest) = value.split_at(GRPC_CONTENT_TYPE.len());
    if !prefix.eq_ignore_ascii_case(GRPC_CONTENT_TYPE) {
        return false;
    }
    rest.is_empty() || rest.starts_with(';') || rest.starts_with('+')
}

/// Map a non-200 HTTP status to a gRPC code, per the canonical
/// http-grpc-status mapping.
pub fn code_for_http_status(status: StatusCode) -> Code {
    match status {
        StatusCode::BAD_REQUEST | StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE => Code::Internal,
        StatusCode::UNAUTHORIZED => Code::Unauthenticated,
        StatusCode::FORBIDDEN => Code::PermissionDenied,
        StatusCode::NOT_FOUND => Code::Unimplemented,
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => Code::Unavailable,
        s if s.is_informational() => Code::Internal,
        _ => Code::Unknown,
    }
}

/// Outcome of validating the response head of a call.
#[derive(Debug)]
pub enum ResponseValidation {
    /// The server finished the call in the header block: `grpc-status` was
    /// present, so the headers double as trailers and no body follows.
    TrailersOnly { status: Status, trailers: Metadata },
    /// A well-formed gRPC response; the status arrives in the trailers.
    InProgress,
    /// The response is not a usable gRPC response.
    Failed(Status),
}

/// Validate the head of an HTTP response per the gRPC HTTP/2 protocol.
pub fn validate_response_headers(
    version: Version,
    http_status: StatusCode,
    headers: &HeaderMap,
) -> ResponseValidation {
    // grpc-status in the header block wins over everything else, including a
    // non-200 HTTP status: the server spoke gRPC and finished early.
    if let Some(status) = Status::from_headers(headers) {
        let trailers = Metadata::from_headers_lossy(headers);
        return ResponseValidation::TrailersOnly {
            status: status.with_trailers(trailers.clone()),
            trailers,
        };
    }

    if version < Version::HTTP_2 {
        return ResponseValidation::Failed(Status::internal(format!(
            "Bad gRPC response. Response protocol downgraded to {version:?}."
        )));
    }

    if http_status != StatusCode::OK {
        return ResponseValidation::Failed(Status::new(
            code_for_http_status(http_status),
            format!("Bad gRPC response. HTTP status code: {}", http_status.as_u16()),
        ));
    }

    let Some(content_type) = headers.get(http::header::CONTENT_TYPE) else {
        return ResponseValidation::Failed(Status::cancelled(
            "Bad gRPC response. Response did not have a content-type header.",
        ));
    };

    let content_type_text = String::from_utf8_lossy(content_type.as_bytes());
    if !is_grpc_content_type(&content_type_text) {
        return ResponseValidation::Failed(Status::cancelled(format!(
            "Bad gRPC response. Invalid content-type value: {content_type_text}."
        )));
    }

    ResponseValidation::InProgress
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_variants() {
        assert!(is_grpc_content_type("application/grpc"));
        assert!(is_grpc_content_type("application/grpc;charset=utf-8"));
        assert!(is_grpc_content_type("application/grpc+proto"));
        assert!(is_grpc_content_type("APPLICATION/GRPC+proto"));
        assert!(!is_grpc_content_type("application/json"));
        assert!(!is_grpc_content_type("application/grp"));
        assert!(!is_grpc_content_type("application/grpcx"));
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(code_for_http_status(StatusCode::BAD_REQUEST), Code::Internal);
        assert_eq!(
            code_for_http_status(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE),
            Code::Internal
        );
        assert_eq!(
            code_for_http_status(StatusCode::UNAUTHORIZED),
            Code::Unauthenticated
        );
        assert_eq!(
            code_for_http_status(StatusCode::FORBIDDEN),
            Code::PermissionDenied
        );
        assert_eq!(
            code_for_http_status(StatusCode::NOT_FOUND),
            Code::Unimplemented
        );
        for status in [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT,
        ] {
            assert_eq!(code_for_http_status(status), Code::Unavailable);
        }
        assert_eq!(code_for_http_status(StatusCode::CONTINUE), Code::Internal);
        assert_eq!(code_for_http_status(StatusCode::IM_A_TEAPOT), Code::Unknown);
    }

    #[test]
    fn validation_trailers_only() {
        let mut headers = HeaderMap::new();
        headers.insert("grpc-status", "0".parse().unwrap());
        headers.insert("x-extra", "kept".parse().unwrap());

        match validate_response_headers(Version::HTTP_2, StatusCode::OK, &headers) {
            ResponseValidation::TrailersOnly { status, trailers } => {
                assert_eq!(status.code(), Code::Ok);
                assert_eq!(trailers.get("x-extra"), Some("kept"));
            }
            other => panic!("expected trailers-only, got {other:?}"),
        }
    }

    #[test]
    fn validation_rejects_http1() {
        let headers = HeaderMap::new();
        match validate_response_headers(Version::HTTP_11, StatusCode::OK, &headers) {
            ResponseValidation::Failed(status) => {
                assert_eq!(status.code(), Code::Internal);
                assert!(status.message().contains("protocol downgraded"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn validation_maps_http_status() {
        let headers = HeaderMap::new();
        match validate_response_headers(Version::HTTP_2, StatusCode::FORBIDDEN, &headers) {
            ResponseValidation::Failed(status) => {
                assert_eq!(status.code(), Code::PermissionDenied);
                assert_eq!(status.message(), "Bad gRPC response. HTTP status code: 403");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn validation_requires_content_type() {
        let headers = HeaderMap::new();
        match validate_response_headers(Version::HTTP_2, StatusCode::OK, &headers) {
            ResponseValidation::Failed(status) => {
                assert_eq!(status.code(), Code::Cancelled);
                assert!(status.message().contains("did not have a content-type"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn validation_rejects_non_grpc_content_type() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/json".parse().unwrap());
        match validate_response_headers(Version::HTTP_2, StatusCode::OK, &headers) {
            ResponseValidation::Failed(status) => {
                assert_eq!(status.code(), Code::Cancelled);
                assert!(status.message().contains("application/json"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn validation_accepts_grpc_response() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/grpc".parse().unwrap());
        assert!(matches!(
            validate_response_headers(Version::HTTP_2, StatusCode::OK, &headers),
            ResponseValidation::InProgress
        ));
        // HTTP/3 is fine too.
        assert!(matches!(
            validate_response_headers(Version::HTTP_3, StatusCode::OK, &headers),
            ResponseValidation::InProgress
        ));
    }
}
