//! Method descriptors.

use grpc_hyper_core::Marshaller;

/// The four gRPC call shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodType {
    Unary,
    ClientStreaming,
    ServerStreaming,
    DuplexStreaming,
}

impl MethodType {
    /// Whether the response side is a message stream.
    pub fn has_response_stream(&self) -> bool {
        matches!(self, MethodType::ServerStreaming | MethodType::DuplexStreaming)
    }

    /// Whether the request side is a message stream.
    pub fn has_request_stream(&self) -> bool {
        matches!(self, MethodType::ClientStreaming | MethodType::DuplexStreaming)
    }
}

/// A description of one service method: names, shape, and the marshallers
/// for its request and response messages. Generated stubs construct these
/// once and reuse them for every call.
pub struct Method<Req, Res> {
    method_type: MethodType,
    service_name: String,
    method_name: String,
    full_name: String,
    request_marshaller: Marshaller<Req>,
    response_marshaller: Marshaller<Res>,
}

impl<Req, Res> Method<Req, Res> {
    pub fn new(
        method_type: MethodType,
        service_name: impl Into<String>,
        method_name: impl Into<String>,
        request_marshaller: Marshaller<Req>,
        response_marshaller: Marshaller<Res>,
    ) -> Self {
        let service_name = service_name.into();
        let method_name = method_name.into();
        let full_name = format!("{service_name}/{method_name}");
        Method {
            method_type,
            service_name,
            method_name,
            full_name,
            request_marshaller,
            response_marshaller,
        }
    }

    pub fn method_type(&self) -> MethodType {
        self.method_type
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    /// `Service/Method`, without the leading slash.
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    /// The request path, `/Service/Method`.
    pub fn path(&self) -> String {
        format!("/{}", self.full_name)
    }

    pub fn request_marshaller(&self) -> &Marshaller<Req> {
        &self.request_marshaller
    }

    pub fn response_marshaller(&self) -> &Marshaller<Res> {
        &self.response_marshaller
    }
}

impl<Req, Res> Clone for Method<Req, Res> {
    fn clone(&self) -> Self {
        Method {
            method_type: self.method_type,
            service_name: self.service_name.clone(),
            method_name: self.method_name.clone(),
            full_name: self.full_name.clone(),
            request_marshaller: self.request_marshaller.clone(),
            response_marshaller: self.response_marshaller.clone(),
        }
    }
}

impl<Req, Res> std::fmt::Debug for Method<Req, Res> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("method_type", &self.method_type)
            .field("full_name", &self.full_name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn names_and_path() {
        let method = Method::new(
            MethodType::Unary,
            "greet.Greeter",
            "SayHello",
            Marshaller::<Bytes>::bytes(),
            Marshaller::<Bytes>::bytes(),
        );
        assert_eq!(method.full_name(), "greet.Greeter/SayHello");
        assert_eq!(method.path(), "/greet.Greeter/SayHello");
        assert_eq!(method.service_name(), "greet.Greeter");
        assert_eq!(method.method_name(), "SayHello");
    }

    #[test]
    fn shape_predicates() {
        assert!(!MethodType::Unary.has_request_stream());
        assert!(!MethodType::Unary.has_response_stream());
        assert!(MethodType::ClientStreaming.has_request_stream());
        assert!(!MethodType::ClientStreaming.has_response_stream());
        assert!(!MethodType::ServerStreaming.has_request_stream());
        assert!(MethodType::ServerStreaming.has_response_stream());
        assert!(MethodType::DuplexStreaming.has_request_stream());
        assert!(MethodType::DuplexStreaming.has_response_stream());
    }
}
