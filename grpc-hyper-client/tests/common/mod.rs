//! Scripted transport for driving the call engine without a server.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::future::BoxFuture;
use http_body::Frame;
use http_body_util::{BodyExt, StreamBody};

use grpc_hyper_client::transport::{
    BoxError, ResponseBody, Transport, TransportBody, TransportError,
};

/// One frame on a response body.
pub fn frame(payload: &[u8]) -> Bytes {
    let mut data = Vec::with_capacity(5 + payload.len());
    data.push(0x00);
    data.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    data.extend_from_slice(payload);
    Bytes::from(data)
}

/// A canned HTTP response.
pub struct ScriptedResponse {
    pub status: http::StatusCode,
    pub version: http::Version,
    pub headers: Vec<(String, String)>,
    pub frames: Vec<Bytes>,
    pub trailers: Option<Vec<(String, String)>>,
}

impl ScriptedResponse {
    /// A well-formed gRPC response: frames then a trailers block.
    pub fn grpc(frames: Vec<Bytes>, trailers: Vec<(&str, &str)>) -> Self {
        ScriptedResponse {
            status: http::StatusCode::OK,
            version: http::Version::HTTP_2,
            headers: vec![("content-type".into(), "application/grpc".into())],
            frames,
            trailers: Some(
                trailers
                    .into_iter()
                    .map(|(k, v)| (k.to_owned(), v.to_owned()))
                    .collect(),
            ),
        }
    }

    /// A trailers-only response: the status rides in the header block.
    pub fn trailers_only(grpc_status: i32, extra_headers: Vec<(&str, &str)>) -> Self {
        let mut headers = vec![
            ("content-type".to_owned(), "application/grpc".to_owned()),
            ("grpc-status".to_owned(), grpc_status.to_string()),
        ];
        headers.extend(
            extra_headers
                .into_iter()
                .map(|(k, v)| (k.to_owned(), v.to_owned())),
        );
        ScriptedResponse {
            status: http::StatusCode::OK,
            version: http::Version::HTTP_2,
            headers,
            frames: Vec::new(),
            trailers: None,
        }
    }

    /// A bare HTTP error with no gRPC status anywhere.
    pub fn http_error(status: u16) -> Self {
        ScriptedResponse {
            status: http::StatusCode::from_u16(status).unwrap(),
            version: http::Version::HTTP_2,
            headers: Vec::new(),
            frames: Vec::new(),
            trailers: None,
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    pub fn version(mut self, version: http::Version) -> Self {
        self.version = version;
        self
    }

    fn build(self) -> http::Response<ResponseBody> {
        let mut builder = http::Response::builder()
            .status(self.status)
            .version(self.version);
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let mut parts: Vec<Result<Frame<Bytes>, BoxError>> = self
            .frames
            .into_iter()
            .map(|data| Ok(Frame::data(data)))
            .collect();
        if let Some(trailers) = self.trailers {
            let mut map = http::HeaderMap::new();
            for (name, value) in trailers {
                map.append(
                    http::header::HeaderName::try_from(name.as_str()).unwrap(),
                    value.parse().unwrap(),
                );
            }
            parts.push(Ok(Frame::trailers(map)));
        }
        let body = BodyExt::boxed_unsync(StreamBody::new(futures::stream::iter(parts)));
        builder.body(body).unwrap()
    }
}

/// What the transport does with one request.
pub enum Reply {
    /// Respond immediately; the request body is drained in the background.
    Respond(ScriptedResponse),
    /// Drain the request body first, then respond. Mimics a server that
    /// reads the whole request stream before answering.
    RespondAfterBody(ScriptedResponse),
    /// Fail with a connection-level I/O error.
    IoError(std::io::ErrorKind, &'static str),
    /// Never respond. The request stays in flight until cancelled.
    Hang,
}

#[derive(Default)]
pub struct MockState {
    pub requests: Mutex<Vec<http::request::Parts>>,
    pub request_bodies: Mutex<Vec<Vec<u8>>>,
}

impl MockState {
    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn request_header(&self, index: usize, name: &str) -> Option<String> {
        let requests = self.requests.lock().unwrap();
        requests
            .get(index)?
            .headers
            .get(name)
            .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
    }
}

pub struct MockTransport {
    script: Mutex<VecDeque<Reply>>,
    state: Arc<MockState>,
}

impl MockTransport {
    pub fn new(script: Vec<Reply>) -> (Self, Arc<MockState>) {
        let state = Arc::new(MockState::default());
        (
            MockTransport {
                script: Mutex::new(script.into()),
                state: Arc::clone(&state),
            },
            state,
        )
    }
}

impl Transport for MockTransport {
    fn send(
        &self,
        request: http::Request<TransportBody>,
    ) -> BoxFuture<'static, Result<http::Response<ResponseBody>, TransportError>> {
        let reply = self.script.lock().unwrap().pop_front();
        let state = Arc::clone(&self.state);
        Box::pin(async move {
            let (parts, body) = request.into_parts();
            state.requests.lock().unwrap().push(parts);
            match reply {
                None => Err(TransportError::new("no scripted response left")),
                Some(Reply::IoError(kind, message)) => Err(TransportError::with_source(
                    "request failed",
                    std::io::Error::new(kind, message),
                )),
                Some(Reply::Hang) => {
                    // Keep the body alive so pending writes stay pending.
                    let _body = body;
                    futures::future::pending().await
                }
                Some(Reply::Respond(response)) => {
                    tokio::spawn(async move {
                        let _ = body.collect().await;
                    });
                    Ok(response.build())
                }
                Some(Reply::RespondAfterBody(response)) => {
                    let collected = body
                        .collect()
                        .await
                        .map_err(|err| TransportError::with_source("request body failed", err))?;
                    state
                        .request_bodies
                        .lock()
                        .unwrap()
                        .push(collected.to_bytes().to_vec());
                    Ok(response.build())
                }
            }
        })
    }
}
