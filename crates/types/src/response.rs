//! Responses with a single-consumption body.

use std::{
    fmt,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use http::{HeaderMap, StatusCode};

use crate::request::BodyStream;

type CloseHook = Box<dyn FnOnce() + Send>;

/// Response body stream.
///
/// The body is closed exactly once: explicitly through [`close`](Self::close),
/// after [`bytes`](Self::bytes) reads it to the end, or implicitly on drop.
/// Closing runs the transport's on-close hook, which releases the underlying
/// connection.
pub struct ResponseBody {
    stream: Option<BodyStream>,
    on_close: Option<CloseHook>,
}

impl ResponseBody {
    /// Creates an empty body.
    #[must_use]
    pub fn empty() -> Self {
        Self { stream: None, on_close: None }
    }

    /// Creates a body holding one chunk.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let chunk = bytes.into();
        Self::from_stream(Box::pin(futures::stream::once(async move { Ok(chunk) })))
    }

    /// Wraps a transport stream.
    #[must_use]
    pub fn from_stream(stream: BodyStream) -> Self {
        Self { stream: Some(stream), on_close: None }
    }

    /// Registers a hook that runs when the body is closed.
    ///
    /// A previously registered hook runs first.
    #[must_use]
    pub fn with_on_close(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(match self.on_close.take() {
            Some(previous) => Box::new(move || {
                previous();
                hook();
            }),
            None => Box::new(hook),
        });
        self
    }

    /// Reads the remaining body into memory and closes it.
    ///
    /// # Errors
    ///
    /// Returns the first I/O error produced by the stream.
    pub async fn bytes(mut self) -> Result<Bytes, std::io::Error> {
        let mut buf = BytesMut::new();
        if let Some(stream) = self.stream.as_mut() {
            while let Some(chunk) = stream.next().await {
                buf.extend_from_slice(&chunk?);
            }
        }
        self.close();
        Ok(buf.freeze())
    }

    /// Releases the body without reading it.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        self.stream = None;
        if let Some(hook) = self.on_close.take() {
            hook();
        }
    }
}

impl Stream for ResponseBody {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.stream.as_mut() {
            Some(stream) => stream.as_mut().poll_next(cx),
            None => Poll::Ready(None),
        }
    }
}

impl Drop for ResponseBody {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseBody")
            .field("open", &self.stream.is_some())
            .field("has_on_close", &self.on_close.is_some())
            .finish()
    }
}

/// RPC response: status, headers and an unconsumed body.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: ResponseBody,
}

impl Response {
    /// Creates a response.
    #[must_use]
    pub fn new(status: StatusCode, headers: HeaderMap, body: ResponseBody) -> Self {
        Self { status, headers, body }
    }

    /// Creates a response with no headers and an empty body.
    #[must_use]
    pub fn from_status(status: StatusCode) -> Self {
        Self::new(status, HeaderMap::new(), ResponseBody::empty())
    }

    /// Status code.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Response headers.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns true for 429 Too Many Requests and 503 Service Unavailable.
    #[must_use]
    pub fn is_overloaded(&self) -> bool {
        matches!(self.status, StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE)
    }

    /// Splits off the body for consumption.
    #[must_use]
    pub fn into_body(self) -> ResponseBody {
        self.body
    }

    /// Transforms the body, keeping status and headers.
    pub fn map_body(self, f: impl FnOnce(ResponseBody) -> ResponseBody) -> Self {
        Self { status: self.status, headers: self.headers, body: f(self.body) }
    }

    /// Closes the response without reading the body.
    pub fn close(self) {
        self.body.close();
    }
}
