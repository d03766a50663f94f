//! Immutable requests with a copy-on-write builder.
//!
//! A [`Request`] is cheap to clone: every collection sits behind an `Arc`.
//! [`Request::to_builder`] hands those `Arc`s to a [`RequestBuilder`], which
//! copies a collection only when it is first modified, so deriving a request
//! that changes one header leaves the path and query parameters shared.

use std::{collections::BTreeMap, fmt, sync::Arc};

use bytes::Bytes;
use futures::stream::BoxStream;
use http::{HeaderMap, HeaderName, HeaderValue};
use parking_lot::Mutex;

use crate::attachments::Attachments;

/// One-shot body stream.
pub type BodyStream = BoxStream<'static, Result<Bytes, std::io::Error>>;

#[derive(Clone)]
enum BodyContent {
    Bytes(Bytes),
    Stream(Arc<Mutex<Option<BodyStream>>>),
}

/// Pre-serialized request body.
///
/// A body built from bytes is repeatable and may be sent any number of
/// times. A streaming body can be taken exactly once, so a request carrying
/// one is never replayed.
#[derive(Clone)]
pub struct RequestBody {
    content_type: String,
    content: BodyContent,
}

impl RequestBody {
    /// Creates a repeatable body from bytes.
    pub fn from_bytes(content_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self { content_type: content_type.into(), content: BodyContent::Bytes(bytes.into()) }
    }

    /// Creates a one-shot streaming body.
    pub fn from_stream(content_type: impl Into<String>, stream: BodyStream) -> Self {
        Self {
            content_type: content_type.into(),
            content: BodyContent::Stream(Arc::new(Mutex::new(Some(stream)))),
        }
    }

    /// Content type of the serialized body.
    #[must_use]
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Returns true if the body can be written more than once.
    #[must_use]
    pub fn is_repeatable(&self) -> bool {
        matches!(self.content, BodyContent::Bytes(_))
    }

    /// Returns the bytes of a repeatable body.
    #[must_use]
    pub fn bytes(&self) -> Option<&Bytes> {
        match &self.content {
            BodyContent::Bytes(bytes) => Some(bytes),
            BodyContent::Stream(_) => None,
        }
    }

    /// Takes the body as a stream.
    ///
    /// Repeatable bodies yield a fresh single-chunk stream on every call.
    /// Streaming bodies yield their stream once and `None` afterwards.
    pub fn take_stream(&self) -> Option<BodyStream> {
        match &self.content {
            BodyContent::Bytes(bytes) => {
                let chunk = bytes.clone();
                Some(Box::pin(futures::stream::once(async move { Ok(chunk) })))
            },
            BodyContent::Stream(slot) => slot.lock().take(),
        }
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("RequestBody");
        debug.field("content_type", &self.content_type);
        match &self.content {
            BodyContent::Bytes(bytes) => debug.field("len", &bytes.len()),
            BodyContent::Stream(_) => debug.field("streaming", &true),
        };
        debug.finish()
    }
}

/// Immutable RPC request.
#[derive(Clone, Default)]
pub struct Request {
    path_params: Arc<BTreeMap<String, String>>,
    query_params: Arc<Vec<(String, String)>>,
    headers: Arc<HeaderMap>,
    body: Option<RequestBody>,
    attachments: Attachments,
}

impl Request {
    /// Creates a builder for an empty request.
    #[must_use]
    pub fn builder() -> RequestBuilder {
        RequestBuilder::default()
    }

    /// Creates a builder seeded from this request.
    ///
    /// Unmodified collections stay shared with `self`.
    #[must_use]
    pub fn to_builder(&self) -> RequestBuilder {
        RequestBuilder { request: self.clone() }
    }

    /// Path parameters by name.
    #[must_use]
    pub fn path_params(&self) -> &BTreeMap<String, String> {
        &self.path_params
    }

    /// Query parameters in insertion order; a name may repeat.
    #[must_use]
    pub fn query_params(&self) -> &[(String, String)] {
        &self.query_params
    }

    /// Returns every value of a query parameter.
    pub fn query_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.query_params.iter().filter(move |(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    /// Header parameters. Names are case-insensitive and may repeat.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Request body, if any.
    #[must_use]
    pub fn body(&self) -> Option<&RequestBody> {
        self.body.as_ref()
    }

    /// Typed attachments.
    #[must_use]
    pub fn attachments(&self) -> &Attachments {
        &self.attachments
    }

    /// Returns true if the request may be sent again after a failed attempt.
    #[must_use]
    pub fn is_replayable(&self) -> bool {
        self.body.as_ref().is_none_or(RequestBody::is_repeatable)
    }

    /// Returns true if both requests share their parameter and header storage.
    #[must_use]
    pub fn shares_collections_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.path_params, &other.path_params)
            && Arc::ptr_eq(&self.query_params, &other.query_params)
            && Arc::ptr_eq(&self.headers, &other.headers)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("path_params", &self.path_params)
            .field("query_params", &self.query_params)
            .field("headers", &self.headers.len())
            .field("body", &self.body)
            .field("attachments", &self.attachments)
            .finish()
    }
}

/// Builder for [`Request`].
#[derive(Default)]
pub struct RequestBuilder {
    request: Request,
}

impl RequestBuilder {
    /// Sets a path parameter.
    #[must_use]
    pub fn path_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.request.path_params).insert(name.into(), value.into());
        self
    }

    /// Appends a query parameter value.
    #[must_use]
    pub fn query_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.request.query_params).push((name.into(), value.into()));
        self
    }

    /// Removes every value of a query parameter.
    #[must_use]
    pub fn remove_query_param(mut self, name: &str) -> Self {
        if self.request.query_params.iter().any(|(k, _)| k == name) {
            Arc::make_mut(&mut self.request.query_params).retain(|(k, _)| k != name);
        }
        self
    }

    /// Appends a header value.
    #[must_use]
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        Arc::make_mut(&mut self.request.headers).append(name, value);
        self
    }

    /// Replaces every value of a header.
    #[must_use]
    pub fn set_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        Arc::make_mut(&mut self.request.headers).insert(name, value);
        self
    }

    /// Sets the body.
    #[must_use]
    pub fn body(mut self, body: RequestBody) -> Self {
        self.request.body = Some(body);
        self
    }

    /// Attaches a typed value.
    #[must_use]
    pub fn attach<T: std::any::Any + Send + Sync>(mut self, value: T) -> Self {
        self.request.attachments.insert(value);
        self
    }

    /// Builds the request.
    #[must_use]
    pub fn build(self) -> Request {
        self.request
    }
}
