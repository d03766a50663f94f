//! Call model for the dialogue RPC channel pipeline.
//!
//! This crate provides the value types and capabilities shared by every stage
//! of the pipeline:
//! - [`Endpoint`]: identity of one RPC operation (service, name, version, method, path)
//! - [`Request`]: immutable request with a copy-on-write [`RequestBuilder`]
//! - [`Response`]: status, headers and a single-consumption [`ResponseBody`]
//! - [`Channel`] and [`LimitedChannel`]: the execute / maybe-execute capabilities
//! - [`CallError`]: the call failure taxonomy, using snafu

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod attachments;
mod channel;
mod endpoint;
pub mod error;
mod request;
mod response;

pub use attachments::Attachments;
pub use channel::{Channel, LimitedChannel, ResponseFuture};
pub use endpoint::{Endpoint, PathSegment, PathTemplate};
pub use error::{CallError, Result};
pub use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
pub use request::{BodyStream, Request, RequestBody, RequestBuilder};
pub use response::{Response, ResponseBody};
