//! Channel capabilities.
//!
//! ```text
//! Channel::execute        → always returns a future
//! LimitedChannel::maybe_execute → Some(future) if admitted, None if rejected
//! ```
//!
//! A `None` from [`LimitedChannel::maybe_execute`] means "try elsewhere or
//! later". It is not a failure and carries no error.

use std::{fmt, sync::Arc};

use futures::future::BoxFuture;

use crate::{endpoint::Endpoint, error::CallError, request::Request, response::Response};

/// Future returned by a channel call.
pub type ResponseFuture = BoxFuture<'static, Result<Response, CallError>>;

/// Executes a request against an endpoint.
pub trait Channel: Send + Sync + fmt::Debug {
    /// Starts the call. Dropping the returned future cancels it.
    fn execute(&self, endpoint: &Endpoint, request: Request) -> ResponseFuture;
}

/// Executes a request only if capacity allows.
pub trait LimitedChannel: Send + Sync + fmt::Debug {
    /// Starts the call if admitted; returns `None` without side effects on
    /// the host otherwise.
    fn maybe_execute(&self, endpoint: &Endpoint, request: &Request) -> Option<ResponseFuture>;
}

impl<T: Channel + ?Sized> Channel for Arc<T> {
    fn execute(&self, endpoint: &Endpoint, request: Request) -> ResponseFuture {
        (**self).execute(endpoint, request)
    }
}

impl<T: LimitedChannel + ?Sized> LimitedChannel for Arc<T> {
    fn maybe_execute(&self, endpoint: &Endpoint, request: &Request) -> Option<ResponseFuture> {
        (**self).maybe_execute(endpoint, request)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use http::{Method, StatusCode};

    use super::*;

    #[derive(Debug)]
    struct Fixed(StatusCode);

    impl Channel for Fixed {
        fn execute(&self, _endpoint: &Endpoint, _request: Request) -> ResponseFuture {
            let status = self.0;
            Box::pin(async move { Ok(Response::from_status(status)) })
        }
    }

    #[tokio::test]
    async fn test_arc_dyn_channel_forwards() {
        let channel: Arc<dyn Channel> = Arc::new(Fixed(StatusCode::ACCEPTED));
        let endpoint = Endpoint::parse("svc", "op", "1", Method::GET, "/op").unwrap();
        let response = channel.execute(&endpoint, Request::default()).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[test]
    fn test_assert_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Arc<dyn Channel>>();
        assert_send_sync::<Arc<dyn LimitedChannel>>();
        assert_send_sync::<Request>();
        assert_send_sync::<Endpoint>();
    }
}
