//! Classification of call results.
//!
//! Each stage that learns from results (limiter, blacklist, node selection)
//! reads the same classification:
//!
//! | Result | Outcome |
//! |--------|---------|
//! | 429 / 503 response | `Overloaded` |
//! | connect, I/O or timeout error | `HostFailure` |
//! | other 5xx response | `ServerError` |
//! | any other response | `Success` |
//! | local rejection, invalid request, cancellation | `Ignored` |

use dialogue_types::{CallError, Response};

/// What a finished call says about the host that served it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallOutcome {
    /// The host answered normally (including 4xx application errors).
    Success,
    /// The host asked us to back off.
    Overloaded,
    /// The host could not be reached or dropped the call.
    HostFailure,
    /// The host answered with a 5xx other than 503.
    ServerError,
    /// The result says nothing about the host.
    Ignored,
}

impl CallOutcome {
    pub(crate) fn classify(result: &Result<Response, CallError>) -> Self {
        match result {
            Ok(response) if response.is_overloaded() => Self::Overloaded,
            Ok(response) if response.status().is_server_error() => Self::ServerError,
            Ok(_) => Self::Success,
            Err(err) if err.is_host_failure() => Self::HostFailure,
            Err(_) => Self::Ignored,
        }
    }

    /// Returns true if pinning strategies should move off the host.
    pub(crate) fn is_failure(self) -> bool {
        matches!(self, Self::Overloaded | Self::HostFailure | Self::ServerError)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use dialogue_types::StatusCode;

    use super::*;

    fn status(code: u16) -> Result<Response, CallError> {
        Ok(Response::from_status(StatusCode::from_u16(code).unwrap()))
    }

    #[test]
    fn test_classify_responses() {
        assert_eq!(CallOutcome::classify(&status(200)), CallOutcome::Success);
        assert_eq!(CallOutcome::classify(&status(404)), CallOutcome::Success);
        assert_eq!(CallOutcome::classify(&status(429)), CallOutcome::Overloaded);
        assert_eq!(CallOutcome::classify(&status(503)), CallOutcome::Overloaded);
        assert_eq!(CallOutcome::classify(&status(500)), CallOutcome::ServerError);
    }

    #[test]
    fn test_classify_errors() {
        let connect = Err(CallError::Connect { host: "h".to_owned(), message: "refused".to_owned() });
        assert_eq!(CallOutcome::classify(&connect), CallOutcome::HostFailure);
        assert!(CallOutcome::classify(&connect).is_failure());

        let cancelled = Err(CallError::Cancelled);
        assert_eq!(CallOutcome::classify(&cancelled), CallOutcome::Ignored);
        assert!(!CallOutcome::Ignored.is_failure());
        assert!(!CallOutcome::Success.is_failure());
    }
}
