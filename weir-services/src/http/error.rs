//! Failure kinds of a request lifecycle and their wire translation.

use http::StatusCode;
use tracing::{error, trace};
use weir_core::AnyError;

/// What went wrong while dispatching a request.
///
/// Routing and binding report these as values rather than unwinding; they
/// are translated to status codes at the pipeline edge.
#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    #[error("no route matches the request path")]
    NotFound,
    #[error("a route matches the path but does not accept the method")]
    MethodNotAllowed,
    #[error("{0}")]
    BadRequest(String),
    #[error("request body exceeded the {0} byte aggregation limit")]
    OverLimit(usize),
    #[error("internal error: {0}")]
    Internal(AnyError),
    #[error("client disconnected: {0}")]
    Disconnect(String),
}

impl DispatchError {
    pub fn status(&self) -> StatusCode {
        match self {
            DispatchError::NotFound => StatusCode::NOT_FOUND,
            DispatchError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            DispatchError::BadRequest(_) => StatusCode::BAD_REQUEST,
            DispatchError::OverLimit(_)
            | DispatchError::Internal(_)
            | DispatchError::Disconnect(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-induced failures are logged at trace, server-side failures
    /// at error.
    pub fn is_user_level(&self) -> bool {
        matches!(
            self,
            DispatchError::NotFound
                | DispatchError::MethodNotAllowed
                | DispatchError::BadRequest(_)
                | DispatchError::Disconnect(_)
        )
    }

    pub fn log(&self) {
        if self.is_user_level() {
            trace!("request failed: {self}");
        } else {
            error!("request failed: {self}");
        }
    }
}

/// Body of the built-in exception response.
pub(crate) fn exception_body(cause: &AnyError) -> String {
    format!("Exception encountered while processing request : {cause}")
}
