//! Request faults.
//!
//! Handlers and before-hooks fail with a [`RequestFault`]. The fault is not
//! rendered where it is raised: its [`IntoResponse`] impl only attaches the
//! fault to a placeholder response, and the lifecycle middleware hands it to
//! the [`ErrorMapper`](crate::ErrorMapper) exactly once.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use liftoff_core::{PersistenceError, TaskError};

/// Closed set of fault categories used as mapping keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// No route matched.
    NotFound,
    /// The client exceeded its request budget.
    RateLimited,
    /// A handler reported a domain error.
    Application,
    /// The handler did not finish within the request timeout.
    Timeout,
    /// A dependency is temporarily unusable.
    Unavailable,
    /// Anything else.
    Internal,
}

impl FaultKind {
    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            FaultKind::NotFound => "not_found",
            FaultKind::RateLimited => "rate_limited",
            FaultKind::Application => "application",
            FaultKind::Timeout => "timeout",
            FaultKind::Unavailable => "unavailable",
            FaultKind::Internal => "internal",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A domain error carrying its own status and code.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationError {
    /// Response status.
    pub status: StatusCode,
    /// Machine-readable code.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// Extra structured detail.
    pub metadata: serde_json::Value,
}

impl ApplicationError {
    /// Create an error without metadata.
    pub fn new(status: StatusCode, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            kind: kind.into(),
            message: message.into(),
            metadata: serde_json::Value::Null,
        }
    }

    /// 422 shorthand for rejected input.
    pub fn unprocessable(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, kind, message)
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

impl fmt::Display for ApplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.kind, self.status.as_u16(), self.message)
    }
}

/// Errors raised while serving a request.
#[derive(Error, Debug, Clone)]
pub enum RequestFault {
    /// No route matched the request path.
    #[error("No route for {path}")]
    NotFound {
        /// The unmatched path.
        path: String,
    },

    /// The client exceeded its budget.
    #[error("Rate limit exceeded, retry after {}s", retry_after.as_secs())]
    RateLimited {
        /// Time until the window resets.
        retry_after: Duration,
    },

    /// A handler reported a domain error.
    #[error("Application error: {0}")]
    Application(ApplicationError),

    /// The handler ran past the request timeout.
    #[error("Request timed out after {}s", after.as_secs())]
    Timeout {
        /// The configured limit.
        after: Duration,
    },

    /// A dependency is temporarily unusable.
    #[error("Service unavailable: {reason}")]
    Unavailable {
        /// Description of the outage.
        reason: String,
    },

    /// An unexpected failure.
    #[error("Internal error: {reason}")]
    Internal {
        /// Description of the failure.
        reason: String,
    },
}

impl RequestFault {
    /// The mapping key.
    pub fn kind(&self) -> FaultKind {
        match self {
            RequestFault::NotFound { .. } => FaultKind::NotFound,
            RequestFault::RateLimited { .. } => FaultKind::RateLimited,
            RequestFault::Application(_) => FaultKind::Application,
            RequestFault::Timeout { .. } => FaultKind::Timeout,
            RequestFault::Unavailable { .. } => FaultKind::Unavailable,
            RequestFault::Internal { .. } => FaultKind::Internal,
        }
    }

    /// Create an `Internal` fault.
    pub fn internal(reason: impl Into<String>) -> Self {
        RequestFault::Internal {
            reason: reason.into(),
        }
    }

    /// Create an `Unavailable` fault.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        RequestFault::Unavailable {
            reason: reason.into(),
        }
    }

    /// Status used on the placeholder response before mapping.
    fn provisional_status(&self) -> StatusCode {
        match self {
            RequestFault::NotFound { .. } => StatusCode::NOT_FOUND,
            RequestFault::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            RequestFault::Application(e) => e.status,
            RequestFault::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
            RequestFault::Unavailable { .. } | RequestFault::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<ApplicationError> for RequestFault {
    fn from(e: ApplicationError) -> Self {
        RequestFault::Application(e)
    }
}

impl From<PersistenceError> for RequestFault {
    fn from(e: PersistenceError) -> Self {
        RequestFault::internal(e.to_string())
    }
}

impl From<TaskError> for RequestFault {
    fn from(e: TaskError) -> Self {
        match e {
            TaskError::Closed => RequestFault::unavailable(e.to_string()),
            TaskError::NoWorkers => RequestFault::internal(e.to_string()),
        }
    }
}

/// Carrier placed in response extensions for the lifecycle middleware.
#[derive(Debug, Clone)]
pub(crate) struct RaisedFault(pub(crate) Arc<RequestFault>);

impl IntoResponse for RequestFault {
    fn into_response(self) -> Response {
        let mut response = self.provisional_status().into_response();
        response
            .extensions_mut()
            .insert(RaisedFault(Arc::new(self)));
        response
    }
}

/// Take a raised fault out of a response, if one is attached.
pub(crate) fn take_fault(response: &mut Response) -> Option<Arc<RequestFault>> {
    response
        .extensions_mut()
        .remove::<RaisedFault>()
        .map(|raised| raised.0)
}
