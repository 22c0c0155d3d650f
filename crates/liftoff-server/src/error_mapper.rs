//! Fault to response mapping.
//!
//! [`ErrorMapper`] is an explicit table from [`FaultKind`] to a response
//! builder. Kinds without an entry fall through to a generic 500 and are
//! forwarded to the error reporter when one is configured.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use axum::Json;
use axum::http::{HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::{error, warn};

use liftoff_support::{ErrorReport, ErrorReporter};

use crate::fault::{FaultKind, RequestFault};
use crate::lifecycle::RequestInfo;

/// A rendered error: status, JSON body and extra headers.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorResponse {
    /// HTTP status code.
    pub status: StatusCode,
    /// JSON body.
    pub body: serde_json::Value,
    /// Extra response headers.
    pub headers: Vec<(HeaderName, HeaderValue)>,
}

impl ErrorResponse {
    /// Create a JSON error response.
    pub fn json(status: StatusCode, body: serde_json::Value) -> Self {
        Self {
            status,
            body,
            headers: Vec::new(),
        }
    }

    /// The generic 500 body.
    pub fn internal() -> Self {
        Self::json(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"code": "internal_error", "message": "internal server error"}),
        )
    }

    /// Add a header to the response.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.push((name, value));
        self
    }

    /// Convert to an axum response.
    pub fn into_axum_response(self) -> Response {
        let mut response = (self.status, Json(self.body)).into_response();
        for (name, value) in self.headers {
            response.headers_mut().insert(name, value);
        }
        response
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        self.into_axum_response()
    }
}

/// Builds the response for one fault kind.
pub type FaultBuilder = Arc<dyn Fn(&RequestFault) -> ErrorResponse + Send + Sync>;

/// Mapping table consulted once per failed request.
#[derive(Clone, Default)]
pub struct ErrorMapper {
    builders: HashMap<FaultKind, FaultBuilder>,
    reporter: Option<Arc<dyn ErrorReporter>>,
}

impl ErrorMapper {
    /// An empty table; every fault maps to the generic 500.
    pub fn new() -> Self {
        Self::default()
    }

    /// The table with the built-in mappings for `NotFound`, `RateLimited`,
    /// `Application` and `Timeout`.
    pub fn with_defaults() -> Self {
        let mut mapper = Self::new();
        mapper.register(FaultKind::NotFound, not_found);
        mapper.register(FaultKind::RateLimited, too_many_requests);
        mapper.register(FaultKind::Application, application);
        mapper.register(FaultKind::Timeout, request_timeout);
        mapper
    }

    /// Set or replace the builder for `kind`.
    pub fn register(
        &mut self,
        kind: FaultKind,
        builder: impl Fn(&RequestFault) -> ErrorResponse + Send + Sync + 'static,
    ) {
        self.builders.insert(kind, Arc::new(builder));
    }

    /// Remove the builder for `kind`, returning whether one existed.
    pub fn unregister(&mut self, kind: FaultKind) -> bool {
        self.builders.remove(&kind).is_some()
    }

    /// Whether `kind` has a builder.
    pub fn is_mapped(&self, kind: FaultKind) -> bool {
        self.builders.contains_key(&kind)
    }

    /// Forward unmapped faults to `reporter`.
    pub fn set_reporter(&mut self, reporter: Arc<dyn ErrorReporter>) {
        self.reporter = Some(reporter);
    }

    /// Whether unmapped faults are reported.
    pub fn has_reporter(&self) -> bool {
        self.reporter.is_some()
    }

    /// Render `fault` raised while serving `info`.
    pub fn map(&self, fault: &RequestFault, info: &RequestInfo) -> ErrorResponse {
        if let Some(builder) = self.builders.get(&fault.kind()) {
            warn!(
                request_id = %info.request_id(),
                kind = %fault.kind(),
                error = %fault,
                "Request failed"
            );
            return builder(fault);
        }

        error!(
            request_id = %info.request_id(),
            method = %info.method(),
            path = %info.path(),
            kind = %fault.kind(),
            error = %fault,
            "Unhandled request fault"
        );

        if let Some(reporter) = &self.reporter {
            reporter.capture(
                ErrorReport::new(fault.kind().as_str(), fault.to_string())
                    .with_request_id(info.request_id())
                    .with_path(info.path()),
            );
        }

        ErrorResponse::internal()
    }
}

impl fmt::Debug for ErrorMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.builders.keys().map(|k| k.as_str()).collect();
        kinds.sort_unstable();
        f.debug_struct("ErrorMapper")
            .field("kinds", &kinds)
            .field("reporter", &self.reporter.is_some())
            .finish()
    }
}

fn not_found(fault: &RequestFault) -> ErrorResponse {
    let message = match fault {
        RequestFault::NotFound { path } => format!("no route for {path}"),
        _ => "not found".to_string(),
    };
    ErrorResponse::json(
        StatusCode::NOT_FOUND,
        json!({"code": "not_found", "message": message}),
    )
}

fn too_many_requests(fault: &RequestFault) -> ErrorResponse {
    let response = ErrorResponse::json(
        StatusCode::TOO_MANY_REQUESTS,
        json!({"code": "too_many_requests", "message": "rate limit exceeded"}),
    );

    match fault {
        RequestFault::RateLimited { retry_after } => {
            // Round up so clients never retry inside the window.
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            response.with_header(header::RETRY_AFTER, HeaderValue::from(secs))
        }
        _ => response,
    }
}

fn request_timeout(_fault: &RequestFault) -> ErrorResponse {
    ErrorResponse::json(
        StatusCode::REQUEST_TIMEOUT,
        json!({"code": "request_timeout", "message": "request timed out"}),
    )
}

fn application(fault: &RequestFault) -> ErrorResponse {
    match fault {
        RequestFault::Application(e) => ErrorResponse::json(
            e.status,
            json!({"code": e.kind, "message": e.message, "metadata": e.metadata}),
        ),
        _ => ErrorResponse::internal(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::ApplicationError;
    use axum::http::Method;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recording {
        reports: Mutex<Vec<ErrorReport>>,
    }

    impl ErrorReporter for Recording {
        fn capture(&self, report: ErrorReport) {
            self.reports.lock().push(report);
        }
    }

    fn info() -> RequestInfo {
        RequestInfo::new(Method::GET, "/things").with_request_id("req-1")
    }

    #[test]
    fn test_not_found() {
        let mapper = ErrorMapper::with_defaults();
        let response = mapper.map(&RequestFault::NotFound { path: "/x".into() }, &info());

        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert_eq!(response.body["code"], "not_found");
        assert_eq!(response.body["message"], "no route for /x");
    }

    #[test]
    fn test_rate_limited_sets_retry_after() {
        let mapper = ErrorMapper::with_defaults();
        let fault = RequestFault::RateLimited {
            retry_after: Duration::from_millis(2_500),
        };
        let response = mapper.map(&fault, &info());

        assert_eq!(response.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.body["code"], "too_many_requests");
        assert_eq!(
            response.headers,
            vec![(header::RETRY_AFTER, HeaderValue::from(3_u64))]
        );
    }

    #[test]
    fn test_application_triple() {
        let mapper = ErrorMapper::with_defaults();
        let fault = RequestFault::from(
            ApplicationError::new(StatusCode::CONFLICT, "duplicate_job", "job exists")
                .with_metadata(json!({"id": 9})),
        );
        let response = mapper.map(&fault, &info());

        assert_eq!(response.status, StatusCode::CONFLICT);
        assert_eq!(
            response.body,
            json!({"code": "duplicate_job", "message": "job exists", "metadata": {"id": 9}})
        );
    }

    #[test]
    fn test_timeout() {
        let mapper = ErrorMapper::with_defaults();
        let fault = RequestFault::Timeout {
            after: Duration::from_secs(30),
        };
        let response = mapper.map(&fault, &info());

        assert_eq!(response.status, StatusCode::REQUEST_TIMEOUT);
        assert_eq!(
            response.body,
            json!({"code": "request_timeout", "message": "request timed out"})
        );
    }

    #[test]
    fn test_unmapped_kind_falls_back_and_reports() {
        let recording = Arc::new(Recording::default());
        let mut mapper = ErrorMapper::with_defaults();
        mapper.set_reporter(recording.clone());

        let response = mapper.map(&RequestFault::internal("db exploded"), &info());

        assert_eq!(response, ErrorResponse::internal());
        let reports = recording.reports.lock();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].kind, "internal");
        assert_eq!(reports[0].request_id.as_deref(), Some("req-1"));
        assert_eq!(reports[0].path.as_deref(), Some("/things"));
    }

    #[test]
    fn test_unregistered_kind_uses_fallback() {
        let mut mapper = ErrorMapper::with_defaults();
        assert!(mapper.unregister(FaultKind::NotFound));
        assert!(!mapper.is_mapped(FaultKind::NotFound));

        let response = mapper.map(&RequestFault::NotFound { path: "/x".into() }, &info());
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.body["code"], "internal_error");
    }

    #[test]
    fn test_mapped_faults_are_not_reported() {
        let recording = Arc::new(Recording::default());
        let mut mapper = ErrorMapper::with_defaults();
        mapper.set_reporter(recording.clone());

        mapper.map(&RequestFault::NotFound { path: "/".into() }, &info());
        assert!(recording.reports.lock().is_empty());
    }

    #[test]
    fn test_custom_builder() {
        let mut mapper = ErrorMapper::with_defaults();
        mapper.register(FaultKind::Unavailable, |_| {
            ErrorResponse::json(StatusCode::SERVICE_UNAVAILABLE, json!({"code": "unavailable"}))
        });

        let response = mapper.map(&RequestFault::unavailable("queue closed"), &info());
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_into_axum_response() {
        let response = ErrorResponse::internal()
            .with_header(header::RETRY_AFTER, HeaderValue::from_static("1"))
            .into_axum_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");
    }
}
