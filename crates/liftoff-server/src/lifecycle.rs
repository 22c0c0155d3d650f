//! Request lifecycle hooks.
//!
//! Every request passes through [`RequestLifecycle::dispatch`]:
//!
//! ```text
//! before hooks (registration order) ──ok──▶ handler ──▶ after hooks
//!        │                                     │              ▲
//!        └──fault──▶ ErrorMapper ◀──fault──────┘              │
//!                        └────────────── response ────────────┘
//! ```
//!
//! The first failing before-hook short-circuits: the handler is skipped and
//! the fault is mapped. A handler that overruns the request timeout or
//! panics is turned into a fault as well. After-hooks run for every request
//! and observe the final outcome without being able to change it.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use futures::FutureExt;
use tracing::{debug, error, info};
use uuid::Uuid;

use liftoff_support::RateLimiter;

use crate::error_mapper::ErrorMapper;
use crate::fault::{FaultKind, RequestFault, take_fault};
use crate::state::AppState;

/// Header carrying the request id, echoed on every response.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

const MAX_REQUEST_ID_LEN: usize = 128;

/// Client key used when neither the peer address nor `x-forwarded-for` is
/// available. All such requests share one rate limit bucket.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// What hooks know about the request being served.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    request_id: String,
    method: Method,
    path: String,
    client: String,
    started: Instant,
}

impl RequestInfo {
    /// Describe a request with a fresh id and unknown client.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            method,
            path: path.into(),
            client: UNKNOWN_CLIENT.to_string(),
            started: Instant::now(),
        }
    }

    /// Describe an incoming axum request.
    ///
    /// A well-formed incoming `x-request-id` is kept; otherwise a UUID v4 is
    /// assigned. The client is the peer address when known, then the first
    /// `x-forwarded-for` entry.
    pub fn from_request(request: &Request) -> Self {
        let mut info = Self::new(request.method().clone(), request.uri().path());

        if let Some(id) = request
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|id| !id.is_empty() && id.len() <= MAX_REQUEST_ID_LEN)
        {
            info.request_id = id.to_string();
        }

        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());
        let forwarded = || {
            request
                .headers()
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        if let Some(client) = peer.or_else(forwarded) {
            info.client = client;
        }

        info
    }

    /// Override the request id.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Override the client key.
    pub fn with_client(mut self, client: impl Into<String>) -> Self {
        self.client = client.into();
        self
    }

    /// Request id.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Request path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Client key used for rate limiting.
    pub fn client(&self) -> &str {
        &self.client
    }

    /// Whether the client could not be identified.
    pub fn is_anonymous(&self) -> bool {
        self.client == UNKNOWN_CLIENT
    }

    /// Time since the request was received.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Final result of a request, as seen by after-hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOutcome {
    /// Response status.
    pub status: StatusCode,
    /// Total time spent.
    pub elapsed: Duration,
    /// Kind of the mapped fault, if the request failed.
    pub fault: Option<FaultKind>,
}

type BeforeHook = Arc<dyn Fn(&RequestInfo) -> Result<(), RequestFault> + Send + Sync>;
type AfterHook = Arc<dyn Fn(&RequestInfo, &RequestOutcome) + Send + Sync>;

/// Ordered before and after hooks, plus the handler time limit.
#[derive(Clone, Default)]
pub struct RequestLifecycle {
    before: Vec<(String, BeforeHook)>,
    after: Vec<(String, AfterHook)>,
    timeout: Option<Duration>,
}

impl RequestLifecycle {
    /// A lifecycle without hooks.
    pub fn new() -> Self {
        Self::default()
    }

    /// A lifecycle with the request start and access log hooks.
    pub fn with_core_hooks() -> Self {
        let mut lifecycle = Self::new();
        lifecycle.register_before("request.start", |info| {
            debug!(
                request_id = %info.request_id(),
                method = %info.method(),
                path = %info.path(),
                client = %info.client(),
                "Request started"
            );
            Ok(())
        });
        lifecycle.register_after("access.log", |info, outcome| {
            info!(
                request_id = %info.request_id(),
                method = %info.method(),
                path = %info.path(),
                status = outcome.status.as_u16(),
                latency_ms = u64::try_from(outcome.elapsed.as_millis()).unwrap_or(u64::MAX),
                "Request completed"
            );
        });
        lifecycle
    }

    /// Bound the handler's run time.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The handler time limit, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Append a before-hook.
    pub fn register_before(
        &mut self,
        name: impl Into<String>,
        hook: impl Fn(&RequestInfo) -> Result<(), RequestFault> + Send + Sync + 'static,
    ) {
        self.before.push((name.into(), Arc::new(hook)));
    }

    /// Append an after-hook.
    pub fn register_after(
        &mut self,
        name: impl Into<String>,
        hook: impl Fn(&RequestInfo, &RequestOutcome) + Send + Sync + 'static,
    ) {
        self.after.push((name.into(), Arc::new(hook)));
    }

    /// Names of the before-hooks, in run order.
    pub fn before_hooks(&self) -> Vec<&str> {
        self.before.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Names of the after-hooks, in run order.
    pub fn after_hooks(&self) -> Vec<&str> {
        self.after.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Run before-hooks until one fails.
    pub fn run_before(&self, info: &RequestInfo) -> Result<(), RequestFault> {
        for (name, hook) in &self.before {
            if let Err(fault) = hook(info) {
                debug!(
                    request_id = %info.request_id(),
                    hook = %name,
                    kind = %fault.kind(),
                    "Before hook rejected request"
                );
                return Err(fault);
            }
        }
        Ok(())
    }

    /// Run every after-hook.
    pub fn run_after(&self, info: &RequestInfo, outcome: &RequestOutcome) {
        for (_, hook) in &self.after {
            hook(info, outcome);
        }
    }

    /// Serve one request through the hooks.
    ///
    /// `handler` is invoked only if every before-hook passes. A fault from
    /// a hook or attached to the handler's response is rendered by `mapper`.
    /// Overrunning the timeout raises `Timeout`; a panic raises `Internal`.
    pub async fn dispatch<F, Fut>(
        &self,
        info: &RequestInfo,
        mapper: &ErrorMapper,
        handler: F,
    ) -> Response
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Response>,
    {
        let (response, fault) = match self.run_before(info) {
            Err(fault) => (
                mapper.map(&fault, info).into_axum_response(),
                Some(fault.kind()),
            ),
            Ok(()) => {
                let mut response = self.guarded(info, handler()).await;
                match take_fault(&mut response) {
                    Some(fault) => (
                        mapper.map(&fault, info).into_axum_response(),
                        Some(fault.kind()),
                    ),
                    None => (response, None),
                }
            }
        };

        let outcome = RequestOutcome {
            status: response.status(),
            elapsed: info.elapsed(),
            fault,
        };
        self.run_after(info, &outcome);

        response
    }

    async fn guarded<Fut>(&self, info: &RequestInfo, handler: Fut) -> Response
    where
        Fut: Future<Output = Response>,
    {
        let caught = AssertUnwindSafe(handler).catch_unwind();
        let result = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, caught).await {
                Ok(result) => result,
                Err(_) => return RequestFault::Timeout { after: limit }.into_response(),
            },
            None => caught.await,
        };

        result.unwrap_or_else(|payload| {
            let reason = panic_message(payload.as_ref());
            error!(
                request_id = %info.request_id(),
                path = %info.path(),
                panic = %reason,
                "Handler panicked"
            );
            RequestFault::internal(format!("handler panicked: {reason}")).into_response()
        })
    }
}

impl fmt::Debug for RequestLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestLifecycle")
            .field("before", &self.before_hooks())
            .field("after", &self.after_hooks())
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Before-hook enforcing `limiter` per client.
pub fn rate_limit_hook(
    limiter: Arc<dyn RateLimiter>,
) -> impl Fn(&RequestInfo) -> Result<(), RequestFault> + Send + Sync + 'static {
    move |info| {
        if info.is_anonymous() {
            debug!(
                request_id = %info.request_id(),
                path = %info.path(),
                "No client address, using the shared rate limit bucket"
            );
        }
        let decision = limiter.check(info.client());
        if decision.allowed {
            Ok(())
        } else {
            Err(RequestFault::RateLimited {
                retry_after: decision.retry_after.unwrap_or_default(),
            })
        }
    }
}

/// Axum middleware applying the lifecycle to every request.
///
/// The request's [`ExecutionContext`](liftoff_core::ExecutionContext) is
/// ambient for the whole dispatch, so work scheduled by hooks or handlers
/// carries the request id.
pub async fn lifecycle_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let info = RequestInfo::from_request(&request);
    let context = state.context().execution_context(info.request_id());

    let mut response = context
        .scope(
            state
                .lifecycle()
                .dispatch(&info, state.errors(), move || next.run(request)),
        )
        .await;

    if let Ok(value) = HeaderValue::from_str(info.request_id()) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::ApplicationError;
    use liftoff_support::FixedWindowLimiter;
    use parking_lot::Mutex;

    fn recording_lifecycle(trace: &Arc<Mutex<Vec<String>>>) -> RequestLifecycle {
        let mut lifecycle = RequestLifecycle::new();
        for name in ["A", "B"] {
            let trace = Arc::clone(trace);
            lifecycle.register_before(name, move |_| {
                trace.lock().push(name.to_string());
                Ok(())
            });
        }
        for name in ["C", "D"] {
            let trace = Arc::clone(trace);
            lifecycle.register_after(name, move |_, _| trace.lock().push(name.to_string()));
        }
        lifecycle
    }

    #[tokio::test]
    async fn test_hook_order() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let lifecycle = recording_lifecycle(&trace);
        let info = RequestInfo::new(Method::GET, "/");

        let handler_trace = Arc::clone(&trace);
        let response = lifecycle
            .dispatch(&info, &ErrorMapper::with_defaults(), || async move {
                handler_trace.lock().push("handler".to_string());
                StatusCode::OK.into_response()
            })
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(*trace.lock(), ["A", "B", "handler", "C", "D"]);
    }

    #[tokio::test]
    async fn test_failing_before_hook_skips_handler() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let mut lifecycle = RequestLifecycle::new();
        lifecycle.register_before("reject", |_| {
            Err(ApplicationError::new(StatusCode::FORBIDDEN, "forbidden", "no").into())
        });
        let after_trace = Arc::clone(&trace);
        lifecycle.register_after("observe", move |_, outcome| {
            after_trace.lock().push(format!("after:{}", outcome.status.as_u16()));
        });

        let handler_trace = Arc::clone(&trace);
        let response = lifecycle
            .dispatch(
                &RequestInfo::new(Method::GET, "/"),
                &ErrorMapper::with_defaults(),
                || async move {
                    handler_trace.lock().push("handler".to_string());
                    StatusCode::OK.into_response()
                },
            )
            .await;

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(*trace.lock(), ["after:403"]);
    }

    #[tokio::test]
    async fn test_handler_fault_is_mapped_once() {
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let mut lifecycle = RequestLifecycle::new();
        let seen = Arc::clone(&outcomes);
        lifecycle.register_after("observe", move |_, outcome| seen.lock().push(*outcome));

        let response = lifecycle
            .dispatch(
                &RequestInfo::new(Method::GET, "/missing"),
                &ErrorMapper::with_defaults(),
                || async {
                    RequestFault::NotFound {
                        path: "/missing".into(),
                    }
                    .into_response()
                },
            )
            .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let outcomes = outcomes.lock();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].fault, Some(FaultKind::NotFound));
    }

    #[tokio::test]
    async fn test_after_hook_sees_final_status() {
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let mut lifecycle = RequestLifecycle::new();
        let seen = Arc::clone(&statuses);
        lifecycle.register_after("observe", move |_, outcome| seen.lock().push(outcome.status));

        let response = lifecycle
            .dispatch(
                &RequestInfo::new(Method::GET, "/"),
                &ErrorMapper::with_defaults(),
                || async { StatusCode::CREATED.into_response() },
            )
            .await;

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(*statuses.lock(), [StatusCode::CREATED]);
    }

    #[tokio::test]
    async fn test_slow_handler_times_out_through_mapper() {
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let mut lifecycle = RequestLifecycle::new().with_timeout(Duration::from_millis(20));
        let seen = Arc::clone(&outcomes);
        lifecycle.register_after("observe", move |_, outcome| seen.lock().push(*outcome));

        let response = lifecycle
            .dispatch(
                &RequestInfo::new(Method::GET, "/slow"),
                &ErrorMapper::with_defaults(),
                || async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    StatusCode::OK.into_response()
                },
            )
            .await;

        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
        let outcomes = outcomes.lock();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].fault, Some(FaultKind::Timeout));
    }

    #[tokio::test]
    async fn test_fast_handler_is_not_limited() {
        let lifecycle = RequestLifecycle::new().with_timeout(Duration::from_secs(5));
        assert_eq!(lifecycle.timeout(), Some(Duration::from_secs(5)));
        let response = lifecycle
            .dispatch(
                &RequestInfo::new(Method::GET, "/"),
                &ErrorMapper::with_defaults(),
                || async { StatusCode::NO_CONTENT.into_response() },
            )
            .await;

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_handler_panic_maps_to_internal() {
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let mut lifecycle = RequestLifecycle::new();
        let seen = Arc::clone(&outcomes);
        lifecycle.register_after("observe", move |_, outcome| seen.lock().push(*outcome));

        let response = lifecycle
            .dispatch(
                &RequestInfo::new(Method::GET, "/boom"),
                &ErrorMapper::with_defaults(),
                || async {
                    if true {
                        panic!("handler exploded");
                    }
                    StatusCode::OK.into_response()
                },
            )
            .await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let outcomes = outcomes.lock();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(outcomes[0].fault, Some(FaultKind::Internal));
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42_u8), "unknown panic");
    }

    #[test]
    fn test_rate_limit_hook() {
        let limiter: Arc<dyn RateLimiter> =
            Arc::new(FixedWindowLimiter::new(1, Duration::from_secs(30)));
        let hook = rate_limit_hook(limiter);
        let info = RequestInfo::new(Method::GET, "/").with_client("10.0.0.1");

        assert!(hook(&info).is_ok());
        let fault = hook(&info).unwrap_err();
        assert_eq!(fault.kind(), FaultKind::RateLimited);
    }

    #[test]
    fn test_anonymous_clients_share_a_bucket() {
        let limiter: Arc<dyn RateLimiter> =
            Arc::new(FixedWindowLimiter::new(1, Duration::from_secs(30)));
        let hook = rate_limit_hook(limiter);

        let first = RequestInfo::new(Method::GET, "/a");
        let second = RequestInfo::new(Method::GET, "/b");
        assert!(first.is_anonymous());
        assert!(hook(&first).is_ok());
        assert_eq!(hook(&second).unwrap_err().kind(), FaultKind::RateLimited);

        let known = RequestInfo::new(Method::GET, "/a").with_client("10.0.0.2");
        assert!(!known.is_anonymous());
        assert!(hook(&known).is_ok());
    }

    #[test]
    fn test_request_info_from_request() {
        let request = Request::builder()
            .uri("/v1/jobs?x=1")
            .header("x-request-id", "abc-123")
            .header("x-forwarded-for", "203.0.113.5, 10.0.0.1")
            .body(axum::body::Body::empty())
            .unwrap();

        let info = RequestInfo::from_request(&request);
        assert_eq!(info.request_id(), "abc-123");
        assert_eq!(info.path(), "/v1/jobs");
        assert_eq!(info.client(), "203.0.113.5");
    }

    #[test]
    fn test_request_id_generated_when_missing() {
        let request = Request::builder()
            .uri("/")
            .body(axum::body::Body::empty())
            .unwrap();

        let info = RequestInfo::from_request(&request);
        assert!(Uuid::parse_str(info.request_id()).is_ok());
        assert_eq!(info.client(), UNKNOWN_CLIENT);
        assert!(info.is_anonymous());
    }

    #[test]
    fn test_core_hooks() {
        let lifecycle = RequestLifecycle::with_core_hooks();
        assert_eq!(lifecycle.before_hooks(), ["request.start"]);
        assert_eq!(lifecycle.after_hooks(), ["access.log"]);
        assert_eq!(lifecycle.timeout(), None);
    }
}
