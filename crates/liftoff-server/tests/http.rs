//! End-to-end request tests against a bootstrapped application.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use axum::response::Response;
use axum::routing::get as get_route;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tower::util::ServiceExt;

use liftoff_core::{InstrumentationError, StatementEvent, StatementObserver};
use liftoff_server::{
    AppContext, AppState, Application, Bootstrapper, Module, Namespace, REQUEST_ID_HEADER,
    Routable, RouteDescriptor,
};

#[derive(Clone, Default)]
struct Recorder {
    events: Arc<Mutex<Vec<StatementEvent>>>,
}

impl StatementObserver for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn after(&self, event: &StatementEvent) -> Result<(), InstrumentationError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

struct Misbehaving;

impl Routable for Misbehaving {
    fn descriptor(&self) -> RouteDescriptor {
        RouteDescriptor::new("/misbehave")
            .route("GET", "/slow")
            .route("GET", "/panic")
    }

    fn router(&self, _ctx: &AppContext) -> Router<AppState> {
        Router::new()
            .route(
                "/slow",
                get_route(|| async {
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    "late"
                }),
            )
            .route(
                "/panic",
                get_route(|| async {
                    if true {
                        panic!("handler exploded");
                    }
                    "unreachable"
                }),
            )
    }
}

async fn start(overrides: &[(&str, &str)]) -> Application {
    let mut bootstrapper = Bootstrapper::with_mode("test").without_env();
    for (key, value) in overrides {
        bootstrapper = bootstrapper.with_override(*key, *value);
    }
    bootstrapper.initialize().await.unwrap()
}

async fn send(router: &Router, request: Request<Body>) -> Response {
    router.clone().oneshot(request).await.unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn wait_until(check: impl Fn() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

async fn json_body(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_and_readiness() {
    let app = start(&[]).await;
    let router = app.router();

    let response = send(&router, get("/health")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["app"], "liftoff");

    let response = send(&router, get("/health/ready")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ready");
    assert_eq!(body["tasks"]["workers"], 2);

    app.shutdown().await;
}

#[tokio::test]
async fn test_unknown_path_is_mapped() {
    let app = start(&[]).await;

    let response = send(&app.router(), get("/nowhere")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(response.headers().contains_key(REQUEST_ID_HEADER));
    let body = json_body(response).await;
    assert_eq!(body, json!({"code": "not_found", "message": "no route for /nowhere"}));

    app.shutdown().await;
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let app = start(&[]).await;

    let request = Request::builder()
        .uri("/health")
        .header(REQUEST_ID_HEADER, "trace-abc")
        .body(Body::empty())
        .unwrap();
    let response = send(&app.router(), request).await;
    assert_eq!(response.headers()[REQUEST_ID_HEADER], "trace-abc");

    app.shutdown().await;
}

#[tokio::test]
async fn test_job_runs_under_request_context() {
    let recorder = Recorder::default();
    let app = Bootstrapper::with_mode("test")
        .without_env()
        .with_override("app_name", "propagated")
        .with_observer(Arc::new(recorder.clone()))
        .initialize()
        .await
        .unwrap();
    let router = app.router();

    let request = Request::builder()
        .method(Method::POST)
        .uri("/v1/jobs")
        .header(header::CONTENT_TYPE, "application/json")
        .header(REQUEST_ID_HEADER, "req-42")
        .body(Body::from(json!({"message": "hello"}).to_string()))
        .unwrap();
    let response = send(&router, request).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let accepted = json_body(response).await;
    assert_eq!(accepted["status"], "queued");
    assert_eq!(accepted["request_id"], "req-42");
    let id = accepted["id"].as_str().unwrap().to_string();

    let tasks = app.state().tasks().clone();
    wait_until(|| tasks.stats().succeeded == 2).await;

    let response = send(&router, get(&format!("/v1/jobs/{id}"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let job = json_body(response).await;
    assert_eq!(job["status"], "finished");
    assert_eq!(job["app_name"], "propagated");
    assert_eq!(job["request_id"], "req-42");

    let events = recorder.events.lock();
    let insert = events
        .iter()
        .find(|e| e.statement.starts_with("INSERT INTO job_runs"))
        .expect("insert was recorded");
    assert!(insert.succeeded);
    assert!(insert.params.contains("app_name:propagated"));
    assert!(insert.params.contains("request_id:req-42"));
    drop(events);

    let stats = tasks.stats();
    assert_eq!(stats.scheduled, 2, "job unit and job.finished handler");
    assert_eq!(stats.failed, 0);

    app.shutdown().await;
}

#[tokio::test]
async fn test_invalid_job_is_rejected() {
    let app = start(&[]).await;
    let router = app.router();

    let response = send(&router, post_json("/v1/jobs", &json!({"message": "   "}))).await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = json_body(response).await;
    assert_eq!(body["code"], "invalid_job");

    let response = send(&router, post_json("/v1/jobs", &json!({"text": "x"}))).await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json_body(response).await["code"], "invalid_body");

    let response = send(&router, get("/v1/jobs/missing")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["code"], "job_not_found");

    assert_eq!(app.state().tasks().stats().scheduled, 0);
    app.shutdown().await;
}

#[tokio::test]
async fn test_stats_and_meta() {
    let app = start(&[]).await;
    let router = app.router();

    let response = send(&router, get("/v1/jobs/stats")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let stats = json_body(response).await;
    assert_eq!(stats["scheduled"], 0);
    assert_eq!(stats["workers"], 2);

    let response = send(&router, get("/v1/meta/routes")).await;
    let body = json_body(response).await;
    let routes = body["routes"].as_array().unwrap();
    let prefixes: Vec<&str> = routes.iter().map(|r| r["prefix"].as_str().unwrap()).collect();
    assert_eq!(prefixes, ["/health", "/v1/jobs", "/v1/meta"]);
    assert_eq!(routes[1]["module"], "api.v1.jobs");

    let response = send(&router, get("/v1/meta/signals")).await;
    assert_eq!(json_body(response).await["signals"], json!(["job.finished"]));

    app.shutdown().await;
}

#[tokio::test]
async fn test_rate_limit_rejects_with_retry_after() {
    let app = start(&[
        ("rate_limit.enabled", "true"),
        ("rate_limit.requests", "2"),
        ("rate_limit.window_secs", "60"),
    ])
    .await;
    let router = app.router();

    for _ in 0..2 {
        assert_eq!(send(&router, get("/health")).await.status(), StatusCode::OK);
    }

    let response = send(&router, get("/health")).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response.headers()[header::RETRY_AFTER]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=60).contains(&retry_after));
    assert_eq!(json_body(response).await["code"], "too_many_requests");

    let other_client = Request::builder()
        .uri("/health")
        .header("x-forwarded-for", "10.0.0.9")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&router, other_client).await.status(), StatusCode::OK);

    app.shutdown().await;
}

#[tokio::test]
async fn test_timeout_and_panic_are_mapped() {
    let app = Bootstrapper::with_mode("test")
        .without_env()
        .with_override("server.request_timeout_secs", "1")
        .with_namespace(
            Namespace::new("custom").with_module(Module::routable("misbehaving", Misbehaving)),
        )
        .initialize()
        .await
        .unwrap();
    let router = app.router();

    let request = Request::builder()
        .uri("/misbehave/slow")
        .header(REQUEST_ID_HEADER, "slow-1")
        .body(Body::empty())
        .unwrap();
    let response = send(&router, request).await;
    assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    assert_eq!(response.headers()[REQUEST_ID_HEADER], "slow-1");
    assert_eq!(
        json_body(response).await,
        json!({"code": "request_timeout", "message": "request timed out"})
    );

    let response = send(&router, get("/misbehave/panic")).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(response.headers().contains_key(REQUEST_ID_HEADER));
    assert_eq!(
        json_body(response).await,
        json!({"code": "internal_error", "message": "internal server error"})
    );

    let response = send(&router, get("/misbehave/nothing")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    app.shutdown().await;
}
