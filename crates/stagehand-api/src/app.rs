use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::middleware::require_json;
use crate::state::AppState;

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::status_or_release).post(handlers::checkout))
        .route("/configure", post(handlers::configure).get(handlers::get_configuration))
        .route("/register", post(handlers::register))
        .layer(middleware::from_fn(require_json))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use stagehand_checkout::RecordingEventClient;
    use stagehand_config::Config;
    use stagehand_store::{InMemoryStore, Keys, Store};
    use tower::util::ServiceExt;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config() -> Config {
        Config::from_map(&HashMap::from([
            ("WAIT_FOR_IUT_TIMEOUT".to_string(), "1".to_string()),
            ("WAIT_FOR_EXECUTION_SPACE_TIMEOUT".to_string(), "1".to_string()),
            ("WAIT_FOR_LOG_AREA_TIMEOUT".to_string(), "1".to_string()),
            ("EVENT_DATA_TIMEOUT".to_string(), "1".to_string()),
        ]))
        .unwrap()
    }

    fn recipe(id: &str, runner: &str) -> Value {
        json!({
            "id": id,
            "testCase": {"id": format!("case-{id}"), "tracker": "", "url": ""},
            "constraints": [
                {"key": "ENVIRONMENT", "value": {}},
                {"key": "COMMAND", "value": "pytest"},
                {"key": "EXECUTE", "value": []},
                {"key": "CHECKOUT", "value": []},
                {"key": "PARAMETERS", "value": {}},
                {"key": "TEST_RUNNER", "value": runner},
            ],
        })
    }

    fn tercc() -> Value {
        json!({
            "meta": {"id": "testrun-1"},
            "links": [{"type": "CAUSE", "target": "artifact-1"}],
            "data": {"batches": [
                {"name": "SuiteA", "recipes": [recipe("t1", "runner-a")]},
                {"name": "SuiteB", "recipes": [recipe("t2", "runner-b")]},
            ]},
        })
    }

    struct Harness {
        app: Router,
        store: Arc<InMemoryStore>,
        events: Arc<RecordingEventClient>,
        _server: MockServer,
    }

    async fn harness() -> Harness {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;

        let store = Arc::new(InMemoryStore::new());
        let events = Arc::new(RecordingEventClient::default());
        let state = AppState::new(
            store.clone() as Arc<dyn Store>,
            config(),
            events.clone(),
            Some(tercc()),
        );
        Harness { app: build_app(state), store, events, _server: server }
    }

    fn provider_document(kind_key: &str, id: &str, pool_key: &str) -> Value {
        json!({
            kind_key: {
                "id": id,
                "list": {
                    "possible": format!("$pools.{pool_key}.possible"),
                    "available": format!("$pools.{pool_key}.available"),
                },
                "checkin": true,
            }
        })
    }

    async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json")
            .header("accept", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("accept", "application/json")
            .body(Body::empty())
            .unwrap()
    }

    async fn register_and_configure(harness: &Harness, upload_url: &str) {
        let (status, _) = call(
            &harness.app,
            post(
                "/register",
                json!({
                    "iut_provider": provider_document("iut", "local-iuts", "iut"),
                    "execution_space_provider":
                        provider_document("execution_space", "local-execs", "executor"),
                    "log_area_provider": provider_document("log", "local-logs", "log_area"),
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let pool = |prefix: &str, upload: bool| {
            let descriptors: Vec<Value> = (0..2)
                .map(|i| {
                    if upload {
                        json!({
                            "name": format!("{prefix}-{i}"),
                            "upload": {"url": upload_url, "method": "PUT"},
                        })
                    } else {
                        json!({"name": format!("{prefix}-{i}")})
                    }
                })
                .collect();
            json!({"possible": descriptors, "available": descriptors})
        };
        let (status, _) = call(
            &harness.app,
            post(
                "/configure",
                json!({
                    "suite_id": "testrun-1",
                    "iut_provider": "local-iuts",
                    "execution_space_provider": "local-execs",
                    "log_area_provider": "local-logs",
                    "dataset": {
                        "identity": "pkg:generic/product@1.0.0",
                        "pools": {
                            "iut": pool("iut", false),
                            "executor": pool("exec", false),
                            "log_area": pool("log", true),
                        },
                    },
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    async fn run_checkout(harness: &Harness) -> String {
        let (status, body) = call(
            &harness.app,
            post("/", json!({"suite_id": "testrun-1", "suite_runner_ids": ["started-1", "started-2"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "got: {body}");
        assert_eq!(body["result"], "success");
        let task_id = body["data"]["id"].as_str().unwrap().to_string();

        for _ in 0..200 {
            let (_, body) = call(&harness.app, get(&format!("/?id={task_id}"))).await;
            match body["status"].as_str() {
                Some("SUCCESS") => return task_id,
                Some("FAILURE") => panic!("checkout failed: {body}"),
                _ => tokio::time::sleep(Duration::from_millis(25)).await,
            }
        }
        panic!("checkout task never finished");
    }

    #[tokio::test]
    async fn register_without_any_provider_is_a_bad_request() {
        let harness = harness().await;
        let (status, body) = call(&harness.app, post("/register", json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("iut_provider"));
    }

    #[tokio::test]
    async fn configure_requires_every_field() {
        let harness = harness().await;
        let (status, _) =
            call(&harness.app, post("/configure", json!({"suite_id": "testrun-1"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn configure_round_trips_through_get() {
        let harness = harness().await;
        let server_url = format!("{}/logs/up", harness._server.uri());
        register_and_configure(&harness, &server_url).await;

        let (status, body) = call(&harness.app, get("/configure?suite_id=testrun-1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["iut_provider"]["iut"]["id"], "local-iuts");
        assert!(body["dataset"]["pools"].is_object());

        let (status, _) = call(&harness.app, get("/configure")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn checkout_requires_suite_id_and_runner_ids() {
        let harness = harness().await;
        let (status, _) =
            call(&harness.app, post("/", json!({"suite_id": "testrun-1"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_query_parameters_are_a_bad_request() {
        let harness = harness().await;
        let (status, _) = call(&harness.app, get("/")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn non_json_content_type_is_rejected() {
        let harness = harness().await;
        let request = Request::builder()
            .method(Method::POST)
            .uri("/register")
            .header("content-type", "text/plain")
            .header("accept", "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let (status, _) = call(&harness.app, request).await;
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn non_json_accept_header_is_rejected() {
        let harness = harness().await;
        let request = Request::builder()
            .uri("/?id=00000000-0000-0000-0000-000000000000")
            .header("accept", "text/html")
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(&harness.app, request).await;
        assert_eq!(status, StatusCode::NOT_ACCEPTABLE);
    }

    #[tokio::test]
    async fn checkout_produces_one_sub_suite_per_suite_runner_id() {
        let harness = harness().await;
        let upload = format!("{}/logs/{{folder}}/{{name}}", harness._server.uri());
        register_and_configure(&harness, &upload).await;
        run_checkout(&harness).await;

        let sub_suites: Vec<Value> = harness
            .store
            .get_prefix(&Keys::suite_prefix("testrun-1"))
            .await
            .unwrap()
            .into_iter()
            .map(|(_, payload)| serde_json::from_slice(&payload).unwrap())
            .collect();
        assert_eq!(sub_suites.len(), 2);

        // One sub-suite per suite runner id, with distinct started ids.
        let mut started: Vec<&str> = sub_suites
            .iter()
            .map(|s| s["test_suite_started_id"].as_str().unwrap())
            .collect();
        started.sort_unstable();
        assert_eq!(started, vec!["started-1", "started-2"]);

        // Every environment announced exactly once.
        let announced = harness.events.environments.lock().unwrap();
        assert_eq!(announced.len(), 2);
    }

    #[tokio::test]
    async fn release_then_checkout_again_succeeds() {
        let harness = harness().await;
        let upload = format!("{}/logs/{{folder}}/{{name}}", harness._server.uri());
        register_and_configure(&harness, &upload).await;
        let task_id = run_checkout(&harness).await;

        let (status, body) = call(&harness.app, get(&format!("/?release={task_id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "SUCCESS", "got: {body}");
        assert!(harness
            .store
            .get_prefix(&Keys::testrun_prefix("testrun-1"))
            .await
            .unwrap()
            .is_empty());

        // A released testrun can be configured and checked out again.
        register_and_configure(&harness, &upload).await;
        run_checkout(&harness).await;
        let sub_suites = harness
            .store
            .get_prefix(&Keys::suite_prefix("testrun-1"))
            .await
            .unwrap();
        assert_eq!(sub_suites.len(), 2);
    }

    #[tokio::test]
    async fn single_release_removes_one_environment() {
        let harness = harness().await;
        let upload = format!("{}/logs/{{folder}}/{{name}}", harness._server.uri());
        register_and_configure(&harness, &upload).await;
        run_checkout(&harness).await;

        let environment_id = {
            let announced = harness.events.environments.lock().unwrap();
            announced[0].event_id.to_string()
        };
        let (status, body) =
            call(&harness.app, get(&format!("/?single_release={environment_id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "SUCCESS", "got: {body}");

        let remaining = harness
            .store
            .get_prefix(&Keys::suite_prefix("testrun-1"))
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
    }
}
