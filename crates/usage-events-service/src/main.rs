use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use clap::{ArgAction, Parser};
use serde::Serialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::EnvFilter;
use usage_events_core::{now_utc, EventFilter, EventsError, IngestRequest, RetrievalLimits};
use usage_events_store_sqlite::SqliteEventStore;

mod locate;

use locate::{client_ip, IpApiLocator, IpLocator, StaticLocator};

const TOTAL_COUNT_HEADER: HeaderName = HeaderName::from_static("x-total-count");
const TRUNCATED_HEADER: HeaderName = HeaderName::from_static("x-results-truncated");

#[derive(Debug, Clone)]
struct ServiceState {
    db: PathBuf,
    limits: RetrievalLimits,
    operation_timeout: Duration,
    locator: Arc<dyn IpLocator>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    error: ServiceErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorPayload {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
    ceiling: usize,
    max_chunks: usize,
}

#[derive(Debug, Clone, Serialize)]
struct ReadinessResponse {
    status: &'static str,
    current_schema_version: Option<i64>,
    target_schema_version: i64,
}

#[derive(Debug, Parser)]
#[command(name = "usage-events-service")]
#[command(about = "HTTP service for recording and querying usage events")]
struct Args {
    #[arg(long, env = "USAGE_EVENTS_DB", default_value = "./usage_events.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "USAGE_EVENTS_BIND", default_value = "0.0.0.0:8080")]
    bind: SocketAddr,
    /// Comma-separated list; any origin is allowed when empty.
    #[arg(long, env = "ALLOWED_ORIGINS", value_delimiter = ',')]
    allowed_origins: Vec<String>,
    #[arg(long, default_value_t = 5000)]
    operation_timeout_ms: u64,
    #[arg(long, env = "USAGE_EVENTS_GEO_LOOKUP", default_value_t = true, action = ArgAction::Set)]
    geo_lookup: bool,
    #[arg(long, default_value_t = 2000)]
    geo_timeout_ms: u64,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            error: ServiceErrorPayload {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> ServiceFailure {
        ServiceFailure {
            status,
            code,
            message: message.into(),
            details,
        }
    }

    fn invalid_json(rejection: &JsonRejection) -> ServiceFailure {
        tracing::debug!(rejection = %rejection, "rejected request body");
        Self::failure(
            StatusCode::BAD_REQUEST,
            "invalid_json",
            rejection.body_text(),
            Some(json!({ "rejection": rejection.to_string() })),
        )
    }

    fn invalid_query(rejection: &QueryRejection) -> ServiceFailure {
        tracing::debug!(rejection = %rejection, "rejected query string");
        Self::failure(
            StatusCode::BAD_REQUEST,
            "invalid_query",
            rejection.body_text(),
            None,
        )
    }

    fn classify_error(
        err: &anyhow::Error,
        default_status: StatusCode,
        default_code: &'static str,
    ) -> ServiceFailure {
        let message = format!("{err:#}");
        match err.downcast_ref::<EventsError>() {
            Some(EventsError::Validation(_)) => {
                Self::failure(StatusCode::BAD_REQUEST, "validation_error", message, None)
            }
            Some(EventsError::Query(_)) => Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "query_failed",
                message,
                None,
            ),
            Some(EventsError::Configuration(_)) => Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "configuration_error",
                message,
                None,
            ),
            None => Self::failure(default_status, default_code, message, None),
        }
    }

    /// Runs `op` against a fresh store connection off the async runtime,
    /// bounded by the operation timeout.
    async fn run_blocking<T, F>(
        &self,
        default_status: StatusCode,
        default_code: &'static str,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteEventStore) -> anyhow::Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let mut store = SqliteEventStore::open(&db)?;
            op(&mut store)
        });

        let join_result = tokio::time::timeout(self.operation_timeout, handle)
            .await
            .map_err(|_| {
                tracing::warn!(
                    operation = operation_label,
                    timeout_ms = self.timeout_ms(),
                    "operation timed out"
                );
                Self::failure(
                    default_status,
                    default_code,
                    format!(
                        "{operation_label} timed out after {} ms",
                        self.timeout_ms()
                    ),
                    Some(json!({ "timeout_ms": self.timeout_ms() })),
                )
            })?;

        let op_result = join_result.map_err(|err| {
            tracing::error!(operation = operation_label, error = %err, "blocking task failed");
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                None,
            )
        })?;

        op_result.map_err(|err| {
            let failure = Self::classify_error(&err, default_status, default_code);
            if failure.status.is_server_error() {
                tracing::error!(operation = operation_label, error = %failure.message, "operation failed");
            } else {
                tracing::debug!(operation = operation_label, error = %failure.message, "operation rejected");
            }
            failure
        })
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.operation_timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

fn cors_layer(allowed_origins: &[String]) -> Result<CorsLayer> {
    let base = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    let origins: Vec<&str> = allowed_origins
        .iter()
        .map(|origin| origin.trim())
        .filter(|origin| !origin.is_empty())
        .collect();

    if origins.is_empty() || origins.contains(&"*") {
        tracing::warn!("ALLOWED_ORIGINS not set; allowing all origins");
        return Ok(base.allow_origin(Any));
    }

    let values = origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin)
                .with_context(|| format!("invalid allowed origin: {origin}"))
        })
        .collect::<Result<Vec<_>>>()?;
    tracing::info!(origins = ?origins, "allowed origins");

    Ok(base.allow_origin(values).allow_credentials(true))
}

fn app(state: ServiceState, cors: CorsLayer) -> Router {
    Router::new()
        .route("/api", get(list_events).post(record_event))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .layer(cors)
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    SqliteEventStore::open(&args.db)?
        .migrate()
        .context("failed to migrate events database")?;

    let locator: Arc<dyn IpLocator> = if args.geo_lookup {
        Arc::new(IpApiLocator::new(Duration::from_millis(args.geo_timeout_ms)))
    } else {
        Arc::new(StaticLocator::default())
    };
    let state = ServiceState {
        db: args.db,
        limits: RetrievalLimits::default(),
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        locator,
    };
    let cors = cors_layer(&args.allowed_origins)?;

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    tracing::info!(bind = %args.bind, "usage events service listening");
    axum::serve(
        listener,
        app(state, cors).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timeout_ms: state.timeout_ms(),
        ceiling: state.limits.ceiling,
        max_chunks: state.limits.max_chunks,
    })
}

async fn ready(
    State(state): State<ServiceState>,
) -> Result<Json<ReadinessResponse>, ServiceFailure> {
    let current = state
        .run_blocking(
            StatusCode::SERVICE_UNAVAILABLE,
            "schema_unavailable",
            "schema_version",
            |store| store.schema_version(),
        )
        .await?;
    let target = SqliteEventStore::target_schema_version();

    if current == Some(target) {
        return Ok(Json(ReadinessResponse {
            status: "ready",
            current_schema_version: current,
            target_schema_version: target,
        }));
    }

    Err(ServiceState::failure(
        StatusCode::SERVICE_UNAVAILABLE,
        "schema_unavailable",
        "database schema is not ready; restart the service to migrate",
        Some(json!({
            "current_schema_version": current,
            "target_schema_version": target,
        })),
    ))
}

async fn list_events(
    State(state): State<ServiceState>,
    query: Result<Query<EventFilter>, QueryRejection>,
) -> Result<Response, ServiceFailure> {
    let Query(filter) = query.map_err(|rejection| ServiceState::invalid_query(&rejection))?;
    let limits = state.limits;
    let retrieval = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_failed",
            "get_events",
            move |store| Ok(store.get_events_with_limits(&filter, limits)?),
        )
        .await?;

    let mut headers = HeaderMap::new();
    headers.insert(TOTAL_COUNT_HEADER, HeaderValue::from(retrieval.total_count));
    headers.insert(
        TRUNCATED_HEADER,
        HeaderValue::from_static(if retrieval.truncated { "true" } else { "false" }),
    );

    Ok((StatusCode::OK, headers, Json(retrieval.events)).into_response())
}

async fn record_event(
    State(state): State<ServiceState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    request_headers: HeaderMap,
    payload: Result<Json<IngestRequest>, JsonRejection>,
) -> Result<Response, ServiceFailure> {
    let Json(request) = payload.map_err(|rejection| ServiceState::invalid_json(&rejection))?;
    let user_ip = client_ip(&request_headers, peer.map(|ConnectInfo(addr)| addr));
    let locator = Arc::clone(&state.locator);

    let record = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "write_failed",
            "save_event",
            move |store| {
                let user_location = locator.locate(&user_ip);
                let input = request.into_input(user_ip, user_location, now_utc())?;
                store.save_event(&input)
            },
        )
        .await?;

    tracing::info!(
        event = %record.event,
        path = %record.path,
        user_ip = %record.user_ip,
        "recorded event"
    );

    Ok((StatusCode::CREATED, Json(record)).into_response())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("usage-events-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn migrated_db() -> PathBuf {
        let db_path = unique_temp_db_path();
        let migrated = SqliteEventStore::open(&db_path).and_then(|store| store.migrate());
        if let Err(err) = migrated {
            panic!("failed to migrate test database: {err:#}");
        }
        db_path
    }

    fn test_state(db: PathBuf, limits: RetrievalLimits) -> ServiceState {
        ServiceState {
            db,
            limits,
            operation_timeout: Duration::from_millis(2500),
            locator: Arc::new(StaticLocator::new("Testville, Test Region, Testland")),
        }
    }

    fn test_app(state: ServiceState) -> Router {
        match cors_layer(&[]) {
            Ok(cors) => app(state, cors),
            Err(err) => panic!("failed to build cors layer: {err:#}"),
        }
    }

    async fn send(router: Router, request: Request<Body>) -> Response {
        match router.oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .method("GET")
            .body(Body::empty())
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    fn post_request(body: &str, forwarded_for: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .uri("/api")
            .method("POST")
            .header("content-type", "application/json");
        if let Some(value) = forwarded_for {
            builder = builder.header("x-forwarded-for", value);
        }
        builder
            .body(Body::from(body.to_string()))
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 4 * 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    fn header_str(response: &Response, name: &str) -> String {
        response
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    async fn record(state: &ServiceState, body: serde_json::Value) {
        let response = send(test_app(state.clone()), post_request(&body.to_string(), None)).await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn health_endpoint_reports_limits() {
        let state = test_state(unique_temp_db_path(), RetrievalLimits::default());
        let response = send(test_app(state), get_request("/health")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(value["status"], json!("ok"));
        assert_eq!(value["ceiling"], json!(1000));
        assert_eq!(value["max_chunks"], json!(10));
    }

    #[tokio::test]
    async fn ready_endpoint_tracks_schema_state() {
        let db_path = migrated_db();
        let response = send(
            test_app(test_state(db_path.clone(), RetrievalLimits::default())),
            get_request("/ready"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_json(response).await["status"], json!("ready"));

        let fresh = unique_temp_db_path();
        let response = send(
            test_app(test_state(fresh.clone(), RetrievalLimits::default())),
            get_request("/ready"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response_json(response).await["error"]["code"],
            json!("schema_unavailable")
        );

        let _ = std::fs::remove_file(&db_path);
        let _ = std::fs::remove_file(&fresh);
    }

    #[tokio::test]
    async fn post_records_event_with_client_ip_and_location() {
        let db_path = migrated_db();
        let state = test_state(db_path.clone(), RetrievalLimits::default());

        let body = json!({
            "service": "docs",
            "event": "page_view",
            "path": "/guide",
            "user_browser": "Firefox",
            "metadata": {"plan": "pro", "seats": 3}
        });
        let response = send(
            test_app(state),
            post_request(&body.to_string(), Some("198.51.100.4, 10.0.0.1")),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let value = response_json(response).await;
        assert_eq!(value["service"], json!("docs"));
        assert_eq!(value["user_ip"], json!("198.51.100.4"));
        assert_eq!(value["user_location"], json!("Testville, Test Region, Testland"));
        assert_eq!(value["metadata"], json!({"plan": "pro", "seats": 3}));
        assert!(value["timestamp"].as_str().is_some_and(|ts| ts.ends_with('Z')));

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn post_without_client_ip_records_unknown_location() {
        let db_path = migrated_db();
        let state = test_state(db_path.clone(), RetrievalLimits::default());

        let body = json!({"service": "docs", "event": "click", "path": "/"});
        let response = send(test_app(state), post_request(&body.to_string(), None)).await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let value = response_json(response).await;
        assert_eq!(value["user_location"], json!("Unknown"));

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn post_rejects_malformed_json_and_blank_fields() {
        let db_path = migrated_db();
        let state = test_state(db_path.clone(), RetrievalLimits::default());

        let response = send(test_app(state.clone()), post_request("{not json", None)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response_json(response).await["error"]["code"], json!("invalid_json"));

        let missing_path = json!({"service": "docs", "event": "click"});
        let response = send(
            test_app(state.clone()),
            post_request(&missing_path.to_string(), None),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let blank = json!({"service": "docs", "event": "", "path": "/"});
        let response = send(test_app(state.clone()), post_request(&blank.to_string(), None)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response_json(response).await["error"]["code"],
            json!("validation_error")
        );

        let bad_timestamp =
            json!({"service": "docs", "event": "click", "path": "/", "timestamp": "yesterday"});
        let response = send(test_app(state), post_request(&bad_timestamp.to_string(), None)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn get_filters_events_and_reports_count_headers() {
        let db_path = migrated_db();
        let state = test_state(db_path.clone(), RetrievalLimits::default());

        record(
            &state,
            json!({"service": "docs", "event": "page_view", "path": "/guide/a",
                   "user_device": "mobile", "timestamp": "2026-02-07T12:00:00Z"}),
        )
        .await;
        record(
            &state,
            json!({"service": "docs", "event": "page_view", "path": "/guide/b",
                   "user_device": "desktop", "timestamp": "2026-02-07T13:00:00Z"}),
        )
        .await;
        record(
            &state,
            json!({"service": "blog", "event": "page_view", "path": "/guide/c",
                   "timestamp": "2026-02-07T14:00:00Z"}),
        )
        .await;

        let response = send(
            test_app(state.clone()),
            get_request("/api?service=docs&path=guide"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_str(&response, "x-total-count"), "2");
        assert_eq!(header_str(&response, "x-results-truncated"), "false");
        let value = response_json(response).await;
        assert_eq!(value[0]["path"], json!("/guide/b"));
        assert_eq!(value[1]["path"], json!("/guide/a"));

        let response = send(test_app(state), get_request("/api?device=mobile")).await;
        let value = response_json(response).await;
        assert_eq!(value.as_array().map(Vec::len), Some(1));
        assert_eq!(value[0]["path"], json!("/guide/a"));

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn get_over_ceiling_returns_capped_newest_first_results() {
        let db_path = migrated_db();
        let limits = RetrievalLimits {
            ceiling: 4,
            max_chunks: 10,
        };
        let state = test_state(db_path.clone(), limits);

        for minute in 0..10 {
            record(
                &state,
                json!({"service": "docs", "event": "tick", "path": format!("/m/{minute}"),
                       "timestamp": format!("2026-02-07T12:{minute:02}:00Z")}),
            )
            .await;
        }

        let response = send(
            test_app(state),
            get_request("/api?from=2026-02-07T12:00:00Z&to=2026-02-07T12:09:00Z"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_str(&response, "x-total-count"), "10");
        assert_eq!(header_str(&response, "x-results-truncated"), "true");

        let value = response_json(response).await;
        let paths: Vec<&str> = value
            .as_array()
            .map(|events| events.iter().filter_map(|e| e["path"].as_str()).collect())
            .unwrap_or_default();
        assert_eq!(paths, vec!["/m/9", "/m/8", "/m/7", "/m/6"]);

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn storage_failure_maps_to_internal_error() {
        let missing_dir = std::env::temp_dir()
            .join(format!("usage-events-missing-{}", ulid::Ulid::new()))
            .join("events.sqlite3");
        let state = test_state(missing_dir, RetrievalLimits::default());

        let response = send(test_app(state.clone()), get_request("/api")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response_json(response).await["error"]["code"], json!("query_failed"));

        let body = json!({"service": "docs", "event": "click", "path": "/"});
        let response = send(test_app(state), post_request(&body.to_string(), None)).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response_json(response).await["error"]["code"], json!("write_failed"));
    }

    #[tokio::test]
    async fn unmigrated_database_reports_query_failure() {
        let db_path = unique_temp_db_path();
        let state = test_state(db_path.clone(), RetrievalLimits::default());

        let response = send(test_app(state), get_request("/api")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response_json(response).await["error"]["code"], json!("query_failed"));

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn explicit_origins_answer_preflight_with_credentials() {
        let origins = vec!["https://app.example.com".to_string()];
        let cors = match cors_layer(&origins) {
            Ok(cors) => cors,
            Err(err) => panic!("failed to build cors layer: {err:#}"),
        };
        let router = app(
            test_state(unique_temp_db_path(), RetrievalLimits::default()),
            cors,
        );

        let request = Request::builder()
            .uri("/api")
            .method("OPTIONS")
            .header("origin", "https://app.example.com")
            .header("access-control-request-method", "POST")
            .body(Body::empty())
            .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        let response = send(router, request).await;

        assert_eq!(
            header_str(&response, "access-control-allow-origin"),
            "https://app.example.com"
        );
        assert_eq!(header_str(&response, "access-control-allow-credentials"), "true");
    }

    #[test]
    fn invalid_origin_is_a_startup_error() {
        assert!(cors_layer(&["bad\norigin".to_string()]).is_err());
    }
}
