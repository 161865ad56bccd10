use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;
use turbine_api::background::{self, TabActivated, TabUpdated};
use turbine_api::{MigrateResult, TurbineApi, API_CONTRACT_VERSION};
use turbine_core::{
    ComponentDeployment, Environment, EnvironmentLink, MatrixView, MessageAck,
    NamespaceComponentTable, RuntimeMessage, Settings, VisibleEnvironments, VisitedEnvironment,
};
use turbine_store_sqlite::SchemaStatus;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Clone)]
struct ServiceState {
    api: TurbineApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct VisitResponse {
    recorded: bool,
    visit: Option<VisitedEnvironment>,
}

#[derive(Debug, Clone, Deserialize)]
struct RecentQuery {
    q: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct RemovedResponse {
    removed: usize,
}

#[derive(Debug, Clone, Serialize)]
struct ClearedResponse {
    cleared: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct SettingsRequest {
    base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ToggleRequest {
    environment: Environment,
}

#[derive(Debug, Clone, Deserialize)]
struct NavigateQuery {
    namespace: String,
    environment: Environment,
    path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct NavigateResponse {
    url: String,
}

#[derive(Debug, Parser)]
#[command(name = "turbine-service")]
#[command(about = "Local HTTP service for the Turbine navigator")]
struct Args {
    #[arg(long, default_value = "./turbine.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(message: impl Into<String>) -> ServiceError {
        ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
        }
    }
}

type ServiceResult<T> = Result<Json<ServiceEnvelope<T>>, ServiceError>;

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn respond<T: Serialize>(result: anyhow::Result<T>) -> ServiceResult<T> {
    result
        .map(|data| Json(envelope(data)))
        .map_err(|err| ServiceState::error(err.to_string()))
}

/// Storage failures on presentation reads degrade to an empty payload.
fn respond_or_default<T>(
    result: anyhow::Result<T>,
    what: &'static str,
) -> Json<ServiceEnvelope<T>>
where
    T: Serialize + Default,
{
    let data = result.unwrap_or_else(|err| {
        tracing::warn!(error = %err, what, "storage read failed; serving empty result");
        T::default()
    });
    Json(envelope(data))
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/messages", post(messages))
        .route("/v1/tabs/updated", post(tab_updated))
        .route("/v1/tabs/activated", post(tab_activated))
        .route("/v1/recent", get(recent_list).delete(recent_clear))
        .route("/v1/recent/:id", delete(recent_remove))
        .route("/v1/recent/:id/links", get(recent_links))
        .route("/v1/components", get(components_list).delete(components_clear))
        .route("/v1/components/table", get(components_table))
        .route("/v1/components/matrix", get(components_matrix))
        .route("/v1/components/namespaces/:namespace", delete(components_delete_namespace))
        .route("/v1/settings", get(settings_show).put(settings_save))
        .route("/v1/visible-environments", get(visible_show).put(visible_save))
        .route("/v1/visible-environments/toggle", post(visible_toggle))
        .route("/v1/visible-environments/show-all", post(visible_show_all))
        .route("/v1/navigate", get(navigate))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let state = ServiceState {
        api: TurbineApi::open(&args.db)?,
    };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, db = %args.db.display(), "turbine service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn messages(
    State(state): State<ServiceState>,
    Json(message): Json<RuntimeMessage>,
) -> Json<ServiceEnvelope<MessageAck>> {
    Json(envelope(background::handle_runtime_message(&state.api, message)))
}

async fn tab_updated(
    State(state): State<ServiceState>,
    Json(event): Json<TabUpdated>,
) -> Json<ServiceEnvelope<VisitResponse>> {
    let visit = background::on_tab_updated(&state.api, &event);
    Json(envelope(VisitResponse {
        recorded: visit.is_some(),
        visit,
    }))
}

async fn tab_activated(
    State(state): State<ServiceState>,
    Json(event): Json<TabActivated>,
) -> Json<ServiceEnvelope<VisitResponse>> {
    let visit = background::on_tab_activated(&state.api, &event);
    Json(envelope(VisitResponse {
        recorded: visit.is_some(),
        visit,
    }))
}

async fn recent_list(
    State(state): State<ServiceState>,
    Query(query): Query<RecentQuery>,
) -> Json<ServiceEnvelope<Vec<VisitedEnvironment>>> {
    respond_or_default(state.api.recent(query.q.as_deref()), "recent environments")
}

async fn recent_remove(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
) -> ServiceResult<RemovedResponse> {
    let removed = state.api.remove_recent(&id).map(usize::from);
    respond(removed.map(|removed| RemovedResponse { removed }))
}

async fn recent_clear(State(state): State<ServiceState>) -> ServiceResult<ClearedResponse> {
    let result = state.api.clear_recent();
    respond(result.map(|()| ClearedResponse { cleared: true }))
}

async fn recent_links(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
) -> ServiceResult<Vec<EnvironmentLink>> {
    respond(state.api.recent_links(&id))
}

async fn components_list(
    State(state): State<ServiceState>,
) -> Json<ServiceEnvelope<Vec<ComponentDeployment>>> {
    respond_or_default(state.api.components(), "component deployments")
}

async fn components_table(
    State(state): State<ServiceState>,
) -> Json<ServiceEnvelope<NamespaceComponentTable>> {
    respond_or_default(state.api.component_table(), "component table")
}

async fn components_matrix(State(state): State<ServiceState>) -> Json<ServiceEnvelope<MatrixView>> {
    respond_or_default(state.api.component_matrix(), "component matrix")
}

async fn components_delete_namespace(
    State(state): State<ServiceState>,
    Path(namespace): Path<String>,
) -> ServiceResult<RemovedResponse> {
    let removed = state.api.delete_namespace(&namespace);
    respond(removed.map(|removed| RemovedResponse { removed }))
}

async fn components_clear(State(state): State<ServiceState>) -> ServiceResult<ClearedResponse> {
    let result = state.api.clear_components();
    respond(result.map(|()| ClearedResponse { cleared: true }))
}

async fn settings_show(State(state): State<ServiceState>) -> Json<ServiceEnvelope<Settings>> {
    respond_or_default(state.api.settings(), "settings")
}

/// A failed save is not persisted; the response reports the unconfigured default.
async fn settings_save(
    State(state): State<ServiceState>,
    Json(request): Json<SettingsRequest>,
) -> Json<ServiceEnvelope<Settings>> {
    respond_or_default(state.api.save_settings(&request.base_url), "settings save")
}

async fn visible_show(State(state): State<ServiceState>) -> ServiceResult<VisibleEnvironments> {
    respond(state.api.visible_environments())
}

async fn visible_save(
    State(state): State<ServiceState>,
    Json(environments): Json<Vec<Environment>>,
) -> ServiceResult<VisibleEnvironments> {
    respond(state.api.set_visible_environments(environments))
}

async fn visible_toggle(
    State(state): State<ServiceState>,
    Json(request): Json<ToggleRequest>,
) -> ServiceResult<VisibleEnvironments> {
    respond(state.api.toggle_environment(request.environment))
}

async fn visible_show_all(State(state): State<ServiceState>) -> ServiceResult<VisibleEnvironments> {
    respond(state.api.show_all_environments())
}

async fn navigate(
    State(state): State<ServiceState>,
    Query(query): Query<NavigateQuery>,
) -> ServiceResult<NavigateResponse> {
    respond(
        state
            .api
            .navigation_url(&query.namespace, query.environment, query.path.as_deref())
            .map(|url| NavigateResponse { url }),
    )
}

async fn db_schema_version(State(state): State<ServiceState>) -> ServiceResult<SchemaStatus> {
    respond(state.api.schema_status())
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> ServiceResult<MigrateResult> {
    respond(state.api.migrate(request.dry_run))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::anyhow;
    use axum::body::{to_bytes, Body};
    use http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use turbine_store_sqlite::{KeyValueBackend, MemoryBackend};

    use super::*;

    struct FailingBackend;

    impl KeyValueBackend for FailingBackend {
        fn get(&self, _key: &str) -> Result<Option<Value>> {
            Err(anyhow!("storage unavailable"))
        }

        fn set(&self, _key: &str, _value: &Value) -> Result<()> {
            Err(anyhow!("storage unavailable"))
        }

        fn remove(&self, _key: &str) -> Result<()> {
            Err(anyhow!("storage unavailable"))
        }

        fn keys(&self) -> Result<Vec<String>> {
            Err(anyhow!("storage unavailable"))
        }
    }

    fn memory_app() -> Router {
        app(ServiceState {
            api: TurbineApi::new(MemoryBackend::shared()),
        })
    }

    fn failing_app() -> Router {
        app(ServiceState {
            api: TurbineApi::new(Arc::new(FailingBackend)),
        })
    }

    async fn response_json(response: Response) -> Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => panic!(
                "response body is not JSON: {err}; body={}",
                String::from_utf8_lossy(&bytes)
            ),
        }
    }

    async fn send(
        router: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let builder = Request::builder().uri(uri).method(method);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .unwrap_or_else(|err| panic!("failed to build request: {err}"));

        let response = match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        let status = response.status();
        (status, response_json(response).await)
    }

    fn component(namespace: &str, environment: &str, name: &str, version: &str) -> Value {
        json!({
            "component_name": name,
            "version": version,
            "namespace": namespace,
            "environment": environment,
            "env_type": environment,
            "extracted_at": "2026-01-05T10:00:00Z"
        })
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let (status, value) = send(&memory_app(), "GET", "/v1/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            value.get("service_contract_version").and_then(Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(value["data"]["status"], "ok");
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn tab_events_record_visits_once_configured() {
        let router = memory_app();
        let page = "https://host/environments/billing-service-prod/view/DEPLOYMENTS";

        let (_, ignored) = send(
            &router,
            "POST",
            "/v1/tabs/updated",
            Some(json!({ "status": "complete", "url": page })),
        )
        .await;
        assert_eq!(ignored["data"]["recorded"], false);

        let settings = json!({ "base_url": "https://host/" });
        let (status, saved) = send(&router, "PUT", "/v1/settings", Some(settings)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(saved["data"]["base_url"], "https://host");

        let (_, loading) = send(
            &router,
            "POST",
            "/v1/tabs/updated",
            Some(json!({ "status": "loading", "url": page })),
        )
        .await;
        assert_eq!(loading["data"]["recorded"], false);

        let (_, recorded) = send(
            &router,
            "POST",
            "/v1/tabs/activated",
            Some(json!({ "url": page })),
        )
        .await;
        assert_eq!(recorded["data"]["visit"]["namespace"], "billing-service");
        assert_eq!(recorded["data"]["visit"]["environment"], "prod");
        assert_eq!(recorded["data"]["visit"]["qa_uat1_preference"], "undetermined");

        let (_, listed) = send(&router, "GET", "/v1/recent?q=billing", None).await;
        assert_eq!(listed["data"].as_array().map(Vec::len), Some(1));
        let id = listed["data"][0]["id"].as_str().unwrap_or_default();

        let (_, links) = send(&router, "GET", &format!("/v1/recent/{id}/links"), None).await;
        assert_eq!(links["data"].as_array().map(Vec::len), Some(6));

        let (_, removed) = send(&router, "DELETE", &format!("/v1/recent/{id}"), None).await;
        assert_eq!(removed["data"]["removed"], 1);
        let (_, cleared) = send(&router, "DELETE", "/v1/recent", None).await;
        assert_eq!(cleared["data"]["cleared"], true);
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn component_messages_feed_table_and_matrix() {
        let router = memory_app();
        let message = json!({
            "type": "COMPONENT_DATA",
            "payload": [
                component("svc", "dev", "api", "1.1.0"),
                component("svc", "prod", "api", "1.0.0")
            ]
        });
        let (status, ack) = send(&router, "POST", "/v1/messages", Some(message)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["data"], json!({ "success": true }));

        let (_, table) = send(&router, "GET", "/v1/components/table", None).await;
        let svc = &table["data"]["namespaces"]["svc"];
        assert_eq!(svc["environments"], json!(["dev", "prod"]));

        let (_, visible) = send(
            &router,
            "POST",
            "/v1/visible-environments/toggle",
            Some(json!({ "environment": "prod" })),
        )
        .await;
        assert_eq!(visible["data"].as_array().map(Vec::len), Some(5));

        let (_, matrix) = send(&router, "GET", "/v1/components/matrix", None).await;
        let first = &matrix["data"]["namespaces"][0];
        assert_eq!(first["environments"], json!(["dev"]));
        assert_eq!(first["rows"][0]["cells"][0]["version"], "1.1.0");

        let (_, shown) = send(&router, "POST", "/v1/visible-environments/show-all", None).await;
        assert_eq!(shown["data"].as_array().map(Vec::len), Some(6));

        let (_, removed) = send(&router, "DELETE", "/v1/components/namespaces/svc", None).await;
        assert_eq!(removed["data"]["removed"], 2);
        let (_, listed) = send(&router, "GET", "/v1/components", None).await;
        assert_eq!(listed["data"], json!([]));
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn invalid_requests_use_error_envelope() {
        let router = memory_app();

        let (status, error) = send(
            &router,
            "GET",
            "/v1/navigate?namespace=svc&environment=dev",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let message = error["error"].as_str().unwrap_or_default();
        assert!(message.contains("not configured"));

        let unknown = json!(["unknown"]);
        let (status, error) = send(&router, "PUT", "/v1/visible-environments", Some(unknown)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error["service_contract_version"], SERVICE_CONTRACT_VERSION);

        let (status, _) = send(&router, "POST", "/v1/db/schema-version", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    // Test IDs: TSVC-005
    #[tokio::test]
    async fn navigate_builds_environment_url() {
        let router = memory_app();
        let settings = json!({ "base_url": "https://host" });
        send(&router, "PUT", "/v1/settings", Some(settings)).await;

        let (status, built) = send(
            &router,
            "GET",
            "/v1/navigate?namespace=svc&environment=uat1&path=view/LOGS",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            built["data"]["url"],
            "https://host/environments/svc-uat1/view/LOGS"
        );
    }

    // Test IDs: TSVC-006
    #[tokio::test]
    async fn recent_list_is_empty_when_storage_fails() {
        let (status, listed) = send(&failing_app(), "GET", "/v1/recent?q=svc", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed["data"], json!([]));
    }

    // Test IDs: TSVC-007
    #[tokio::test]
    async fn component_views_are_empty_when_storage_fails() {
        let router = failing_app();

        let (status, table) = send(&router, "GET", "/v1/components/table", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(table["data"]["namespaces"], json!({}));

        let (status, matrix) = send(&router, "GET", "/v1/components/matrix", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(matrix["data"]["namespaces"], json!([]));

        let (status, listed) = send(&router, "GET", "/v1/components", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed["data"], json!([]));
    }

    // Test IDs: TSVC-008
    #[tokio::test]
    async fn settings_save_is_not_persisted_when_storage_fails() {
        let router = failing_app();
        let body = json!({ "base_url": "https://host" });

        let (status, saved) = send(&router, "PUT", "/v1/settings", Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(saved["data"]["base_url"], "");

        let (status, shown) = send(&router, "GET", "/v1/settings", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(shown["data"]["base_url"], "");
    }

    #[tokio::test]
    async fn sqlite_backed_service_reports_schema() {
        let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
        let db_path = std::env::temp_dir().join(format!("turbine-service-{nanos}.sqlite3"));
        let api = TurbineApi::open(&db_path)
            .unwrap_or_else(|err| panic!("failed to open api: {err}"));
        let router = app(ServiceState { api });

        let (status, schema) = send(&router, "POST", "/v1/db/schema-version", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(schema["data"]["pending_versions"], json!([]));

        let dry_run = json!({ "dry_run": true });
        let (_, migrated) = send(&router, "POST", "/v1/db/migrate", Some(dry_run)).await;
        assert_eq!(migrated["data"]["dry_run"], true);

        let _ = std::fs::remove_file(&db_path);
    }
}
