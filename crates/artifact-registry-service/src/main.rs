use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use artifact_registry_core::ears::{analyze, EarsPattern, EarsReport};
use artifact_registry_core::{
    Actor, AllowedTransitions, Artifact, ArtifactEvent, ArtifactFilter, ArtifactPatch,
    ArtifactType, ExportDocument, HistoryAudit, Linkage, NewArtifact, NewLinkage,
    ProjectStatistics, Status, TransitionRequest, WorkflowError,
};
use artifact_registry_store_sqlite::{workflow_error, ImportReport, SchemaStatus, SqliteRegistryStore};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");
const USER_ID_HEADER: &str = "x-user-id";
const USER_NAME_HEADER: &str = "x-user-name";

/// Opens a store per operation; handlers run it on the blocking pool.
#[derive(Debug, Clone)]
struct RegistryApi {
    db_path: PathBuf,
}

impl RegistryApi {
    fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn store(&self) -> Result<SqliteRegistryStore> {
        SqliteRegistryStore::open(&self.db_path)
    }

    fn migrate(&self) -> Result<()> {
        self.store()?.migrate()
    }
}

#[derive(Debug, Clone)]
struct ServiceState {
    api: RegistryApi,
    operation_timeout: Duration,
    require_actor: bool,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
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

#[derive(Debug, Clone, Deserialize)]
struct TransitionBody {
    from_status: Status,
    to_status: Status,
    #[serde(default)]
    rationale: Option<String>,
    #[serde(default)]
    comment: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct EarsBody {
    text: String,
    #[serde(default)]
    pattern: Option<EarsPattern>,
    #[serde(default)]
    system: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service_contract_version: &'static str,
    timeout_ms: u64,
    require_actor: bool,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Clone, Serialize)]
struct ReadinessResponse {
    status: &'static str,
    checks: SchemaStatus,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    invalid_json_total: AtomicU64,
    validation_error_total: AtomicU64,
    not_found_total: AtomicU64,
    conflict_total: AtomicU64,
    invalid_transition_total: AtomicU64,
    actor_required_total: AtomicU64,
    internal_error_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    invalid_json_total: u64,
    validation_error_total: u64,
    not_found_total: u64,
    conflict_total: u64,
    invalid_transition_total: u64,
    actor_required_total: u64,
    internal_error_total: u64,
}

#[derive(Debug, Parser)]
#[command(name = "artifact-registry-service")]
#[command(about = "HTTP service for the artifact registry status workflow")]
struct Args {
    #[arg(long, default_value = "./artifact_registry.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4010")]
    bind: SocketAddr,
    #[arg(long, default_value_t = 2500)]
    operation_timeout_ms: u64,
    /// Reject writes that carry neither x-user-id nor x-user-name.
    #[arg(long)]
    require_actor: bool,
    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
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

    fn invalid_json_with_telemetry(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.telemetry.record_failure("invalid_json", false);
        Self::failure(
            rejection.status(),
            "invalid_json",
            rejection.body_text(),
            Some(json!({"rejection": rejection.to_string()})),
        )
    }

    fn invalid_query_with_telemetry(&self, rejection: &QueryRejection) -> ServiceFailure {
        self.telemetry.record_failure("validation_error", false);
        Self::failure(
            StatusCode::UNPROCESSABLE_ENTITY,
            "validation_error",
            rejection.body_text(),
            None,
        )
    }

    fn artifact_type(&self, raw: &str) -> Result<ArtifactType, ServiceFailure> {
        ArtifactType::parse(raw).ok_or_else(|| {
            self.telemetry.record_failure("validation_error", false);
            Self::failure(
                StatusCode::UNPROCESSABLE_ENTITY,
                "validation_error",
                format!("unknown artifact type: {raw}"),
                Some(json!({
                    "allowed": ArtifactType::ALL.iter().map(|kind| kind.as_str()).collect::<Vec<_>>()
                })),
            )
        })
    }

    /// Reads the caller identity headers. Without either header the system
    /// actor is used, unless the service runs with `--require-actor`.
    fn resolve_actor(&self, headers: &HeaderMap) -> Result<Actor, ServiceFailure> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        let user_id = header(USER_ID_HEADER);
        let user_name = header(USER_NAME_HEADER);

        if self.require_actor && user_id.is_none() && user_name.is_none() {
            self.telemetry.record_failure("actor_required", false);
            return Err(Self::failure(
                StatusCode::UNAUTHORIZED,
                "actor_required",
                format!("{USER_ID_HEADER} or {USER_NAME_HEADER} header is required"),
                None,
            ));
        }

        Ok(Actor::resolve(user_id, user_name))
    }

    fn classify_registry_error(err: &anyhow::Error) -> ServiceFailure {
        let Some(workflow) = workflow_error(err) else {
            return Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{err:#}"),
                None,
            );
        };

        let message = workflow.to_string();
        match workflow {
            WorkflowError::NotFound { kind, id } => Self::failure(
                StatusCode::NOT_FOUND,
                "not_found",
                message,
                Some(json!({"kind": kind, "id": id})),
            ),
            WorkflowError::Conflict { expected, actual } => Self::failure(
                StatusCode::CONFLICT,
                "conflict",
                message,
                Some(json!({"expected": expected, "actual": actual})),
            ),
            WorkflowError::AlreadyExists { kind, id } => Self::failure(
                StatusCode::CONFLICT,
                "conflict",
                message,
                Some(json!({"kind": kind, "id": id})),
            ),
            WorkflowError::InvalidTransition { from, to, allowed } => Self::failure(
                StatusCode::UNPROCESSABLE_ENTITY,
                "invalid_transition",
                message,
                Some(json!({"from": from, "to": to, "allowed": allowed})),
            ),
            WorkflowError::Validation(_) | WorkflowError::Replay(_) => Self::failure(
                StatusCode::UNPROCESSABLE_ENTITY,
                "validation_error",
                message,
                None,
            ),
        }
    }

    async fn run_blocking<T, F>(&self, operation_label: &'static str, op: F) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(RegistryApi) -> anyhow::Result<T> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let api = self.api.clone();
        let handle = tokio::task::spawn_blocking(move || op(api));
        let join_result =
            tokio::time::timeout(self.operation_timeout, handle).await.map_err(|_| {
                self.telemetry.record_failure("timeout", true);
                warn!(operation = operation_label, "operation timed out");
                Self::failure(
                    StatusCode::GATEWAY_TIMEOUT,
                    "timeout",
                    format!(
                        "{operation_label} timed out after {} ms",
                        self.operation_timeout.as_millis()
                    ),
                    Some(json!({ "timeout_ms": self.operation_timeout.as_millis() })),
                )
            })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                None,
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry.requests_success_total.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let failure = Self::classify_registry_error(&err);
                self.telemetry.record_failure(failure.code, false);
                if failure.status.is_server_error() {
                    warn!(operation = operation_label, code = failure.code, "operation failed: {err:#}");
                }
                Err(failure)
            }
        }
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        let counter = match code {
            "invalid_json" => &self.invalid_json_total,
            "validation_error" => &self.validation_error_total,
            "not_found" => &self.not_found_total,
            "conflict" => &self.conflict_total,
            "invalid_transition" => &self.invalid_transition_total,
            "actor_required" => &self.actor_required_total,
            "timeout" => return,
            _ => &self.internal_error_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            not_found_total: self.not_found_total.load(Ordering::Relaxed),
            conflict_total: self.conflict_total.load(Ordering::Relaxed),
            invalid_transition_total: self.invalid_transition_total.load(Ordering::Relaxed),
            actor_required_total: self.actor_required_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
        }
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/ready", get(ready))
        .route("/v1/openapi", get(openapi))
        .route(
            "/artifact-events/:artifact_type/:artifact_id/transition",
            post(transition),
        )
        .route("/artifact-events/:artifact_type/:artifact_id/history", get(history))
        .route(
            "/artifact-events/:artifact_type/:artifact_id/allowed-transitions",
            get(allowed_transitions),
        )
        .route("/artifact-events/:artifact_type/:artifact_id/audit", get(audit))
        .route("/artifacts/:artifact_type", post(artifact_create).get(artifact_list))
        .route(
            "/artifacts/:artifact_type/:aid",
            get(artifact_show).patch(artifact_update).delete(artifact_delete),
        )
        .route("/linkages", post(linkage_create))
        .route("/linkages/from/:aid", get(linkages_from))
        .route("/linkages/to/:aid", get(linkages_to))
        .route("/linkages/:aid", delete(linkage_delete))
        .route("/ears/validate", post(ears_validate))
        .route("/projects/:project_id/export", get(project_export))
        .route("/projects/:project_id/statistics", get(project_statistics))
        .route("/import", post(project_import))
        .with_state(state)
}

fn init_tracing(log_json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    let result = if log_json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    if let Err(err) = result {
        eprintln!("tracing subscriber already installed: {err}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let api = RegistryApi::new(args.db.clone());
    let migrate_api = api.clone();
    tokio::task::spawn_blocking(move || migrate_api.migrate())
        .await
        .context("migration task failed to complete")?
        .with_context(|| format!("failed to migrate {}", args.db.display()))?;

    let state = ServiceState {
        api,
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        require_actor: args.require_actor,
        telemetry: Arc::new(ServiceTelemetry::default()),
    };
    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    info!(
        bind = %args.bind,
        db = %args.db.display(),
        require_actor = args.require_actor,
        "artifact registry service listening"
    );
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(HealthResponse {
        status: "ok",
        service_contract_version: SERVICE_CONTRACT_VERSION,
        timeout_ms,
        require_actor: state.require_actor,
        telemetry: state.telemetry.snapshot(),
    })
}

async fn ready(State(state): State<ServiceState>) -> Result<Response, ServiceFailure> {
    let checks = state
        .run_blocking("schema_status", |api| api.store()?.schema_status())
        .await?;
    if checks.up_to_date {
        return Ok(Json(ReadinessResponse { status: "ready", checks }).into_response());
    }
    Ok((
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ReadinessResponse {
            status: "not_ready",
            checks,
        }),
    )
        .into_response())
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn transition(
    State(state): State<ServiceState>,
    Path((artifact_type, artifact_id)): Path<(String, String)>,
    headers: HeaderMap,
    payload: Result<Json<TransitionBody>, JsonRejection>,
) -> Result<Json<ArtifactEvent>, ServiceFailure> {
    let artifact_type = state.artifact_type(&artifact_type)?;
    let actor = state.resolve_actor(&headers)?;
    let Json(body) = payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;

    let request = TransitionRequest {
        artifact_type,
        artifact_id,
        from_status: body.from_status,
        to_status: body.to_status,
        rationale: body.rationale.unwrap_or_default(),
        comment: body.comment,
        actor,
    };
    let outcome = state
        .run_blocking("transition", move |api| api.store()?.transition(&request))
        .await?;
    Ok(Json(outcome.event))
}

async fn history(
    State(state): State<ServiceState>,
    Path((artifact_type, artifact_id)): Path<(String, String)>,
) -> Result<Json<Vec<ArtifactEvent>>, ServiceFailure> {
    let artifact_type = state.artifact_type(&artifact_type)?;
    let events = state
        .run_blocking("history", move |api| api.store()?.history(artifact_type, &artifact_id))
        .await?;
    Ok(Json(events))
}

async fn allowed_transitions(
    State(state): State<ServiceState>,
    Path((artifact_type, artifact_id)): Path<(String, String)>,
) -> Result<Json<AllowedTransitions>, ServiceFailure> {
    let artifact_type = state.artifact_type(&artifact_type)?;
    let allowed = state
        .run_blocking("allowed_transitions", move |api| {
            api.store()?.allowed_transitions(artifact_type, &artifact_id)
        })
        .await?;
    Ok(Json(allowed))
}

async fn audit(
    State(state): State<ServiceState>,
    Path((artifact_type, artifact_id)): Path<(String, String)>,
) -> Result<Json<HistoryAudit>, ServiceFailure> {
    let artifact_type = state.artifact_type(&artifact_type)?;
    let report = state
        .run_blocking("audit_history", move |api| {
            api.store()?.audit_history(artifact_type, &artifact_id)
        })
        .await?;
    Ok(Json(report))
}

async fn artifact_create(
    State(state): State<ServiceState>,
    Path(artifact_type): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<NewArtifact>, JsonRejection>,
) -> Result<(StatusCode, Json<Artifact>), ServiceFailure> {
    let artifact_type = state.artifact_type(&artifact_type)?;
    state.resolve_actor(&headers)?;
    let Json(input) = payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let artifact = state
        .run_blocking("create_artifact", move |api| {
            api.store()?.create_artifact(artifact_type, &input)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(artifact)))
}

async fn artifact_list(
    State(state): State<ServiceState>,
    Path(artifact_type): Path<String>,
    query: Result<Query<ArtifactFilter>, QueryRejection>,
) -> Result<Json<Vec<Artifact>>, ServiceFailure> {
    let artifact_type = state.artifact_type(&artifact_type)?;
    let Query(filter) = query.map_err(|rejection| state.invalid_query_with_telemetry(&rejection))?;
    let artifacts = state
        .run_blocking("list_artifacts", move |api| {
            api.store()?.list_artifacts(artifact_type, &filter)
        })
        .await?;
    Ok(Json(artifacts))
}

async fn artifact_show(
    State(state): State<ServiceState>,
    Path((artifact_type, aid)): Path<(String, String)>,
) -> Result<Json<Artifact>, ServiceFailure> {
    let artifact_type = state.artifact_type(&artifact_type)?;
    let artifact = state
        .run_blocking("get_artifact", move |api| api.store()?.get_artifact(artifact_type, &aid))
        .await?;
    Ok(Json(artifact))
}

async fn artifact_update(
    State(state): State<ServiceState>,
    Path((artifact_type, aid)): Path<(String, String)>,
    headers: HeaderMap,
    payload: Result<Json<ArtifactPatch>, JsonRejection>,
) -> Result<Json<Artifact>, ServiceFailure> {
    let artifact_type = state.artifact_type(&artifact_type)?;
    state.resolve_actor(&headers)?;
    let Json(patch) = payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let artifact = state
        .run_blocking("update_artifact", move |api| {
            api.store()?.update_artifact(artifact_type, &aid, &patch)
        })
        .await?;
    Ok(Json(artifact))
}

async fn artifact_delete(
    State(state): State<ServiceState>,
    Path((artifact_type, aid)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode, ServiceFailure> {
    let artifact_type = state.artifact_type(&artifact_type)?;
    state.resolve_actor(&headers)?;
    state
        .run_blocking("delete_artifact", move |api| {
            api.store()?.delete_artifact(artifact_type, &aid)
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn linkage_create(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<NewLinkage>, JsonRejection>,
) -> Result<(StatusCode, Json<Linkage>), ServiceFailure> {
    state.resolve_actor(&headers)?;
    let Json(input) = payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let linkage = state
        .run_blocking("create_linkage", move |api| api.store()?.create_linkage(&input))
        .await?;
    Ok((StatusCode::CREATED, Json(linkage)))
}

async fn linkages_from(
    State(state): State<ServiceState>,
    Path(aid): Path<String>,
) -> Result<Json<Vec<Linkage>>, ServiceFailure> {
    let linkages = state
        .run_blocking("linkages_from", move |api| api.store()?.linkages_from(&aid))
        .await?;
    Ok(Json(linkages))
}

async fn linkages_to(
    State(state): State<ServiceState>,
    Path(aid): Path<String>,
) -> Result<Json<Vec<Linkage>>, ServiceFailure> {
    let linkages = state
        .run_blocking("linkages_to", move |api| api.store()?.linkages_to(&aid))
        .await?;
    Ok(Json(linkages))
}

async fn linkage_delete(
    State(state): State<ServiceState>,
    Path(aid): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ServiceFailure> {
    state.resolve_actor(&headers)?;
    state
        .run_blocking("delete_linkage", move |api| api.store()?.delete_linkage(&aid))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn ears_validate(
    State(state): State<ServiceState>,
    payload: Result<Json<EarsBody>, JsonRejection>,
) -> Result<Json<EarsReport>, ServiceFailure> {
    let Json(body) = payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    Ok(Json(analyze(&body.text, body.pattern, body.system.as_deref())))
}

async fn project_export(
    State(state): State<ServiceState>,
    Path(project_id): Path<String>,
) -> Result<Json<ExportDocument>, ServiceFailure> {
    let document = state
        .run_blocking("export_project", move |api| api.store()?.export_project(&project_id))
        .await?;
    Ok(Json(document))
}

async fn project_statistics(
    State(state): State<ServiceState>,
    Path(project_id): Path<String>,
) -> Result<Json<ProjectStatistics>, ServiceFailure> {
    let stats = state
        .run_blocking("project_statistics", move |api| {
            api.store()?.project_statistics(&project_id)
        })
        .await?;
    Ok(Json(stats))
}

async fn project_import(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<ExportDocument>, JsonRejection>,
) -> Result<Json<ImportReport>, ServiceFailure> {
    state.resolve_actor(&headers)?;
    let Json(document) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let report = state
        .run_blocking("import_document", move |api| api.store()?.import_document(&document))
        .await?;
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use axum::body::{to_bytes, Body};
    use http::Request;
    use jsonschema::JSONSchema;
    use serde_json::Value;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("artifact-registry-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn test_state(db_path: PathBuf, timeout_ms: u64, require_actor: bool) -> ServiceState {
        let api = RegistryApi::new(db_path);
        if let Err(err) = api.migrate() {
            panic!("failed to migrate test database: {err:#}");
        }
        ServiceState {
            api,
            operation_timeout: Duration::from_millis(timeout_ms),
            require_actor,
            telemetry: Arc::new(ServiceTelemetry::default()),
        }
    }

    fn request(method: &str, uri: &str, body: Option<&Value>) -> Request<Body> {
        let builder = Request::builder()
            .uri(uri)
            .method(method)
            .header("content-type", "application/json")
            .header(USER_ID_HEADER, "jdoe")
            .header(USER_NAME_HEADER, "J. Doe");
        let body = body.map_or_else(Body::empty, |value| Body::from(value.to_string()));
        builder
            .body(body)
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    async fn send(router: &Router, request: Request<Body>) -> Response {
        match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    async fn response_json(response: Response) -> Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
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

    fn assert_schema(schema_name: &str, value: &Value) {
        let schema_path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../contracts/v1/schemas")
            .join(schema_name);
        let body = std::fs::read_to_string(&schema_path)
            .unwrap_or_else(|err| panic!("failed to read {}: {err}", schema_path.display()));
        let schema: Value = serde_json::from_str(&body)
            .unwrap_or_else(|err| panic!("failed to parse {}: {err}", schema_path.display()));
        let compiled = JSONSchema::compile(&schema)
            .unwrap_or_else(|err| panic!("failed to compile {}: {err}", schema_path.display()));
        if let Some(errors) = compiled
            .validate(value)
            .err()
            .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>())
        {
            panic!("{schema_name} validation failed for {value}:\n{}", errors.join("\n"));
        }
    }

    fn error_code(value: &Value) -> Option<&str> {
        value
            .get("error")
            .and_then(|error| error.get("code"))
            .and_then(Value::as_str)
    }

    /// Creates TR2-MCK-VISION-001 and TR2-MCK-NEED-001.
    async fn seed_need(router: &Router) {
        let vision = json!({"project_id": "TR2", "area": "MCK", "title": "Pilot vision"});
        let response = send(router, request("POST", "/artifacts/vision", Some(&vision))).await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let need = json!({
            "project_id": "TR2",
            "area": "MCK",
            "title": "Structured process",
            "source_id": "TR2-MCK-VISION-001"
        });
        let response = send(router, request("POST", "/artifacts/need", Some(&need))).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let value = response_json(response).await;
        assert_eq!(value["aid"], "TR2-MCK-NEED-001");
        assert_eq!(value["status"], "Draft");
    }

    fn transition_body(from: &str, to: &str, rationale: &str) -> Value {
        json!({"from_status": from, "to_status": to, "rationale": rationale})
    }

    const NEED_TRANSITION: &str = "/artifact-events/need/TR2-MCK-NEED-001/transition";
    const NEED_HISTORY: &str = "/artifact-events/need/TR2-MCK-NEED-001/history";

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let router = app(test_state(unique_temp_db_path(), 2500, false));
        let response = send(&router, request("GET", "/v1/health", None)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(value["status"], "ok");
        assert_eq!(value["service_contract_version"], SERVICE_CONTRACT_VERSION);
        assert_eq!(value["telemetry"]["requests_total"], 0);
    }

    #[tokio::test]
    async fn openapi_endpoint_returns_versioned_artifact() {
        let router = app(test_state(unique_temp_db_path(), 2500, false));
        let response = send(&router, request("GET", "/v1/openapi", None)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = String::from_utf8_lossy(&bytes);
        assert!(body.contains("openapi: 3.1.0"));
        assert!(body.contains("version: service.v1"));
        assert!(body.contains("/artifact-events/{artifactType}/{artifactId}/transition"));
        assert!(body.contains("/artifact-events/{artifactType}/{artifactId}/history"));
        assert!(body.contains("ServiceErrorEnvelope"));
    }

    #[tokio::test]
    async fn ready_endpoint_reports_ready_after_migration() {
        let router = app(test_state(unique_temp_db_path(), 2500, false));
        let response = send(&router, request("GET", "/v1/ready", None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(value["status"], "ready");
        assert_eq!(value["checks"]["migration_version"], 1);
    }

    #[tokio::test]
    async fn transition_flow_returns_events_and_ordered_history() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone(), 2500, false));
        seed_need(&router).await;

        let response = send(
            &router,
            request(
                "POST",
                NEED_TRANSITION,
                Some(&transition_body("Draft", "Ready_for_Review", "Draft complete")),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let event = response_json(response).await;
        assert_schema("artifact-event.schema.json", &event);
        assert_eq!(event["event_data"]["from"], "Draft");
        assert_eq!(event["event_data"]["to"], "Ready_for_Review");
        assert_eq!(event["user_id"], "jdoe");
        assert_eq!(event["user_name"], "J. Doe");

        let mut body = transition_body("Ready_for_Review", "In_Review", "Review scheduled");
        body["comment"] = json!("kickoff on Monday");
        let response = send(&router, request("POST", NEED_TRANSITION, Some(&body))).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(&router, request("GET", NEED_HISTORY, None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let history = response_json(response).await;
        let events = history.as_array().cloned().unwrap_or_default();
        assert_eq!(events.len(), 2);
        for event in &events {
            assert_schema("artifact-event.schema.json", event);
        }
        assert_eq!(events[0]["event_data"]["to"], "Ready_for_Review");
        assert_eq!(events[1]["event_data"]["from"], "Ready_for_Review");
        assert_eq!(events[1]["comment"], "kickoff on Monday");

        let response = send(
            &router,
            request("GET", "/artifact-events/need/TR2-MCK-NEED-001/allowed-transitions", None),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let allowed = response_json(response).await;
        assert_schema("allowed-transitions.schema.json", &allowed);
        assert_eq!(allowed["current_status"], "In_Review");

        let response = send(
            &router,
            request("GET", "/artifact-events/need/TR2-MCK-NEED-001/audit", None),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let audit = response_json(response).await;
        assert_eq!(audit["consistent"], true);
        assert_eq!(audit["event_count"], 2);

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn invalid_transition_returns_422_with_allowed_targets() {
        let router = app(test_state(unique_temp_db_path(), 2500, false));
        seed_need(&router).await;

        let response = send(
            &router,
            request("POST", NEED_TRANSITION, Some(&transition_body("Draft", "Approved", "skip review"))),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let value = response_json(response).await;
        assert_schema("error-envelope.schema.json", &value);
        assert_eq!(error_code(&value), Some("invalid_transition"));
        assert_eq!(value["error"]["details"]["allowed"], json!(["Ready_for_Review"]));

        let response = send(&router, request("GET", NEED_HISTORY, None)).await;
        let history = response_json(response).await;
        assert_eq!(history, json!([]));
    }

    #[tokio::test]
    async fn stale_from_status_returns_409_conflict() {
        let router = app(test_state(unique_temp_db_path(), 2500, false));
        seed_need(&router).await;

        let body = transition_body("Draft", "Ready_for_Review", "ready");
        let first = send(&router, request("POST", NEED_TRANSITION, Some(&body))).await;
        assert_eq!(first.status(), StatusCode::OK);

        let second = send(&router, request("POST", NEED_TRANSITION, Some(&body))).await;
        assert_eq!(second.status(), StatusCode::CONFLICT);
        let value = response_json(second).await;
        assert_schema("error-envelope.schema.json", &value);
        assert_eq!(error_code(&value), Some("conflict"));
        assert_eq!(value["error"]["details"]["actual"], "Ready_for_Review");
    }

    #[tokio::test]
    async fn missing_or_blank_rationale_is_a_validation_error() {
        let router = app(test_state(unique_temp_db_path(), 2500, false));
        seed_need(&router).await;

        let missing = json!({"from_status": "Draft", "to_status": "Ready_for_Review"});
        let response = send(&router, request("POST", NEED_TRANSITION, Some(&missing))).await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let value = response_json(response).await;
        assert_eq!(error_code(&value), Some("validation_error"));

        let blank = transition_body("Draft", "Ready_for_Review", "   ");
        let response = send(&router, request("POST", NEED_TRANSITION, Some(&blank))).await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let value = response_json(response).await;
        assert_eq!(error_code(&value), Some("validation_error"));
    }

    #[tokio::test]
    async fn unknown_artifact_returns_404_for_transition_and_history() {
        let router = app(test_state(unique_temp_db_path(), 2500, false));

        let response = send(
            &router,
            request(
                "POST",
                "/artifact-events/requirement/TR2-MCK-REQ-404/transition",
                Some(&transition_body("Draft", "Ready_for_Review", "ready")),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let value = response_json(response).await;
        assert_schema("error-envelope.schema.json", &value);
        assert_eq!(error_code(&value), Some("not_found"));

        let response = send(
            &router,
            request("GET", "/artifact-events/requirement/TR2-MCK-REQ-404/history", None),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_artifact_type_and_malformed_json_are_rejected() {
        let router = app(test_state(unique_temp_db_path(), 2500, false));

        let response = send(
            &router,
            request("GET", "/artifact-events/document/X-1/history", None),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let value = response_json(response).await;
        assert_eq!(error_code(&value), Some("validation_error"));

        let malformed = Request::builder()
            .uri(NEED_TRANSITION)
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from("{\"from_status\": "))
            .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        let response = send(&router, malformed).await;
        assert!(response.status().is_client_error());
        let value = response_json(response).await;
        assert_schema("error-envelope.schema.json", &value);
        assert_eq!(error_code(&value), Some("invalid_json"));

        let unknown_status = json!({"from_status": "Draft", "to_status": "Done", "rationale": "x"});
        let response = send(&router, request("POST", NEED_TRANSITION, Some(&unknown_status))).await;
        let value = response_json(response).await;
        assert_eq!(error_code(&value), Some("invalid_json"));
    }

    #[tokio::test]
    async fn require_actor_rejects_anonymous_writes_but_allows_reads() {
        let router = app(test_state(unique_temp_db_path(), 2500, true));
        seed_need(&router).await;

        let anonymous = Request::builder()
            .uri(NEED_TRANSITION)
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(transition_body("Draft", "Ready_for_Review", "ready").to_string()))
            .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        let response = send(&router, anonymous).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let value = response_json(response).await;
        assert_schema("error-envelope.schema.json", &value);
        assert_eq!(error_code(&value), Some("actor_required"));

        let anonymous_read = Request::builder()
            .uri(NEED_HISTORY)
            .method("GET")
            .body(Body::empty())
            .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        let response = send(&router, anonymous_read).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn anonymous_transition_records_system_actor() {
        let router = app(test_state(unique_temp_db_path(), 2500, false));
        seed_need(&router).await;

        let anonymous = Request::builder()
            .uri(NEED_TRANSITION)
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(transition_body("Draft", "Ready_for_Review", "ready").to_string()))
            .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        let response = send(&router, anonymous).await;
        assert_eq!(response.status(), StatusCode::OK);
        let event = response_json(response).await;
        assert_eq!(event["user_id"], "system");
        assert_eq!(event["user_name"], "System");
    }

    #[tokio::test]
    async fn artifact_crud_and_linkage_routes() {
        let router = app(test_state(unique_temp_db_path(), 2500, false));
        seed_need(&router).await;

        let patch = json!({"title": "Structured review process"});
        let response = send(
            &router,
            request("PATCH", "/artifacts/need/TR2-MCK-NEED-001", Some(&patch)),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(value["title"], "Structured review process");
        assert_eq!(value["status"], "Draft");

        let response = send(
            &router,
            request("GET", "/artifacts/need?project_id=TR2&status=Draft", None),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let listed = response_json(response).await;
        assert_eq!(listed.as_array().map(Vec::len), Some(1));

        let response = send(&router, request("GET", "/artifacts/need?status=Bogus", None)).await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let link = json!({
            "source_artifact_type": "need",
            "source_id": "TR2-MCK-NEED-001",
            "target_artifact_type": "url",
            "target_id": "https://example.org/conops.pdf",
            "relationship_type": "documented_in"
        });
        let response = send(&router, request("POST", "/linkages", Some(&link))).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = response_json(response).await;
        assert_eq!(created["aid"], "LINK-00002");

        let response = send(&router, request("POST", "/linkages", Some(&link))).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = send(&router, request("GET", "/linkages/from/TR2-MCK-NEED-001", None)).await;
        let from = response_json(response).await;
        assert_eq!(from.as_array().map(Vec::len), Some(2));

        let response = send(&router, request("GET", "/linkages/to/TR2-MCK-VISION-001", None)).await;
        let to = response_json(response).await;
        assert_eq!(to[0]["relationship_type"], "derives_from");

        let response = send(&router, request("DELETE", "/linkages/LINK-00002", None)).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = send(&router, request("DELETE", "/artifacts/need/TR2-MCK-NEED-001", None)).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let response = send(&router, request("GET", "/artifacts/need/TR2-MCK-NEED-001", None)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ears_validate_detects_and_checks_patterns() {
        let router = app(test_state(unique_temp_db_path(), 2500, false));

        let body = json!({"text": "WHEN the operator presses stop, the pump shall halt"});
        let response = send(&router, request("POST", "/ears/validate", Some(&body))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(value["detected_pattern"], "event-driven");
        assert_eq!(value["validation"]["valid"], true);
        assert_eq!(value["components"]["trigger"], "the operator presses stop");

        let body = json!({"text": "The pump shall halt", "pattern": "state-driven", "system": "pump"});
        let response = send(&router, request("POST", "/ears/validate", Some(&body))).await;
        let value = response_json(response).await;
        assert_eq!(value["validation"]["valid"], false);
        assert_eq!(value["template"], "WHILE <in state>, the pump shall <action>");
    }

    #[tokio::test]
    async fn export_then_import_into_second_database() {
        let source = app(test_state(unique_temp_db_path(), 2500, false));
        seed_need(&source).await;
        let response = send(
            &source,
            request("POST", NEED_TRANSITION, Some(&transition_body("Draft", "Ready_for_Review", "ready"))),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(&source, request("GET", "/projects/TR2/export", None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let document = response_json(response).await;
        assert_schema("export-document.schema.json", &document);
        assert_eq!(document["artifacts"].as_array().map(Vec::len), Some(2));

        let target = app(test_state(unique_temp_db_path(), 2500, false));
        let response = send(&target, request("POST", "/import", Some(&document))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let report = response_json(response).await;
        assert_eq!(report["events"], 1);

        let response = send(&target, request("GET", NEED_HISTORY, None)).await;
        let history = response_json(response).await;
        assert_eq!(history[0]["event_data"]["to"], "Ready_for_Review");

        let response = send(&target, request("POST", "/import", Some(&document))).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn project_statistics_route_groups_counts() {
        let router = app(test_state(unique_temp_db_path(), 2500, false));
        seed_need(&router).await;
        let response = send(
            &router,
            request("POST", NEED_TRANSITION, Some(&transition_body("Draft", "Ready_for_Review", "ready"))),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(&router, request("GET", "/projects/TR2/statistics", None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let stats = response_json(response).await;
        assert_eq!(stats["total_count"], 2);
        assert_eq!(stats["by_type"]["vision"], 1);
        assert_eq!(stats["by_type"]["requirement"], 0);
        assert_eq!(stats["by_status"]["Ready_for_Review"], 1);
        assert_eq!(stats["by_area"]["MCK"], 2);
        assert_eq!(stats["matrix"].as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn run_blocking_times_out_with_timeout_code() {
        let state = test_state(unique_temp_db_path(), 1, false);

        let result = state
            .run_blocking("unit_timeout_operation", |_api| {
                std::thread::sleep(Duration::from_millis(25));
                Ok::<_, anyhow::Error>(())
            })
            .await;

        match result {
            Ok(()) => panic!("expected timeout for slow blocking operation"),
            Err(err) => {
                assert_eq!(err.status, StatusCode::GATEWAY_TIMEOUT);
                assert_eq!(err.code, "timeout");
                assert!(err.message.contains("timed out"), "{}", err.message);
                assert!(err.details.is_some());
            }
        }
    }

    #[tokio::test]
    async fn telemetry_counters_track_success_failure_and_timeout() {
        let state = test_state(unique_temp_db_path(), 1, false);

        let success = state
            .run_blocking("telemetry_success", |_api| Ok::<_, anyhow::Error>(1_u32))
            .await;
        assert!(success.is_ok());

        let timeout = state
            .run_blocking("telemetry_timeout", |_api| {
                std::thread::sleep(Duration::from_millis(20));
                Ok::<_, anyhow::Error>(0_u32)
            })
            .await;
        assert!(timeout.is_err());

        let not_found = state
            .run_blocking("telemetry_not_found", |_api| {
                Err::<u32, _>(anyhow::Error::from(WorkflowError::not_found("need", "X")))
            })
            .await;
        match not_found {
            Ok(_) => panic!("expected not_found failure"),
            Err(err) => assert_eq!(err.code, "not_found"),
        }

        let snapshot = state.telemetry.snapshot();
        assert_eq!(snapshot.requests_total, 3);
        assert_eq!(snapshot.requests_success_total, 1);
        assert_eq!(snapshot.requests_failure_total, 2);
        assert_eq!(snapshot.timeout_total, 1);
        assert_eq!(snapshot.not_found_total, 1);
    }
}
