//! JSON admin API over the sync pipeline.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use ksync_core::{ConnectorSpec, FieldBinding, MappingType, NewSource, SyncKind};
use ksync_sync::{SyncError, SyncPipeline};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "ksync-web";

/// Header naming the operator behind a request; recorded in logs and mappings.
pub const ACTOR_HEADER: &str = "x-ksync-user";
const DEFAULT_ACTOR: &str = "ADMIN_API";
const DEFAULT_LOG_LIMIT: usize = 50;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        Self { pipeline }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/sources", get(list_sources_handler).post(register_source_handler))
        .route("/sources/{id}", get(source_handler))
        .route("/sources/{id}/connector", put(repoint_handler))
        .route("/sources/{id}/active", put(active_handler))
        .route("/sources/{id}/sync", post(sync_source_handler))
        .route("/sources/{id}/resolve", post(resolve_handler))
        .route("/sources/{id}/unmapped", get(unmapped_handler))
        .route("/sources/{id}/stats", get(stats_handler))
        .route("/sources/{id}/bindings", get(bindings_handler))
        .route("/sources/{id}/bindings/detect", post(detect_bindings_handler))
        .route("/sources/{id}/bindings/{mapping_type}", put(set_binding_handler))
        .route("/sources/{id}/resolutions/clear", post(clear_resolution_handler))
        .route("/sync/full", post(full_sync_handler))
        .route("/sync/incremental", post(incremental_sync_handler))
        .route("/mappings", get(list_mappings_handler).post(manual_mapping_handler))
        .route("/logs", get(logs_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(pipeline: Arc<SyncPipeline>, bind: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!(bind, "admin api listening");
    axum::serve(listener, app(AppState::new(pipeline))).await?;
    Ok(())
}

fn actor(headers: &HeaderMap) -> String {
    headers
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_ACTOR)
        .to_string()
}

fn status_for(err: &SyncError) -> StatusCode {
    match err {
        SyncError::SourceNotFound(_) => StatusCode::NOT_FOUND,
        SyncError::AlreadyRunning(_) => StatusCode::CONFLICT,
        SyncError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        SyncError::Config(_) => StatusCode::UNPROCESSABLE_ENTITY,
        SyncError::Remote { .. } => StatusCode::BAD_GATEWAY,
        SyncError::Schema(_) | SyncError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: SyncError) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        warn!(error = %err, "admin request failed");
    }
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

fn respond<T: Serialize>(result: Result<T, SyncError>) -> Response {
    match result {
        Ok(value) => Json(value).into_response(),
        Err(err) => error_response(err),
    }
}

fn parse_mapping_type(raw: &str) -> Result<MappingType, SyncError> {
    MappingType::parse(raw).ok_or_else(|| SyncError::InvalidInput(format!("unknown mapping type {raw:?}")))
}

async fn health_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn list_sources_handler(State(state): State<Arc<AppState>>) -> Response {
    respond(
        state
            .pipeline
            .store()
            .list_sources(false)
            .await
            .map_err(SyncError::from),
    )
}

async fn register_source_handler(
    State(state): State<Arc<AppState>>,
    Json(source): Json<NewSource>,
) -> Response {
    match state.pipeline.register_source(source).await {
        Ok(saved) => (StatusCode::CREATED, Json(saved)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn source_handler(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<i64>) -> Response {
    let result = match state.pipeline.store().get_source(id).await {
        Ok(Some(source)) => {
            let latest = state.pipeline.latest_sync_log(Some(id)).await;
            latest.map(|latest_sync| json!({ "source": source, "latest_sync": latest_sync }))
        }
        Ok(None) => Err(SyncError::SourceNotFound(id)),
        Err(err) => Err(err.into()),
    };
    respond(result)
}

async fn repoint_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
    Json(connector): Json<ConnectorSpec>,
) -> Response {
    match state.pipeline.repoint_source(id, connector).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct ActiveBody {
    active: bool,
}

async fn active_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
    Json(body): Json<ActiveBody>,
) -> Response {
    match state.pipeline.set_source_active(id, body.active).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize, Default)]
struct SyncQuery {
    kind: Option<String>,
}

async fn sync_source_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
    Query(query): Query<SyncQuery>,
    headers: HeaderMap,
) -> Response {
    let kind = match query.kind.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None | Some("manual") => SyncKind::Manual,
        Some("full") => SyncKind::Full,
        Some("incremental") => SyncKind::Incremental,
        Some(other) => {
            return error_response(SyncError::InvalidInput(format!("unknown sync kind {other:?}")))
        }
    };
    respond(state.pipeline.sync_source(id, kind, &actor(&headers)).await)
}

async fn full_sync_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    respond(state.pipeline.full_sync(&actor(&headers)).await)
}

async fn incremental_sync_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    respond(state.pipeline.incremental_sync(&actor(&headers)).await)
}

async fn resolve_handler(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<i64>) -> Response {
    respond(state.pipeline.resolver().resolve_mappings(id).await)
}

async fn unmapped_handler(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<i64>) -> Response {
    respond(state.pipeline.resolver().unmapped_report(id).await)
}

async fn stats_handler(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<i64>) -> Response {
    respond(state.pipeline.resolver().mapping_stats(id).await)
}

async fn bindings_handler(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<i64>) -> Response {
    respond(
        state
            .pipeline
            .store()
            .field_bindings(id)
            .await
            .map_err(SyncError::from),
    )
}

async fn detect_bindings_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
    headers: HeaderMap,
) -> Response {
    respond(state.pipeline.resolver().auto_detect_bindings(id, &actor(&headers)).await)
}

#[derive(Debug, Deserialize)]
struct BindingBody {
    /// `null` disables mapping of this type for the source.
    column: Option<String>,
}

async fn set_binding_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((id, mapping_type)): AxumPath<(i64, String)>,
    headers: HeaderMap,
    Json(body): Json<BindingBody>,
) -> Response {
    let mapping_type = match parse_mapping_type(&mapping_type) {
        Ok(t) => t,
        Err(err) => return error_response(err),
    };
    let binding = match body.column {
        Some(column) => FieldBinding::Column(column),
        None => FieldBinding::Disabled,
    };
    respond(
        state
            .pipeline
            .resolver()
            .set_field_binding(id, mapping_type, binding, &actor(&headers))
            .await,
    )
}

#[derive(Debug, Deserialize)]
struct ValueBody {
    mapping_type: MappingType,
    source_value: String,
}

async fn clear_resolution_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
    Json(body): Json<ValueBody>,
) -> Response {
    let result = state
        .pipeline
        .resolver()
        .clear_resolution(id, body.mapping_type, &body.source_value)
        .await
        .map(|rows| json!({ "rows": rows }));
    respond(result)
}

#[derive(Debug, Deserialize, Default)]
struct MappingsQuery {
    mapping_type: Option<String>,
}

async fn list_mappings_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MappingsQuery>,
) -> Response {
    let mapping_type = match query.mapping_type.as_deref().map(parse_mapping_type).transpose() {
        Ok(t) => t,
        Err(err) => return error_response(err),
    };
    respond(
        state
            .pipeline
            .store()
            .value_mappings(mapping_type)
            .await
            .map_err(SyncError::from),
    )
}

#[derive(Debug, Deserialize)]
struct ManualMappingBody {
    mapping_type: MappingType,
    source_value: String,
    canonical_id: String,
    /// Apply the alias to this source's rows right away.
    #[serde(default)]
    apply_to_source: Option<i64>,
}

#[derive(Debug, Serialize)]
struct ManualMappingReply {
    mapping: ksync_core::ValueMapping,
    rows_updated: Option<u64>,
}

async fn manual_mapping_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ManualMappingBody>,
) -> Response {
    let resolver = state.pipeline.resolver();
    let mapping = match resolver
        .set_manual_mapping(body.mapping_type, &body.source_value, &body.canonical_id, &actor(&headers))
        .await
    {
        Ok(mapping) => mapping,
        Err(err) => return error_response(err),
    };
    let rows_updated = match body.apply_to_source {
        Some(source_id) => match resolver
            .apply_manual_mapping(source_id, body.mapping_type, &body.source_value)
            .await
        {
            Ok(rows) => Some(rows),
            Err(err) => return error_response(err),
        },
        None => None,
    };
    (StatusCode::CREATED, Json(ManualMappingReply { mapping, rows_updated })).into_response()
}

#[derive(Debug, Deserialize, Default)]
struct LogsQuery {
    source_id: Option<i64>,
    limit: Option<usize>,
}

async fn logs_handler(State(state): State<Arc<AppState>>, Query(query): Query<LogsQuery>) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, 500);
    respond(state.pipeline.recent_sync_logs(query.source_id, limit).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use ksync_core::CanonicalEntity;
    use ksync_storage::{MemoryStore, SyncStore};
    use ksync_sync::SyncConfig;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn state_with_source(dir: &std::path::Path) -> AppState {
        let rows = json!([
            {"natural_id": "r1", "fields": {"Restaurante": "Rostipollos Escazu", "Total": 3}},
            {"natural_id": "r2", "fields": {"Restaurante": "Oficina Central", "Total": 4}}
        ]);
        let path = dir.join("rows.json");
        std::fs::write(&path, rows.to_string()).unwrap();

        let store = Arc::new(MemoryStore::new());
        store
            .upsert_canonical_entity(&CanonicalEntity {
                mapping_type: MappingType::Store,
                canonical_id: "S01".into(),
                display_name: "Rostipollos Escazu".into(),
                email: None,
                active: true,
            })
            .await
            .unwrap();
        let dyn_store: Arc<dyn SyncStore> = store;
        let pipeline = SyncPipeline::new(SyncConfig::default(), dyn_store).unwrap();
        pipeline
            .register_source(NewSource {
                id: Some(3),
                alias: "Visita Operativa".into(),
                connector: ConnectorSpec::Fixture { path },
                credentials_ref: None,
                owner: None,
                active: true,
            })
            .await
            .unwrap();
        AppState::new(Arc::new(pipeline))
    }

    async fn body_json(resp: Response) -> Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .header(ACTOR_HEADER, "ana")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn handler_smoke_health_and_sources() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(state_with_source(dir.path()).await);
        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(Request::builder().uri("/sources").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let sources = body_json(resp).await;
        assert_eq!(sources[0]["alias"], "Visita Operativa");
    }

    #[tokio::test]
    async fn sync_then_map_through_the_api() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(state_with_source(dir.path()).await);

        let resp = app
            .clone()
            .oneshot(post("/sources/3/sync?kind=full", json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let result = body_json(resp).await;
        assert_eq!(result["counts"]["inserted"], 2);
        assert_eq!(result["mappings"]["resolved_count"], 1);
        assert_eq!(result["mappings"]["remaining_unmapped"], 1);

        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/sources/3/unmapped").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let unmapped = body_json(resp).await;
        assert_eq!(unmapped[0]["source_value"], "Oficina Central");

        let resp = app
            .clone()
            .oneshot(post(
                "/mappings",
                json!({
                    "mapping_type": "STORE",
                    "source_value": "Oficina Central",
                    "canonical_id": "S01",
                    "apply_to_source": 3
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let reply = body_json(resp).await;
        assert_eq!(reply["rows_updated"], 1);
        assert_eq!(reply["mapping"]["created_by"], "ana");

        let resp = app
            .oneshot(Request::builder().uri("/logs?source_id=3").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let logs = body_json(resp).await;
        assert_eq!(logs[0]["status"], "SUCCESS");
        assert_eq!(logs[0]["initiated_by"], "ana");
    }

    #[tokio::test]
    async fn errors_map_to_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(state_with_source(dir.path()).await);

        let resp = app
            .clone()
            .oneshot(post("/sources/404/sync", json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app
            .clone()
            .oneshot(post("/sources/3/sync?kind=sometimes", json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .oneshot(post(
                "/mappings",
                json!({"mapping_type": "STORE", "source_value": "x", "canonical_id": "S99"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(resp).await["error"].as_str().unwrap().contains("S99"));
    }
}
