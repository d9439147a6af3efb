use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use chrono::Utc;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kubeprov::audit::AuditLog;
use kubeprov::batch::{BatchController, StopHandle};
use kubeprov::config::ServerCli;
use kubeprov::database::{RecordStore, SqliteStore};
use kubeprov::dispatch::Dispatcher;
use kubeprov::error::{
    AuditError, BatchError, RegistryError, SourceError, TemplateError, WorkflowError,
};
use kubeprov::models::{NodeDraft, NodePatch};
use kubeprov::registry::NodeRegistry;
use kubeprov::sources::PackageSources;
use kubeprov::ssh::SshExecutor;
use kubeprov::templates::{RenderParams, ScriptTemplateStore};
use kubeprov::token::JoinToken;
use kubeprov::workflow::{self, ClusterConfig, ClusterWorkflow, WorkflowState};

#[derive(Clone)]
struct AppState {
    registry: Arc<NodeRegistry>,
    audit: Arc<AuditLog>,
    templates: Arc<ScriptTemplateStore>,
    sources: Arc<PackageSources>,
    dispatcher: Arc<Dispatcher>,
    batch: Arc<BatchController>,
    workflow: Arc<Mutex<ClusterWorkflow>>,
    // Both reachable while a workflow step holds the lock.
    workflow_stop: StopHandle,
    workflow_view: watch::Receiver<WorkflowState>,
}

impl AppState {
    fn new(cli: &ServerCli) -> Result<Self> {
        let settings = cli.settings();
        let db_path = cli.database_path()?;
        tracing::info!("Using database {}", db_path.display());
        let store: Arc<dyn RecordStore> = Arc::new(SqliteStore::open(&db_path)?);

        let registry = Arc::new(NodeRegistry::new(store.clone()));
        let audit = Arc::new(AuditLog::open(store.clone(), settings.broadcast_capacity)?);
        let templates = Arc::new(ScriptTemplateStore::with_defaults(store.clone()));
        templates.load()?;
        let sources = Arc::new(PackageSources::open(store)?);

        let executor = Arc::new(SshExecutor::new(settings.connect_timeout));
        let dispatcher = Arc::new(Dispatcher::new(
            executor,
            templates.clone(),
            audit.clone(),
            registry.clone(),
            settings.command_timeout,
        ));
        let batch = Arc::new(BatchController::new(dispatcher.clone(), settings.max_concurrency));
        let workflow = ClusterWorkflow::new(batch.clone(), Some(sources.clone()));
        let workflow_stop = workflow.stop_handle();
        let workflow_view = workflow.watch();

        Ok(Self {
            registry,
            audit,
            templates,
            sources,
            dispatcher,
            batch,
            workflow: Arc::new(Mutex::new(workflow)),
            workflow_stop,
            workflow_view,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = ServerCli::parse();

    let filter = if cli.verbose { "info" } else { "warn" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("KUBEPROV_LOG").unwrap_or_else(|_| filter.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    start_server(&cli).await
}

async fn start_server(cli: &ServerCli) -> Result<()> {
    let state = AppState::new(cli)?;

    let app = Router::new()
        .route("/api/nodes", get(handle_list_nodes).post(handle_create_node))
        .route(
            "/api/nodes/:id",
            get(handle_get_node)
                .patch(handle_update_node)
                .delete(handle_delete_node),
        )
        .route("/api/nodes/:id/test", post(handle_test_node))
        .route("/api/batch", post(handle_batch))
        .route("/api/logs", get(handle_list_logs).delete(handle_clear_logs))
        .route("/api/logs/node/:id", get(handle_node_logs))
        .route("/api/templates", get(handle_get_templates).put(handle_update_templates))
        .route("/api/templates/render", post(handle_render_template))
        .route("/api/sources", get(handle_list_sources).post(handle_add_source))
        .route("/api/sources/:index", delete(handle_remove_source))
        .route("/api/sources/:index/default", post(handle_default_source))
        .route("/api/cluster", get(handle_cluster_state))
        .route("/api/cluster/select", post(handle_cluster_select))
        .route("/api/cluster/configure", post(handle_cluster_configure))
        .route("/api/cluster/init", post(handle_cluster_init))
        .route("/api/cluster/join", post(handle_cluster_join))
        .route("/api/cluster/workers/:id/retry", post(handle_cluster_retry))
        .route("/api/cluster/token", post(handle_cluster_token))
        .route("/api/cluster/stop", post(handle_cluster_stop))
        .route("/api/cluster/restart", post(handle_cluster_restart))
        .route("/api/cluster/reset", post(handle_cluster_reset))
        .route("/ws/logs", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = TcpListener::bind(&cli.bind).await?;
    tracing::info!("Server listening on http://{}", cli.bind);
    println!("🌐 Server listening on http://{}", cli.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutting down");
}

// ---- Errors ----

struct ApiError {
    status: StatusCode,
    message: String,
    detail: Option<Value>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl ToString) -> Self {
        Self {
            status,
            message: message.to_string(),
            detail: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!("{}", self.message);
        }
        let mut body = json!({ "error": self.message });
        if let Some(detail) = self.detail {
            body["failure"] = detail;
        }
        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e)
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        let status = match &e {
            RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::Invalid(_) | RegistryError::Credential(_) => StatusCode::BAD_REQUEST,
            RegistryError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, e)
    }
}

impl From<BatchError> for ApiError {
    fn from(e: BatchError) -> Self {
        ApiError::new(StatusCode::BAD_REQUEST, e)
    }
}

impl From<TemplateError> for ApiError {
    fn from(e: TemplateError) -> Self {
        let status = match &e {
            TemplateError::NotFound { .. } => StatusCode::NOT_FOUND,
            TemplateError::Persist(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };
        ApiError::new(status, e)
    }
}

impl From<SourceError> for ApiError {
    fn from(e: SourceError) -> Self {
        let status = match &e {
            SourceError::IndexOutOfRange(_) => StatusCode::NOT_FOUND,
            SourceError::Invalid(_) => StatusCode::BAD_REQUEST,
            SourceError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, e)
    }
}

impl From<AuditError> for ApiError {
    fn from(e: AuditError) -> Self {
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e)
    }
}

impl From<WorkflowError> for ApiError {
    fn from(e: WorkflowError) -> Self {
        match e {
            WorkflowError::Registry(e) => e.into(),
            WorkflowError::InvalidTransition { .. } => ApiError::new(StatusCode::CONFLICT, e),
            WorkflowError::Failed(failure) => ApiError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: failure.to_string(),
                detail: serde_json::to_value(&failure).ok(),
            },
            _ => ApiError::new(StatusCode::BAD_REQUEST, e),
        }
    }
}

type ApiResult = std::result::Result<Json<Value>, ApiError>;

// ---- Nodes ----

async fn handle_list_nodes(State(state): State<AppState>) -> ApiResult {
    let nodes = state.registry.list()?;
    Ok(Json(Value::Array(nodes.iter().map(|n| n.redacted()).collect())))
}

async fn handle_create_node(State(state): State<AppState>, Json(draft): Json<NodeDraft>) -> ApiResult {
    let node = state.registry.create(draft)?;
    Ok(Json(node.redacted()))
}

async fn handle_get_node(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    Ok(Json(state.registry.get(&id)?.redacted()))
}

async fn handle_update_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<NodePatch>,
) -> ApiResult {
    Ok(Json(state.registry.update(&id, patch)?.redacted()))
}

async fn handle_delete_node(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    state.registry.delete(&id)?;
    Ok(Json(json!({ "deleted": id })))
}

async fn handle_test_node(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let reachable = state
        .registry
        .test_connection(&id, state.dispatcher.executor().as_ref())
        .await?;
    Ok(Json(json!({ "id": id, "reachable": reachable })))
}

// ---- Batch ----

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchRequest {
    node_ids: Vec<String>,
    operation: String,
    #[serde(default)]
    params: RenderParams,
}

async fn handle_batch(State(state): State<AppState>, Json(req): Json<BatchRequest>) -> ApiResult {
    let results = state
        .batch
        .run_named(&req.node_ids, &req.operation, req.params)
        .await?;
    Ok(Json(json!({ "operation": req.operation, "results": results })))
}

// ---- Logs ----

async fn handle_list_logs(State(state): State<AppState>) -> ApiResult {
    Ok(Json(json!(state.audit.list())))
}

async fn handle_node_logs(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    Ok(Json(json!(state.audit.list_by_node(&id))))
}

async fn handle_clear_logs(State(state): State<AppState>) -> ApiResult {
    state.audit.clear()?;
    Ok(Json(json!({ "cleared": true })))
}

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_ws(socket, state))
}

async fn handle_ws(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut logs = state.audit.subscribe();
    tracing::debug!("Log subscriber connected ({} total)", state.audit.subscriber_count());

    // Forward log entries; a slow client only loses its own oldest entries.
    let forward_task = tokio::spawn(async move {
        while let Some(entry) = logs.next().await {
            let Ok(text) = serde_json::to_string(&entry) else {
                continue;
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        if let Message::Close(_) = msg {
            break;
        }
    }

    forward_task.abort();
    tracing::debug!("Log subscriber disconnected");
}

// ---- Templates ----

async fn handle_get_templates(State(state): State<AppState>) -> ApiResult {
    Ok(Json(json!(state.templates.all())))
}

async fn handle_update_templates(
    State(state): State<AppState>,
    Json(changes): Json<BTreeMap<String, String>>,
) -> ApiResult {
    let updated = state.templates.update(changes)?;
    Ok(Json(json!({ "updated": updated })))
}

#[derive(Deserialize)]
struct RenderRequest {
    distro: String,
    step: String,
    #[serde(default)]
    params: RenderParams,
}

async fn handle_render_template(
    State(state): State<AppState>,
    Json(req): Json<RenderRequest>,
) -> ApiResult {
    let command = state.templates.render(&req.distro, &req.step, &req.params)?;
    Ok(Json(json!({ "command": command })))
}

// ---- Package sources ----

#[derive(Deserialize)]
struct SourceRequest {
    name: String,
    url: String,
}

async fn handle_list_sources(State(state): State<AppState>) -> ApiResult {
    Ok(Json(json!(state.sources.list())))
}

async fn handle_add_source(State(state): State<AppState>, Json(req): Json<SourceRequest>) -> ApiResult {
    let index = state.sources.add(&req.name, &req.url)?;
    Ok(Json(json!({ "index": index, "sources": state.sources.list() })))
}

async fn handle_remove_source(State(state): State<AppState>, Path(index): Path<usize>) -> ApiResult {
    let removed = state.sources.remove(index)?;
    Ok(Json(json!(removed)))
}

async fn handle_default_source(State(state): State<AppState>, Path(index): Path<usize>) -> ApiResult {
    state.sources.set_default(index)?;
    Ok(Json(json!(state.sources.list())))
}

// ---- Cluster workflow ----

fn snapshot(workflow: &ClusterWorkflow) -> ApiResult {
    let state = serde_json::to_value(workflow.state()).map_err(anyhow::Error::from)?;
    Ok(Json(state))
}

async fn handle_cluster_state(State(state): State<AppState>) -> ApiResult {
    // The published copy, so a running step does not block readers.
    let view = state.workflow_view.borrow().clone();
    Ok(Json(serde_json::to_value(&view).map_err(anyhow::Error::from)?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SelectRequest {
    #[serde(default)]
    master: Option<String>,
    #[serde(default)]
    workers: Vec<String>,
}

async fn handle_cluster_select(
    State(state): State<AppState>,
    Json(req): Json<SelectRequest>,
) -> ApiResult {
    let mut wf = state.workflow.lock().await;
    wf.select_nodes(req.master.as_deref(), &req.workers)?;
    snapshot(&wf)
}

async fn handle_cluster_configure(
    State(state): State<AppState>,
    Json(config): Json<ClusterConfig>,
) -> ApiResult {
    let mut wf = state.workflow.lock().await;
    wf.configure(config)?;
    snapshot(&wf)
}

async fn handle_cluster_init(State(state): State<AppState>) -> ApiResult {
    let mut wf = state.workflow.lock().await;
    wf.init_master().await?;
    snapshot(&wf)
}

async fn handle_cluster_join(State(state): State<AppState>) -> ApiResult {
    let mut wf = state.workflow.lock().await;
    wf.join_workers().await?;
    snapshot(&wf)
}

async fn handle_cluster_retry(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let mut wf = state.workflow.lock().await;
    wf.retry_worker(&id).await?;
    snapshot(&wf)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenRequest {
    endpoint: String,
    token: String,
    ca_cert_hash: String,
}

async fn handle_cluster_token(
    State(state): State<AppState>,
    Json(req): Json<TokenRequest>,
) -> ApiResult {
    let token = JoinToken::new(&req.endpoint, &req.token, &req.ca_cert_hash, Utc::now());
    let mut wf = state.workflow.lock().await;
    wf.provide_token(token)?;
    snapshot(&wf)
}

async fn handle_cluster_stop(State(state): State<AppState>) -> ApiResult {
    // No lock: the running step holds it until its current command returns.
    state.workflow_stop.request();
    tracing::info!("Workflow stop requested");
    Ok(Json(json!({ "stopRequested": true })))
}

async fn handle_cluster_restart(State(state): State<AppState>) -> ApiResult {
    let mut wf = state.workflow.lock().await;
    wf.restart();
    snapshot(&wf)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResetRequest {
    node_ids: Vec<String>,
}

async fn handle_cluster_reset(State(state): State<AppState>, Json(req): Json<ResetRequest>) -> ApiResult {
    let results = workflow::reset_nodes(&state.batch, &req.node_ids).await?;
    Ok(Json(json!({ "operation": "reset", "results": results })))
}
