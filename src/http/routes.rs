use crate::config::Config;
use crate::error::AppError;
use crate::terminal::bridge::run_terminal_socket;
use crate::terminal::{CommandExecutor, ExecuteParams, ExecuteResult, SessionRegistry};
use crate::tools::browser_tool::BrowserSessions;
use crate::tools::skill_tool::{ListSkillsResult, ReadSkillFileParams, SkillFileContent, SkillManager};
use crate::utils::audit_logger::AuditLogger;
use axum::{
    extract::{rejection::JsonRejection, ws::WebSocketUpgrade, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, instrument};

/// Application state shared across routes
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub executor: Arc<CommandExecutor>,
    pub skills: Arc<SkillManager>,
    pub browsers: Arc<BrowserSessions>,
    pub audit: Arc<AuditLogger>,
}

impl AppState {
    pub fn new(config: &Config) -> Self {
        let registry = Arc::new(SessionRegistry::new(config));
        let executor = Arc::new(CommandExecutor::new(Arc::clone(&registry), config.execute));
        Self {
            registry,
            executor,
            skills: Arc::new(SkillManager::new(config)),
            browsers: Arc::new(BrowserSessions::new()),
            audit: Arc::new(AuditLogger::new(config)),
        }
    }
}

/// Create router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Terminal connections
        .route("/", get(terminal_socket))
        .route("/ws", get(terminal_socket))
        // Agent API
        .route("/execute", post(execute))
        .route("/cleanup", post(cleanup))
        .route("/sessions", get(list_sessions))
        .route("/skills", get(list_skills))
        .route("/skills/:skill_id/file", get(read_skill_file))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct TerminalQuery {
    cwd: Option<String>,
}

/// GET / (upgrade) - Open a terminal bound to `?cwd=`
async fn terminal_socket(
    ws: WebSocketUpgrade,
    Query(query): Query<TerminalQuery>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| run_terminal_socket(socket, state.registry, query.cwd))
}

/// `/execute` failures keep the success shape so agents can read `output` either way.
struct ExecuteError(AppError);

impl IntoResponse for ExecuteError {
    fn into_response(self) -> Response {
        let status = match self.0.status_code() {
            StatusCode::BAD_REQUEST => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Execute failed");
        }
        let body = Json(serde_json::json!({
            "output": self.0.to_string(),
            "active": false,
        }));
        (status, body).into_response()
    }
}

/// POST /execute - Run a command (or send raw input) in the active terminal
#[instrument(skip(state, payload))]
async fn execute(
    State(state): State<AppState>,
    payload: Result<Json<ExecuteParams>, JsonRejection>,
) -> Result<Json<ExecuteResult>, ExecuteError> {
    let params = match payload {
        Ok(Json(params)) => params,
        Err(rejection) => {
            state.audit.log_execute(&ExecuteParams::default(), "rejected").await;
            return Err(ExecuteError(AppError::InvalidRequest(rejection.body_text())));
        }
    };
    match state.executor.execute(&params).await {
        Ok(result) => {
            let outcome = serde_json::to_value(result.status)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            state.audit.log_execute(&params, &outcome).await;
            Ok(Json(result))
        }
        Err(e) => {
            let outcome = if e.status_code().is_client_error() { "rejected" } else { "error" };
            state.audit.log_execute(&params, outcome).await;
            Err(ExecuteError(e))
        }
    }
}

/// POST /cleanup - Kill the active terminal and every browser session
#[instrument(skip(state))]
async fn cleanup(State(state): State<AppState>) -> Json<serde_json::Value> {
    let terminal = state.registry.terminate_active();
    let browsers = state.browsers.close_all().await;
    info!(terminal, browsers, "Global cleanup finished");
    Json(serde_json::json!({ "message": "All sessions cleaned up." }))
}

/// GET /sessions - List live terminal sessions
async fn list_sessions(State(state): State<AppState>) -> Json<serde_json::Value> {
    let sessions = state.registry.list_sessions();
    Json(serde_json::json!({ "sessions": sessions }))
}

/// GET /skills - List the skill library
async fn list_skills(State(state): State<AppState>) -> Result<Json<ListSkillsResult>, AppError> {
    Ok(Json(state.skills.list_skills().await?))
}

/// GET /skills/:skill_id/file?path= - Read one file of a skill
async fn read_skill_file(
    State(state): State<AppState>,
    Path(skill_id): Path<String>,
    Query(params): Query<ReadSkillFileParams>,
) -> Result<Json<SkillFileContent>, AppError> {
    let path = params
        .path
        .filter(|p| !p.is_empty())
        .ok_or(AppError::MissingParameter("path"))?;
    Ok(Json(state.skills.read_skill_file(&skill_id, &path).await?))
}

/// GET /health
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
