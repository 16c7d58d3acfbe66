//! Monitor HTTP+WS surface: a read-mostly external contract for observing
//! agents, tasks, and events, plus a narrow workspace-file write endpoint
//! guarded against path traversal.

use crate::auth::{auth_middleware, create_auth_state};
use crate::config::{ApiConfig, Config};
use crate::events::{read_coordination_log, Event, EventBus};
use crate::rate_limit::{rate_limit_middleware, RateLimitState};
use crate::tasks::store::TaskStore;
use crate::tasks::{KnownAgents, Task, TaskStatus};
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

#[derive(Clone)]
pub struct MonitorServer {
    config: ApiConfig,
    state: AppState,
}

#[derive(Clone)]
struct AppState {
    tasks: TaskStore,
    events: EventBus,
    known_agents: KnownAgents,
    workspace_root: PathBuf,
}

impl MonitorServer {
    pub fn new(config: Config, tasks: TaskStore, events: EventBus, known_agents: KnownAgents) -> Self {
        MonitorServer {
            config: config.api,
            state: AppState {
                workspace_root: config.workspace.root,
                tasks,
                events,
                known_agents,
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorResponse { error: message.into() })).into_response()
}

#[derive(Debug, Serialize)]
struct AgentSummary {
    id: String,
    workspace_dir: String,
    has_current_task: bool,
    task_count: usize,
}

#[derive(Debug, Serialize)]
struct StepsProgress {
    total: usize,
    done: usize,
}

#[derive(Debug, Serialize)]
struct TaskSummary {
    #[serde(flatten)]
    task: Task,
    steps_progress: Option<StepsProgress>,
}

fn with_steps_progress(task: Task) -> TaskSummary {
    let steps_progress = task.steps.as_ref().map(|steps| StepsProgress {
        total: steps.len(),
        done: steps.iter().filter(|s| s.status == crate::tasks::StepStatus::Done).count(),
    });
    TaskSummary { task, steps_progress }
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy", "service": "fleet-core-monitor" }))
}

async fn list_agents(State(state): State<AppState>) -> Result<Json<Vec<AgentSummary>>, Response> {
    let mut agents = Vec::new();
    for agent_id in state.known_agents.0.keys() {
        let tasks = state
            .tasks
            .list(agent_id, None)
            .await
            .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
        let has_current_task = state
            .tasks
            .find_active(agent_id)
            .await
            .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
            .is_some();
        agents.push(AgentSummary {
            id: agent_id.clone(),
            workspace_dir: format!("workspace-{agent_id}"),
            has_current_task,
            task_count: tasks.len(),
        });
    }
    Ok(Json(agents))
}

#[derive(Debug, Deserialize)]
struct TaskListQuery {
    status: Option<String>,
}

fn parse_status(raw: &str) -> Option<TaskStatus> {
    match raw {
        "pending_approval" => Some(TaskStatus::PendingApproval),
        "backlog" => Some(TaskStatus::Backlog),
        "in_progress" => Some(TaskStatus::InProgress),
        "blocked" => Some(TaskStatus::Blocked),
        "completed" => Some(TaskStatus::Completed),
        "cancelled" => Some(TaskStatus::Cancelled),
        "abandoned" => Some(TaskStatus::Abandoned),
        _ => None,
    }
}

async fn list_agent_tasks(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Query(query): Query<TaskListQuery>,
) -> Result<Json<Vec<TaskSummary>>, Response> {
    if !state.known_agents.contains(&agent_id) {
        return Err(api_error(StatusCode::NOT_FOUND, "unknown agent"));
    }
    let status_filter = query.status.as_deref().and_then(parse_status);
    let tasks = state
        .tasks
        .list(&agent_id, status_filter)
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(tasks.into_iter().map(with_steps_progress).collect()))
}

async fn get_agent_task(
    State(state): State<AppState>,
    Path((agent_id, task_id)): Path<(String, String)>,
) -> Result<Json<TaskSummary>, Response> {
    match state.tasks.read(&agent_id, &task_id).await {
        Some(task) => Ok(Json(with_steps_progress(task))),
        None => Err(api_error(StatusCode::NOT_FOUND, "task not found")),
    }
}

async fn get_agent_current(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<Json<Option<TaskSummary>>, Response> {
    let active = state
        .tasks
        .find_active(&agent_id)
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(active.map(with_steps_progress)))
}

async fn get_agent_blocked(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<Json<Vec<TaskSummary>>, Response> {
    let blocked = state
        .tasks
        .find_blocked(&agent_id)
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(blocked.into_iter().map(with_steps_progress).collect()))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    month: Option<String>,
}

async fn get_agent_history(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<String>, Response> {
    let month = query.month.unwrap_or_else(|| chrono::Utc::now().format("%Y-%m").to_string());
    let path = state
        .workspace_root
        .join(format!("workspace-{agent_id}"))
        .join("task-history")
        .join(format!("{month}.md"));
    match tokio::fs::read_to_string(&path).await {
        Ok(content) => Ok(Json(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Json(String::new())),
        Err(e) => Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

async fn get_agent_plans(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<Json<Vec<serde_json::Value>>, Response> {
    let dir = state
        .workspace_root
        .join(format!("workspace-{agent_id}"))
        .join(".openclaw")
        .join("plans");
    Ok(Json(read_json_dir(&dir).await))
}

async fn read_json_dir(dir: &FsPath) -> Vec<serde_json::Value> {
    let mut out = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return out;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Ok(content) = tokio::fs::read_to_string(&path).await {
            if let Ok(value) = serde_json::from_str(&content) {
                out.push(value);
            }
        }
    }
    out
}

async fn get_team_state(State(state): State<AppState>) -> Json<serde_json::Value> {
    let path = state.workspace_root.join("team-state.json");
    match tokio::fs::read_to_string(&path).await {
        Ok(content) => Json(serde_json::from_str(&content).unwrap_or(json!({}))),
        Err(_) => Json(json!({})),
    }
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    limit: Option<usize>,
    since: Option<chrono::DateTime<chrono::Utc>>,
}

async fn get_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<Event>>, Response> {
    let path = state.workspace_root.join("logs").join("coordination-events.ndjson");
    let mut events: Vec<Event> = read_coordination_log(&path)
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    if let Some(since) = query.since {
        events.retain(|e| e.ts > since);
    }
    if let Some(limit) = query.limit {
        let len = events.len();
        if len > limit {
            events.drain(0..len - limit);
        }
    }
    Ok(Json(events))
}

#[derive(Debug, Deserialize)]
struct WorkspaceFileRequest {
    path: String,
    content: String,
}

/// Writes `content` to `path`, resolved relative to the workspace root.
/// `..` components and any resolution that escapes the root are rejected.
async fn post_workspace_file(
    State(state): State<AppState>,
    Json(request): Json<WorkspaceFileRequest>,
) -> Result<StatusCode, Response> {
    if request.path.split('/').any(|segment| segment == "..") {
        return Err(api_error(StatusCode::FORBIDDEN, "path traversal rejected"));
    }

    let candidate = state.workspace_root.join(&request.path);
    let root = match tokio::fs::canonicalize(&state.workspace_root).await {
        Ok(p) => p,
        Err(e) => return Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    };

    if let Some(parent) = candidate.parent() {
        if tokio::fs::create_dir_all(parent).await.is_err() {
            return Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to create parent dir"));
        }
    }
    tokio::fs::write(&candidate, &request.content)
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let resolved = match tokio::fs::canonicalize(&candidate).await {
        Ok(p) => p,
        Err(e) => return Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    };
    if !resolved.starts_with(&root) {
        let _ = tokio::fs::remove_file(&candidate).await;
        return Err(api_error(StatusCode::FORBIDDEN, "resolved path escapes workspace root"));
    }

    Ok(StatusCode::NO_CONTENT)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_stream(socket, state))
}

#[derive(Debug, Serialize)]
struct WsMessageEnvelope<'a> {
    #[serde(rename = "type")]
    message_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    agent_id: Option<&'a str>,
    timestamp: chrono::DateTime<chrono::Utc>,
    data: &'a serde_json::Value,
}

async fn ws_stream(mut socket: WebSocket, state: AppState) {
    let connected = json!({ "type": "connected", "timestamp": chrono::Utc::now(), "data": {} });
    if socket.send(WsMessage::Text(connected.to_string().into())).await.is_err() {
        return;
    }

    let mut rx = state.events.subscribe();
    loop {
        match rx.recv().await {
            Ok(event) => {
                let envelope = WsMessageEnvelope {
                    message_type: ws_type_for(&event.event_type),
                    agent_id: event.agent_id.as_deref(),
                    timestamp: event.ts,
                    data: &event.data,
                };
                let payload = serde_json::to_string(&envelope).unwrap_or_default();
                if socket.send(WsMessage::Text(payload.into())).await.is_err() {
                    break;
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn ws_type_for(event_type: &str) -> &'static str {
    match event_type {
        t if t.starts_with("task.step") => "task_step_update",
        t if t.starts_with("task") => "task_update",
        t if t.starts_with("continuation") || t.starts_with("a2a") => "agent_update",
        "team_state" => "team_state_update",
        "plan" => "plan_update",
        _ => "event_log",
    }
}

impl MonitorServer {
    pub fn build_router(&self) -> Router {
        let auth_state = create_auth_state(self.config.clone());
        let rate_limit_state = Arc::new(RateLimitState::default());

        let cors_layer = CorsLayer::new()
            .allow_origin(
                self.config
                    .allowed_origins
                    .iter()
                    .filter_map(|origin| origin.parse().ok())
                    .collect::<Vec<_>>(),
            )
            .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
            .allow_headers([
                axum::http::header::CONTENT_TYPE,
                axum::http::header::AUTHORIZATION,
                axum::http::HeaderName::from_static("x-api-key"),
            ]);

        Router::new()
            .route("/api/agents", get(list_agents))
            .route("/api/agents/{id}/tasks", get(list_agent_tasks))
            .route("/api/agents/{id}/tasks/{task_id}", get(get_agent_task))
            .route("/api/agents/{id}/current", get(get_agent_current))
            .route("/api/agents/{id}/blocked", get(get_agent_blocked))
            .route("/api/agents/{id}/history", get(get_agent_history))
            .route("/api/agents/{id}/plans", get(get_agent_plans))
            .route("/api/team-state", get(get_team_state))
            .route("/api/events", get(get_events))
            .route("/api/health", get(health_check))
            .route("/api/workspace-file", post(post_workspace_file))
            .route("/ws", get(ws_handler))
            .layer(
                ServiceBuilder::new()
                    .layer(middleware::from_fn_with_state(rate_limit_state, rate_limit_middleware))
                    .layer(middleware::from_fn_with_state(auth_state, auth_middleware))
                    .layer(TraceLayer::new_for_http())
                    .layer(cors_layer),
            )
            .with_state(self.state.clone())
    }

    pub async fn run(&self) -> crate::Result<()> {
        let app = self.build_router();
        let listener = tokio::net::TcpListener::bind(format!("{}:{}", self.config.host, self.config.port)).await?;
        tracing::info!("monitor listening on {}:{}", self.config.host, self.config.port);
        axum::serve(listener, app).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn server(dir: &TempDir) -> MonitorServer {
        let config = Config {
            workspace: crate::config::WorkspaceConfig { root: dir.path().to_path_buf() },
            continuation: crate::config::ContinuationConfig {
                poll_interval_secs: 120,
                task_idle_threshold_secs: 180,
                continuation_cooldown_secs: 300,
                zombie_task_ttl_secs: 24 * 3600,
                max_zombie_reassigns: 3,
                max_unblock_requests: 3,
            },
            a2a: crate::config::A2aConfig {
                max_concurrent_flows: 3,
                queue_timeout_ms: 30_000,
                job_staleness_ttl_secs: 30 * 60,
                finished_retention_secs: 7 * 24 * 3600,
            },
            milestone: crate::config::MilestoneConfig { base_url: None },
            api: ApiConfig {
                host: "127.0.0.1".into(),
                port: 0,
                api_key: None,
                enable_auth: false,
                allowed_origins: vec![],
            },
        };
        MonitorServer::new(
            config,
            TaskStore::new(dir.path()),
            EventBus::new(),
            KnownAgents::from_ids(["agent-a".to_string()]),
        )
    }

    #[tokio::test]
    async fn health_endpoint_reports_healthy() {
        let dir = TempDir::new().unwrap();
        let app = server(&dir).build_router();
        let response = app
            .oneshot(axum::http::Request::builder().uri("/api/health").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn workspace_file_rejects_dotdot_traversal() {
        let dir = TempDir::new().unwrap();
        let app = server(&dir).build_router();
        let body = json!({"path": "../../etc/passwd", "content": "x"}).to_string();
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/workspace-file")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn workspace_file_writes_inside_root() {
        let dir = TempDir::new().unwrap();
        let app = server(&dir).build_router();
        let body = json!({"path": "notes/a.txt", "content": "hello"}).to_string();
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/workspace-file")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let written = tokio::fs::read_to_string(dir.path().join("notes/a.txt")).await.unwrap();
        assert_eq!(written, "hello");
    }

    #[tokio::test]
    async fn unknown_agent_returns_not_found() {
        let dir = TempDir::new().unwrap();
        let app = server(&dir).build_router();
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/agents/agent-ghost/tasks")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
