//! Thin HTTP adapter: REST routes and SSE fan-out over the session engine.
//! All semantics live in the manager; this layer only maps payloads and
//! converts failure kinds to status codes.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use tracing::info;

use crate::assist::{AssistEngine, ParsedOpinion};
use crate::error::{Result, ReviewError};
use crate::manager::{
    CreateSessionRequest, ImplementationContextPayload, OpinionRequest, SessionManager,
};
use crate::models::{AgentConfig, ClientKind, OpinionAction, ProgressStatus, RawIssue, ResponseAction, Severity};
use crate::probe::ProbeRegistry;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub assist: Arc<AssistEngine>,
    pub probes: Arc<ProbeRegistry>,
}

impl AppState {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        let config = manager.config();
        let assist = Arc::new(AssistEngine::new(Arc::clone(&manager), config.assist.clone()));
        let probes = Arc::new(ProbeRegistry::new(
            config.probe.clone(),
            config.runner.clone(),
        ));
        Self {
            manager,
            assist,
            probes,
        }
    }
}

impl IntoResponse for ReviewError {
    fn into_response(self) -> Response {
        let status = match &self {
            ReviewError::Validation(_) | ReviewError::Config(_) => StatusCode::BAD_REQUEST,
            ReviewError::Auth(_) => StatusCode::FORBIDDEN,
            ReviewError::State { .. }
            | ReviewError::InvalidTransition { .. }
            | ReviewError::UnresolvedIssues(_) => StatusCode::CONFLICT,
            ReviewError::SessionNotFound(_)
            | ReviewError::IssueNotFound(_)
            | ReviewError::AgentNotFound(_)
            | ReviewError::PresetNotFound(_) => StatusCode::NOT_FOUND,
            ReviewError::Repo { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ReviewError::Subprocess(_)
            | ReviewError::Storage(_)
            | ReviewError::Io(_)
            | ReviewError::Json(_)
            | ReviewError::Toml(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = match &self {
            ReviewError::UnresolvedIssues(issues) => json!({
                "kind": self.kind(),
                "error": self.to_string(),
                "unresolved_issues": issues,
            }),
            ReviewError::State {
                operation,
                expected,
                actual,
            } => json!({
                "kind": self.kind(),
                "error": self.to_string(),
                "operation": operation,
                "phase": actual,
                "expected": expected,
            }),
            _ => json!({
                "kind": self.kind(),
                "error": self.to_string(),
            }),
        };
        (status, Json(body)).into_response()
    }
}

fn agent_key(headers: &HeaderMap) -> Result<String> {
    headers
        .get("x-agent-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ReviewError::Auth("missing X-Agent-Key header".into()))
}

// --- Request payloads ---

#[derive(Deserialize)]
struct FinishQuery {
    #[serde(default)]
    force: Option<String>,
}

#[derive(Deserialize)]
struct FixCompleteBody {
    commit: String,
    #[serde(default)]
    issue_ids: Option<Vec<String>>,
    #[serde(default)]
    submitted_by: String,
}

#[derive(Deserialize)]
struct BatchReviewBody {
    model_id: String,
    #[serde(default)]
    issues: Vec<RawIssue>,
    #[serde(default)]
    summary: String,
}

#[derive(Deserialize)]
struct SingleReportBody {
    model_id: String,
    issue: RawIssue,
}

#[derive(Deserialize)]
struct SummaryBody {
    model_id: String,
    #[serde(default)]
    summary: String,
}

#[derive(Deserialize)]
struct RespondBody {
    action: ResponseAction,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    model_id: Option<String>,
}

#[derive(Deserialize)]
struct StatusBody {
    status: ProgressStatus,
    #[serde(default)]
    reasoning: String,
}

#[derive(Deserialize)]
struct DismissBody {
    #[serde(default)]
    reasoning: String,
}

#[derive(Deserialize)]
struct AssistBody {
    message: String,
}

#[derive(Deserialize)]
struct AssistOpinionBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    action: Option<OpinionAction>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    suggested_severity: Option<Severity>,
}

#[derive(Deserialize)]
struct ActivityBody {
    model_id: String,
    action: String,
    target: String,
}

#[derive(Deserialize)]
struct PendingQuery {
    model_id: String,
}

#[derive(Deserialize)]
struct ContextQuery {
    #[serde(default)]
    file: Option<String>,
}

#[derive(Deserialize)]
struct RangeQuery {
    #[serde(default)]
    start: Option<u32>,
    #[serde(default)]
    end: Option<u32>,
}

#[derive(Deserialize)]
struct RepoPathQuery {
    path: String,
}

#[derive(Deserialize)]
struct ConnectionTestBody {
    #[serde(default)]
    client_kind: ClientKind,
    #[serde(default)]
    model_name: String,
}

// --- Router ---

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route("/api/sessions/{sid}/start", post(start_session))
        .route("/api/sessions/{sid}/activate", post(activate_session))
        .route("/api/sessions/{sid}/finish", post(finish_session))
        .route("/api/sessions/{sid}/process", post(process_session))
        .route("/api/sessions/{sid}/fix-complete", post(fix_complete))
        .route("/api/sessions/{sid}", delete(delete_session))
        .route("/api/sessions/{sid}/status", get(session_status))
        .route("/api/sessions/{sid}/issues", get(session_issues).post(create_issue))
        .route("/api/sessions/{sid}/diff/{*path}", get(file_diff))
        .route("/api/sessions/{sid}/files/{*path}", get(file_range))
        .route("/api/sessions/{sid}/stream", get(session_stream))
        .route("/api/sessions/{sid}/report", post(report_issue))
        .route("/api/sessions/{sid}/summary", post(submit_summary))
        .route(
            "/api/sessions/{sid}/reviews",
            get(session_reviews).post(submit_batch_review),
        )
        .route("/api/sessions/{sid}/pending", get(pending_issues))
        .route(
            "/api/sessions/{sid}/context",
            get(review_context).post(submit_context),
        )
        .route("/api/sessions/{sid}/index", get(context_index))
        .route("/api/sessions/{sid}/delta", get(delta_context))
        .route("/api/sessions/{sid}/final-report", get(final_report))
        .route("/api/sessions/{sid}/assist-key", post(issue_assist_key))
        .route("/api/sessions/{sid}/activity", post(record_activity))
        .route(
            "/api/sessions/{sid}/agents",
            get(list_agents).post(add_agent),
        )
        .route(
            "/api/sessions/{sid}/agents/{model_id}",
            axum::routing::patch(update_agent).delete(remove_agent),
        )
        .route(
            "/api/sessions/{sid}/agents/{model_id}/runtime",
            get(agent_runtime),
        )
        .route("/api/agent-presets", get(list_presets).post(add_preset))
        .route(
            "/api/agent-presets/{preset_id}",
            axum::routing::patch(update_preset).delete(remove_preset),
        )
        .route("/api/issues/{iid}/thread", get(issue_thread))
        .route("/api/issues/{iid}/opinions", post(submit_opinion))
        .route("/api/issues/{iid}/respond", post(respond_issue))
        .route("/api/issues/{iid}/status", post(issue_status))
        .route("/api/issues/{iid}/dismiss", post(dismiss_issue))
        .route(
            "/api/issues/{iid}/assist",
            get(assist_history).post(assist_chat),
        )
        .route("/api/issues/{iid}/assist/opinion", post(assist_opinion))
        .route("/api/agents/connection-test", post(connection_test))
        .route(
            "/api/agents/connection-test/callback/{token}",
            post(connection_test_callback),
        )
        .route("/api/repo/validate", get(repo_validate))
        .route("/api/repo/branches", get(repo_branches))
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn serve(state: AppState, port: u16) -> Result<()> {
    state
        .manager
        .set_api_base_url(format!("http://localhost:{}", port));
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| ReviewError::Io(std::io::Error::other(e)))?;
    Ok(())
}

// --- Session handlers ---

async fn list_sessions(State(state): State<AppState>) -> Response {
    Json(state.manager.list_sessions()).into_response()
}

async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionRequest>,
) -> Result<Response> {
    let summary = state.manager.create_session(body).await?;
    Ok((StatusCode::CREATED, Json(summary)).into_response())
}

async fn start_session(
    State(state): State<AppState>,
    Path(sid): Path<String>,
) -> Result<Response> {
    state.manager.start(&sid).await?;
    Ok(Json(json!({"status": "started", "session_id": sid})).into_response())
}

async fn activate_session(
    State(state): State<AppState>,
    Path(sid): Path<String>,
) -> Result<Response> {
    state.manager.activate(&sid)?;
    Ok(Json(json!({"status": "activated", "session_id": sid})).into_response())
}

async fn finish_session(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    Query(query): Query<FinishQuery>,
) -> Result<Response> {
    let force = matches!(query.force.as_deref(), Some("" | "1" | "true"));
    let report = state.manager.finish(&sid, force).await?;
    Ok(Json(report).into_response())
}

async fn process_session(
    State(state): State<AppState>,
    Path(sid): Path<String>,
) -> Result<Response> {
    Ok(Json(state.manager.process(&sid).await?).into_response())
}

async fn fix_complete(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    Json(body): Json<FixCompleteBody>,
) -> Result<Response> {
    let receipt = state
        .manager
        .fix_complete(&sid, body.commit, body.issue_ids, body.submitted_by)
        .await?;
    Ok(Json(receipt).into_response())
}

async fn delete_session(
    State(state): State<AppState>,
    Path(sid): Path<String>,
) -> Result<Response> {
    state.manager.delete_session(&sid).await?;
    Ok(Json(json!({"status": "deleted", "session_id": sid})).into_response())
}

async fn session_status(
    State(state): State<AppState>,
    Path(sid): Path<String>,
) -> Result<Response> {
    Ok(Json(state.manager.status(&sid)?).into_response())
}

async fn session_issues(
    State(state): State<AppState>,
    Path(sid): Path<String>,
) -> Result<Response> {
    Ok(Json(state.manager.issues(&sid)?).into_response())
}

async fn create_issue(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    Json(body): Json<RawIssue>,
) -> Result<Response> {
    let issue = state.manager.add_manual_issue(&sid, body).await?;
    Ok((StatusCode::CREATED, Json(issue)).into_response())
}

async fn file_diff(
    State(state): State<AppState>,
    Path((sid, path)): Path<(String, String)>,
) -> Result<Response> {
    Ok(Json(state.manager.file_diff(&sid, &path)?).into_response())
}

async fn file_range(
    State(state): State<AppState>,
    Path((sid, path)): Path<(String, String)>,
    Query(range): Query<RangeQuery>,
) -> Result<Response> {
    let slice = state
        .manager
        .read_file(&sid, &path, range.start, range.end)
        .await?;
    Ok(Json(slice).into_response())
}

async fn session_stream(
    State(state): State<AppState>,
    Path(sid): Path<String>,
) -> Sse<impl futures::Stream<Item = std::result::Result<Event, Infallible>>> {
    let rx = state.manager.bus.subscribe(&sid);
    let stream = BroadcastStream::new(rx).filter_map(|item| async move {
        match item {
            Ok(event) => {
                let data = serde_json::to_string(&event).ok()?;
                Some(Ok(Event::default().event(event.kind()).data(data)))
            }
            // Lagged subscribers skip dropped activity; later events
            // still arrive in order.
            Err(_) => None,
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// --- Review submission ---

async fn report_issue(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    headers: HeaderMap,
    Json(body): Json<SingleReportBody>,
) -> Result<Response> {
    let key = agent_key(&headers)?;
    state.manager.authorize(&sid, &body.model_id, &key)?;
    let receipt = state
        .manager
        .report_issue(&sid, &body.model_id, body.issue)
        .await?;
    Ok(Json(receipt).into_response())
}

async fn submit_summary(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    headers: HeaderMap,
    Json(body): Json<SummaryBody>,
) -> Result<Response> {
    let key = agent_key(&headers)?;
    state.manager.authorize(&sid, &body.model_id, &key)?;
    let receipt = state
        .manager
        .submit_review(&sid, &body.model_id, Vec::new(), body.summary)
        .await?;
    Ok(Json(receipt).into_response())
}

async fn submit_batch_review(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    headers: HeaderMap,
    Json(body): Json<BatchReviewBody>,
) -> Result<Response> {
    let key = agent_key(&headers)?;
    state.manager.authorize(&sid, &body.model_id, &key)?;
    let receipt = state
        .manager
        .submit_review(&sid, &body.model_id, body.issues, body.summary)
        .await?;
    Ok(Json(receipt).into_response())
}

async fn session_reviews(
    State(state): State<AppState>,
    Path(sid): Path<String>,
) -> Result<Response> {
    let status = state.manager.status(&sid)?;
    Ok(Json(status.reviews).into_response())
}

async fn pending_issues(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    Query(query): Query<PendingQuery>,
) -> Result<Response> {
    Ok(Json(state.manager.pending_issues(&sid, &query.model_id)?).into_response())
}

async fn review_context(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    Query(query): Query<ContextQuery>,
) -> Result<Response> {
    Ok(Json(state.manager.review_context(&sid, query.file.as_deref())?).into_response())
}

async fn submit_context(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    Json(body): Json<ImplementationContextPayload>,
) -> Result<Response> {
    Ok(Json(state.manager.submit_implementation_context(&sid, body).await?).into_response())
}

async fn context_index(
    State(state): State<AppState>,
    Path(sid): Path<String>,
) -> Result<Response> {
    Ok(Json(state.manager.context_index(&sid)?).into_response())
}

async fn delta_context(
    State(state): State<AppState>,
    Path(sid): Path<String>,
) -> Result<Response> {
    Ok(Json(state.manager.delta_context(&sid)?).into_response())
}

async fn final_report(
    State(state): State<AppState>,
    Path(sid): Path<String>,
) -> Result<Response> {
    Ok(Json(state.manager.final_report(&sid)?).into_response())
}

async fn issue_assist_key(
    State(state): State<AppState>,
    Path(sid): Path<String>,
) -> Result<Response> {
    let key = state.manager.issue_human_assist_key(&sid).await?;
    Ok(Json(json!({"assist_key": key})).into_response())
}

async fn record_activity(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ActivityBody>,
) -> Result<Response> {
    let key = agent_key(&headers)?;
    state.manager.authorize(&sid, &body.model_id, &key)?;
    let recorded = state
        .manager
        .record_activity(&sid, &body.model_id, body.action, body.target)
        .await?;
    Ok(Json(json!({"recorded": recorded})).into_response())
}

// --- Agents / presets ---

async fn list_agents(State(state): State<AppState>, Path(sid): Path<String>) -> Result<Response> {
    Ok(Json(state.manager.list_agents(&sid)?).into_response())
}

async fn add_agent(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    Json(agent): Json<AgentConfig>,
) -> Result<Response> {
    Ok((StatusCode::CREATED, Json(state.manager.add_agent(&sid, agent).await?)).into_response())
}

async fn update_agent(
    State(state): State<AppState>,
    Path((sid, model_id)): Path<(String, String)>,
    Json(agent): Json<AgentConfig>,
) -> Result<Response> {
    Ok(Json(state.manager.update_agent(&sid, &model_id, agent).await?).into_response())
}

async fn remove_agent(
    State(state): State<AppState>,
    Path((sid, model_id)): Path<(String, String)>,
) -> Result<Response> {
    state.manager.remove_agent(&sid, &model_id).await?;
    Ok(Json(json!({"status": "removed", "model_id": model_id})).into_response())
}

async fn agent_runtime(
    State(state): State<AppState>,
    Path((sid, model_id)): Path<(String, String)>,
) -> Result<Response> {
    Ok(Json(state.manager.agent_runtime(&sid, &model_id)?).into_response())
}

async fn list_presets(State(state): State<AppState>) -> Response {
    Json(state.manager.list_presets()).into_response()
}

async fn add_preset(
    State(state): State<AppState>,
    Json(preset): Json<AgentConfig>,
) -> Result<Response> {
    Ok((StatusCode::CREATED, Json(state.manager.add_preset(preset).await?)).into_response())
}

async fn update_preset(
    State(state): State<AppState>,
    Path(preset_id): Path<String>,
    Json(preset): Json<AgentConfig>,
) -> Result<Response> {
    Ok(Json(state.manager.update_preset(&preset_id, preset).await?).into_response())
}

async fn remove_preset(
    State(state): State<AppState>,
    Path(preset_id): Path<String>,
) -> Result<Response> {
    state.manager.remove_preset(&preset_id).await?;
    Ok(Json(json!({"status": "removed", "preset_id": preset_id})).into_response())
}

// --- Issues ---

async fn issue_thread(State(state): State<AppState>, Path(iid): Path<String>) -> Result<Response> {
    Ok(Json(state.manager.issue_thread(&iid)?).into_response())
}

async fn submit_opinion(
    State(state): State<AppState>,
    Path(iid): Path<String>,
    headers: HeaderMap,
    Json(body): Json<OpinionRequest>,
) -> Result<Response> {
    let key = agent_key(&headers)?;
    state.manager.authorize_issue_call(&iid, &body.model_id, &key)?;
    Ok(Json(state.manager.submit_opinion(&iid, body).await?).into_response())
}

async fn respond_issue(
    State(state): State<AppState>,
    Path(iid): Path<String>,
    headers: HeaderMap,
    Json(body): Json<RespondBody>,
) -> Result<Response> {
    let key = agent_key(&headers)?;
    let model_id = match body.model_id {
        Some(model_id) => {
            state.manager.authorize_issue_call(&iid, &model_id, &key)?;
            model_id
        }
        None => state.manager.resolve_model_for_issue(&iid, &key)?,
    };
    let receipt = state
        .manager
        .respond(&iid, &model_id, body.action, body.reasoning)
        .await?;
    Ok(Json(receipt).into_response())
}

async fn issue_status(
    State(state): State<AppState>,
    Path(iid): Path<String>,
    headers: HeaderMap,
    Json(body): Json<StatusBody>,
) -> Result<Response> {
    let key = agent_key(&headers)?;
    let model_id = state.manager.resolve_model_for_issue(&iid, &key)?;
    state
        .manager
        .set_issue_status(&iid, body.status, body.reasoning, model_id)
        .await?;
    Ok(Json(json!({"status": "accepted", "issue_id": iid})).into_response())
}

async fn dismiss_issue(
    State(state): State<AppState>,
    Path(iid): Path<String>,
    headers: HeaderMap,
    Json(body): Json<DismissBody>,
) -> Result<Response> {
    let key = agent_key(&headers)?;
    let model_id = state.manager.resolve_model_for_issue(&iid, &key)?;
    state
        .manager
        .dismiss_issue(&iid, body.reasoning, model_id)
        .await?;
    Ok(Json(json!({"status": "dismissed", "issue_id": iid})).into_response())
}

// --- Assist ---

async fn assist_history(
    State(state): State<AppState>,
    Path(iid): Path<String>,
) -> Result<Response> {
    let issue = state.manager.issue_thread(&iid)?;
    Ok(Json(json!({"messages": issue.assist_messages})).into_response())
}

async fn assist_chat(
    State(state): State<AppState>,
    Path(iid): Path<String>,
    Json(body): Json<AssistBody>,
) -> Result<Response> {
    Ok(Json(state.assist.chat(&iid, &body.message).await?).into_response())
}

async fn assist_opinion(
    State(state): State<AppState>,
    Path(iid): Path<String>,
    headers: HeaderMap,
    Json(body): Json<AssistOpinionBody>,
) -> Result<Response> {
    let key = agent_key(&headers)?;
    let explicit = match (body.action, body.reasoning) {
        (Some(action), Some(reasoning)) => Some(ParsedOpinion {
            action,
            reasoning,
            suggested_severity: body.suggested_severity,
        }),
        _ => None,
    };
    let receipt = state
        .assist
        .submit_opinion(&iid, &key, &body.message, explicit)
        .await?;
    Ok(Json(receipt).into_response())
}

// --- Connection test ---

async fn connection_test(
    State(state): State<AppState>,
    Json(body): Json<ConnectionTestBody>,
) -> Response {
    let (tx, rx) = mpsc::channel(8);
    let probes = Arc::clone(&state.probes);
    let api_base = state.manager.api_base_url();
    tokio::spawn(async move {
        probes
            .run(body.client_kind, body.model_name, &api_base, tx)
            .await;
    });

    let stream = ReceiverStream::new(rx).filter_map(|update| async move {
        serde_json::to_string(&update)
            .ok()
            .map(|line| Ok::<String, Infallible>(line + "\n"))
    });
    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(stream),
    )
        .into_response()
}

async fn connection_test_callback(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Response {
    if state.probes.callback(&token) {
        Json(json!({"status": "ok"})).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({
                "kind": "not_found",
                "error": "unknown or expired probe token",
            })),
        )
            .into_response()
    }
}

// --- Repo helpers ---

async fn repo_validate(Query(query): Query<RepoPathQuery>) -> Result<Response> {
    let validation = crate::repo::validate(std::path::Path::new(&query.path)).await?;
    Ok(Json(validation).into_response())
}

async fn repo_branches(Query(query): Query<RepoPathQuery>) -> Result<Response> {
    let branches = crate::repo::branches(std::path::Path::new(&query.path)).await?;
    Ok(Json(branches).into_response())
}
