//! Read and update a user's structured memory over HTTP.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use concierge_core::domain::memory::{
    ConversationAnalysis, ConversationTurn, PreferenceUpdate, Preferences, TaskStatus, UserId,
    UserTask,
};
use concierge_core::errors::ServiceError;
use concierge_core::ports::StructuredMemory;

const DEFAULT_CONVERSATIONS: usize = 10;
const DEFAULT_TASKS: usize = 50;
const MAX_PAGE: usize = 100;
const ANALYSIS_WINDOW: usize = 20;

#[derive(Clone)]
pub struct MemoryState {
    pub structured: Arc<dyn StructuredMemory>,
}

pub fn router(state: MemoryState) -> Router {
    Router::new()
        .route("/memory/preferences/{number}", get(preferences).post(update_preferences))
        .route("/memory/tasks/{number}", get(tasks))
        .route("/memory/conversations/{number}", get(conversations))
        .route("/memory/analysis/{number}", get(analysis))
        .with_state(state)
}

#[derive(Debug)]
pub enum MemoryApiError {
    BadRequest(String),
    Backend(ServiceError),
}

impl IntoResponse for MemoryApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            Self::BadRequest(detail) => (StatusCode::BAD_REQUEST, detail),
            Self::Backend(error) => {
                warn!(event_name = "memory.api.backend_failed", error = %error, "memory read failed");
                (StatusCode::SERVICE_UNAVAILABLE, error.to_string())
            }
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

impl From<ServiceError> for MemoryApiError {
    fn from(error: ServiceError) -> Self {
        Self::Backend(error)
    }
}

/// Path numbers may arrive with or without the `whatsapp:` channel prefix.
pub fn user_id_for(number: &str) -> UserId {
    let number = number.trim();
    if number.starts_with("whatsapp:") {
        UserId::new(number)
    } else {
        UserId::new(format!("whatsapp:{number}"))
    }
}

#[derive(Debug, Serialize)]
pub struct PreferencesResponse {
    pub user_id: UserId,
    pub preferences: Preferences,
}

#[derive(Debug, Serialize)]
pub struct TasksResponse {
    pub user_id: UserId,
    pub tasks: Vec<UserTask>,
}

#[derive(Debug, Serialize)]
pub struct ConversationsResponse {
    pub user_id: UserId,
    pub conversations: Vec<ConversationTurn>,
}

#[derive(Debug, Serialize)]
pub struct AnalysisResponse {
    pub user_id: UserId,
    pub analysis: ConversationAnalysis,
}

#[derive(Debug, Default, Deserialize)]
pub struct TaskQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<usize>,
}

fn page(limit: Option<usize>, default: usize) -> usize {
    limit.unwrap_or(default).clamp(1, MAX_PAGE)
}

pub async fn preferences(
    State(state): State<MemoryState>,
    Path(number): Path<String>,
) -> Result<Json<PreferencesResponse>, MemoryApiError> {
    let user_id = user_id_for(&number);
    let preferences = state.structured.get_preferences(&user_id).await?.unwrap_or_default();
    Ok(Json(PreferencesResponse { user_id, preferences }))
}

/// Applies a partial update and answers with the stored result.
pub async fn update_preferences(
    State(state): State<MemoryState>,
    Path(number): Path<String>,
    Json(update): Json<PreferenceUpdate>,
) -> Result<Json<PreferencesResponse>, MemoryApiError> {
    if update.is_empty() {
        return Err(MemoryApiError::BadRequest("no preference fields were given".to_owned()));
    }
    let user_id = user_id_for(&number);
    state.structured.update_preferences(&user_id, &update).await?;
    let preferences = state.structured.get_preferences(&user_id).await?.unwrap_or_default();
    Ok(Json(PreferencesResponse { user_id, preferences }))
}

pub async fn tasks(
    State(state): State<MemoryState>,
    Path(number): Path<String>,
    Query(query): Query<TaskQuery>,
) -> Result<Json<TasksResponse>, MemoryApiError> {
    let status = match query.status.as_deref() {
        None | Some("") | Some("all") => None,
        Some(value) => Some(TaskStatus::parse(value).ok_or_else(|| {
            MemoryApiError::BadRequest(format!(
                "unknown task status `{value}`; expected pending, done or cancelled"
            ))
        })?),
    };
    let user_id = user_id_for(&number);
    let tasks =
        state.structured.get_tasks(&user_id, status, page(query.limit, DEFAULT_TASKS)).await?;
    Ok(Json(TasksResponse { user_id, tasks }))
}

pub async fn conversations(
    State(state): State<MemoryState>,
    Path(number): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Json<ConversationsResponse>, MemoryApiError> {
    let user_id = user_id_for(&number);
    let conversations = state
        .structured
        .recent_turns(&user_id, page(query.limit, DEFAULT_CONVERSATIONS))
        .await?;
    Ok(Json(ConversationsResponse { user_id, conversations }))
}

pub async fn analysis(
    State(state): State<MemoryState>,
    Path(number): Path<String>,
) -> Result<Json<AnalysisResponse>, MemoryApiError> {
    let user_id = user_id_for(&number);
    let turns = state.structured.recent_turns(&user_id, ANALYSIS_WINDOW).await?;
    let pending =
        state.structured.get_tasks(&user_id, Some(TaskStatus::Pending), DEFAULT_TASKS).await?;
    Ok(Json(AnalysisResponse {
        user_id,
        analysis: ConversationAnalysis::from_history(&turns, &pending),
    }))
}
