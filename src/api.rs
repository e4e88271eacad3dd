use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::error::Error;
use crate::intensity::ConfigUpdate;
use crate::models::{Intensity, NewNote, NoteUpdate};
use crate::orchestrator::{ReviewService, SchedulePreview, SubmitAnswer};
use crate::pregen::PreGenerator;

type ApiResult<T> = Result<T, Error>;

#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<ReviewService>,
    pub pregen: Arc<PreGenerator>,
}

pub fn app_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/notes", get(list_notes).post(create_note))
        .route("/api/notes/:id", get(get_note).put(update_note).delete(delete_note))
        .route("/api/notes/:id/stats", get(note_stats))
        .route("/api/due", get(due_notes))
        .route("/api/session/start", post(start_session))
        .route("/api/session/submit", post(submit_answer))
        .route("/api/session/upcoming", get(upcoming_sessions))
        .route("/api/session/priority", get(priority_note))
        .route("/api/session/:session_id/reviews", get(session_reviews))
        .route("/api/session/:session_id/next", get(next_question))
        .route("/api/session/:session_id/hint", get(hint))
        .route("/api/stats/global", get(global_stats))
        .route("/api/queue/stats", get(queue_stats))
        .route("/api/cache/stats", get(cache_stats))
        .route("/api/cache/clean", post(clean_cache))
        .route("/api/cache/metrics/reset", post(reset_cache_metrics))
        .route("/api/pregenerate", post(pregenerate))
        .route("/api/config/scheduler", get(scheduler_config).put(update_scheduler_config))
        .route("/api/config/ai", get(ai_config))
        .route("/api/schedule/preview", post(preview_schedule))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Conflict { .. } => StatusCode::CONFLICT,
            Error::Llm(_) | Error::Queue(_) => StatusCode::BAD_GATEWAY,
            Error::Storage(_) | Error::Io(_) | Error::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            log::error!("Request failed: {}", self);
        }

        (status, Json(json!({ "message": self.to_string() }))).into_response()
    }
}

#[derive(Deserialize)]
struct IntensityFilter {
    intensity: Option<Intensity>,
}

async fn list_notes(
    State(state): State<ApiState>,
    Query(filter): Query<IntensityFilter>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.list_notes(filter.intensity).await?))
}

async fn create_note(
    State(state): State<ApiState>,
    Json(payload): Json<NewNote>,
) -> ApiResult<impl IntoResponse> {
    let note = state.service.create_note(payload).await?;
    Ok((StatusCode::CREATED, Json(note)))
}

async fn get_note(State(state): State<ApiState>, Path(id): Path<i64>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.get_note(id).await?))
}

async fn update_note(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    Json(payload): Json<NoteUpdate>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.update_note(id, payload).await?))
}

async fn delete_note(State(state): State<ApiState>, Path(id): Path<i64>) -> ApiResult<impl IntoResponse> {
    state.service.delete_note(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn note_stats(State(state): State<ApiState>, Path(id): Path<i64>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.note_stats(id).await?))
}

async fn due_notes(
    State(state): State<ApiState>,
    Query(filter): Query<IntensityFilter>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.due_notes(filter.intensity, Utc::now()).await?))
}

#[derive(Deserialize, Default)]
struct StartSessionRequest {
    #[serde(default)]
    intensity: Intensity,
    #[serde(default)]
    max_notes: Option<usize>,
}

async fn start_session(
    State(state): State<ApiState>,
    payload: Option<Json<StartSessionRequest>>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload.unwrap_or_default();
    Ok(Json(state.service.start_session(request.intensity, request.max_notes).await?))
}

#[derive(Deserialize)]
struct NoteQuery {
    note_id: i64,
}

async fn next_question(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
    Query(query): Query<NoteQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.next_question(&session_id, query.note_id).await?))
}

async fn hint(
    State(state): State<ApiState>,
    Path(_session_id): Path<String>,
    Query(query): Query<NoteQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.hint(query.note_id).await?))
}

async fn session_reviews(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.session_reviews(&session_id).await?))
}

#[derive(Deserialize)]
struct PriorityQuery {
    #[serde(default)]
    intensity: Intensity,
}

async fn priority_note(
    State(state): State<ApiState>,
    Query(query): Query<PriorityQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.priority_note(query.intensity, Utc::now()).await?))
}

async fn submit_answer(
    State(state): State<ApiState>,
    Json(payload): Json<SubmitAnswer>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.submit_answer(payload).await?))
}

const MAX_LOOKAHEAD_HOURS: i64 = 24 * 366;

#[derive(Deserialize)]
struct UpcomingQuery {
    lookahead_hours: Option<i64>,
}

async fn upcoming_sessions(
    State(state): State<ApiState>,
    Query(query): Query<UpcomingQuery>,
) -> ApiResult<impl IntoResponse> {
    let hours = query.lookahead_hours.unwrap_or(24);
    if !(1..=MAX_LOOKAHEAD_HOURS).contains(&hours) {
        return Err(Error::Validation(format!(
            "lookahead_hours must be between 1 and {} (got {})",
            MAX_LOOKAHEAD_HOURS, hours
        )));
    }
    let lookahead = Duration::try_hours(hours)
        .ok_or_else(|| Error::Validation(format!("lookahead_hours is out of range: {}", hours)))?;
    Ok(Json(state.service.upcoming_sessions(Utc::now(), lookahead).await?))
}

async fn global_stats(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.global_stats().await?))
}

async fn queue_stats(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.service.queue_stats())
}

async fn cache_stats(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    let stats = state.service.cache_stats().await?;
    Ok(Json(json!({
        "stats": stats,
        "metrics": state.service.cache_metrics(),
    })))
}

async fn clean_cache(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    let removed = state.service.clean_cache().await?;
    Ok(Json(json!({ "removed": removed })))
}

async fn reset_cache_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    state.service.reset_cache_metrics();
    StatusCode::NO_CONTENT
}

async fn pregenerate(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.pregen.run(Utc::now()).await?))
}

async fn scheduler_config(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.service.scheduler_config().as_ref().clone())
}

async fn update_scheduler_config(
    State(state): State<ApiState>,
    Json(payload): Json<ConfigUpdate>,
) -> ApiResult<impl IntoResponse> {
    let updated = state.service.update_scheduler_config(&payload).await?;
    Ok(Json(updated.as_ref().clone()))
}

async fn preview_schedule(
    State(state): State<ApiState>,
    Json(payload): Json<SchedulePreview>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.preview_schedule(&payload, Utc::now())?))
}

async fn ai_config(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.service.ai_config())
}

#[cfg(test)]
#[path = "api_tests.rs"]
mod tests;
