use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::error;

use crate::{
    engine::ExplainEngine,
    error::ExplainError,
    models::{
        Caller, ExamPartRef, ExplainPassageRequest, ExplainQuestionRequest, ExplainResponse,
        Explanation, GroupExplanation, HealthResponse, ReadingCacheEntry, ReadingQuery,
    },
};

const USER_ID_HEADER: &str = "x-user-id";
const USER_ROLE_HEADER: &str = "x-user-role";
const PRIVILEGED_ROLE: &str = "admin";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ExplainEngine>,
}

impl AppState {
    pub fn new(engine: Arc<ExplainEngine>) -> Self {
        Self { engine }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/exams/:level/:exam_id/:part/explain", post(explain_question))
        .route("/exams/:level/:exam_id/:part/explain-passage", post(explain_passage))
        .route(
            "/exams/:level/:exam_id/:part/readings/:section_index/:question_index",
            get(question_readings),
        )
        .with_state(state)
        .layer(CorsLayer::permissive())
}

#[derive(Debug)]
pub struct ApiError(ExplainError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ExplainError::NotFound(_) => StatusCode::NOT_FOUND,
            ExplainError::Unauthorized => StatusCode::UNAUTHORIZED,
            ExplainError::Forbidden(_) => StatusCode::FORBIDDEN,
            ExplainError::QuotaExhausted => StatusCode::TOO_MANY_REQUESTS,
            ExplainError::UpstreamCall(_) => StatusCode::BAD_GATEWAY,
            ExplainError::UpstreamConfig(_) | ExplainError::Store(_) | ExplainError::Tokenizer(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            error!(code = self.0.code(), "request failed: {}", self.0);
        }
        let body = Json(json!({ "detail": self.0.to_string(), "code": self.0.code() }));
        (status, body).into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<ExplainError>,
{
    fn from(err: E) -> Self {
        ApiError(err.into())
    }
}

/// Identity is set by the gateway in front of this service.
fn caller_from_headers(headers: &HeaderMap) -> Result<Caller, ExplainError> {
    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(ExplainError::Unauthorized)?;
    let privileged = headers
        .get(USER_ROLE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|role| role.trim().eq_ignore_ascii_case(PRIVILEGED_ROLE))
        .unwrap_or(false);
    Ok(Caller {
        user_id: user_id.to_string(),
        privileged,
    })
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        db: state.engine.store_ready().await,
        tokenizer_ready: state.engine.tokenizer_ready(),
        prompt_version: state.engine.prompt_version().to_string(),
    })
}

pub async fn explain_question(
    State(state): State<AppState>,
    Path((level, exam_id, part)): Path<(String, String, String)>,
    headers: HeaderMap,
    Json(payload): Json<ExplainQuestionRequest>,
) -> Result<Json<ExplainResponse<Explanation>>, ApiError> {
    let caller = caller_from_headers(&headers)?;
    let coord = ExamPartRef {
        level,
        exam_id,
        part,
    }
    .question(payload.section_index, payload.question_index);
    let response = state
        .engine
        .explain_question(&caller, &coord, payload.force_refresh)
        .await?;
    Ok(Json(response))
}

pub async fn explain_passage(
    State(state): State<AppState>,
    Path((level, exam_id, part)): Path<(String, String, String)>,
    headers: HeaderMap,
    Json(payload): Json<ExplainPassageRequest>,
) -> Result<Json<ExplainResponse<GroupExplanation>>, ApiError> {
    let caller = caller_from_headers(&headers)?;
    let part = ExamPartRef {
        level,
        exam_id,
        part,
    };
    let response = state
        .engine
        .explain_passage_group(
            &caller,
            &part,
            payload.section_index,
            &payload.question_indices,
            payload.force_refresh,
        )
        .await?;
    Ok(Json(response))
}

pub async fn question_readings(
    State(state): State<AppState>,
    Path((level, exam_id, part, section_index, question_index)): Path<(String, String, String, usize, usize)>,
    Query(query): Query<ReadingQuery>,
    headers: HeaderMap,
) -> Result<Json<ReadingCacheEntry>, ApiError> {
    let caller = caller_from_headers(&headers)?;
    let coord = ExamPartRef {
        level,
        exam_id,
        part,
    }
    .question(section_index, question_index);
    let entry = state.engine.reading_for(&caller, &coord, query.refresh).await?;
    Ok(Json(entry))
}
