//! services/api/src/web/rest.rs
//!
//! Contains the Axum handlers for the REST API endpoints and the master
//! definition for the OpenAPI specification.
//!
//! Every handler is a thin translation: read the caller from the headers,
//! call one `CourseEngine` operation, wrap the result. Authentication happens
//! upstream; this service trusts `x-user-id` and `x-user-tier`.

use crate::error::{ApiError, ErrorBody};
use crate::web::state::AppState;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use course_engine_core::dispatcher::{DispatchCounts, DispatchState};
use course_engine_core::{
    CompletionOutcome, Course, Learner, NextUnit, Step, Tier, Unit, UnitCompletion, UnitRequest,
    UsageReport,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        health_handler,
        create_course_handler,
        list_courses_handler,
        get_course_handler,
        delete_course_handler,
        archive_course_handler,
        unarchive_course_handler,
        next_unit_handler,
        generate_unit_handler,
        next_step_handler,
        complete_step_handler,
        view_step_handler,
        complete_block_handler,
        usage_handler,
    ),
    components(
        schemas(
            ErrorBody,
            HealthResponse,
            CreateCourseRequest,
            CreateCourseResponse,
            CourseResponse,
            CourseListResponse,
            NextUnitResponse,
            GenerateUnitRequest,
            UnitResponse,
            StepResponse,
            CompletionRequest,
            CompletionResponse,
            UsageResponse,
        )
    ),
    tags(
        (name = "Course Engine API", description = "Course generation and progression for personalized learning.")
    )
)]
pub struct ApiDoc;

//=========================================================================================
// API Response and Payload Structs
//=========================================================================================

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub cache_entries: usize,
    #[schema(value_type = Object)]
    pub dispatch: DispatchCounts,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateCourseRequest {
    pub title: String,
    #[serde(default)]
    pub goal: Option<String>,
}

/// The course as stored, plus where its outline generation went.
#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateCourseResponse {
    #[schema(value_type = Object)]
    pub course: Course,
    /// One of `queued`, `running`, `done`, `dropped`.
    pub outline_task: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
}

#[derive(Serialize, ToSchema)]
pub struct CourseResponse {
    #[schema(value_type = Object)]
    pub course: Course,
}

#[derive(Serialize, ToSchema)]
pub struct CourseListResponse {
    #[schema(value_type = Vec<Object>)]
    pub courses: Vec<Course>,
}

#[derive(Serialize, ToSchema)]
pub struct NextUnitResponse {
    #[schema(value_type = Object)]
    pub next: NextUnit,
}

/// `{"request": {"unit": "lesson_blocks", "lesson_id": "..."}}`
#[derive(Deserialize, ToSchema)]
pub struct GenerateUnitRequest {
    #[schema(value_type = Object)]
    pub request: UnitRequest,
}

#[derive(Serialize, ToSchema)]
pub struct UnitResponse {
    #[schema(value_type = Object)]
    pub unit: Unit,
}

#[derive(Serialize, ToSchema)]
pub struct StepResponse {
    #[schema(value_type = Object)]
    pub step: Step,
}

#[derive(Deserialize, ToSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRequest {
    #[serde(default)]
    pub user_answer: Option<String>,
    /// 0-100.
    #[serde(default)]
    pub score: Option<f64>,
}

impl From<CompletionRequest> for UnitCompletion {
    fn from(req: CompletionRequest) -> Self {
        UnitCompletion {
            user_answer: req.user_answer,
            score: req.score,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct CompletionResponse {
    #[schema(value_type = Object)]
    pub outcome: CompletionOutcome,
}

#[derive(Serialize, ToSchema)]
pub struct UsageResponse {
    #[schema(value_type = Object)]
    pub usage: UsageReport,
}

//=========================================================================================
// Caller Identity
//=========================================================================================

/// Reads the caller from `x-user-id` (required) and `x-user-tier` (default free).
fn learner_from_headers(headers: &HeaderMap) -> Result<Learner, ApiError> {
    let user_id_str = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::bad_request("x-user-id header is required"))?;
    let user_id = Uuid::parse_str(user_id_str.trim())
        .map_err(|_| ApiError::bad_request("Invalid x-user-id format"))?;

    let tier = match headers.get("x-user-tier") {
        None => Tier::default(),
        Some(raw) => raw
            .to_str()
            .map_err(|_| ApiError::bad_request("Invalid x-user-tier format"))?
            .parse::<Tier>()
            .map_err(ApiError::bad_request)?,
    };
    Ok(Learner { user_id, tier })
}

//=========================================================================================
// Router
//=========================================================================================

/// All REST routes, bound to the shared state.
pub fn api_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/courses",
            post(create_course_handler).get(list_courses_handler),
        )
        .route(
            "/courses/{course_id}",
            get(get_course_handler).delete(delete_course_handler),
        )
        .route("/courses/{course_id}/archive", post(archive_course_handler))
        .route("/courses/{course_id}/unarchive", post(unarchive_course_handler))
        .route("/courses/{course_id}/next", get(next_unit_handler))
        .route("/courses/{course_id}/generate", post(generate_unit_handler))
        .route("/courses/{course_id}/steps/next", post(next_step_handler))
        .route(
            "/courses/{course_id}/steps/{step_id}/complete",
            post(complete_step_handler),
        )
        .route(
            "/courses/{course_id}/steps/{step_id}/view",
            post(view_step_handler),
        )
        .route(
            "/courses/{course_id}/lessons/{lesson_id}/blocks/{block_id}/complete",
            post(complete_block_handler),
        )
        .route("/usage", get(usage_handler))
        .with_state(state)
}

//=========================================================================================
// REST API Handlers
//=========================================================================================

/// Liveness plus a view of the background machinery.
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is up", body = HealthResponse))
)]
pub async fn health_handler(State(app_state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        cache_entries: app_state.engine.cache().size(),
        dispatch: app_state.engine.dispatch_stats(),
    })
}

/// Create a course. The outline is generated in the background.
#[utoipa::path(
    post,
    path = "/courses",
    request_body = CreateCourseRequest,
    responses(
        (status = 201, description = "Course created", body = CreateCourseResponse),
        (status = 400, description = "Missing header or empty title", body = ErrorBody),
        (status = 403, description = "Active-course or usage limit reached", body = ErrorBody)
    ),
    params(
        ("x-user-id" = Uuid, Header, description = "The unique ID of the user."),
        ("x-user-tier" = Option<String>, Header, description = "free (default) or pro.")
    )
)]
pub async fn create_course_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<CreateCourseRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let learner = learner_from_headers(&headers)?;
    let goal = payload.goal.unwrap_or_default();
    let (course, ticket) = app_state
        .engine
        .create_course(&learner, &payload.title, &goal)
        .await?;

    let (outline_task, task_id) = match ticket.state() {
        DispatchState::Queued { task_id } => ("queued", Some(task_id)),
        DispatchState::RunningDetached => ("running", None),
        DispatchState::Done => ("done", None),
        DispatchState::Dropped(_) => ("dropped", None),
    };
    Ok((
        StatusCode::CREATED,
        Json(CreateCourseResponse {
            course,
            outline_task: outline_task.to_string(),
            task_id,
        }),
    ))
}

/// List the caller's courses, most recently updated first.
#[utoipa::path(
    get,
    path = "/courses",
    responses((status = 200, description = "The caller's courses", body = CourseListResponse)),
    params(("x-user-id" = Uuid, Header, description = "The unique ID of the user."))
)]
pub async fn list_courses_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<CourseListResponse>, ApiError> {
    let learner = learner_from_headers(&headers)?;
    let courses = app_state.engine.list_courses(&learner).await?;
    Ok(Json(CourseListResponse { courses }))
}

#[utoipa::path(
    get,
    path = "/courses/{course_id}",
    responses(
        (status = 200, description = "The course", body = CourseResponse),
        (status = 404, description = "No such course", body = ErrorBody)
    ),
    params(
        ("course_id" = Uuid, Path, description = "Course ID"),
        ("x-user-id" = Uuid, Header, description = "The unique ID of the user.")
    )
)]
pub async fn get_course_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(course_id): Path<Uuid>,
) -> Result<Json<CourseResponse>, ApiError> {
    let learner = learner_from_headers(&headers)?;
    let course = app_state.engine.get_course(&learner, course_id).await?;
    Ok(Json(CourseResponse { course }))
}

/// Soft-delete a course. Repeating the call is harmless.
#[utoipa::path(
    delete,
    path = "/courses/{course_id}",
    responses(
        (status = 204, description = "Course deleted"),
        (status = 404, description = "No such course", body = ErrorBody)
    ),
    params(
        ("course_id" = Uuid, Path, description = "Course ID"),
        ("x-user-id" = Uuid, Header, description = "The unique ID of the user.")
    )
)]
pub async fn delete_course_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(course_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let learner = learner_from_headers(&headers)?;
    app_state.engine.delete_course(&learner, course_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/courses/{course_id}/archive",
    responses(
        (status = 200, description = "Course archived", body = CourseResponse),
        (status = 400, description = "Course cannot be archived", body = ErrorBody)
    ),
    params(
        ("course_id" = Uuid, Path, description = "Course ID"),
        ("x-user-id" = Uuid, Header, description = "The unique ID of the user.")
    )
)]
pub async fn archive_course_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(course_id): Path<Uuid>,
) -> Result<Json<CourseResponse>, ApiError> {
    let learner = learner_from_headers(&headers)?;
    let course = app_state.engine.archive_course(&learner, course_id).await?;
    Ok(Json(CourseResponse { course }))
}

#[utoipa::path(
    post,
    path = "/courses/{course_id}/unarchive",
    responses(
        (status = 200, description = "Course restored", body = CourseResponse),
        (status = 403, description = "Active-course limit reached", body = ErrorBody)
    ),
    params(
        ("course_id" = Uuid, Path, description = "Course ID"),
        ("x-user-id" = Uuid, Header, description = "The unique ID of the user."),
        ("x-user-tier" = Option<String>, Header, description = "free (default) or pro.")
    )
)]
pub async fn unarchive_course_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(course_id): Path<Uuid>,
) -> Result<Json<CourseResponse>, ApiError> {
    let learner = learner_from_headers(&headers)?;
    let course = app_state.engine.unarchive_course(&learner, course_id).await?;
    Ok(Json(CourseResponse { course }))
}

/// What the learner should do next. Never triggers generation.
#[utoipa::path(
    get,
    path = "/courses/{course_id}/next",
    responses((status = 200, description = "The next unit", body = NextUnitResponse)),
    params(
        ("course_id" = Uuid, Path, description = "Course ID"),
        ("x-user-id" = Uuid, Header, description = "The unique ID of the user.")
    )
)]
pub async fn next_unit_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(course_id): Path<Uuid>,
) -> Result<Json<NextUnitResponse>, ApiError> {
    let learner = learner_from_headers(&headers)?;
    let next = app_state.engine.next_unit(&learner, course_id).await?;
    Ok(Json(NextUnitResponse { next }))
}

/// Generate one unit (outline, step, lesson blocks or block content).
#[utoipa::path(
    post,
    path = "/courses/{course_id}/generate",
    request_body = GenerateUnitRequest,
    responses(
        (status = 200, description = "The generated or existing unit", body = UnitResponse),
        (status = 403, description = "Usage limit reached", body = ErrorBody),
        (status = 409, description = "Course is not active", body = ErrorBody),
        (status = 502, description = "Generation failed", body = ErrorBody)
    ),
    params(
        ("course_id" = Uuid, Path, description = "Course ID"),
        ("x-user-id" = Uuid, Header, description = "The unique ID of the user."),
        ("x-user-tier" = Option<String>, Header, description = "free (default) or pro.")
    )
)]
pub async fn generate_unit_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(course_id): Path<Uuid>,
    Json(payload): Json<GenerateUnitRequest>,
) -> Result<Json<UnitResponse>, ApiError> {
    let learner = learner_from_headers(&headers)?;
    let unit = app_state
        .engine
        .generate_unit(&learner, course_id, &payload.request)
        .await?;
    Ok(Json(UnitResponse { unit }))
}

/// The current unfinished step, generated if there is none.
#[utoipa::path(
    post,
    path = "/courses/{course_id}/steps/next",
    responses(
        (status = 200, description = "The step to work on", body = StepResponse),
        (status = 502, description = "Generation failed", body = ErrorBody)
    ),
    params(
        ("course_id" = Uuid, Path, description = "Course ID"),
        ("x-user-id" = Uuid, Header, description = "The unique ID of the user."),
        ("x-user-tier" = Option<String>, Header, description = "free (default) or pro.")
    )
)]
pub async fn next_step_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(course_id): Path<Uuid>,
) -> Result<Json<StepResponse>, ApiError> {
    let learner = learner_from_headers(&headers)?;
    let step = app_state.engine.next_step(&learner, course_id).await?;
    Ok(Json(StepResponse { step }))
}

#[utoipa::path(
    post,
    path = "/courses/{course_id}/steps/{step_id}/complete",
    request_body = CompletionRequest,
    responses(
        (status = 200, description = "Completion recorded", body = CompletionResponse),
        (status = 404, description = "No such step", body = ErrorBody)
    ),
    params(
        ("course_id" = Uuid, Path, description = "Course ID"),
        ("step_id" = String, Path, description = "Step ID"),
        ("x-user-id" = Uuid, Header, description = "The unique ID of the user.")
    )
)]
pub async fn complete_step_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((course_id, step_id)): Path<(Uuid, String)>,
    Json(payload): Json<CompletionRequest>,
) -> Result<Json<CompletionResponse>, ApiError> {
    let learner = learner_from_headers(&headers)?;
    let outcome = app_state
        .engine
        .complete_step(&learner, course_id, &step_id, payload.into())
        .await?;
    Ok(Json(CompletionResponse { outcome }))
}

/// Record a review of a step. Works on archived and completed courses.
#[utoipa::path(
    post,
    path = "/courses/{course_id}/steps/{step_id}/view",
    responses(
        (status = 200, description = "The step", body = StepResponse),
        (status = 404, description = "No such step", body = ErrorBody)
    ),
    params(
        ("course_id" = Uuid, Path, description = "Course ID"),
        ("step_id" = String, Path, description = "Step ID"),
        ("x-user-id" = Uuid, Header, description = "The unique ID of the user.")
    )
)]
pub async fn view_step_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((course_id, step_id)): Path<(Uuid, String)>,
) -> Result<Json<StepResponse>, ApiError> {
    let learner = learner_from_headers(&headers)?;
    let step = app_state.engine.view_step(&learner, course_id, &step_id).await?;
    Ok(Json(StepResponse { step }))
}

#[utoipa::path(
    post,
    path = "/courses/{course_id}/lessons/{lesson_id}/blocks/{block_id}/complete",
    request_body = CompletionRequest,
    responses(
        (status = 200, description = "Completion recorded", body = CompletionResponse),
        (status = 400, description = "Unknown lesson or block", body = ErrorBody)
    ),
    params(
        ("course_id" = Uuid, Path, description = "Course ID"),
        ("lesson_id" = String, Path, description = "Lesson ID"),
        ("block_id" = String, Path, description = "Block ID"),
        ("x-user-id" = Uuid, Header, description = "The unique ID of the user.")
    )
)]
pub async fn complete_block_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((course_id, lesson_id, block_id)): Path<(Uuid, String, String)>,
    Json(payload): Json<CompletionRequest>,
) -> Result<Json<CompletionResponse>, ApiError> {
    let learner = learner_from_headers(&headers)?;
    let outcome = app_state
        .engine
        .complete_block(&learner, course_id, &lesson_id, &block_id, payload.into())
        .await?;
    Ok(Json(CompletionResponse { outcome }))
}

/// Usage against every window plus the active-course cap.
#[utoipa::path(
    get,
    path = "/usage",
    responses((status = 200, description = "Current usage", body = UsageResponse)),
    params(
        ("x-user-id" = Uuid, Header, description = "The unique ID of the user."),
        ("x-user-tier" = Option<String>, Header, description = "free (default) or pro.")
    )
)]
pub async fn usage_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<UsageResponse>, ApiError> {
    let learner = learner_from_headers(&headers)?;
    let usage = app_state.engine.usage_status(&learner).await?;
    Ok(Json(UsageResponse { usage }))
}
