//! HTTP surface over the task service.
//!
//! Every response is an envelope `{ "data": ..., "meta": ... }`. Errors carry
//! `data: null` and `meta: { message, code }`.

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, PathRejection, QueryRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use serde_json::{Value, json};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::domain::{NewTask, TaskId, TaskPatch};
use crate::error::ServiceError;
use crate::service::{ExecutionsQuery, TaskListQuery, TaskService};

/// Shared state handed to every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    pub service: TaskService,
}

impl AppState {
    #[must_use]
    pub fn new(service: TaskService) -> Self {
        Self { service }
    }
}

/// Response envelope.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub data: T,
    pub meta: Option<Value>,
}

impl<T: Serialize> Envelope<T> {
    fn data(data: T) -> Json<Self> {
        Json(Self { data, meta: None })
    }

    fn with_meta(data: T, meta: Value) -> Json<Self> {
        Json(Self {
            data,
            meta: Some(meta),
        })
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// A service failure rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(ServiceError);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(ServiceError::validation(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self(ServiceError::validation(rejection.body_text()))
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self(ServiceError::validation(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(code = self.0.code(), error = ?self.0, "Request failed");
        }

        let body = Envelope {
            data: Value::Null,
            meta: Some(json!({
                "message": self.0.to_string(),
                "code": self.0.code(),
            })),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Build the router with its layers; state is supplied by the caller.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/tasks", get(list_tasks).post(create_task))
        .route(
            "/tasks/{id}",
            get(get_task).patch(update_task).delete(delete_task),
        )
        .route("/tasks/{id}/metrics", get(task_metrics))
        .route("/tasks/{id}/executions", get(task_executions))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Router bound to a service, ready to serve.
pub fn app(service: TaskService) -> Router {
    router().with_state(AppState::new(service))
}

async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

fn task_id(path: Result<Path<TaskId>, PathRejection>) -> ApiResult<TaskId> {
    let Path(id) = path?;
    if id < 1 {
        return Err(ServiceError::validation("id must be a positive integer").into());
    }
    Ok(id)
}

async fn list_tasks(
    State(state): State<AppState>,
    query: Result<Query<TaskListQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(query) = query?;
    let page = state.service.list_tasks(&query).await?;
    let response = match page.next_cursor {
        Some(cursor) => Envelope::with_meta(page.data, json!({ "nextCursor": cursor })),
        None => Envelope::data(page.data),
    };
    Ok(response)
}

async fn create_task(
    State(state): State<AppState>,
    body: Result<Json<NewTask>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(input) = body?;
    let task = state.service.create_task(&input).await?;
    Ok(Envelope::data(task))
}

async fn get_task(
    State(state): State<AppState>,
    path: Result<Path<TaskId>, PathRejection>,
) -> ApiResult<impl IntoResponse> {
    let id = task_id(path)?;
    Ok(Envelope::data(state.service.get_task(id).await?))
}

async fn update_task(
    State(state): State<AppState>,
    path: Result<Path<TaskId>, PathRejection>,
    body: Result<Json<TaskPatch>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let id = task_id(path)?;
    let Json(patch) = body?;
    Ok(Envelope::data(state.service.update_task(id, &patch).await?))
}

async fn delete_task(
    State(state): State<AppState>,
    path: Result<Path<TaskId>, PathRejection>,
) -> ApiResult<impl IntoResponse> {
    let id = task_id(path)?;
    Ok(Envelope::data(state.service.delete_task(id).await?))
}

async fn task_metrics(
    State(state): State<AppState>,
    path: Result<Path<TaskId>, PathRejection>,
) -> ApiResult<impl IntoResponse> {
    let id = task_id(path)?;
    Ok(Envelope::data(state.service.task_metrics(id).await?))
}

async fn task_executions(
    State(state): State<AppState>,
    path: Result<Path<TaskId>, PathRejection>,
    query: Result<Query<ExecutionsQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let id = task_id(path)?;
    let Query(query) = query?;
    let page = state.service.task_executions(id, &query).await?;
    Ok(Envelope::with_meta(
        page.data,
        json!({ "total": page.total, "page": page.page, "limit": page.limit }),
    ))
}
