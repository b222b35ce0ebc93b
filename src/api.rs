use crate::favorites::{FavoriteError, FavoriteToggle, ToggleOutcome};
use crate::intake::batch::{IngestError, PositionOutOfRange};
use crate::intake::draft::{FieldPatch, SubmitError};
use crate::intake::extraction::ReconcileError;
use crate::intake::session::{DraftSession, DraftView};
use crate::models::{
    ApiError, ExtractResponse, FavoriteRequest, FilePayload, IngestRequest, IngestResponse,
    RemoveImageResponse, SubmitResponse, ValidationResponse,
};
use crate::registry::{DraftRegistry, RegistryError};
use crate::vehicle::ExtractionError;
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post, put},
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use std::future::Future;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub registry: DraftRegistry,
    pub favorites: FavoriteToggle,
    pub prometheus: PrometheusHandle,
    pub metrics_key: Option<String>,
}

pub fn build_router(state: AppState, body_limit: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/drafts", post(create_draft))
        .route("/drafts/{id}", get(get_draft).delete(discard_draft))
        .route("/drafts/{id}/fields", patch(edit_fields))
        .route("/drafts/{id}/validation", get(validation))
        .route("/drafts/{id}/images", post(ingest_images))
        .route("/drafts/{id}/images/{position}", delete(remove_image))
        .route("/drafts/{id}/staged", put(stage_image).delete(clear_staged))
        .route("/drafts/{id}/extract", post(extract))
        .route("/drafts/{id}/reset", post(reset_draft))
        .route("/drafts/{id}/submit", post(submit))
        .route("/cars/{id}/favorite", post(toggle_favorite))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "motor-intake",
    }))
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(secret) = &state.metrics_key {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus.render(),
    )
        .into_response()
}

async fn session(state: &AppState, id: Uuid) -> Result<DraftSession, AppError> {
    state.registry.get(id).await.ok_or(AppError::DraftNotFound(id))
}

/// Runs session work on its own task so it completes even if the client
/// disconnects mid-request.
async fn detached<T, F>(work: F) -> Result<T, AppError>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(work)
        .await
        .map_err(|err| AppError::Internal(err.to_string()))
}

async fn create_draft(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<DraftView>), AppError> {
    crate::metrics::inc_requests("/drafts");
    let session = state.registry.create().await?;
    Ok((StatusCode::CREATED, Json(session.view().await)))
}

async fn get_draft(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DraftView>, AppError> {
    Ok(Json(session(&state, id).await?.view().await))
}

async fn discard_draft(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    if state.registry.discard(id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::DraftNotFound(id))
    }
}

async fn edit_fields(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(patch): Json<FieldPatch>,
) -> Result<Json<DraftView>, AppError> {
    crate::metrics::inc_requests("/drafts/fields");
    let session = session(&state, id).await?;
    session.edit(patch).await;
    Ok(Json(session.view().await))
}

async fn validation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ValidationResponse>, AppError> {
    let session = session(&state, id).await?;
    let errors = match session.validation().await {
        Ok(()) => Vec::new(),
        Err(errors) => errors.fields().to_vec(),
    };
    Ok(Json(ValidationResponse {
        valid: errors.is_empty(),
        errors,
    }))
}

async fn ingest_images(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<IngestRequest>,
) -> Result<Json<IngestResponse>, AppError> {
    crate::metrics::inc_requests("/drafts/images");
    let session = session(&state, id).await?;
    let files = request
        .files
        .into_iter()
        .map(FilePayload::into_file)
        .collect::<Result<Vec<_>, _>>()
        .map_err(AppError::InvalidInput)?;
    info!(target = "intake.api", draft_id = %id, files = files.len(), "ingest_requested");

    let worker = session.clone();
    let report = detached(async move { worker.ingest(files).await }).await??;
    Ok(Json(IngestResponse {
        report,
        draft: session.view().await,
    }))
}

async fn remove_image(
    State(state): State<AppState>,
    Path((id, position)): Path<(Uuid, usize)>,
) -> Result<Json<RemoveImageResponse>, AppError> {
    let session = session(&state, id).await?;
    let batch_len = session.remove_image(position)?;
    Ok(Json(RemoveImageResponse { batch_len }))
}

async fn stage_image(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<FilePayload>,
) -> Result<Json<DraftView>, AppError> {
    let session = session(&state, id).await?;
    let file = payload.into_file().map_err(AppError::InvalidInput)?;
    session.stage(file).await?;
    Ok(Json(session.view().await))
}

async fn clear_staged(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DraftView>, AppError> {
    let session = session(&state, id).await?;
    session.clear_staged().await;
    Ok(Json(session.view().await))
}

async fn extract(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ExtractResponse>, AppError> {
    crate::metrics::inc_requests("/drafts/extract");
    let session = session(&state, id).await?;
    let worker = session.clone();
    let extraction = detached(async move { worker.extract().await }).await??;
    Ok(Json(ExtractResponse {
        extraction,
        draft: session.view().await,
    }))
}

async fn reset_draft(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DraftView>, AppError> {
    let session = session(&state, id).await?;
    Ok(Json(session.reset().await))
}

async fn submit(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SubmitResponse>, AppError> {
    crate::metrics::inc_requests("/drafts/submit");
    let session = session(&state, id).await?;
    let worker = session.clone();
    let listing = detached(async move { worker.submit().await }).await??;
    Ok(Json(SubmitResponse {
        listing,
        draft: session.view().await,
    }))
}

async fn toggle_favorite(
    State(state): State<AppState>,
    Path(car_id): Path<String>,
    Json(request): Json<FavoriteRequest>,
) -> Result<Json<ToggleOutcome>, AppError> {
    crate::metrics::inc_requests("/cars/favorite");
    let favorites = state.favorites.clone();
    let outcome =
        detached(async move { favorites.toggle(&request.user_id, &car_id).await }).await??;
    Ok(Json(outcome))
}

#[derive(Debug)]
enum AppError {
    DraftNotFound(Uuid),
    InvalidInput(String),
    Registry(RegistryError),
    Ingest(IngestError),
    Position(PositionOutOfRange),
    Reconcile(ReconcileError),
    Submit(SubmitError),
    Favorite(FavoriteError),
    Internal(String),
}

impl From<RegistryError> for AppError {
    fn from(value: RegistryError) -> Self {
        Self::Registry(value)
    }
}

impl From<IngestError> for AppError {
    fn from(value: IngestError) -> Self {
        Self::Ingest(value)
    }
}

impl From<PositionOutOfRange> for AppError {
    fn from(value: PositionOutOfRange) -> Self {
        Self::Position(value)
    }
}

impl From<ReconcileError> for AppError {
    fn from(value: ReconcileError) -> Self {
        Self::Reconcile(value)
    }
}

impl From<SubmitError> for AppError {
    fn from(value: SubmitError) -> Self {
        Self::Submit(value)
    }
}

impl From<FavoriteError> for AppError {
    fn from(value: FavoriteError) -> Self {
        Self::Favorite(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut fields = None;
        let (status, code) = match &self {
            AppError::DraftNotFound(_) => (StatusCode::NOT_FOUND, "draft_not_found"),
            AppError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
            AppError::Registry(_) => (StatusCode::CONFLICT, "draft_limit"),
            AppError::Ingest(IngestError::NoAcceptedFiles { .. }) => {
                (StatusCode::BAD_REQUEST, "no_accepted_files")
            }
            AppError::Ingest(IngestError::Superseded) => (StatusCode::CONFLICT, "superseded"),
            AppError::Position(_) => (StatusCode::BAD_REQUEST, "position_out_of_range"),
            AppError::Reconcile(err) => match err {
                ReconcileError::NoImageStaged => (StatusCode::BAD_REQUEST, "no_image_staged"),
                ReconcileError::InFlight => (StatusCode::CONFLICT, "extraction_in_flight"),
                ReconcileError::Admission(_) => (StatusCode::BAD_REQUEST, "admission"),
                ReconcileError::Extraction(ExtractionError::Decode(_)) => {
                    (StatusCode::BAD_REQUEST, "decode")
                }
                ReconcileError::Extraction(_) => (StatusCode::BAD_GATEWAY, "extraction_failed"),
                ReconcileError::Superseded => (StatusCode::CONFLICT, "superseded"),
            },
            AppError::Submit(err) => match err {
                SubmitError::MissingImages => (StatusCode::BAD_REQUEST, "missing_images"),
                SubmitError::Validation(errors) => {
                    fields = Some(errors.fields().to_vec());
                    (StatusCode::UNPROCESSABLE_ENTITY, "validation")
                }
                SubmitError::InFlight => (StatusCode::CONFLICT, "submission_in_flight"),
                SubmitError::Superseded => (StatusCode::CONFLICT, "superseded"),
                SubmitError::Persist(_) => (StatusCode::BAD_GATEWAY, "persist_failed"),
            },
            AppError::Favorite(err) => match err {
                FavoriteError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
                FavoriteError::InFlight => (StatusCode::CONFLICT, "favorite_in_flight"),
                FavoriteError::Store(_) => (StatusCode::BAD_GATEWAY, "favorite_failed"),
            },
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };

        let detail = match self {
            AppError::DraftNotFound(id) => format!("no draft with id {id}"),
            AppError::InvalidInput(detail) | AppError::Internal(detail) => detail,
            AppError::Ingest(IngestError::NoAcceptedFiles { diagnostics }) => diagnostics
                .iter()
                .filter_map(|report| report.error.as_ref().map(ToString::to_string))
                .collect::<Vec<_>>()
                .join("; "),
            AppError::Registry(err) => err.to_string(),
            AppError::Ingest(err) => err.to_string(),
            AppError::Position(err) => err.to_string(),
            AppError::Reconcile(err) => err.to_string(),
            AppError::Submit(err) => err.to_string(),
            AppError::Favorite(err) => err.to_string(),
        };
        if status.is_server_error() {
            error!(target = "intake.api", code, detail = %detail, "request_failed");
        }

        let payload = ApiError {
            error: code.to_string(),
            detail: Some(detail),
            fields,
        };
        (status, Json(payload)).into_response()
    }
}
