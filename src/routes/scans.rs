use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    middleware,
    routing::{get, post},
};
use axum_valid::Valid;
use uuid::Uuid;

use crate::{
    dao::models::ScanSource,
    dto::scans::{ResubmitScanQuery, ScanAccepted, ScanResponse, SubmitScanQuery},
    error::{AppError, ServiceError},
    routes::admin::require_admin_token,
    services::{admin_service, intake},
    state::SharedState,
};

/// Largest accepted scan upload.
const MAX_SCAN_BYTES: usize = 20 * 1024 * 1024;

/// Scan intake endpoints. Resubmission is an operator action and shares the
/// admin guard.
pub fn router(state: SharedState) -> Router<SharedState> {
    let operator = Router::new()
        .route("/scans/{id}/resubmit", post(resubmit_scan))
        .route_layer(middleware::from_fn_with_state(state, require_admin_token));

    Router::new()
        .route(
            "/scans",
            post(submit_scan).layer(DefaultBodyLimit::max(MAX_SCAN_BYTES)),
        )
        .route("/scans/{id}", get(get_scan))
        .merge(operator)
}

/// Upload one returned sheet image. The body is the raw image.
#[utoipa::path(
    post,
    path = "/scans",
    tag = "scans",
    params(SubmitScanQuery),
    request_body(content = Vec<u8>, content_type = "application/octet-stream"),
    responses(
        (status = 202, description = "Image accepted for ingestion", body = ScanAccepted),
        (status = 400, description = "Empty body or invalid parameters")
    )
)]
pub async fn submit_scan(
    State(state): State<SharedState>,
    Valid(Query(query)): Valid<Query<SubmitScanQuery>>,
    body: Bytes,
) -> Result<(StatusCode, Json<ScanAccepted>), AppError> {
    if body.is_empty() {
        return Err(AppError::BadRequest("scan body is empty".into()));
    }
    let source = ScanSource {
        origin: query.source.unwrap_or_else(|| "upload".into()),
        file_name: query.file_name,
    };
    let id = intake::submit(&state, body.to_vec(), source, query.sheet_type)
        .await
        .map_err(ServiceError::from)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ScanAccepted { id, submission: 1 }),
    ))
}

/// Ingest status of one uploaded image.
#[utoipa::path(
    get,
    path = "/scans/{id}",
    tag = "scans",
    params(("id" = String, Path, description = "Identifier returned by the upload")),
    responses((status = 200, description = "Ingest record", body = ScanResponse))
)]
pub async fn get_scan(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ScanResponse>, AppError> {
    Ok(Json(admin_service::get_scan(&state, id).await?))
}

/// Put a rejected image back into the pipeline.
#[utoipa::path(
    post,
    path = "/scans/{id}/resubmit",
    tag = "scans",
    params(("X-Admin-Token" = String, Header, description = "Configured admin token"),
    ("id" = String, Path, description = "Identifier of the rejected image"),
    ResubmitScanQuery),
    responses(
        (status = 202, description = "Image queued again", body = ScanAccepted),
        (status = 409, description = "Image is not rejected")
    )
)]
pub async fn resubmit_scan(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ResubmitScanQuery>,
) -> Result<(StatusCode, Json<ScanAccepted>), AppError> {
    let accepted = admin_service::resubmit_scan(&state, id, query.sheet_type).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}
