use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use axum_valid::Valid;
use uuid::Uuid;

use crate::{
    dto::{
        admin::{
            AccountResponse, ActionResponse, CreateAccountRequest, CreateGameRequest,
            CreateInstanceRequest, GameResponse, InstanceResponse, SubscribeRequest,
            SubscriptionResponse, TurnSheetSummary,
        },
        scans::ScanResponse,
    },
    error::AppError,
    services::admin_service,
    state::SharedState,
};

const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Admin-only management endpoints for games, instances and subscriptions.
pub fn router(state: SharedState) -> Router<SharedState> {
    Router::new()
        .route("/admin/accounts", post(create_account))
        .route("/admin/games", post(create_game))
        .route("/admin/games/{id}/instances", post(create_instance))
        .route("/admin/instances/{id}", get(get_instance))
        .route("/admin/instances/{id}/subscriptions", post(subscribe))
        .route("/admin/instances/{id}/start", post(start_instance))
        .route("/admin/instances/{id}/cancel", post(cancel_instance))
        .route(
            "/admin/instances/{id}/turns/{turn}/sheets",
            get(list_turn_sheets),
        )
        .route(
            "/admin/subscriptions/{id}/withdraw",
            post(withdraw_subscription),
        )
        .route("/admin/scans/rejected", get(list_rejected_scans))
        .route_layer(middleware::from_fn_with_state(state, require_admin_token))
}

/// Register a player account.
#[utoipa::path(
    post,
    path = "/admin/accounts",
    tag = "admin",
    params(("X-Admin-Token" = String, Header, description = "Configured admin token")),
    request_body = CreateAccountRequest,
    responses((status = 201, description = "Account created", body = AccountResponse))
)]
pub async fn create_account(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<CreateAccountRequest>>,
) -> Result<(StatusCode, Json<AccountResponse>), AppError> {
    let account = admin_service::create_account(&state, payload).await?;
    Ok((StatusCode::CREATED, Json(account)))
}

/// Define a new game.
#[utoipa::path(
    post,
    path = "/admin/games",
    tag = "admin",
    params(("X-Admin-Token" = String, Header, description = "Configured admin token")),
    request_body = CreateGameRequest,
    responses((status = 201, description = "Game created", body = GameResponse))
)]
pub async fn create_game(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<CreateGameRequest>>,
) -> Result<(StatusCode, Json<GameResponse>), AppError> {
    let game = admin_service::create_game(&state, payload).await?;
    Ok((StatusCode::CREATED, Json(game)))
}

/// Create a pending instance of a game.
#[utoipa::path(
    post,
    path = "/admin/games/{id}/instances",
    tag = "admin",
    params(("X-Admin-Token" = String, Header, description = "Configured admin token"),
    ("id" = String, Path, description = "Identifier of the game")),
    request_body = CreateInstanceRequest,
    responses((status = 201, description = "Instance created", body = InstanceResponse))
)]
pub async fn create_instance(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Valid(Json(payload)): Valid<Json<CreateInstanceRequest>>,
) -> Result<(StatusCode, Json<InstanceResponse>), AppError> {
    let instance = admin_service::create_instance(&state, id, payload).await?;
    Ok((StatusCode::CREATED, Json(instance)))
}

/// Current status of an instance.
#[utoipa::path(
    get,
    path = "/admin/instances/{id}",
    tag = "admin",
    params(("X-Admin-Token" = String, Header, description = "Configured admin token"),
    ("id" = String, Path, description = "Identifier of the instance")),
    responses((status = 200, description = "Instance", body = InstanceResponse))
)]
pub async fn get_instance(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<InstanceResponse>, AppError> {
    Ok(Json(admin_service::get_instance(&state, id).await?))
}

/// Subscribe an account to an instance.
#[utoipa::path(
    post,
    path = "/admin/instances/{id}/subscriptions",
    tag = "admin",
    params(("X-Admin-Token" = String, Header, description = "Configured admin token"),
    ("id" = String, Path, description = "Identifier of the instance")),
    request_body = SubscribeRequest,
    responses((status = 201, description = "Subscription created", body = SubscriptionResponse))
)]
pub async fn subscribe(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Valid(Json(payload)): Valid<Json<SubscribeRequest>>,
) -> Result<(StatusCode, Json<SubscriptionResponse>), AppError> {
    let subscription = admin_service::subscribe(&state, id, payload).await?;
    Ok((StatusCode::CREATED, Json(subscription)))
}

/// Start a pending instance and queue its first turn.
#[utoipa::path(
    post,
    path = "/admin/instances/{id}/start",
    tag = "admin",
    params(("X-Admin-Token" = String, Header, description = "Configured admin token"),
    ("id" = String, Path, description = "Identifier of the instance")),
    responses((status = 200, description = "Instance started", body = InstanceResponse))
)]
pub async fn start_instance(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<InstanceResponse>, AppError> {
    Ok(Json(admin_service::start_instance(&state, id).await?))
}

/// Cancel an instance.
#[utoipa::path(
    post,
    path = "/admin/instances/{id}/cancel",
    tag = "admin",
    params(("X-Admin-Token" = String, Header, description = "Configured admin token"),
    ("id" = String, Path, description = "Identifier of the instance")),
    responses((status = 200, description = "Instance cancelled", body = InstanceResponse))
)]
pub async fn cancel_instance(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<InstanceResponse>, AppError> {
    Ok(Json(admin_service::cancel_instance(&state, id).await?))
}

/// Sheets of one turn with their delivery attempts.
#[utoipa::path(
    get,
    path = "/admin/instances/{id}/turns/{turn}/sheets",
    tag = "admin",
    params(("X-Admin-Token" = String, Header, description = "Configured admin token"),
    ("id" = String, Path, description = "Identifier of the instance"),
    ("turn" = u32, Path, description = "Turn number")),
    responses((status = 200, description = "Turn sheets", body = [TurnSheetSummary]))
)]
pub async fn list_turn_sheets(
    State(state): State<SharedState>,
    Path((id, turn)): Path<(Uuid, u32)>,
) -> Result<Json<Vec<TurnSheetSummary>>, AppError> {
    Ok(Json(admin_service::list_turn_sheets(&state, id, turn).await?))
}

/// Withdraw a subscription.
#[utoipa::path(
    post,
    path = "/admin/subscriptions/{id}/withdraw",
    tag = "admin",
    params(("X-Admin-Token" = String, Header, description = "Configured admin token"),
    ("id" = String, Path, description = "Identifier of the subscription")),
    responses((status = 200, description = "Subscription withdrawn", body = ActionResponse))
)]
pub async fn withdraw_subscription(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ActionResponse>, AppError> {
    Ok(Json(admin_service::withdraw_subscription(&state, id).await?))
}

/// Rejected scans awaiting manual reconciliation.
#[utoipa::path(
    get,
    path = "/admin/scans/rejected",
    tag = "admin",
    params(("X-Admin-Token" = String, Header, description = "Configured admin token")),
    responses((status = 200, description = "Rejected scans", body = [ScanResponse]))
)]
pub async fn list_rejected_scans(
    State(state): State<SharedState>,
) -> Result<Json<Vec<ScanResponse>>, AppError> {
    Ok(Json(admin_service::list_rejected_scans(&state).await?))
}

/// Reject requests lacking the configured admin token. Routes stay open when
/// no token is configured.
pub(crate) async fn require_admin_token(
    State(state): State<SharedState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let Some(expected) = state.config().admin_token.as_deref() else {
        return Ok(next.run(req).await);
    };
    let provided = req
        .headers()
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            AppError::Unauthorized("missing admin token header `X-Admin-Token`".into())
        })?;

    if provided == expected {
        Ok(next.run(req).await)
    } else {
        Err(AppError::Unauthorized("invalid admin token".into()))
    }
}
