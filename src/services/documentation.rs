use utoipa::OpenApi;

#[derive(OpenApi)]
/// Aggregated OpenAPI specification for the play-by-mail backend.
#[openapi(
    paths(
        crate::routes::health::healthcheck,
        crate::routes::scans::submit_scan,
        crate::routes::scans::get_scan,
        crate::routes::scans::resubmit_scan,
        crate::routes::admin::create_account,
        crate::routes::admin::create_game,
        crate::routes::admin::create_instance,
        crate::routes::admin::get_instance,
        crate::routes::admin::subscribe,
        crate::routes::admin::start_instance,
        crate::routes::admin::cancel_instance,
        crate::routes::admin::list_turn_sheets,
        crate::routes::admin::withdraw_subscription,
        crate::routes::admin::list_rejected_scans,
    ),
    components(
        schemas(
            crate::dto::health::HealthResponse,
            crate::dto::scans::ScanAccepted,
            crate::dto::scans::ScanResponse,
            crate::dto::admin::CreateAccountRequest,
            crate::dto::admin::AccountResponse,
            crate::dto::admin::CreateGameRequest,
            crate::dto::admin::GameResponse,
            crate::dto::admin::CreateInstanceRequest,
            crate::dto::admin::InstanceResponse,
            crate::dto::admin::SubscribeRequest,
            crate::dto::admin::SubscriptionResponse,
            crate::dto::admin::TurnSheetSummary,
            crate::dto::admin::DeliveryAttemptSummary,
            crate::dto::admin::ActionResponse,
            crate::dao::models::GameType,
            crate::dao::models::SheetType,
            crate::dao::models::SheetState,
            crate::dao::models::InstanceState,
            crate::dao::models::TurnPhase,
            crate::dao::models::SubscriptionStatus,
            crate::dao::models::DeliveryChannel,
            crate::dao::models::AttemptState,
            crate::dao::models::ScanState,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "scans", description = "Returned sheet intake"),
        (name = "admin", description = "Game master and operator actions"),
    )
)]
pub struct ApiDoc;
