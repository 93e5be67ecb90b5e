//! DTO definitions used by the admin REST API and documentation layer.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::dao::models::{
    AccountEntity, AttemptState, DeliveryAttemptEntity, DeliveryChannel, GameEntity,
    GameInstanceEntity, GameType, InstanceState, SheetState, SheetType, SubscriptionEntity,
    SubscriptionStatus, TurnPhase, TurnSheetEntity,
};

/// Payload registering a player account.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct CreateAccountRequest {
    #[validate(length(min = 1, max = 120))]
    pub name: String,
    #[validate(email)]
    #[serde(default)]
    pub email: Option<String>,
    /// Free-form postal address used by the physical post channel.
    #[validate(length(min = 1, max = 500))]
    #[serde(default)]
    pub postal_address: Option<String>,
}

/// Account as seen by administrators.
#[derive(Debug, Serialize, ToSchema)]
pub struct AccountResponse {
    pub id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub postal_address: Option<String>,
}

impl From<AccountEntity> for AccountResponse {
    fn from(account: AccountEntity) -> Self {
        Self {
            id: account.id,
            name: account.name,
            email: account.email,
            postal_address: account.postal_address,
        }
    }
}

/// Payload defining a new game.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct CreateGameRequest {
    #[validate(length(min = 1, max = 120))]
    pub name: String,
    pub game_type: GameType,
    /// Time players have to return each turn's sheets.
    #[validate(range(min = 1, max = 8760))]
    pub turn_duration_hours: u32,
}

/// Game definition as seen by administrators.
#[derive(Debug, Serialize, ToSchema)]
pub struct GameResponse {
    pub id: Uuid,
    pub name: String,
    pub game_type: GameType,
    pub turn_duration_hours: u32,
}

impl From<GameEntity> for GameResponse {
    fn from(game: GameEntity) -> Self {
        Self {
            id: game.id,
            name: game.name,
            game_type: game.game_type,
            turn_duration_hours: game.turn_duration_hours,
        }
    }
}

/// Payload creating a pending instance of a game.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct CreateInstanceRequest {
    #[validate(range(min = 1, max = 1000))]
    pub required_player_count: u32,
    /// Turns played before the instance completes; unlimited when absent.
    #[validate(range(min = 1))]
    #[serde(default)]
    pub turn_limit: Option<u32>,
}

/// Instance status including its current turn.
#[derive(Debug, Serialize, ToSchema)]
pub struct InstanceResponse {
    pub id: Uuid,
    pub game_id: Uuid,
    pub state: InstanceState,
    pub current_turn_number: u32,
    pub required_player_count: u32,
    pub turn_limit: Option<u32>,
    pub turn_phase: TurnPhase,
    #[serde(with = "time::serde::rfc3339::option")]
    #[schema(value_type = Option<String>, format = DateTime)]
    pub deadline_for_current_turn: Option<OffsetDateTime>,
}

impl From<GameInstanceEntity> for InstanceResponse {
    fn from(instance: GameInstanceEntity) -> Self {
        Self {
            id: instance.id,
            game_id: instance.game_id,
            state: instance.state,
            current_turn_number: instance.current_turn_number,
            required_player_count: instance.required_player_count,
            turn_limit: instance.turn_limit,
            turn_phase: instance.turn_phase,
            deadline_for_current_turn: instance.deadline_for_current_turn,
        }
    }
}

/// Payload subscribing an account to an instance.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct SubscribeRequest {
    pub account_id: Uuid,
    /// Channels every sheet is sent through; the subscription stays pending
    /// while empty.
    #[validate(length(max = 3))]
    #[serde(default)]
    pub delivery_channels: Vec<DeliveryChannel>,
}

/// Subscription as seen by administrators.
#[derive(Debug, Serialize, ToSchema)]
pub struct SubscriptionResponse {
    pub id: Uuid,
    pub game_instance_id: Uuid,
    pub account_id: Uuid,
    pub delivery_channels: Vec<DeliveryChannel>,
    pub status: SubscriptionStatus,
}

impl From<SubscriptionEntity> for SubscriptionResponse {
    fn from(subscription: SubscriptionEntity) -> Self {
        Self {
            id: subscription.id,
            game_instance_id: subscription.game_instance_id,
            account_id: subscription.account_id,
            delivery_channels: subscription.delivery_channels,
            status: subscription.status,
        }
    }
}

/// One try of one channel.
#[derive(Debug, Serialize, ToSchema)]
pub struct DeliveryAttemptSummary {
    pub channel: DeliveryChannel,
    pub attempt_number: u32,
    pub state: AttemptState,
    pub last_error: Option<String>,
}

impl From<DeliveryAttemptEntity> for DeliveryAttemptSummary {
    fn from(attempt: DeliveryAttemptEntity) -> Self {
        Self {
            channel: attempt.channel,
            attempt_number: attempt.attempt_number,
            state: attempt.state,
            last_error: attempt.last_error,
        }
    }
}

/// Sheet of a turn with its delivery history.
#[derive(Debug, Serialize, ToSchema)]
pub struct TurnSheetSummary {
    pub id: Uuid,
    pub account_id: Uuid,
    pub sheet_type: SheetType,
    pub code: String,
    pub state: SheetState,
    pub rendered_digest: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String, format = DateTime)]
    pub deadline: OffsetDateTime,
    pub last_error: Option<String>,
    pub deliveries: Vec<DeliveryAttemptSummary>,
}

impl TurnSheetSummary {
    /// Combine a sheet with its attempts.
    pub fn new(sheet: TurnSheetEntity, attempts: Vec<DeliveryAttemptEntity>) -> Self {
        Self {
            id: sheet.id,
            account_id: sheet.account_id,
            sheet_type: sheet.sheet_type,
            code: sheet.code.to_string(),
            state: sheet.state,
            rendered_digest: sheet.rendered_digest,
            deadline: sheet.deadline,
            last_error: sheet.last_error,
            deliveries: attempts.into_iter().map(Into::into).collect(),
        }
    }
}

/// Generic action acknowledgement used by admin endpoints.
#[derive(Debug, Serialize, ToSchema)]
pub struct ActionResponse {
    pub message: String,
}
