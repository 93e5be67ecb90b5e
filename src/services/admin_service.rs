//! Business logic powering the admin REST routes: accounts, games,
//! instances and subscriptions, plus the operator views of turn sheets and
//! rejected scans.

use std::collections::BTreeSet;

use tracing::info;
use uuid::Uuid;

use crate::{
    dao::{
        deliveries, games,
        models::{
            AccountEntity, GameEntity, GameInstanceEntity, InstanceState, SheetType,
            SubscriptionEntity, SubscriptionStatus, TurnPhase,
        },
        rls::RlsScope,
        scans, turn_sheets,
    },
    dto::{
        admin::{
            AccountResponse, ActionResponse, CreateAccountRequest, CreateGameRequest,
            CreateInstanceRequest, GameResponse, InstanceResponse, SubscribeRequest,
            SubscriptionResponse, TurnSheetSummary,
        },
        scans::{ScanAccepted, ScanResponse},
    },
    error::{PipelineError, ServiceError},
    services::{
        intake,
        jobs::{self, Job},
        orchestrator,
    },
    state::SharedState,
};

/// Register a player account.
pub async fn create_account(
    state: &SharedState,
    request: CreateAccountRequest,
) -> Result<AccountResponse, ServiceError> {
    let account = AccountEntity {
        id: Uuid::new_v4(),
        name: request.name,
        email: request.email,
        postal_address: request.postal_address,
        created_at: state.now(),
    };
    let stored = account.clone();
    state
        .db()
        .transaction(move |tx| games::insert_account(tx, &stored))
        .await?;
    info!(account_id = %account.id, "created account");
    Ok(account.into())
}

/// Define a new game.
pub async fn create_game(
    state: &SharedState,
    request: CreateGameRequest,
) -> Result<GameResponse, ServiceError> {
    state
        .registry()
        .rules(request.game_type)
        .map_err(|err| ServiceError::InvalidInput(err.to_string()))?;
    let game = GameEntity {
        id: Uuid::new_v4(),
        name: request.name,
        game_type: request.game_type,
        turn_duration_hours: request.turn_duration_hours,
        created_at: state.now(),
    };
    let stored = game.clone();
    state
        .db()
        .transaction(move |tx| games::insert_game(tx, &stored))
        .await?;
    info!(game_id = %game.id, game_type = %game.game_type, "created game");
    Ok(game.into())
}

/// Create a pending instance of a game.
pub async fn create_instance(
    state: &SharedState,
    game_id: Uuid,
    request: CreateInstanceRequest,
) -> Result<InstanceResponse, ServiceError> {
    let now = state.now();
    let instance = GameInstanceEntity {
        id: Uuid::new_v4(),
        game_id,
        state: InstanceState::Pending,
        current_turn_number: 0,
        required_player_count: request.required_player_count,
        turn_limit: request.turn_limit,
        turn_phase: TurnPhase::Opening,
        deadline_for_current_turn: None,
        game_state: serde_json::Value::Null,
        created_at: now,
        updated_at: now,
    };
    let stored = instance.clone();
    state
        .db()
        .transaction(move |tx| {
            if games::get_game(tx, game_id)?.is_none() {
                return Err(ServiceError::NotFound(format!("game {game_id}")));
            }
            games::insert_instance(tx, &stored)?;
            Ok(())
        })
        .await?;
    info!(instance_id = %instance.id, %game_id, "created instance");
    Ok(instance.into())
}

/// Current status of an instance.
pub async fn get_instance(
    state: &SharedState,
    instance_id: Uuid,
) -> Result<InstanceResponse, ServiceError> {
    state
        .db()
        .read(move |tx| games::get_instance(tx, instance_id))
        .await?
        .map(Into::into)
        .ok_or_else(|| ServiceError::NotFound(format!("instance {instance_id}")))
}

/// Subscribe an account to an instance. The subscription is active once it
/// names at least one channel. An account that withdrew may subscribe again.
pub async fn subscribe(
    state: &SharedState,
    instance_id: Uuid,
    request: SubscribeRequest,
) -> Result<SubscriptionResponse, ServiceError> {
    let now = state.now();
    let channels: BTreeSet<_> = request.delivery_channels.into_iter().collect();
    let stored = SubscriptionEntity {
        id: Uuid::new_v4(),
        game_instance_id: instance_id,
        account_id: request.account_id,
        status: if channels.is_empty() {
            SubscriptionStatus::Pending
        } else {
            SubscriptionStatus::Active
        },
        delivery_channels: channels.into_iter().collect(),
        created_at: now,
        updated_at: now,
    };
    let subscription = state
        .db()
        .transaction(move |tx| {
            let instance = games::get_instance(tx, instance_id)?
                .ok_or_else(|| ServiceError::NotFound(format!("instance {instance_id}")))?;
            if matches!(
                instance.state,
                InstanceState::Completed | InstanceState::Cancelled
            ) {
                return Err(ServiceError::InvalidState(format!(
                    "instance {instance_id} is {}",
                    instance.state
                )));
            }
            if games::get_account(tx, stored.account_id)?.is_none() {
                return Err(ServiceError::NotFound(format!("account {}", stored.account_id)));
            }
            let existing = games::list_subscriptions(tx, instance_id)?
                .into_iter()
                .find(|existing| existing.account_id == stored.account_id);
            match existing {
                Some(existing) if existing.status == SubscriptionStatus::Withdrawn => {
                    games::reactivate_subscription(
                        tx,
                        existing.id,
                        stored.status,
                        &stored.delivery_channels,
                        now,
                    )?;
                    Ok(SubscriptionEntity {
                        id: existing.id,
                        created_at: existing.created_at,
                        ..stored
                    })
                }
                Some(_) => Err(ServiceError::InvalidState(format!(
                    "account {} is already subscribed",
                    stored.account_id
                ))),
                None => {
                    games::insert_subscription(tx, &stored)?;
                    Ok(stored)
                }
            }
        })
        .await?;
    info!(
        subscription_id = %subscription.id,
        %instance_id,
        account_id = %subscription.account_id,
        status = %subscription.status,
        "subscribed account"
    );
    Ok(subscription.into())
}

/// Start a pending instance once enough players are subscribed: initialise
/// the game state and queue the opening of turn 0.
pub async fn start_instance(
    state: &SharedState,
    instance_id: Uuid,
) -> Result<InstanceResponse, ServiceError> {
    let now = state.now();
    let worker_state = state.clone();
    let instance = state
        .db()
        .transaction(move |tx| {
            let (mut instance, game) = orchestrator::load_instance(tx, instance_id)?;
            if instance.state != InstanceState::Pending {
                return Err(ServiceError::InvalidState(format!(
                    "instance {instance_id} is {}",
                    instance.state
                )));
            }
            let active = games::list_subscriptions(tx, instance_id)?
                .iter()
                .filter(|subscription| subscription.status == SubscriptionStatus::Active)
                .count();
            if (active as u64) < u64::from(instance.required_player_count) {
                return Err(ServiceError::InvalidState(format!(
                    "{active} active subscriptions, {} required",
                    instance.required_player_count
                )));
            }
            let rules = worker_state
                .registry()
                .rules(game.game_type)
                .map_err(PipelineError::from)?;

            instance.state = InstanceState::Active;
            instance.current_turn_number = 0;
            instance.turn_phase = TurnPhase::Opening;
            instance.game_state = rules.initial_state();
            instance.updated_at = now;
            if !games::update_instance(tx, &instance, 0, TurnPhase::Opening)? {
                return Err(PipelineError::StaleInstance(instance_id).into());
            }
            let opening = Job::Opening {
                instance_id,
                turn_number: 0,
            };
            jobs::enqueue(tx, &opening, now, now)?;
            Ok(instance)
        })
        .await?;
    state.notify_queue();
    info!(%instance_id, "started instance");
    Ok(instance.into())
}

/// Cancel an instance. Queued jobs of the instance are dropped when claimed.
pub async fn cancel_instance(
    state: &SharedState,
    instance_id: Uuid,
) -> Result<InstanceResponse, ServiceError> {
    let now = state.now();
    let instance = state
        .db()
        .transaction(move |tx| {
            let instance = games::get_instance(tx, instance_id)?
                .ok_or_else(|| ServiceError::NotFound(format!("instance {instance_id}")))?;
            let from = instance.state;
            if matches!(from, InstanceState::Completed | InstanceState::Cancelled) {
                return Err(ServiceError::InvalidState(format!(
                    "instance {instance_id} is already {from}"
                )));
            }
            if !games::set_instance_state(tx, instance_id, from, InstanceState::Cancelled, now)? {
                return Err(ServiceError::InvalidState(format!(
                    "instance {instance_id} changed concurrently"
                )));
            }
            games::get_instance(tx, instance_id)?
                .ok_or_else(|| ServiceError::NotFound(format!("instance {instance_id}")))
        })
        .await?;
    info!(%instance_id, "cancelled instance");
    Ok(instance.into())
}

/// Withdraw a subscription; its open sheets become `abandoned`.
pub async fn withdraw_subscription(
    state: &SharedState,
    subscription_id: Uuid,
) -> Result<ActionResponse, ServiceError> {
    let abandoned = orchestrator::withdraw_subscription(state, subscription_id).await?;
    Ok(ActionResponse {
        message: format!("subscription withdrawn, {abandoned} open sheet(s) abandoned"),
    })
}

/// Sheets of one turn with their delivery attempts.
pub async fn list_turn_sheets(
    state: &SharedState,
    instance_id: Uuid,
    turn_number: u32,
) -> Result<Vec<TurnSheetSummary>, ServiceError> {
    let summaries = state
        .db()
        .read(move |tx| {
            let (_, game) = orchestrator::load_instance(tx, instance_id)?;
            let scope = RlsScope::for_game(game.id);
            let mut summaries = Vec::new();
            for sheet in turn_sheets::list_turn_sheets(tx, &scope, instance_id, turn_number)? {
                let attempts = deliveries::list_attempts(tx, sheet.id)?;
                summaries.push(TurnSheetSummary::new(sheet, attempts));
            }
            Ok::<_, PipelineError>(summaries)
        })
        .await?;
    Ok(summaries)
}

/// Rejected scans awaiting manual reconciliation.
pub async fn list_rejected_scans(state: &SharedState) -> Result<Vec<ScanResponse>, ServiceError> {
    let rejected = state.db().read(|tx| scans::list_rejected(tx)).await?;
    Ok(rejected.into_iter().map(Into::into).collect())
}

/// One ingest record.
pub async fn get_scan(state: &SharedState, scan_id: Uuid) -> Result<ScanResponse, ServiceError> {
    state
        .db()
        .read(move |tx| scans::get_scan(tx, scan_id))
        .await?
        .map(Into::into)
        .ok_or_else(|| ServiceError::NotFound(format!("scan {scan_id}")))
}

/// Put a rejected scan back into the pipeline.
pub async fn resubmit_scan(
    state: &SharedState,
    scan_id: Uuid,
    sheet_type_hint: Option<SheetType>,
) -> Result<ScanAccepted, ServiceError> {
    let submission = intake::resubmit(state, scan_id, sheet_type_hint).await?;
    Ok(ScanAccepted {
        id: scan_id,
        submission,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        config::AppConfig,
        dao::{database::DbHandle, models::{DeliveryChannel, GameType}},
        sheets::{ocr::EmbeddedTextOcr, registry::ProcessorRegistry},
        state::AppState,
        transport::TransportSet,
    };

    fn app() -> SharedState {
        AppState::new(
            DbHandle::open_in_memory().unwrap(),
            ProcessorRegistry::with_defaults(Arc::new(EmbeddedTextOcr)),
            TransportSet::default(),
            AppConfig::default(),
        )
    }

    async fn account(state: &SharedState, name: &str) -> Uuid {
        create_account(
            state,
            CreateAccountRequest {
                name: name.into(),
                email: Some(format!("{}@example.com", name.to_lowercase())),
                postal_address: None,
            },
        )
        .await
        .unwrap()
        .id
    }

    async fn instance(state: &SharedState, players: u32) -> Uuid {
        let game = create_game(
            state,
            CreateGameRequest {
                name: "The Lost Town".into(),
                game_type: GameType::Adventure,
                turn_duration_hours: 72,
            },
        )
        .await
        .unwrap();
        create_instance(
            state,
            game.id,
            CreateInstanceRequest {
                required_player_count: players,
                turn_limit: None,
            },
        )
        .await
        .unwrap()
        .id
    }

    #[tokio::test]
    async fn subscription_without_channels_stays_pending_and_does_not_count() {
        let state = app();
        let instance_id = instance(&state, 1).await;
        let ann = account(&state, "Ann").await;

        let subscription = subscribe(
            &state,
            instance_id,
            SubscribeRequest {
                account_id: ann,
                delivery_channels: Vec::new(),
            },
        )
        .await
        .unwrap();
        assert_eq!(subscription.status, SubscriptionStatus::Pending);

        let err = start_instance(&state, instance_id).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));
    }

    #[tokio::test]
    async fn start_queues_the_opening_of_turn_zero() {
        let state = app();
        let instance_id = instance(&state, 1).await;
        let ann = account(&state, "Ann").await;
        subscribe(
            &state,
            instance_id,
            SubscribeRequest {
                account_id: ann,
                delivery_channels: vec![DeliveryChannel::Email, DeliveryChannel::Email],
            },
        )
        .await
        .unwrap();

        let started = start_instance(&state, instance_id).await.unwrap();
        assert_eq!(started.state, InstanceState::Active);
        assert_eq!(started.current_turn_number, 0);

        let job = state
            .db()
            .read(move |tx| crate::dao::jobs::get_by_key(tx, &jobs::opening_key(instance_id, 0)))
            .await
            .unwrap();
        assert!(job.is_some());

        let err = start_instance(&state, instance_id).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));
    }

    #[tokio::test]
    async fn duplicate_subscription_is_refused() {
        let state = app();
        let instance_id = instance(&state, 1).await;
        let ann = account(&state, "Ann").await;
        let request = || SubscribeRequest {
            account_id: ann,
            delivery_channels: vec![DeliveryChannel::PhysicalPost],
        };
        subscribe(&state, instance_id, request()).await.unwrap();
        let err = subscribe(&state, instance_id, request()).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));
    }

    #[tokio::test]
    async fn withdrawn_account_can_subscribe_again() {
        let state = app();
        let instance_id = instance(&state, 1).await;
        let ann = account(&state, "Ann").await;
        let first = subscribe(
            &state,
            instance_id,
            SubscribeRequest {
                account_id: ann,
                delivery_channels: vec![DeliveryChannel::PhysicalPost],
            },
        )
        .await
        .unwrap();
        withdraw_subscription(&state, first.id).await.unwrap();

        let again = subscribe(
            &state,
            instance_id,
            SubscribeRequest {
                account_id: ann,
                delivery_channels: vec![DeliveryChannel::Email],
            },
        )
        .await
        .unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.status, SubscriptionStatus::Active);
        assert_eq!(again.delivery_channels, vec![DeliveryChannel::Email]);
        start_instance(&state, instance_id).await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_instance_cannot_be_cancelled_again() {
        let state = app();
        let instance_id = instance(&state, 1).await;
        let cancelled = cancel_instance(&state, instance_id).await.unwrap();
        assert_eq!(cancelled.state, InstanceState::Cancelled);
        assert!(cancel_instance(&state, instance_id).await.is_err());
    }
}
