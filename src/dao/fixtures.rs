//! Seed rows shared by the store tests.

use time::{OffsetDateTime, macros::datetime};
use uuid::Uuid;

use super::{
    database::{DbHandle, Tx},
    games,
    models::{
        AccountEntity, DeliveryChannel, GameEntity, GameInstanceEntity, GameType, InstanceState,
        SheetState, SheetType, SubscriptionEntity, SubscriptionStatus, TurnPhase, TurnSheetEntity,
    },
    storage::StorageError,
};
use crate::sheets::{
    code::{CodeMint, SheetCode},
    template::TemplateData,
};

pub(crate) const NOW: OffsetDateTime = datetime!(2026-05-01 10:00 UTC);

pub(crate) struct Fixture {
    pub game_id: Uuid,
    pub instance_id: Uuid,
    pub account_id: Uuid,
    pub subscription_id: Uuid,
}

/// One game, one active instance and one subscribed account.
pub(crate) fn seed(tx: &Tx<'_>) -> Fixture {
    let game_id = Uuid::new_v4();
    let instance_id = Uuid::new_v4();
    let account_id = Uuid::new_v4();
    let subscription_id = Uuid::new_v4();
    games::insert_account(
        tx,
        &AccountEntity {
            id: account_id,
            name: "Ann".into(),
            email: Some("ann@example.com".into()),
            postal_address: None,
            created_at: NOW,
        },
    )
    .unwrap();
    games::insert_game(
        tx,
        &GameEntity {
            id: game_id,
            name: "The Lost Town".into(),
            game_type: GameType::Adventure,
            turn_duration_hours: 168,
            created_at: NOW,
        },
    )
    .unwrap();
    games::insert_instance(
        tx,
        &GameInstanceEntity {
            id: instance_id,
            game_id,
            state: InstanceState::Active,
            current_turn_number: 0,
            required_player_count: 1,
            turn_limit: None,
            turn_phase: TurnPhase::Opening,
            deadline_for_current_turn: None,
            game_state: serde_json::json!({}),
            created_at: NOW,
            updated_at: NOW,
        },
    )
    .unwrap();
    games::insert_subscription(
        tx,
        &SubscriptionEntity {
            id: subscription_id,
            game_instance_id: instance_id,
            account_id,
            delivery_channels: vec![DeliveryChannel::Email],
            status: SubscriptionStatus::Active,
            created_at: NOW,
            updated_at: NOW,
        },
    )
    .unwrap();
    Fixture {
        game_id,
        instance_id,
        account_id,
        subscription_id,
    }
}

pub(crate) fn sheet(fixture: &Fixture, sheet_type: SheetType, code: SheetCode) -> TurnSheetEntity {
    TurnSheetEntity {
        id: Uuid::new_v4(),
        game_instance_id: fixture.instance_id,
        turn_number: 0,
        account_id: fixture.account_id,
        game_subscription_id: fixture.subscription_id,
        sheet_type,
        code,
        state: SheetState::Draft,
        template_data: TemplateData::default(),
        rendered_digest: None,
        scanned_data: None,
        deadline: NOW + time::Duration::hours(168),
        last_error: None,
        created_at: NOW,
        updated_at: NOW,
    }
}

pub(crate) fn mint() -> SheetCode {
    CodeMint.mint_with(&mut rand::rng())
}

/// Run `f` in a write transaction on a fresh in-memory store.
pub(crate) async fn with_tx<T: Send + 'static>(f: impl FnOnce(&Tx<'_>) -> T + Send + 'static) -> T {
    let db = DbHandle::open_in_memory().unwrap();
    db.transaction(move |tx| Ok::<_, StorageError>(f(tx)))
        .await
        .unwrap()
}
