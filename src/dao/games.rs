//! Accounts, game definitions, instances and subscriptions.

use rusqlite::{OptionalExtension, Row, params};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    database::{Tx, enum_at, json_at, opt_time_at, time_at, ts, uuid_at},
    models::{
        AccountEntity, DeliveryChannel, GameEntity, GameInstanceEntity, InstanceState,
        SubscriptionEntity, SubscriptionStatus, TurnPhase,
    },
    storage::StorageResult,
};

const INSTANCE_COLUMNS: &str = "id, game_id, state, current_turn_number, required_player_count, \
     turn_limit, turn_phase, deadline_for_current_turn, game_state, created_at, updated_at";

const SUBSCRIPTION_COLUMNS: &str =
    "id, game_instance_id, account_id, delivery_channels, status, created_at, updated_at";

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<AccountEntity> {
    Ok(AccountEntity {
        id: uuid_at(row, 0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        postal_address: row.get(3)?,
        created_at: time_at(row, 4)?,
    })
}

fn game_from_row(row: &Row<'_>) -> rusqlite::Result<GameEntity> {
    Ok(GameEntity {
        id: uuid_at(row, 0)?,
        name: row.get(1)?,
        game_type: enum_at(row, 2)?,
        turn_duration_hours: row.get(3)?,
        created_at: time_at(row, 4)?,
    })
}

fn instance_from_row(row: &Row<'_>) -> rusqlite::Result<GameInstanceEntity> {
    Ok(GameInstanceEntity {
        id: uuid_at(row, 0)?,
        game_id: uuid_at(row, 1)?,
        state: enum_at(row, 2)?,
        current_turn_number: row.get(3)?,
        required_player_count: row.get(4)?,
        turn_limit: row.get(5)?,
        turn_phase: enum_at(row, 6)?,
        deadline_for_current_turn: opt_time_at(row, 7)?,
        game_state: json_at(row, 8)?,
        created_at: time_at(row, 9)?,
        updated_at: time_at(row, 10)?,
    })
}

fn subscription_from_row(row: &Row<'_>) -> rusqlite::Result<SubscriptionEntity> {
    Ok(SubscriptionEntity {
        id: uuid_at(row, 0)?,
        game_instance_id: uuid_at(row, 1)?,
        account_id: uuid_at(row, 2)?,
        delivery_channels: json_at(row, 3)?,
        status: enum_at(row, 4)?,
        created_at: time_at(row, 5)?,
        updated_at: time_at(row, 6)?,
    })
}

/// Insert an account.
pub fn insert_account(tx: &Tx<'_>, account: &AccountEntity) -> StorageResult<()> {
    tx.execute(
        "INSERT INTO accounts (id, name, email, postal_address, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            account.id.to_string(),
            account.name,
            account.email,
            account.postal_address,
            ts(account.created_at),
        ],
    )?;
    Ok(())
}

/// Fetch an account.
pub fn get_account(tx: &Tx<'_>, id: Uuid) -> StorageResult<Option<AccountEntity>> {
    Ok(tx
        .query_row(
            "SELECT id, name, email, postal_address, created_at FROM accounts WHERE id = ?1",
            params![id.to_string()],
            account_from_row,
        )
        .optional()?)
}

/// Insert a game definition.
pub fn insert_game(tx: &Tx<'_>, game: &GameEntity) -> StorageResult<()> {
    tx.execute(
        "INSERT INTO games (id, name, game_type, turn_duration_hours, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            game.id.to_string(),
            game.name,
            game.game_type.as_str(),
            game.turn_duration_hours,
            ts(game.created_at),
        ],
    )?;
    Ok(())
}

/// Fetch a game definition.
pub fn get_game(tx: &Tx<'_>, id: Uuid) -> StorageResult<Option<GameEntity>> {
    Ok(tx
        .query_row(
            "SELECT id, name, game_type, turn_duration_hours, created_at FROM games WHERE id = ?1",
            params![id.to_string()],
            game_from_row,
        )
        .optional()?)
}

/// Insert a game instance.
pub fn insert_instance(tx: &Tx<'_>, instance: &GameInstanceEntity) -> StorageResult<()> {
    tx.execute(
        &format!(
            "INSERT INTO game_instances ({INSTANCE_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
        ),
        params![
            instance.id.to_string(),
            instance.game_id.to_string(),
            instance.state.as_str(),
            instance.current_turn_number,
            instance.required_player_count,
            instance.turn_limit,
            instance.turn_phase.as_str(),
            instance.deadline_for_current_turn.map(ts),
            serde_json::to_string(&instance.game_state)?,
            ts(instance.created_at),
            ts(instance.updated_at),
        ],
    )?;
    Ok(())
}

/// Fetch a game instance.
pub fn get_instance(tx: &Tx<'_>, id: Uuid) -> StorageResult<Option<GameInstanceEntity>> {
    Ok(tx
        .query_row(
            &format!("SELECT {INSTANCE_COLUMNS} FROM game_instances WHERE id = ?1"),
            params![id.to_string()],
            instance_from_row,
        )
        .optional()?)
}

/// Persist the mutable fields of `instance` if its turn and phase are still
/// `(expected_turn, expected_phase)`. Returns whether the row was updated.
pub fn update_instance(
    tx: &Tx<'_>,
    instance: &GameInstanceEntity,
    expected_turn: u32,
    expected_phase: TurnPhase,
) -> StorageResult<bool> {
    let updated = tx.execute(
        "UPDATE game_instances SET state = ?1, current_turn_number = ?2, turn_phase = ?3, \
         deadline_for_current_turn = ?4, game_state = ?5, updated_at = ?6 \
         WHERE id = ?7 AND current_turn_number = ?8 AND turn_phase = ?9",
        params![
            instance.state.as_str(),
            instance.current_turn_number,
            instance.turn_phase.as_str(),
            instance.deadline_for_current_turn.map(ts),
            serde_json::to_string(&instance.game_state)?,
            ts(instance.updated_at),
            instance.id.to_string(),
            expected_turn,
            expected_phase.as_str(),
        ],
    )?;
    Ok(updated == 1)
}

/// Move an instance from `from` to `to`. Returns whether the row was updated.
pub fn set_instance_state(
    tx: &Tx<'_>,
    id: Uuid,
    from: InstanceState,
    to: InstanceState,
    now: OffsetDateTime,
) -> StorageResult<bool> {
    let updated = tx.execute(
        "UPDATE game_instances SET state = ?1, updated_at = ?2 WHERE id = ?3 AND state = ?4",
        params![to.as_str(), ts(now), id.to_string(), from.as_str()],
    )?;
    Ok(updated == 1)
}

/// Insert a subscription.
pub fn insert_subscription(tx: &Tx<'_>, subscription: &SubscriptionEntity) -> StorageResult<()> {
    tx.execute(
        &format!("INSERT INTO game_subscriptions ({SUBSCRIPTION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
        params![
            subscription.id.to_string(),
            subscription.game_instance_id.to_string(),
            subscription.account_id.to_string(),
            serde_json::to_string(&subscription.delivery_channels)?,
            subscription.status.as_str(),
            ts(subscription.created_at),
            ts(subscription.updated_at),
        ],
    )?;
    Ok(())
}

/// Fetch a subscription.
pub fn get_subscription(tx: &Tx<'_>, id: Uuid) -> StorageResult<Option<SubscriptionEntity>> {
    Ok(tx
        .query_row(
            &format!("SELECT {SUBSCRIPTION_COLUMNS} FROM game_subscriptions WHERE id = ?1"),
            params![id.to_string()],
            subscription_from_row,
        )
        .optional()?)
}

/// Subscriptions of an instance, oldest first.
pub fn list_subscriptions(tx: &Tx<'_>, instance_id: Uuid) -> StorageResult<Vec<SubscriptionEntity>> {
    let mut stmt = tx.prepare(&format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM game_subscriptions \
         WHERE game_instance_id = ?1 ORDER BY created_at, id"
    ))?;
    let rows = stmt.query_map(params![instance_id.to_string()], subscription_from_row)?;
    let mut subscriptions = Vec::new();
    for row in rows {
        subscriptions.push(row?);
    }
    Ok(subscriptions)
}

/// Change a subscription's status. Returns whether the row was updated.
pub fn set_subscription_status(
    tx: &Tx<'_>,
    id: Uuid,
    status: SubscriptionStatus,
    now: OffsetDateTime,
) -> StorageResult<bool> {
    let updated = tx.execute(
        "UPDATE game_subscriptions SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![status.as_str(), ts(now), id.to_string()],
    )?;
    Ok(updated == 1)
}

/// Bring a withdrawn subscription back with new channels and status,
/// keeping its id so that earlier sheets still point at it. Returns whether
/// a withdrawn row was found.
pub fn reactivate_subscription(
    tx: &Tx<'_>,
    id: Uuid,
    status: SubscriptionStatus,
    delivery_channels: &[DeliveryChannel],
    now: OffsetDateTime,
) -> StorageResult<bool> {
    let updated = tx.execute(
        "UPDATE game_subscriptions SET status = ?1, delivery_channels = ?2, updated_at = ?3 \
         WHERE id = ?4 AND status = ?5",
        params![
            status.as_str(),
            serde_json::to_string(delivery_channels)?,
            ts(now),
            id.to_string(),
            SubscriptionStatus::Withdrawn.as_str(),
        ],
    )?;
    Ok(updated == 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::{
        database::DbHandle,
        fixtures::NOW,
        models::{DeliveryChannel, GameType},
        storage::StorageError,
    };

    fn instance(game_id: Uuid) -> GameInstanceEntity {
        GameInstanceEntity {
            id: Uuid::new_v4(),
            game_id,
            state: InstanceState::Pending,
            current_turn_number: 0,
            required_player_count: 2,
            turn_limit: Some(5),
            turn_phase: TurnPhase::Opening,
            deadline_for_current_turn: None,
            game_state: serde_json::json!({ "players": {} }),
            created_at: NOW,
            updated_at: NOW,
        }
    }

    #[tokio::test]
    async fn instance_update_is_guarded_by_turn_and_phase() {
        let db = DbHandle::open_in_memory().unwrap();
        db.transaction(|tx| {
            let game = GameEntity {
                id: Uuid::new_v4(),
                name: "The Lost Town".into(),
                game_type: GameType::Adventure,
                turn_duration_hours: 168,
                created_at: NOW,
            };
            insert_game(tx, &game)?;
            let mut record = instance(game.id);
            insert_instance(tx, &record)?;
            assert_eq!(get_instance(tx, record.id)?.as_ref(), Some(&record));

            record.turn_phase = TurnPhase::Emitting;
            record.deadline_for_current_turn = Some(NOW + time::Duration::hours(168));
            assert!(update_instance(tx, &record, 0, TurnPhase::Opening)?);
            assert!(!update_instance(tx, &record, 0, TurnPhase::Opening)?);

            let stored = get_instance(tx, record.id)?.unwrap();
            assert_eq!(stored.turn_phase, TurnPhase::Emitting);
            assert_eq!(stored.deadline_for_current_turn, record.deadline_for_current_turn);

            assert!(set_instance_state(tx, record.id, InstanceState::Pending, InstanceState::Active, NOW)?);
            assert!(!set_instance_state(tx, record.id, InstanceState::Pending, InstanceState::Active, NOW)?);
            Ok::<_, StorageError>(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn subscriptions_round_trip_channels() {
        let db = DbHandle::open_in_memory().unwrap();
        db.transaction(|tx| {
            let game = GameEntity {
                id: Uuid::new_v4(),
                name: "g".into(),
                game_type: GameType::Adventure,
                turn_duration_hours: 24,
                created_at: NOW,
            };
            insert_game(tx, &game)?;
            let record = instance(game.id);
            insert_instance(tx, &record)?;
            let account = AccountEntity {
                id: Uuid::new_v4(),
                name: "Ann".into(),
                email: None,
                postal_address: Some("1 Main St".into()),
                created_at: NOW,
            };
            insert_account(tx, &account)?;
            assert_eq!(get_account(tx, account.id)?, Some(account.clone()));

            let subscription = SubscriptionEntity {
                id: Uuid::new_v4(),
                game_instance_id: record.id,
                account_id: account.id,
                delivery_channels: vec![DeliveryChannel::Email, DeliveryChannel::PhysicalPost],
                status: SubscriptionStatus::Active,
                created_at: NOW,
                updated_at: NOW,
            };
            insert_subscription(tx, &subscription)?;
            assert_eq!(list_subscriptions(tx, record.id)?, vec![subscription.clone()]);

            assert!(!reactivate_subscription(
                tx,
                subscription.id,
                SubscriptionStatus::Active,
                &[DeliveryChannel::Email],
                NOW
            )?);
            set_subscription_status(tx, subscription.id, SubscriptionStatus::Withdrawn, NOW)?;
            assert_eq!(
                get_subscription(tx, subscription.id)?.unwrap().status,
                SubscriptionStatus::Withdrawn
            );

            assert!(reactivate_subscription(
                tx,
                subscription.id,
                SubscriptionStatus::Active,
                &[DeliveryChannel::Email],
                NOW
            )?);
            let back = get_subscription(tx, subscription.id)?.unwrap();
            assert_eq!(back.status, SubscriptionStatus::Active);
            assert_eq!(back.delivery_channels, vec![DeliveryChannel::Email]);
            Ok::<_, StorageError>(())
        })
        .await
        .unwrap();
    }
}
