//! Delivery attempt rows, one per try of one channel for one sheet.

use rusqlite::{OptionalExtension, Row, params};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    database::{Tx, enum_at, time_at, ts, uuid_at},
    models::{AttemptState, DeliveryAttemptEntity, DeliveryChannel},
    storage::StorageResult,
};

const ATTEMPT_COLUMNS: &str =
    "id, turn_sheet_id, channel, attempt_number, state, last_error, created_at, updated_at";

/// Identity of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttemptKey {
    pub turn_sheet_id: Uuid,
    pub channel: DeliveryChannel,
    pub attempt_number: u32,
}

fn attempt_from_row(row: &Row<'_>) -> rusqlite::Result<DeliveryAttemptEntity> {
    Ok(DeliveryAttemptEntity {
        id: uuid_at(row, 0)?,
        turn_sheet_id: uuid_at(row, 1)?,
        channel: enum_at(row, 2)?,
        attempt_number: row.get(3)?,
        state: enum_at(row, 4)?,
        last_error: row.get(5)?,
        created_at: time_at(row, 6)?,
        updated_at: time_at(row, 7)?,
    })
}

/// Record a pending attempt. Returns `false` when the
/// `(sheet, channel, attempt_number)` row already exists.
pub fn insert_attempt(tx: &Tx<'_>, key: AttemptKey, now: OffsetDateTime) -> StorageResult<bool> {
    let inserted = tx.execute(
        &format!(
            "INSERT INTO delivery_attempts ({ATTEMPT_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?6) \
             ON CONFLICT (turn_sheet_id, channel, attempt_number) DO NOTHING"
        ),
        params![
            Uuid::new_v4().to_string(),
            key.turn_sheet_id.to_string(),
            key.channel.as_str(),
            key.attempt_number,
            AttemptState::Pending.as_str(),
            ts(now),
        ],
    )?;
    Ok(inserted == 1)
}

/// Fetch one attempt.
pub fn get_attempt(tx: &Tx<'_>, key: AttemptKey) -> StorageResult<Option<DeliveryAttemptEntity>> {
    Ok(tx
        .query_row(
            &format!(
                "SELECT {ATTEMPT_COLUMNS} FROM delivery_attempts \
                 WHERE turn_sheet_id = ?1 AND channel = ?2 AND attempt_number = ?3"
            ),
            params![key.turn_sheet_id.to_string(), key.channel.as_str(), key.attempt_number],
            attempt_from_row,
        )
        .optional()?)
}

/// Every attempt for a sheet, by channel then attempt number.
pub fn list_attempts(tx: &Tx<'_>, turn_sheet_id: Uuid) -> StorageResult<Vec<DeliveryAttemptEntity>> {
    let mut stmt = tx.prepare(&format!(
        "SELECT {ATTEMPT_COLUMNS} FROM delivery_attempts \
         WHERE turn_sheet_id = ?1 ORDER BY channel, attempt_number"
    ))?;
    let rows = stmt.query_map(params![turn_sheet_id.to_string()], attempt_from_row)?;
    let mut attempts = Vec::new();
    for row in rows {
        attempts.push(row?);
    }
    Ok(attempts)
}

/// Compare-and-swap an attempt's state. Returns whether the row moved.
pub fn set_attempt_state(
    tx: &Tx<'_>,
    key: AttemptKey,
    from: AttemptState,
    to: AttemptState,
    last_error: Option<&str>,
    now: OffsetDateTime,
) -> StorageResult<bool> {
    let updated = tx.execute(
        "UPDATE delivery_attempts SET state = ?1, last_error = COALESCE(?2, last_error), \
         updated_at = ?3 \
         WHERE turn_sheet_id = ?4 AND channel = ?5 AND attempt_number = ?6 AND state = ?7",
        params![
            to.as_str(),
            last_error,
            ts(now),
            key.turn_sheet_id.to_string(),
            key.channel.as_str(),
            key.attempt_number,
            from.as_str(),
        ],
    )?;
    Ok(updated == 1)
}

/// Abandon every pending attempt of a sheet. Returns the number of rows.
pub fn abandon_pending(
    tx: &Tx<'_>,
    turn_sheet_id: Uuid,
    reason: &str,
    now: OffsetDateTime,
) -> StorageResult<usize> {
    Ok(tx.execute(
        "UPDATE delivery_attempts SET state = ?1, last_error = ?2, updated_at = ?3 \
         WHERE turn_sheet_id = ?4 AND state = ?5",
        params![
            AttemptState::Abandoned.as_str(),
            reason,
            ts(now),
            turn_sheet_id.to_string(),
            AttemptState::Pending.as_str(),
        ],
    )?)
}

/// Whether any channel of the sheet has a succeeded attempt.
pub fn any_succeeded(tx: &Tx<'_>, turn_sheet_id: Uuid) -> StorageResult<bool> {
    let count: i64 = tx.query_row(
        "SELECT COUNT(*) FROM delivery_attempts WHERE turn_sheet_id = ?1 AND state = ?2",
        params![turn_sheet_id.to_string(), AttemptState::Succeeded.as_str()],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}
