//! Turn sheet persistence.
//!
//! Every operation runs inside the caller's transaction and is scoped by the
//! caller's [`RlsScope`]: rows outside the scope are invisible to reads and
//! writes touching them are refused.

use rusqlite::{OptionalExtension, Row, params, types::Type};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    database::{Tx, conversion_error, enum_at, json_at, opt_json_at, time_at, ts, uuid_at},
    models::{ScannedData, SheetState, SheetType, TurnSheetEntity},
    rls::RlsScope,
    storage::StorageError,
};
use crate::{
    sheets::code::SheetCode,
    state::lifecycle::{awaits_scan, can_transition},
};

const SHEET_COLUMNS: &str = "s.id, s.game_instance_id, s.turn_number, s.account_id, \
     s.game_subscription_id, s.sheet_type, s.code, s.state, s.template_data, s.rendered_digest, \
     s.scanned_data, s.deadline, s.last_error, s.created_at, s.updated_at, i.game_id";

const TERMINAL_STATES: &str = "('resolved', 'failed', 'abandoned')";

/// Error raised by the turn sheet store.
#[derive(Debug, Error)]
pub enum SheetStoreError {
    /// The record store failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// A sheet already exists for the composite key.
    #[error("sheet already exists for instance {game_instance_id} turn {turn_number} account {account_id} ({sheet_type})")]
    DuplicateSheet {
        game_instance_id: Uuid,
        turn_number: u32,
        account_id: Uuid,
        sheet_type: SheetType,
    },
    /// The code is already bound to another sheet.
    #[error("code {0} is already in use")]
    DuplicateCode(SheetCode),
    /// The sheet is no longer in the expected state.
    #[error("sheet {sheet_id} is {actual}, expected {expected}")]
    StaleState {
        sheet_id: Uuid,
        expected: SheetState,
        actual: SheetState,
    },
    /// The state change violates forward-only progression.
    #[error("sheet {sheet_id} cannot move from {from} to {to}")]
    IllegalTransition {
        sheet_id: Uuid,
        from: SheetState,
        to: SheetState,
    },
    /// The scan does not fit the sheet's state.
    #[error("code {code} belongs to a {state} sheet that does not await a scan")]
    NotAwaitingScan { code: SheetCode, state: SheetState },
    /// No sheet carries the code.
    #[error("code {0} is not bound to any sheet")]
    UnknownCode(SheetCode),
    /// No visible sheet has the id.
    #[error("sheet {0} not found")]
    NotFound(Uuid),
    /// The write would touch rows outside the caller's scope.
    #[error("sheet is outside the caller's scope")]
    OutOfScope,
}

impl From<rusqlite::Error> for SheetStoreError {
    fn from(err: rusqlite::Error) -> Self {
        SheetStoreError::Storage(err.into())
    }
}

type SheetResult<T> = Result<T, SheetStoreError>;

/// Optional column updates applied together with a state transition.
#[derive(Debug, Clone, Default)]
pub struct SheetPatch {
    pub rendered_digest: Option<String>,
    pub scanned_data: Option<ScannedData>,
    pub last_error: Option<String>,
}

/// Identifiers a code resolves to; enough to derive an RLS scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SheetBinding {
    pub turn_sheet_id: Uuid,
    pub game_instance_id: Uuid,
    pub game_id: Uuid,
    pub turn_number: u32,
    pub account_id: Uuid,
    pub game_subscription_id: Uuid,
}

struct ScopedSheet {
    sheet: TurnSheetEntity,
    game_id: Uuid,
}

impl ScopedSheet {
    fn visible_to(&self, scope: &RlsScope) -> bool {
        scope.permits(
            self.game_id,
            self.sheet.account_id,
            self.sheet.game_subscription_id,
        )
    }
}

fn sheet_from_row(row: &Row<'_>) -> rusqlite::Result<ScopedSheet> {
    let code: String = row.get(6)?;
    let code = SheetCode::parse(&code).map_err(|err| conversion_error(6, Type::Text, err))?;
    Ok(ScopedSheet {
        sheet: TurnSheetEntity {
            id: uuid_at(row, 0)?,
            game_instance_id: uuid_at(row, 1)?,
            turn_number: row.get(2)?,
            account_id: uuid_at(row, 3)?,
            game_subscription_id: uuid_at(row, 4)?,
            sheet_type: enum_at(row, 5)?,
            code,
            state: enum_at(row, 7)?,
            template_data: json_at(row, 8)?,
            rendered_digest: row.get(9)?,
            scanned_data: opt_json_at(row, 10)?,
            deadline: time_at(row, 11)?,
            last_error: row.get(12)?,
            created_at: time_at(row, 13)?,
            updated_at: time_at(row, 14)?,
        },
        game_id: uuid_at(row, 15)?,
    })
}

fn select(filter: &str) -> String {
    format!(
        "SELECT {SHEET_COLUMNS} FROM turn_sheets s \
         JOIN game_instances i ON i.id = s.game_instance_id WHERE {filter}"
    )
}

fn load(tx: &Tx<'_>, scope: &RlsScope, sheet_id: Uuid) -> SheetResult<ScopedSheet> {
    let scoped = tx
        .query_row(&select("s.id = ?1"), params![sheet_id.to_string()], sheet_from_row)
        .optional()?
        .filter(|scoped| scoped.visible_to(scope))
        .ok_or(SheetStoreError::NotFound(sheet_id))?;
    Ok(scoped)
}

/// Insert a new sheet.
pub fn insert_sheet(tx: &Tx<'_>, scope: &RlsScope, record: &TurnSheetEntity) -> SheetResult<()> {
    let game_id: Option<String> = tx
        .query_row(
            "SELECT game_id FROM game_instances WHERE id = ?1",
            params![record.game_instance_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    let game_id = game_id
        .and_then(|id| Uuid::parse_str(&id).ok())
        .ok_or(SheetStoreError::OutOfScope)?;
    if !scope.permits(game_id, record.account_id, record.game_subscription_id) {
        return Err(SheetStoreError::OutOfScope);
    }

    let inserted = tx.execute(
        "INSERT INTO turn_sheets (id, game_instance_id, turn_number, account_id, \
         game_subscription_id, sheet_type, code, state, template_data, rendered_digest, \
         scanned_data, deadline, last_error, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            record.id.to_string(),
            record.game_instance_id.to_string(),
            record.turn_number,
            record.account_id.to_string(),
            record.game_subscription_id.to_string(),
            record.sheet_type.as_str(),
            record.code.as_str(),
            record.state.as_str(),
            serde_json::to_string(&record.template_data).map_err(StorageError::from)?,
            record.rendered_digest,
            record
                .scanned_data
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(StorageError::from)?,
            ts(record.deadline),
            record.last_error,
            ts(record.created_at),
            ts(record.updated_at),
        ],
    );

    let Err(err) = inserted.map_err(StorageError::from) else {
        return Ok(());
    };
    let constraint = err.unique_violation().map(str::to_owned);
    match constraint.as_deref() {
        Some(constraint) if constraint.contains("turn_sheets.code") => {
            Err(SheetStoreError::DuplicateCode(record.code.clone()))
        }
        Some(constraint) if constraint.starts_with("turn_sheets.") => {
            Err(SheetStoreError::DuplicateSheet {
                game_instance_id: record.game_instance_id,
                turn_number: record.turn_number,
                account_id: record.account_id,
                sheet_type: record.sheet_type,
            })
        }
        _ => Err(err.into()),
    }
}

/// Fetch one sheet.
pub fn get_sheet(tx: &Tx<'_>, scope: &RlsScope, sheet_id: Uuid) -> SheetResult<TurnSheetEntity> {
    load(tx, scope, sheet_id).map(|scoped| scoped.sheet)
}

/// Compare-and-swap the sheet state from `from` to `to`, applying `patch`.
///
/// `scanned_data` may only be written by the move to `scanned`, which
/// requires it.
pub fn transition(
    tx: &Tx<'_>,
    scope: &RlsScope,
    sheet_id: Uuid,
    from: SheetState,
    to: SheetState,
    patch: SheetPatch,
    now: OffsetDateTime,
) -> SheetResult<TurnSheetEntity> {
    let scan_write_mismatch = (to == SheetState::Scanned) != patch.scanned_data.is_some();
    if !can_transition(from, to) || scan_write_mismatch {
        return Err(SheetStoreError::IllegalTransition { sheet_id, from, to });
    }

    let current = load(tx, scope, sheet_id)?;
    if current.sheet.state != from {
        return Err(SheetStoreError::StaleState {
            sheet_id,
            expected: from,
            actual: current.sheet.state,
        });
    }

    let scanned_data = patch
        .scanned_data
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(StorageError::from)?;
    let updated = tx.execute(
        "UPDATE turn_sheets SET state = ?1, \
         rendered_digest = COALESCE(?2, rendered_digest), \
         scanned_data = COALESCE(?3, scanned_data), \
         last_error = COALESCE(?4, last_error), \
         updated_at = ?5 \
         WHERE id = ?6 AND state = ?7",
        params![
            to.as_str(),
            patch.rendered_digest,
            scanned_data,
            patch.last_error,
            ts(now),
            sheet_id.to_string(),
            from.as_str(),
        ],
    )?;
    if updated == 0 {
        let actual = load(tx, scope, sheet_id)?.sheet.state;
        return Err(SheetStoreError::StaleState {
            sheet_id,
            expected: from,
            actual,
        });
    }

    get_sheet(tx, scope, sheet_id)
}

/// Resolve `code` to its sheet, check it awaits a scan, store the scanned
/// choices and move it to `scanned`.
pub fn bind_scan(
    tx: &Tx<'_>,
    scope: &RlsScope,
    code: &SheetCode,
    scanned_data: ScannedData,
    now: OffsetDateTime,
) -> SheetResult<TurnSheetEntity> {
    let scoped = tx
        .query_row(&select("s.code = ?1"), params![code.as_str()], sheet_from_row)
        .optional()?
        .filter(|scoped| scoped.visible_to(scope))
        .ok_or_else(|| SheetStoreError::UnknownCode(code.clone()))?;
    let state = scoped.sheet.state;
    if !awaits_scan(state) {
        return Err(SheetStoreError::NotAwaitingScan {
            code: code.clone(),
            state,
        });
    }
    transition(
        tx,
        scope,
        scoped.sheet.id,
        state,
        SheetState::Scanned,
        SheetPatch {
            scanned_data: Some(scanned_data),
            ..SheetPatch::default()
        },
        now,
    )
}

/// Identifiers bound to `code`, used by pipeline workers to derive their
/// scope before touching the sheet.
pub fn find_binding(tx: &Tx<'_>, code: &SheetCode) -> SheetResult<Option<SheetBinding>> {
    let binding = tx
        .query_row(
            "SELECT s.id, s.game_instance_id, i.game_id, s.turn_number, s.account_id, \
             s.game_subscription_id FROM turn_sheets s \
             JOIN game_instances i ON i.id = s.game_instance_id WHERE s.code = ?1",
            params![code.as_str()],
            |row| {
                Ok(SheetBinding {
                    turn_sheet_id: uuid_at(row, 0)?,
                    game_instance_id: uuid_at(row, 1)?,
                    game_id: uuid_at(row, 2)?,
                    turn_number: row.get(3)?,
                    account_id: uuid_at(row, 4)?,
                    game_subscription_id: uuid_at(row, 5)?,
                })
            },
        )
        .optional()?;
    Ok(binding)
}

/// Sheets of the turn not yet in a terminal state.
pub fn list_open_sheets(
    tx: &Tx<'_>,
    scope: &RlsScope,
    instance_id: Uuid,
    turn_number: u32,
) -> SheetResult<Vec<TurnSheetEntity>> {
    query_turn(
        tx,
        scope,
        &format!("s.game_instance_id = ?1 AND s.turn_number = ?2 AND s.state NOT IN {TERMINAL_STATES}"),
        instance_id,
        turn_number,
    )
}

/// Every sheet of the turn.
pub fn list_turn_sheets(
    tx: &Tx<'_>,
    scope: &RlsScope,
    instance_id: Uuid,
    turn_number: u32,
) -> SheetResult<Vec<TurnSheetEntity>> {
    query_turn(
        tx,
        scope,
        "s.game_instance_id = ?1 AND s.turn_number = ?2",
        instance_id,
        turn_number,
    )
}

fn query_turn(
    tx: &Tx<'_>,
    scope: &RlsScope,
    filter: &str,
    instance_id: Uuid,
    turn_number: u32,
) -> SheetResult<Vec<TurnSheetEntity>> {
    let mut stmt = tx.prepare(&format!("{} ORDER BY s.created_at, s.id", select(filter)))?;
    let rows = stmt.query_map(params![instance_id.to_string(), turn_number], sheet_from_row)?;
    let mut sheets = Vec::new();
    for row in rows {
        let scoped = row?;
        if scoped.visible_to(scope) {
            sheets.push(scoped.sheet);
        }
    }
    Ok(sheets)
}
