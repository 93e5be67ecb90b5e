//! Ingest records retaining inbound scan images.

use rusqlite::{OptionalExtension, Row, params, types::Type};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    database::{Tx, conversion_error, enum_at, json_at, opt_enum_at, opt_uuid_at, time_at, ts, uuid_at},
    models::{ScanRecordEntity, ScanSource, ScanState, SheetType},
    storage::StorageResult,
};
use crate::sheets::code::SheetCode;

const SCAN_COLUMNS: &str = "id, image, source, sheet_type_hint, submission, state, error_kind, \
     error_message, code, turn_sheet_id, created_at, updated_at";

fn scan_from_row(row: &Row<'_>) -> rusqlite::Result<ScanRecordEntity> {
    let code: Option<String> = row.get(8)?;
    let code = code
        .map(|code| SheetCode::parse(&code).map_err(|err| conversion_error(8, Type::Text, err)))
        .transpose()?;
    Ok(ScanRecordEntity {
        id: uuid_at(row, 0)?,
        image: row.get(1)?,
        source: json_at(row, 2)?,
        sheet_type_hint: opt_enum_at(row, 3)?,
        submission: row.get(4)?,
        state: enum_at(row, 5)?,
        error_kind: row.get(6)?,
        error_message: row.get(7)?,
        code,
        turn_sheet_id: opt_uuid_at(row, 9)?,
        created_at: time_at(row, 10)?,
        updated_at: time_at(row, 11)?,
    })
}

/// Store a new pending scan and return its id.
pub fn insert_scan(
    tx: &Tx<'_>,
    image: &[u8],
    source: &ScanSource,
    sheet_type_hint: Option<SheetType>,
    now: OffsetDateTime,
) -> StorageResult<Uuid> {
    let id = Uuid::new_v4();
    tx.execute(
        &format!(
            "INSERT INTO scan_records ({SCAN_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, 1, ?5, NULL, NULL, NULL, NULL, ?6, ?6)"
        ),
        params![
            id.to_string(),
            image,
            serde_json::to_string(source)?,
            sheet_type_hint.map(SheetType::as_str),
            ScanState::Pending.as_str(),
            ts(now),
        ],
    )?;
    Ok(id)
}

/// Fetch one scan with its image.
pub fn get_scan(tx: &Tx<'_>, id: Uuid) -> StorageResult<Option<ScanRecordEntity>> {
    Ok(tx
        .query_row(
            &format!("SELECT {SCAN_COLUMNS} FROM scan_records WHERE id = ?1"),
            params![id.to_string()],
            scan_from_row,
        )
        .optional()?)
}

/// Record the sheet a pending scan was bound to.
pub fn mark_bound(
    tx: &Tx<'_>,
    id: Uuid,
    code: &SheetCode,
    turn_sheet_id: Uuid,
    now: OffsetDateTime,
) -> StorageResult<bool> {
    let updated = tx.execute(
        "UPDATE scan_records SET state = ?1, code = ?2, turn_sheet_id = ?3, \
         error_kind = NULL, error_message = NULL, updated_at = ?4 \
         WHERE id = ?5 AND state = ?6",
        params![
            ScanState::Bound.as_str(),
            code.as_str(),
            turn_sheet_id.to_string(),
            ts(now),
            id.to_string(),
            ScanState::Pending.as_str(),
        ],
    )?;
    Ok(updated == 1)
}

/// Error recorded against a rejected scan.
#[derive(Debug, Clone, Copy)]
pub struct Rejection<'a> {
    /// Stable error kind, e.g. `code_not_recognised`.
    pub kind: &'a str,
    pub message: &'a str,
    /// Code read from the image, when one was recognised.
    pub code: Option<&'a SheetCode>,
    pub turn_sheet_id: Option<Uuid>,
}

/// Park a pending scan for manual reconciliation.
pub fn mark_rejected(
    tx: &Tx<'_>,
    id: Uuid,
    rejection: Rejection<'_>,
    now: OffsetDateTime,
) -> StorageResult<bool> {
    let updated = tx.execute(
        "UPDATE scan_records SET state = ?1, error_kind = ?2, error_message = ?3, \
         code = ?4, turn_sheet_id = ?5, updated_at = ?6 \
         WHERE id = ?7 AND state = ?8",
        params![
            ScanState::Rejected.as_str(),
            rejection.kind,
            rejection.message,
            rejection.code.map(SheetCode::as_str),
            rejection.turn_sheet_id.map(|id| id.to_string()),
            ts(now),
            id.to_string(),
            ScanState::Pending.as_str(),
        ],
    )?;
    Ok(updated == 1)
}

/// Put a rejected scan back to pending under a new submission number,
/// optionally replacing the sheet type hint. Returns the new submission
/// number, or `None` when the scan is not rejected.
pub fn resubmit(
    tx: &Tx<'_>,
    id: Uuid,
    sheet_type_hint: Option<SheetType>,
    now: OffsetDateTime,
) -> StorageResult<Option<u32>> {
    Ok(tx
        .query_row(
            "UPDATE scan_records SET state = ?1, submission = submission + 1, \
             sheet_type_hint = COALESCE(?2, sheet_type_hint), error_kind = NULL, \
             error_message = NULL, code = NULL, turn_sheet_id = NULL, updated_at = ?3 \
             WHERE id = ?4 AND state = ?5 RETURNING submission",
            params![
                ScanState::Pending.as_str(),
                sheet_type_hint.map(SheetType::as_str),
                ts(now),
                id.to_string(),
                ScanState::Rejected.as_str(),
            ],
            |row| row.get(0),
        )
        .optional()?)
}

/// Rejected scans, oldest first, without their images.
pub fn list_rejected(tx: &Tx<'_>) -> StorageResult<Vec<ScanRecordEntity>> {
    let mut stmt = tx.prepare(&format!(
        "SELECT {} FROM scan_records WHERE state = ?1 ORDER BY created_at, id",
        SCAN_COLUMNS.replacen("image", "X'' AS image", 1)
    ))?;
    let rows = stmt.query_map(params![ScanState::Rejected.as_str()], scan_from_row)?;
    let mut scans = Vec::new();
    for row in rows {
        scans.push(row?);
    }
    Ok(scans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::fixtures::{NOW, mint, with_tx};

    fn source() -> ScanSource {
        ScanSource {
            origin: "station-1".into(),
            file_name: Some("batch-07.pdf".into()),
        }
    }

    #[tokio::test]
    async fn rejected_scan_keeps_its_image_until_resubmitted() {
        with_tx(|tx| {
            let id = insert_scan(tx, b"garbage", &source(), None, NOW).unwrap();
            let code = mint();
            assert!(
                mark_rejected(
                    tx,
                    id,
                    Rejection {
                        kind: "choice_extraction_failed",
                        message: "slot `a` has no marked option",
                        code: Some(&code),
                        turn_sheet_id: None,
                    },
                    NOW,
                )
                .unwrap()
            );

            let stored = get_scan(tx, id).unwrap().unwrap();
            assert_eq!(stored.state, ScanState::Rejected);
            assert_eq!(stored.image, b"garbage");
            assert_eq!(stored.code, Some(code));
            assert_eq!(stored.source, source());

            let listed = list_rejected(tx).unwrap();
            assert_eq!(listed.len(), 1);
            assert!(listed[0].image.is_empty());

            let submission = resubmit(tx, id, Some(SheetType::LocationChoice), NOW).unwrap();
            assert_eq!(submission, Some(2));
            assert_eq!(resubmit(tx, id, None, NOW).unwrap(), None);

            let pending = get_scan(tx, id).unwrap().unwrap();
            assert_eq!(pending.state, ScanState::Pending);
            assert_eq!(pending.sheet_type_hint, Some(SheetType::LocationChoice));
            assert_eq!(pending.error_kind, None);
            assert_eq!(pending.code, None);
        })
        .await;
    }

    #[tokio::test]
    async fn rejection_applies_once() {
        with_tx(|tx| {
            let id = insert_scan(tx, b"image", &source(), None, NOW).unwrap();
            let rejection = Rejection {
                kind: "ocr_failed",
                message: "empty page",
                code: None,
                turn_sheet_id: None,
            };
            assert!(mark_rejected(tx, id, rejection, NOW).unwrap());
            assert!(!mark_rejected(tx, id, rejection, NOW).unwrap());
        })
        .await;
    }
}
