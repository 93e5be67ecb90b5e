//! DTOs of the scan intake endpoints.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;

use crate::dao::models::{ScanRecordEntity, ScanState, SheetType};

/// Query parameters accompanying an uploaded image.
#[derive(Debug, Default, Deserialize, IntoParams, Validate)]
#[into_params(parameter_in = Query)]
pub struct SubmitScanQuery {
    /// Scanner station, mailbox or upload the image came from.
    #[validate(length(max = 200))]
    #[serde(default)]
    pub source: Option<String>,
    /// Original file name.
    #[validate(length(max = 255))]
    #[serde(default)]
    pub file_name: Option<String>,
    /// Sheet type to try first.
    #[serde(default)]
    #[param(value_type = Option<String>)]
    pub sheet_type: Option<SheetType>,
}

/// Query parameters of a resubmission.
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ResubmitScanQuery {
    /// Replacement sheet type hint.
    #[serde(default)]
    #[param(value_type = Option<String>)]
    pub sheet_type: Option<SheetType>,
}

/// Acknowledgement of an accepted image.
#[derive(Debug, Serialize, ToSchema)]
pub struct ScanAccepted {
    /// Ingest record id.
    pub id: Uuid,
    /// Submission counter; 1 for a first upload.
    pub submission: u32,
}

/// Ingest record without its image.
#[derive(Debug, Serialize, ToSchema)]
pub struct ScanResponse {
    /// Ingest record id.
    pub id: Uuid,
    /// Processing state of the latest submission.
    pub state: ScanState,
    /// Submission currently being processed or last processed.
    pub submission: u32,
    /// Scanner station, mailbox or upload the image came from.
    pub origin: String,
    /// Original file name.
    pub file_name: Option<String>,
    /// Sheet type tried first.
    pub sheet_type_hint: Option<SheetType>,
    /// Error kind of a rejected scan (`code_not_recognised`, ...).
    pub error_kind: Option<String>,
    /// Human readable rejection reason.
    pub error_message: Option<String>,
    /// Code read from the image, when one was recognised.
    pub code: Option<String>,
    /// Sheet the scan was bound to.
    pub turn_sheet_id: Option<Uuid>,
    /// Size of the stored image.
    pub image_bytes: usize,
    /// When the image was first uploaded.
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String, format = DateTime)]
    pub received_at: OffsetDateTime,
}

impl From<ScanRecordEntity> for ScanResponse {
    fn from(scan: ScanRecordEntity) -> Self {
        Self {
            id: scan.id,
            state: scan.state,
            submission: scan.submission,
            origin: scan.source.origin,
            file_name: scan.source.file_name,
            sheet_type_hint: scan.sheet_type_hint,
            error_kind: scan.error_kind,
            error_message: scan.error_message,
            code: scan.code.map(|code| code.to_string()),
            turn_sheet_id: scan.turn_sheet_id,
            image_bytes: scan.image.len(),
            received_at: scan.created_at,
        }
    }
}
