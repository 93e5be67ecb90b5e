use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;
use validator::ValidationErrors;

use crate::{
    dao::{
        models::{SheetState, SheetType},
        storage::StorageError,
        turn_sheets::SheetStoreError,
    },
    games::RulesError,
    sheets::{
        code::{CodeError, SheetCode},
        generator::GenerateError,
        registry::UnsupportedSheet,
        scanner::ScanError,
    },
    state::turn_machine::InvalidTransition,
    transport::TransportError,
};

/// What a worker does with a failed pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Run the job again after a backoff.
    Retry,
    /// Another worker moved the record first; re-read and decide again.
    Reread,
    /// Record the error for an operator; never retried automatically.
    Record,
    /// The affected sheet becomes `failed`; the turn proceeds.
    FailSheet,
    /// Give up on the job and surface the error.
    Fatal,
}

/// Every error kind the turn sheet pipeline can raise.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A code string failed format or checksum validation.
    #[error("bad code: {0}")]
    BadCode(#[from] CodeError),
    /// No code was found in the OCR text.
    #[error("no turn sheet code recognised")]
    CodeNotRecognised,
    /// The OCR engine could not read the image.
    #[error("OCR failed: {0}")]
    OcrFailed(String),
    /// The code was read but the marked choices were unusable.
    #[error("code {code} found but choices could not be extracted: {reason}")]
    ChoiceExtractionFailed { code: SheetCode, reason: String },
    /// A well-formed code that matches no sheet.
    #[error("code {0} is not bound to any sheet")]
    UnknownCode(SheetCode),
    /// The sheet was already scanned or retired.
    #[error("code {code} belongs to a {state} sheet that does not await a scan")]
    NotAwaitingScan { code: SheetCode, state: SheetState },
    /// Template data cannot produce a sheet; the sheet fails.
    #[error("invalid template: {0}")]
    InvalidTemplate(String),
    /// Rendering failed for a reason unrelated to the template.
    #[error("render failed: {0}")]
    RenderFailed(String),
    /// A transport refused or lost the artifact.
    #[error("delivery failed")]
    DeliveryFailed(#[source] TransportError),
    /// A transport or OCR service did not answer in time.
    #[error("external service timed out")]
    TransportTimeout,
    /// A compare-and-swap on the sheet state lost against another writer.
    #[error("sheet {sheet_id} is {actual}, expected {expected}")]
    StaleState {
        sheet_id: Uuid,
        expected: SheetState,
        actual: SheetState,
    },
    /// The requested state change is not an edge of the sheet lifecycle.
    #[error("sheet {sheet_id} cannot move from {from} to {to}")]
    IllegalTransition {
        sheet_id: Uuid,
        from: SheetState,
        to: SheetState,
    },
    /// A compare-and-swap on the instance turn or phase lost.
    #[error("instance {0} changed turn or phase concurrently")]
    StaleInstance(Uuid),
    /// The sheet for this account, turn and type already exists.
    #[error("a {sheet_type} sheet already exists for account {account_id} in turn {turn_number}")]
    DuplicateSheet {
        account_id: Uuid,
        turn_number: u32,
        sheet_type: SheetType,
    },
    /// The minted code collides with an existing sheet.
    #[error("code {0} is already in use")]
    DuplicateCode(SheetCode),
    /// No processor is registered for the game and sheet type.
    #[error(transparent)]
    UnsupportedSheet(#[from] UnsupportedSheet),
    /// The game rules rejected the scanned choices.
    #[error("resolver rejected choices")]
    Rules(#[from] RulesError),
    /// The job ran past its deadline and its writes were rolled back.
    #[error("job deadline exceeded")]
    DeadlineExceeded,
    /// A referenced record does not exist.
    #[error("{0} not found")]
    NotFound(String),
    /// A record outside the caller's row-level scope.
    #[error("record is outside the caller's scope")]
    OutOfScope,
    /// The operation does not apply in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// The record store failed.
    #[error(transparent)]
    Storage(StorageError),
}

impl PipelineError {
    /// Propagation policy of this error.
    pub fn disposition(&self) -> Disposition {
        match self {
            PipelineError::BadCode(_)
            | PipelineError::CodeNotRecognised
            | PipelineError::OcrFailed(_)
            | PipelineError::ChoiceExtractionFailed { .. }
            | PipelineError::UnknownCode(_)
            | PipelineError::NotAwaitingScan { .. } => Disposition::Record,
            PipelineError::InvalidTemplate(_) | PipelineError::Rules(_) => Disposition::FailSheet,
            PipelineError::RenderFailed(_)
            | PipelineError::DeliveryFailed(_)
            | PipelineError::TransportTimeout
            | PipelineError::DeadlineExceeded => Disposition::Retry,
            PipelineError::StaleState { .. }
            | PipelineError::StaleInstance(_)
            | PipelineError::DuplicateSheet { .. }
            | PipelineError::DuplicateCode(_) => Disposition::Reread,
            PipelineError::Storage(StorageError::Corrupt { .. } | StorageError::Payload(_)) => {
                Disposition::Fatal
            }
            PipelineError::Storage(_) => Disposition::Retry,
            PipelineError::UnsupportedSheet(_)
            | PipelineError::IllegalTransition { .. }
            | PipelineError::NotFound(_)
            | PipelineError::OutOfScope
            | PipelineError::InvalidState(_) => Disposition::Fatal,
        }
    }

    /// Stable name recorded on ingest records and job rows.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::BadCode(_) => "bad_code",
            PipelineError::CodeNotRecognised => "code_not_recognised",
            PipelineError::OcrFailed(_) => "ocr_failed",
            PipelineError::ChoiceExtractionFailed { .. } => "choice_extraction_failed",
            PipelineError::UnknownCode(_) => "unknown_code",
            PipelineError::NotAwaitingScan { .. } => "not_awaiting_scan",
            PipelineError::InvalidTemplate(_) => "invalid_template",
            PipelineError::RenderFailed(_) => "render_failed",
            PipelineError::DeliveryFailed(_) => "delivery_failed",
            PipelineError::TransportTimeout => "transport_timeout",
            PipelineError::StaleState { .. } => "stale_state",
            PipelineError::IllegalTransition { .. } => "illegal_transition",
            PipelineError::StaleInstance(_) => "stale_instance",
            PipelineError::DuplicateSheet { .. } => "duplicate_sheet",
            PipelineError::DuplicateCode(_) => "duplicate_code",
            PipelineError::UnsupportedSheet(_) => "unsupported_sheet",
            PipelineError::Rules(_) => "resolver_failed",
            PipelineError::DeadlineExceeded => "deadline_exceeded",
            PipelineError::NotFound(_) => "not_found",
            PipelineError::OutOfScope => "out_of_scope",
            PipelineError::InvalidState(_) => "invalid_state",
            PipelineError::Storage(_) => "storage",
        }
    }
}

impl From<StorageError> for PipelineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::DeadlineExceeded => PipelineError::DeadlineExceeded,
            other => PipelineError::Storage(other),
        }
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        PipelineError::Storage(err.into())
    }
}

impl From<SheetStoreError> for PipelineError {
    fn from(err: SheetStoreError) -> Self {
        match err {
            SheetStoreError::Storage(err) => err.into(),
            SheetStoreError::DuplicateSheet {
                turn_number,
                account_id,
                sheet_type,
                ..
            } => PipelineError::DuplicateSheet {
                account_id,
                turn_number,
                sheet_type,
            },
            SheetStoreError::DuplicateCode(code) => PipelineError::DuplicateCode(code),
            SheetStoreError::StaleState {
                sheet_id,
                expected,
                actual,
            } => PipelineError::StaleState {
                sheet_id,
                expected,
                actual,
            },
            SheetStoreError::IllegalTransition { sheet_id, from, to } => {
                PipelineError::IllegalTransition { sheet_id, from, to }
            }
            SheetStoreError::NotAwaitingScan { code, state } => {
                PipelineError::NotAwaitingScan { code, state }
            }
            SheetStoreError::UnknownCode(code) => PipelineError::UnknownCode(code),
            SheetStoreError::NotFound(id) => PipelineError::NotFound(format!("sheet {id}")),
            SheetStoreError::OutOfScope => PipelineError::OutOfScope,
        }
    }
}

impl From<GenerateError> for PipelineError {
    fn from(err: GenerateError) -> Self {
        match err {
            GenerateError::InvalidTemplate(message) => PipelineError::InvalidTemplate(message),
            GenerateError::RenderFailed(message) => PipelineError::RenderFailed(message),
        }
    }
}

impl From<ScanError> for PipelineError {
    fn from(err: ScanError) -> Self {
        match err {
            ScanError::OcrFailed(message) => PipelineError::OcrFailed(message),
            ScanError::Timeout => PipelineError::TransportTimeout,
            ScanError::CodeNotRecognised => PipelineError::CodeNotRecognised,
            ScanError::ChoiceExtractionFailed { code, reason } => {
                PipelineError::ChoiceExtractionFailed { code, reason }
            }
        }
    }
}

impl From<TransportError> for PipelineError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => PipelineError::TransportTimeout,
            other => PipelineError::DeliveryFailed(other),
        }
    }
}

impl From<InvalidTransition> for PipelineError {
    fn from(err: InvalidTransition) -> Self {
        PipelineError::InvalidState(err.to_string())
    }
}

/// Errors that can occur in service layer operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Storage backend is unavailable.
    #[error("storage unavailable")]
    Unavailable(#[source] StorageError),
    /// Unauthorized access attempt.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Invalid input provided by the client.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Operation cannot be performed in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),
    /// Operation exceeded its timeout limit.
    #[error("operation timed out")]
    Timeout,
    /// Unexpected pipeline failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        ServiceError::Unavailable(err)
    }
}

impl From<PipelineError> for ServiceError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Storage(source) => ServiceError::Unavailable(source),
            PipelineError::NotFound(what) => ServiceError::NotFound(what),
            PipelineError::OutOfScope => ServiceError::NotFound("record".into()),
            PipelineError::BadCode(err) => ServiceError::InvalidInput(err.to_string()),
            PipelineError::UnsupportedSheet(err) => ServiceError::InvalidInput(err.to_string()),
            PipelineError::InvalidState(message) => ServiceError::InvalidState(message),
            err @ (PipelineError::StaleState { .. }
            | PipelineError::StaleInstance(_)
            | PipelineError::IllegalTransition { .. }
            | PipelineError::DuplicateSheet { .. }
            | PipelineError::DuplicateCode(_)) => ServiceError::InvalidState(err.to_string()),
            PipelineError::DeadlineExceeded | PipelineError::TransportTimeout => {
                ServiceError::Timeout
            }
            other => ServiceError::Internal(other.to_string()),
        }
    }
}

impl From<ValidationErrors> for AppError {
    fn from(err: ValidationErrors) -> Self {
        AppError::BadRequest(format!("validation failed: {}", err))
    }
}

/// Application-level errors that are converted to HTTP responses.
#[derive(Debug, Error)]
pub enum AppError {
    /// Bad request with invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Unauthorized access attempt.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Requested resource not found.
    #[error("not found: {0}")]
    NotFound(String),
    /// Conflict with current state.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Service unavailable or degraded.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Unavailable(source) => AppError::ServiceUnavailable(source.to_string()),
            ServiceError::Unauthorized(message) => AppError::Unauthorized(message),
            ServiceError::InvalidInput(message) => AppError::BadRequest(message),
            ServiceError::InvalidState(message) => AppError::Conflict(message),
            ServiceError::NotFound(message) => AppError::NotFound(message),
            ServiceError::Timeout => AppError::ServiceUnavailable("operation timed out".into()),
            ServiceError::Internal(message) => AppError::Internal(message),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let payload = Json(ErrorBody {
            message: self.to_string(),
        });

        (status, payload).into_response()
    }
}
