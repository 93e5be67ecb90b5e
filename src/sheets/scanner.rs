//! Scan processors: OCR an inbound image, find its code and extract the
//! marked choices for one sheet type.

use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;
use tracing::debug;

use super::{
    code::{SheetCode, recognise},
    layout::{Choices, SheetLayout},
    ocr::{OcrEngine, OcrError},
};
use crate::dao::models::SheetType;

/// Structured result of reading one returned sheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedSheet {
    pub code: SheetCode,
    pub sheet_type: SheetType,
    pub choices: Choices,
}

/// Why a scanner could not read an image.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanError {
    /// OCR produced nothing usable.
    #[error("OCR failed: {0}")]
    OcrFailed(String),
    /// The OCR backend timed out.
    #[error("OCR timed out")]
    Timeout,
    /// No labelled code was found in the text.
    #[error("no turn sheet code recognised")]
    CodeNotRecognised,
    /// A code was found but its choices could not be read.
    #[error("code {code} found but choices could not be extracted: {reason}")]
    ChoiceExtractionFailed { code: SheetCode, reason: String },
}

impl ScanError {
    /// Stable name recorded on ingest records.
    pub fn kind(&self) -> &'static str {
        match self {
            ScanError::OcrFailed(_) => "ocr_failed",
            ScanError::Timeout => "transport_timeout",
            ScanError::CodeNotRecognised => "code_not_recognised",
            ScanError::ChoiceExtractionFailed { .. } => "choice_extraction_failed",
        }
    }

    /// Whether another sheet type's scanner could still succeed on the same image.
    pub fn depends_on_sheet_type(&self) -> bool {
        matches!(self, ScanError::ChoiceExtractionFailed { .. })
    }
}

impl From<OcrError> for ScanError {
    fn from(err: OcrError) -> Self {
        match err {
            OcrError::Timeout => ScanError::Timeout,
            other => ScanError::OcrFailed(other.to_string()),
        }
    }
}

/// Reads returned sheets of one sheet type.
pub trait DocumentScanner: Send + Sync {
    /// Sheet type this scanner extracts choices for.
    fn sheet_type(&self) -> SheetType;

    /// OCR the image, recover its code and extract the choice slots.
    fn scan(&self, image: Arc<[u8]>) -> BoxFuture<'static, Result<ScannedSheet, ScanError>>;
}

/// Scanner built on an [`OcrEngine`] and the sheet type's [`SheetLayout`].
#[derive(Clone)]
pub struct OcrSheetScanner {
    layout: Arc<SheetLayout>,
    ocr: Arc<dyn OcrEngine>,
}

impl OcrSheetScanner {
    /// Scanner for `sheet_type` reading text through `ocr`.
    pub fn new(sheet_type: SheetType, ocr: Arc<dyn OcrEngine>) -> Self {
        Self {
            layout: Arc::new(SheetLayout::of(sheet_type)),
            ocr,
        }
    }
}

impl DocumentScanner for OcrSheetScanner {
    fn sheet_type(&self) -> SheetType {
        self.layout.sheet_type
    }

    fn scan(&self, image: Arc<[u8]>) -> BoxFuture<'static, Result<ScannedSheet, ScanError>> {
        let scanner = self.clone();
        Box::pin(async move {
            let text = scanner.ocr.read_text(image).await?;
            let code = recognise(&text).ok_or(ScanError::CodeNotRecognised)?;
            let choices = scanner.layout.extract(&text).map_err(|err| {
                ScanError::ChoiceExtractionFailed {
                    code: code.clone(),
                    reason: err.to_string(),
                }
            })?;
            debug!(%code, sheet_type = %scanner.layout.sheet_type, "scanned sheet");
            Ok(ScannedSheet {
                code,
                sheet_type: scanner.layout.sheet_type,
                choices,
            })
        })
    }
}
