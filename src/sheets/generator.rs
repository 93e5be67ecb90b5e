//! Deterministic rendering of turn sheets.

use sha2::{Digest, Sha256};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;

use super::{
    layout::{Cardinality, SHEET_TYPE_LABEL, SheetLayout},
    pdf::{PageBuilder, PdfError},
    template::TemplateData,
};
use crate::dao::models::SheetType;

/// MIME type of rendered sheets.
pub const PDF_CONTENT_TYPE: &str = "application/pdf";

/// Error raised while rendering a sheet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerateError {
    /// Required template data is missing or unusable.
    #[error("invalid template: {0}")]
    InvalidTemplate(String),
    /// The renderer failed.
    #[error("render failed: {0}")]
    RenderFailed(String),
}

impl From<PdfError> for GenerateError {
    fn from(err: PdfError) -> Self {
        match err {
            PdfError::PageOverflow { .. } => GenerateError::InvalidTemplate(err.to_string()),
            PdfError::Write(_) | PdfError::Read(_) => GenerateError::RenderFailed(err.to_string()),
        }
    }
}

/// Rendered artifact ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedSheet {
    pub bytes: Vec<u8>,
    /// Lowercase hex SHA-256 of `bytes`.
    pub digest: String,
    pub content_type: &'static str,
}

impl RenderedSheet {
    /// Wrap rendered bytes, computing their digest.
    pub fn new(bytes: Vec<u8>, content_type: &'static str) -> Self {
        Self {
            digest: digest(&bytes),
            bytes,
            content_type,
        }
    }
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Renders turn sheets of one sheet type.
///
/// Implementations must be deterministic: identical template data yields
/// identical bytes, and the printed code must be recoverable by
/// [`super::code::recognise`] from the scanned artifact.
pub trait DocumentGenerator: Send + Sync {
    /// Sheet type this generator renders.
    fn sheet_type(&self) -> SheetType;

    /// Render the sheet.
    fn generate(&self, data: &TemplateData) -> Result<RenderedSheet, GenerateError>;
}

/// Renders sheets as single-page PDFs following a [`SheetLayout`].
#[derive(Debug, Clone)]
pub struct PdfSheetGenerator {
    layout: SheetLayout,
}

impl PdfSheetGenerator {
    /// Generator for the given sheet type.
    pub fn new(sheet_type: SheetType) -> Self {
        Self {
            layout: SheetLayout::of(sheet_type),
        }
    }
}

impl DocumentGenerator for PdfSheetGenerator {
    fn sheet_type(&self) -> SheetType {
        self.layout.sheet_type
    }

    fn generate(&self, data: &TemplateData) -> Result<RenderedSheet, GenerateError> {
        let code = data
            .code
            .as_ref()
            .ok_or_else(|| GenerateError::InvalidTemplate("code is required".into()))?;
        let turn_number = data
            .turn_number
            .ok_or_else(|| GenerateError::InvalidTemplate("turn number is required".into()))?;
        let deadline = data
            .deadline
            .ok_or_else(|| GenerateError::InvalidTemplate("deadline is required".into()))?
            .format(&Rfc3339)
            .map_err(|err| GenerateError::InvalidTemplate(format!("deadline: {err}")))?;

        let mut page = PageBuilder::default();
        for image in &data.background_images {
            page.annotate(format!("background: {image}"));
        }
        page.line(10, format!("Turn Sheet Code: {code}"));
        page.line(18, data.game_name.as_deref().unwrap_or("Play by Mail"));
        page.line(13, format!("{} - Turn {turn_number}", self.layout.title));
        if let Some(name) = &data.account_name {
            page.line(11, format!("Player: {name}"));
        }
        page.line(11, format!("Return by: {deadline}"));
        page.line(9, format!("{SHEET_TYPE_LABEL} {}", self.layout.sheet_type));
        page.blank();

        if let Some(narrative) = &data.narrative {
            for paragraph in narrative.lines() {
                page.line(11, paragraph);
            }
            page.blank();
        }

        for slot in self.layout.slots {
            let mut options = data.options_for(slot.slot).peekable();
            if slot.cardinality == Cardinality::ExactlyOne && options.peek().is_none() {
                return Err(GenerateError::InvalidTemplate(format!(
                    "slot `{}` has no options",
                    slot.slot
                )));
            }
            page.line(12, slot.header);
            for label in options {
                page.line(11, format!("[ ] {label}"));
            }
            page.blank();
        }

        page.line(9, "Mark your choices with an X and return this sheet before the deadline.");
        page.line(10, format!("Code: {code}"));

        Ok(RenderedSheet::new(page.finish()?, PDF_CONTENT_TYPE))
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::error::{Disposition, PipelineError};
    use crate::sheets::{
        code::{SheetCode, recognise},
        pdf::extract_text,
        template::ChoiceOption,
    };

    fn location_template() -> TemplateData {
        TemplateData {
            game_name: Some("The Lost Town".into()),
            turn_number: Some(1),
            account_name: Some("Ann".into()),
            deadline: Some(datetime!(2026-03-01 12:00 UTC)),
            code: Some(SheetCode::parse("A1B2C0-ZZ2000").unwrap()),
            narrative: Some("You stand in the town square.".into()),
            choices: vec![
                ChoiceOption::new("a", "The market"),
                ChoiceOption::new("a", "The dark alley"),
            ],
            ..TemplateData::default()
        }
    }

    #[test]
    fn rendered_code_is_recognised_from_text() {
        let rendered = PdfSheetGenerator::new(SheetType::LocationChoice)
            .generate(&location_template())
            .unwrap();
        let text = extract_text(&rendered.bytes).unwrap().unwrap();
        assert_eq!(recognise(&text), location_template().code);
        assert_eq!(text.matches("A1B2C0-ZZ2000").count(), 2);
    }

    #[test]
    fn identical_templates_share_a_digest() {
        let generator = PdfSheetGenerator::new(SheetType::LocationChoice);
        let first = generator.generate(&location_template()).unwrap();
        let second = generator.generate(&location_template()).unwrap();
        assert_eq!(first.digest, second.digest);
        assert_eq!(first.digest.len(), 64);

        let mut changed = location_template();
        changed.turn_number = Some(2);
        assert_ne!(generator.generate(&changed).unwrap().digest, first.digest);
    }

    #[test]
    fn marked_copy_of_rendered_sheet_extracts_choice() {
        let rendered = PdfSheetGenerator::new(SheetType::LocationChoice)
            .generate(&location_template())
            .unwrap();
        let marked = extract_text(&rendered.bytes)
            .unwrap()
            .unwrap()
            .replace("[ ] The dark alley", "[X] The dark alley");
        let choices = SheetLayout::of(SheetType::LocationChoice)
            .extract(&marked)
            .unwrap();
        assert_eq!(choices["a"], vec!["The dark alley".to_owned()]);
    }

    #[test]
    fn missing_required_fields_are_invalid_templates() {
        let generator = PdfSheetGenerator::new(SheetType::LocationChoice);
        let strips: [fn(&mut TemplateData); 4] = [
            |data| data.code = None,
            |data| data.turn_number = None,
            |data| data.deadline = None,
            |data| data.choices.clear(),
        ];
        for strip in strips {
            let mut data = location_template();
            strip(&mut data);
            assert!(matches!(
                generator.generate(&data),
                Err(GenerateError::InvalidTemplate(_))
            ));
        }
    }

    #[test]
    fn optional_fields_may_be_absent() {
        let data = TemplateData {
            game_name: None,
            account_name: None,
            narrative: None,
            ..location_template()
        };
        assert!(
            PdfSheetGenerator::new(SheetType::LocationChoice)
                .generate(&data)
                .is_ok()
        );
    }

    #[test]
    fn narrative_too_long_for_the_page_fails_the_sheet() {
        let data = TemplateData {
            narrative: Some(
                (1..=60)
                    .map(|index| format!("Paragraph {index} of a very long story."))
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            ..location_template()
        };
        let err = PdfSheetGenerator::new(SheetType::LocationChoice)
            .generate(&data)
            .unwrap_err();
        assert!(matches!(err, GenerateError::InvalidTemplate(_)));
        assert_eq!(
            PipelineError::from(err).disposition(),
            Disposition::FailSheet
        );
    }
}
