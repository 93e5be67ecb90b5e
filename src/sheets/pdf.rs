//! Single-page sheet documents built and read back with `lopdf`.
//!
//! Output is uncompressed and deterministic: objects are added in a fixed
//! order and no info dictionary or document id is written. Text uses the
//! built-in Helvetica font with WinAnsi encoding; characters outside
//! Latin-1 print as `?`.

use lopdf::{
    Dictionary, Document, Object, Stream,
    content::{Content, Operation},
    dictionary,
};
use thiserror::Error;

const PAGE_WIDTH: u32 = 595;
const PAGE_HEIGHT: u32 = 842;
const MARGIN: u32 = 50;
const LEADING: u32 = 4;
const FONT: &str = "F1";

/// Error raised while building or reading a sheet document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PdfError {
    #[error("content does not fit on one page ({lines} lines)")]
    PageOverflow { lines: usize },
    #[error("failed to write document: {0}")]
    Write(String),
    #[error("failed to read document: {0}")]
    Read(String),
}

/// One line of text and its font size in points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextLine {
    pub size: u32,
    pub text: String,
}

/// Accumulates the content of one page.
#[derive(Debug, Default)]
pub struct PageBuilder {
    lines: Vec<TextLine>,
    annotations: Vec<String>,
}

impl PageBuilder {
    /// Append a line of text.
    pub fn line(&mut self, size: u32, text: impl Into<String>) -> &mut Self {
        self.lines.push(TextLine {
            size,
            text: text.into(),
        });
        self
    }

    /// Append an empty line.
    pub fn blank(&mut self) -> &mut Self {
        self.line(8, "")
    }

    /// Attach a note to the page that is not drawn (asset references).
    pub fn annotate(&mut self, note: impl Into<String>) -> &mut Self {
        self.annotations.push(note.into());
        self
    }

    fn operations(&self) -> Result<Vec<Operation>, PdfError> {
        let mut operations = Vec::new();
        let mut y = PAGE_HEIGHT - MARGIN;
        for line in &self.lines {
            let step = line.size + LEADING;
            if y < MARGIN + step {
                return Err(PdfError::PageOverflow {
                    lines: self.lines.len(),
                });
            }
            y -= step;
            if line.text.is_empty() {
                continue;
            }
            operations.extend([
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec![FONT.into(), Object::Integer(line.size.into())]),
                Operation::new(
                    "Td",
                    vec![Object::Integer(MARGIN.into()), Object::Integer(y.into())],
                ),
                Operation::new("Tj", vec![Object::string_literal(latin1(&line.text))]),
                Operation::new("ET", vec![]),
            ]);
        }
        Ok(operations)
    }

    /// Serialise the page into a complete PDF file.
    pub fn finish(&self) -> Result<Vec<u8>, PdfError> {
        let operations = self.operations()?;
        let content = Content { operations }
            .encode()
            .map_err(|err| PdfError::Write(err.to_string()))?;

        let mut doc = Document::with_version("1.4");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
            "Encoding" => "WinAnsiEncoding",
        });
        let content_id = doc.add_object(Stream::new(Dictionary::new(), content));
        let mut page = dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![
                Object::Integer(0),
                Object::Integer(0),
                Object::Integer(PAGE_WIDTH.into()),
                Object::Integer(PAGE_HEIGHT.into()),
            ],
            "Resources" => dictionary! {
                "Font" => dictionary! { FONT => font_id },
            },
            "Contents" => content_id,
        };
        if !self.annotations.is_empty() {
            let notes = self
                .annotations
                .iter()
                .map(|note| Object::string_literal(latin1(note)))
                .collect::<Vec<_>>();
            page.set("Backgrounds", notes);
        }
        let page_id = doc.add_object(page);
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![page_id.into()],
                "Count" => Object::Integer(1),
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut out = Vec::new();
        doc.save_to(&mut out)
            .map_err(|err| PdfError::Write(err.to_string()))?;
        Ok(out)
    }
}

/// Read back the text shown by `Tj` operators, one line per operator, in
/// page order.
///
/// Returns `Ok(None)` when the bytes are not a PDF at all.
pub fn extract_text(bytes: &[u8]) -> Result<Option<String>, PdfError> {
    if !bytes.starts_with(b"%PDF-") {
        return Ok(None);
    }
    let doc = Document::load_mem(bytes).map_err(|err| PdfError::Read(err.to_string()))?;
    let mut lines = Vec::new();
    for page_id in doc.get_pages().into_values() {
        let data = doc
            .get_page_content(page_id)
            .map_err(|err| PdfError::Read(err.to_string()))?;
        let content = Content::decode(&data).map_err(|err| PdfError::Read(err.to_string()))?;
        for operation in content.operations {
            if operation.operator != "Tj" {
                continue;
            }
            if let Some(Object::String(shown, _)) = operation.operands.first() {
                lines.push(shown.iter().copied().map(char::from).collect::<String>());
            }
        }
    }
    Ok(Some(lines.join("\n")))
}

fn latin1(text: &str) -> Vec<u8> {
    text.chars()
        .map(|ch| match u32::from(ch) {
            _ if ch.is_control() => b' ',
            code @ 0..=0xFF => code as u8,
            _ => b'?',
        })
        .collect()
}
