//! Turn sheet artifacts: code minting, rendering, OCR and choice extraction.

pub mod code;
pub mod generator;
pub mod layout;
pub mod ocr;
pub mod pdf;
pub mod registry;
pub mod scanner;
pub mod template;
