//! Opaque turn sheet codes.
//!
//! A code is two halves of six uppercase alphanumerics joined by a hyphen;
//! the last character of each half is the character-sum of the first five
//! modulo 36. The code carries no instance, turn or account data: the
//! binding lives in the store.

use std::{fmt, sync::LazyLock};

use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;
use uuid::Uuid;

use crate::dao::models::SheetType;

const ALPHABET: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const HALF_LEN: usize = 6;
/// Length of a canonical code including the separator.
pub const CODE_LEN: usize = HALF_LEN * 2 + 1;
const SEPARATOR: u8 = b'-';

/// Labels printed in front of a code on rendered sheets, as recognised in OCR text.
pub const CODE_LABELS: [&str; 4] = ["Turn Sheet Code:", "Code:", "Turn Code:", "Sheet Code:"];

static CODE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(?i:turn[ \t]+sheet[ \t]+code|turn[ \t]+code|sheet[ \t]+code|code)[ \t]*:[ \t]*([A-Z0-9]{6}-[A-Z0-9]{6})\b",
    )
    .expect("code pattern is valid")
});

/// Why a string is not a valid code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodeError {
    #[error("code must be {CODE_LEN} characters, got {0}")]
    Length(usize),
    #[error("code halves must be separated by `-`")]
    Separator,
    #[error("invalid character `{0}` in code")]
    Charset(char),
    #[error("checksum mismatch in code half {0}")]
    Checksum(usize),
}

/// Validated turn sheet code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SheetCode(String);

impl SheetCode {
    /// Validate character set, length and both checksums.
    pub fn parse(value: &str) -> Result<Self, CodeError> {
        let bytes = value.as_bytes();
        if bytes.len() != CODE_LEN {
            return Err(CodeError::Length(value.chars().count()));
        }
        if bytes[HALF_LEN] != SEPARATOR {
            return Err(CodeError::Separator);
        }
        for (index, half) in [&bytes[..HALF_LEN], &bytes[HALF_LEN + 1..]]
            .into_iter()
            .enumerate()
        {
            if let Some(bad) = half.iter().find(|b| char_value(**b).is_none()) {
                return Err(CodeError::Charset(char::from(*bad)));
            }
            if checksum(&half[..HALF_LEN - 1]) != half[HALF_LEN - 1] {
                return Err(CodeError::Checksum(index + 1));
            }
        }
        Ok(Self(value.to_owned()))
    }

    /// Canonical text form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SheetCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SheetCode {
    type Error = CodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        SheetCode::parse(&value)
    }
}

impl From<SheetCode> for String {
    fn from(value: SheetCode) -> Self {
        value.0
    }
}

/// Issues fresh codes. Uniqueness is enforced by the store's unique index;
/// callers re-mint on collision.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodeMint;

impl CodeMint {
    /// Mint a code for the given sheet coordinates using the thread RNG.
    pub fn mint(
        &self,
        instance_id: Uuid,
        turn_number: u32,
        account_id: Uuid,
        sheet_type: SheetType,
    ) -> SheetCode {
        let code = self.mint_with(&mut rand::rng());
        trace!(%instance_id, turn_number, %account_id, %sheet_type, "minted turn sheet code");
        code
    }

    /// Mint a code from an explicit RNG.
    pub fn mint_with<R: Rng + ?Sized>(&self, rng: &mut R) -> SheetCode {
        let mut out = String::with_capacity(CODE_LEN);
        for half in 0..2 {
            if half == 1 {
                out.push(char::from(SEPARATOR));
            }
            let body: Vec<u8> = (0..HALF_LEN - 1)
                .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())])
                .collect();
            out.extend(body.iter().map(|b| char::from(*b)));
            out.push(char::from(checksum(&body)));
        }
        SheetCode(out)
    }
}

/// Find the first labelled, checksum-valid code in OCR text.
///
/// Labels match case-insensitively; the code body must be uppercase.
pub fn recognise(text: &str) -> Option<SheetCode> {
    CODE_PATTERN
        .captures_iter(text)
        .filter_map(|captures| captures.get(1))
        .find_map(|body| SheetCode::parse(body.as_str()).ok())
}

fn char_value(byte: u8) -> Option<u32> {
    match byte {
        b'0'..=b'9' => Some(u32::from(byte - b'0')),
        b'A'..=b'Z' => Some(u32::from(byte - b'A') + 10),
        _ => None,
    }
}

fn checksum(body: &[u8]) -> u8 {
    let sum: u32 = body.iter().filter_map(|b| char_value(*b)).sum();
    ALPHABET[(sum % 36) as usize]
}
