//! Printed layout of each sheet type and the grammar used to read choices
//! back from OCR text.
//!
//! A sheet prints one section per choice slot: the section header on its own
//! line followed by one option per line as `[ ] label`. A player marks an
//! option by filling the box (`[X] label`). Marked options belong to the slot
//! of the closest preceding header.

use std::{collections::BTreeMap, sync::LazyLock};

use regex::Regex;
use thiserror::Error;

use crate::dao::models::SheetType;

/// Extracted values per choice slot.
pub type Choices = BTreeMap<String, Vec<String>>;

/// Label preceding the sheet type marker printed on every sheet.
pub const SHEET_TYPE_LABEL: &str = "Sheet Type:";

static MARKED_OPTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[\s*[xX*✓✔]\s*\]\s*(\S.*?)\s*$").expect("marked option pattern is valid")
});

static SHEET_TYPE_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)sheet[ \t]+type[ \t]*:[ \t]*([a-z_]+)").expect("sheet type pattern is valid")
});

/// How many options a slot accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    ExactlyOne,
    Any,
}

/// One choice slot on a sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLayout {
    pub slot: &'static str,
    pub header: &'static str,
    pub cardinality: Cardinality,
}

/// Static description of a sheet type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetLayout {
    pub sheet_type: SheetType,
    pub title: &'static str,
    pub slots: &'static [SlotLayout],
}

const LOCATION_SLOTS: &[SlotLayout] = &[SlotLayout {
    slot: "a",
    header: "Where will you go next? Mark one box.",
    cardinality: Cardinality::ExactlyOne,
}];

const INVENTORY_SLOTS: &[SlotLayout] = &[
    SlotLayout {
        slot: "pick_up",
        header: "Pick up:",
        cardinality: Cardinality::Any,
    },
    SlotLayout {
        slot: "drop",
        header: "Drop:",
        cardinality: Cardinality::Any,
    },
];

/// Why choices could not be read from a sheet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionError {
    #[error("no option marked for slot `{0}`")]
    Empty(String),
    #[error("{count} options marked for single-choice slot `{slot}`")]
    Ambiguous { slot: String, count: usize },
    #[error("no option marked on the sheet")]
    NothingMarked,
    #[error("text belongs to a `{0}` sheet")]
    WrongSheet(String),
}

impl SheetLayout {
    /// Layout of a sheet type.
    pub fn of(sheet_type: SheetType) -> Self {
        match sheet_type {
            SheetType::LocationChoice => Self {
                sheet_type,
                title: "Location Choice",
                slots: LOCATION_SLOTS,
            },
            SheetType::InventoryManagement => Self {
                sheet_type,
                title: "Inventory",
                slots: INVENTORY_SLOTS,
            },
        }
    }

    /// Find a slot by name.
    pub fn slot(&self, name: &str) -> Option<&SlotLayout> {
        self.slots.iter().find(|slot| slot.slot == name)
    }

    /// Read the marked options of every slot out of OCR text.
    pub fn extract(&self, text: &str) -> Result<Choices, ExtractionError> {
        if let Some(found) = declared_sheet_type(text)
            && found != self.sheet_type.as_str()
        {
            return Err(ExtractionError::WrongSheet(found));
        }

        let mut choices: Choices = self
            .slots
            .iter()
            .map(|slot| (slot.slot.to_owned(), Vec::new()))
            .collect();
        let mut current: Option<&SlotLayout> = None;

        for line in text.lines() {
            let line = normalize(line);
            if let Some(slot) = self
                .slots
                .iter()
                .find(|slot| line.eq_ignore_ascii_case(slot.header))
            {
                current = Some(slot);
                continue;
            }
            let (Some(slot), Some(captures)) = (current, MARKED_OPTION.captures(&line)) else {
                continue;
            };
            if let (Some(values), Some(label)) = (choices.get_mut(slot.slot), captures.get(1)) {
                values.push(label.as_str().to_owned());
            }
        }

        for slot in self.slots {
            let count = choices.get(slot.slot).map_or(0, Vec::len);
            if slot.cardinality == Cardinality::ExactlyOne {
                match count {
                    0 => return Err(ExtractionError::Empty(slot.slot.to_owned())),
                    1 => {}
                    count => {
                        return Err(ExtractionError::Ambiguous {
                            slot: slot.slot.to_owned(),
                            count,
                        });
                    }
                }
            }
        }
        if choices.values().all(Vec::is_empty) {
            return Err(ExtractionError::NothingMarked);
        }

        Ok(choices)
    }
}

/// Sheet type printed on a sheet, if the marker is readable.
pub fn declared_sheet_type(text: &str) -> Option<String> {
    SHEET_TYPE_MARKER
        .captures(text)
        .and_then(|captures| captures.get(1))
        .map(|found| found.as_str().to_ascii_lowercase())
}

/// Collapse runs of whitespace so OCR spacing noise does not matter.
fn normalize(line: &str) -> String {
    line.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCATION_TEXT: &str = "Sheet Type: location_choice
Where will you go next? Mark one box.
[ ] The market
[X]   The dark alley
[ ] The old well
Code: A1B2C0-ZZ2000";

    #[test]
    fn single_choice_slot_reads_marked_option() {
        let choices = SheetLayout::of(SheetType::LocationChoice)
            .extract(LOCATION_TEXT)
            .unwrap();
        assert_eq!(choices.get("a"), Some(&vec!["The dark alley".to_owned()]));
    }

    #[test]
    fn single_choice_slot_rejects_empty_and_ambiguous_marks() {
        let layout = SheetLayout::of(SheetType::LocationChoice);
        let empty = LOCATION_TEXT.replace("[X]", "[ ]");
        assert_eq!(
            layout.extract(&empty),
            Err(ExtractionError::Empty("a".into()))
        );

        let ambiguous = LOCATION_TEXT.replace("[ ] The market", "[x] The market");
        assert_eq!(
            layout.extract(&ambiguous),
            Err(ExtractionError::Ambiguous {
                slot: "a".into(),
                count: 2
            })
        );
    }

    #[test]
    fn multi_slot_sheet_assigns_marks_to_nearest_header() {
        let text = "Sheet Type: inventory_management
Pick up:
[*] Rusty key
[ ] Lantern
Drop:
[✓] Bread";
        let choices = SheetLayout::of(SheetType::InventoryManagement)
            .extract(text)
            .unwrap();
        assert_eq!(choices["pick_up"], vec!["Rusty key".to_owned()]);
        assert_eq!(choices["drop"], vec!["Bread".to_owned()]);
    }

    #[test]
    fn multi_slot_sheet_requires_one_mark_overall() {
        let text = "Pick up:\n[ ] Rusty key\nDrop:\n[ ] Bread";
        assert_eq!(
            SheetLayout::of(SheetType::InventoryManagement).extract(text),
            Err(ExtractionError::NothingMarked)
        );
    }

    #[test]
    fn marks_outside_sections_are_ignored() {
        let text = "[X] stray mark\nWhere   will you go next?  Mark one box.\n[X] The market";
        let choices = SheetLayout::of(SheetType::LocationChoice)
            .extract(text)
            .unwrap();
        assert_eq!(choices["a"], vec!["The market".to_owned()]);
    }

    #[test]
    fn other_sheet_type_marker_is_rejected() {
        assert_eq!(
            SheetLayout::of(SheetType::InventoryManagement).extract(LOCATION_TEXT),
            Err(ExtractionError::WrongSheet("location_choice".into()))
        );
    }
}
