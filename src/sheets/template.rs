use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::code::SheetCode;
use crate::dao::models::GameType;

/// One printable option of a choice slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoiceOption {
    /// Slot the option belongs to.
    pub slot: String,
    /// Text printed next to the box and read back by the scanner.
    pub label: String,
}

impl ChoiceOption {
    /// Build an option for `slot`.
    pub fn new(slot: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            slot: slot.into(),
            label: label.into(),
        }
    }
}

/// Typed data a sheet is rendered from, persisted as JSON on the sheet row.
///
/// `code`, `turn_number` and `deadline` are required for rendering; the rest
/// is decoration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateData {
    /// Name of the game definition.
    #[serde(default)]
    pub game_name: Option<String>,
    /// Game type selecting rules and processors.
    #[serde(default)]
    pub game_type: Option<GameType>,
    /// Turn the sheet belongs to.
    #[serde(default)]
    pub turn_number: Option<u32>,
    /// Player the sheet is addressed to.
    #[serde(default)]
    pub account_name: Option<String>,
    /// Return deadline.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub deadline: Option<OffsetDateTime>,
    /// Code printed on the sheet.
    #[serde(default)]
    pub code: Option<SheetCode>,
    /// References to background images drawn behind the sheet.
    #[serde(default)]
    pub background_images: Vec<String>,
    /// Situation text shown above the choices.
    #[serde(default)]
    pub narrative: Option<String>,
    /// Options per slot, in print order.
    #[serde(default)]
    pub choices: Vec<ChoiceOption>,
}

impl TemplateData {
    /// Options printed for `slot`, in order.
    pub fn options_for<'a>(&'a self, slot: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.choices
            .iter()
            .filter(move |option| option.slot == slot)
            .map(|option| option.label.as_str())
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn json_round_trip_keeps_deadline_and_code() {
        let data = TemplateData {
            turn_number: Some(3),
            deadline: Some(datetime!(2026-01-02 03:04:05 UTC)),
            code: Some(SheetCode::parse("A1B2C0-ZZ2000").unwrap()),
            choices: vec![ChoiceOption::new("a", "The market")],
            ..TemplateData::default()
        };
        let json = serde_json::to_string(&data).unwrap();
        assert!(json.contains("2026-01-02T03:04:05Z"));
        assert_eq!(serde_json::from_str::<TemplateData>(&json).unwrap(), data);
    }

    #[test]
    fn missing_fields_default_to_none() {
        let data: TemplateData = serde_json::from_str("{}").unwrap();
        assert_eq!(data, TemplateData::default());
    }

    #[test]
    fn options_are_filtered_by_slot() {
        let data = TemplateData {
            choices: vec![
                ChoiceOption::new("pick_up", "Lantern"),
                ChoiceOption::new("drop", "Bread"),
                ChoiceOption::new("pick_up", "Rope"),
            ],
            ..TemplateData::default()
        };
        assert_eq!(
            data.options_for("pick_up").collect::<Vec<_>>(),
            vec!["Lantern", "Rope"]
        );
    }
}
