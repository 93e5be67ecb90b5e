//! Per-game-type rules: what each player is asked every turn and how their
//! scanned answers change the instance's derived state.

pub mod adventure;

use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    dao::models::{GameType, SheetType},
    sheets::{layout::Choices, template::ChoiceOption},
};

/// One sheet a player receives for the coming turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetPlan {
    pub sheet_type: SheetType,
    /// Situation text printed above the choices.
    pub narrative: String,
    pub choices: Vec<ChoiceOption>,
}

/// Error raised by game rules.
#[derive(Debug, Error)]
pub enum RulesError {
    /// The stored game state does not match the rules' model.
    #[error("malformed game state")]
    State(#[from] serde_json::Error),
    /// The player has no place in the game state.
    #[error("account {0} is not part of the game")]
    UnknownPlayer(Uuid),
    /// A scanned choice is not allowed in the current state.
    #[error("`{value}` is not a valid choice for slot `{slot}`")]
    InvalidChoice { slot: String, value: String },
    /// The rules do not handle this sheet type.
    #[error("sheet type {0} is not played by these rules")]
    UnsupportedSheet(SheetType),
}

/// Rules of one game type, including its resolver.
///
/// State is opaque JSON persisted on the instance; only the rules interpret it.
pub trait GameRules: Send + Sync {
    /// Game type these rules implement.
    fn game_type(&self) -> GameType;

    /// Derived state of a freshly started instance.
    fn initial_state(&self) -> Value;

    /// Sheets `account_id` receives this turn. Adds the player to the state on
    /// their first turn.
    fn plan_sheets(&self, state: &mut Value, account_id: Uuid)
    -> Result<Vec<SheetPlan>, RulesError>;

    /// Apply a player's scanned choices. On error `state` may be partially
    /// modified; callers apply to a copy.
    fn resolve(
        &self,
        state: &mut Value,
        account_id: Uuid,
        sheet_type: SheetType,
        choices: &Choices,
    ) -> Result<(), RulesError>;

    /// Order in which sheet types of one turn are resolved, lowest first.
    fn resolution_rank(&self, sheet_type: SheetType) -> u8 {
        let _ = sheet_type;
        0
    }
}
