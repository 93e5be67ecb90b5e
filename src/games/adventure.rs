//! A small exploration game: players walk between the locations of a fixed
//! town and move items between the ground and their pockets.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{GameRules, RulesError, SheetPlan};
use crate::{
    dao::models::{GameType, SheetType},
    sheets::{layout::Choices, template::ChoiceOption},
};

/// Where every player starts.
pub const START_LOCATION: &str = "The town square";

struct Location {
    name: &'static str,
    description: &'static str,
    exits: &'static [&'static str],
    items: &'static [&'static str],
}

const WORLD: &[Location] = &[
    Location {
        name: START_LOCATION,
        description: "Cobblestones, a dry fountain and three ways out.",
        exits: &["The market", "The dark alley", "The old well"],
        items: &[],
    },
    Location {
        name: "The market",
        description: "Stalls creak under canvas; most traders have gone home.",
        exits: &[START_LOCATION, "The harbour"],
        items: &["Bread", "Lantern"],
    },
    Location {
        name: "The dark alley",
        description: "Something glints between the puddles.",
        exits: &[START_LOCATION, "The abandoned chapel"],
        items: &["Rusty key"],
    },
    Location {
        name: "The old well",
        description: "A frayed rope hangs over the edge.",
        exits: &[START_LOCATION],
        items: &["Rope"],
    },
    Location {
        name: "The harbour",
        description: "Gulls circle over moored boats.",
        exits: &["The market"],
        items: &["Fishing net"],
    },
    Location {
        name: "The abandoned chapel",
        description: "Dust hangs in the light of a broken window.",
        exits: &["The dark alley"],
        items: &["Silver candlestick"],
    },
];

fn location(name: &str) -> Option<&'static Location> {
    WORLD.iter().find(|location| location.name == name)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct PlayerState {
    location: String,
    inventory: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct AdventureState {
    players: BTreeMap<Uuid, PlayerState>,
    location_items: BTreeMap<String, Vec<String>>,
}

impl AdventureState {
    fn load(state: &Value) -> Result<Self, RulesError> {
        Ok(serde_json::from_value(state.clone())?)
    }

    fn store(&self, state: &mut Value) -> Result<(), RulesError> {
        *state = serde_json::to_value(self)?;
        Ok(())
    }

    fn items_at(&self, name: &str) -> &[String] {
        self.location_items.get(name).map_or(&[], Vec::as_slice)
    }
}

/// Rules of [`GameType::Adventure`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AdventureRules;

impl GameRules for AdventureRules {
    fn game_type(&self) -> GameType {
        GameType::Adventure
    }

    fn initial_state(&self) -> Value {
        let state = AdventureState {
            players: BTreeMap::new(),
            location_items: WORLD
                .iter()
                .map(|location| {
                    let items = location.items.iter().map(|item| (*item).to_owned());
                    (location.name.to_owned(), items.collect())
                })
                .collect(),
        };
        serde_json::to_value(state).unwrap_or(Value::Null)
    }

    fn plan_sheets(
        &self,
        state: &mut Value,
        account_id: Uuid,
    ) -> Result<Vec<SheetPlan>, RulesError> {
        let mut adventure = AdventureState::load(state)?;
        let player = adventure
            .players
            .entry(account_id)
            .or_insert_with(|| PlayerState {
                location: START_LOCATION.to_owned(),
                inventory: Vec::new(),
            })
            .clone();
        adventure.store(state)?;

        let here = location(&player.location).ok_or(RulesError::UnknownPlayer(account_id))?;
        let ground = adventure.items_at(here.name);

        let mut narrative = format!("You are at {}. {}", here.name, here.description);
        if !ground.is_empty() {
            narrative.push_str(&format!("\nYou see: {}.", ground.join(", ")));
        }
        if !player.inventory.is_empty() {
            narrative.push_str(&format!("\nYou carry: {}.", player.inventory.join(", ")));
        }

        let mut plans = vec![SheetPlan {
            sheet_type: SheetType::LocationChoice,
            narrative: narrative.clone(),
            choices: here
                .exits
                .iter()
                .map(|exit| ChoiceOption::new("a", *exit))
                .collect(),
        }];

        if !ground.is_empty() || !player.inventory.is_empty() {
            let pick_up = ground.iter().map(|item| ChoiceOption::new("pick_up", item));
            let drop = player
                .inventory
                .iter()
                .map(|item| ChoiceOption::new("drop", item));
            plans.push(SheetPlan {
                sheet_type: SheetType::InventoryManagement,
                narrative,
                choices: pick_up.chain(drop).collect(),
            });
        }
        Ok(plans)
    }

    fn resolve(
        &self,
        state: &mut Value,
        account_id: Uuid,
        sheet_type: SheetType,
        choices: &Choices,
    ) -> Result<(), RulesError> {
        let mut adventure = AdventureState::load(state)?;
        let mut player = adventure
            .players
            .get(&account_id)
            .cloned()
            .ok_or(RulesError::UnknownPlayer(account_id))?;

        match sheet_type {
            SheetType::LocationChoice => {
                let here =
                    location(&player.location).ok_or(RulesError::UnknownPlayer(account_id))?;
                let target = match choices.get("a").map(Vec::as_slice) {
                    Some([target]) => target,
                    _ => {
                        return Err(RulesError::InvalidChoice {
                            slot: "a".into(),
                            value: String::new(),
                        });
                    }
                };
                if !here.exits.contains(&target.as_str()) {
                    return Err(RulesError::InvalidChoice {
                        slot: "a".into(),
                        value: target.clone(),
                    });
                }
                player.location = target.clone();
            }
            SheetType::InventoryManagement => {
                let ground = adventure
                    .location_items
                    .entry(player.location.clone())
                    .or_default();
                for item in choices.get("pick_up").into_iter().flatten() {
                    let index = ground.iter().position(|candidate| candidate == item).ok_or_else(
                        || RulesError::InvalidChoice {
                            slot: "pick_up".into(),
                            value: item.clone(),
                        },
                    )?;
                    player.inventory.push(ground.remove(index));
                }
                for item in choices.get("drop").into_iter().flatten() {
                    let index = player
                        .inventory
                        .iter()
                        .position(|candidate| candidate == item)
                        .ok_or_else(|| RulesError::InvalidChoice {
                            slot: "drop".into(),
                            value: item.clone(),
                        })?;
                    ground.push(player.inventory.remove(index));
                }
            }
        }

        adventure.players.insert(account_id, player);
        adventure.store(state)
    }

    fn resolution_rank(&self, sheet_type: SheetType) -> u8 {
        // Items change hands where the player stood when the sheet was printed.
        match sheet_type {
            SheetType::InventoryManagement => 0,
            SheetType::LocationChoice => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn choices(entries: &[(&str, &[&str])]) -> Choices {
        entries
            .iter()
            .map(|(slot, values)| {
                (
                    (*slot).to_owned(),
                    values.iter().map(|value| (*value).to_owned()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn first_turn_offers_only_location_choice_from_the_square() {
        let rules = AdventureRules;
        let mut state = rules.initial_state();
        let player = Uuid::new_v4();

        let plans = rules.plan_sheets(&mut state, player).unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].sheet_type, SheetType::LocationChoice);
        assert!(
            plans[0]
                .choices
                .contains(&ChoiceOption::new("a", "The dark alley"))
        );
        assert_eq!(state["players"][player.to_string()]["location"], START_LOCATION);
    }

    #[test]
    fn moving_next_to_items_adds_inventory_sheet() {
        let rules = AdventureRules;
        let mut state = rules.initial_state();
        let player = Uuid::new_v4();
        rules.plan_sheets(&mut state, player).unwrap();

        rules
            .resolve(
                &mut state,
                player,
                SheetType::LocationChoice,
                &choices(&[("a", &["The dark alley"])]),
            )
            .unwrap();

        let plans = rules.plan_sheets(&mut state, player).unwrap();
        let inventory = plans
            .iter()
            .find(|plan| plan.sheet_type == SheetType::InventoryManagement)
            .unwrap();
        assert_eq!(
            inventory.choices,
            vec![ChoiceOption::new("pick_up", "Rusty key")]
        );
    }

    #[test]
    fn items_move_between_ground_and_inventory() {
        let rules = AdventureRules;
        let mut state = rules.initial_state();
        let player = Uuid::new_v4();
        rules.plan_sheets(&mut state, player).unwrap();
        rules
            .resolve(
                &mut state,
                player,
                SheetType::LocationChoice,
                &choices(&[("a", &["The market"])]),
            )
            .unwrap();
        rules
            .resolve(
                &mut state,
                player,
                SheetType::InventoryManagement,
                &choices(&[("pick_up", &["Lantern"]), ("drop", &[])]),
            )
            .unwrap();

        assert_eq!(
            state["players"][player.to_string()]["inventory"],
            serde_json::json!(["Lantern"])
        );
        assert_eq!(
            state["location_items"]["The market"],
            serde_json::json!(["Bread"])
        );
    }

    #[test]
    fn unreachable_destinations_and_missing_items_are_rejected() {
        let rules = AdventureRules;
        let mut state = rules.initial_state();
        let player = Uuid::new_v4();
        rules.plan_sheets(&mut state, player).unwrap();

        assert!(matches!(
            rules.resolve(
                &mut state,
                player,
                SheetType::LocationChoice,
                &choices(&[("a", &["The harbour"])]),
            ),
            Err(RulesError::InvalidChoice { .. })
        ));
        assert!(matches!(
            rules.resolve(
                &mut state,
                player,
                SheetType::InventoryManagement,
                &choices(&[("drop", &["Lantern"])]),
            ),
            Err(RulesError::InvalidChoice { .. })
        ));
    }

    #[test]
    fn unknown_players_cannot_resolve() {
        let rules = AdventureRules;
        let mut state = rules.initial_state();
        assert!(matches!(
            rules.resolve(
                &mut state,
                Uuid::new_v4(),
                SheetType::LocationChoice,
                &choices(&[("a", &["The market"])]),
            ),
            Err(RulesError::UnknownPlayer(_))
        ));
    }
}
