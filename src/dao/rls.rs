//! Row-level security scope threaded through every store call.

use uuid::Uuid;

/// Identifier set a caller may see and write.
///
/// A row is visible when its game is listed, when it belongs to the scoped
/// account, or when it hangs off a listed subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RlsScope {
    pub account_id: Option<Uuid>,
    pub game_ids: Vec<Uuid>,
    pub game_subscription_ids: Vec<Uuid>,
}

impl RlsScope {
    /// Scope of a pipeline job working on one game.
    pub fn for_game(game_id: Uuid) -> Self {
        Self {
            account_id: None,
            game_ids: vec![game_id],
            game_subscription_ids: Vec::new(),
        }
    }

    /// Scope of a single player looking at their own subscriptions.
    pub fn for_account(account_id: Uuid, game_subscription_ids: Vec<Uuid>) -> Self {
        Self {
            account_id: Some(account_id),
            game_ids: Vec::new(),
            game_subscription_ids,
        }
    }

    /// Whether a game-level row (game, instance) is visible.
    pub fn permits_game(&self, game_id: Uuid) -> bool {
        self.game_ids.contains(&game_id)
    }

    /// Whether a player-level row (subscription, sheet) is visible.
    pub fn permits(&self, game_id: Uuid, account_id: Uuid, subscription_id: Uuid) -> bool {
        self.permits_game(game_id)
            || self.account_id == Some(account_id)
            || self.game_subscription_ids.contains(&subscription_id)
    }
}
