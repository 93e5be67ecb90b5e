use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::sheets::{code::SheetCode, template::TemplateData};

/// Raised when a stored or submitted text value does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} `{value}`")]
pub struct ParseEnumError {
    /// Name of the enumeration being parsed.
    pub kind: &'static str,
    /// Offending value.
    pub value: String,
}

/// Declare a fieldless enum persisted as snake_case text.
macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        $name:ident as $kind:literal {
            $($(#[$vmeta:meta])* $variant:ident => $text:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, utoipa::ToSchema)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($(#[$vmeta])* $variant,)+
        }

        impl $name {
            /// Every variant, in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant,)+];

            /// Text representation used in storage and on the wire.
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok($name::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_owned(),
                    }),
                }
            }
        }
    };
}

text_enum! {
    /// Kind of game a definition runs; selects rules, generators and scanners.
    GameType as "game type" {
        /// Exploration game where players move between locations and collect items.
        Adventure => "adventure",
    }
}

text_enum! {
    /// Kind of printable turn sheet.
    SheetType as "sheet type" {
        /// Pick the next location to move to.
        LocationChoice => "location_choice",
        /// Pick up or drop items.
        InventoryManagement => "inventory_management",
    }
}

text_enum! {
    /// Lifecycle of a game instance.
    InstanceState as "instance state" {
        /// Waiting for enough subscribers.
        Pending => "pending",
        /// Turns are being played.
        Active => "active",
        /// Termination predicate reached.
        Completed => "completed",
        /// Stopped by a game master; pending jobs short-circuit.
        Cancelled => "cancelled",
    }
}

text_enum! {
    /// Phase of the current turn of an instance.
    TurnPhase as "turn phase" {
        /// Sheets for the current turn are about to be created.
        Opening => "opening",
        /// Sheets exist and are being rendered and dispatched.
        Emitting => "emitting",
        /// Every sheet was dispatched; waiting for scans.
        Awaiting => "awaiting",
        /// The deadline elapsed before every sheet was scanned.
        TimedOut => "timed_out",
        /// Scanned choices are being applied.
        Resolving => "resolving",
        /// The turn is over.
        Closed => "closed",
    }
}

text_enum! {
    /// Status of an account's subscription to an instance.
    SubscriptionStatus as "subscription status" {
        /// No delivery channel configured yet.
        Pending => "pending",
        /// Receives a sheet every turn.
        Active => "active",
        /// Left the game.
        Withdrawn => "withdrawn",
    }
}

text_enum! {
    /// Way a rendered sheet reaches a player.
    DeliveryChannel as "delivery channel" {
        /// Sent as an email attachment.
        Email => "email",
        /// Printed and posted by a mailing service.
        PhysicalPost => "physical_post",
        /// Printed locally and handed over in person.
        PhysicalLocal => "physical_local",
    }
}

text_enum! {
    /// Lifecycle of a turn sheet.
    SheetState as "sheet state" {
        /// Row exists, nothing rendered yet.
        Draft => "draft",
        /// Artifact rendered and digest recorded.
        Rendered => "rendered",
        /// Delivery attempts enqueued.
        Dispatched => "dispatched",
        /// At least one channel succeeded.
        Delivered => "delivered",
        /// Returned by the player but not yet readable.
        Received => "received",
        /// Choices extracted from a scan.
        Scanned => "scanned",
        /// Choices applied to the game state.
        Resolved => "resolved",
        /// Could not complete; the turn proceeds without it.
        Failed => "failed",
        /// The player withdrew.
        Abandoned => "abandoned",
    }
}

text_enum! {
    /// Outcome of one delivery attempt.
    AttemptState as "attempt state" {
        /// Enqueued, not yet tried.
        Pending => "pending",
        /// Transport accepted the artifact.
        Succeeded => "succeeded",
        /// Transport rejected the artifact; a later attempt follows.
        Failed => "failed",
        /// Retry budget exhausted or sheet no longer needs delivery.
        Abandoned => "abandoned",
    }
}

text_enum! {
    /// Processing state of an inbound scan.
    ScanState as "scan state" {
        /// Stored, waiting for the ingest job.
        Pending => "pending",
        /// Bound to a turn sheet.
        Bound => "bound",
        /// Needs manual reconciliation.
        Rejected => "rejected",
    }
}

text_enum! {
    /// State of a queued job.
    JobState as "job state" {
        /// Waiting for `run_after`.
        Queued => "queued",
        /// Claimed by a worker.
        Running => "running",
        /// Completed.
        Done => "done",
        /// Gave up.
        Failed => "failed",
    }
}

/// Player account receiving sheets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountEntity {
    pub id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub postal_address: Option<String>,
    pub created_at: OffsetDateTime,
}

/// Game definition shared by its instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameEntity {
    pub id: Uuid,
    pub name: String,
    pub game_type: GameType,
    pub turn_duration_hours: u32,
    pub created_at: OffsetDateTime,
}

/// One running occurrence of a game.
#[derive(Debug, Clone, PartialEq)]
pub struct GameInstanceEntity {
    pub id: Uuid,
    pub game_id: Uuid,
    pub state: InstanceState,
    pub current_turn_number: u32,
    pub required_player_count: u32,
    /// Instance completes once this many turns were played.
    pub turn_limit: Option<u32>,
    pub turn_phase: TurnPhase,
    pub deadline_for_current_turn: Option<OffsetDateTime>,
    /// Derived state owned by the game rules.
    pub game_state: serde_json::Value,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Account membership in an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionEntity {
    pub id: Uuid,
    pub game_instance_id: Uuid,
    pub account_id: Uuid,
    pub delivery_channels: Vec<DeliveryChannel>,
    pub status: SubscriptionStatus,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Per-player, per-turn printable sheet.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnSheetEntity {
    pub id: Uuid,
    pub game_instance_id: Uuid,
    pub turn_number: u32,
    pub account_id: Uuid,
    pub game_subscription_id: Uuid,
    pub sheet_type: SheetType,
    pub code: SheetCode,
    pub state: SheetState,
    pub template_data: TemplateData,
    pub rendered_digest: Option<String>,
    pub scanned_data: Option<ScannedData>,
    pub deadline: OffsetDateTime,
    pub last_error: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Structured result of a scan, stored on the sheet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedData {
    /// Values per declared choice slot.
    pub choices: crate::sheets::layout::Choices,
    /// Ingest record the choices came from.
    pub scan_id: Uuid,
}

/// One try of one channel for one sheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryAttemptEntity {
    pub id: Uuid,
    pub turn_sheet_id: Uuid,
    pub channel: DeliveryChannel,
    pub attempt_number: u32,
    pub state: AttemptState,
    pub last_error: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Where an inbound image came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSource {
    /// Free-form origin (scanner station, mailbox, upload).
    pub origin: String,
    /// Original file name, when known.
    pub file_name: Option<String>,
}

/// Ingest record retaining the raw image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRecordEntity {
    pub id: Uuid,
    pub image: Vec<u8>,
    pub source: ScanSource,
    pub sheet_type_hint: Option<SheetType>,
    pub submission: u32,
    pub state: ScanState,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub code: Option<SheetCode>,
    pub turn_sheet_id: Option<Uuid>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Durable queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEntity {
    pub id: Uuid,
    pub kind: String,
    /// Deduplication key: at most one job per key ever exists.
    pub natural_key: String,
    pub payload: String,
    pub instance_id: Option<Uuid>,
    pub state: JobState,
    /// Failed executions so far.
    pub attempts: u32,
    pub run_after: OffsetDateTime,
    pub lease_expires_at: Option<OffsetDateTime>,
    pub last_error: Option<String>,
}
