//! Pipeline jobs and their queue binding.
//!
//! Every transition of the pipeline is a discrete job identified by a
//! natural key, so redelivering a message or re-enqueueing a step never
//! creates a second job.

use std::time::Duration as StdDuration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::dao::{
    database::Tx,
    jobs::{self, NewJob},
    models::DeliveryChannel,
    storage::{StorageError, StorageResult},
};

/// Unit of pipeline work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    /// Create the sheets of `turn_number`.
    Opening { instance_id: Uuid, turn_number: u32 },
    /// Render one sheet and hand it to the dispatcher.
    Emit {
        game_id: Uuid,
        instance_id: Uuid,
        sheet_id: Uuid,
    },
    /// Try one channel once.
    Deliver {
        game_id: Uuid,
        instance_id: Uuid,
        sheet_id: Uuid,
        channel: DeliveryChannel,
        attempt_number: u32,
    },
    /// Read one submission of an inbound scan.
    IngestScan { scan_id: Uuid, submission: u32 },
    /// Close `turn_number` once its quorum is reached or its deadline passed.
    Resolve { instance_id: Uuid, turn_number: u32 },
}

impl Job {
    /// Name stored in the `kind` column.
    pub fn kind(&self) -> &'static str {
        match self {
            Job::Opening { .. } => "opening",
            Job::Emit { .. } => "emit",
            Job::Deliver { .. } => "deliver",
            Job::IngestScan { .. } => "ingest_scan",
            Job::Resolve { .. } => "resolve",
        }
    }

    /// Deduplication key.
    pub fn natural_key(&self) -> String {
        match self {
            Job::Opening {
                instance_id,
                turn_number,
            } => opening_key(*instance_id, *turn_number),
            Job::Emit { sheet_id, .. } => format!("emit:{sheet_id}"),
            Job::Deliver {
                sheet_id,
                channel,
                attempt_number,
                ..
            } => format!("deliver:{sheet_id}:{channel}:{attempt_number}"),
            Job::IngestScan {
                scan_id,
                submission,
            } => format!("ingest_scan:{scan_id}:{submission}"),
            Job::Resolve {
                instance_id,
                turn_number,
            } => resolve_key(*instance_id, *turn_number),
        }
    }

    /// Instance whose cancellation short-circuits the job.
    pub fn instance_id(&self) -> Option<Uuid> {
        match self {
            Job::Opening { instance_id, .. }
            | Job::Emit { instance_id, .. }
            | Job::Deliver { instance_id, .. }
            | Job::Resolve { instance_id, .. } => Some(*instance_id),
            Job::IngestScan { .. } => None,
        }
    }

    /// Whether the job mutates instance turn state and must hold the
    /// instance lock.
    pub fn needs_instance_lock(&self) -> bool {
        matches!(self, Job::Opening { .. } | Job::Resolve { .. })
    }
}

/// Natural key of the opening job of a turn.
pub fn opening_key(instance_id: Uuid, turn_number: u32) -> String {
    format!("opening:{instance_id}:{turn_number}")
}

/// Natural key of the resolve job of a turn.
pub fn resolve_key(instance_id: Uuid, turn_number: u32) -> String {
    format!("resolve:{instance_id}:{turn_number}")
}

/// Queue `job` to run no earlier than `run_after`. Returns `false` when it
/// already exists.
pub fn enqueue(
    tx: &Tx<'_>,
    job: &Job,
    run_after: OffsetDateTime,
    now: OffsetDateTime,
) -> StorageResult<bool> {
    let payload = serde_json::to_string(job)?;
    let natural_key = job.natural_key();
    jobs::enqueue(
        tx,
        &NewJob {
            kind: job.kind(),
            natural_key: &natural_key,
            payload: &payload,
            instance_id: job.instance_id(),
            run_after,
        },
        now,
    )
}

/// Decode a stored payload.
pub fn decode(payload: &str) -> Result<Job, StorageError> {
    Ok(serde_json::from_str(payload)?)
}

/// What a job asks the queue to do after it ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Nothing left to do.
    Done,
    /// Run again at the given time, unless woken earlier.
    Reschedule(OffsetDateTime),
}

/// Exponential backoff with symmetric jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base: StdDuration,
    pub factor: u32,
    /// Fraction of the delay added or removed at random.
    pub jitter: f64,
    /// Tries allowed, the first one included.
    pub budget: u32,
}

impl RetryPolicy {
    /// Policy with factor 2 and ±25% jitter.
    pub fn new(base: StdDuration, budget: u32) -> Self {
        Self {
            base,
            factor: 2,
            jitter: 0.25,
            budget,
        }
    }

    /// Whether another try may follow try number `tries` (1-based).
    pub fn allows_another(&self, tries: u32) -> bool {
        tries < self.budget
    }

    /// Delay before the try following try number `tries` (1-based).
    pub fn backoff<R: Rng + ?Sized>(&self, tries: u32, rng: &mut R) -> Duration {
        let exponent = tries.saturating_sub(1).min(16);
        let nominal = self.base.as_secs_f64() * f64::from(self.factor.saturating_pow(exponent));
        let spread = if self.jitter > 0.0 {
            rng.random_range(-self.jitter..=self.jitter)
        } else {
            0.0
        };
        Duration::seconds_f64((nominal * (1.0 + spread)).max(0.0))
    }

    /// [`RetryPolicy::backoff`] drawing jitter from the thread-local generator.
    pub fn jittered_backoff(&self, tries: u32) -> Duration {
        self.backoff(tries, &mut rand::rng())
    }
}
