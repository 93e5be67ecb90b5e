//! Queue workers: claim due jobs, run them under a deadline and apply the
//! propagation policy of whatever error they return.

use std::time::Instant;

use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{
    dao::{
        database::with_deadline,
        deliveries::AttemptKey,
        games,
        jobs::{self as job_rows, Lease},
        models::{InstanceState, JobEntity},
        storage::StorageError,
    },
    error::{Disposition, PipelineError},
    services::{
        dispatcher, intake,
        jobs::{self, Job, JobOutcome, RetryPolicy},
        orchestrator,
    },
    state::SharedState,
};

/// Upper bound on jobs run by one [`drain`] call.
const DRAIN_LIMIT: usize = 10_000;

enum Claimed {
    Run(JobEntity, Lease),
    Skipped,
}

/// Run one worker loop until `shutdown` flips to `true`.
pub async fn run(state: SharedState, worker: usize, mut shutdown: watch::Receiver<bool>) {
    info!(worker, "queue worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        match run_once(&state).await {
            Ok(true) => continue,
            Ok(false) => {}
            Err(err) => error!(worker, error = %err, "job queue unavailable"),
        }
        tokio::select! {
            _ = state.queue_notified() => {}
            _ = tokio::time::sleep(state.config().poll_interval()) => {}
            _ = shutdown.changed() => {}
        }
    }
    info!(worker, "queue worker stopped");
}

/// Claim and run one due job. Returns `false` when none was due.
pub async fn run_once(state: &SharedState) -> Result<bool, StorageError> {
    let now = state.now();
    let lease = time::Duration::try_from(state.config().job_lease())
        .unwrap_or(time::Duration::minutes(5));
    let claimed = state
        .db()
        .transaction(move |tx| {
            let Some((row, lease)) = job_rows::claim(tx, now, lease)? else {
                return Ok(None);
            };
            if let Some(instance_id) = row.instance_id {
                let cancelled = games::get_instance(tx, instance_id)?
                    .is_some_and(|instance| instance.state == InstanceState::Cancelled);
                if cancelled {
                    job_rows::complete(tx, lease, now)?;
                    debug!(job = %row.natural_key, %instance_id, "instance cancelled; job dropped");
                    return Ok(Some(Claimed::Skipped));
                }
            }
            Ok::<_, StorageError>(Some(Claimed::Run(row, lease)))
        })
        .await?;
    let (row, lease) = match claimed {
        None => return Ok(false),
        Some(Claimed::Skipped) => return Ok(true),
        Some(Claimed::Run(row, lease)) => (row, lease),
    };

    let job = match jobs::decode(&row.payload) {
        Ok(job) => job,
        Err(err) => {
            error!(job = %row.natural_key, error = %err, "undecodable job payload");
            let message = err.to_string();
            let now = state.now();
            state
                .db()
                .transaction(move |tx| job_rows::fail(tx, lease, &message, now))
                .await?;
            return Ok(true);
        }
    };

    debug!(job = %row.natural_key, attempts = row.attempts, "running job");
    let budget = state.config().job_deadline();
    let run = with_deadline(Instant::now() + budget, execute(state, &job));
    let outcome = match tokio::time::timeout(budget, run).await {
        Ok(outcome) => outcome,
        Err(_) => Err(PipelineError::DeadlineExceeded),
    };
    settle(state, &row, lease, &job, outcome).await?;
    Ok(true)
}

/// Run due jobs until none is left. Used by tests and one-shot tooling.
pub async fn drain(state: &SharedState) -> Result<usize, StorageError> {
    let mut ran = 0;
    while ran < DRAIN_LIMIT && run_once(state).await? {
        ran += 1;
    }
    Ok(ran)
}

/// Run `job`, holding the instance lock when it changes turn state.
pub async fn execute(state: &SharedState, job: &Job) -> Result<JobOutcome, PipelineError> {
    let _guard = match job.instance_id() {
        Some(instance_id) if job.needs_instance_lock() => {
            Some(state.locks().acquire(instance_id).await)
        }
        _ => None,
    };
    match *job {
        Job::Opening {
            instance_id,
            turn_number,
        } => orchestrator::open_turn(state, instance_id, turn_number).await,
        Job::Emit {
            game_id,
            instance_id,
            sheet_id,
        } => orchestrator::emit_sheet(state, game_id, instance_id, sheet_id).await,
        Job::Deliver {
            game_id,
            sheet_id,
            channel,
            attempt_number,
            ..
        } => {
            let key = AttemptKey {
                turn_sheet_id: sheet_id,
                channel,
                attempt_number,
            };
            dispatcher::deliver(state, game_id, key).await
        }
        Job::IngestScan {
            scan_id,
            submission,
        } => intake::ingest(state, scan_id, submission).await,
        Job::Resolve {
            instance_id,
            turn_number,
        } => orchestrator::resolve_turn(state, instance_id, turn_number).await,
    }
}

/// When a job that failed its `tries`-th try runs next, if at all: a
/// concurrent move is re-read at once, a transient failure backs off, and
/// anything else is given up.
pub fn next_run(
    disposition: Disposition,
    tries: u32,
    policy: &RetryPolicy,
    now: OffsetDateTime,
) -> Option<OffsetDateTime> {
    match disposition {
        Disposition::Reread if policy.allows_another(tries) => Some(now),
        Disposition::Retry if policy.allows_another(tries) => {
            Some(now + policy.jittered_backoff(tries))
        }
        _ => None,
    }
}

fn warn_lost_lease(row: &JobEntity, held: bool) {
    if !held {
        warn!(job = %row.natural_key, "lease lost to another worker; result discarded");
    }
}

async fn settle(
    state: &SharedState,
    row: &JobEntity,
    lease: Lease,
    job: &Job,
    outcome: Result<JobOutcome, PipelineError>,
) -> Result<(), StorageError> {
    let now = state.now();
    let err = match outcome {
        Ok(JobOutcome::Done) => {
            let held = state
                .db()
                .transaction(move |tx| job_rows::complete(tx, lease, now))
                .await?;
            warn_lost_lease(row, held);
            return Ok(());
        }
        Ok(JobOutcome::Reschedule(at)) => {
            debug!(job = %row.natural_key, at = %at, "job rescheduled");
            let held = state
                .db()
                .transaction(move |tx| job_rows::reschedule(tx, lease, at, now))
                .await?;
            warn_lost_lease(row, held);
            return Ok(());
        }
        Err(err) => err,
    };

    let tries = row.attempts + 1;
    let policy = RetryPolicy::new(
        state.config().delivery_backoff_base(),
        state.config().job_attempt_budget,
    );
    let message = err.to_string();
    let disposition = err.disposition();

    if let Some(at) = next_run(disposition, tries, &policy, now) {
        if disposition == Disposition::Reread {
            debug!(job = %row.natural_key, error = %message, "record moved concurrently; re-reading");
        } else {
            warn!(job = %row.natural_key, kind = err.kind(), error = %message, tries, retry_at = %at, "job failed; retrying");
        }
        let held = state
            .db()
            .transaction(move |tx| job_rows::retry(tx, lease, &message, at, now))
            .await?;
        warn_lost_lease(row, held);
        return Ok(());
    }

    error!(
        job = %row.natural_key,
        kind = err.kind(),
        ?disposition,
        error = %message,
        tries,
        "job given up"
    );
    let held = state
        .db()
        .transaction(move |tx| job_rows::fail(tx, lease, &message, now))
        .await?;
    if !held {
        warn_lost_lease(row, held);
        return Ok(());
    }
    if let Job::IngestScan { scan_id, .. } = *job {
        if let Err(reject_err) = intake::reject(state, scan_id, err).await {
            error!(%scan_id, error = %reject_err, "could not record scan rejection");
        }
    }
    Ok(())
}
