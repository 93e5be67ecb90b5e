//! Durable job queue rows.
//!
//! A job is unique by its natural key for its whole life: enqueueing an
//! existing key is a no-op, which makes redelivered messages harmless.

use rusqlite::{OptionalExtension, Row, params};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use super::{
    database::{Tx, enum_at, opt_time_at, opt_uuid_at, time_at, ts, uuid_at},
    models::{JobEntity, JobState},
    storage::StorageResult,
};

const JOB_COLUMNS: &str = "id, kind, natural_key, payload, instance_id, state, attempts, \
     run_after, lease_expires_at, last_error";

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<JobEntity> {
    Ok(JobEntity {
        id: uuid_at(row, 0)?,
        kind: row.get(1)?,
        natural_key: row.get(2)?,
        payload: row.get(3)?,
        instance_id: opt_uuid_at(row, 4)?,
        state: enum_at(row, 5)?,
        attempts: row.get(6)?,
        run_after: time_at(row, 7)?,
        lease_expires_at: opt_time_at(row, 8)?,
        last_error: row.get(9)?,
    })
}

/// Job to insert.
#[derive(Debug, Clone)]
pub struct NewJob<'a> {
    pub kind: &'a str,
    pub natural_key: &'a str,
    pub payload: &'a str,
    pub instance_id: Option<Uuid>,
    pub run_after: OffsetDateTime,
}

/// Queue a job. Returns `false` when a job with the same natural key exists.
pub fn enqueue(tx: &Tx<'_>, job: &NewJob<'_>, now: OffsetDateTime) -> StorageResult<bool> {
    let inserted = tx.execute(
        "INSERT INTO jobs (id, kind, natural_key, payload, instance_id, state, attempts, \
         run_after, lease_expires_at, wake, last_error, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, NULL, 0, NULL, ?8, ?8) \
         ON CONFLICT (natural_key) DO NOTHING",
        params![
            Uuid::new_v4().to_string(),
            job.kind,
            job.natural_key,
            job.payload,
            job.instance_id.map(|id| id.to_string()),
            JobState::Queued.as_str(),
            ts(job.run_after),
            ts(now),
        ],
    )?;
    Ok(inserted == 1)
}

/// Make a queued job runnable now. A running job is flagged so that its
/// next reschedule is immediate. Returns whether a live job was found.
pub fn wake(tx: &Tx<'_>, natural_key: &str, now: OffsetDateTime) -> StorageResult<bool> {
    let updated = tx.execute(
        "UPDATE jobs SET \
         run_after = CASE WHEN state = ?1 THEN MIN(run_after, ?3) ELSE run_after END, \
         wake = CASE WHEN state = ?2 THEN 1 ELSE wake END, updated_at = ?3 \
         WHERE natural_key = ?4 AND state IN (?1, ?2)",
        params![
            JobState::Queued.as_str(),
            JobState::Running.as_str(),
            ts(now),
            natural_key,
        ],
    )?;
    Ok(updated == 1)
}

/// Proof of a claim. Settling a job through a lease that was taken over by
/// another worker after it expired changes nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub job_id: Uuid,
    pub token: Uuid,
}

/// Claim the oldest runnable job: a queued job whose `run_after` passed, or
/// a running job whose lease expired.
pub fn claim(
    tx: &Tx<'_>,
    now: OffsetDateTime,
    lease: Duration,
) -> StorageResult<Option<(JobEntity, Lease)>> {
    let candidate: Option<String> = tx
        .query_row(
            "SELECT id FROM jobs \
             WHERE (state = ?1 AND run_after <= ?3) OR (state = ?2 AND lease_expires_at <= ?3) \
             ORDER BY run_after, created_at LIMIT 1",
            params![JobState::Queued.as_str(), JobState::Running.as_str(), ts(now)],
            |row| row.get(0),
        )
        .optional()?;
    let Some(id) = candidate else {
        return Ok(None);
    };
    let token = Uuid::new_v4();
    let row = tx
        .query_row(
            &format!(
                "UPDATE jobs SET state = ?1, lease_expires_at = ?2, lease_token = ?3, wake = 0, \
                 updated_at = ?4 WHERE id = ?5 RETURNING {JOB_COLUMNS}"
            ),
            params![
                JobState::Running.as_str(),
                ts(now + lease),
                token.to_string(),
                ts(now),
                id
            ],
            job_from_row,
        )
        .optional()?;
    Ok(row.map(|job| {
        let lease = Lease {
            job_id: job.id,
            token,
        };
        (job, lease)
    }))
}

/// Mark a job done. Returns `false` when the lease was lost.
pub fn complete(tx: &Tx<'_>, lease: Lease, now: OffsetDateTime) -> StorageResult<bool> {
    finish(tx, lease, JobState::Done, None, now)
}

/// Give up on a job, keeping the error. Returns `false` when the lease was lost.
pub fn fail(tx: &Tx<'_>, lease: Lease, error: &str, now: OffsetDateTime) -> StorageResult<bool> {
    finish(tx, lease, JobState::Failed, Some(error), now)
}

fn finish(
    tx: &Tx<'_>,
    lease: Lease,
    state: JobState,
    error: Option<&str>,
    now: OffsetDateTime,
) -> StorageResult<bool> {
    let updated = tx.execute(
        "UPDATE jobs SET state = ?1, last_error = COALESCE(?2, last_error), \
         lease_expires_at = NULL, lease_token = NULL, updated_at = ?3 \
         WHERE id = ?4 AND state = ?5 AND lease_token = ?6",
        params![
            state.as_str(),
            error,
            ts(now),
            lease.job_id.to_string(),
            JobState::Running.as_str(),
            lease.token.to_string(),
        ],
    )?;
    Ok(updated == 1)
}

/// Return a job to the queue without counting a failure. A wake request
/// received while the job ran makes it runnable immediately.
pub fn reschedule(
    tx: &Tx<'_>,
    lease: Lease,
    at: OffsetDateTime,
    now: OffsetDateTime,
) -> StorageResult<bool> {
    let updated = tx.execute(
        "UPDATE jobs SET state = ?1, run_after = CASE WHEN wake = 1 THEN ?3 ELSE ?2 END, \
         wake = 0, lease_expires_at = NULL, lease_token = NULL, updated_at = ?3 \
         WHERE id = ?4 AND state = ?5 AND lease_token = ?6",
        params![
            JobState::Queued.as_str(),
            ts(at),
            ts(now),
            lease.job_id.to_string(),
            JobState::Running.as_str(),
            lease.token.to_string(),
        ],
    )?;
    Ok(updated == 1)
}

/// Return a failed job to the queue, counting the failure.
pub fn retry(
    tx: &Tx<'_>,
    lease: Lease,
    error: &str,
    at: OffsetDateTime,
    now: OffsetDateTime,
) -> StorageResult<bool> {
    let updated = tx.execute(
        "UPDATE jobs SET state = ?1, attempts = attempts + 1, last_error = ?2, run_after = ?3, \
         wake = 0, lease_expires_at = NULL, lease_token = NULL, updated_at = ?4 \
         WHERE id = ?5 AND state = ?6 AND lease_token = ?7",
        params![
            JobState::Queued.as_str(),
            error,
            ts(at),
            ts(now),
            lease.job_id.to_string(),
            JobState::Running.as_str(),
            lease.token.to_string(),
        ],
    )?;
    Ok(updated == 1)
}

/// Fetch a job by natural key.
pub fn get_by_key(tx: &Tx<'_>, natural_key: &str) -> StorageResult<Option<JobEntity>> {
    Ok(tx
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE natural_key = ?1"),
            params![natural_key],
            job_from_row,
        )
        .optional()?)
}

/// Number of jobs not yet done or failed.
pub fn pending_count(tx: &Tx<'_>) -> StorageResult<u64> {
    Ok(tx.query_row(
        "SELECT COUNT(*) FROM jobs WHERE state IN (?1, ?2)",
        params![JobState::Queued.as_str(), JobState::Running.as_str()],
        |row| row.get(0),
    )?)
}
