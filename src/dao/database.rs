//! SQLite-backed transactional record store.
//!
//! Every access runs on tokio's blocking pool through [`DbHandle`]; a
//! transaction closure is synchronous from `BEGIN` to `COMMIT` and an `Err`
//! return rolls the transaction back. Inside [`with_deadline`] a transaction
//! whose closure finishes after the deadline rolls back too: the blocking
//! thread cannot be cancelled, so the check sits right before `COMMIT`.

use std::{
    path::Path,
    str::FromStr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use rusqlite::{Connection, Row, TransactionBehavior, types::Type};
use serde::de::DeserializeOwned;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    models::ParseEnumError,
    schema,
    storage::{StorageError, StorageResult},
};

/// Transaction handle passed to every store operation.
pub type Tx<'c> = rusqlite::Transaction<'c>;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

tokio::task_local! {
    static DEADLINE: Instant;
}

/// Run `fut` so that every transaction it starts commits only before
/// `deadline`; later ones roll back with [`StorageError::DeadlineExceeded`].
pub async fn with_deadline<F: Future>(deadline: Instant, fut: F) -> F::Output {
    DEADLINE.scope(deadline, fut).await
}

/// Async-safe handle to the record store.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<Mutex<Connection>>,
}

impl DbHandle {
    /// Open (or create) the database file and apply the schema.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| {
                StorageError::unavailable(
                    format!("failed to create database directory {}", parent.display()),
                    source,
                )
            })?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Private in-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StorageResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        schema::migrate(&conn)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` inside an immediate (write) transaction on a blocking thread.
    pub async fn transaction<F, R, E>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&Tx<'_>) -> Result<R, E> + Send + 'static,
        R: Send + 'static,
        E: From<StorageError> + Send + 'static,
    {
        self.run(TransactionBehavior::Immediate, f).await
    }

    /// Run `f` inside a deferred (read) transaction on a blocking thread.
    pub async fn read<F, R, E>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&Tx<'_>) -> Result<R, E> + Send + 'static,
        R: Send + 'static,
        E: From<StorageError> + Send + 'static,
    {
        self.run(TransactionBehavior::Deferred, f).await
    }

    async fn run<F, R, E>(&self, behavior: TransactionBehavior, f: F) -> Result<R, E>
    where
        F: FnOnce(&Tx<'_>) -> Result<R, E> + Send + 'static,
        R: Send + 'static,
        E: From<StorageError> + Send + 'static,
    {
        let db = self.inner.clone();
        let deadline = DEADLINE.try_with(|deadline| *deadline).ok();
        tokio::task::spawn_blocking(move || {
            let mut conn = db.lock().map_err(|_| StorageError::LockPoisoned)?;
            let tx = conn
                .transaction_with_behavior(behavior)
                .map_err(StorageError::from)?;
            let value = f(&tx)?;
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                tx.rollback().map_err(StorageError::from)?;
                return Err(StorageError::DeadlineExceeded.into());
            }
            tx.commit().map_err(StorageError::from)?;
            Ok(value)
        })
        .await
        .map_err(|_| E::from(StorageError::TaskPanicked))?
    }

    /// Liveness check used by the health route.
    pub async fn ping(&self) -> StorageResult<()> {
        self.read(|tx| {
            tx.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }
}

/// Encode a timestamp for storage.
pub fn ts(value: OffsetDateTime) -> i64 {
    value.unix_timestamp()
}

pub(crate) fn conversion_error(
    idx: usize,
    kind: Type,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, kind, Box::new(err))
}

pub(crate) fn uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let text: String = row.get(idx)?;
    Uuid::parse_str(&text).map_err(|err| conversion_error(idx, Type::Text, err))
}

pub(crate) fn opt_uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|value| Uuid::parse_str(&value).map_err(|err| conversion_error(idx, Type::Text, err)))
        .transpose()
}

pub(crate) fn time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<OffsetDateTime> {
    let secs: i64 = row.get(idx)?;
    OffsetDateTime::from_unix_timestamp(secs).map_err(|err| conversion_error(idx, Type::Integer, err))
}

pub(crate) fn opt_time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<OffsetDateTime>> {
    let secs: Option<i64> = row.get(idx)?;
    secs.map(|value| {
        OffsetDateTime::from_unix_timestamp(value)
            .map_err(|err| conversion_error(idx, Type::Integer, err))
    })
    .transpose()
}

pub(crate) fn enum_at<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = ParseEnumError>,
{
    let text: String = row.get(idx)?;
    text.parse().map_err(|err| conversion_error(idx, Type::Text, err))
}

pub(crate) fn opt_enum_at<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr<Err = ParseEnumError>,
{
    let text: Option<String> = row.get(idx)?;
    text.map(|value| value.parse().map_err(|err| conversion_error(idx, Type::Text, err)))
        .transpose()
}

pub(crate) fn json_at<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|err| conversion_error(idx, Type::Text, err))
}

pub(crate) fn opt_json_at<T: DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|value| serde_json::from_str(&value).map_err(|err| conversion_error(idx, Type::Text, err)))
        .transpose()
}
