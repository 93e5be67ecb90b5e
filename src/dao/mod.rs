/// SQLite connection handle and row decoding helpers.
pub mod database;
/// Delivery attempt persistence.
pub mod deliveries;
/// Accounts, games, instances and subscriptions.
pub mod games;
/// Durable job queue persistence.
pub mod jobs;
/// Database model definitions.
pub mod models;
/// Row-level security scope.
pub mod rls;
/// Scan intake records.
pub mod scans;
/// Table and index definitions.
pub mod schema;
/// Storage error types.
pub mod storage;
/// Turn sheet store.
pub mod turn_sheets;

#[cfg(test)]
pub(crate) mod fixtures;
