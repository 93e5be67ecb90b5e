/// Admin request and response payloads.
pub mod admin;
/// Health check payload.
pub mod health;
/// Scan intake payloads.
pub mod scans;
