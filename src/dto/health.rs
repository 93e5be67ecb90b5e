use serde::Serialize;
use utoipa::ToSchema;

/// Health response returned by the `/healthcheck` route.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Health status ("ok" or "degraded").
    pub status: String,
    /// Jobs queued or running, when the store answered.
    pub pending_jobs: Option<u64>,
}

impl HealthResponse {
    /// Create a health response indicating the system is operational.
    pub fn ok(pending_jobs: u64) -> Self {
        Self {
            status: "ok".to_string(),
            pending_jobs: Some(pending_jobs),
        }
    }

    /// Create a health response indicating the store is unreachable.
    pub fn degraded() -> Self {
        Self {
            status: "degraded".to_string(),
            pending_jobs: None,
        }
    }
}
