use tracing::warn;

use crate::{
    dao::jobs,
    dto::health::HealthResponse,
    state::SharedState,
};

/// Ping the record store and report the queue depth.
pub async fn health_status(state: &SharedState) -> HealthResponse {
    if let Err(err) = state.db().ping().await {
        warn!(error = %err, "storage health check failed");
        return HealthResponse::degraded();
    }
    match state.db().read(|tx| jobs::pending_count(tx)).await {
        Ok(pending) => HealthResponse::ok(pending),
        Err(err) => {
            warn!(error = %err, "could not count pending jobs");
            HealthResponse::degraded()
        }
    }
}
