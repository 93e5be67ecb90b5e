/// Admin service for game, instance and subscription management.
pub mod admin_service;
/// Delivery dispatcher: per-channel attempts with retry and backoff.
pub mod dispatcher;
/// OpenAPI documentation generation.
pub mod documentation;
/// Health check service.
pub mod health_service;
/// Scan intake: reading returned sheets and binding their choices.
pub mod intake;
/// Pipeline jobs, natural keys and retry policy.
pub mod jobs;
/// Turn orchestrator: opening, emitting and resolving turns.
pub mod orchestrator;
/// Queue workers running pipeline jobs.
pub mod worker;
