/// Time sources.
pub mod clock;
/// Legal turn sheet state changes.
pub mod lifecycle;
/// Per-instance advisory locks.
pub mod locks;
/// Turn phase machine of an instance.
pub mod turn_machine;

use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::Notify;

use crate::{
    config::AppConfig,
    dao::database::DbHandle,
    sheets::{code::CodeMint, registry::ProcessorRegistry},
    transport::TransportSet,
};

use self::{
    clock::{Clock, SystemClock},
    locks::InstanceLocks,
};

pub type SharedState = Arc<AppState>;

/// Central application state shared by HTTP handlers and queue workers.
///
/// Holds no per-turn data: the store and the job queue carry every durable
/// fact, so any worker may pick up any job.
pub struct AppState {
    db: DbHandle,
    registry: ProcessorRegistry,
    transports: TransportSet,
    config: AppConfig,
    clock: Arc<dyn Clock>,
    locks: InstanceLocks,
    mint: CodeMint,
    queue_signal: Notify,
}

impl AppState {
    /// Construct a new [`AppState`] wrapped in an [`Arc`] so it can be cloned cheaply.
    pub fn new(
        db: DbHandle,
        registry: ProcessorRegistry,
        transports: TransportSet,
        config: AppConfig,
    ) -> SharedState {
        Self::with_clock(db, registry, transports, config, Arc::new(SystemClock))
    }

    /// Same as [`AppState::new`] with an explicit time source.
    pub fn with_clock(
        db: DbHandle,
        registry: ProcessorRegistry,
        transports: TransportSet,
        config: AppConfig,
        clock: Arc<dyn Clock>,
    ) -> SharedState {
        Arc::new(Self {
            db,
            registry,
            transports,
            config,
            clock,
            locks: InstanceLocks::default(),
            mint: CodeMint,
            queue_signal: Notify::new(),
        })
    }

    /// Record store handle.
    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    /// Generators, scanners and rules per game type.
    pub fn registry(&self) -> &ProcessorRegistry {
        &self.registry
    }

    /// Delivery transports per channel.
    pub fn transports(&self) -> &TransportSet {
        &self.transports
    }

    /// Runtime configuration.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Per-instance advisory locks.
    pub fn locks(&self) -> &InstanceLocks {
        &self.locks
    }

    /// Turn sheet code issuer.
    pub fn mint(&self) -> &CodeMint {
        &self.mint
    }

    /// Current time according to the configured clock.
    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    /// Wake idle workers after new jobs were queued.
    pub fn notify_queue(&self) {
        self.queue_signal.notify_waiters();
    }

    /// Resolves on the next [`AppState::notify_queue`].
    pub async fn queue_notified(&self) {
        self.queue_signal.notified().await;
    }
}
