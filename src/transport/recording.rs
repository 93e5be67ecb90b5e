use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
};

use futures::future::BoxFuture;
use tracing::info;
use uuid::Uuid;

use super::{DeliveryEnvelope, Transport, TransportError};
use crate::dao::models::DeliveryChannel;

/// Delivery accepted by a [`RecordingTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedDelivery {
    pub turn_sheet_id: Uuid,
    pub attempt_number: u32,
    pub code: String,
    pub digest: String,
    pub idempotency_key: String,
}

#[derive(Debug, Default)]
struct Recorder {
    delivered: Vec<RecordedDelivery>,
    scripted: VecDeque<u16>,
    calls: usize,
}

/// In-memory transport that records what it accepts.
///
/// Serves the `fake` transport kind and lets tests script failures.
#[derive(Debug, Clone)]
pub struct RecordingTransport {
    channel: DeliveryChannel,
    recorder: Arc<Mutex<Recorder>>,
}

impl RecordingTransport {
    /// Transport for `channel` accepting everything.
    pub fn new(channel: DeliveryChannel) -> Self {
        Self {
            channel,
            recorder: Arc::default(),
        }
    }

    /// Reject the next `times` deliveries with `status`.
    pub fn fail_next(&self, times: usize, status: u16) {
        self.with(|recorder| recorder.scripted.extend(std::iter::repeat_n(status, times)));
    }

    /// Deliveries accepted so far.
    pub fn deliveries(&self) -> Vec<RecordedDelivery> {
        self.with(|recorder| recorder.delivered.clone())
    }

    /// Number of delivery calls, accepted or not.
    pub fn calls(&self) -> usize {
        self.with(|recorder| recorder.calls)
    }

    fn with<T>(&self, f: impl FnOnce(&mut Recorder) -> T) -> T {
        let mut recorder = self.recorder.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut recorder)
    }
}

impl Transport for RecordingTransport {
    fn channel(&self) -> DeliveryChannel {
        self.channel
    }

    fn deliver(
        &self,
        envelope: Arc<DeliveryEnvelope>,
    ) -> BoxFuture<'static, Result<(), TransportError>> {
        let outcome = self.with(|recorder| {
            recorder.calls += 1;
            if let Some(status) = recorder.scripted.pop_front() {
                return Err(TransportError::Rejected(status));
            }
            recorder.delivered.push(RecordedDelivery {
                turn_sheet_id: envelope.turn_sheet_id,
                attempt_number: envelope.attempt_number,
                code: envelope.code.to_string(),
                digest: envelope.digest.clone(),
                idempotency_key: envelope.idempotency_key(),
            });
            Ok(())
        });
        if outcome.is_ok() {
            info!(
                channel = %envelope.channel,
                code = %envelope.code,
                recipient = %envelope.recipient.name,
                "recorded delivery"
            );
        }
        Box::pin(async move { outcome })
    }
}
