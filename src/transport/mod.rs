//! Delivery transports moving rendered sheets to players.
//!
//! Transports are treated as idempotent-capable: every envelope carries an
//! idempotency key stable across retries of the same `(sheet, channel)`, and
//! a transport must tolerate receiving the same envelope twice.

#[cfg(feature = "http-services")]
pub mod http;
pub mod recording;
pub mod spool;

use std::{collections::HashMap, sync::Arc};

use futures::future::BoxFuture;
use thiserror::Error;
use uuid::Uuid;

use crate::{dao::models::DeliveryChannel, sheets::code::SheetCode};

/// Who a sheet is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub account_id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub postal_address: Option<String>,
}

/// Everything a transport needs to deliver one attempt.
#[derive(Debug, Clone)]
pub struct DeliveryEnvelope {
    pub turn_sheet_id: Uuid,
    pub game_instance_id: Uuid,
    pub turn_number: u32,
    pub channel: DeliveryChannel,
    pub attempt_number: u32,
    pub code: SheetCode,
    pub recipient: Recipient,
    pub artifact: Arc<[u8]>,
    pub content_type: &'static str,
    pub digest: String,
}

impl DeliveryEnvelope {
    /// Key identifying the delivery across retries of the same channel.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.turn_sheet_id, self.channel)
    }
}

/// Why a transport did not accept an envelope.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The recipient lacks the address this channel needs.
    #[error("recipient has no {0}")]
    MissingAddress(&'static str),
    /// The remote service rejected the delivery.
    #[error("transport rejected delivery with status {0}")]
    Rejected(u16),
    /// The remote service did not answer in time.
    #[error("transport timed out")]
    Timeout,
    /// Writing the artifact locally failed.
    #[error("spool write failed")]
    Io(#[from] std::io::Error),
    /// The request could not be sent.
    #[cfg(feature = "http-services")]
    #[error("transport request failed")]
    Request {
        #[source]
        source: reqwest::Error,
    },
}

/// A delivery channel implementation.
pub trait Transport: Send + Sync {
    /// Channel served by this transport.
    fn channel(&self) -> DeliveryChannel;

    /// Hand the envelope to the channel.
    fn deliver(&self, envelope: Arc<DeliveryEnvelope>) -> BoxFuture<'static, Result<(), TransportError>>;
}

/// Transports keyed by the channel they serve.
#[derive(Clone, Default)]
pub struct TransportSet {
    transports: HashMap<DeliveryChannel, Arc<dyn Transport>>,
}

impl TransportSet {
    /// Install `transport` for its channel, replacing any previous one.
    pub fn insert(&mut self, transport: Arc<dyn Transport>) -> &mut Self {
        self.transports.insert(transport.channel(), transport);
        self
    }

    /// Transport of `channel`, if configured.
    pub fn get(&self, channel: DeliveryChannel) -> Option<Arc<dyn Transport>> {
        self.transports.get(&channel).cloned()
    }
}
