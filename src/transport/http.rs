use std::{sync::Arc, time::Duration};

use futures::future::BoxFuture;
use reqwest::{Client, header};
use tracing::info;

use super::{DeliveryEnvelope, Transport, TransportError};
use crate::dao::models::DeliveryChannel;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport posting the artifact to a mailing service (email relay or print
/// and post API).
///
/// The artifact is the request body; addressing travels in the query string
/// and the `Idempotency-Key` header lets the service drop duplicates.
#[derive(Clone)]
pub struct HttpTransport {
    channel: DeliveryChannel,
    client: Client,
    endpoint: Arc<str>,
    api_key: Option<Arc<str>>,
}

impl HttpTransport {
    /// Transport for `channel` posting to `endpoint`.
    pub fn new(channel: DeliveryChannel, endpoint: &str, api_key: Option<&str>) -> Self {
        Self {
            channel,
            client: Client::new(),
            endpoint: Arc::from(endpoint),
            api_key: api_key.map(Arc::from),
        }
    }
}

impl Transport for HttpTransport {
    fn channel(&self) -> DeliveryChannel {
        self.channel
    }

    fn deliver(
        &self,
        envelope: Arc<DeliveryEnvelope>,
    ) -> BoxFuture<'static, Result<(), TransportError>> {
        let transport = self.clone();
        Box::pin(async move {
            let recipient = &envelope.recipient;
            let address = match transport.channel {
                DeliveryChannel::Email => recipient
                    .email
                    .as_deref()
                    .ok_or(TransportError::MissingAddress("email address"))?,
                _ => recipient
                    .postal_address
                    .as_deref()
                    .ok_or(TransportError::MissingAddress("postal address"))?,
            };
            let code = envelope.code.to_string();
            let turn = envelope.turn_number.to_string();

            let mut request = transport
                .client
                .post(transport.endpoint.as_ref())
                .query(&[
                    ("recipient", recipient.name.as_str()),
                    ("address", address),
                    ("code", code.as_str()),
                    ("turn", turn.as_str()),
                ])
                .header(header::CONTENT_TYPE, envelope.content_type)
                .header("Idempotency-Key", envelope.idempotency_key())
                .header("x-content-sha256", envelope.digest.as_str())
                .timeout(REQUEST_TIMEOUT)
                .body(envelope.artifact.to_vec());
            if let Some(key) = &transport.api_key {
                request = request.bearer_auth(key);
            }

            let response = request.send().await.map_err(|source| {
                if source.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Request { source }
                }
            })?;
            if !response.status().is_success() {
                return Err(TransportError::Rejected(response.status().as_u16()));
            }
            info!(channel = %transport.channel, %code, "handed sheet to mailing service");
            Ok(())
        })
    }
}
