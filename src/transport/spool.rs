use std::{path::PathBuf, sync::Arc};

use futures::future::BoxFuture;
use tracing::info;

use super::{DeliveryEnvelope, Transport, TransportError};
use crate::dao::models::DeliveryChannel;

/// `physical_local` transport: writes artifacts into a print spool
/// directory as `{instance}/{turn}/{code}.pdf`.
///
/// Rewriting the same file on retry is harmless, which makes the transport
/// idempotent.
#[derive(Debug, Clone)]
pub struct LocalSpoolTransport {
    root: Arc<PathBuf>,
}

impl LocalSpoolTransport {
    /// Spool rooted at `root`, created on first delivery.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Arc::new(root.into()),
        }
    }

    /// Location an envelope is spooled to.
    pub fn path_for(&self, envelope: &DeliveryEnvelope) -> PathBuf {
        self.root
            .join(envelope.game_instance_id.to_string())
            .join(envelope.turn_number.to_string())
            .join(format!("{}.pdf", envelope.code))
    }
}

impl Transport for LocalSpoolTransport {
    fn channel(&self) -> DeliveryChannel {
        DeliveryChannel::PhysicalLocal
    }

    fn deliver(
        &self,
        envelope: Arc<DeliveryEnvelope>,
    ) -> BoxFuture<'static, Result<(), TransportError>> {
        let path = self.path_for(&envelope);
        Box::pin(async move {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, &envelope.artifact[..]).await?;
            info!(path = %path.display(), recipient = %envelope.recipient.name, "spooled sheet for printing");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::{sheets::code::SheetCode, transport::Recipient};

    fn envelope() -> DeliveryEnvelope {
        DeliveryEnvelope {
            turn_sheet_id: Uuid::new_v4(),
            game_instance_id: Uuid::new_v4(),
            turn_number: 2,
            channel: DeliveryChannel::PhysicalLocal,
            attempt_number: 1,
            code: SheetCode::parse("A1B2C0-ZZ2000").unwrap(),
            recipient: Recipient {
                account_id: Uuid::new_v4(),
                name: "Ann".into(),
                email: None,
                postal_address: None,
            },
            artifact: Arc::from(&b"%PDF-1.4 test"[..]),
            content_type: "application/pdf",
            digest: String::new(),
        }
    }

    #[tokio::test]
    async fn writes_artifact_under_instance_and_turn() {
        let dir = tempfile::tempdir().unwrap();
        let transport = LocalSpoolTransport::new(dir.path());
        let envelope = Arc::new(envelope());

        transport.deliver(envelope.clone()).await.unwrap();
        transport.deliver(envelope.clone()).await.unwrap();

        let path = transport.path_for(&envelope);
        assert!(path.ends_with(format!("2/{}.pdf", envelope.code)));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"%PDF-1.4 test");
    }
}
