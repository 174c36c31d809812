use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the consumer is gone.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!("{}", e);
        }
    }
}

/// Domain events published by the storefront services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        provider: String,
        total: Decimal,
    },
    OrderPaid {
        order_id: Uuid,
        provider_reference: String,
    },
    OrderFailed(Uuid),
    OrderCancelled(Uuid),
    OrderExpired(Uuid),
    CouponRedeemed {
        order_id: Uuid,
        code: String,
    },
    DownloadCredentialIssued {
        credential_id: Uuid,
        order_id: Uuid,
        product_id: Uuid,
    },
    DownloadRedeemed {
        credential_id: Uuid,
        product_id: Uuid,
        first_redemption: bool,
    },
    /// Money was captured but the order could not be persisted.
    ReconciliationFailed {
        order_id: Uuid,
        provider: String,
        provider_reference: String,
        reason: String,
    },
    ReviewSubmitted {
        product_id: Uuid,
        rating: i32,
    },
}

/// Consumes published events until every sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::ReconciliationFailed {
                order_id,
                provider,
                provider_reference,
                reason,
            } => {
                error!(
                    order_id = %order_id,
                    provider = %provider,
                    provider_reference = %provider_reference,
                    reason = %reason,
                    "ALERT: captured payment requires manual reconciliation"
                );
            }
            other => info!(event = ?other, "Received event"),
        }
    }

    info!("Event processing loop stopped");
}
