//! Tax receipt issuance trigger.
//!
//! Receipt rendering and delivery live in a separate service; our contract
//! with it is notify once, asynchronously, and never let its outcome block
//! or fail the event that triggered it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::Donation;

#[derive(Debug, thiserror::Error)]
pub enum ReceiptError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("receipt service responded with status {0}")]
    Status(u16),
}

#[async_trait]
pub trait ReceiptNotifier: Send + Sync {
    async fn notify(&self, donation: &Donation) -> Result<(), ReceiptError>;
}

/// POSTs a receipt request to the configured receipt service.
pub struct HttpReceiptNotifier {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpReceiptNotifier {
    pub fn new(endpoint: String) -> Result<Self, ReceiptError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ReceiptError::Http(e.to_string()))?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl ReceiptNotifier for HttpReceiptNotifier {
    async fn notify(&self, donation: &Donation) -> Result<(), ReceiptError> {
        let body = serde_json::json!({
            "request_id": Uuid::new_v4(),
            "donation_id": donation.id,
            "amount": donation.amount,
            "currency": donation.currency,
            "donor_name": donation.donor_name,
            "donor_email": donation.donor_email,
            "completed_at": donation.updated_at,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| ReceiptError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ReceiptError::Status(status.as_u16()));
        }
        Ok(())
    }
}

/// Used when no receipt service is configured; logs the trigger and moves on.
pub struct NoopReceiptNotifier;

#[async_trait]
impl ReceiptNotifier for NoopReceiptNotifier {
    async fn notify(&self, donation: &Donation) -> Result<(), ReceiptError> {
        tracing::info!(
            donation_id = donation.id,
            "receipt service not configured, skipping receipt trigger"
        );
        Ok(())
    }
}

/// Fire-and-forget receipt trigger: spawns the notification and logs any
/// failure without surfacing it to the caller.
pub fn trigger_receipt_async(notifier: Arc<dyn ReceiptNotifier>, donation: Donation) {
    tokio::spawn(async move {
        if let Err(e) = notifier.notify(&donation).await {
            tracing::warn!(
                donation_id = donation.id,
                error = %e,
                "receipt trigger failed"
            );
        }
    });
}
