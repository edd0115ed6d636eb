#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::Router;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use http_body_util::BodyExt;
use sha2::Sha256;
use tokio::sync::mpsc;

use donations_rs::events::{EventKind, PaymentEvent};
use donations_rs::matcher::MatchConfig;
use donations_rs::metrics::Metrics;
use donations_rs::models::{
    Donation, DonationFrequency, DonationKind, DonationStatus, PaymentProvider,
};
use donations_rs::receipts::{ReceiptError, ReceiptNotifier};
use donations_rs::reconcile::ReconciliationEngine;
use donations_rs::routes::{router, AppState};
use donations_rs::store::MemoryStore;

pub const TEST_STRIPE_SECRET: &str = "whsec_test_secret";
pub const TEST_SQUARE_SECRET: &str = "sq_test_signature_key";
pub const TEST_SQUARE_URL: &str = "https://donations.example.org/api/webhooks/square";

/// Receipt notifier that reports each trigger on a channel, so tests can
/// assert the trigger fired exactly once (or not at all).
pub struct RecordingReceipts {
    tx: mpsc::UnboundedSender<i64>,
}

#[async_trait::async_trait]
impl ReceiptNotifier for RecordingReceipts {
    async fn notify(&self, donation: &Donation) -> Result<(), ReceiptError> {
        let _ = self.tx.send(donation.id);
        Ok(())
    }
}

/// Engine + store wired over in-memory state, mirroring production wiring.
pub struct Harness {
    pub store: MemoryStore,
    pub engine: Arc<ReconciliationEngine>,
    pub receipts: mpsc::UnboundedReceiver<i64>,
}

pub fn harness() -> Harness {
    harness_with(MatchConfig::default())
}

pub fn harness_with(match_config: MatchConfig) -> Harness {
    let store = MemoryStore::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let engine = Arc::new(ReconciliationEngine::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(RecordingReceipts { tx }),
        match_config,
    ));
    Harness {
        store,
        engine,
        receipts: rx,
    }
}

/// Full HTTP app over in-memory state.
pub struct TestApp {
    pub app: Router,
    pub store: MemoryStore,
    pub receipts: mpsc::UnboundedReceiver<i64>,
}

pub fn test_app(stripe_secret: Option<&str>, square_secret: Option<&str>) -> TestApp {
    let Harness {
        store,
        engine,
        receipts,
    } = harness();

    let state = AppState {
        ledger: Arc::new(store.clone()),
        cases: Arc::new(store.clone()),
        orphans: Arc::new(store.clone()),
        engine,
        stripe: None,
        square: None,
        stripe_webhook_secret: stripe_secret.map(str::to_string),
        square_webhook_secret: square_secret.map(str::to_string),
        square_notification_url: square_secret.map(|_| TEST_SQUARE_URL.to_string()),
        metrics: Metrics::new(),
        db: None,
    };

    TestApp {
        app: router(state),
        store,
        receipts,
    }
}

/// A fully-formed donation row for seeding via `MemoryStore::put_donation`.
pub fn donation(id: i64, amount: &str, status: DonationStatus) -> Donation {
    let now = Utc::now();
    Donation {
        id,
        amount: amount.parse().expect("decimal amount"),
        currency: "AUD".to_string(),
        kind: DonationKind::General,
        frequency: DonationFrequency::OneOff,
        status,
        provider: PaymentProvider::Stripe,
        external_payment_ref: None,
        subscription_ref: None,
        subscription_status: None,
        next_charge_at: None,
        case_id: None,
        destination_label: None,
        donor_email: Some("donor@example.org".to_string()),
        donor_name: Some("Test Donor".to_string()),
        created_at: now,
        updated_at: now,
    }
}

/// Normalized event with just the fields a test cares about filled in.
pub fn payment_event(kind: EventKind, provider_ref: &str) -> PaymentEvent {
    PaymentEvent {
        provider: PaymentProvider::Stripe,
        event_id: format!("evt_{}", uuid::Uuid::new_v4()),
        kind,
        provider_ref: provider_ref.to_string(),
        subscription_ref: None,
        amount: None,
        currency: Some("AUD".to_string()),
        metadata: HashMap::new(),
        created_at: Utc::now(),
        raw: serde_json::json!({}),
    }
}

pub fn succeeded_event(provider_ref: &str, amount: &str) -> PaymentEvent {
    let mut event = payment_event(EventKind::PaymentSucceeded, provider_ref);
    event.amount = Some(amount.parse().expect("decimal amount"));
    event
}

/// Generate a Stripe-format HMAC signature header for a webhook payload.
pub fn stripe_signature(payload: &str, timestamp: i64, secret: &str) -> String {
    let signed_payload = format!("{}.{}", timestamp, payload);
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(signed_payload.as_bytes());
    format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    )
}

/// Generate a Square-format base64 HMAC signature for a webhook payload.
pub fn square_signature(payload: &[u8], secret: &str, notification_url: &str) -> String {
    use base64::Engine as _;
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(notification_url.as_bytes());
    mac.update(payload);
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

/// Read response body as JSON.
pub async fn body_json(response: axum::http::Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Assert a receipt trigger arrived for the given donation id.
pub async fn expect_receipt(rx: &mut mpsc::UnboundedReceiver<i64>, donation_id: i64) {
    let received = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for receipt trigger")
        .expect("receipt channel closed");
    assert_eq!(received, donation_id);
}

/// Assert no further receipt trigger arrives.
pub async fn expect_no_receipt(rx: &mut mpsc::UnboundedReceiver<i64>) {
    let result =
        tokio::time::timeout(std::time::Duration::from_millis(100), rx.recv()).await;
    assert!(result.is_err(), "unexpected receipt trigger");
}

pub fn utc(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).expect("valid timestamp")
}
