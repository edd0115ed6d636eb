use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;

use crate::models::PaymentProvider;

/// Metadata key under which providers carry the donation id back-reference.
pub const DONATION_ID_KEY: &str = "donation_id";

/// What a provider notification means, normalized at the ingestion boundary.
///
/// The reconciliation engine only ever sees this union; raw webhook JSON
/// never crosses into the matching or transition logic.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    PaymentSucceeded,
    PaymentFailed,
    SubscriptionCreated {
        provider_status: String,
        period_end: Option<DateTime<Utc>>,
    },
    SubscriptionUpdated {
        provider_status: String,
        period_end: Option<DateTime<Utc>>,
    },
    SubscriptionCancelled,
    InvoicePaid {
        period_end: Option<DateTime<Utc>>,
    },
    InvoicePaymentFailed {
        failure_status: String,
    },
}

impl EventKind {
    /// Stable label used in logs, metrics, and orphan records.
    pub fn label(&self) -> &'static str {
        match self {
            EventKind::PaymentSucceeded => "payment_succeeded",
            EventKind::PaymentFailed => "payment_failed",
            EventKind::SubscriptionCreated { .. } => "subscription_created",
            EventKind::SubscriptionUpdated { .. } => "subscription_updated",
            EventKind::SubscriptionCancelled => "subscription_cancelled",
            EventKind::InvoicePaid { .. } => "invoice_paid",
            EventKind::InvoicePaymentFailed { .. } => "invoice_payment_failed",
        }
    }

    pub fn is_subscription_event(&self) -> bool {
        matches!(
            self,
            EventKind::SubscriptionCreated { .. }
                | EventKind::SubscriptionUpdated { .. }
                | EventKind::SubscriptionCancelled
        )
    }

    pub fn is_invoice_event(&self) -> bool {
        matches!(
            self,
            EventKind::InvoicePaid { .. } | EventKind::InvoicePaymentFailed { .. }
        )
    }
}

/// One normalized inbound provider notification.
#[derive(Debug, Clone)]
pub struct PaymentEvent {
    pub provider: PaymentProvider,
    /// Provider's own id for the notification itself (evt_...).
    pub event_id: String,
    pub kind: EventKind,
    /// Provider's id for the underlying payment or subscription object.
    pub provider_ref: String,
    /// For invoice events, the subscription the invoice belongs to.
    pub subscription_ref: Option<String>,
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    /// Arbitrary key-value bag; may carry a donation id back-reference.
    pub metadata: HashMap<String, String>,
    /// Provider-reported event creation time.
    pub created_at: DateTime<Utc>,
    /// Raw payload, kept only so orphan records can store full context.
    pub raw: JsonValue,
}

impl PaymentEvent {
    /// Donation id carried in the event metadata, if present and parseable.
    pub fn metadata_donation_id(&self) -> Option<i64> {
        self.metadata
            .get(DONATION_ID_KEY)
            .and_then(|v| v.parse::<i64>().ok())
    }

    /// Subscription ref to resolve by: invoice events carry it explicitly,
    /// subscription events are about the subscription object itself.
    pub fn subscription_ref(&self) -> &str {
        self.subscription_ref.as_deref().unwrap_or(&self.provider_ref)
    }
}
