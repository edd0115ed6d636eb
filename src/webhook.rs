//! Webhook ingestion boundary: authenticate raw provider payloads and
//! normalize them into [`PaymentEvent`] values.
//!
//! Everything past this module works with the typed event union; raw JSON
//! shapes stop here.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use sha2::Sha256;

use crate::events::{EventKind, PaymentEvent, DONATION_ID_KEY};
use crate::models::PaymentProvider;

type HmacSha256 = Hmac<Sha256>;

/// Allowed clock skew between the signature timestamp and our clock.
const STRIPE_SIGNATURE_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("missing signature header")]
    Missing,

    #[error("invalid signature format")]
    Format,

    #[error("signature timestamp outside tolerance")]
    Expired,

    #[error("signature mismatch")]
    Mismatch,
}

#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("payload is not valid JSON: {0}")]
    Json(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Verify a Stripe webhook signature.
///
/// Stripe signs `"{timestamp}.{body}"` with HMAC-SHA256 and sends
/// `Stripe-Signature: t=<timestamp>,v1=<hex>`.
pub fn verify_stripe_signature(
    payload: &[u8],
    signature_header: Option<&str>,
    secret: &str,
) -> Result<(), SignatureError> {
    let header = signature_header.ok_or(SignatureError::Missing)?;

    let mut timestamp = "";
    let mut signature = "";
    for part in header.split(',') {
        if let Some(value) = part.trim().strip_prefix("t=") {
            timestamp = value;
        } else if let Some(value) = part.trim().strip_prefix("v1=") {
            signature = value;
        }
    }
    if timestamp.is_empty() || signature.is_empty() {
        return Err(SignatureError::Format);
    }

    // Reject stale timestamps to bound replay.
    let signed_at = timestamp.parse::<i64>().map_err(|_| SignatureError::Format)?;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| SignatureError::Format)?
        .as_secs() as i64;
    if (now - signed_at).abs() > STRIPE_SIGNATURE_TOLERANCE_SECS {
        return Err(SignatureError::Expired);
    }

    let signed_payload = format!("{}.{}", timestamp, String::from_utf8_lossy(payload));
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::Format)?;
    mac.update(signed_payload.as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());

    let received = hex::decode(signature).map_err(|_| SignatureError::Format)?;
    let expected = hex::decode(&expected).map_err(|_| SignatureError::Format)?;
    if constant_time_eq(&received, &expected) {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Verify a Square webhook signature.
///
/// Square signs `notification_url + body` with HMAC-SHA256 and sends the
/// base64 digest in `x-square-hmacsha256-signature`.
pub fn verify_square_signature(
    payload: &[u8],
    signature_header: Option<&str>,
    secret: &str,
    notification_url: &str,
) -> Result<(), SignatureError> {
    let header = signature_header.ok_or(SignatureError::Missing)?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::Format)?;
    mac.update(notification_url.as_bytes());
    mac.update(payload);
    let expected = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

    if constant_time_eq(header.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

fn str_field<'a>(value: &'a JsonValue, key: &'static str) -> Result<&'a str, NormalizeError> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or(NormalizeError::MissingField(key))
}

/// Minor units to a decimal amount. All supported currencies use two
/// decimal places.
fn minor_to_decimal(minor: i64) -> Decimal {
    Decimal::new(minor, 2)
}

fn metadata_map(value: Option<&JsonValue>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some(JsonValue::Object(obj)) = value {
        for (k, v) in obj {
            if let Some(s) = v.as_str() {
                map.insert(k.clone(), s.to_string());
            }
        }
    }
    map
}

fn unix_ts(value: Option<&JsonValue>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| v.as_i64())
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}

/// Normalize a Stripe event envelope. Returns `Ok(None)` for event types
/// the reconciliation engine does not consume.
pub fn normalize_stripe(raw: &JsonValue) -> Result<Option<PaymentEvent>, NormalizeError> {
    let event_id = str_field(raw, "id")?.to_string();
    let event_type = str_field(raw, "type")?;
    let object = raw
        .pointer("/data/object")
        .ok_or(NormalizeError::MissingField("data.object"))?;
    let created_at = unix_ts(raw.get("created")).unwrap_or_else(Utc::now);

    let kind = match event_type {
        "payment_intent.succeeded" => EventKind::PaymentSucceeded,
        "payment_intent.payment_failed" => EventKind::PaymentFailed,
        "customer.subscription.created" => EventKind::SubscriptionCreated {
            provider_status: str_field(object, "status")?.to_string(),
            period_end: unix_ts(object.get("current_period_end")),
        },
        "customer.subscription.updated" => EventKind::SubscriptionUpdated {
            provider_status: str_field(object, "status")?.to_string(),
            period_end: unix_ts(object.get("current_period_end")),
        },
        "customer.subscription.deleted" => EventKind::SubscriptionCancelled,
        "invoice.paid" | "invoice.payment_succeeded" => EventKind::InvoicePaid {
            period_end: unix_ts(object.get("period_end")),
        },
        "invoice.payment_failed" => EventKind::InvoicePaymentFailed {
            failure_status: "past_due".to_string(),
        },
        _ => return Ok(None),
    };

    let provider_ref = str_field(object, "id")?.to_string();
    let subscription_ref = object
        .get("subscription")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    // Payment intents report amount_received, invoices amount_paid; fall
    // back to the plain amount field.
    let amount = object
        .get("amount_received")
        .or_else(|| object.get("amount_paid"))
        .or_else(|| object.get("amount"))
        .and_then(|v| v.as_i64())
        .map(minor_to_decimal);
    let currency = object
        .get("currency")
        .and_then(|v| v.as_str())
        .map(|c| c.to_uppercase());

    Ok(Some(PaymentEvent {
        provider: PaymentProvider::Stripe,
        event_id,
        kind,
        provider_ref,
        subscription_ref,
        amount,
        currency,
        metadata: metadata_map(object.get("metadata")),
        created_at,
        raw: raw.clone(),
    }))
}

/// Normalize a Square event envelope. Square's `payment.updated` carries a
/// terminal payment status; other event types are not consumed.
pub fn normalize_square(raw: &JsonValue) -> Result<Option<PaymentEvent>, NormalizeError> {
    let event_id = str_field(raw, "event_id")?.to_string();
    let event_type = str_field(raw, "type")?;

    if event_type != "payment.updated" {
        return Ok(None);
    }

    let payment = raw
        .pointer("/data/object/payment")
        .ok_or(NormalizeError::MissingField("data.object.payment"))?;
    let status = str_field(payment, "status")?;

    let kind = match status {
        "COMPLETED" | "APPROVED" => EventKind::PaymentSucceeded,
        "FAILED" | "CANCELED" => EventKind::PaymentFailed,
        // Intermediate statuses carry no transition for us.
        _ => return Ok(None),
    };

    let provider_ref = str_field(payment, "id")?.to_string();
    let created_at = raw
        .get("created_at")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let amount = payment
        .pointer("/amount_money/amount")
        .and_then(|v| v.as_i64())
        .map(minor_to_decimal);
    let currency = payment
        .pointer("/amount_money/currency")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    // Square has no metadata bag on payments; the donation id rides in
    // reference_id, set when the payment link was created.
    let mut metadata = HashMap::new();
    if let Some(reference) = payment.get("reference_id").and_then(|v| v.as_str()) {
        metadata.insert(DONATION_ID_KEY.to_string(), reference.to_string());
    }

    Ok(Some(PaymentEvent {
        provider: PaymentProvider::Square,
        event_id,
        kind,
        provider_ref,
        subscription_ref: None,
        amount,
        currency,
        metadata,
        created_at,
        raw: raw.clone(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign_stripe(payload: &str, timestamp: i64, secret: &str) -> String {
        let signed_payload = format!("{}.{}", timestamp, payload);
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(signed_payload.as_bytes());
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn stripe_signature_roundtrip() {
        let secret = "whsec_test_secret";
        let payload = r#"{"type":"payment_intent.succeeded","data":{"object":{"id":"pi_123"}}}"#;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;

        let header = sign_stripe(payload, now, secret);
        assert!(verify_stripe_signature(payload.as_bytes(), Some(&header), secret).is_ok());
    }

    #[test]
    fn stripe_signature_rejects_tampering() {
        let secret = "whsec_test_secret";
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;

        let header = sign_stripe(r#"{"amount":100}"#, now, secret);
        let result = verify_stripe_signature(br#"{"amount":999}"#, Some(&header), secret);
        assert!(matches!(result, Err(SignatureError::Mismatch)));
    }

    #[test]
    fn stripe_signature_rejects_stale_timestamp() {
        let secret = "whsec_test_secret";
        let payload = r#"{"amount":100}"#;
        let header = sign_stripe(payload, 1_000_000, secret);
        let result = verify_stripe_signature(payload.as_bytes(), Some(&header), secret);
        assert!(matches!(result, Err(SignatureError::Expired)));
    }

    #[test]
    fn stripe_signature_rejects_missing_header() {
        let result = verify_stripe_signature(b"{}", None, "whsec_test_secret");
        assert!(matches!(result, Err(SignatureError::Missing)));
    }

    #[test]
    fn square_signature_roundtrip() {
        let secret = "sq_signature_key";
        let url = "https://donations.example.org/api/webhooks/square";
        let payload = br#"{"event_id":"evt_1"}"#;

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(url.as_bytes());
        mac.update(payload);
        let header = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        assert!(verify_square_signature(payload, Some(&header), secret, url).is_ok());
        assert!(verify_square_signature(payload, Some("bogus"), secret, url).is_err());
    }

    #[test]
    fn normalizes_stripe_payment_intent() {
        let raw = serde_json::json!({
            "id": "evt_1",
            "type": "payment_intent.succeeded",
            "created": 1_700_000_000,
            "data": {
                "object": {
                    "id": "pi_abc",
                    "amount": 5000,
                    "amount_received": 5000,
                    "currency": "aud",
                    "metadata": {"donation_id": "42"}
                }
            }
        });

        let event = normalize_stripe(&raw).unwrap().expect("consumed event");
        assert_eq!(event.kind, EventKind::PaymentSucceeded);
        assert_eq!(event.provider_ref, "pi_abc");
        assert_eq!(event.amount, Some("50.00".parse().unwrap()));
        assert_eq!(event.currency.as_deref(), Some("AUD"));
        assert_eq!(event.metadata_donation_id(), Some(42));
    }

    #[test]
    fn normalizes_stripe_invoice_with_subscription_ref() {
        let raw = serde_json::json!({
            "id": "evt_2",
            "type": "invoice.paid",
            "created": 1_700_000_000,
            "data": {
                "object": {
                    "id": "in_1",
                    "subscription": "sub_9",
                    "amount_paid": 2500,
                    "currency": "aud",
                    "period_end": 1_702_600_000
                }
            }
        });

        let event = normalize_stripe(&raw).unwrap().expect("consumed event");
        assert!(matches!(event.kind, EventKind::InvoicePaid { period_end: Some(_) }));
        assert_eq!(event.subscription_ref(), "sub_9");
        assert_eq!(event.amount, Some("25.00".parse().unwrap()));
    }

    #[test]
    fn unconsumed_stripe_type_is_skipped() {
        let raw = serde_json::json!({
            "id": "evt_3",
            "type": "charge.refunded",
            "data": {"object": {"id": "ch_1"}}
        });
        assert!(normalize_stripe(&raw).unwrap().is_none());
    }

    #[test]
    fn malformed_stripe_payload_is_an_error() {
        let raw = serde_json::json!({
            "id": "evt_4",
            "type": "payment_intent.succeeded",
            "data": {"object": {"amount": 100}}
        });
        assert!(matches!(
            normalize_stripe(&raw),
            Err(NormalizeError::MissingField("id"))
        ));
    }

    #[test]
    fn normalizes_square_payment() {
        let raw = serde_json::json!({
            "event_id": "sq_evt_1",
            "type": "payment.updated",
            "created_at": "2026-03-01T10:00:00Z",
            "data": {
                "object": {
                    "payment": {
                        "id": "sqpay_1",
                        "status": "COMPLETED",
                        "reference_id": "17",
                        "amount_money": {"amount": 7500, "currency": "AUD"}
                    }
                }
            }
        });

        let event = normalize_square(&raw).unwrap().expect("consumed event");
        assert_eq!(event.kind, EventKind::PaymentSucceeded);
        assert_eq!(event.provider_ref, "sqpay_1");
        assert_eq!(event.metadata_donation_id(), Some(17));
        assert_eq!(event.amount, Some("75.00".parse().unwrap()));
    }

    #[test]
    fn square_intermediate_status_is_skipped() {
        let raw = serde_json::json!({
            "event_id": "sq_evt_2",
            "type": "payment.updated",
            "data": {"object": {"payment": {"id": "sqpay_2", "status": "PENDING"}}}
        });
        assert!(normalize_square(&raw).unwrap().is_none());
    }
}
