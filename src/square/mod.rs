//! Minimal Square client: one-off donations pay through a hosted payment
//! link; everything else about a Square payment reaches us via webhooks.

use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SquareError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("API error (status {status_code}): {message}")]
    ApiError { status_code: u16, message: String },

    #[error("Parse error: {0}")]
    ParseError(String),
}

/// Configuration for the Square API client
#[derive(Debug, Clone)]
pub struct SquareConfig {
    pub access_token: String,
    pub location_id: String,
    pub base_path: String,
}

impl SquareConfig {
    pub fn new(access_token: String, location_id: String) -> Self {
        SquareConfig {
            access_token,
            location_id,
            base_path: "https://connect.squareup.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentLink {
    pub id: String,
    pub url: String,
    pub order_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreatePaymentLinkResponse {
    payment_link: PaymentLink,
}

/// Square API client, constructed once at process start and shared.
#[derive(Clone)]
pub struct SquareClient {
    config: Arc<SquareConfig>,
    http_client: Client,
}

impl SquareClient {
    pub fn new(config: SquareConfig) -> Result<Self, SquareError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SquareError::HttpError(e.to_string()))?;

        Ok(SquareClient {
            config: Arc::new(config),
            http_client,
        })
    }

    /// Create a hosted payment link for a one-off donation.
    ///
    /// The donation id is carried in the order's `reference_id`, which comes
    /// back on the resulting payment and lets the webhook normalizer hand
    /// the matcher an explicit back-reference.
    pub async fn create_payment_link(
        &self,
        donation_id: i64,
        amount_minor: i64,
        currency: &str,
        label: &str,
    ) -> Result<PaymentLink, SquareError> {
        let body = serde_json::json!({
            "idempotency_key": Uuid::new_v4().to_string(),
            "order": {
                "location_id": self.config.location_id,
                "reference_id": donation_id.to_string(),
                "line_items": [{
                    "name": label,
                    "quantity": "1",
                    "base_price_money": {
                        "amount": amount_minor,
                        "currency": currency,
                    }
                }]
            }
        });

        let url = format!("{}/v2/online-checkout/payment-links", self.config.base_path);
        let response = self
            .http_client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.access_token))
            .json(&body)
            .send()
            .await
            .map_err(|e| SquareError::HttpError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            return Err(SquareError::ApiError {
                status_code: status.as_u16(),
                message: error_body,
            });
        }

        let parsed: CreatePaymentLinkResponse = response
            .json()
            .await
            .map_err(|e| SquareError::ParseError(e.to_string()))?;
        Ok(parsed.payment_link)
    }
}
