pub mod error;
pub mod payment_intent;
pub mod subscription;
pub mod types;

use error::StripeError;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for the Stripe API client
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub base_path: String,
}

impl StripeConfig {
    pub fn new(secret_key: String) -> Self {
        StripeConfig {
            secret_key,
            base_path: "https://api.stripe.com".to_string(),
        }
    }
}

/// Stripe API client. Constructed once at process start and shared;
/// requests are form-encoded per Stripe's API conventions.
#[derive(Clone)]
pub struct StripeClient {
    config: Arc<StripeConfig>,
    http_client: Client,
}

impl StripeClient {
    /// Create a new Stripe client with the given configuration
    pub fn new(config: StripeConfig) -> Result<Self, StripeError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| StripeError::HttpError(e.to_string()))?;

        Ok(StripeClient {
            config: Arc::new(config),
            http_client,
        })
    }

    /// Make a form-encoded POST request to the Stripe API
    pub(crate) async fn post_form<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> Result<T, StripeError> {
        let url = format!("{}{}", self.config.base_path, path);
        let response = self
            .http_client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.secret_key))
            .header("Stripe-Version", "2024-06-20")
            .form(params)
            .send()
            .await
            .map_err(|e| StripeError::HttpError(e.to_string()))?;

        self.handle_response(response).await
    }

    /// Make a DELETE request to the Stripe API
    pub(crate) async fn delete<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, StripeError> {
        let url = format!("{}{}", self.config.base_path, path);
        let response = self
            .http_client
            .delete(&url)
            .header("Authorization", format!("Bearer {}", self.config.secret_key))
            .header("Stripe-Version", "2024-06-20")
            .send()
            .await
            .map_err(|e| StripeError::HttpError(e.to_string()))?;

        self.handle_response(response).await
    }

    /// Handle HTTP response and convert to appropriate type or error
    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, StripeError> {
        let status = response.status();

        if status.is_success() {
            response
                .json::<T>()
                .await
                .map_err(|e| StripeError::ParseError(e.to_string()))
        } else {
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());

            Err(StripeError::ApiError {
                status_code: status.as_u16(),
                message: error_body,
            })
        }
    }
}
