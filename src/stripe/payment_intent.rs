use super::error::StripeError;
use super::types::{Metadata, PaymentIntent};
use super::StripeClient;

impl StripeClient {
    /// Create a payment intent for a one-off donation.
    ///
    /// The returned intent's `client_secret` goes back to the browser and is
    /// also stored locally as part of the composite payment reference.
    pub async fn create_payment_intent(
        &self,
        amount_minor: i64,
        currency: &str,
        description: Option<&str>,
        metadata: Option<Metadata>,
    ) -> Result<PaymentIntent, StripeError> {
        let mut params: Vec<(String, String)> = vec![
            ("amount".to_string(), amount_minor.to_string()),
            ("currency".to_string(), currency.to_lowercase()),
            (
                "automatic_payment_methods[enabled]".to_string(),
                "true".to_string(),
            ),
        ];
        if let Some(description) = description {
            params.push(("description".to_string(), description.to_string()));
        }
        if let Some(metadata) = metadata {
            for (key, value) in metadata {
                params.push((format!("metadata[{}]", key), value));
            }
        }

        self.post_form("/v1/payment_intents", &params).await
    }
}
