use super::error::StripeError;
use super::types::StripeSubscription;
use super::StripeClient;

impl StripeClient {
    /// Cancel a recurring donation's subscription at the provider.
    ///
    /// The ledger is not touched here; the provider's
    /// `customer.subscription.deleted` webhook drives the local state
    /// change, the same as any other subscription event.
    pub async fn cancel_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<StripeSubscription, StripeError> {
        let path = format!("/v1/subscriptions/{}", subscription_id);
        self.delete(&path).await
    }
}
