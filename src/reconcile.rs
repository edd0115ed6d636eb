//! Reconciliation engine: interprets one inbound provider event and drives
//! the donation state machine.
//!
//! Providers re-deliver and reorder notifications freely, so every handler
//! here must be safe to run twice and safe to run out of order. Side effects
//! (case accumulation, receipt trigger) fire only when a guarded transition
//! actually applied, never merely because an event arrived.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{timeout, Duration};

use crate::events::{EventKind, PaymentEvent};
use crate::matcher::{match_event, MatchConfig, MatchOutcome};
use crate::models::{Donation, DonationStatus, NewOrphanEvent};
use crate::receipts::{trigger_receipt_async, ReceiptNotifier};
use crate::store::{
    CaseAccumulator, DonationLedger, OrphanLog, StoreResult, SubscriptionFields, Transition,
};

/// Keyed async locks serializing all read-then-write sequences per donation
/// id. Lock entries are retained for the life of the process; the map is
/// bounded by the number of donations touched by webhooks.
pub struct DonationLocks {
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
    acquire_timeout: Duration,
}

#[derive(Debug)]
pub struct LockTimeout;

impl DonationLocks {
    pub fn new(acquire_timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            acquire_timeout,
        }
    }

    pub async fn acquire(&self, donation_id: i64) -> Result<OwnedMutexGuard<()>, LockTimeout> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(donation_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        match timeout(self.acquire_timeout, lock.lock_owned()).await {
            Ok(guard) => Ok(guard),
            Err(_) => Err(LockTimeout),
        }
    }
}

/// What processing one event did; used for logging, metrics, and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed { donation_id: i64 },
    AlreadyCompleted { donation_id: i64 },
    MarkedFailed { donation_id: i64 },
    AlreadyFailed { donation_id: i64 },
    SubscriptionSynced { donation_id: i64 },
    RecurringChargeApplied { donation_id: i64 },
    RecurringChargeDuplicate { donation_id: i64 },
    RecurringChargeFailed { donation_id: i64 },
    Orphaned { orphan_id: i64 },
}

impl Outcome {
    /// Stable label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Completed { .. } => "completed",
            Outcome::AlreadyCompleted { .. } => "already_completed",
            Outcome::MarkedFailed { .. } => "marked_failed",
            Outcome::AlreadyFailed { .. } => "already_failed",
            Outcome::SubscriptionSynced { .. } => "subscription_synced",
            Outcome::RecurringChargeApplied { .. } => "recurring_charge_applied",
            Outcome::RecurringChargeDuplicate { .. } => "recurring_charge_duplicate",
            Outcome::RecurringChargeFailed { .. } => "recurring_charge_failed",
            Outcome::Orphaned { .. } => "orphaned",
        }
    }
}

pub struct ReconciliationEngine {
    ledger: Arc<dyn DonationLedger>,
    cases: Arc<dyn CaseAccumulator>,
    orphans: Arc<dyn OrphanLog>,
    receipts: Arc<dyn ReceiptNotifier>,
    match_config: MatchConfig,
    locks: DonationLocks,
}

impl ReconciliationEngine {
    pub fn new(
        ledger: Arc<dyn DonationLedger>,
        cases: Arc<dyn CaseAccumulator>,
        orphans: Arc<dyn OrphanLog>,
        receipts: Arc<dyn ReceiptNotifier>,
        match_config: MatchConfig,
    ) -> Self {
        Self {
            ledger,
            cases,
            orphans,
            receipts,
            match_config,
            locks: DonationLocks::new(Duration::from_secs(10)),
        }
    }

    /// Process one normalized provider event. Idempotent; never returns an
    /// error for an unmatchable event (those go to the orphan log), only for
    /// storage failures the caller should log.
    pub async fn process(&self, event: PaymentEvent) -> StoreResult<Outcome> {
        let donation = match self.resolve(&event).await? {
            Resolution::Found(donation) => donation,
            Resolution::NotFound(reason) => {
                return self.orphan(&event, reason).await;
            }
        };

        let donation_id = donation.id;
        let _guard = match self.locks.acquire(donation_id).await {
            Ok(guard) => guard,
            Err(LockTimeout) => {
                tracing::warn!(
                    donation_id,
                    event_id = %event.event_id,
                    "timed out waiting for donation lock"
                );
                return self.orphan(&event, "timed out waiting for donation lock").await;
            }
        };

        // Re-read inside the critical section; the snapshot used for
        // matching may predate a concurrent event for the same donation.
        let Some(donation) = self.ledger.get_by_id(donation_id).await? else {
            return self.orphan(&event, "donation disappeared during processing").await;
        };

        match &event.kind {
            EventKind::PaymentSucceeded => self.apply_payment_succeeded(&event, &donation).await,
            EventKind::PaymentFailed => self.apply_payment_failed(&event, &donation).await,
            EventKind::SubscriptionCreated {
                provider_status,
                period_end,
            }
            | EventKind::SubscriptionUpdated {
                provider_status,
                period_end,
            } => {
                self.apply_subscription_sync(&event, &donation, provider_status, *period_end)
                    .await
            }
            EventKind::SubscriptionCancelled => {
                self.apply_subscription_sync(&event, &donation, "canceled", None)
                    .await
            }
            EventKind::InvoicePaid { period_end } => {
                self.apply_invoice_paid(&event, &donation, *period_end).await
            }
            EventKind::InvoicePaymentFailed { failure_status } => {
                self.apply_invoice_failed(&event, &donation, failure_status)
                    .await
            }
        }
    }

    /// Find the donation an event refers to. Subscription events resolve via
    /// metadata then subscription ref; invoice events via subscription ref
    /// then metadata (the linking subscription event may not have arrived
    /// yet); payment events run the full matching cascade.
    async fn resolve(&self, event: &PaymentEvent) -> StoreResult<Resolution> {
        if event.kind.is_subscription_event() {
            if let Some(id) = event.metadata_donation_id() {
                if let Some(donation) = self.ledger.get_by_id(id).await? {
                    return Ok(Resolution::Found(donation));
                }
            }
            if let Some(donation) = self
                .ledger
                .get_by_subscription_ref(event.subscription_ref())
                .await?
            {
                return Ok(Resolution::Found(donation));
            }
            return Ok(Resolution::NotFound("no donation for subscription ref"));
        }

        if event.kind.is_invoice_event() {
            if let Some(donation) = self
                .ledger
                .get_by_subscription_ref(event.subscription_ref())
                .await?
            {
                return Ok(Resolution::Found(donation));
            }
            if let Some(id) = event.metadata_donation_id() {
                if let Some(donation) = self.ledger.get_by_id(id).await? {
                    return Ok(Resolution::Found(donation));
                }
            }
            return Ok(Resolution::NotFound("no donation for invoice subscription ref"));
        }

        match match_event(self.ledger.as_ref(), event, &self.match_config).await? {
            MatchOutcome::Matched { donation, strategy } => {
                tracing::debug!(
                    donation_id = donation.id,
                    event_id = %event.event_id,
                    strategy = strategy.as_str(),
                    "matched event to donation"
                );
                Ok(Resolution::Found(donation))
            }
            MatchOutcome::Ambiguous { candidates } => {
                tracing::warn!(
                    event_id = %event.event_id,
                    provider_ref = %event.provider_ref,
                    candidates,
                    "ambiguous proximity match, refusing to guess"
                );
                Ok(Resolution::NotFound("ambiguous proximity match"))
            }
            MatchOutcome::NoMatch => Ok(Resolution::NotFound("no matching strategy succeeded")),
        }
    }

    async fn apply_payment_succeeded(
        &self,
        event: &PaymentEvent,
        donation: &Donation,
    ) -> StoreResult<Outcome> {
        match self
            .ledger
            .transition_status(donation.id, DonationStatus::Completed, Some(&event.provider_ref))
            .await?
        {
            Transition::Applied(updated) => {
                tracing::info!(
                    donation_id = updated.id,
                    amount = %updated.amount,
                    currency = %updated.currency,
                    "donation completed"
                );
                if let Some(case_id) = updated.case_id {
                    self.accumulate(case_id, &updated).await;
                }
                trigger_receipt_async(self.receipts.clone(), updated.clone());
                Ok(Outcome::Completed {
                    donation_id: updated.id,
                })
            }
            Transition::Unchanged(existing) => {
                tracing::info!(
                    donation_id = existing.id,
                    event_id = %event.event_id,
                    "donation already completed, ignoring redelivery"
                );
                Ok(Outcome::AlreadyCompleted {
                    donation_id: existing.id,
                })
            }
            Transition::NotFound => {
                self.orphan(event, "donation disappeared during processing").await
            }
        }
    }

    async fn apply_payment_failed(
        &self,
        event: &PaymentEvent,
        donation: &Donation,
    ) -> StoreResult<Outcome> {
        match self
            .ledger
            .transition_status(donation.id, DonationStatus::Failed, Some(&event.provider_ref))
            .await?
        {
            Transition::Applied(updated) => {
                tracing::info!(donation_id = updated.id, "donation marked failed");
                Ok(Outcome::MarkedFailed {
                    donation_id: updated.id,
                })
            }
            Transition::Unchanged(existing) => Ok(Outcome::AlreadyFailed {
                donation_id: existing.id,
            }),
            Transition::NotFound => {
                self.orphan(event, "donation disappeared during processing").await
            }
        }
    }

    async fn apply_subscription_sync(
        &self,
        event: &PaymentEvent,
        donation: &Donation,
        provider_status: &str,
        period_end: Option<chrono::DateTime<chrono::Utc>>,
    ) -> StoreResult<Outcome> {
        let fields = SubscriptionFields {
            subscription_ref: Some(event.subscription_ref().to_string()),
            subscription_status: Some(provider_status.to_string()),
            next_charge_at: period_end,
        };
        if self
            .ledger
            .set_subscription_fields(donation.id, fields)
            .await?
            .is_none()
        {
            return self.orphan(event, "donation disappeared during processing").await;
        }

        if let Some(derived) = derive_subscription_status(provider_status) {
            self.ledger
                .transition_status(donation.id, derived, None)
                .await?;
        }

        tracing::info!(
            donation_id = donation.id,
            subscription_ref = %event.subscription_ref(),
            provider_status,
            "subscription state synced"
        );
        Ok(Outcome::SubscriptionSynced {
            donation_id: donation.id,
        })
    }

    async fn apply_invoice_paid(
        &self,
        event: &PaymentEvent,
        donation: &Donation,
        period_end: Option<chrono::DateTime<chrono::Utc>>,
    ) -> StoreResult<Outcome> {
        // Same billing period already recorded means this is a redelivery;
        // refresh fields but do not credit the case a second time.
        let duplicate = period_end.is_some() && donation.next_charge_at == period_end;

        let fields = SubscriptionFields {
            subscription_ref: donation
                .subscription_ref
                .clone()
                .or_else(|| Some(event.subscription_ref().to_string())),
            subscription_status: donation.subscription_status.clone(),
            next_charge_at: period_end.or(donation.next_charge_at),
        };
        if self
            .ledger
            .set_subscription_fields(donation.id, fields)
            .await?
            .is_none()
        {
            return self.orphan(event, "donation disappeared during processing").await;
        }

        if duplicate {
            tracing::info!(
                donation_id = donation.id,
                event_id = %event.event_id,
                "recurring charge already recorded for this period, ignoring redelivery"
            );
            return Ok(Outcome::RecurringChargeDuplicate {
                donation_id: donation.id,
            });
        }

        if let Some(case_id) = donation.case_id {
            match event.amount {
                Some(amount) => {
                    let credited = Donation {
                        amount,
                        ..donation.clone()
                    };
                    self.accumulate(case_id, &credited).await;
                }
                None => {
                    tracing::warn!(
                        donation_id = donation.id,
                        event_id = %event.event_id,
                        "invoice event carried no amount, skipping case accumulation"
                    );
                }
            }
        }

        tracing::info!(
            donation_id = donation.id,
            next_charge_at = ?period_end,
            "recurring charge applied"
        );
        Ok(Outcome::RecurringChargeApplied {
            donation_id: donation.id,
        })
    }

    async fn apply_invoice_failed(
        &self,
        event: &PaymentEvent,
        donation: &Donation,
        failure_status: &str,
    ) -> StoreResult<Outcome> {
        // The subscription persists; only this cycle failed. Ledger status
        // is deliberately left alone.
        let fields = SubscriptionFields {
            subscription_ref: donation
                .subscription_ref
                .clone()
                .or_else(|| Some(event.subscription_ref().to_string())),
            subscription_status: Some(failure_status.to_string()),
            next_charge_at: donation.next_charge_at,
        };
        if self
            .ledger
            .set_subscription_fields(donation.id, fields)
            .await?
            .is_none()
        {
            return self.orphan(event, "donation disappeared during processing").await;
        }

        tracing::warn!(
            donation_id = donation.id,
            failure_status,
            "recurring charge failed"
        );
        Ok(Outcome::RecurringChargeFailed {
            donation_id: donation.id,
        })
    }

    /// Credit a case total. Failures here are logged per stage and never
    /// roll back the donation transition that preceded them.
    async fn accumulate(&self, case_id: i64, donation: &Donation) {
        match self.cases.add_to_collected(case_id, donation.amount).await {
            Ok(Some(case)) => {
                tracing::info!(
                    case_id,
                    donation_id = donation.id,
                    collected = %case.amount_collected,
                    required = %case.amount_required,
                    "case total updated"
                );
            }
            Ok(None) => {
                tracing::warn!(
                    case_id,
                    donation_id = donation.id,
                    "linked case not found, skipping accumulation"
                );
            }
            Err(e) => {
                tracing::error!(
                    case_id,
                    donation_id = donation.id,
                    error = %e,
                    "case accumulation failed after donation completion"
                );
            }
        }
    }

    async fn orphan(&self, event: &PaymentEvent, reason: &str) -> StoreResult<Outcome> {
        let record = self
            .orphans
            .record(NewOrphanEvent {
                provider: event.provider,
                event_type: event.kind.label().to_string(),
                provider_ref: Some(event.provider_ref.clone()),
                amount: event.amount,
                currency: event.currency.clone(),
                provider_status: provider_status_of(&event.kind),
                payload: event.raw.clone(),
                note: Some(reason.to_string()),
                event_created_at: Some(event.created_at),
            })
            .await?;

        tracing::warn!(
            orphan_id = record.id,
            event_id = %event.event_id,
            provider = event.provider.as_str(),
            event_type = event.kind.label(),
            provider_ref = %event.provider_ref,
            reason,
            "event orphaned for manual follow-up"
        );
        Ok(Outcome::Orphaned {
            orphan_id: record.id,
        })
    }
}

enum Resolution {
    Found(Donation),
    NotFound(&'static str),
}

/// Map a provider-reported subscription status onto the donation state
/// machine. Unknown provider states leave the status untouched.
fn derive_subscription_status(provider_status: &str) -> Option<DonationStatus> {
    match provider_status {
        "active" | "trialing" => Some(DonationStatus::ActiveSubscription),
        "canceled" | "cancelled" | "expired" => Some(DonationStatus::SubscriptionCancelled),
        _ => None,
    }
}

fn provider_status_of(kind: &EventKind) -> Option<String> {
    match kind {
        EventKind::SubscriptionCreated { provider_status, .. }
        | EventKind::SubscriptionUpdated { provider_status, .. } => Some(provider_status.clone()),
        EventKind::SubscriptionCancelled => Some("canceled".to_string()),
        EventKind::InvoicePaymentFailed { failure_status } => Some(failure_status.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_status_mapping() {
        assert_eq!(
            derive_subscription_status("active"),
            Some(DonationStatus::ActiveSubscription)
        );
        assert_eq!(
            derive_subscription_status("trialing"),
            Some(DonationStatus::ActiveSubscription)
        );
        assert_eq!(
            derive_subscription_status("canceled"),
            Some(DonationStatus::SubscriptionCancelled)
        );
        assert_eq!(
            derive_subscription_status("cancelled"),
            Some(DonationStatus::SubscriptionCancelled)
        );
        assert_eq!(
            derive_subscription_status("expired"),
            Some(DonationStatus::SubscriptionCancelled)
        );
        assert_eq!(derive_subscription_status("past_due"), None);
    }

    #[tokio::test]
    async fn keyed_locks_serialize_per_donation() {
        let locks = DonationLocks::new(Duration::from_millis(50));

        let guard = locks.acquire(1).await.expect("first acquire");
        // Same key blocks until timeout while the guard is held.
        assert!(locks.acquire(1).await.is_err());
        // A different key is independent.
        assert!(locks.acquire(2).await.is_ok());

        drop(guard);
        assert!(locks.acquire(1).await.is_ok());
    }
}
