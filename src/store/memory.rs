//! In-memory implementation of the store traits for testing and development.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use super::{
    CaseAccumulator, DonationLedger, OrphanLog, StoreResult, SubscriptionFields, Transition,
};
use crate::models::{
    Case, Donation, DonationStatus, NewCase, NewDonation, NewOrphanEvent, OrphanEvent,
    OrphanStatus,
};

#[derive(Default)]
struct Inner {
    donations: HashMap<i64, Donation>,
    cases: HashMap<i64, Case>,
    orphans: HashMap<i64, OrphanEvent>,
    next_donation_id: i64,
    next_case_id: i64,
    next_orphan_id: i64,
}

/// Store implementation backed by in-process maps.
///
/// Suitable for:
/// - Unit and integration tests (no external dependencies)
/// - Local development without Docker
///
/// One mutex guards all state, so every operation is serialized; the
/// compare-and-set semantics of `transition_status` therefore match the
/// Postgres implementation.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully-formed donation, overwriting any row with the same id.
    /// Test seam: lets tests seed rows with specific statuses, refs, and
    /// timestamps without going through the creation flow.
    pub async fn put_donation(&self, donation: Donation) {
        let mut inner = self.inner.lock().await;
        inner.next_donation_id = inner.next_donation_id.max(donation.id);
        inner.donations.insert(donation.id, donation);
    }
}

fn sorted_by_id(mut donations: Vec<Donation>) -> Vec<Donation> {
    donations.sort_by_key(|d| d.id);
    donations
}

#[async_trait]
impl DonationLedger for MemoryStore {
    async fn create_donation(&self, new: NewDonation) -> StoreResult<Donation> {
        let mut inner = self.inner.lock().await;
        inner.next_donation_id += 1;
        let now = Utc::now();
        let donation = Donation {
            id: inner.next_donation_id,
            amount: new.amount,
            currency: new.currency,
            kind: new.kind,
            frequency: new.frequency,
            status: DonationStatus::Pending,
            provider: new.provider,
            external_payment_ref: new.external_payment_ref,
            subscription_ref: new.subscription_ref,
            subscription_status: None,
            next_charge_at: None,
            case_id: new.case_id,
            destination_label: new.destination_label,
            donor_email: new.donor_email,
            donor_name: new.donor_name,
            created_at: now,
            updated_at: now,
        };
        inner.donations.insert(donation.id, donation.clone());
        Ok(donation)
    }

    async fn get_by_id(&self, id: i64) -> StoreResult<Option<Donation>> {
        let inner = self.inner.lock().await;
        Ok(inner.donations.get(&id).cloned())
    }

    async fn get_by_external_ref(&self, external_ref: &str) -> StoreResult<Option<Donation>> {
        let inner = self.inner.lock().await;
        let hits = inner
            .donations
            .values()
            .filter(|d| d.external_payment_ref.as_deref() == Some(external_ref))
            .cloned()
            .collect();
        Ok(sorted_by_id(hits).into_iter().next())
    }

    async fn get_by_composite_ref(&self, external_ref: &str) -> StoreResult<Option<Donation>> {
        let prefix = format!("{}|", external_ref);
        let inner = self.inner.lock().await;
        let hits = inner
            .donations
            .values()
            .filter(|d| {
                d.external_payment_ref
                    .as_deref()
                    .is_some_and(|r| r.starts_with(&prefix))
            })
            .cloned()
            .collect();
        Ok(sorted_by_id(hits).into_iter().next())
    }

    async fn get_by_ref_fragment(&self, fragment: &str) -> StoreResult<Option<Donation>> {
        let inner = self.inner.lock().await;
        let hits = inner
            .donations
            .values()
            .filter(|d| {
                d.external_payment_ref
                    .as_deref()
                    .is_some_and(|r| r.contains(fragment))
            })
            .cloned()
            .collect();
        Ok(sorted_by_id(hits).into_iter().next())
    }

    async fn get_by_subscription_ref(
        &self,
        subscription_ref: &str,
    ) -> StoreResult<Option<Donation>> {
        let inner = self.inner.lock().await;
        let hits = inner
            .donations
            .values()
            .filter(|d| d.subscription_ref.as_deref() == Some(subscription_ref))
            .cloned()
            .collect();
        Ok(sorted_by_id(hits).into_iter().next())
    }

    async fn find_open_by_amount(
        &self,
        amount: Decimal,
        epsilon: Decimal,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<Donation>> {
        let inner = self.inner.lock().await;
        let mut hits: Vec<Donation> = inner
            .donations
            .values()
            .filter(|d| {
                matches!(
                    d.status,
                    DonationStatus::Pending | DonationStatus::Processing
                ) && (d.amount - amount).abs() <= epsilon
                    && d.created_at >= from
                    && d.created_at <= to
            })
            .cloned()
            .collect();
        hits.sort_by_key(|d| d.created_at);
        Ok(hits)
    }

    async fn transition_status(
        &self,
        id: i64,
        new_status: DonationStatus,
        provider_ref: Option<&str>,
    ) -> StoreResult<Transition> {
        let mut inner = self.inner.lock().await;
        let Some(donation) = inner.donations.get_mut(&id) else {
            return Ok(Transition::NotFound);
        };
        if donation.status == new_status {
            return Ok(Transition::Unchanged(donation.clone()));
        }
        donation.status = new_status;
        if donation.external_payment_ref.is_none() {
            donation.external_payment_ref = provider_ref.map(str::to_string);
        }
        donation.updated_at = Utc::now();
        Ok(Transition::Applied(donation.clone()))
    }

    async fn set_subscription_fields(
        &self,
        id: i64,
        fields: SubscriptionFields,
    ) -> StoreResult<Option<Donation>> {
        let mut inner = self.inner.lock().await;
        let Some(donation) = inner.donations.get_mut(&id) else {
            return Ok(None);
        };
        donation.subscription_ref = fields.subscription_ref;
        donation.subscription_status = fields.subscription_status;
        donation.next_charge_at = fields.next_charge_at;
        donation.updated_at = Utc::now();
        Ok(Some(donation.clone()))
    }

    async fn update_donor(
        &self,
        id: i64,
        donor_name: Option<&str>,
        donor_email: Option<&str>,
    ) -> StoreResult<Option<Donation>> {
        let mut inner = self.inner.lock().await;
        let Some(donation) = inner.donations.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(name) = donor_name {
            donation.donor_name = Some(name.to_string());
        }
        if let Some(email) = donor_email {
            donation.donor_email = Some(email.to_string());
        }
        donation.updated_at = Utc::now();
        Ok(Some(donation.clone()))
    }

    async fn list_donations(
        &self,
        status: Option<DonationStatus>,
        case_id: Option<i64>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<Donation>> {
        let inner = self.inner.lock().await;
        let mut hits: Vec<Donation> = inner
            .donations
            .values()
            .filter(|d| status.is_none_or(|s| d.status == s))
            .filter(|d| case_id.is_none_or(|c| d.case_id == Some(c)))
            .cloned()
            .collect();
        hits.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(hits
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }
}

#[async_trait]
impl CaseAccumulator for MemoryStore {
    async fn create_case(&self, new: NewCase) -> StoreResult<Case> {
        let mut inner = self.inner.lock().await;
        inner.next_case_id += 1;
        let now = Utc::now();
        let case = Case {
            id: inner.next_case_id,
            title: new.title,
            description: new.description,
            amount_required: new.amount_required,
            amount_collected: Decimal::ZERO,
            active: true,
            created_at: now,
            updated_at: now,
        };
        inner.cases.insert(case.id, case.clone());
        Ok(case)
    }

    async fn get_case(&self, id: i64) -> StoreResult<Option<Case>> {
        let inner = self.inner.lock().await;
        Ok(inner.cases.get(&id).cloned())
    }

    async fn list_cases(&self, active_only: bool) -> StoreResult<Vec<Case>> {
        let inner = self.inner.lock().await;
        let mut cases: Vec<Case> = inner
            .cases
            .values()
            .filter(|c| !active_only || c.active)
            .cloned()
            .collect();
        cases.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(cases)
    }

    async fn add_to_collected(&self, case_id: i64, amount: Decimal) -> StoreResult<Option<Case>> {
        let mut inner = self.inner.lock().await;
        let Some(case) = inner.cases.get_mut(&case_id) else {
            return Ok(None);
        };
        case.amount_collected += amount;
        case.updated_at = Utc::now();
        Ok(Some(case.clone()))
    }
}

#[async_trait]
impl OrphanLog for MemoryStore {
    async fn record(&self, orphan: NewOrphanEvent) -> StoreResult<OrphanEvent> {
        let mut inner = self.inner.lock().await;
        inner.next_orphan_id += 1;
        let record = OrphanEvent {
            id: inner.next_orphan_id,
            provider: orphan.provider,
            event_type: orphan.event_type,
            provider_ref: orphan.provider_ref,
            amount: orphan.amount,
            currency: orphan.currency,
            provider_status: orphan.provider_status,
            payload: orphan.payload,
            note: orphan.note,
            status: OrphanStatus::Unresolved,
            event_created_at: orphan.event_created_at,
            received_at: Utc::now(),
            resolved_at: None,
        };
        inner.orphans.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: i64) -> StoreResult<Option<OrphanEvent>> {
        let inner = self.inner.lock().await;
        Ok(inner.orphans.get(&id).cloned())
    }

    async fn list(
        &self,
        status: Option<OrphanStatus>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<OrphanEvent>> {
        let inner = self.inner.lock().await;
        let mut records: Vec<OrphanEvent> = inner
            .orphans
            .values()
            .filter(|o| status.is_none_or(|s| o.status == s))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        Ok(records
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn set_status(
        &self,
        id: i64,
        status: OrphanStatus,
        note: Option<&str>,
    ) -> StoreResult<Option<OrphanEvent>> {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.orphans.get_mut(&id) else {
            return Ok(None);
        };
        record.status = status;
        if let Some(note) = note {
            record.note = Some(note.to_string());
        }
        record.resolved_at = match status {
            OrphanStatus::Unresolved => None,
            _ => Some(Utc::now()),
        };
        Ok(Some(record.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DonationFrequency, DonationKind, PaymentProvider};

    fn new_donation(amount: &str) -> NewDonation {
        NewDonation {
            amount: amount.parse().unwrap(),
            currency: "AUD".to_string(),
            kind: DonationKind::General,
            frequency: DonationFrequency::OneOff,
            provider: PaymentProvider::Stripe,
            external_payment_ref: None,
            subscription_ref: None,
            case_id: None,
            destination_label: None,
            donor_email: None,
            donor_name: None,
        }
    }

    #[tokio::test]
    async fn transition_is_compare_and_set() {
        let store = MemoryStore::new();
        let d = store.create_donation(new_donation("25.00")).await.unwrap();

        let first = store
            .transition_status(d.id, DonationStatus::Completed, Some("pi_1"))
            .await
            .unwrap();
        assert!(matches!(first, Transition::Applied(_)));

        let second = store
            .transition_status(d.id, DonationStatus::Completed, Some("pi_1"))
            .await
            .unwrap();
        assert!(matches!(second, Transition::Unchanged(_)));

        let missing = store
            .transition_status(9999, DonationStatus::Completed, None)
            .await
            .unwrap();
        assert!(matches!(missing, Transition::NotFound));
    }

    #[tokio::test]
    async fn transition_preserves_existing_ref() {
        let store = MemoryStore::new();
        let mut new = new_donation("25.00");
        new.external_payment_ref = Some("pi_1|secret_a".to_string());
        let d = store.create_donation(new).await.unwrap();

        let applied = store
            .transition_status(d.id, DonationStatus::Completed, Some("pi_1"))
            .await
            .unwrap();
        let Transition::Applied(updated) = applied else {
            panic!("expected applied transition");
        };
        assert_eq!(updated.external_payment_ref.as_deref(), Some("pi_1|secret_a"));
    }

    #[tokio::test]
    async fn composite_and_fragment_lookups() {
        let store = MemoryStore::new();
        let mut new = new_donation("10.00");
        new.external_payment_ref = Some("pi_123|secret_abc".to_string());
        let d = store.create_donation(new).await.unwrap();

        let by_composite = store.get_by_composite_ref("pi_123").await.unwrap();
        assert_eq!(by_composite.map(|x| x.id), Some(d.id));

        let by_fragment = store.get_by_ref_fragment("secret_abc").await.unwrap();
        assert_eq!(by_fragment.map(|x| x.id), Some(d.id));

        assert!(store.get_by_composite_ref("pi_999").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn accumulator_adds_and_signals_missing_case() {
        let store = MemoryStore::new();
        let case = store
            .create_case(NewCase {
                title: "Well".to_string(),
                description: None,
                amount_required: "1000.00".parse().unwrap(),
            })
            .await
            .unwrap();

        let updated = store
            .add_to_collected(case.id, "200.00".parse().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.amount_collected, "200.00".parse().unwrap());

        let missing = store
            .add_to_collected(9999, "5.00".parse().unwrap())
            .await
            .unwrap();
        assert!(missing.is_none());
    }
}
