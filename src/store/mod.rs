//! Persistence seams for the reconciliation core.
//!
//! The engine and matcher depend only on these traits, never on a concrete
//! storage technology. Two implementations exist:
//!
//! - **PgStore**: production implementation over Postgres (sqlx)
//! - **MemoryStore**: in-memory implementation for dev and tests
//!
//! Mutations return the updated entity or a not-found signal; a missing row
//! is never an error here. Callers decide how to log and carry on.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::models::{
    Case, Donation, DonationStatus, NewCase, NewDonation, NewOrphanEvent, OrphanEvent,
    OrphanStatus,
};

/// Errors from the storage layer
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Result of a guarded status transition.
#[derive(Debug, Clone)]
pub enum Transition {
    /// The status actually changed in this call; side effects may fire.
    Applied(Donation),
    /// The donation already held the requested status (idempotent no-op).
    Unchanged(Donation),
    NotFound,
}

/// Subscription linkage written as one unit; `None` fields are stored as NULL.
#[derive(Debug, Clone)]
pub struct SubscriptionFields {
    pub subscription_ref: Option<String>,
    pub subscription_status: Option<String>,
    pub next_charge_at: Option<DateTime<Utc>>,
}

/// The authoritative record store for donations.
///
/// `transition_status` is the only write the engine uses to change
/// `status`; implementations must make it a compare-and-set so that two
/// concurrent identical events cannot both observe "not yet completed".
#[async_trait]
pub trait DonationLedger: Send + Sync {
    async fn create_donation(&self, new: NewDonation) -> StoreResult<Donation>;

    async fn get_by_id(&self, id: i64) -> StoreResult<Option<Donation>>;

    /// Exact match on the stored external payment ref.
    async fn get_by_external_ref(&self, external_ref: &str) -> StoreResult<Option<Donation>>;

    /// Match a composite stored ref of the form `"<external_ref>|<extra>"`.
    async fn get_by_composite_ref(&self, external_ref: &str) -> StoreResult<Option<Donation>>;

    /// Match any stored ref containing `fragment` as a substring.
    async fn get_by_ref_fragment(&self, fragment: &str) -> StoreResult<Option<Donation>>;

    async fn get_by_subscription_ref(&self, subscription_ref: &str)
        -> StoreResult<Option<Donation>>;

    /// Heuristic candidates: donations still `pending` or `processing` whose
    /// amount is within `epsilon` of `amount` and whose creation time falls
    /// inside `[from, to]`.
    async fn find_open_by_amount(
        &self,
        amount: Decimal,
        epsilon: Decimal,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<Donation>>;

    /// Guarded transition: applies only when the current status differs from
    /// `new_status`. `provider_ref` fills `external_payment_ref` when the
    /// stored ref is NULL (a composite ref stored at creation is preserved).
    async fn transition_status(
        &self,
        id: i64,
        new_status: DonationStatus,
        provider_ref: Option<&str>,
    ) -> StoreResult<Transition>;

    async fn set_subscription_fields(
        &self,
        id: i64,
        fields: SubscriptionFields,
    ) -> StoreResult<Option<Donation>>;

    async fn update_donor(
        &self,
        id: i64,
        donor_name: Option<&str>,
        donor_email: Option<&str>,
    ) -> StoreResult<Option<Donation>>;

    async fn list_donations(
        &self,
        status: Option<DonationStatus>,
        case_id: Option<i64>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<Donation>>;
}

/// Running totals per fundraising case.
#[async_trait]
pub trait CaseAccumulator: Send + Sync {
    async fn create_case(&self, new: NewCase) -> StoreResult<Case>;

    async fn get_case(&self, id: i64) -> StoreResult<Option<Case>>;

    async fn list_cases(&self, active_only: bool) -> StoreResult<Vec<Case>>;

    /// Atomic read-modify-write of `amount_collected`. Returns `None` when
    /// the case does not exist; the caller logs and continues.
    async fn add_to_collected(&self, case_id: i64, amount: Decimal) -> StoreResult<Option<Case>>;
}

/// Diagnostics log for events that could not be matched.
#[async_trait]
pub trait OrphanLog: Send + Sync {
    async fn record(&self, orphan: NewOrphanEvent) -> StoreResult<OrphanEvent>;

    async fn get(&self, id: i64) -> StoreResult<Option<OrphanEvent>>;

    async fn list(
        &self,
        status: Option<OrphanStatus>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<OrphanEvent>>;

    async fn set_status(
        &self,
        id: i64,
        status: OrphanStatus,
        note: Option<&str>,
    ) -> StoreResult<Option<OrphanEvent>>;
}
