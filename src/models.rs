use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Donation status enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "donation_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DonationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    ActiveSubscription,
    SubscriptionCancelled,
}

/// Donation purpose enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "donation_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DonationKind {
    General,
    Appeal,
    Sponsorship,
}

/// Donation frequency enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "donation_frequency", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DonationFrequency {
    OneOff,
    Weekly,
    Monthly,
}

impl DonationFrequency {
    pub fn is_recurring(&self) -> bool {
        !matches!(self, DonationFrequency::OneOff)
    }
}

/// Payment provider enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payment_provider", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentProvider {
    Stripe,
    Square,
}

impl PaymentProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentProvider::Stripe => "stripe",
            PaymentProvider::Square => "square",
        }
    }
}

/// Donation record from donations table
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Donation {
    pub id: i64,
    pub amount: Decimal,
    pub currency: String,
    pub kind: DonationKind,
    pub frequency: DonationFrequency,
    pub status: DonationStatus,
    pub provider: PaymentProvider,
    pub external_payment_ref: Option<String>,
    pub subscription_ref: Option<String>,
    pub subscription_status: Option<String>,
    pub next_charge_at: Option<DateTime<Utc>>,
    pub case_id: Option<i64>,
    pub destination_label: Option<String>,
    pub donor_email: Option<String>,
    pub donor_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for inserting a new donation
#[derive(Debug, Clone)]
pub struct NewDonation {
    pub amount: Decimal,
    pub currency: String,
    pub kind: DonationKind,
    pub frequency: DonationFrequency,
    pub provider: PaymentProvider,
    pub external_payment_ref: Option<String>,
    pub subscription_ref: Option<String>,
    pub case_id: Option<i64>,
    pub destination_label: Option<String>,
    pub donor_email: Option<String>,
    pub donor_name: Option<String>,
}

/// Fundraising case record from cases table
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Case {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub amount_required: Decimal,
    pub amount_collected: Decimal,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for inserting a new case
#[derive(Debug, Clone)]
pub struct NewCase {
    pub title: String,
    pub description: Option<String>,
    pub amount_required: Decimal,
}

/// Orphan resolution status enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "orphan_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OrphanStatus {
    Unresolved,
    Resolved,
    Ignored,
}

/// Orphan record from orphan_events table.
///
/// Persisted only for provider events the matcher could not resolve; keeps
/// the full raw payload so an operator can link the event manually.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OrphanEvent {
    pub id: i64,
    pub provider: PaymentProvider,
    pub event_type: String,
    pub provider_ref: Option<String>,
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    pub provider_status: Option<String>,
    pub payload: JsonValue,
    pub note: Option<String>,
    pub status: OrphanStatus,
    pub event_created_at: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Fields for inserting a new orphan record
#[derive(Debug, Clone)]
pub struct NewOrphanEvent {
    pub provider: PaymentProvider,
    pub event_type: String,
    pub provider_ref: Option<String>,
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    pub provider_status: Option<String>,
    pub payload: JsonValue,
    pub note: Option<String>,
    pub event_created_at: Option<DateTime<Utc>>,
}

// ============================================================================
// REQUEST / RESPONSE MODELS
// ============================================================================

/// Request body for creating a donation
#[derive(Debug, Deserialize)]
pub struct CreateDonationRequest {
    pub amount: Decimal,
    pub currency: String,
    pub kind: Option<DonationKind>,
    pub frequency: Option<DonationFrequency>,
    pub provider: Option<PaymentProvider>,
    pub case_id: Option<i64>,
    pub destination_label: Option<String>,
    pub donor_email: Option<String>,
    pub donor_name: Option<String>,
}

/// Response body for a created donation; `client_secret` / `checkout_url`
/// are whatever the provider handed back for the browser to continue with.
#[derive(Debug, Serialize)]
pub struct CreateDonationResponse {
    pub donation: Donation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkout_url: Option<String>,
}

/// Request body for updating donor details
#[derive(Debug, Deserialize)]
pub struct UpdateDonorRequest {
    pub donor_name: Option<String>,
    pub donor_email: Option<String>,
}

/// Query parameters for listing donations
#[derive(Debug, Deserialize)]
pub struct ListDonationsQuery {
    pub status: Option<DonationStatus>,
    pub case_id: Option<i64>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Request body for creating a case
#[derive(Debug, Deserialize)]
pub struct CreateCaseRequest {
    pub title: String,
    pub description: Option<String>,
    pub amount_required: Decimal,
}

/// Query parameters for listing cases
#[derive(Debug, Deserialize)]
pub struct ListCasesQuery {
    pub active_only: Option<bool>,
}

/// Query parameters for listing orphan records
#[derive(Debug, Deserialize)]
pub struct ListOrphansQuery {
    pub status: Option<OrphanStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Request body for resolving an orphan record
#[derive(Debug, Deserialize)]
pub struct ResolveOrphanRequest {
    pub status: OrphanStatus,
    pub note: Option<String>,
}

/// Standard error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }
}
