use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post, put},
    Json, Router,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::PgPool;
use tower_http::cors::CorsLayer;

use crate::events::DONATION_ID_KEY;
use crate::metrics::Metrics;
use crate::models::{
    Case, CreateCaseRequest, CreateDonationRequest, CreateDonationResponse, Donation,
    DonationFrequency, DonationKind, DonationStatus, ErrorResponse, ListCasesQuery,
    ListDonationsQuery, ListOrphansQuery, NewCase, NewDonation, OrphanEvent, PaymentProvider,
    ResolveOrphanRequest, UpdateDonorRequest,
};
use crate::reconcile::ReconciliationEngine;
use crate::square::SquareClient;
use crate::store::{CaseAccumulator, DonationLedger, OrphanLog, Transition};
use crate::stripe::StripeClient;
use crate::webhook::{
    normalize_square, normalize_stripe, verify_square_signature, verify_stripe_signature,
};

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<dyn DonationLedger>,
    pub cases: Arc<dyn CaseAccumulator>,
    pub orphans: Arc<dyn OrphanLog>,
    pub engine: Arc<ReconciliationEngine>,
    pub stripe: Option<StripeClient>,
    pub square: Option<SquareClient>,
    pub stripe_webhook_secret: Option<String>,
    pub square_webhook_secret: Option<String>,
    pub square_notification_url: Option<String>,
    pub metrics: Metrics,
    /// Present in production for the readiness probe; tests run storeless.
    pub db: Option<PgPool>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // Donation endpoints
        .route("/api/donations", post(create_donation).get(list_donations))
        .route("/api/donations/{id}", get(get_donation))
        .route("/api/donations/{id}/donor", put(update_donor))
        .route(
            "/api/donations/{id}/cancel-subscription",
            post(cancel_subscription),
        )
        // Case endpoints
        .route("/api/cases", post(create_case).get(list_cases))
        .route("/api/cases/{id}", get(get_case))
        // Webhook endpoints
        .route("/api/webhooks/stripe", post(receive_stripe_webhook))
        .route("/api/webhooks/square", post(receive_square_webhook))
        // Orphan endpoints (admin follow-up surface)
        .route("/api/orphans", get(list_orphans))
        .route("/api/orphans/{id}", get(get_orphan))
        .route("/api/orphans/{id}/resolve", post(resolve_orphan))
        // Operational endpoints
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .route("/metrics", get(render_metrics))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

// ============================================================================
// DONATION HANDLERS
// ============================================================================

/// POST /api/donations - Create a donation and initiate payment
///
/// One-off Stripe donations get a payment intent up front; the composite
/// `"<intent_id>|<client_secret>"` reference is stored so later webhooks can
/// match even when the provider only echoes half of it. Square donations get
/// a hosted payment link carrying the donation id as order reference.
/// Recurring donations are created `pending` and linked when the provider's
/// subscription webhooks arrive with the donation id in their metadata.
async fn create_donation(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateDonationRequest>,
) -> Result<(StatusCode, Json<CreateDonationResponse>), (StatusCode, Json<ErrorResponse>)> {
    if req.amount <= Decimal::ZERO {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new(
                "invalid_amount",
                "Donation amount must be positive",
            )),
        ));
    }
    if req.currency.len() != 3 {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new(
                "invalid_currency",
                "Currency must be a 3-letter ISO 4217 code",
            )),
        ));
    }
    if req.case_id.is_some() && req.destination_label.is_some() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new(
                "invalid_destination",
                "A donation targets either a case or a destination label, not both",
            )),
        ));
    }

    let provider = req.provider.unwrap_or(PaymentProvider::Stripe);
    let frequency = req.frequency.unwrap_or(DonationFrequency::OneOff);

    if provider == PaymentProvider::Square && frequency.is_recurring() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new(
                "invalid_frequency",
                "Recurring donations are only supported via Stripe",
            )),
        ));
    }

    if let Some(case_id) = req.case_id {
        match state.cases.get_case(case_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                return Err((
                    StatusCode::BAD_REQUEST,
                    Json(ErrorResponse::new("unknown_case", "No such fundraising case")),
                ));
            }
            Err(e) => return Err(internal_error(e)),
        }
    }

    let donation = state
        .ledger
        .create_donation(NewDonation {
            amount: req.amount,
            currency: req.currency.to_uppercase(),
            kind: req.kind.unwrap_or(DonationKind::General),
            frequency,
            provider,
            external_payment_ref: None,
            subscription_ref: None,
            case_id: req.case_id,
            destination_label: req.destination_label,
            donor_email: req.donor_email,
            donor_name: req.donor_name,
        })
        .await
        .map_err(internal_error)?;

    state
        .metrics
        .donations_created_total
        .with_label_values(&[provider.as_str(), frequency_label(frequency)])
        .inc();

    let amount_minor = match (donation.amount * Decimal::new(100, 0)).round().to_i64() {
        Some(minor) => minor,
        None => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::new(
                    "invalid_amount",
                    "Donation amount out of range",
                )),
            ));
        }
    };

    let mut client_secret = None;
    let mut checkout_url = None;
    let mut donation = donation;

    match provider {
        PaymentProvider::Stripe if !frequency.is_recurring() => {
            if let Some(stripe) = &state.stripe {
                let metadata = std::collections::HashMap::from([(
                    DONATION_ID_KEY.to_string(),
                    donation.id.to_string(),
                )]);
                let intent = stripe
                    .create_payment_intent(
                        amount_minor,
                        &donation.currency,
                        Some("Donation"),
                        Some(metadata),
                    )
                    .await
                    .map_err(|e| {
                        tracing::error!(donation_id = donation.id, error = %e, "payment intent creation failed");
                        (
                            StatusCode::BAD_GATEWAY,
                            Json(ErrorResponse::new("provider_error", e.to_string())),
                        )
                    })?;

                // Store the composite ref for resilient matching later.
                let composite = match &intent.client_secret {
                    Some(secret) => format!("{}|{}", intent.id, secret),
                    None => intent.id.clone(),
                };
                donation = apply_payment_ref(&state, donation.id, &composite).await?;
                client_secret = intent.client_secret;
            } else {
                tracing::warn!(
                    donation_id = donation.id,
                    "stripe client not configured, donation left pending"
                );
            }
        }
        PaymentProvider::Square => {
            if let Some(square) = &state.square {
                let link = square
                    .create_payment_link(donation.id, amount_minor, &donation.currency, "Donation")
                    .await
                    .map_err(|e| {
                        tracing::error!(donation_id = donation.id, error = %e, "payment link creation failed");
                        (
                            StatusCode::BAD_GATEWAY,
                            Json(ErrorResponse::new("provider_error", e.to_string())),
                        )
                    })?;
                donation = apply_payment_ref(&state, donation.id, &link.id).await?;
                checkout_url = Some(link.url);
            } else {
                tracing::warn!(
                    donation_id = donation.id,
                    "square client not configured, donation left pending"
                );
            }
        }
        // Recurring Stripe donations are linked by webhook metadata once the
        // browser-side checkout creates the subscription.
        PaymentProvider::Stripe => {}
    }

    Ok((
        StatusCode::CREATED,
        Json(CreateDonationResponse {
            donation,
            client_secret,
            checkout_url,
        }),
    ))
}

/// Record the provider ref and move the donation into `processing`.
async fn apply_payment_ref(
    state: &AppState,
    donation_id: i64,
    provider_ref: &str,
) -> Result<Donation, (StatusCode, Json<ErrorResponse>)> {
    match state
        .ledger
        .transition_status(donation_id, DonationStatus::Processing, Some(provider_ref))
        .await
        .map_err(internal_error)?
    {
        Transition::Applied(d) | Transition::Unchanged(d) => Ok(d),
        Transition::NotFound => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("not_found", "Donation not found")),
        )),
    }
}

/// GET /api/donations/{id} - Get donation by ID
async fn get_donation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Donation>, (StatusCode, Json<ErrorResponse>)> {
    match state.ledger.get_by_id(id).await.map_err(internal_error)? {
        Some(donation) => Ok(Json(donation)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("not_found", "Donation not found")),
        )),
    }
}

/// GET /api/donations - List donations (with optional filtering)
async fn list_donations(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListDonationsQuery>,
) -> Result<Json<Vec<Donation>>, (StatusCode, Json<ErrorResponse>)> {
    let limit = query.limit.unwrap_or(50).min(100);
    let offset = query.offset.unwrap_or(0);

    let donations = state
        .ledger
        .list_donations(query.status, query.case_id, limit, offset)
        .await
        .map_err(internal_error)?;
    Ok(Json(donations))
}

/// PUT /api/donations/{id}/donor - Update donor details
///
/// Donor details can arrive before or after payment, so this never checks
/// status.
async fn update_donor(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateDonorRequest>,
) -> Result<Json<Donation>, (StatusCode, Json<ErrorResponse>)> {
    match state
        .ledger
        .update_donor(id, req.donor_name.as_deref(), req.donor_email.as_deref())
        .await
        .map_err(internal_error)?
    {
        Some(donation) => Ok(Json(donation)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("not_found", "Donation not found")),
        )),
    }
}

/// POST /api/donations/{id}/cancel-subscription - Cancel a recurring gift
///
/// Only the provider call happens here; the resulting
/// `customer.subscription.deleted` webhook drives the ledger change.
async fn cancel_subscription(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<(StatusCode, Json<Donation>), (StatusCode, Json<ErrorResponse>)> {
    let Some(donation) = state.ledger.get_by_id(id).await.map_err(internal_error)? else {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("not_found", "Donation not found")),
        ));
    };

    let Some(subscription_ref) = donation.subscription_ref.clone() else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new(
                "no_subscription",
                "Donation has no linked subscription",
            )),
        ));
    };

    let Some(stripe) = &state.stripe else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse::new(
                "provider_unavailable",
                "Stripe client not configured",
            )),
        ));
    };

    stripe
        .cancel_subscription(&subscription_ref)
        .await
        .map_err(|e| {
            tracing::error!(donation_id = id, error = %e, "subscription cancel failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(ErrorResponse::new("provider_error", e.to_string())),
            )
        })?;

    Ok((StatusCode::ACCEPTED, Json(donation)))
}

// ============================================================================
// CASE HANDLERS
// ============================================================================

/// POST /api/cases - Create a fundraising case
async fn create_case(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateCaseRequest>,
) -> Result<(StatusCode, Json<Case>), (StatusCode, Json<ErrorResponse>)> {
    if req.amount_required <= Decimal::ZERO {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new(
                "invalid_amount",
                "Required amount must be positive",
            )),
        ));
    }

    let case = state
        .cases
        .create_case(NewCase {
            title: req.title,
            description: req.description,
            amount_required: req.amount_required,
        })
        .await
        .map_err(internal_error)?;
    Ok((StatusCode::CREATED, Json(case)))
}

/// GET /api/cases/{id} - Get case by ID
async fn get_case(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Case>, (StatusCode, Json<ErrorResponse>)> {
    match state.cases.get_case(id).await.map_err(internal_error)? {
        Some(case) => Ok(Json(case)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("not_found", "Case not found")),
        )),
    }
}

/// GET /api/cases - List cases
async fn list_cases(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListCasesQuery>,
) -> Result<Json<Vec<Case>>, (StatusCode, Json<ErrorResponse>)> {
    let cases = state
        .cases
        .list_cases(query.active_only.unwrap_or(false))
        .await
        .map_err(internal_error)?;
    Ok(Json(cases))
}

// ============================================================================
// WEBHOOK HANDLERS
// ============================================================================

/// POST /api/webhooks/stripe - Receive a Stripe webhook
///
/// Signature failure is the only error that propagates back to the provider
/// (so it retries). Everything else - malformed payloads, unknown event
/// types, unmatchable events - is logged and acknowledged with 200 to avoid
/// retry storms.
async fn receive_stripe_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    if let Some(secret) = &state.stripe_webhook_secret {
        let signature = headers
            .get("stripe-signature")
            .and_then(|v| v.to_str().ok());
        if let Err(e) = verify_stripe_signature(&body, signature, secret) {
            tracing::warn!(error = %e, "stripe webhook signature verification failed");
            state
                .metrics
                .webhook_events_total
                .with_label_values(&["stripe", "rejected"])
                .inc();
            return Err((
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse::new("signature_error", e.to_string())),
            ));
        }
    } else {
        tracing::debug!("no stripe webhook secret configured, trusting payload");
    }

    let raw: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(raw) => raw,
        Err(e) => {
            // Acknowledged on purpose: failing would only trigger provider
            // redelivery of a payload that will never parse.
            tracing::error!(error = %e, "stripe webhook payload is not valid JSON");
            state
                .metrics
                .webhook_events_total
                .with_label_values(&["stripe", "malformed"])
                .inc();
            return Ok(StatusCode::OK);
        }
    };

    let event = match normalize_stripe(&raw) {
        Ok(Some(event)) => event,
        Ok(None) => {
            tracing::debug!(
                event_type = raw.get("type").and_then(|v| v.as_str()).unwrap_or("?"),
                "unhandled stripe event type"
            );
            state
                .metrics
                .webhook_events_total
                .with_label_values(&["stripe", "skipped"])
                .inc();
            return Ok(StatusCode::OK);
        }
        Err(e) => {
            tracing::error!(error = %e, payload = %raw, "stripe webhook payload malformed");
            state
                .metrics
                .webhook_events_total
                .with_label_values(&["stripe", "malformed"])
                .inc();
            return Ok(StatusCode::OK);
        }
    };

    state
        .metrics
        .webhook_events_total
        .with_label_values(&["stripe", "accepted"])
        .inc();
    run_engine(&state, event).await;
    Ok(StatusCode::OK)
}

/// POST /api/webhooks/square - Receive a Square webhook
async fn receive_square_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    match (&state.square_webhook_secret, &state.square_notification_url) {
        (Some(secret), Some(notification_url)) => {
            let signature = headers
                .get("x-square-hmacsha256-signature")
                .and_then(|v| v.to_str().ok());
            if let Err(e) = verify_square_signature(&body, signature, secret, notification_url) {
                tracing::warn!(error = %e, "square webhook signature verification failed");
                state
                    .metrics
                    .webhook_events_total
                    .with_label_values(&["square", "rejected"])
                    .inc();
                return Err((
                    StatusCode::UNAUTHORIZED,
                    Json(ErrorResponse::new("signature_error", e.to_string())),
                ));
            }
        }
        (Some(_), None) => {
            tracing::error!(
                "square webhook secret configured without SQUARE_NOTIFICATION_URL, trusting payload"
            );
        }
        _ => {
            tracing::debug!("no square webhook secret configured, trusting payload");
        }
    }

    let raw: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::error!(error = %e, "square webhook payload is not valid JSON");
            state
                .metrics
                .webhook_events_total
                .with_label_values(&["square", "malformed"])
                .inc();
            return Ok(StatusCode::OK);
        }
    };

    let event = match normalize_square(&raw) {
        Ok(Some(event)) => event,
        Ok(None) => {
            state
                .metrics
                .webhook_events_total
                .with_label_values(&["square", "skipped"])
                .inc();
            return Ok(StatusCode::OK);
        }
        Err(e) => {
            tracing::error!(error = %e, payload = %raw, "square webhook payload malformed");
            state
                .metrics
                .webhook_events_total
                .with_label_values(&["square", "malformed"])
                .inc();
            return Ok(StatusCode::OK);
        }
    };

    state
        .metrics
        .webhook_events_total
        .with_label_values(&["square", "accepted"])
        .inc();
    run_engine(&state, event).await;
    Ok(StatusCode::OK)
}

/// Drive the engine and record the outcome. Storage failures are logged and
/// swallowed; the provider already has its acknowledgement either way.
async fn run_engine(state: &AppState, event: crate::events::PaymentEvent) {
    let event_id = event.event_id.clone();
    match state.engine.process(event).await {
        Ok(outcome) => {
            state
                .metrics
                .reconcile_outcome_total
                .with_label_values(&[outcome.label()])
                .inc();
        }
        Err(e) => {
            tracing::error!(event_id = %event_id, error = %e, "event processing failed");
            state
                .metrics
                .reconcile_outcome_total
                .with_label_values(&["error"])
                .inc();
        }
    }
}

// ============================================================================
// ORPHAN HANDLERS
// ============================================================================

/// GET /api/orphans - List orphan records (admin)
async fn list_orphans(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListOrphansQuery>,
) -> Result<Json<Vec<OrphanEvent>>, (StatusCode, Json<ErrorResponse>)> {
    let limit = query.limit.unwrap_or(50).min(100);
    let offset = query.offset.unwrap_or(0);

    let orphans = state
        .orphans
        .list(query.status, limit, offset)
        .await
        .map_err(internal_error)?;
    Ok(Json(orphans))
}

/// GET /api/orphans/{id} - Get orphan record details
async fn get_orphan(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<OrphanEvent>, (StatusCode, Json<ErrorResponse>)> {
    match state.orphans.get(id).await.map_err(internal_error)? {
        Some(orphan) => Ok(Json(orphan)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("not_found", "Orphan record not found")),
        )),
    }
}

/// POST /api/orphans/{id}/resolve - Mark an orphan record resolved/ignored
async fn resolve_orphan(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<ResolveOrphanRequest>,
) -> Result<Json<OrphanEvent>, (StatusCode, Json<ErrorResponse>)> {
    match state
        .orphans
        .set_status(id, req.status, req.note.as_deref())
        .await
        .map_err(internal_error)?
    {
        Some(orphan) => Ok(Json(orphan)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("not_found", "Orphan record not found")),
        )),
    }
}

// ============================================================================
// OPERATIONAL HANDLERS
// ============================================================================

async fn health_live() -> StatusCode {
    StatusCode::OK
}

async fn health_ready(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if let Some(db) = &state.db {
        sqlx::query("SELECT 1")
            .fetch_one(db)
            .await
            .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    }

    Ok(Json(serde_json::json!({
        "status": "ready",
        "database": "connected"
    })))
}

async fn render_metrics(State(state): State<Arc<AppState>>) -> Result<String, StatusCode> {
    state
        .metrics
        .render()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

fn internal_error(e: crate::store::StoreError) -> (StatusCode, Json<ErrorResponse>) {
    tracing::error!(error = %e, "store operation failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse::new("database_error", e.to_string())),
    )
}

fn frequency_label(frequency: DonationFrequency) -> &'static str {
    match frequency {
        DonationFrequency::OneOff => "one_off",
        DonationFrequency::Weekly => "weekly",
        DonationFrequency::Monthly => "monthly",
    }
}
