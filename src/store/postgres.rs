//! Postgres implementation of the store traits (production).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;

use super::{
    CaseAccumulator, DonationLedger, OrphanLog, StoreResult, SubscriptionFields, Transition,
};
use crate::models::{
    Case, Donation, DonationStatus, NewCase, NewDonation, NewOrphanEvent, OrphanEvent,
    OrphanStatus,
};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Escape LIKE metacharacters in a provider ref before pattern matching.
fn escape_like(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

#[async_trait]
impl DonationLedger for PgStore {
    async fn create_donation(&self, new: NewDonation) -> StoreResult<Donation> {
        let donation = sqlx::query_as::<_, Donation>(
            r#"
            INSERT INTO donations (
                amount, currency, kind, frequency, provider,
                external_payment_ref, subscription_ref, case_id,
                destination_label, donor_email, donor_name,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(new.amount)
        .bind(&new.currency)
        .bind(new.kind)
        .bind(new.frequency)
        .bind(new.provider)
        .bind(&new.external_payment_ref)
        .bind(&new.subscription_ref)
        .bind(new.case_id)
        .bind(&new.destination_label)
        .bind(&new.donor_email)
        .bind(&new.donor_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(donation)
    }

    async fn get_by_id(&self, id: i64) -> StoreResult<Option<Donation>> {
        let donation = sqlx::query_as::<_, Donation>("SELECT * FROM donations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(donation)
    }

    async fn get_by_external_ref(&self, external_ref: &str) -> StoreResult<Option<Donation>> {
        let donation = sqlx::query_as::<_, Donation>(
            "SELECT * FROM donations WHERE external_payment_ref = $1 ORDER BY id LIMIT 1",
        )
        .bind(external_ref)
        .fetch_optional(&self.pool)
        .await?;
        Ok(donation)
    }

    async fn get_by_composite_ref(&self, external_ref: &str) -> StoreResult<Option<Donation>> {
        let donation = sqlx::query_as::<_, Donation>(
            r#"
            SELECT * FROM donations
            WHERE external_payment_ref LIKE $1 || '|%'
            ORDER BY id
            LIMIT 1
            "#,
        )
        .bind(escape_like(external_ref))
        .fetch_optional(&self.pool)
        .await?;
        Ok(donation)
    }

    async fn get_by_ref_fragment(&self, fragment: &str) -> StoreResult<Option<Donation>> {
        let donation = sqlx::query_as::<_, Donation>(
            r#"
            SELECT * FROM donations
            WHERE external_payment_ref LIKE '%' || $1 || '%'
            ORDER BY id
            LIMIT 1
            "#,
        )
        .bind(escape_like(fragment))
        .fetch_optional(&self.pool)
        .await?;
        Ok(donation)
    }

    async fn get_by_subscription_ref(
        &self,
        subscription_ref: &str,
    ) -> StoreResult<Option<Donation>> {
        let donation = sqlx::query_as::<_, Donation>(
            "SELECT * FROM donations WHERE subscription_ref = $1 ORDER BY id LIMIT 1",
        )
        .bind(subscription_ref)
        .fetch_optional(&self.pool)
        .await?;
        Ok(donation)
    }

    async fn find_open_by_amount(
        &self,
        amount: Decimal,
        epsilon: Decimal,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<Donation>> {
        let donations = sqlx::query_as::<_, Donation>(
            r#"
            SELECT * FROM donations
            WHERE status IN ('pending', 'processing')
              AND amount BETWEEN $1 - $2 AND $1 + $2
              AND created_at BETWEEN $3 AND $4
            ORDER BY created_at
            "#,
        )
        .bind(amount)
        .bind(epsilon)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(donations)
    }

    async fn transition_status(
        &self,
        id: i64,
        new_status: DonationStatus,
        provider_ref: Option<&str>,
    ) -> StoreResult<Transition> {
        // Single-statement compare-and-set: two concurrent identical events
        // cannot both see the old status.
        let applied = sqlx::query_as::<_, Donation>(
            r#"
            UPDATE donations
            SET status = $2,
                external_payment_ref = COALESCE(external_payment_ref, $3),
                updated_at = NOW()
            WHERE id = $1 AND status <> $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(new_status)
        .bind(provider_ref)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(donation) = applied {
            return Ok(Transition::Applied(donation));
        }

        match self.get_by_id(id).await? {
            Some(donation) => Ok(Transition::Unchanged(donation)),
            None => Ok(Transition::NotFound),
        }
    }

    async fn set_subscription_fields(
        &self,
        id: i64,
        fields: SubscriptionFields,
    ) -> StoreResult<Option<Donation>> {
        let donation = sqlx::query_as::<_, Donation>(
            r#"
            UPDATE donations
            SET subscription_ref = $2,
                subscription_status = $3,
                next_charge_at = $4,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&fields.subscription_ref)
        .bind(&fields.subscription_status)
        .bind(fields.next_charge_at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(donation)
    }

    async fn update_donor(
        &self,
        id: i64,
        donor_name: Option<&str>,
        donor_email: Option<&str>,
    ) -> StoreResult<Option<Donation>> {
        let donation = sqlx::query_as::<_, Donation>(
            r#"
            UPDATE donations
            SET donor_name = COALESCE($2, donor_name),
                donor_email = COALESCE($3, donor_email),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(donor_name)
        .bind(donor_email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(donation)
    }

    async fn list_donations(
        &self,
        status: Option<DonationStatus>,
        case_id: Option<i64>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<Donation>> {
        let donations = sqlx::query_as::<_, Donation>(
            r#"
            SELECT * FROM donations
            WHERE ($1::donation_status IS NULL OR status = $1)
              AND ($2::bigint IS NULL OR case_id = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(status)
        .bind(case_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(donations)
    }
}

#[async_trait]
impl CaseAccumulator for PgStore {
    async fn create_case(&self, new: NewCase) -> StoreResult<Case> {
        let case = sqlx::query_as::<_, Case>(
            r#"
            INSERT INTO cases (title, description, amount_required, amount_collected, active, created_at, updated_at)
            VALUES ($1, $2, $3, 0, TRUE, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(&new.title)
        .bind(&new.description)
        .bind(new.amount_required)
        .fetch_one(&self.pool)
        .await?;
        Ok(case)
    }

    async fn get_case(&self, id: i64) -> StoreResult<Option<Case>> {
        let case = sqlx::query_as::<_, Case>("SELECT * FROM cases WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(case)
    }

    async fn list_cases(&self, active_only: bool) -> StoreResult<Vec<Case>> {
        let cases = sqlx::query_as::<_, Case>(
            r#"
            SELECT * FROM cases
            WHERE ($1 = FALSE OR active = TRUE)
            ORDER BY created_at DESC
            "#,
        )
        .bind(active_only)
        .fetch_all(&self.pool)
        .await?;
        Ok(cases)
    }

    async fn add_to_collected(&self, case_id: i64, amount: Decimal) -> StoreResult<Option<Case>> {
        let case = sqlx::query_as::<_, Case>(
            r#"
            UPDATE cases
            SET amount_collected = amount_collected + $2,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(case_id)
        .bind(amount)
        .fetch_optional(&self.pool)
        .await?;
        Ok(case)
    }
}

#[async_trait]
impl OrphanLog for PgStore {
    async fn record(&self, orphan: NewOrphanEvent) -> StoreResult<OrphanEvent> {
        let record = sqlx::query_as::<_, OrphanEvent>(
            r#"
            INSERT INTO orphan_events (
                provider, event_type, provider_ref, amount, currency,
                provider_status, payload, note, status, event_created_at, received_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'unresolved', $9, NOW())
            RETURNING *
            "#,
        )
        .bind(orphan.provider)
        .bind(&orphan.event_type)
        .bind(&orphan.provider_ref)
        .bind(orphan.amount)
        .bind(&orphan.currency)
        .bind(&orphan.provider_status)
        .bind(&orphan.payload)
        .bind(&orphan.note)
        .bind(orphan.event_created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    async fn get(&self, id: i64) -> StoreResult<Option<OrphanEvent>> {
        let record = sqlx::query_as::<_, OrphanEvent>("SELECT * FROM orphan_events WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn list(
        &self,
        status: Option<OrphanStatus>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<OrphanEvent>> {
        let records = sqlx::query_as::<_, OrphanEvent>(
            r#"
            SELECT * FROM orphan_events
            WHERE ($1::orphan_status IS NULL OR status = $1)
            ORDER BY received_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(status)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn set_status(
        &self,
        id: i64,
        status: OrphanStatus,
        note: Option<&str>,
    ) -> StoreResult<Option<OrphanEvent>> {
        let record = sqlx::query_as::<_, OrphanEvent>(
            r#"
            UPDATE orphan_events
            SET status = $2,
                note = COALESCE($3, note),
                resolved_at = CASE WHEN $2 = 'unresolved'::orphan_status THEN NULL ELSE NOW() END
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(note)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }
}
