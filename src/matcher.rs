//! Identifier matching: locate the one donation an inbound provider event
//! refers to.
//!
//! Providers hand back several identifier shapes over a donation's lifetime
//! (the raw payment ref, the composite ref stored at creation, a metadata
//! back-reference), and historical code paths were not consistent about
//! which one got persisted. The cascade below tries the deterministic
//! strategies first and only then falls back to amount/time proximity.

use chrono::Duration;
use rust_decimal::Decimal;

use crate::events::PaymentEvent;
use crate::models::Donation;
use crate::store::{DonationLedger, StoreResult};

/// Tuning for the heuristic proximity strategy.
#[derive(Debug, Clone)]
pub struct MatchConfig {
    /// Maximum absolute difference between donation and event amounts.
    pub amount_epsilon: Decimal,
    /// Maximum distance between donation creation and event creation.
    pub window: Duration,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            amount_epsilon: Decimal::new(1, 2), // 0.01 currency units
            window: Duration::minutes(10),
        }
    }
}

/// Which strategy produced a match; logged and exposed to tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStrategy {
    DirectRef,
    CompositeRef,
    RefFragment,
    Metadata,
    Proximity,
}

impl MatchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStrategy::DirectRef => "direct_ref",
            MatchStrategy::CompositeRef => "composite_ref",
            MatchStrategy::RefFragment => "ref_fragment",
            MatchStrategy::Metadata => "metadata",
            MatchStrategy::Proximity => "proximity",
        }
    }
}

#[derive(Debug)]
pub enum MatchOutcome {
    Matched {
        donation: Donation,
        strategy: MatchStrategy,
    },
    /// Two or more proximity candidates qualified. Safer to orphan than to
    /// misattribute funds, so this is treated as no-match downstream.
    Ambiguous {
        candidates: usize,
    },
    NoMatch,
}

/// Resolve `event` to a donation. Pure read over ledger state; strategies
/// run in fixed priority order and the first hit wins.
pub async fn match_event(
    ledger: &dyn DonationLedger,
    event: &PaymentEvent,
    config: &MatchConfig,
) -> StoreResult<MatchOutcome> {
    // 1. Direct id match on the stored external ref.
    if let Some(donation) = ledger.get_by_external_ref(&event.provider_ref).await? {
        return Ok(MatchOutcome::Matched {
            donation,
            strategy: MatchStrategy::DirectRef,
        });
    }

    // 2. Composite ref stored at creation time ("<ref>|<client_secret>").
    if let Some(donation) = ledger.get_by_composite_ref(&event.provider_ref).await? {
        return Ok(MatchOutcome::Matched {
            donation,
            strategy: MatchStrategy::CompositeRef,
        });
    }

    // 3. Substring containment, for refs persisted with inconsistent
    // surrounding formatting.
    if let Some(donation) = ledger.get_by_ref_fragment(&event.provider_ref).await? {
        return Ok(MatchOutcome::Matched {
            donation,
            strategy: MatchStrategy::RefFragment,
        });
    }

    // 4. Explicit donation id in the event metadata.
    if let Some(id) = event.metadata_donation_id() {
        if let Some(donation) = ledger.get_by_id(id).await? {
            return Ok(MatchOutcome::Matched {
                donation,
                strategy: MatchStrategy::Metadata,
            });
        }
    }

    // 5. Heuristic proximity, last resort. Requires an event amount; scans
    // open donations within the configured amount epsilon and time window.
    let Some(amount) = event.amount else {
        return Ok(MatchOutcome::NoMatch);
    };
    let from = event.created_at - config.window;
    let to = event.created_at + config.window;
    let candidates = ledger
        .find_open_by_amount(amount, config.amount_epsilon, from, to)
        .await?;

    let count = candidates.len();
    let mut candidates = candidates.into_iter();
    match (candidates.next(), candidates.next()) {
        (None, _) => Ok(MatchOutcome::NoMatch),
        (Some(donation), None) => Ok(MatchOutcome::Matched {
            donation,
            strategy: MatchStrategy::Proximity,
        }),
        (Some(_), Some(_)) => Ok(MatchOutcome::Ambiguous { candidates: count }),
    }
}
