pub mod config;
pub mod db;
pub mod events;
pub mod matcher;
pub mod metrics;
pub mod models;
pub mod receipts;
pub mod reconcile;
pub mod routes;
pub mod square;
pub mod store;
pub mod stripe;
pub mod webhook;

pub use matcher::{match_event, MatchConfig, MatchOutcome, MatchStrategy};
pub use reconcile::{Outcome, ReconciliationEngine};
pub use routes::{router, AppState};
