use std::sync::Arc;

use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use donations_rs::config::Config;
use donations_rs::matcher::MatchConfig;
use donations_rs::metrics::Metrics;
use donations_rs::receipts::{HttpReceiptNotifier, NoopReceiptNotifier, ReceiptNotifier};
use donations_rs::reconcile::ReconciliationEngine;
use donations_rs::db;
use donations_rs::routes::{router, AppState};
use donations_rs::square::{SquareClient, SquareConfig};
use donations_rs::store::PgStore;
use donations_rs::stripe::{StripeClient, StripeConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,donations_rs=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let cfg = Config::from_env()?;
    tracing::info!("config loaded");

    let pool = db::create_pool(&cfg.database_url).await?;
    db::run_migrations(&pool).await?;
    tracing::info!("db connected + migrations applied");

    let store = PgStore::new(pool.clone());
    let ledger = Arc::new(store.clone());
    let cases = Arc::new(store.clone());
    let orphans = Arc::new(store);

    let receipts: Arc<dyn ReceiptNotifier> = match &cfg.receipt_service_url {
        Some(url) => Arc::new(HttpReceiptNotifier::new(url.clone())?),
        None => {
            tracing::warn!("RECEIPT_SERVICE_URL not set, receipt triggers will be logged only");
            Arc::new(NoopReceiptNotifier)
        }
    };

    let match_config = MatchConfig {
        amount_epsilon: cfg.match_amount_epsilon,
        window: chrono::Duration::minutes(cfg.match_window_minutes),
    };

    let engine = Arc::new(ReconciliationEngine::new(
        ledger.clone(),
        cases.clone(),
        orphans.clone(),
        receipts,
        match_config,
    ));

    let stripe = match &cfg.stripe_secret_key {
        Some(key) => Some(StripeClient::new(StripeConfig::new(key.clone()))?),
        None => {
            tracing::warn!("STRIPE_SECRET_KEY not set, stripe payment initiation disabled");
            None
        }
    };

    let square = match (&cfg.square_access_token, &cfg.square_location_id) {
        (Some(token), Some(location)) => Some(SquareClient::new(SquareConfig::new(
            token.clone(),
            location.clone(),
        ))?),
        _ => {
            tracing::warn!("square credentials not set, square payment initiation disabled");
            None
        }
    };

    if cfg.stripe_webhook_secret.is_none() {
        tracing::warn!("STRIPE_WEBHOOK_SECRET not set, webhook payloads will be trusted (dev mode)");
    }
    if cfg.square_webhook_secret.is_none() {
        tracing::warn!("SQUARE_WEBHOOK_SECRET not set, webhook payloads will be trusted (dev mode)");
    }

    let state = AppState {
        ledger,
        cases,
        orphans,
        engine,
        stripe,
        square,
        stripe_webhook_secret: cfg.stripe_webhook_secret.clone(),
        square_webhook_secret: cfg.square_webhook_secret.clone(),
        square_notification_url: cfg.square_notification_url.clone(),
        metrics: Metrics::new(),
        db: Some(pool),
    };

    let app = router(state).layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", cfg.host, cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}
