use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    /// Webhook deliveries by provider and what the ingestion layer did with
    /// them (accepted, skipped, malformed, rejected).
    pub webhook_events_total: IntCounterVec,

    /// Reconciliation outcomes by label (completed, orphaned, ...).
    pub reconcile_outcome_total: IntCounterVec,

    pub donations_created_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let webhook_events_total = IntCounterVec::new(
            Opts::new("webhook_events_total", "Webhook deliveries received"),
            &["provider", "result"], // accepted|skipped|malformed|rejected
        )
        .expect("metric");

        let reconcile_outcome_total = IntCounterVec::new(
            Opts::new("reconcile_outcome_total", "Reconciliation outcomes"),
            &["outcome"],
        )
        .expect("metric");

        let donations_created_total = IntCounterVec::new(
            Opts::new("donations_created_total", "Donations created"),
            &["provider", "frequency"],
        )
        .expect("metric");

        registry
            .register(Box::new(webhook_events_total.clone()))
            .unwrap();
        registry
            .register(Box::new(reconcile_outcome_total.clone()))
            .unwrap();
        registry
            .register(Box::new(donations_created_total.clone()))
            .unwrap();

        Self {
            registry,
            webhook_events_total,
            reconcile_outcome_total,
            donations_created_total,
        }
    }

    pub fn render(&self) -> Result<String, String> {
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&mf, &mut buf).map_err(|e| e.to_string())?;
        String::from_utf8(buf).map_err(|e| e.to_string())
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
