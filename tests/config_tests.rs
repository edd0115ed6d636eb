use donations_rs::config::Config;
use serial_test::serial;

const OPTIONAL_VARS: &[&str] = &[
    "HOST",
    "PORT",
    "STRIPE_SECRET_KEY",
    "STRIPE_WEBHOOK_SECRET",
    "SQUARE_ACCESS_TOKEN",
    "SQUARE_LOCATION_ID",
    "SQUARE_WEBHOOK_SECRET",
    "SQUARE_NOTIFICATION_URL",
    "RECEIPT_SERVICE_URL",
    "MATCH_WINDOW_MINUTES",
    "MATCH_AMOUNT_EPSILON",
];

fn clear_optional_vars() {
    for var in OPTIONAL_VARS {
        std::env::remove_var(var);
    }
}

#[test]
#[serial]
fn from_env_applies_defaults() {
    clear_optional_vars();
    std::env::set_var("DATABASE_URL", "postgres://localhost/donations_test");

    let cfg = Config::from_env().expect("config should load");
    assert_eq!(cfg.host, "0.0.0.0");
    assert_eq!(cfg.port, 8080);
    assert_eq!(cfg.match_window_minutes, 10);
    assert_eq!(cfg.match_amount_epsilon, "0.01".parse().unwrap());
    assert!(cfg.stripe_webhook_secret.is_none());
    assert!(cfg.square_webhook_secret.is_none());
    assert!(cfg.receipt_service_url.is_none());
}

#[test]
#[serial]
fn from_env_reads_overrides() {
    clear_optional_vars();
    std::env::set_var("DATABASE_URL", "postgres://localhost/donations_test");
    std::env::set_var("PORT", "9090");
    std::env::set_var("STRIPE_WEBHOOK_SECRET", "whsec_abc");
    std::env::set_var("MATCH_WINDOW_MINUTES", "5");
    std::env::set_var("MATCH_AMOUNT_EPSILON", "0.05");

    let cfg = Config::from_env().expect("config should load");
    assert_eq!(cfg.port, 9090);
    assert_eq!(cfg.stripe_webhook_secret.as_deref(), Some("whsec_abc"));
    assert_eq!(cfg.match_window_minutes, 5);
    assert_eq!(cfg.match_amount_epsilon, "0.05".parse().unwrap());

    clear_optional_vars();
}

#[test]
#[serial]
fn from_env_requires_database_url() {
    clear_optional_vars();
    std::env::remove_var("DATABASE_URL");
    assert!(Config::from_env().is_err());
}
