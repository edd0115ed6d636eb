use rust_decimal::Decimal;
use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub host: String,
    pub port: u16,

    pub stripe_secret_key: Option<String>,
    pub stripe_webhook_secret: Option<String>,

    pub square_access_token: Option<String>,
    pub square_location_id: Option<String>,
    pub square_webhook_secret: Option<String>,
    pub square_notification_url: Option<String>,

    pub receipt_service_url: Option<String>,

    pub match_window_minutes: i64,
    pub match_amount_epsilon: Decimal,
}

impl Config {
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: env::var("DATABASE_URL")?,

            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT").unwrap_or_else(|_| "8080".to_string()).parse()?,

            stripe_secret_key: env::var("STRIPE_SECRET_KEY").ok(),
            stripe_webhook_secret: env::var("STRIPE_WEBHOOK_SECRET").ok(),

            square_access_token: env::var("SQUARE_ACCESS_TOKEN").ok(),
            square_location_id: env::var("SQUARE_LOCATION_ID").ok(),
            square_webhook_secret: env::var("SQUARE_WEBHOOK_SECRET").ok(),
            square_notification_url: env::var("SQUARE_NOTIFICATION_URL").ok(),

            receipt_service_url: env::var("RECEIPT_SERVICE_URL").ok(),

            match_window_minutes: env::var("MATCH_WINDOW_MINUTES")
                .unwrap_or_else(|_| "10".to_string())
                .parse()?,
            match_amount_epsilon: env::var("MATCH_AMOUNT_EPSILON")
                .unwrap_or_else(|_| "0.01".to_string())
                .parse()?,
        })
    }
}
