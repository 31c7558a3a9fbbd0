//! Worker configuration

use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use usagebill_billing::{BillingError, BillingResult};

/// Where billing state is persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    /// Process-local, lost on restart
    Memory,
}

impl FromStr for StoreBackend {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "memory" | "in_memory" => Ok(Self::Memory),
            _ => Err(BillingError::Config(format!("Invalid BILLING_STORE: {}", s))),
        }
    }
}

/// Which payment gateway the worker talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayBackend {
    Stripe,
    Memory,
}

impl FromStr for GatewayBackend {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stripe" => Ok(Self::Stripe),
            "memory" | "in_memory" => Ok(Self::Memory),
            _ => Err(BillingError::Config(format!("Invalid BILLING_GATEWAY: {}", s))),
        }
    }
}

/// Backoff for resending open invoices to the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySettings {
    pub attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Worker configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub store: StoreBackend,
    pub gateway: GatewayBackend,
    pub database_url: Option<String>,
    pub database_max_connections: u32,

    // Billing cycle
    pub billing_period_days: u32,
    pub billing_min_amount: Decimal,

    // Schedules (six-field cron, seconds first)
    pub billing_cron: String,
    pub gateway_retry_cron: String,
    pub status_poll_cron: String,
    pub notification_cron: String,

    pub gateway_retry: RetrySettings,
    /// Open invoices younger than this are left to the run that created them
    pub gateway_retry_min_age: Duration,
    pub notification_batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            store: StoreBackend::Postgres,
            gateway: GatewayBackend::Stripe,
            database_url: None,
            database_max_connections: 10,
            billing_period_days: 30,
            billing_min_amount: Decimal::ZERO,
            billing_cron: "0 0 2 * * *".to_string(),
            gateway_retry_cron: "0 */10 * * * *".to_string(),
            status_poll_cron: "0 */15 * * * *".to_string(),
            notification_cron: "0 * * * * *".to_string(),
            gateway_retry: RetrySettings::default(),
            gateway_retry_min_age: Duration::from_secs(60),
            notification_batch_size: 100,
        }
    }
}

impl WorkerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let defaults = Self::default();

        let store = match std::env::var("BILLING_STORE") {
            Ok(v) => v.parse()?,
            Err(_) => defaults.store,
        };
        let gateway = match std::env::var("BILLING_GATEWAY") {
            Ok(v) => v.parse()?,
            Err(_) => defaults.gateway,
        };

        let database_url = std::env::var("DATABASE_URL").ok();
        if store == StoreBackend::Postgres && database_url.is_none() {
            return Err(BillingError::Config(
                "DATABASE_URL not set (required when BILLING_STORE=postgres)".to_string(),
            ));
        }

        let billing_period_days =
            env_parse("BILLING_PERIOD_DAYS")?.unwrap_or(defaults.billing_period_days);
        if billing_period_days == 0 {
            return Err(BillingError::Config("BILLING_PERIOD_DAYS must be positive".to_string()));
        }

        Ok(Self {
            store,
            gateway,
            database_url,
            database_max_connections: env_parse("DATABASE_MAX_CONNECTIONS")?
                .unwrap_or(defaults.database_max_connections),
            billing_period_days,
            billing_min_amount: env_parse("BILLING_MIN_AMOUNT")?
                .unwrap_or(defaults.billing_min_amount),
            billing_cron: std::env::var("BILLING_CRON").unwrap_or(defaults.billing_cron),
            gateway_retry_cron: std::env::var("GATEWAY_RETRY_CRON")
                .unwrap_or(defaults.gateway_retry_cron),
            status_poll_cron: std::env::var("STATUS_POLL_CRON").unwrap_or(defaults.status_poll_cron),
            notification_cron: std::env::var("NOTIFICATION_CRON")
                .unwrap_or(defaults.notification_cron),
            gateway_retry: RetrySettings {
                attempts: env_parse("GATEWAY_RETRY_ATTEMPTS")?
                    .unwrap_or(defaults.gateway_retry.attempts),
                base_delay: env_parse::<u64>("GATEWAY_RETRY_BASE_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.gateway_retry.base_delay),
                max_delay: env_parse::<u64>("GATEWAY_RETRY_MAX_DELAY_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.gateway_retry.max_delay),
            },
            gateway_retry_min_age: env_parse::<u64>("GATEWAY_RETRY_MIN_AGE_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.gateway_retry_min_age),
            notification_batch_size: env_parse("NOTIFICATION_BATCH_SIZE")?
                .unwrap_or(defaults.notification_batch_size),
        })
    }
}

fn env_parse<T: FromStr>(name: &str) -> BillingResult<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| BillingError::Config(format!("{} has an invalid value: {}", name, raw))),
        Err(_) => Ok(None),
    }
}
