//! Billing policy points
//!
//! Everything the engine treats as policy rather than a hard-coded rule:
//! rounding of fractional currency, subscription retry limit, whether voiding
//! an invoice releases its usage, projection thresholds and gateway timeouts.
//!
//! Configuration via environment variables (all optional):
//! - `BILLING_ROUNDING`: `half_up` (default), `half_even`, `up`, `down`
//! - `BILLING_CURRENCY_EXPONENT`: minor unit digits (default: 2)
//! - `SUBSCRIPTION_RETRY_LIMIT`: failed charges tolerated before cancel (default: 2)
//! - `INVOICE_RELEASE_EVENTS_ON_VOID`: return voided invoice usage to unbilled (default: false)
//! - `INVOICE_DAYS_UNTIL_DUE`: due date offset (default: 14)
//! - `GATEWAY_TIMEOUT_MS`: bound on every gateway call (default: 30000)
//! - `GENERATE_CONFLICT_RETRIES`: re-reads after losing a billing race (default: 1)
//! - `USAGE_SPIKE_THRESHOLD`: unbilled total that triggers a spike warning (default: unset)
//! - `PROJECTION_VIABLE_MARGIN` / `PROJECTION_MARGINAL_MARGIN`: margin thresholds (50 / 20)
//! - `WEBHOOK_TOLERANCE_SECS`: accepted webhook timestamp skew (default: 300)

use std::str::FromStr;
use std::time::Duration;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::{BillingError, BillingResult};

/// Rounding applied when converting exact totals to minor currency units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoundingMode {
    /// 0.5 rounds away from zero
    #[default]
    HalfUp,
    /// Banker's rounding
    HalfEven,
    /// Always toward the customer paying more
    Up,
    /// Always toward the customer paying less
    Down,
}

impl RoundingMode {
    fn strategy(&self) -> RoundingStrategy {
        match self {
            Self::HalfUp => RoundingStrategy::MidpointAwayFromZero,
            Self::HalfEven => RoundingStrategy::MidpointNearestEven,
            Self::Up => RoundingStrategy::AwayFromZero,
            Self::Down => RoundingStrategy::ToZero,
        }
    }
}

impl FromStr for RoundingMode {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "half_up" => Ok(Self::HalfUp),
            "half_even" => Ok(Self::HalfEven),
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            _ => Err(BillingError::Config(format!("Invalid rounding mode: {}", s))),
        }
    }
}

/// Margin thresholds (percent) for cost projections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectionThresholds {
    /// Margin at or above this is viable
    pub viable: Decimal,
    /// Margin at or above this (and below `viable`) is marginal
    pub marginal: Decimal,
}

impl Default for ProjectionThresholds {
    fn default() -> Self {
        Self {
            viable: Decimal::from(50),
            marginal: Decimal::from(20),
        }
    }
}

/// Engine-wide policy configuration
#[derive(Debug, Clone)]
pub struct BillingPolicy {
    pub currency: String,
    pub currency_exponent: u32,
    pub rounding: RoundingMode,
    pub subscription_retry_limit: u32,
    pub release_events_on_void: bool,
    pub days_until_due: i64,
    pub gateway_timeout: Duration,
    pub generate_conflict_retries: u32,
    pub usage_spike_threshold: Option<Decimal>,
    pub projection: ProjectionThresholds,
    pub webhook_tolerance_secs: i64,
}

impl Default for BillingPolicy {
    fn default() -> Self {
        Self {
            currency: "usd".to_string(),
            currency_exponent: 2,
            rounding: RoundingMode::HalfUp,
            subscription_retry_limit: 2,
            release_events_on_void: false,
            days_until_due: 14,
            gateway_timeout: Duration::from_secs(30),
            generate_conflict_retries: 1,
            usage_spike_threshold: None,
            projection: ProjectionThresholds::default(),
            webhook_tolerance_secs: 300,
        }
    }
}

impl BillingPolicy {
    /// Load policy from environment, falling back to defaults
    pub fn from_env() -> BillingResult<Self> {
        let defaults = Self::default();

        let rounding = match std::env::var("BILLING_ROUNDING") {
            Ok(v) => v.parse()?,
            Err(_) => defaults.rounding,
        };

        let projection = ProjectionThresholds {
            viable: env_parse("PROJECTION_VIABLE_MARGIN")?.unwrap_or(defaults.projection.viable),
            marginal: env_parse("PROJECTION_MARGINAL_MARGIN")?
                .unwrap_or(defaults.projection.marginal),
        };
        if projection.marginal > projection.viable {
            return Err(BillingError::Config(
                "PROJECTION_MARGINAL_MARGIN must not exceed PROJECTION_VIABLE_MARGIN".to_string(),
            ));
        }

        Ok(Self {
            currency: std::env::var("BILLING_CURRENCY")
                .map(|c| c.to_lowercase())
                .unwrap_or(defaults.currency),
            currency_exponent: env_parse("BILLING_CURRENCY_EXPONENT")?
                .unwrap_or(defaults.currency_exponent),
            rounding,
            subscription_retry_limit: env_parse("SUBSCRIPTION_RETRY_LIMIT")?
                .unwrap_or(defaults.subscription_retry_limit),
            release_events_on_void: env_parse("INVOICE_RELEASE_EVENTS_ON_VOID")?
                .unwrap_or(defaults.release_events_on_void),
            days_until_due: env_parse("INVOICE_DAYS_UNTIL_DUE")?.unwrap_or(defaults.days_until_due),
            gateway_timeout: env_parse::<u64>("GATEWAY_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.gateway_timeout),
            generate_conflict_retries: env_parse("GENERATE_CONFLICT_RETRIES")?
                .unwrap_or(defaults.generate_conflict_retries),
            usage_spike_threshold: env_parse("USAGE_SPIKE_THRESHOLD")?,
            projection,
            webhook_tolerance_secs: env_parse("WEBHOOK_TOLERANCE_SECS")?
                .unwrap_or(defaults.webhook_tolerance_secs),
        })
    }

    /// Convert an exact major-unit amount to minor units using the rounding policy
    pub fn to_minor_units(&self, amount: Decimal) -> BillingResult<i64> {
        let out_of_range = || BillingError::Validation(format!("Amount out of range: {}", amount));
        let scale = 10_i64
            .checked_pow(self.currency_exponent)
            .map(Decimal::from)
            .ok_or_else(out_of_range)?;
        amount
            .checked_mul(scale)
            .ok_or_else(out_of_range)?
            .round_dp_with_strategy(0, self.rounding.strategy())
            .to_i64()
            .ok_or_else(out_of_range)
    }

    /// Convert minor units back to a major-unit decimal
    pub fn from_minor_units(&self, amount: i64) -> Decimal {
        Decimal::new(amount, self.currency_exponent)
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
