//! Cost and margin projection
//!
//! Pure calculator used before pricing a service. No I/O.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};
use crate::policy::ProjectionThresholds;

/// Pricing recommendation derived from the projected margin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Recommendation {
    Viable,
    Marginal,
    NotViable,
}

impl std::fmt::Display for Recommendation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Recommendation::Viable => write!(f, "viable"),
            Recommendation::Marginal => write!(f, "marginal"),
            Recommendation::NotViable => write!(f, "not-viable"),
        }
    }
}

/// Monthly projection for a proposed price
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostProjection {
    pub calls_per_month: Decimal,
    pub monthly_cost: Decimal,
    pub monthly_revenue: Decimal,
    pub monthly_profit: Decimal,
    /// Absent when there is no revenue
    pub margin_percent: Option<Decimal>,
    pub recommendation: Recommendation,
}

/// Cost projector
#[derive(Debug, Clone, Default)]
pub struct CostProjector {
    thresholds: ProjectionThresholds,
}

impl CostProjector {
    pub fn new(thresholds: ProjectionThresholds) -> Self {
        Self { thresholds }
    }

    /// Project monthly cost, revenue and margin.
    ///
    /// Money values are rounded to 2 decimal places and the margin to 1. Zero
    /// revenue is reported as `not-viable` with no margin.
    pub fn project(
        &self,
        expected_volume: Decimal,
        unit_cost: Decimal,
        proposed_unit_price: Decimal,
    ) -> BillingResult<CostProjection> {
        for (name, value) in [
            ("expected_volume", expected_volume),
            ("unit_cost", unit_cost),
            ("proposed_unit_price", proposed_unit_price),
        ] {
            if value < Decimal::ZERO {
                return Err(BillingError::Validation(format!(
                    "{} must be non-negative, got {}",
                    name, value
                )));
            }
        }

        let monthly_cost = checked_mul(expected_volume, unit_cost)?;
        let monthly_revenue = checked_mul(expected_volume, proposed_unit_price)?;
        let monthly_profit = monthly_revenue - monthly_cost;

        let exact_margin = match margin(monthly_profit, monthly_revenue) {
            Ok(margin) => Some(margin),
            Err(BillingError::DivisionByZero(_)) => None,
            Err(e) => return Err(e),
        };

        // Classify on the exact margin, report the rounded one
        let recommendation = match exact_margin {
            Some(m) if m >= self.thresholds.viable => Recommendation::Viable,
            Some(m) if m >= self.thresholds.marginal => Recommendation::Marginal,
            _ => Recommendation::NotViable,
        };

        Ok(CostProjection {
            calls_per_month: expected_volume,
            monthly_cost: monthly_cost.round_dp(2),
            monthly_revenue: monthly_revenue.round_dp(2),
            monthly_profit: monthly_profit.round_dp(2),
            margin_percent: exact_margin.map(|m| m.round_dp(1)),
            recommendation,
        })
    }

    /// Projection for services priced per 1,000 calls
    pub fn project_per_thousand(
        &self,
        calls_per_month: Decimal,
        cost_per_call: Decimal,
        price_per_thousand: Decimal,
    ) -> BillingResult<CostProjection> {
        let unit_price = price_per_thousand / Decimal::ONE_THOUSAND;
        self.project(calls_per_month, cost_per_call, unit_price)
    }
}

fn checked_mul(a: Decimal, b: Decimal) -> BillingResult<Decimal> {
    a.checked_mul(b)
        .ok_or_else(|| BillingError::Validation(format!("{} * {} overflows", a, b)))
}

fn margin(profit: Decimal, revenue: Decimal) -> BillingResult<Decimal> {
    if revenue.is_zero() {
        return Err(BillingError::DivisionByZero("margin with zero revenue".to_string()));
    }
    checked_mul(profit, Decimal::ONE_HUNDRED)?
        .checked_div(revenue)
        .ok_or_else(|| BillingError::Validation(format!("margin of {} / {} overflows", profit, revenue)))
}
