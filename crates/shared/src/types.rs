//! Common types used across usagebill

use chrono::{DateTime, Duration, Months, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;
use crate::metadata::EventMetadata;

// =============================================================================
// ID Wrappers
// =============================================================================

/// Opaque customer identifier, also used as the payment gateway customer reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct CustomerId(pub String);

impl CustomerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CustomerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for CustomerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for CustomerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
        #[serde(transparent)]
        #[sqlx(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

uuid_id!(
    /// Usage event ID wrapper
    EventId
);
uuid_id!(
    /// Invoice ID wrapper
    InvoiceId
);
uuid_id!(
    /// Subscription ID wrapper
    SubscriptionId
);

// =============================================================================
// Enums
// =============================================================================

/// Invoice status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    /// Created locally, no payable artifact at the gateway yet
    Open,
    /// Payable artifact exists at the gateway
    Sent,
    Paid,
    Failed,
    Void,
}

impl InvoiceStatus {
    /// Paid and void invoices never change again
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Paid | Self::Void)
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Sent => write!(f, "sent"),
            Self::Paid => write!(f, "paid"),
            Self::Failed => write!(f, "failed"),
            Self::Void => write!(f, "void"),
        }
    }
}

impl std::str::FromStr for InvoiceStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "sent" => Ok(Self::Sent),
            "paid" => Ok(Self::Paid),
            "failed" => Ok(Self::Failed),
            "void" => Ok(Self::Void),
            _ => Err(DomainError::InvalidValue {
                field: "invoice_status",
                value: s.to_string(),
            }),
        }
    }
}

/// Subscription status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Waiting for the gateway to confirm a payment method
    Pending,
    Active,
    PastDue,
    Canceled,
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Active => write!(f, "active"),
            Self::PastDue => write!(f, "past_due"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "past_due" => Ok(Self::PastDue),
            "canceled" | "cancelled" => Ok(Self::Canceled),
            _ => Err(DomainError::InvalidValue {
                field: "subscription_status",
                value: s.to_string(),
            }),
        }
    }
}

/// Recurring charge interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    Day,
    Week,
    Month,
    Year,
}

impl BillingInterval {
    /// Advance a timestamp by one interval.
    ///
    /// Month and year steps are calendar steps; a day that does not exist in
    /// the target month is clamped to the last day of that month
    /// (Jan 31 + 1 month = Feb 28/29).
    pub fn advance(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Day => from.checked_add_signed(Duration::days(1)),
            Self::Week => from.checked_add_signed(Duration::weeks(1)),
            Self::Month => from.checked_add_months(Months::new(1)),
            Self::Year => from.checked_add_months(Months::new(12)),
        }
    }
}

impl std::fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Day => write!(f, "day"),
            Self::Week => write!(f, "week"),
            Self::Month => write!(f, "month"),
            Self::Year => write!(f, "year"),
        }
    }
}

impl std::str::FromStr for BillingInterval {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "day" | "daily" => Ok(Self::Day),
            "week" | "weekly" => Ok(Self::Week),
            "month" | "monthly" => Ok(Self::Month),
            "year" | "yearly" | "annual" => Ok(Self::Year),
            _ => Err(DomainError::InvalidValue {
                field: "billing_interval",
                value: s.to_string(),
            }),
        }
    }
}

// =============================================================================
// Models
// =============================================================================

/// A billable event as submitted by a usage producer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewUsageEvent {
    pub customer_id: CustomerId,
    pub service: String,
    pub quantity: Decimal,
    pub unit: String,
    pub unit_price: Decimal,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: EventMetadata,
}

impl NewUsageEvent {
    /// Event occurring now with empty metadata
    pub fn new(
        customer_id: impl Into<CustomerId>,
        service: impl Into<String>,
        quantity: Decimal,
        unit: impl Into<String>,
        unit_price: Decimal,
    ) -> Self {
        Self {
            customer_id: customer_id.into(),
            service: service.into(),
            quantity,
            unit: unit.into(),
            unit_price,
            occurred_at: Utc::now(),
            metadata: EventMetadata::new(),
        }
    }

    pub fn occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    pub fn metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A recorded billable event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub event_id: EventId,
    pub customer_id: CustomerId,
    pub service: String,
    pub quantity: Decimal,
    pub unit: String,
    pub unit_price: Decimal,
    pub occurred_at: DateTime<Utc>,
    pub metadata: EventMetadata,
    pub billed: bool,
    pub invoice_id: Option<InvoiceId>,
    /// Insertion order, breaks ties between identical `occurred_at` values
    pub sequence: i64,
    pub recorded_at: DateTime<Utc>,
    pub voided_at: Option<DateTime<Utc>>,
}

impl UsageEvent {
    /// Revenue contribution: `quantity * unit_price`, `None` on overflow
    pub fn amount(&self) -> Option<Decimal> {
        self.quantity.checked_mul(self.unit_price)
    }

    /// Neither billed nor voided
    pub fn is_billable(&self) -> bool {
        !self.billed && self.voided_at.is_none()
    }
}

/// Aggregated charge for one service on an invoice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub service: String,
    pub quantity: Decimal,
    pub unit: String,
    /// Uniform price when all events agree, otherwise `subtotal / quantity`
    pub unit_price: Decimal,
    /// Exact (unrounded) sum of `quantity * unit_price`
    pub subtotal: Decimal,
    pub event_count: u32,
}

impl LineItem {
    /// Human readable description, e.g. `api_calls: 5000 calls @ 0.01/calls`
    pub fn description(&self) -> String {
        format!(
            "{}: {} {} @ {}/{}",
            self.service,
            self.quantity.normalize(),
            self.unit,
            self.unit_price.normalize(),
            self.unit
        )
    }
}

/// Billing statement for one customer over one period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub invoice_id: InvoiceId,
    pub customer_id: CustomerId,
    pub line_items: Vec<LineItem>,
    /// Minor currency units (e.g. cents)
    pub amount_total: i64,
    pub currency: String,
    pub status: InvoiceStatus,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub due_date: DateTime<Utc>,
    pub payment_reference: Option<String>,
    pub payment_url: Option<String>,
    pub amount_paid: Option<i64>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Invoice {
    /// Exact sum of line item subtotals before rounding, `None` on overflow
    pub fn subtotal_sum(&self) -> Option<Decimal> {
        self.line_items
            .iter()
            .try_fold(Decimal::ZERO, |total, item| total.checked_add(item.subtotal))
    }
}

/// Recurring fixed-amount obligation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub subscription_id: SubscriptionId,
    pub customer_id: CustomerId,
    /// Minor currency units per interval
    pub amount: i64,
    pub currency: String,
    pub interval: BillingInterval,
    pub status: SubscriptionStatus,
    pub next_charge_at: DateTime<Utc>,
    pub gateway_reference: Option<String>,
    /// Consecutive failed charges since the last success
    pub failure_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub canceled_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_invoice_status_round_trip() {
        for status in [
            InvoiceStatus::Open,
            InvoiceStatus::Sent,
            InvoiceStatus::Paid,
            InvoiceStatus::Failed,
            InvoiceStatus::Void,
        ] {
            assert_eq!(status.to_string().parse::<InvoiceStatus>().unwrap(), status);
        }
        assert!("refunded".parse::<InvoiceStatus>().is_err());
    }

    #[test]
    fn test_subscription_status_accepts_british_spelling() {
        assert_eq!(
            "cancelled".parse::<SubscriptionStatus>().unwrap(),
            SubscriptionStatus::Canceled
        );
        assert_eq!(SubscriptionStatus::PastDue.to_string(), "past_due");
    }

    #[test]
    fn test_interval_advance() {
        let start = Utc.with_ymd_and_hms(2026, 1, 31, 12, 0, 0).unwrap();

        assert_eq!(
            BillingInterval::Day.advance(start).unwrap(),
            Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).unwrap()
        );
        assert_eq!(
            BillingInterval::Week.advance(start).unwrap(),
            Utc.with_ymd_and_hms(2026, 2, 7, 12, 0, 0).unwrap()
        );
        // Clamped to the end of February
        assert_eq!(
            BillingInterval::Month.advance(start).unwrap(),
            Utc.with_ymd_and_hms(2026, 2, 28, 12, 0, 0).unwrap()
        );
        assert_eq!(
            BillingInterval::Year.advance(start).unwrap(),
            Utc.with_ymd_and_hms(2027, 1, 31, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_interval_parse_aliases() {
        assert_eq!("monthly".parse::<BillingInterval>().unwrap(), BillingInterval::Month);
        assert_eq!("annual".parse::<BillingInterval>().unwrap(), BillingInterval::Year);
        assert!("fortnight".parse::<BillingInterval>().is_err());
    }

    #[test]
    fn test_line_item_description() {
        let item = LineItem {
            service: "api_calls".to_string(),
            quantity: Decimal::new(5000, 0),
            unit: "calls".to_string(),
            unit_price: Decimal::new(100, 4),
            subtotal: Decimal::new(50, 0),
            event_count: 1,
        };
        assert_eq!(item.description(), "api_calls: 5000 calls @ 0.01/calls");
    }
}
