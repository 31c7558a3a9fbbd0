//! Payment gateway abstraction
//!
//! The engine never talks to a processor directly; it goes through
//! [`PaymentGateway`]. [`crate::stripe_gateway::StripeGateway`] is the production
//! implementation and [`InMemoryGateway`] a scriptable stand-in used for local
//! runs and tests.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use usagebill_shared::{BillingInterval, CustomerId, InvoiceId};

use crate::error::{BillingError, BillingResult};

/// One invoice line as the processor should show it, already in minor units
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayableLine {
    pub description: String,
    pub amount: i64,
}

/// Request for a payable artifact (hosted invoice, payment link)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayableRequest {
    pub invoice_id: InvoiceId,
    pub customer_ref: CustomerId,
    pub currency: String,
    /// Minor units; the processor total must match this exactly
    pub amount_total: i64,
    pub line_items: Vec<PayableLine>,
    pub due_date: DateTime<Utc>,
    /// Payment terms counted from when the processor sends the invoice
    pub days_until_due: u32,
}

impl PayableRequest {
    /// Difference between the invoice total and the sum of the rounded lines
    pub fn rounding_adjustment(&self) -> i64 {
        self.amount_total - self.line_items.iter().map(|l| l.amount).sum::<i64>()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayableArtifact {
    pub reference: String,
    pub payment_url: Option<String>,
}

/// Subscription state as the processor reports it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewaySubscriptionStatus {
    /// No usable payment method yet
    Incomplete,
    Trialing,
    Active,
    PastDue,
    Canceled,
}

impl GatewaySubscriptionStatus {
    /// The processor can already collect payment
    pub fn has_payment_method(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewaySubscription {
    pub subscription_ref: String,
    pub status: GatewaySubscriptionStatus,
}

/// Payment state of a payable artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayPaymentStatus {
    /// Awaiting payment
    Pending,
    Paid,
    Failed,
    /// Voided or uncollectible at the processor
    Void,
}

impl std::fmt::Display for GatewayPaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Paid => write!(f, "paid"),
            Self::Failed => write!(f, "failed"),
            Self::Void => write!(f, "void"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentStatus {
    pub status: GatewayPaymentStatus,
    pub amount_paid: i64,
    pub amount_due: i64,
}

/// External payment processor
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a payable artifact for an invoice
    async fn create_payable(&self, request: &PayableRequest) -> BillingResult<PayableArtifact>;

    /// Create a recurring charge schedule
    async fn create_subscription(
        &self,
        customer_ref: &CustomerId,
        amount: i64,
        currency: &str,
        interval: BillingInterval,
    ) -> BillingResult<GatewaySubscription>;

    /// Current payment state of an artifact created by `create_payable`
    async fn get_status(&self, reference: &str) -> BillingResult<PaymentStatus>;

    /// Make a payable artifact uncollectable. Fails if it was already paid.
    async fn void_payable(&self, reference: &str) -> BillingResult<()>;

    /// One-off hosted payment page for a fixed amount, not tied to an invoice
    async fn create_payment_link(
        &self,
        description: &str,
        amount: i64,
        currency: &str,
    ) -> BillingResult<String>;

    async fn cancel_subscription(&self, subscription_ref: &str) -> BillingResult<()>;
}

/// Bound a gateway call; an elapsed timer becomes a retryable gateway error
pub async fn with_timeout<T, F>(limit: Duration, operation: &'static str, call: F) -> BillingResult<T>
where
    F: Future<Output = BillingResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                operation = operation,
                timeout_ms = limit.as_millis() as u64,
                "Payment gateway call timed out"
            );
            Err(BillingError::gateway(format!(
                "{} timed out after {}ms",
                operation,
                limit.as_millis()
            )))
        }
    }
}

#[derive(Debug, Clone)]
struct PayableRecord {
    request: PayableRequest,
    status: PaymentStatus,
}

#[derive(Default)]
struct GatewayState {
    next_id: u64,
    payables: HashMap<String, PayableRecord>,
    subscriptions: HashMap<String, GatewaySubscriptionStatus>,
    payment_links: Vec<(String, i64)>,
    scripted_failures: VecDeque<BillingError>,
    subscription_status_on_create: Option<GatewaySubscriptionStatus>,
    delay: Option<Duration>,
}

/// Scriptable in-process gateway
#[derive(Default)]
pub struct InMemoryGateway {
    state: Mutex<GatewayState>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` calls with a retryable error
    pub async fn fail_next(&self, count: usize) {
        let mut state = self.state.lock().await;
        for _ in 0..count {
            state
                .scripted_failures
                .push_back(BillingError::gateway("scripted gateway outage"));
        }
    }

    /// Fail the next call with a specific error
    pub async fn fail_next_with(&self, error: BillingError) {
        self.state.lock().await.scripted_failures.push_back(error);
    }

    /// Delay every call, to exercise timeouts
    pub async fn set_delay(&self, delay: Option<Duration>) {
        self.state.lock().await.delay = delay;
    }

    /// Status reported by subsequent `create_subscription` calls (default: incomplete)
    pub async fn set_subscription_status_on_create(&self, status: GatewaySubscriptionStatus) {
        self.state.lock().await.subscription_status_on_create = Some(status);
    }

    /// Simulate a payment outcome for a payable artifact
    pub async fn set_payment_status(
        &self,
        reference: &str,
        status: GatewayPaymentStatus,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        let record = state
            .payables
            .get_mut(reference)
            .ok_or_else(|| BillingError::NotFound(format!("Payable {}", reference)))?;
        let total = record.request.amount_total;
        record.status = match status {
            GatewayPaymentStatus::Paid => PaymentStatus {
                status,
                amount_paid: total,
                amount_due: 0,
            },
            _ => PaymentStatus {
                status,
                amount_paid: 0,
                amount_due: total,
            },
        };
        Ok(())
    }

    /// Requests received so far, in creation order
    pub async fn payables(&self) -> Vec<PayableRequest> {
        let state = self.state.lock().await;
        let mut records: Vec<(&String, &PayableRecord)> = state.payables.iter().collect();
        records.sort_by_key(|(reference, _)| reference_number(reference));
        records.into_iter().map(|(_, r)| r.request.clone()).collect()
    }

    /// Payment links created so far as (description, amount)
    pub async fn payment_links(&self) -> Vec<(String, i64)> {
        self.state.lock().await.payment_links.clone()
    }

    pub async fn subscription_status(&self, subscription_ref: &str) -> Option<GatewaySubscriptionStatus> {
        self.state.lock().await.subscriptions.get(subscription_ref).copied()
    }

    async fn begin_call(&self) -> BillingResult<()> {
        let (delay, failure) = {
            let mut state = self.state.lock().await;
            (state.delay, state.scripted_failures.pop_front())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn reference_number(reference: &str) -> u64 {
    reference
        .rsplit('_')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl PaymentGateway for InMemoryGateway {
    async fn create_payable(&self, request: &PayableRequest) -> BillingResult<PayableArtifact> {
        self.begin_call().await?;
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let reference = format!("in_mem_{}", state.next_id);
        state.payables.insert(
            reference.clone(),
            PayableRecord {
                request: request.clone(),
                status: PaymentStatus {
                    status: GatewayPaymentStatus::Pending,
                    amount_paid: 0,
                    amount_due: request.amount_total,
                },
            },
        );
        Ok(PayableArtifact {
            payment_url: Some(format!("https://pay.invalid/{}", reference)),
            reference,
        })
    }

    async fn create_subscription(
        &self,
        _customer_ref: &CustomerId,
        _amount: i64,
        _currency: &str,
        _interval: BillingInterval,
    ) -> BillingResult<GatewaySubscription> {
        self.begin_call().await?;
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let subscription_ref = format!("sub_mem_{}", state.next_id);
        let status = state
            .subscription_status_on_create
            .unwrap_or(GatewaySubscriptionStatus::Incomplete);
        state.subscriptions.insert(subscription_ref.clone(), status);
        Ok(GatewaySubscription {
            subscription_ref,
            status,
        })
    }

    async fn get_status(&self, reference: &str) -> BillingResult<PaymentStatus> {
        self.begin_call().await?;
        let state = self.state.lock().await;
        state
            .payables
            .get(reference)
            .map(|r| r.status.clone())
            .ok_or_else(|| BillingError::gateway_rejected(Some(404), format!("No such payable: {}", reference)))
    }

    async fn void_payable(&self, reference: &str) -> BillingResult<()> {
        self.begin_call().await?;
        let mut state = self.state.lock().await;
        let record = state.payables.get_mut(reference).ok_or_else(|| {
            BillingError::gateway_rejected(Some(404), format!("No such payable: {}", reference))
        })?;
        match record.status.status {
            GatewayPaymentStatus::Paid => Err(BillingError::gateway_rejected(
                Some(400),
                format!("Payable {} is already paid", reference),
            )),
            _ => {
                record.status = PaymentStatus {
                    status: GatewayPaymentStatus::Void,
                    amount_paid: 0,
                    amount_due: 0,
                };
                Ok(())
            }
        }
    }

    async fn create_payment_link(
        &self,
        description: &str,
        amount: i64,
        _currency: &str,
    ) -> BillingResult<String> {
        self.begin_call().await?;
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let url = format!("https://pay.invalid/plink_mem_{}", state.next_id);
        state.payment_links.push((description.to_string(), amount));
        Ok(url)
    }

    async fn cancel_subscription(&self, subscription_ref: &str) -> BillingResult<()> {
        self.begin_call().await?;
        let mut state = self.state.lock().await;
        match state.subscriptions.get_mut(subscription_ref) {
            Some(status) => {
                *status = GatewaySubscriptionStatus::Canceled;
                Ok(())
            }
            None => Err(BillingError::gateway_rejected(
                Some(404),
                format!("No such subscription: {}", subscription_ref),
            )),
        }
    }
}
