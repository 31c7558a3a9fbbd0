//! Billing Events Module
//!
//! Append-only billing event log for audit trails and customer notifications.
//! Events capture every state change the engine makes and can be used to:
//! - Answer "why was this customer charged?" questions
//! - Reconstruct invoice and subscription history
//! - Drive outbound notifications (events flagged `requires_notification`)
//!
//! ## Event Types
//!
//! - Invoicing: created, sent, paid, failed, voided, retried
//! - Subscription lifecycle: created, activated, charged, payment failed, canceled
//! - Usage: spikes above the configured threshold, operator voids

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use usagebill_shared::{CustomerId, EventId, InvoiceId, SubscriptionId};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::store::EventStore;

/// Types of billing events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingEventType {
    // Invoicing
    InvoiceCreated,
    InvoiceSent,
    InvoicePaid,
    InvoiceFailed,
    InvoiceVoided,
    InvoiceRetried,
    /// Gateway collected money for an invoice that is void locally
    PaymentOnVoidInvoice,

    // Subscription lifecycle
    SubscriptionCreated,
    SubscriptionActivated,
    SubscriptionCharged,
    PaymentFailed,
    SubscriptionCanceled,

    // Usage
    UsageSpike,
    UsageVoided,
}

impl BillingEventType {
    fn as_str(&self) -> &'static str {
        match self {
            BillingEventType::InvoiceCreated => "INVOICE_CREATED",
            BillingEventType::InvoiceSent => "INVOICE_SENT",
            BillingEventType::InvoicePaid => "INVOICE_PAID",
            BillingEventType::InvoiceFailed => "INVOICE_FAILED",
            BillingEventType::InvoiceVoided => "INVOICE_VOIDED",
            BillingEventType::InvoiceRetried => "INVOICE_RETRIED",
            BillingEventType::PaymentOnVoidInvoice => "PAYMENT_ON_VOID_INVOICE",
            BillingEventType::SubscriptionCreated => "SUBSCRIPTION_CREATED",
            BillingEventType::SubscriptionActivated => "SUBSCRIPTION_ACTIVATED",
            BillingEventType::SubscriptionCharged => "SUBSCRIPTION_CHARGED",
            BillingEventType::PaymentFailed => "PAYMENT_FAILED",
            BillingEventType::SubscriptionCanceled => "SUBSCRIPTION_CANCELED",
            BillingEventType::UsageSpike => "USAGE_SPIKE",
            BillingEventType::UsageVoided => "USAGE_VOIDED",
        }
    }
}

impl std::fmt::Display for BillingEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BillingEventType {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let event_type = match s {
            "INVOICE_CREATED" => BillingEventType::InvoiceCreated,
            "INVOICE_SENT" => BillingEventType::InvoiceSent,
            "INVOICE_PAID" => BillingEventType::InvoicePaid,
            "INVOICE_FAILED" => BillingEventType::InvoiceFailed,
            "INVOICE_VOIDED" => BillingEventType::InvoiceVoided,
            "INVOICE_RETRIED" => BillingEventType::InvoiceRetried,
            "PAYMENT_ON_VOID_INVOICE" => BillingEventType::PaymentOnVoidInvoice,
            "SUBSCRIPTION_CREATED" => BillingEventType::SubscriptionCreated,
            "SUBSCRIPTION_ACTIVATED" => BillingEventType::SubscriptionActivated,
            "SUBSCRIPTION_CHARGED" => BillingEventType::SubscriptionCharged,
            "PAYMENT_FAILED" => BillingEventType::PaymentFailed,
            "SUBSCRIPTION_CANCELED" => BillingEventType::SubscriptionCanceled,
            "USAGE_SPIKE" => BillingEventType::UsageSpike,
            "USAGE_VOIDED" => BillingEventType::UsageVoided,
            other => {
                return Err(BillingError::Internal(format!(
                    "Unknown billing event type: {}",
                    other
                )))
            }
        };
        Ok(event_type)
    }
}

/// Who triggered the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorType {
    /// Operator action (void, manual retry)
    Operator,
    /// Scheduled jobs and engine automation
    System,
    /// Payment gateway notification
    Gateway,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::Operator => write!(f, "operator"),
            ActorType::System => write!(f, "system"),
            ActorType::Gateway => write!(f, "gateway"),
        }
    }
}

impl FromStr for ActorType {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "operator" => Ok(ActorType::Operator),
            "system" => Ok(ActorType::System),
            "gateway" => Ok(ActorType::Gateway),
            other => Err(BillingError::Internal(format!("Unknown actor type: {}", other))),
        }
    }
}

/// A billing event record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingEvent {
    pub id: Uuid,
    pub customer_id: CustomerId,
    pub event_type: BillingEventType,
    pub invoice_id: Option<InvoiceId>,
    pub subscription_id: Option<SubscriptionId>,
    pub gateway_reference: Option<String>,
    pub event_data: serde_json::Value,
    pub actor_type: ActorType,
    /// Someone outside the engine must be told about this event
    pub requires_notification: bool,
    pub notified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl BillingEvent {
    /// Flagged for notification and not yet delivered
    pub fn is_pending_notification(&self) -> bool {
        self.requires_notification && self.notified_at.is_none()
    }
}

/// Builder for creating billing events
pub struct BillingEventBuilder {
    customer_id: CustomerId,
    event_type: BillingEventType,
    invoice_id: Option<InvoiceId>,
    subscription_id: Option<SubscriptionId>,
    gateway_reference: Option<String>,
    event_data: serde_json::Value,
    actor_type: ActorType,
    requires_notification: bool,
}

impl BillingEventBuilder {
    /// Create a new event builder
    pub fn new(customer_id: CustomerId, event_type: BillingEventType) -> Self {
        Self {
            customer_id,
            event_type,
            invoice_id: None,
            subscription_id: None,
            gateway_reference: None,
            event_data: serde_json::json!({}),
            actor_type: ActorType::System,
            requires_notification: false,
        }
    }

    /// Set the event data
    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.event_data = data;
        self
    }

    pub fn invoice(mut self, invoice_id: InvoiceId) -> Self {
        self.invoice_id = Some(invoice_id);
        self
    }

    pub fn subscription(mut self, subscription_id: SubscriptionId) -> Self {
        self.subscription_id = Some(subscription_id);
        self
    }

    /// Set the gateway reference (invoice or subscription id at the processor)
    pub fn gateway_reference(mut self, reference: Option<&str>) -> Self {
        self.gateway_reference = reference.map(str::to_string);
        self
    }

    pub fn actor_type(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }

    /// Flag the event for outbound customer notification
    pub fn notify(mut self) -> Self {
        self.requires_notification = true;
        self
    }

    pub fn build(self) -> BillingEvent {
        BillingEvent {
            id: Uuid::new_v4(),
            customer_id: self.customer_id,
            event_type: self.event_type,
            invoice_id: self.invoice_id,
            subscription_id: self.subscription_id,
            gateway_reference: self.gateway_reference,
            event_data: self.event_data,
            actor_type: self.actor_type,
            requires_notification: self.requires_notification,
            notified_at: None,
            created_at: Utc::now(),
        }
    }
}

/// Service for logging and querying billing events
#[derive(Clone)]
pub struct BillingEventLogger {
    store: Arc<dyn EventStore>,
}

impl BillingEventLogger {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    /// Log a billing event
    pub async fn log_event(&self, builder: BillingEventBuilder) -> BillingResult<Uuid> {
        let event = builder.build();
        self.store.append_event(&event).await?;
        Ok(event.id)
    }

    /// Log an event where the audit write must not fail the caller.
    ///
    /// The state change it describes has already been committed.
    pub async fn log_event_best_effort(&self, builder: BillingEventBuilder) {
        let event_type = builder.event_type;
        let customer_id = builder.customer_id.clone();
        if let Err(e) = self.log_event(builder).await {
            tracing::error!(
                customer_id = %customer_id,
                event_type = %event_type,
                error = %e,
                "Failed to write billing event"
            );
        }
    }

    /// Get recent events for a customer
    pub async fn get_events_for_customer(
        &self,
        customer_id: &CustomerId,
        limit: usize,
    ) -> BillingResult<Vec<BillingEvent>> {
        self.store.events_for_customer(customer_id, limit).await
    }

    /// Events still waiting for an outbound notification
    pub async fn pending_notifications(&self, limit: usize) -> BillingResult<Vec<BillingEvent>> {
        self.store.pending_notifications(limit).await
    }

    /// Record that the notification for an event went out
    pub async fn mark_notified(&self, event_id: Uuid) -> BillingResult<()> {
        self.store.mark_notified(event_id, Utc::now()).await
    }
}

/// Convenience functions for common event logging scenarios
impl BillingEventLogger {
    /// Log a usage spike above the configured threshold
    pub async fn log_usage_spike(
        &self,
        customer_id: &CustomerId,
        total_unbilled: rust_decimal::Decimal,
        threshold: rust_decimal::Decimal,
    ) {
        let builder = BillingEventBuilder::new(customer_id.clone(), BillingEventType::UsageSpike)
            .data(serde_json::json!({
                "total_unbilled": total_unbilled.to_string(),
                "threshold": threshold.to_string(),
            }));

        self.log_event_best_effort(builder).await
    }

    /// Log an operator void of a single usage event
    pub async fn log_usage_voided(&self, customer_id: &CustomerId, event_id: EventId) {
        let builder = BillingEventBuilder::new(customer_id.clone(), BillingEventType::UsageVoided)
            .data(serde_json::json!({
                "event_id": event_id,
            }))
            .actor_type(ActorType::Operator);

        self.log_event_best_effort(builder).await
    }
}
