//! Storage abstractions for the billing engine
//!
//! The ledger, invoice, subscription and audit stores are injected into the
//! components as trait objects. One authoritative instance is built at startup
//! (see [`crate::memory::InMemoryStore`] and [`crate::postgres::PgStore`]) and
//! shared through `Arc`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;
use usagebill_shared::{
    CustomerId, EventId, Invoice, InvoiceId, InvoiceStatus, Subscription, SubscriptionId,
    UsageEvent,
};

use crate::error::BillingResult;
use crate::events::BillingEvent;

/// Append-only usage ledger storage
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Append validated events atomically: all are stored or none are
    async fn append(&self, events: Vec<UsageEvent>) -> BillingResult<Vec<UsageEvent>>;

    /// Billable events for a customer with `occurred_at <= as_of`,
    /// ordered by `occurred_at` then insertion sequence
    async fn unbilled(&self, customer_id: &CustomerId, as_of: DateTime<Utc>)
        -> BillingResult<Vec<UsageEvent>>;

    /// Compare-and-set `billed = false -> true` for exactly these events.
    ///
    /// Fails with `Conflict` and changes nothing if any event is missing,
    /// voided or already billed.
    async fn mark_billed(&self, event_ids: &[EventId], invoice_id: InvoiceId) -> BillingResult<()>;

    /// Sum of `quantity * unit_price` over billable events
    async fn total_unbilled(&self, customer_id: &CustomerId) -> BillingResult<Decimal>;

    async fn get_event(&self, event_id: EventId) -> BillingResult<Option<UsageEvent>>;

    async fn events_for_invoice(&self, invoice_id: InvoiceId) -> BillingResult<Vec<UsageEvent>>;

    /// Customers that have billable events with `occurred_at <= as_of`
    async fn customers_with_unbilled(&self, as_of: DateTime<Utc>) -> BillingResult<Vec<CustomerId>>;

    /// Operator void of a single unbilled event
    async fn void_event(&self, event_id: EventId, voided_at: DateTime<Utc>) -> BillingResult<UsageEvent>;

    /// Return an invoice's events to the unbilled pool, returns how many
    async fn release(&self, invoice_id: InvoiceId) -> BillingResult<u64>;
}

/// Invoice storage
#[async_trait]
pub trait InvoiceStore: Send + Sync {
    async fn insert_invoice(&self, invoice: &Invoice) -> BillingResult<()>;

    /// Overwrite the stored invoice with the same id.
    ///
    /// Compare-and-set on status: fails with `Conflict` and changes nothing
    /// unless the stored invoice is still in `expected` status.
    async fn update_invoice(&self, invoice: &Invoice, expected: InvoiceStatus) -> BillingResult<()>;

    async fn get_invoice(&self, invoice_id: InvoiceId) -> BillingResult<Option<Invoice>>;

    async fn find_invoice_by_reference(&self, reference: &str) -> BillingResult<Option<Invoice>>;

    /// Newest first
    async fn invoices_for_customer(&self, customer_id: &CustomerId) -> BillingResult<Vec<Invoice>>;

    /// Oldest first
    async fn invoices_by_status(&self, status: InvoiceStatus) -> BillingResult<Vec<Invoice>>;
}

/// Subscription storage
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn insert_subscription(&self, subscription: &Subscription) -> BillingResult<()>;

    async fn update_subscription(&self, subscription: &Subscription) -> BillingResult<()>;

    async fn get_subscription(&self, subscription_id: SubscriptionId)
        -> BillingResult<Option<Subscription>>;

    async fn find_subscription_by_reference(&self, reference: &str)
        -> BillingResult<Option<Subscription>>;

    async fn subscriptions_for_customer(&self, customer_id: &CustomerId)
        -> BillingResult<Vec<Subscription>>;

    /// Active or past-due subscriptions with `next_charge_at <= as_of`
    async fn subscriptions_due(&self, as_of: DateTime<Utc>) -> BillingResult<Vec<Subscription>>;
}

/// Billing audit log and webhook de-duplication
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append_event(&self, event: &BillingEvent) -> BillingResult<()>;

    /// Newest first
    async fn events_for_customer(&self, customer_id: &CustomerId, limit: usize)
        -> BillingResult<Vec<BillingEvent>>;

    /// Events that still require an outbound notification, oldest first
    async fn pending_notifications(&self, limit: usize) -> BillingResult<Vec<BillingEvent>>;

    async fn mark_notified(&self, event_id: Uuid, notified_at: DateTime<Utc>) -> BillingResult<()>;

    /// Atomically claim a webhook notification id.
    ///
    /// Returns `false` when the id was already claimed (duplicate delivery).
    async fn claim_notification(&self, notification_id: &str, notification_type: &str)
        -> BillingResult<bool>;

    /// Drop a claim so a redelivery is processed again
    async fn release_notification(&self, notification_id: &str) -> BillingResult<()>;
}

/// The full set of stores, typically one backend implementing all four
#[derive(Clone)]
pub struct Stores {
    pub usage: Arc<dyn UsageStore>,
    pub invoices: Arc<dyn InvoiceStore>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub events: Arc<dyn EventStore>,
}

impl Stores {
    /// Use one backend for every store
    pub fn from_backend<S>(backend: Arc<S>) -> Self
    where
        S: UsageStore + InvoiceStore + SubscriptionStore + EventStore + 'static,
    {
        Self {
            usage: backend.clone(),
            invoices: backend.clone(),
            subscriptions: backend.clone(),
            events: backend,
        }
    }
}
