//! In-process store backend
//!
//! Single-mutex implementation of every store trait. All state lives behind
//! one `tokio::sync::Mutex`, so each trait call is atomic with respect to every
//! other call, including the compare-and-set in [`UsageStore::mark_billed`].

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use usagebill_shared::{
    CustomerId, EventId, Invoice, InvoiceId, InvoiceStatus, Subscription, SubscriptionId,
    SubscriptionStatus, UsageEvent,
};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::BillingEvent;
use crate::store::{EventStore, InvoiceStore, SubscriptionStore, UsageStore};

#[derive(Default)]
struct Inner {
    /// Insertion order
    usage: Vec<UsageEvent>,
    usage_index: HashMap<EventId, usize>,
    next_sequence: i64,
    invoices: HashMap<InvoiceId, Invoice>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    billing_events: Vec<BillingEvent>,
    processed_webhooks: HashMap<String, String>,
}

/// Store backend for tests and single-process deployments
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageStore for InMemoryStore {
    async fn append(&self, events: Vec<UsageEvent>) -> BillingResult<Vec<UsageEvent>> {
        let mut inner = self.inner.lock().await;

        let mut seen = HashSet::new();
        for event in &events {
            if inner.usage_index.contains_key(&event.event_id) || !seen.insert(event.event_id) {
                return Err(BillingError::Conflict(format!(
                    "Usage event {} already recorded",
                    event.event_id
                )));
            }
        }

        let recorded_at = Utc::now();
        let mut stored = Vec::with_capacity(events.len());
        for mut event in events {
            inner.next_sequence += 1;
            event.sequence = inner.next_sequence;
            event.recorded_at = recorded_at;
            let position = inner.usage.len();
            inner.usage_index.insert(event.event_id, position);
            inner.usage.push(event.clone());
            stored.push(event);
        }

        Ok(stored)
    }

    async fn unbilled(
        &self,
        customer_id: &CustomerId,
        as_of: DateTime<Utc>,
    ) -> BillingResult<Vec<UsageEvent>> {
        let inner = self.inner.lock().await;
        let mut events: Vec<UsageEvent> = inner
            .usage
            .iter()
            .filter(|e| &e.customer_id == customer_id && e.is_billable() && e.occurred_at <= as_of)
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.occurred_at, e.sequence));
        Ok(events)
    }

    async fn mark_billed(&self, event_ids: &[EventId], invoice_id: InvoiceId) -> BillingResult<()> {
        let mut inner = self.inner.lock().await;

        // Validate the whole set before touching anything
        let mut positions = Vec::with_capacity(event_ids.len());
        let mut seen = HashSet::new();
        for id in event_ids {
            if !seen.insert(*id) {
                return Err(BillingError::Conflict(format!(
                    "Usage event {} listed twice",
                    id
                )));
            }
            let position = *inner
                .usage_index
                .get(id)
                .ok_or_else(|| BillingError::Conflict(format!("Usage event {} not found", id)))?;
            let event = &inner.usage[position];
            if !event.is_billable() {
                return Err(BillingError::Conflict(format!(
                    "Usage event {} is no longer billable",
                    id
                )));
            }
            positions.push(position);
        }

        for position in positions {
            let event = &mut inner.usage[position];
            event.billed = true;
            event.invoice_id = Some(invoice_id);
        }
        Ok(())
    }

    async fn total_unbilled(&self, customer_id: &CustomerId) -> BillingResult<Decimal> {
        let inner = self.inner.lock().await;
        inner
            .usage
            .iter()
            .filter(|e| &e.customer_id == customer_id && e.is_billable())
            .try_fold(Decimal::ZERO, |total, e| e.amount().and_then(|a| total.checked_add(a)))
            .ok_or_else(|| {
                BillingError::Validation(format!("unbilled total for {} is out of range", customer_id))
            })
    }

    async fn get_event(&self, event_id: EventId) -> BillingResult<Option<UsageEvent>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .usage_index
            .get(&event_id)
            .map(|position| inner.usage[*position].clone()))
    }

    async fn events_for_invoice(&self, invoice_id: InvoiceId) -> BillingResult<Vec<UsageEvent>> {
        let inner = self.inner.lock().await;
        let mut events: Vec<UsageEvent> = inner
            .usage
            .iter()
            .filter(|e| e.invoice_id == Some(invoice_id))
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.occurred_at, e.sequence));
        Ok(events)
    }

    async fn customers_with_unbilled(&self, as_of: DateTime<Utc>) -> BillingResult<Vec<CustomerId>> {
        let inner = self.inner.lock().await;
        let mut customers: Vec<CustomerId> = inner
            .usage
            .iter()
            .filter(|e| e.is_billable() && e.occurred_at <= as_of)
            .map(|e| e.customer_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        customers.sort();
        Ok(customers)
    }

    async fn void_event(&self, event_id: EventId, voided_at: DateTime<Utc>) -> BillingResult<UsageEvent> {
        let mut inner = self.inner.lock().await;
        let position = *inner
            .usage_index
            .get(&event_id)
            .ok_or_else(|| BillingError::NotFound(format!("Usage event {}", event_id)))?;

        let event = &mut inner.usage[position];
        if event.billed {
            return Err(BillingError::Conflict(format!(
                "Usage event {} is already billed",
                event_id
            )));
        }
        if event.voided_at.is_none() {
            event.voided_at = Some(voided_at);
        }
        Ok(event.clone())
    }

    async fn release(&self, invoice_id: InvoiceId) -> BillingResult<u64> {
        let mut inner = self.inner.lock().await;
        let mut released = 0;
        for event in inner.usage.iter_mut() {
            if event.invoice_id == Some(invoice_id) {
                event.billed = false;
                event.invoice_id = None;
                released += 1;
            }
        }
        Ok(released)
    }
}

fn reference_taken(invoices: &HashMap<InvoiceId, Invoice>, invoice: &Invoice) -> bool {
    match &invoice.payment_reference {
        Some(reference) => invoices.values().any(|other| {
            other.invoice_id != invoice.invoice_id
                && other.payment_reference.as_deref() == Some(reference.as_str())
        }),
        None => false,
    }
}

#[async_trait]
impl InvoiceStore for InMemoryStore {
    async fn insert_invoice(&self, invoice: &Invoice) -> BillingResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.invoices.contains_key(&invoice.invoice_id) {
            return Err(BillingError::Conflict(format!(
                "Invoice {} already exists",
                invoice.invoice_id
            )));
        }
        if reference_taken(&inner.invoices, invoice) {
            return Err(BillingError::Conflict(
                "Payment reference already attached to another invoice".to_string(),
            ));
        }
        inner.invoices.insert(invoice.invoice_id, invoice.clone());
        Ok(())
    }

    async fn update_invoice(&self, invoice: &Invoice, expected: InvoiceStatus) -> BillingResult<()> {
        let mut inner = self.inner.lock().await;
        let current = inner
            .invoices
            .get(&invoice.invoice_id)
            .map(|i| i.status)
            .ok_or_else(|| BillingError::NotFound(format!("Invoice {}", invoice.invoice_id)))?;
        if current != expected {
            return Err(BillingError::Conflict(format!(
                "Invoice {} is {}, expected {}",
                invoice.invoice_id, current, expected
            )));
        }
        if reference_taken(&inner.invoices, invoice) {
            return Err(BillingError::Conflict(
                "Payment reference already attached to another invoice".to_string(),
            ));
        }
        inner.invoices.insert(invoice.invoice_id, invoice.clone());
        Ok(())
    }

    async fn get_invoice(&self, invoice_id: InvoiceId) -> BillingResult<Option<Invoice>> {
        let inner = self.inner.lock().await;
        Ok(inner.invoices.get(&invoice_id).cloned())
    }

    async fn find_invoice_by_reference(&self, reference: &str) -> BillingResult<Option<Invoice>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .invoices
            .values()
            .find(|i| i.payment_reference.as_deref() == Some(reference))
            .cloned())
    }

    async fn invoices_for_customer(&self, customer_id: &CustomerId) -> BillingResult<Vec<Invoice>> {
        let inner = self.inner.lock().await;
        let mut invoices: Vec<Invoice> = inner
            .invoices
            .values()
            .filter(|i| &i.customer_id == customer_id)
            .cloned()
            .collect();
        invoices.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(invoices)
    }

    async fn invoices_by_status(&self, status: InvoiceStatus) -> BillingResult<Vec<Invoice>> {
        let inner = self.inner.lock().await;
        let mut invoices: Vec<Invoice> = inner
            .invoices
            .values()
            .filter(|i| i.status == status)
            .cloned()
            .collect();
        invoices.sort_by_key(|i| i.created_at);
        Ok(invoices)
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryStore {
    async fn insert_subscription(&self, subscription: &Subscription) -> BillingResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.subscriptions.contains_key(&subscription.subscription_id) {
            return Err(BillingError::Conflict(format!(
                "Subscription {} already exists",
                subscription.subscription_id
            )));
        }
        inner
            .subscriptions
            .insert(subscription.subscription_id, subscription.clone());
        Ok(())
    }

    async fn update_subscription(&self, subscription: &Subscription) -> BillingResult<()> {
        let mut inner = self.inner.lock().await;
        match inner.subscriptions.get_mut(&subscription.subscription_id) {
            Some(existing) => {
                *existing = subscription.clone();
                Ok(())
            }
            None => Err(BillingError::NotFound(format!(
                "Subscription {}",
                subscription.subscription_id
            ))),
        }
    }

    async fn get_subscription(
        &self,
        subscription_id: SubscriptionId,
    ) -> BillingResult<Option<Subscription>> {
        let inner = self.inner.lock().await;
        Ok(inner.subscriptions.get(&subscription_id).cloned())
    }

    async fn find_subscription_by_reference(
        &self,
        reference: &str,
    ) -> BillingResult<Option<Subscription>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .subscriptions
            .values()
            .find(|s| s.gateway_reference.as_deref() == Some(reference))
            .cloned())
    }

    async fn subscriptions_for_customer(
        &self,
        customer_id: &CustomerId,
    ) -> BillingResult<Vec<Subscription>> {
        let inner = self.inner.lock().await;
        let mut subscriptions: Vec<Subscription> = inner
            .subscriptions
            .values()
            .filter(|s| &s.customer_id == customer_id)
            .cloned()
            .collect();
        subscriptions.sort_by_key(|s| s.created_at);
        Ok(subscriptions)
    }

    async fn subscriptions_due(&self, as_of: DateTime<Utc>) -> BillingResult<Vec<Subscription>> {
        let inner = self.inner.lock().await;
        let mut due: Vec<Subscription> = inner
            .subscriptions
            .values()
            .filter(|s| {
                matches!(s.status, SubscriptionStatus::Active | SubscriptionStatus::PastDue)
                    && s.next_charge_at <= as_of
            })
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_charge_at);
        Ok(due)
    }
}

#[async_trait]
impl EventStore for InMemoryStore {
    async fn append_event(&self, event: &BillingEvent) -> BillingResult<()> {
        let mut inner = self.inner.lock().await;
        inner.billing_events.push(event.clone());
        Ok(())
    }

    async fn events_for_customer(
        &self,
        customer_id: &CustomerId,
        limit: usize,
    ) -> BillingResult<Vec<BillingEvent>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .billing_events
            .iter()
            .rev()
            .filter(|e| &e.customer_id == customer_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn pending_notifications(&self, limit: usize) -> BillingResult<Vec<BillingEvent>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .billing_events
            .iter()
            .filter(|e| e.is_pending_notification())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_notified(&self, event_id: Uuid, notified_at: DateTime<Utc>) -> BillingResult<()> {
        let mut inner = self.inner.lock().await;
        let event = inner
            .billing_events
            .iter_mut()
            .find(|e| e.id == event_id)
            .ok_or_else(|| BillingError::NotFound(format!("Billing event {}", event_id)))?;
        event.notified_at.get_or_insert(notified_at);
        Ok(())
    }

    async fn claim_notification(
        &self,
        notification_id: &str,
        notification_type: &str,
    ) -> BillingResult<bool> {
        let mut inner = self.inner.lock().await;
        if inner.processed_webhooks.contains_key(notification_id) {
            return Ok(false);
        }
        inner
            .processed_webhooks
            .insert(notification_id.to_string(), notification_type.to_string());
        Ok(true)
    }

    async fn release_notification(&self, notification_id: &str) -> BillingResult<()> {
        self.inner.lock().await.processed_webhooks.remove(notification_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use usagebill_shared::EventMetadata;

    fn usage(customer: &str, cents: i64) -> UsageEvent {
        UsageEvent {
            event_id: EventId::new(),
            customer_id: CustomerId::new(customer),
            service: "api_calls".to_string(),
            quantity: Decimal::from(1),
            unit: "call".to_string(),
            unit_price: Decimal::new(cents, 2),
            occurred_at: Utc::now(),
            metadata: EventMetadata::new(),
            billed: false,
            invoice_id: None,
            sequence: 0,
            recorded_at: Utc::now(),
            voided_at: None,
        }
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_sequence() {
        let store = InMemoryStore::new();
        let stored = store
            .append(vec![usage("a", 100), usage("a", 200)])
            .await
            .unwrap();
        assert_eq!(stored[0].sequence, 1);
        assert_eq!(stored[1].sequence, 2);
    }

    #[tokio::test]
    async fn test_append_rejects_duplicate_ids_atomically() {
        let store = InMemoryStore::new();
        let event = usage("a", 100);
        let err = store
            .append(vec![usage("a", 50), event.clone(), event])
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Conflict(_)));
        assert_eq!(store.total_unbilled(&CustomerId::new("a")).await.unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_mark_billed_is_all_or_nothing() {
        let store = InMemoryStore::new();
        let stored = store
            .append(vec![usage("a", 100), usage("a", 200)])
            .await
            .unwrap();
        let first = stored[0].event_id;
        let second = stored[1].event_id;

        store.mark_billed(&[first], InvoiceId::new()).await.unwrap();

        // Second set overlaps an already billed event
        let err = store
            .mark_billed(&[first, second], InvoiceId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Conflict(_)));

        let untouched = store.get_event(second).await.unwrap().unwrap();
        assert!(!untouched.billed);
        assert!(untouched.invoice_id.is_none());
    }

    #[tokio::test]
    async fn test_release_returns_events_to_unbilled() {
        let store = InMemoryStore::new();
        let stored = store.append(vec![usage("a", 100)]).await.unwrap();
        let invoice_id = InvoiceId::new();
        store
            .mark_billed(&[stored[0].event_id], invoice_id)
            .await
            .unwrap();

        assert_eq!(store.release(invoice_id).await.unwrap(), 1);
        let unbilled = store.unbilled(&CustomerId::new("a"), Utc::now()).await.unwrap();
        assert_eq!(unbilled.len(), 1);
    }

    #[tokio::test]
    async fn test_claim_notification_once() {
        let store = InMemoryStore::new();
        assert!(store.claim_notification("evt_1", "invoice.paid").await.unwrap());
        assert!(!store.claim_notification("evt_1", "invoice.paid").await.unwrap());
    }
}
