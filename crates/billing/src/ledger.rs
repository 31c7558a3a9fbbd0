//! Usage ledger
//!
//! Append-only record of billable usage per customer. Events are validated on
//! the way in and never edited afterwards; the only mutation is the one-time
//! `billed` transition performed by the invoice generator.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use usagebill_shared::{CustomerId, EventId, InvoiceId, NewUsageEvent, UsageEvent};

use crate::error::{BillingError, BillingResult};
use crate::events::BillingEventLogger;
use crate::store::UsageStore;

/// Usage ledger service
#[derive(Clone)]
pub struct UsageLedger {
    store: Arc<dyn UsageStore>,
    event_logger: BillingEventLogger,
}

impl UsageLedger {
    pub fn new(store: Arc<dyn UsageStore>, event_logger: BillingEventLogger) -> Self {
        Self { store, event_logger }
    }

    /// Record a single usage event
    pub async fn record(&self, event: NewUsageEvent) -> BillingResult<UsageEvent> {
        let event = validate(event)?;
        let mut stored = self.store.append(vec![event]).await?;
        let event = stored
            .pop()
            .ok_or_else(|| BillingError::Internal("Store returned no recorded event".to_string()))?;

        tracing::debug!(
            customer_id = %event.customer_id,
            event_id = %event.event_id,
            service = %event.service,
            quantity = %event.quantity,
            "Recorded usage event"
        );

        Ok(event)
    }

    /// Record a batch of usage events.
    ///
    /// Every event is validated first; the batch is stored all-or-nothing.
    pub async fn record_batch(&self, events: Vec<NewUsageEvent>) -> BillingResult<Vec<UsageEvent>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let validated = events
            .into_iter()
            .enumerate()
            .map(|(index, event)| {
                validate(event).map_err(|e| match e {
                    BillingError::Validation(msg) => {
                        BillingError::Validation(format!("event {}: {}", index, msg))
                    }
                    other => other,
                })
            })
            .collect::<BillingResult<Vec<_>>>()?;

        let stored = self.store.append(validated).await?;
        tracing::debug!(count = stored.len(), "Recorded usage batch");
        Ok(stored)
    }

    /// Unbilled, non-voided events up to `as_of`, oldest first
    pub async fn unbilled(
        &self,
        customer_id: &CustomerId,
        as_of: DateTime<Utc>,
    ) -> BillingResult<Vec<UsageEvent>> {
        self.store.unbilled(customer_id, as_of).await
    }

    /// Atomically claim events for an invoice.
    ///
    /// Fails with `Conflict` and changes nothing if any event is already billed,
    /// voided or unknown.
    pub async fn mark_billed(&self, event_ids: &[EventId], invoice_id: InvoiceId) -> BillingResult<()> {
        if event_ids.is_empty() {
            return Err(BillingError::Validation(
                "mark_billed requires at least one event".to_string(),
            ));
        }
        self.store.mark_billed(event_ids, invoice_id).await
    }

    /// Exact revenue waiting to be invoiced
    pub async fn total_unbilled(&self, customer_id: &CustomerId) -> BillingResult<Decimal> {
        self.store.total_unbilled(customer_id).await
    }

    pub async fn get(&self, event_id: EventId) -> BillingResult<UsageEvent> {
        self.store
            .get_event(event_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Usage event {}", event_id)))
    }

    /// Events aggregated into an invoice
    pub async fn events_for_invoice(&self, invoice_id: InvoiceId) -> BillingResult<Vec<UsageEvent>> {
        self.store.events_for_invoice(invoice_id).await
    }

    /// Customers with billable usage up to `as_of`
    pub async fn customers_with_unbilled(&self, as_of: DateTime<Utc>) -> BillingResult<Vec<CustomerId>> {
        self.store.customers_with_unbilled(as_of).await
    }

    /// Operator void of an unbilled event; billed events cannot be voided
    pub async fn void_event(&self, event_id: EventId) -> BillingResult<UsageEvent> {
        let event = self.store.void_event(event_id, Utc::now()).await?;

        tracing::info!(
            customer_id = %event.customer_id,
            event_id = %event_id,
            "Voided usage event"
        );
        self.event_logger
            .log_usage_voided(&event.customer_id, event_id)
            .await;

        Ok(event)
    }

    /// Return an invoice's events to the unbilled pool
    pub(crate) async fn release(&self, invoice_id: InvoiceId) -> BillingResult<u64> {
        self.store.release(invoice_id).await
    }
}

fn validate(event: NewUsageEvent) -> BillingResult<UsageEvent> {
    if event.customer_id.as_str().trim().is_empty() {
        return Err(BillingError::Validation("customer_id must not be empty".to_string()));
    }
    if event.service.trim().is_empty() {
        return Err(BillingError::Validation("service must not be empty".to_string()));
    }
    if event.unit.trim().is_empty() {
        return Err(BillingError::Validation("unit must not be empty".to_string()));
    }
    if event.quantity < Decimal::ZERO {
        return Err(BillingError::Validation(format!(
            "quantity must be non-negative, got {}",
            event.quantity
        )));
    }
    if event.unit_price < Decimal::ZERO {
        return Err(BillingError::Validation(format!(
            "unit_price must be non-negative, got {}",
            event.unit_price
        )));
    }
    if event.quantity.checked_mul(event.unit_price).is_none() {
        return Err(BillingError::Validation(format!(
            "quantity {} * unit_price {} is out of range",
            event.quantity, event.unit_price
        )));
    }

    let now = Utc::now();
    Ok(UsageEvent {
        event_id: EventId::new(),
        customer_id: event.customer_id,
        service: event.service,
        quantity: event.quantity,
        unit: event.unit,
        unit_price: event.unit_price,
        occurred_at: event.occurred_at,
        metadata: event.metadata,
        billed: false,
        invoice_id: None,
        sequence: 0,
        recorded_at: now,
        voided_at: None,
    })
}
