//! End-to-end billing flow against the in-memory store and gateway
//!
//! Covers the usage -> invoice -> payment path, subscription charge
//! failures and the margin projector, all without network or database.
//!
//! ## Running Tests
//! ```bash
//! cargo test --test billing_flow
//! ```

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use usagebill_billing::{
    BillingError, BillingEventType, BillingPolicy, BillingResult, BillingService,
    GatewayPaymentStatus, GatewaySubscriptionStatus, InMemoryGateway, InMemoryStore,
    PaymentGateway, Recommendation, Stores, UsageStore,
};
use usagebill_shared::{
    BillingInterval, CustomerId, EventId, InvoiceId, InvoiceStatus, NewUsageEvent,
    SubscriptionStatus, UsageEvent,
};

// ============================================================================
// Test Utilities
// ============================================================================

fn setup(policy: BillingPolicy) -> (BillingService, Arc<InMemoryGateway>) {
    let gateway = Arc::new(InMemoryGateway::new());
    let service = BillingService::in_memory(gateway.clone() as Arc<dyn PaymentGateway>, policy);
    (service, gateway)
}

fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

fn usage(customer: &CustomerId, service: &str, quantity: &str, unit: &str, price: &str) -> NewUsageEvent {
    NewUsageEvent::new(customer.clone(), service, dec(quantity), unit, dec(price))
}

// ============================================================================
// Invoice generation
// ============================================================================

#[tokio::test]
async fn test_invoice_total_matches_unbilled_usage() {
    let (service, gateway) = setup(BillingPolicy::default());
    let customer = CustomerId::new("cus_totals");

    service
        .ledger
        .record_batch(vec![
            usage(&customer, "api_calls", "5000", "calls", "0.01"),
            usage(&customer, "storage", "12.5", "gb", "0.023"),
            usage(&customer, "api_calls", "1500", "calls", "0.01"),
        ])
        .await
        .unwrap();

    let expected = service.ledger.total_unbilled(&customer).await.unwrap();
    assert_eq!(expected, dec("65.2875"));

    let invoice = service
        .invoices
        .generate(&customer, 30, Decimal::ZERO)
        .await
        .unwrap();

    assert_eq!(invoice.status, InvoiceStatus::Sent);
    assert_eq!(invoice.amount_total, service.policy().to_minor_units(expected).unwrap());
    assert_eq!(invoice.amount_total, 6529);
    assert_eq!(invoice.line_items.len(), 2);
    assert_eq!(invoice.line_items[0].service, "api_calls");
    assert_eq!(invoice.line_items[0].quantity, dec("6500"));
    assert_eq!(invoice.line_items[0].event_count, 2);
    assert!(invoice.payment_reference.is_some());
    assert!(invoice.payment_url.is_some());

    // Gateway lines plus the rounding adjustment add up to the invoice total
    let payables = gateway.payables().await;
    assert_eq!(payables.len(), 1);
    let line_sum: i64 = payables[0].line_items.iter().map(|l| l.amount).sum();
    assert_eq!(line_sum + payables[0].rounding_adjustment(), invoice.amount_total);

    let billed = service.ledger.events_for_invoice(invoice.invoice_id).await.unwrap();
    assert_eq!(billed.len(), 3);
    assert!(billed.iter().all(|e| e.billed && e.invoice_id == Some(invoice.invoice_id)));
    assert_eq!(service.ledger.total_unbilled(&customer).await.unwrap(), Decimal::ZERO);
}

#[tokio::test]
async fn test_second_generate_has_nothing_to_bill() {
    let (service, _gateway) = setup(BillingPolicy::default());
    let customer = CustomerId::new("cus_twice");

    service
        .ledger
        .record(usage(&customer, "api_calls", "100", "calls", "0.05"))
        .await
        .unwrap();

    service
        .invoices
        .generate(&customer, 30, Decimal::ZERO)
        .await
        .unwrap();

    let err = service
        .invoices
        .generate(&customer, 30, Decimal::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::NothingToBill { .. }));
    assert!(err.is_expected());

    assert_eq!(service.invoices.list_for_customer(&customer).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_below_minimum_changes_nothing() {
    let (service, gateway) = setup(BillingPolicy::default());
    let customer = CustomerId::new("cus_small");

    service
        .ledger
        .record(usage(&customer, "api_calls", "10", "calls", "0.01"))
        .await
        .unwrap();

    let err = service
        .invoices
        .generate(&customer, 30, dec("5"))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::NothingToBill { .. }));

    assert_eq!(service.ledger.total_unbilled(&customer).await.unwrap(), dec("0.10"));
    assert!(gateway.payables().await.is_empty());
}

#[tokio::test]
async fn test_old_usage_is_carried_into_the_next_invoice() {
    let (service, _gateway) = setup(BillingPolicy::default());
    let customer = CustomerId::new("cus_carry");
    let old = Utc::now() - Duration::days(45);

    service
        .ledger
        .record(usage(&customer, "api_calls", "100", "calls", "0.01").occurred_at(old))
        .await
        .unwrap();
    service
        .ledger
        .record(usage(&customer, "api_calls", "100", "calls", "0.01"))
        .await
        .unwrap();

    let invoice = service
        .invoices
        .generate(&customer, 30, Decimal::ZERO)
        .await
        .unwrap();

    assert_eq!(invoice.amount_total, 200);
    assert_eq!(invoice.period_start, old);
}

#[tokio::test]
async fn test_concurrent_generate_bills_each_event_once() {
    let (service, _gateway) = setup(BillingPolicy::default());
    let customer = CustomerId::new("cus_race");

    for _ in 0..20 {
        service
            .ledger
            .record(usage(&customer, "api_calls", "10", "calls", "0.1"))
            .await
            .unwrap();
    }

    let first = service.clone();
    let second = service.clone();
    let c1 = customer.clone();
    let c2 = customer.clone();

    let (a, b) = tokio::join!(
        tokio::spawn(async move { first.invoices.generate(&c1, 30, Decimal::ZERO).await }),
        tokio::spawn(async move { second.invoices.generate(&c2, 30, Decimal::ZERO).await }),
    );
    let results = [a.unwrap(), b.unwrap()];

    let created: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].amount_total, 2000);

    for result in &results {
        if let Err(e) = result {
            assert!(
                matches!(e, BillingError::NothingToBill { .. } | BillingError::Conflict(_)),
                "unexpected error: {}",
                e
            );
        }
    }

    let invoices = service.invoices.list_for_customer(&customer).await.unwrap();
    assert_eq!(invoices.len(), 1);
    let events = service.ledger.events_for_invoice(invoices[0].invoice_id).await.unwrap();
    assert_eq!(events.len(), 20);
}

/// Usage store where a competing biller claims events right after the
/// generator has read them
struct RacingUsageStore {
    inner: Arc<InMemoryStore>,
    competitor: InvoiceId,
    competitor_claims: usize,
    raced: AtomicBool,
}

impl RacingUsageStore {
    fn new(inner: Arc<InMemoryStore>, competitor_claims: usize) -> Self {
        Self {
            inner,
            competitor: InvoiceId::new(),
            competitor_claims,
            raced: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl UsageStore for RacingUsageStore {
    async fn append(&self, events: Vec<UsageEvent>) -> BillingResult<Vec<UsageEvent>> {
        UsageStore::append(self.inner.as_ref(), events).await
    }

    async fn unbilled(
        &self,
        customer_id: &CustomerId,
        as_of: DateTime<Utc>,
    ) -> BillingResult<Vec<UsageEvent>> {
        let events = UsageStore::unbilled(self.inner.as_ref(), customer_id, as_of).await?;
        if !events.is_empty() && !self.raced.swap(true, Ordering::SeqCst) {
            let claimed: Vec<EventId> = events
                .iter()
                .take(self.competitor_claims)
                .map(|e| e.event_id)
                .collect();
            UsageStore::mark_billed(self.inner.as_ref(), &claimed, self.competitor).await?;
        }
        Ok(events)
    }

    async fn mark_billed(&self, event_ids: &[EventId], invoice_id: InvoiceId) -> BillingResult<()> {
        UsageStore::mark_billed(self.inner.as_ref(), event_ids, invoice_id).await
    }

    async fn total_unbilled(&self, customer_id: &CustomerId) -> BillingResult<Decimal> {
        UsageStore::total_unbilled(self.inner.as_ref(), customer_id).await
    }

    async fn get_event(&self, event_id: EventId) -> BillingResult<Option<UsageEvent>> {
        UsageStore::get_event(self.inner.as_ref(), event_id).await
    }

    async fn events_for_invoice(&self, invoice_id: InvoiceId) -> BillingResult<Vec<UsageEvent>> {
        UsageStore::events_for_invoice(self.inner.as_ref(), invoice_id).await
    }

    async fn customers_with_unbilled(&self, as_of: DateTime<Utc>) -> BillingResult<Vec<CustomerId>> {
        UsageStore::customers_with_unbilled(self.inner.as_ref(), as_of).await
    }

    async fn void_event(&self, event_id: EventId, voided_at: DateTime<Utc>) -> BillingResult<UsageEvent> {
        UsageStore::void_event(self.inner.as_ref(), event_id, voided_at).await
    }

    async fn release(&self, invoice_id: InvoiceId) -> BillingResult<u64> {
        UsageStore::release(self.inner.as_ref(), invoice_id).await
    }
}

fn racing_service(competitor_claims: usize) -> (BillingService, Arc<RacingUsageStore>) {
    let backend = Arc::new(InMemoryStore::new());
    let racing = Arc::new(RacingUsageStore::new(backend.clone(), competitor_claims));
    let stores = Stores {
        usage: racing.clone(),
        invoices: backend.clone(),
        subscriptions: backend.clone(),
        events: backend,
    };
    let service = BillingService::new(
        stores,
        Arc::new(InMemoryGateway::new()),
        BillingPolicy::default(),
    );
    (service, racing)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_generate_yields_when_competitor_claims_everything() {
    let (service, racing) = racing_service(usize::MAX);
    let customer = CustomerId::new("cus_lost_race");

    for _ in 0..5 {
        service
            .ledger
            .record(usage(&customer, "api_calls", "10", "calls", "0.1"))
            .await
            .unwrap();
    }

    let err = service
        .invoices
        .generate(&customer, 30, Decimal::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::NothingToBill { .. }));

    assert!(service.invoices.list_for_customer(&customer).await.unwrap().is_empty());
    let claimed = service.ledger.events_for_invoice(racing.competitor).await.unwrap();
    assert_eq!(claimed.len(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_generate_rereads_after_partial_competing_claim() {
    let (service, racing) = racing_service(2);
    let customer = CustomerId::new("cus_partial_race");

    for _ in 0..5 {
        service
            .ledger
            .record(usage(&customer, "api_calls", "10", "calls", "0.1"))
            .await
            .unwrap();
    }

    let invoice = service
        .invoices
        .generate(&customer, 30, Decimal::ZERO)
        .await
        .unwrap();
    assert_eq!(invoice.amount_total, 300);

    let ours = service.ledger.events_for_invoice(invoice.invoice_id).await.unwrap();
    let theirs = service.ledger.events_for_invoice(racing.competitor).await.unwrap();
    assert_eq!(ours.len(), 3);
    assert_eq!(theirs.len(), 2);
    assert!(ours.iter().all(|e| theirs.iter().all(|t| t.event_id != e.event_id)));

    let invoices = service.invoices.list_for_customer(&customer).await.unwrap();
    assert_eq!(invoices.len(), 1);
}

#[tokio::test]
async fn test_mixed_units_leave_ledger_unchanged() {
    let (service, gateway) = setup(BillingPolicy::default());
    let customer = CustomerId::new("cus_mixed_units");

    service
        .ledger
        .record_batch(vec![
            usage(&customer, "storage", "10", "gb", "0.02"),
            usage(&customer, "storage", "2048", "mb", "0.00002"),
        ])
        .await
        .unwrap();
    let before = service.ledger.total_unbilled(&customer).await.unwrap();

    let err = service
        .invoices
        .generate(&customer, 30, Decimal::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));

    assert_eq!(service.ledger.total_unbilled(&customer).await.unwrap(), before);
    assert_eq!(service.ledger.unbilled(&customer, Utc::now()).await.unwrap().len(), 2);
    assert!(service.invoices.list_for_customer(&customer).await.unwrap().is_empty());
    assert!(gateway.payables().await.is_empty());
}

#[tokio::test]
async fn test_out_of_range_total_leaves_ledger_unchanged() {
    let (service, gateway) = setup(BillingPolicy::default());
    let customer = CustomerId::new("cus_huge");

    // Representable as a decimal, not as minor units in an i64
    service
        .ledger
        .record(NewUsageEvent::new(
            customer.clone(),
            "api_calls",
            Decimal::from_i128_with_scale(10_i128.pow(27), 0),
            "calls",
            Decimal::ONE,
        ))
        .await
        .unwrap();

    let err = service
        .invoices
        .generate(&customer, 30, Decimal::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));

    assert_eq!(service.ledger.unbilled(&customer, Utc::now()).await.unwrap().len(), 1);
    assert!(service.invoices.list_for_customer(&customer).await.unwrap().is_empty());
    assert!(gateway.payables().await.is_empty());
}

#[tokio::test]
async fn test_gateway_failure_leaves_invoice_open_until_retry() {
    let (service, gateway) = setup(BillingPolicy::default());
    let customer = CustomerId::new("cus_outage");

    service
        .ledger
        .record(usage(&customer, "api_calls", "300", "calls", "0.01"))
        .await
        .unwrap();

    gateway.fail_next(1).await;
    let err = service
        .invoices
        .generate(&customer, 30, Decimal::ZERO)
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    let invoices = service.invoices.list_for_customer(&customer).await.unwrap();
    assert_eq!(invoices.len(), 1);
    let open = &invoices[0];
    assert_eq!(open.status, InvoiceStatus::Open);
    assert!(open.payment_reference.is_none());

    // Usage stays claimed by the open invoice
    assert_eq!(service.ledger.total_unbilled(&customer).await.unwrap(), Decimal::ZERO);
    let pending = service.invoices.unsent(Utc::now()).await.unwrap();
    assert_eq!(pending.len(), 1);

    let sent = service.invoices.retry_gateway(open.invoice_id).await.unwrap();
    assert_eq!(sent.status, InvoiceStatus::Sent);
    assert_eq!(sent.amount_total, open.amount_total);
    assert_eq!(sent.line_items, open.line_items);
    assert_eq!(gateway.payables().await.len(), 1);

    let err = service.invoices.retry_gateway(open.invoice_id).await.unwrap_err();
    assert!(matches!(err, BillingError::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_gateway_timeout_is_retryable() {
    let policy = BillingPolicy {
        gateway_timeout: std::time::Duration::from_millis(20),
        ..Default::default()
    };
    let (service, gateway) = setup(policy);
    let customer = CustomerId::new("cus_slow");

    service
        .ledger
        .record(usage(&customer, "api_calls", "1", "calls", "1"))
        .await
        .unwrap();

    gateway.set_delay(Some(std::time::Duration::from_millis(200))).await;
    let err = service
        .invoices
        .generate(&customer, 30, Decimal::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Gateway { retryable: true, .. }));
}

// ============================================================================
// Payment reconciliation
// ============================================================================

#[tokio::test]
async fn test_payment_status_poll_and_repeat_reconcile() {
    let (service, gateway) = setup(BillingPolicy::default());
    let customer = CustomerId::new("cus_paid");

    service
        .ledger
        .record(usage(&customer, "api_calls", "1000", "calls", "0.01"))
        .await
        .unwrap();
    let invoice = service
        .invoices
        .generate(&customer, 30, Decimal::ZERO)
        .await
        .unwrap();
    let reference = invoice.payment_reference.clone().unwrap();

    let check = service.invoices.check_payment_status(invoice.invoice_id).await.unwrap();
    assert_eq!(check.gateway_status, GatewayPaymentStatus::Pending);
    assert_eq!(check.invoice.status, InvoiceStatus::Sent);
    assert_eq!(check.amount_due, 1000);

    gateway
        .set_payment_status(&reference, GatewayPaymentStatus::Paid)
        .await
        .unwrap();
    let check = service.invoices.check_payment_status(invoice.invoice_id).await.unwrap();
    assert_eq!(check.invoice.status, InvoiceStatus::Paid);
    assert_eq!(check.invoice.amount_paid, Some(1000));
    let paid_at = check.invoice.paid_at;

    let again = service
        .invoices
        .reconcile(invoice.invoice_id, GatewayPaymentStatus::Paid, Some(1000))
        .await
        .unwrap();
    assert_eq!(again.status, InvoiceStatus::Paid);
    assert_eq!(again.paid_at, paid_at);

    // A late failure report does not undo the payment
    let stale = service
        .invoices
        .reconcile(invoice.invoice_id, GatewayPaymentStatus::Failed, None)
        .await
        .unwrap();
    assert_eq!(stale.status, InvoiceStatus::Paid);

    let err = service.invoices.void(invoice.invoice_id).await.unwrap_err();
    assert!(matches!(err, BillingError::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_failed_invoice_is_reopened_and_notifies() {
    let (service, _gateway) = setup(BillingPolicy::default());
    let customer = CustomerId::new("cus_declined");

    service
        .ledger
        .record(usage(&customer, "api_calls", "1000", "calls", "0.01"))
        .await
        .unwrap();
    let invoice = service
        .invoices
        .generate(&customer, 30, Decimal::ZERO)
        .await
        .unwrap();

    let failed = service
        .invoices
        .reconcile(invoice.invoice_id, GatewayPaymentStatus::Failed, None)
        .await
        .unwrap();
    assert_eq!(failed.status, InvoiceStatus::Failed);

    let pending = service.events.pending_notifications(10).await.unwrap();
    assert!(pending
        .iter()
        .any(|e| e.event_type == BillingEventType::InvoiceFailed && e.invoice_id == Some(invoice.invoice_id)));

    let reopened = service.invoices.retry_failed(invoice.invoice_id).await.unwrap();
    assert_eq!(reopened.status, InvoiceStatus::Sent);
    assert_eq!(reopened.payment_reference, invoice.payment_reference);
}

#[tokio::test]
async fn test_void_keeps_usage_billed_by_default() {
    let (service, _gateway) = setup(BillingPolicy::default());
    let customer = CustomerId::new("cus_void");

    service
        .ledger
        .record(usage(&customer, "api_calls", "100", "calls", "0.1"))
        .await
        .unwrap();
    let invoice = service
        .invoices
        .generate(&customer, 30, Decimal::ZERO)
        .await
        .unwrap();

    let voided = service.invoices.void(invoice.invoice_id).await.unwrap();
    assert_eq!(voided.status, InvoiceStatus::Void);
    assert_eq!(service.ledger.total_unbilled(&customer).await.unwrap(), Decimal::ZERO);

    // Voiding twice is a no-op
    let again = service.invoices.void(invoice.invoice_id).await.unwrap();
    assert_eq!(again.updated_at, voided.updated_at);

    let err = service
        .invoices
        .reconcile(invoice.invoice_id, GatewayPaymentStatus::Paid, None)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidTransition { .. }));

    // The stray payment still needs a human
    let pending = service.events.pending_notifications(10).await.unwrap();
    assert!(pending.iter().any(|e| e.event_type == BillingEventType::PaymentOnVoidInvoice
        && e.invoice_id == Some(invoice.invoice_id)));
}

#[tokio::test]
async fn test_void_cancels_the_gateway_invoice() {
    let (service, gateway) = setup(BillingPolicy::default());
    let customer = CustomerId::new("cus_void_remote");

    service
        .ledger
        .record(usage(&customer, "api_calls", "100", "calls", "0.1"))
        .await
        .unwrap();
    let invoice = service
        .invoices
        .generate(&customer, 30, Decimal::ZERO)
        .await
        .unwrap();
    let reference = invoice.payment_reference.clone().unwrap();

    service.invoices.void(invoice.invoice_id).await.unwrap();

    let remote = gateway.get_status(&reference).await.unwrap();
    assert_eq!(remote.status, GatewayPaymentStatus::Void);
    assert_eq!(remote.amount_due, 0);
}

#[tokio::test]
async fn test_void_refused_when_customer_already_paid() {
    let (service, gateway) = setup(BillingPolicy::default());
    let customer = CustomerId::new("cus_void_race");

    service
        .ledger
        .record(usage(&customer, "api_calls", "100", "calls", "0.1"))
        .await
        .unwrap();
    let invoice = service
        .invoices
        .generate(&customer, 30, Decimal::ZERO)
        .await
        .unwrap();
    let reference = invoice.payment_reference.clone().unwrap();
    gateway
        .set_payment_status(&reference, GatewayPaymentStatus::Paid)
        .await
        .unwrap();

    let err = service.invoices.void(invoice.invoice_id).await.unwrap_err();
    assert!(matches!(err, BillingError::Gateway { retryable: false, .. }));
    assert_eq!(
        service.invoices.get(invoice.invoice_id).await.unwrap().status,
        InvoiceStatus::Sent
    );

    // The next poll picks up the payment
    let check = service.invoices.check_payment_status(invoice.invoice_id).await.unwrap();
    assert_eq!(check.invoice.status, InvoiceStatus::Paid);
}

#[tokio::test]
async fn test_void_aborts_on_gateway_outage() {
    let (service, gateway) = setup(BillingPolicy::default());
    let customer = CustomerId::new("cus_void_outage");

    service
        .ledger
        .record(usage(&customer, "api_calls", "100", "calls", "0.1"))
        .await
        .unwrap();
    let invoice = service
        .invoices
        .generate(&customer, 30, Decimal::ZERO)
        .await
        .unwrap();

    gateway.fail_next(1).await;
    let err = service.invoices.void(invoice.invoice_id).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(
        service.invoices.get(invoice.invoice_id).await.unwrap().status,
        InvoiceStatus::Sent
    );

    let voided = service.invoices.void(invoice.invoice_id).await.unwrap();
    assert_eq!(voided.status, InvoiceStatus::Void);
}

#[tokio::test]
async fn test_void_proceeds_when_gateway_already_voided() {
    let (service, gateway) = setup(BillingPolicy::default());
    let customer = CustomerId::new("cus_void_twice");

    service
        .ledger
        .record(usage(&customer, "api_calls", "100", "calls", "0.1"))
        .await
        .unwrap();
    let invoice = service
        .invoices
        .generate(&customer, 30, Decimal::ZERO)
        .await
        .unwrap();
    let reference = invoice.payment_reference.clone().unwrap();

    gateway
        .set_payment_status(&reference, GatewayPaymentStatus::Void)
        .await
        .unwrap();
    gateway
        .fail_next_with(BillingError::gateway_rejected(Some(400), "invoice is already void"))
        .await;

    let voided = service.invoices.void(invoice.invoice_id).await.unwrap();
    assert_eq!(voided.status, InvoiceStatus::Void);
}

#[tokio::test]
async fn test_gateway_void_is_applied_to_sent_invoice() {
    let policy = BillingPolicy {
        release_events_on_void: true,
        ..Default::default()
    };
    let (service, gateway) = setup(policy);
    let customer = CustomerId::new("cus_remote_void");

    service
        .ledger
        .record(usage(&customer, "api_calls", "100", "calls", "0.1"))
        .await
        .unwrap();
    let invoice = service
        .invoices
        .generate(&customer, 30, Decimal::ZERO)
        .await
        .unwrap();
    let reference = invoice.payment_reference.clone().unwrap();

    // Voided in the processor's dashboard
    gateway
        .set_payment_status(&reference, GatewayPaymentStatus::Void)
        .await
        .unwrap();

    let check = service.invoices.check_payment_status(invoice.invoice_id).await.unwrap();
    assert_eq!(check.gateway_status, GatewayPaymentStatus::Void);
    assert_eq!(check.invoice.status, InvoiceStatus::Void);
    assert_eq!(service.ledger.total_unbilled(&customer).await.unwrap(), dec("10.0"));

    // Repeating is a no-op
    let again = service
        .invoices
        .reconcile(invoice.invoice_id, GatewayPaymentStatus::Void, None)
        .await
        .unwrap();
    assert_eq!(again.updated_at, check.invoice.updated_at);
}

#[tokio::test]
async fn test_gateway_void_after_failure() {
    let (service, _gateway) = setup(BillingPolicy::default());
    let customer = CustomerId::new("cus_failed_void");

    service
        .ledger
        .record(usage(&customer, "api_calls", "100", "calls", "0.1"))
        .await
        .unwrap();
    let invoice = service
        .invoices
        .generate(&customer, 30, Decimal::ZERO)
        .await
        .unwrap();

    service
        .invoices
        .reconcile(invoice.invoice_id, GatewayPaymentStatus::Failed, None)
        .await
        .unwrap();
    let voided = service
        .invoices
        .reconcile(invoice.invoice_id, GatewayPaymentStatus::Void, None)
        .await
        .unwrap();
    assert_eq!(voided.status, InvoiceStatus::Void);
}

#[tokio::test]
async fn test_payment_link_for_one_off_amount() {
    let (service, gateway) = setup(BillingPolicy::default());

    let url = service
        .invoices
        .create_payment_link("Onboarding fee", dec("49.99"))
        .await
        .unwrap();
    assert!(url.starts_with("https://"));
    assert_eq!(gateway.payment_links().await, vec![("Onboarding fee".to_string(), 4999)]);

    let err = service
        .invoices
        .create_payment_link("Onboarding fee", Decimal::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));
    let err = service
        .invoices
        .create_payment_link("  ", dec("1"))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));
    assert_eq!(gateway.payment_links().await.len(), 1);
}

#[tokio::test]
async fn test_void_can_release_usage_for_rebilling() {
    let policy = BillingPolicy {
        release_events_on_void: true,
        ..Default::default()
    };
    let (service, _gateway) = setup(policy);
    let customer = CustomerId::new("cus_rebill");

    service
        .ledger
        .record(usage(&customer, "api_calls", "100", "calls", "0.1"))
        .await
        .unwrap();
    let first = service
        .invoices
        .generate(&customer, 30, Decimal::ZERO)
        .await
        .unwrap();

    service.invoices.void(first.invoice_id).await.unwrap();
    assert_eq!(service.ledger.total_unbilled(&customer).await.unwrap(), dec("10.0"));

    let second = service
        .invoices
        .generate(&customer, 30, Decimal::ZERO)
        .await
        .unwrap();
    assert_ne!(second.invoice_id, first.invoice_id);
    assert_eq!(second.amount_total, first.amount_total);
}

// ============================================================================
// Usage ledger
// ============================================================================

#[tokio::test]
async fn test_negative_quantity_leaves_ledger_unchanged() {
    let (service, _gateway) = setup(BillingPolicy::default());
    let customer = CustomerId::new("cus_negative");

    let err = service
        .ledger
        .record(usage(&customer, "api_calls", "-1", "calls", "0.01"))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));

    // One bad event rejects the whole batch
    let err = service
        .ledger
        .record_batch(vec![
            usage(&customer, "api_calls", "10", "calls", "0.01"),
            usage(&customer, "api_calls", "-1", "calls", "0.01"),
        ])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("event 1"));

    assert!(service.ledger.unbilled(&customer, Utc::now()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_voided_usage_is_never_billed() {
    let (service, _gateway) = setup(BillingPolicy::default());
    let customer = CustomerId::new("cus_voided_event");

    let keep = service
        .ledger
        .record(usage(&customer, "api_calls", "100", "calls", "0.01"))
        .await
        .unwrap();
    let drop = service
        .ledger
        .record(usage(&customer, "api_calls", "900", "calls", "0.01"))
        .await
        .unwrap();

    service.ledger.void_event(drop.event_id).await.unwrap();

    let invoice = service
        .invoices
        .generate(&customer, 30, Decimal::ZERO)
        .await
        .unwrap();
    assert_eq!(invoice.amount_total, 100);

    let billed = service.ledger.events_for_invoice(invoice.invoice_id).await.unwrap();
    assert_eq!(billed.len(), 1);
    assert_eq!(billed[0].event_id, keep.event_id);

    let err = service.ledger.void_event(keep.event_id).await.unwrap_err();
    assert!(matches!(err, BillingError::Conflict(_)));
}

// ============================================================================
// Subscriptions
// ============================================================================

#[tokio::test]
async fn test_three_failures_cancel_subscription_and_notify() {
    let (service, gateway) = setup(BillingPolicy::default());
    let customer = CustomerId::new("cus_sub");

    gateway
        .set_subscription_status_on_create(GatewaySubscriptionStatus::Active)
        .await;
    let subscription = service
        .subscriptions
        .create(&customer, 4900, BillingInterval::Month)
        .await
        .unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::Active);

    let id = subscription.subscription_id;
    let first = service
        .subscriptions
        .on_charge_result(id, false, Utc::now())
        .await
        .unwrap();
    assert_eq!(first.status, SubscriptionStatus::PastDue);
    assert_eq!(first.failure_count, 1);

    service.subscriptions.on_charge_result(id, false, Utc::now()).await.unwrap();
    let canceled = service
        .subscriptions
        .on_charge_result(id, false, Utc::now())
        .await
        .unwrap();
    assert_eq!(canceled.status, SubscriptionStatus::Canceled);
    assert!(canceled.canceled_at.is_some());

    let reference = canceled.gateway_reference.clone().unwrap();
    assert_eq!(
        gateway.subscription_status(&reference).await,
        Some(GatewaySubscriptionStatus::Canceled)
    );

    let pending = service.events.pending_notifications(10).await.unwrap();
    assert!(pending
        .iter()
        .any(|e| e.event_type == BillingEventType::SubscriptionCanceled && e.subscription_id == Some(id)));

    assert!(service.subscriptions.due_for_charge(Utc::now() + Duration::days(400)).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_successful_charge_resets_failures() {
    let (service, gateway) = setup(BillingPolicy::default());
    let customer = CustomerId::new("cus_recover");

    gateway
        .set_subscription_status_on_create(GatewaySubscriptionStatus::Active)
        .await;
    let subscription = service
        .subscriptions
        .create(&customer, 1000, BillingInterval::Week)
        .await
        .unwrap();
    let id = subscription.subscription_id;

    service.subscriptions.on_charge_result(id, false, Utc::now()).await.unwrap();
    let recovered = service
        .subscriptions
        .on_charge_result(id, true, Utc::now())
        .await
        .unwrap();

    assert_eq!(recovered.status, SubscriptionStatus::Active);
    assert_eq!(recovered.failure_count, 0);
    assert_eq!(
        recovered.next_charge_at,
        subscription.next_charge_at + Duration::weeks(1)
    );
}

// ============================================================================
// Projection
// ============================================================================

#[test]
fn test_projection_example() {
    let (service, _gateway) = setup(BillingPolicy::default());
    let projection = service
        .projector
        .project(dec("50000"), dec("0.002"), dec("0.005"))
        .unwrap();

    assert_eq!(projection.monthly_cost, dec("100.0"));
    assert_eq!(projection.monthly_revenue, dec("250.0"));
    assert_eq!(projection.monthly_profit, dec("150.0"));
    assert_eq!(projection.margin_percent, Some(dec("60.0")));
    assert_eq!(projection.recommendation, Recommendation::Viable);
}
