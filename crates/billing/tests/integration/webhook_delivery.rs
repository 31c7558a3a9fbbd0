//! Webhook delivery tests
//!
//! Signed notifications flowing through `WebhookHandler` into invoice and
//! subscription state, including redelivery and tampering.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use usagebill_billing::{
    signature_header, BillingError, BillingEventType, BillingPolicy, BillingService, GatewaySubscriptionStatus,
    InMemoryGateway, PaymentGateway, WebhookHandler, WebhookOutcome,
};
use usagebill_shared::{BillingInterval, CustomerId, Invoice, InvoiceStatus, NewUsageEvent, SubscriptionStatus};

const SECRET: &str = "whsec_integration";

struct Harness {
    service: BillingService,
    gateway: Arc<InMemoryGateway>,
    webhooks: WebhookHandler,
}

fn setup() -> Harness {
    let gateway = Arc::new(InMemoryGateway::new());
    let service = BillingService::in_memory(
        gateway.clone() as Arc<dyn PaymentGateway>,
        BillingPolicy::default(),
    );
    let webhooks = service.webhook_handler(SECRET);
    Harness {
        service,
        gateway,
        webhooks,
    }
}

async fn sent_invoice(service: &BillingService, customer: &str) -> Invoice {
    let customer = CustomerId::new(customer);
    service
        .ledger
        .record(NewUsageEvent::new(
            customer.clone(),
            "api_calls",
            Decimal::from(2500),
            "calls",
            Decimal::new(1, 2),
        ))
        .await
        .unwrap();
    service
        .invoices
        .generate(&customer, 30, Decimal::ZERO)
        .await
        .unwrap()
}

fn notification(id: &str, kind: &str, reference: &str) -> String {
    serde_json::json!({
        "id": id,
        "type": kind,
        "reference": reference,
        "amount": 2500,
    })
    .to_string()
}

fn sign(payload: &str) -> String {
    signature_header(SECRET, Utc::now().timestamp(), payload).unwrap()
}

#[tokio::test]
async fn test_paid_notification_reconciles_invoice() {
    let h = setup();
    let invoice = sent_invoice(&h.service, "cus_hook_paid").await;
    let reference = invoice.payment_reference.clone().unwrap();

    let payload = notification("evt_paid_1", "invoice.paid", &reference);
    let outcome = h.webhooks.process(&payload, &sign(&payload)).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::Applied);

    let paid = h.service.invoices.get(invoice.invoice_id).await.unwrap();
    assert_eq!(paid.status, InvoiceStatus::Paid);
    assert_eq!(paid.amount_paid, Some(2500));
}

#[tokio::test]
async fn test_duplicate_delivery_is_a_no_op() {
    let h = setup();
    let invoice = sent_invoice(&h.service, "cus_hook_dup").await;
    let reference = invoice.payment_reference.clone().unwrap();

    let payload = notification("evt_dup_1", "invoice.paid", &reference);
    let signature = sign(&payload);

    assert_eq!(
        h.webhooks.process(&payload, &signature).await.unwrap(),
        WebhookOutcome::Applied
    );
    let after_first = h.service.invoices.get(invoice.invoice_id).await.unwrap();

    assert_eq!(
        h.webhooks.process(&payload, &signature).await.unwrap(),
        WebhookOutcome::Duplicate
    );
    let after_second = h.service.invoices.get(invoice.invoice_id).await.unwrap();
    assert_eq!(after_first, after_second);
}

#[tokio::test]
async fn test_bad_signature_is_rejected() {
    let h = setup();
    let invoice = sent_invoice(&h.service, "cus_hook_forged").await;
    let reference = invoice.payment_reference.clone().unwrap();

    let payload = notification("evt_forged", "invoice.paid", &reference);
    let forged = signature_header("whsec_other", Utc::now().timestamp(), &payload).unwrap();

    let err = h.webhooks.process(&payload, &forged).await.unwrap_err();
    assert!(matches!(err, BillingError::WebhookSignatureInvalid));

    // Signed body, altered in transit
    let tampered = payload.replace("2500", "1");
    let err = h.webhooks.process(&tampered, &sign(&payload)).await.unwrap_err();
    assert!(matches!(err, BillingError::WebhookSignatureInvalid));

    let err = h.webhooks.process(&payload, "garbage").await.unwrap_err();
    assert!(matches!(err, BillingError::WebhookSignatureInvalid));

    // One flipped hex digit, and a truncated digest
    let genuine = sign(&payload);
    let last = genuine.chars().last().unwrap();
    let flipped = format!("{}{}", &genuine[..genuine.len() - 1], if last == '0' { '1' } else { '0' });
    let err = h.webhooks.process(&payload, &flipped).await.unwrap_err();
    assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    let truncated = &genuine[..genuine.len() - 2];
    let err = h.webhooks.process(&payload, truncated).await.unwrap_err();
    assert!(matches!(err, BillingError::WebhookSignatureInvalid));

    let unchanged = h.service.invoices.get(invoice.invoice_id).await.unwrap();
    assert_eq!(unchanged.status, InvoiceStatus::Sent);
}

#[tokio::test]
async fn test_stale_timestamp_is_rejected() {
    let h = setup();
    let payload = notification("evt_old", "invoice.paid", "in_mem_1");
    let old = Utc::now().timestamp() - 3600;
    let signature = signature_header(SECRET, old, &payload).unwrap();

    let err = h.webhooks.verify(&payload, &signature).unwrap_err();
    assert!(matches!(err, BillingError::WebhookSignatureInvalid));
}

#[tokio::test]
async fn test_unknown_type_and_reference_are_ignored() {
    let h = setup();

    let payload = notification("evt_customer", "customer.created", "cus_123");
    let outcome = h.webhooks.process(&payload, &sign(&payload)).await.unwrap();
    assert!(matches!(outcome, WebhookOutcome::Ignored(_)));

    let payload = notification("evt_missing", "invoice.paid", "in_unknown");
    let outcome = h.webhooks.process(&payload, &sign(&payload)).await.unwrap();
    assert!(matches!(outcome, WebhookOutcome::Ignored(_)));
}

#[tokio::test]
async fn test_late_failure_after_payment_leaves_invoice_paid() {
    let h = setup();
    let invoice = sent_invoice(&h.service, "cus_hook_order").await;
    let reference = invoice.payment_reference.clone().unwrap();

    let paid = notification("evt_order_paid", "invoice.paid", &reference);
    h.webhooks.process(&paid, &sign(&paid)).await.unwrap();

    let failed = notification("evt_order_failed", "invoice.payment_failed", &reference);
    h.webhooks.process(&failed, &sign(&failed)).await.unwrap();

    let current = h.service.invoices.get(invoice.invoice_id).await.unwrap();
    assert_eq!(current.status, InvoiceStatus::Paid);
}

#[tokio::test]
async fn test_payment_for_void_invoice_raises_notification() {
    let h = setup();
    let invoice = sent_invoice(&h.service, "cus_hook_void_paid").await;
    let reference = invoice.payment_reference.clone().unwrap();
    h.service.invoices.void(invoice.invoice_id).await.unwrap();

    let paid = notification("evt_void_paid", "invoice.paid", &reference);
    let outcome = h.webhooks.process(&paid, &sign(&paid)).await.unwrap();
    assert!(matches!(outcome, WebhookOutcome::Ignored(_)));

    let current = h.service.invoices.get(invoice.invoice_id).await.unwrap();
    assert_eq!(current.status, InvoiceStatus::Void);

    let pending = h.service.events.pending_notifications(10).await.unwrap();
    let stray: Vec<_> = pending
        .iter()
        .filter(|e| e.event_type == BillingEventType::PaymentOnVoidInvoice)
        .collect();
    assert_eq!(stray.len(), 1);
    assert_eq!(stray[0].invoice_id, Some(invoice.invoice_id));
}

#[tokio::test]
async fn test_voided_notification_voids_sent_invoice() {
    let h = setup();
    let invoice = sent_invoice(&h.service, "cus_hook_voided").await;
    let reference = invoice.payment_reference.clone().unwrap();

    let voided = notification("evt_voided", "invoice.voided", &reference);
    let outcome = h.webhooks.process(&voided, &sign(&voided)).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::Applied);

    let current = h.service.invoices.get(invoice.invoice_id).await.unwrap();
    assert_eq!(current.status, InvoiceStatus::Void);
}

#[tokio::test]
async fn test_subscription_charge_failures_via_webhook() {
    let h = setup();
    h.gateway
        .set_subscription_status_on_create(GatewaySubscriptionStatus::Active)
        .await;
    let subscription = h
        .service
        .subscriptions
        .create(&CustomerId::new("cus_hook_sub"), 2000, BillingInterval::Month)
        .await
        .unwrap();
    let reference = subscription.gateway_reference.clone().unwrap();

    for attempt in 0..3 {
        let payload = notification(
            &format!("evt_charge_failed_{}", attempt),
            "subscription.charge_failed",
            &reference,
        );
        let outcome = h.webhooks.process(&payload, &sign(&payload)).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Applied);
    }

    let current = h
        .service
        .subscriptions
        .get(subscription.subscription_id)
        .await
        .unwrap();
    assert_eq!(current.status, SubscriptionStatus::Canceled);
    assert_eq!(current.failure_count, 3);
}

#[tokio::test]
async fn test_malformed_body_with_valid_signature() {
    let h = setup();
    let payload = r#"{"id":"evt_bad","type":"invoice.paid"}"#;
    let err = h.webhooks.verify(payload, &sign(payload)).unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));
}
