//! Scheduled billing jobs
//!
//! Each job is safe to run concurrently with itself and with webhook
//! processing: every state change goes through the engine's compare-and-set
//! operations.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::{debug, error, info, warn};
use usagebill_billing::{BillingResult, BillingService};
use usagebill_shared::{Invoice, InvoiceId, InvoiceStatus};

use crate::config::RetrySettings;

/// Outcome counts of one billing cycle
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleSummary {
    pub invoiced: usize,
    pub nothing_to_bill: usize,
    /// Invoice stored open, gateway step left to the retry job
    pub gateway_failed: usize,
    pub failed: usize,
}

/// Generate invoices for every customer with billable usage
pub async fn run_billing_cycle(
    service: &BillingService,
    period_days: u32,
    min_amount: Decimal,
) -> CycleSummary {
    let mut summary = CycleSummary::default();

    let customers = match service.ledger.customers_with_unbilled(Utc::now()).await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to list customers with unbilled usage");
            return summary;
        }
    };

    if customers.is_empty() {
        return summary; // No work to do
    }

    info!(customers = customers.len(), "Starting billing cycle");

    for customer_id in customers {
        match service
            .invoices
            .generate(&customer_id, period_days, min_amount)
            .await
        {
            Ok(invoice) => {
                summary.invoiced += 1;
                debug!(
                    customer_id = %customer_id,
                    invoice_id = %invoice.invoice_id,
                    amount_total = invoice.amount_total,
                    "Invoiced customer"
                );
            }
            Err(e) if e.is_expected() => summary.nothing_to_bill += 1,
            Err(e) if e.is_retryable() => {
                summary.gateway_failed += 1;
                warn!(
                    customer_id = %customer_id,
                    error = %e,
                    "Invoice left open, gateway retry job will resend"
                );
            }
            Err(e) => {
                summary.failed += 1;
                error!(customer_id = %customer_id, error = %e, "Failed to invoice customer");
            }
        }
    }

    info!(
        invoiced = summary.invoiced,
        nothing_to_bill = summary.nothing_to_bill,
        gateway_failed = summary.gateway_failed,
        failed = summary.failed,
        "Billing cycle complete"
    );
    summary
}

/// Resend open invoices that never reached the gateway.
///
/// Returns how many were sent.
pub async fn retry_unsent_invoices(
    service: &BillingService,
    settings: &RetrySettings,
    older_than: DateTime<Utc>,
) -> usize {
    let invoices = match service.invoices.unsent(older_than).await {
        Ok(i) => i,
        Err(e) => {
            error!(error = %e, "Failed to list unsent invoices");
            return 0;
        }
    };

    if invoices.is_empty() {
        return 0;
    }

    info!(count = invoices.len(), "Retrying unsent invoices");

    let mut sent = 0;
    for invoice in invoices {
        match send_with_backoff(service, invoice.invoice_id, settings).await {
            Ok(invoice) => {
                sent += 1;
                info!(
                    customer_id = %invoice.customer_id,
                    invoice_id = %invoice.invoice_id,
                    payment_reference = ?invoice.payment_reference,
                    "Unsent invoice delivered to gateway"
                );
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    invoice_id = %invoice.invoice_id,
                    attempts = settings.attempts,
                    error = %e,
                    "Gateway still failing, invoice stays open"
                );
            }
            Err(e) => {
                error!(
                    invoice_id = %invoice.invoice_id,
                    error = %e,
                    "Gateway rejected invoice, needs operator attention"
                );
            }
        }
    }
    sent
}

async fn send_with_backoff(
    service: &BillingService,
    invoice_id: InvoiceId,
    settings: &RetrySettings,
) -> BillingResult<Invoice> {
    // 2^n * base, capped, with jitter
    let retry_strategy = ExponentialBackoff::from_millis(2)
        .factor(settings.base_delay.as_millis() as u64)
        .max_delay(settings.max_delay)
        .take(settings.attempts)
        .map(jitter);

    Retry::spawn(retry_strategy, || async {
        let result = service.invoices.retry_gateway(invoice_id).await;

        match &result {
            Ok(_) => Ok(result),
            Err(e) if e.is_retryable() => {
                debug!(invoice_id = %invoice_id, error = %e, "Transient gateway error - will retry");
                Err(result) // Return error to trigger retry
            }
            Err(_) => Ok(result), // Permanent errors stop retrying
        }
    })
    .await
    .unwrap_or_else(|e| e)
}

/// Poll the gateway for every sent invoice and apply the reported status.
///
/// Catches payments whose webhooks were lost. Returns how many invoices
/// changed status.
pub async fn poll_payment_status(service: &BillingService) -> usize {
    let invoices = match service.invoices.list_by_status(InvoiceStatus::Sent).await {
        Ok(i) => i,
        Err(e) => {
            error!(error = %e, "Failed to list sent invoices");
            return 0;
        }
    };

    let mut changed = 0;
    for invoice in invoices {
        match service.invoices.check_payment_status(invoice.invoice_id).await {
            Ok(check) if check.invoice.status != InvoiceStatus::Sent => {
                changed += 1;
                info!(
                    invoice_id = %invoice.invoice_id,
                    status = %check.invoice.status,
                    amount_paid = check.amount_paid,
                    "Payment status picked up by poll"
                );
            }
            Ok(_) => {}
            Err(e) => {
                warn!(invoice_id = %invoice.invoice_id, error = %e, "Payment status check failed");
            }
        }
    }

    if changed > 0 {
        info!(changed = changed, "Payment status sweep complete");
    }
    changed
}

/// Hand pending notification obligations to the log and mark them delivered
pub async fn dispatch_notifications(service: &BillingService, batch_size: usize) -> usize {
    let pending = match service.events.pending_notifications(batch_size).await {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "Failed to load pending notifications");
            return 0;
        }
    };

    let mut delivered = 0;
    for event in pending {
        info!(
            target: "usagebill::notifications",
            event_id = %event.id,
            customer_id = %event.customer_id,
            event_type = %event.event_type,
            invoice_id = ?event.invoice_id,
            subscription_id = ?event.subscription_id,
            data = %event.event_data,
            "Customer notification"
        );

        match service.events.mark_notified(event.id).await {
            Ok(()) => delivered += 1,
            Err(e) => error!(event_id = %event.id, error = %e, "Failed to mark notification delivered"),
        }
    }
    delivered
}
