//! Invoice generation and reconciliation
//!
//! Turns a customer's unbilled usage into an invoice, hands the invoice to the
//! payment gateway and applies the payment outcome the gateway reports later.
//!
//! ## Lifecycle
//!
//! ```text
//! open ──gateway ok──> sent ──paid──> paid
//!   │                   │
//!   │                   └──failed──> failed ──retry_failed──> sent
//!   └──────────── void <──────────────┘
//! ```
//!
//! Events are claimed with a compare-and-set before the invoice is stored, so
//! concurrent runs for the same customer never bill an event twice. A gateway
//! failure leaves the invoice `open` with its events still claimed; the retry
//! path only repeats the gateway step.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use usagebill_shared::{
    CustomerId, EventId, Invoice, InvoiceId, InvoiceStatus, LineItem, UsageEvent,
};

use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::gateway::{
    with_timeout, GatewayPaymentStatus, PayableLine, PayableRequest, PaymentGateway, PaymentStatus,
};
use crate::ledger::UsageLedger;
use crate::policy::BillingPolicy;
use crate::store::InvoiceStore;

/// Blended unit prices are shown with this many decimal places
const BLENDED_PRICE_DP: u32 = 6;

/// Result of a payment status check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentCheck {
    pub invoice: Invoice,
    pub gateway_status: GatewayPaymentStatus,
    pub amount_paid: i64,
    pub amount_due: i64,
}

/// Invoice generator service
#[derive(Clone)]
pub struct InvoiceGenerator {
    ledger: UsageLedger,
    invoices: Arc<dyn InvoiceStore>,
    gateway: Arc<dyn PaymentGateway>,
    policy: Arc<BillingPolicy>,
    event_logger: BillingEventLogger,
}

impl InvoiceGenerator {
    pub fn new(
        ledger: UsageLedger,
        invoices: Arc<dyn InvoiceStore>,
        gateway: Arc<dyn PaymentGateway>,
        policy: Arc<BillingPolicy>,
        event_logger: BillingEventLogger,
    ) -> Self {
        Self {
            ledger,
            invoices,
            gateway,
            policy,
            event_logger,
        }
    }

    /// Invoice everything the customer owes up to now.
    ///
    /// Unbilled events older than the period are carried into this invoice.
    /// Fails with `NothingToBill` (and changes nothing) when the exact total is
    /// at or below `min_amount`. A gateway failure is returned after the
    /// invoice has been stored as `open`; use [`Self::retry_gateway`] to resend.
    pub async fn generate(
        &self,
        customer_id: &CustomerId,
        period_days: u32,
        min_amount: Decimal,
    ) -> BillingResult<Invoice> {
        if period_days == 0 {
            return Err(BillingError::Validation("period_days must be positive".to_string()));
        }
        if min_amount < Decimal::ZERO {
            return Err(BillingError::Validation(format!(
                "min_amount must be non-negative, got {}",
                min_amount
            )));
        }

        self.check_usage_spike(customer_id).await?;

        let mut attempt = 0;
        let (invoice_id, lines, exact_total, amount_total, now, period_start) = loop {
            let now = Utc::now();
            let nominal_start = now - Duration::days(i64::from(period_days));

            let events = self.ledger.unbilled(customer_id, now).await?;
            let lines = aggregate(&events)?;
            let exact_total = sum_subtotals(&lines)?;

            if events.is_empty() || exact_total <= min_amount {
                tracing::debug!(
                    customer_id = %customer_id,
                    unbilled_events = events.len(),
                    total = %exact_total,
                    min_amount = %min_amount,
                    "Nothing to bill"
                );
                return Err(BillingError::NothingToBill {
                    customer_id: customer_id.to_string(),
                });
            }

            // Carried-over usage widens the period backwards
            let period_start = events
                .iter()
                .map(|e| e.occurred_at)
                .min()
                .map_or(nominal_start, |oldest| oldest.min(nominal_start));

            let amount_total = self.policy.to_minor_units(exact_total)?;
            let invoice_id = InvoiceId::new();
            let event_ids: Vec<EventId> = events.iter().map(|e| e.event_id).collect();

            match self.ledger.mark_billed(&event_ids, invoice_id).await {
                Ok(()) => break (invoice_id, lines, exact_total, amount_total, now, period_start),
                Err(BillingError::Conflict(reason))
                    if attempt < self.policy.generate_conflict_retries =>
                {
                    attempt += 1;
                    tracing::warn!(
                        customer_id = %customer_id,
                        attempt = attempt,
                        reason = %reason,
                        "Lost billing race, re-reading unbilled usage"
                    );
                }
                Err(e) => return Err(e),
            }
        };

        let invoice = Invoice {
            invoice_id,
            customer_id: customer_id.clone(),
            line_items: lines,
            amount_total,
            currency: self.policy.currency.clone(),
            status: InvoiceStatus::Open,
            period_start,
            period_end: now,
            due_date: now + Duration::days(self.policy.days_until_due),
            payment_reference: None,
            payment_url: None,
            amount_paid: None,
            paid_at: None,
            created_at: now,
            updated_at: now,
        };

        if let Err(e) = self.invoices.insert_invoice(&invoice).await {
            // Do not strand claimed usage behind an invoice that was never stored
            tracing::error!(
                customer_id = %customer_id,
                invoice_id = %invoice_id,
                error = %e,
                "Failed to store invoice, releasing claimed usage"
            );
            if let Err(release_err) = self.ledger.release(invoice_id).await {
                tracing::error!(
                    invoice_id = %invoice_id,
                    error = %release_err,
                    "Failed to release usage for unstored invoice"
                );
            }
            return Err(e);
        }

        tracing::info!(
            customer_id = %customer_id,
            invoice_id = %invoice_id,
            amount_total = amount_total,
            line_items = invoice.line_items.len(),
            "Created invoice"
        );
        self.event_logger
            .log_event_best_effort(
                BillingEventBuilder::new(customer_id.clone(), BillingEventType::InvoiceCreated)
                    .invoice(invoice_id)
                    .data(serde_json::json!({
                        "amount_total": amount_total,
                        "exact_total": exact_total.to_string(),
                        "currency": invoice.currency,
                        "period_start": invoice.period_start,
                        "period_end": invoice.period_end,
                    })),
            )
            .await;

        self.send_to_gateway(invoice).await
    }

    /// Repeat only the gateway step for an `open` invoice
    pub async fn retry_gateway(&self, invoice_id: InvoiceId) -> BillingResult<Invoice> {
        let invoice = self.get(invoice_id).await?;
        if invoice.status != InvoiceStatus::Open || invoice.payment_reference.is_some() {
            return Err(BillingError::InvalidTransition {
                entity: format!("invoice {}", invoice_id),
                from: invoice.status.to_string(),
                to: InvoiceStatus::Sent.to_string(),
            });
        }

        tracing::info!(
            customer_id = %invoice.customer_id,
            invoice_id = %invoice_id,
            "Retrying gateway for open invoice"
        );
        self.send_to_gateway(invoice).await
    }

    async fn send_to_gateway(&self, mut invoice: Invoice) -> BillingResult<Invoice> {
        let request = self.payable_request(&invoice)?;

        let artifact = match with_timeout(
            self.policy.gateway_timeout,
            "create_payable",
            self.gateway.create_payable(&request),
        )
        .await
        {
            Ok(artifact) => artifact,
            Err(e) => {
                tracing::error!(
                    customer_id = %invoice.customer_id,
                    invoice_id = %invoice.invoice_id,
                    retryable = e.is_retryable(),
                    error = %e,
                    "Payment gateway rejected invoice, leaving it open"
                );
                return Err(e);
            }
        };

        invoice.status = InvoiceStatus::Sent;
        invoice.payment_reference = Some(artifact.reference);
        invoice.payment_url = artifact.payment_url;
        invoice.updated_at = Utc::now();

        if let Err(e) = self.invoices.update_invoice(&invoice, InvoiceStatus::Open).await {
            tracing::error!(
                invoice_id = %invoice.invoice_id,
                payment_reference = ?invoice.payment_reference,
                error = %e,
                "Gateway artifact created but invoice update failed"
            );
            return Err(e);
        }

        tracing::info!(
            customer_id = %invoice.customer_id,
            invoice_id = %invoice.invoice_id,
            payment_reference = ?invoice.payment_reference,
            "Sent invoice to payment gateway"
        );
        self.event_logger
            .log_event_best_effort(
                BillingEventBuilder::new(invoice.customer_id.clone(), BillingEventType::InvoiceSent)
                    .invoice(invoice.invoice_id)
                    .gateway_reference(invoice.payment_reference.as_deref())
                    .data(serde_json::json!({
                        "payment_url": invoice.payment_url,
                    })),
            )
            .await;

        Ok(invoice)
    }

    fn payable_request(&self, invoice: &Invoice) -> BillingResult<PayableRequest> {
        let line_items = invoice
            .line_items
            .iter()
            .map(|item| {
                Ok(PayableLine {
                    description: item.description(),
                    amount: self.policy.to_minor_units(item.subtotal)?,
                })
            })
            .collect::<BillingResult<Vec<_>>>()?;

        Ok(PayableRequest {
            invoice_id: invoice.invoice_id,
            customer_ref: invoice.customer_id.clone(),
            currency: invoice.currency.clone(),
            amount_total: invoice.amount_total,
            line_items,
            due_date: invoice.due_date,
            days_until_due: u32::try_from((invoice.due_date - invoice.created_at).num_days())
                .unwrap_or(0)
                .max(1),
        })
    }

    /// Apply a payment outcome reported by the gateway.
    ///
    /// Idempotent: repeating the current status is a no-op, and a stale
    /// notification for a different terminal status is ignored. `sent`
    /// invoices move to paid, failed or void; `failed` ones only to void.
    /// `open` and `void` invoices are refused, and a payment reported for a
    /// void invoice is recorded for follow-up before being refused.
    pub async fn reconcile(
        &self,
        invoice_id: InvoiceId,
        gateway_status: GatewayPaymentStatus,
        amount_paid: Option<i64>,
    ) -> BillingResult<Invoice> {
        let mut invoice = self.get(invoice_id).await?;

        let target = match (invoice.status, gateway_status) {
            (InvoiceStatus::Void, GatewayPaymentStatus::Void) => return Ok(invoice),
            (InvoiceStatus::Void, GatewayPaymentStatus::Paid) => {
                self.record_payment_on_void(&invoice, amount_paid).await;
                return Err(BillingError::InvalidTransition {
                    entity: format!("invoice {}", invoice_id),
                    from: invoice.status.to_string(),
                    to: gateway_status.to_string(),
                });
            }
            (InvoiceStatus::Open | InvoiceStatus::Void, _) => {
                return Err(BillingError::InvalidTransition {
                    entity: format!("invoice {}", invoice_id),
                    from: invoice.status.to_string(),
                    to: gateway_status.to_string(),
                });
            }
            (_, GatewayPaymentStatus::Pending) => return Ok(invoice),
            (InvoiceStatus::Sent | InvoiceStatus::Failed, GatewayPaymentStatus::Void) => {
                return self.apply_void(invoice, ActorType::Gateway).await;
            }
            (InvoiceStatus::Sent, GatewayPaymentStatus::Paid) => InvoiceStatus::Paid,
            (InvoiceStatus::Sent, GatewayPaymentStatus::Failed) => InvoiceStatus::Failed,
            (InvoiceStatus::Paid, GatewayPaymentStatus::Paid)
            | (InvoiceStatus::Failed, GatewayPaymentStatus::Failed) => {
                tracing::debug!(
                    invoice_id = %invoice_id,
                    status = %invoice.status,
                    "Payment status already applied"
                );
                return Ok(invoice);
            }
            (current, reported) => {
                tracing::warn!(
                    invoice_id = %invoice_id,
                    current = %current,
                    reported = %reported,
                    "Ignoring stale payment status"
                );
                return Ok(invoice);
            }
        };

        let now = Utc::now();
        invoice.status = target;
        invoice.updated_at = now;
        if target == InvoiceStatus::Paid {
            invoice.amount_paid = Some(amount_paid.unwrap_or(invoice.amount_total));
            invoice.paid_at = Some(now);
        }

        match self.invoices.update_invoice(&invoice, InvoiceStatus::Sent).await {
            Ok(()) => {}
            Err(BillingError::Conflict(_)) => {
                // A concurrent delivery got there first
                let current = self.get(invoice_id).await?;
                if current.status == target {
                    return Ok(current);
                }
                return Err(BillingError::Conflict(format!(
                    "Invoice {} moved to {} while applying {}",
                    invoice_id, current.status, target
                )));
            }
            Err(e) => return Err(e),
        }

        match target {
            InvoiceStatus::Paid => {
                tracing::info!(
                    customer_id = %invoice.customer_id,
                    invoice_id = %invoice_id,
                    amount_paid = ?invoice.amount_paid,
                    "Invoice paid"
                );
                self.event_logger
                    .log_event_best_effort(
                        BillingEventBuilder::new(invoice.customer_id.clone(), BillingEventType::InvoicePaid)
                            .invoice(invoice_id)
                            .gateway_reference(invoice.payment_reference.as_deref())
                            .data(serde_json::json!({ "amount_paid": invoice.amount_paid }))
                            .actor_type(ActorType::Gateway),
                    )
                    .await;
            }
            _ => {
                tracing::warn!(
                    customer_id = %invoice.customer_id,
                    invoice_id = %invoice_id,
                    amount_total = invoice.amount_total,
                    "Invoice payment failed"
                );
                self.event_logger
                    .log_event_best_effort(
                        BillingEventBuilder::new(invoice.customer_id.clone(), BillingEventType::InvoiceFailed)
                            .invoice(invoice_id)
                            .gateway_reference(invoice.payment_reference.as_deref())
                            .data(serde_json::json!({ "amount_total": invoice.amount_total }))
                            .actor_type(ActorType::Gateway)
                            .notify(),
                    )
                    .await;
            }
        }

        Ok(invoice)
    }

    /// Reopen collection on a failed invoice (`failed -> sent`)
    pub async fn retry_failed(&self, invoice_id: InvoiceId) -> BillingResult<Invoice> {
        let mut invoice = self.get(invoice_id).await?;
        if invoice.status != InvoiceStatus::Failed {
            return Err(BillingError::InvalidTransition {
                entity: format!("invoice {}", invoice_id),
                from: invoice.status.to_string(),
                to: InvoiceStatus::Sent.to_string(),
            });
        }

        invoice.status = InvoiceStatus::Sent;
        invoice.updated_at = Utc::now();
        self.invoices
            .update_invoice(&invoice, InvoiceStatus::Failed)
            .await?;

        tracing::info!(
            customer_id = %invoice.customer_id,
            invoice_id = %invoice_id,
            "Reopened failed invoice for collection"
        );
        self.event_logger
            .log_event_best_effort(
                BillingEventBuilder::new(invoice.customer_id.clone(), BillingEventType::InvoiceRetried)
                    .invoice(invoice_id)
                    .gateway_reference(invoice.payment_reference.as_deref())
                    .actor_type(ActorType::Operator),
            )
            .await;

        Ok(invoice)
    }

    /// Ask the gateway for the payment state and apply it
    pub async fn check_payment_status(&self, invoice_id: InvoiceId) -> BillingResult<PaymentCheck> {
        let invoice = self.get(invoice_id).await?;
        let reference = invoice.payment_reference.clone().ok_or_else(|| {
            BillingError::Validation(format!(
                "Invoice {} has no payment reference yet",
                invoice_id
            ))
        })?;

        let PaymentStatus {
            status,
            amount_paid,
            amount_due,
        } = with_timeout(
            self.policy.gateway_timeout,
            "get_status",
            self.gateway.get_status(&reference),
        )
        .await?;

        let invoice = if matches!(invoice.status, InvoiceStatus::Sent | InvoiceStatus::Failed) {
            self.reconcile(invoice_id, status, Some(amount_paid)).await?
        } else {
            invoice
        };

        Ok(PaymentCheck {
            invoice,
            gateway_status: status,
            amount_paid,
            amount_due,
        })
    }

    /// Void an unpaid invoice.
    ///
    /// Voiding an already void invoice is a no-op; paid invoices are refused.
    /// An invoice already at the gateway is voided there first, so a gateway
    /// refusal (typically because the customer just paid) leaves it untouched.
    /// Usage returns to the unbilled pool only when the policy says so.
    pub async fn void(&self, invoice_id: InvoiceId) -> BillingResult<Invoice> {
        let invoice = self.get(invoice_id).await?;
        match invoice.status {
            InvoiceStatus::Void => return Ok(invoice),
            InvoiceStatus::Paid => {
                return Err(BillingError::InvalidTransition {
                    entity: format!("invoice {}", invoice_id),
                    from: invoice.status.to_string(),
                    to: InvoiceStatus::Void.to_string(),
                });
            }
            InvoiceStatus::Open | InvoiceStatus::Sent | InvoiceStatus::Failed => {}
        }

        if let Some(reference) = invoice.payment_reference.as_deref() {
            if let Err(e) = with_timeout(
                self.policy.gateway_timeout,
                "void_payable",
                self.gateway.void_payable(reference),
            )
            .await
            {
                // Already voided at the gateway, e.g. from its dashboard
                let remote = with_timeout(
                    self.policy.gateway_timeout,
                    "get_status",
                    self.gateway.get_status(reference),
                )
                .await;
                if !matches!(remote, Ok(PaymentStatus { status: GatewayPaymentStatus::Void, .. })) {
                    tracing::warn!(
                        invoice_id = %invoice_id,
                        gateway_reference = %reference,
                        error = %e,
                        "Gateway refused to void invoice"
                    );
                    return Err(e);
                }
            }
        }

        self.apply_void(invoice, ActorType::Operator).await
    }

    /// Hosted payment page for a one-off amount outside the invoice cycle
    pub async fn create_payment_link(&self, description: &str, amount: Decimal) -> BillingResult<String> {
        if description.trim().is_empty() {
            return Err(BillingError::Validation(
                "Payment link description must not be empty".to_string(),
            ));
        }
        if amount <= Decimal::ZERO {
            return Err(BillingError::Validation(format!(
                "Payment link amount must be positive, got {}",
                amount
            )));
        }
        let minor = self.policy.to_minor_units(amount)?;

        let url = with_timeout(
            self.policy.gateway_timeout,
            "create_payment_link",
            self.gateway
                .create_payment_link(description, minor, &self.policy.currency),
        )
        .await?;

        tracing::info!(
            description = %description,
            amount = minor,
            currency = %self.policy.currency,
            "Created payment link"
        );
        Ok(url)
    }

    /// Move an unpaid invoice to `void` locally and release usage per policy
    async fn apply_void(&self, mut invoice: Invoice, actor: ActorType) -> BillingResult<Invoice> {
        let invoice_id = invoice.invoice_id;
        let previous = invoice.status;
        invoice.status = InvoiceStatus::Void;
        invoice.updated_at = Utc::now();

        match self.invoices.update_invoice(&invoice, previous).await {
            Ok(()) => {}
            Err(BillingError::Conflict(_)) => {
                let current = self.get(invoice_id).await?;
                if current.status == InvoiceStatus::Void {
                    return Ok(current);
                }
                return Err(BillingError::Conflict(format!(
                    "Invoice {} moved to {} while voiding",
                    invoice_id, current.status
                )));
            }
            Err(e) => return Err(e),
        }

        let released = if self.policy.release_events_on_void {
            self.ledger.release(invoice_id).await?
        } else {
            0
        };

        tracing::info!(
            customer_id = %invoice.customer_id,
            invoice_id = %invoice_id,
            previous_status = %previous,
            released_events = released,
            actor = ?actor,
            "Voided invoice"
        );
        self.event_logger
            .log_event_best_effort(
                BillingEventBuilder::new(invoice.customer_id.clone(), BillingEventType::InvoiceVoided)
                    .invoice(invoice_id)
                    .gateway_reference(invoice.payment_reference.as_deref())
                    .data(serde_json::json!({
                        "previous_status": previous,
                        "released_events": released,
                    }))
                    .actor_type(actor),
            )
            .await;

        Ok(invoice)
    }

    /// Money arrived for an invoice we no longer collect; someone must refund
    /// or re-apply it
    async fn record_payment_on_void(&self, invoice: &Invoice, amount_paid: Option<i64>) {
        tracing::error!(
            customer_id = %invoice.customer_id,
            invoice_id = %invoice.invoice_id,
            gateway_reference = ?invoice.payment_reference,
            amount_paid = ?amount_paid,
            "Payment reported for void invoice"
        );
        self.event_logger
            .log_event_best_effort(
                BillingEventBuilder::new(invoice.customer_id.clone(), BillingEventType::PaymentOnVoidInvoice)
                    .invoice(invoice.invoice_id)
                    .gateway_reference(invoice.payment_reference.as_deref())
                    .data(serde_json::json!({
                        "amount_paid": amount_paid,
                        "amount_total": invoice.amount_total,
                    }))
                    .actor_type(ActorType::Gateway)
                    .notify(),
            )
            .await;
    }

    pub async fn get(&self, invoice_id: InvoiceId) -> BillingResult<Invoice> {
        self.invoices
            .get_invoice(invoice_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Invoice {}", invoice_id)))
    }

    pub async fn find_by_reference(&self, reference: &str) -> BillingResult<Option<Invoice>> {
        self.invoices.find_invoice_by_reference(reference).await
    }

    /// Newest first
    pub async fn list_for_customer(&self, customer_id: &CustomerId) -> BillingResult<Vec<Invoice>> {
        self.invoices.invoices_for_customer(customer_id).await
    }

    /// Oldest first
    pub async fn list_by_status(&self, status: InvoiceStatus) -> BillingResult<Vec<Invoice>> {
        self.invoices.invoices_by_status(status).await
    }

    /// Open invoices that never reached the gateway, oldest first
    pub async fn unsent(&self, older_than: DateTime<Utc>) -> BillingResult<Vec<Invoice>> {
        Ok(self
            .list_by_status(InvoiceStatus::Open)
            .await?
            .into_iter()
            .filter(|i| i.payment_reference.is_none() && i.updated_at <= older_than)
            .collect())
    }

    async fn check_usage_spike(&self, customer_id: &CustomerId) -> BillingResult<()> {
        let Some(threshold) = self.policy.usage_spike_threshold else {
            return Ok(());
        };

        let total = self.ledger.total_unbilled(customer_id).await?;
        if total > threshold {
            tracing::warn!(
                customer_id = %customer_id,
                total_unbilled = %total,
                threshold = %threshold,
                "Unbilled usage above spike threshold"
            );
            self.event_logger
                .log_usage_spike(customer_id, total, threshold)
                .await;
        }
        Ok(())
    }
}

/// Group events into one line item per service, in first-appearance order.
///
/// A service reported in more than one unit is rejected.
pub fn aggregate(events: &[UsageEvent]) -> BillingResult<Vec<LineItem>> {
    struct Acc {
        item: LineItem,
        uniform_price: Option<Decimal>,
    }

    let mut order: Vec<Acc> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();

    for event in events {
        let existing = index.get(event.service.as_str()).copied();
        match existing {
            Some(position) => {
                let acc = &mut order[position];
                if acc.item.unit != event.unit {
                    return Err(BillingError::Validation(format!(
                        "service '{}' reported in both '{}' and '{}'",
                        event.service, acc.item.unit, event.unit
                    )));
                }
                acc.item.quantity = acc
                    .item
                    .quantity
                    .checked_add(event.quantity)
                    .ok_or_else(|| overflow(&event.service))?;
                acc.item.subtotal = acc
                    .item
                    .subtotal
                    .checked_add(event_amount(event)?)
                    .ok_or_else(|| overflow(&event.service))?;
                acc.item.event_count += 1;
                if acc.uniform_price != Some(event.unit_price) {
                    acc.uniform_price = None;
                }
            }
            None => {
                index.insert(event.service.as_str(), order.len());
                order.push(Acc {
                    item: LineItem {
                        service: event.service.clone(),
                        quantity: event.quantity,
                        unit: event.unit.clone(),
                        unit_price: event.unit_price,
                        subtotal: event_amount(event)?,
                        event_count: 1,
                    },
                    uniform_price: Some(event.unit_price),
                });
            }
        }
    }

    Ok(order
        .into_iter()
        .map(|acc| {
            let mut item = acc.item;
            item.unit_price = match acc.uniform_price {
                Some(price) => price,
                None => item
                    .subtotal
                    .checked_div(item.quantity)
                    .map(|p| p.round_dp(BLENDED_PRICE_DP))
                    .unwrap_or(Decimal::ZERO),
            };
            item
        })
        .collect())
}

fn event_amount(event: &UsageEvent) -> BillingResult<Decimal> {
    event.amount().ok_or_else(|| overflow(&event.service))
}

fn sum_subtotals(lines: &[LineItem]) -> BillingResult<Decimal> {
    lines
        .iter()
        .try_fold(Decimal::ZERO, |total, line| total.checked_add(line.subtotal))
        .ok_or_else(|| BillingError::Validation("invoice total is out of range".to_string()))
}

fn overflow(service: &str) -> BillingError {
    BillingError::Validation(format!("usage total for '{}' is out of range", service))
}
