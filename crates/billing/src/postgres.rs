//! Postgres-backed stores
//!
//! All four store traits on one pool. Schema lives in `migrations/`.
//! Billing state changes that must be atomic (marking events billed,
//! invoice status transitions, webhook claims) are expressed as conditional
//! writes whose affected row count is checked.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;
use usagebill_shared::{
    CustomerId, EventId, EventMetadata, Invoice, InvoiceId, InvoiceStatus, LineItem, Subscription,
    SubscriptionId, UsageEvent,
};

use crate::error::{BillingError, BillingResult};
use crate::events::BillingEvent;
use crate::store::{EventStore, InvoiceStore, SubscriptionStore, UsageStore};

const USAGE_COLUMNS: &str = "id, sequence, customer_id, service, quantity, unit, unit_price, \
     occurred_at, metadata, billed, invoice_id, recorded_at, voided_at";

const INVOICE_COLUMNS: &str = "id, customer_id, line_items, amount_total, currency, status, \
     period_start, period_end, due_date, payment_reference, payment_url, amount_paid, paid_at, \
     created_at, updated_at";

const SUBSCRIPTION_COLUMNS: &str = "id, customer_id, amount, currency, interval, status, \
     next_charge_at, gateway_reference, failure_count, created_at, updated_at, canceled_at";

const EVENT_COLUMNS: &str = "id, customer_id, event_type, invoice_id, subscription_id, \
     gateway_reference, event_data, actor_type, requires_notification, notified_at, created_at";

#[derive(Debug, sqlx::FromRow)]
struct UsageRow {
    id: Uuid,
    sequence: i64,
    customer_id: String,
    service: String,
    quantity: Decimal,
    unit: String,
    unit_price: Decimal,
    occurred_at: DateTime<Utc>,
    metadata: Json<EventMetadata>,
    billed: bool,
    invoice_id: Option<Uuid>,
    recorded_at: DateTime<Utc>,
    voided_at: Option<DateTime<Utc>>,
}

impl From<UsageRow> for UsageEvent {
    fn from(row: UsageRow) -> Self {
        UsageEvent {
            event_id: EventId(row.id),
            customer_id: CustomerId(row.customer_id),
            service: row.service,
            quantity: row.quantity,
            unit: row.unit,
            unit_price: row.unit_price,
            occurred_at: row.occurred_at,
            metadata: row.metadata.0,
            billed: row.billed,
            invoice_id: row.invoice_id.map(InvoiceId),
            sequence: row.sequence,
            recorded_at: row.recorded_at,
            voided_at: row.voided_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct InvoiceRow {
    id: Uuid,
    customer_id: String,
    line_items: Json<Vec<LineItem>>,
    amount_total: i64,
    currency: String,
    status: String,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    due_date: DateTime<Utc>,
    payment_reference: Option<String>,
    payment_url: Option<String>,
    amount_paid: Option<i64>,
    paid_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<InvoiceRow> for Invoice {
    type Error = BillingError;

    fn try_from(row: InvoiceRow) -> Result<Self, Self::Error> {
        Ok(Invoice {
            invoice_id: InvoiceId(row.id),
            customer_id: CustomerId(row.customer_id),
            line_items: row.line_items.0,
            amount_total: row.amount_total,
            currency: row.currency,
            status: row.status.parse().map_err(corrupt_row)?,
            period_start: row.period_start,
            period_end: row.period_end,
            due_date: row.due_date,
            payment_reference: row.payment_reference,
            payment_url: row.payment_url,
            amount_paid: row.amount_paid,
            paid_at: row.paid_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    customer_id: String,
    amount: i64,
    currency: String,
    interval: String,
    status: String,
    next_charge_at: DateTime<Utc>,
    gateway_reference: Option<String>,
    failure_count: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    canceled_at: Option<DateTime<Utc>>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Subscription {
            subscription_id: SubscriptionId(row.id),
            customer_id: CustomerId(row.customer_id),
            amount: row.amount,
            currency: row.currency,
            interval: row.interval.parse().map_err(corrupt_row)?,
            status: row.status.parse().map_err(corrupt_row)?,
            next_charge_at: row.next_charge_at,
            gateway_reference: row.gateway_reference,
            failure_count: u32::try_from(row.failure_count).map_err(corrupt_row)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            canceled_at: row.canceled_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    id: Uuid,
    customer_id: String,
    event_type: String,
    invoice_id: Option<Uuid>,
    subscription_id: Option<Uuid>,
    gateway_reference: Option<String>,
    event_data: serde_json::Value,
    actor_type: String,
    requires_notification: bool,
    notified_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for BillingEvent {
    type Error = BillingError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(BillingEvent {
            id: row.id,
            customer_id: CustomerId(row.customer_id),
            event_type: row.event_type.parse().map_err(corrupt_row)?,
            invoice_id: row.invoice_id.map(InvoiceId),
            subscription_id: row.subscription_id.map(SubscriptionId),
            gateway_reference: row.gateway_reference,
            event_data: row.event_data,
            actor_type: row.actor_type.parse().map_err(corrupt_row)?,
            requires_notification: row.requires_notification,
            notified_at: row.notified_at,
            created_at: row.created_at,
        })
    }
}

fn corrupt_row(err: impl std::fmt::Display) -> BillingError {
    BillingError::Database(format!("Unreadable row: {}", err))
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Map unique violations to `Conflict`, everything else to `Database`
fn conflict_on_unique(err: sqlx::Error, message: impl FnOnce() -> String) -> BillingError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => BillingError::Conflict(message()),
        _ => err.into(),
    }
}

/// Postgres implementation of every billing store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl UsageStore for PgStore {
    async fn append(&self, events: Vec<UsageEvent>) -> BillingResult<Vec<UsageEvent>> {
        let mut tx = self.pool.begin().await?;
        let mut stored = Vec::with_capacity(events.len());

        for event in events {
            let event_id = event.event_id;
            let row: UsageRow = sqlx::query_as(&format!(
                r#"
                INSERT INTO usage_events
                    (id, customer_id, service, quantity, unit, unit_price, occurred_at, metadata)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                RETURNING {}
                "#,
                USAGE_COLUMNS
            ))
            .bind(event.event_id.0)
            .bind(event.customer_id.as_str())
            .bind(&event.service)
            .bind(event.quantity)
            .bind(&event.unit)
            .bind(event.unit_price)
            .bind(event.occurred_at)
            .bind(Json(&event.metadata))
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| conflict_on_unique(e, || format!("Usage event {} already recorded", event_id)))?;

            stored.push(UsageEvent::from(row));
        }

        tx.commit().await?;
        Ok(stored)
    }

    async fn unbilled(
        &self,
        customer_id: &CustomerId,
        as_of: DateTime<Utc>,
    ) -> BillingResult<Vec<UsageEvent>> {
        let rows: Vec<UsageRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM usage_events
            WHERE customer_id = $1
              AND billed = FALSE
              AND voided_at IS NULL
              AND occurred_at <= $2
            ORDER BY occurred_at, sequence
            "#,
            USAGE_COLUMNS
        ))
        .bind(customer_id.as_str())
        .bind(as_of)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(UsageEvent::from).collect())
    }

    async fn mark_billed(&self, event_ids: &[EventId], invoice_id: InvoiceId) -> BillingResult<()> {
        let ids: Vec<Uuid> = event_ids.iter().map(|id| id.0).collect();

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE usage_events
            SET billed = TRUE, invoice_id = $1
            WHERE id = ANY($2)
              AND billed = FALSE
              AND voided_at IS NULL
            "#,
        )
        .bind(invoice_id.0)
        .bind(&ids)
        .execute(&mut *tx)
        .await?;

        // Duplicate ids also land here: they can only be updated once
        if result.rows_affected() != ids.len() as u64 {
            tx.rollback().await?;
            tracing::warn!(
                invoice_id = %invoice_id,
                requested = ids.len(),
                updated = result.rows_affected(),
                "Usage events no longer billable, rolled back"
            );
            return Err(BillingError::Conflict(format!(
                "{} of {} usage events are no longer billable",
                ids.len() as u64 - result.rows_affected(),
                ids.len()
            )));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn total_unbilled(&self, customer_id: &CustomerId) -> BillingResult<Decimal> {
        let total: Decimal = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(quantity * unit_price), 0)
            FROM usage_events
            WHERE customer_id = $1 AND billed = FALSE AND voided_at IS NULL
            "#,
        )
        .bind(customer_id.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(total)
    }

    async fn get_event(&self, event_id: EventId) -> BillingResult<Option<UsageEvent>> {
        let row: Option<UsageRow> = sqlx::query_as(&format!(
            "SELECT {} FROM usage_events WHERE id = $1",
            USAGE_COLUMNS
        ))
        .bind(event_id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(UsageEvent::from))
    }

    async fn events_for_invoice(&self, invoice_id: InvoiceId) -> BillingResult<Vec<UsageEvent>> {
        let rows: Vec<UsageRow> = sqlx::query_as(&format!(
            "SELECT {} FROM usage_events WHERE invoice_id = $1 ORDER BY occurred_at, sequence",
            USAGE_COLUMNS
        ))
        .bind(invoice_id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(UsageEvent::from).collect())
    }

    async fn customers_with_unbilled(&self, as_of: DateTime<Utc>) -> BillingResult<Vec<CustomerId>> {
        let customers: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT customer_id
            FROM usage_events
            WHERE billed = FALSE AND voided_at IS NULL AND occurred_at <= $1
            ORDER BY customer_id
            "#,
        )
        .bind(as_of)
        .fetch_all(&self.pool)
        .await?;

        Ok(customers.into_iter().map(CustomerId).collect())
    }

    async fn void_event(&self, event_id: EventId, voided_at: DateTime<Utc>) -> BillingResult<UsageEvent> {
        let mut tx = self.pool.begin().await?;

        let row: Option<UsageRow> = sqlx::query_as(&format!(
            "SELECT {} FROM usage_events WHERE id = $1 FOR UPDATE",
            USAGE_COLUMNS
        ))
        .bind(event_id.0)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Err(BillingError::NotFound(format!("Usage event {}", event_id)));
        };
        if row.billed {
            return Err(BillingError::Conflict(format!(
                "Usage event {} is already billed",
                event_id
            )));
        }

        let row: UsageRow = sqlx::query_as(&format!(
            r#"
            UPDATE usage_events
            SET voided_at = COALESCE(voided_at, $2)
            WHERE id = $1
            RETURNING {}
            "#,
            USAGE_COLUMNS
        ))
        .bind(event_id.0)
        .bind(voided_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(UsageEvent::from(row))
    }

    async fn release(&self, invoice_id: InvoiceId) -> BillingResult<u64> {
        let result = sqlx::query(
            "UPDATE usage_events SET billed = FALSE, invoice_id = NULL WHERE invoice_id = $1",
        )
        .bind(invoice_id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl InvoiceStore for PgStore {
    async fn insert_invoice(&self, invoice: &Invoice) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO invoices (
                id, customer_id, line_items, amount_total, currency, status,
                period_start, period_end, due_date, payment_reference, payment_url,
                amount_paid, paid_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(invoice.invoice_id.0)
        .bind(invoice.customer_id.as_str())
        .bind(Json(&invoice.line_items))
        .bind(invoice.amount_total)
        .bind(&invoice.currency)
        .bind(invoice.status.to_string())
        .bind(invoice.period_start)
        .bind(invoice.period_end)
        .bind(invoice.due_date)
        .bind(&invoice.payment_reference)
        .bind(&invoice.payment_url)
        .bind(invoice.amount_paid)
        .bind(invoice.paid_at)
        .bind(invoice.created_at)
        .bind(invoice.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_on_unique(e, || format!("Invoice {} already exists", invoice.invoice_id)))?;

        Ok(())
    }

    async fn update_invoice(&self, invoice: &Invoice, expected: InvoiceStatus) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE invoices
            SET line_items = $3,
                amount_total = $4,
                status = $5,
                payment_reference = $6,
                payment_url = $7,
                amount_paid = $8,
                paid_at = $9,
                updated_at = $10
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(invoice.invoice_id.0)
        .bind(expected.to_string())
        .bind(Json(&invoice.line_items))
        .bind(invoice.amount_total)
        .bind(invoice.status.to_string())
        .bind(&invoice.payment_reference)
        .bind(&invoice.payment_url)
        .bind(invoice.amount_paid)
        .bind(invoice.paid_at)
        .bind(invoice.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            conflict_on_unique(e, || {
                "Payment reference already attached to another invoice".to_string()
            })
        })?;

        if result.rows_affected() == 0 {
            let current: Option<String> =
                sqlx::query_scalar("SELECT status FROM invoices WHERE id = $1")
                    .bind(invoice.invoice_id.0)
                    .fetch_optional(&self.pool)
                    .await?;

            return Err(match current {
                Some(status) => BillingError::Conflict(format!(
                    "Invoice {} is {}, expected {}",
                    invoice.invoice_id, status, expected
                )),
                None => BillingError::NotFound(format!("Invoice {}", invoice.invoice_id)),
            });
        }

        Ok(())
    }

    async fn get_invoice(&self, invoice_id: InvoiceId) -> BillingResult<Option<Invoice>> {
        let row: Option<InvoiceRow> = sqlx::query_as(&format!(
            "SELECT {} FROM invoices WHERE id = $1",
            INVOICE_COLUMNS
        ))
        .bind(invoice_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Invoice::try_from).transpose()
    }

    async fn find_invoice_by_reference(&self, reference: &str) -> BillingResult<Option<Invoice>> {
        let row: Option<InvoiceRow> = sqlx::query_as(&format!(
            "SELECT {} FROM invoices WHERE payment_reference = $1",
            INVOICE_COLUMNS
        ))
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Invoice::try_from).transpose()
    }

    async fn invoices_for_customer(&self, customer_id: &CustomerId) -> BillingResult<Vec<Invoice>> {
        let rows: Vec<InvoiceRow> = sqlx::query_as(&format!(
            "SELECT {} FROM invoices WHERE customer_id = $1 ORDER BY created_at DESC",
            INVOICE_COLUMNS
        ))
        .bind(customer_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Invoice::try_from).collect()
    }

    async fn invoices_by_status(&self, status: InvoiceStatus) -> BillingResult<Vec<Invoice>> {
        let rows: Vec<InvoiceRow> = sqlx::query_as(&format!(
            "SELECT {} FROM invoices WHERE status = $1 ORDER BY created_at",
            INVOICE_COLUMNS
        ))
        .bind(status.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Invoice::try_from).collect()
    }
}

#[async_trait]
impl SubscriptionStore for PgStore {
    async fn insert_subscription(&self, subscription: &Subscription) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, customer_id, amount, currency, interval, status, next_charge_at,
                gateway_reference, failure_count, created_at, updated_at, canceled_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(subscription.subscription_id.0)
        .bind(subscription.customer_id.as_str())
        .bind(subscription.amount)
        .bind(&subscription.currency)
        .bind(subscription.interval.to_string())
        .bind(subscription.status.to_string())
        .bind(subscription.next_charge_at)
        .bind(&subscription.gateway_reference)
        .bind(i32::try_from(subscription.failure_count).unwrap_or(i32::MAX))
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .bind(subscription.canceled_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            conflict_on_unique(e, || {
                format!("Subscription {} already exists", subscription.subscription_id)
            })
        })?;

        Ok(())
    }

    async fn update_subscription(&self, subscription: &Subscription) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = $2,
                next_charge_at = $3,
                gateway_reference = $4,
                failure_count = $5,
                updated_at = $6,
                canceled_at = $7
            WHERE id = $1
            "#,
        )
        .bind(subscription.subscription_id.0)
        .bind(subscription.status.to_string())
        .bind(subscription.next_charge_at)
        .bind(&subscription.gateway_reference)
        .bind(i32::try_from(subscription.failure_count).unwrap_or(i32::MAX))
        .bind(subscription.updated_at)
        .bind(subscription.canceled_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!(
                "Subscription {}",
                subscription.subscription_id
            )));
        }

        Ok(())
    }

    async fn get_subscription(
        &self,
        subscription_id: SubscriptionId,
    ) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(subscription_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Subscription::try_from).transpose()
    }

    async fn find_subscription_by_reference(
        &self,
        reference: &str,
    ) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE gateway_reference = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Subscription::try_from).transpose()
    }

    async fn subscriptions_for_customer(
        &self,
        customer_id: &CustomerId,
    ) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE customer_id = $1 ORDER BY created_at",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(customer_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Subscription::try_from).collect()
    }

    async fn subscriptions_due(&self, as_of: DateTime<Utc>) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM subscriptions
            WHERE status IN ('active', 'past_due') AND next_charge_at <= $1
            ORDER BY next_charge_at
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(as_of)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Subscription::try_from).collect()
    }
}

#[async_trait]
impl EventStore for PgStore {
    async fn append_event(&self, event: &BillingEvent) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_events (
                id, customer_id, event_type, invoice_id, subscription_id, gateway_reference,
                event_data, actor_type, requires_notification, notified_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(event.id)
        .bind(event.customer_id.as_str())
        .bind(event.event_type.to_string())
        .bind(event.invoice_id.map(|id| id.0))
        .bind(event.subscription_id.map(|id| id.0))
        .bind(&event.gateway_reference)
        .bind(&event.event_data)
        .bind(event.actor_type.to_string())
        .bind(event.requires_notification)
        .bind(event.notified_at)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn events_for_customer(
        &self,
        customer_id: &CustomerId,
        limit: usize,
    ) -> BillingResult<Vec<BillingEvent>> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM billing_events
            WHERE customer_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
            EVENT_COLUMNS
        ))
        .bind(customer_id.as_str())
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(BillingEvent::try_from).collect()
    }

    async fn pending_notifications(&self, limit: usize) -> BillingResult<Vec<BillingEvent>> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM billing_events
            WHERE requires_notification = TRUE AND notified_at IS NULL
            ORDER BY created_at
            LIMIT $1
            "#,
            EVENT_COLUMNS
        ))
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(BillingEvent::try_from).collect()
    }

    async fn mark_notified(&self, event_id: Uuid, notified_at: DateTime<Utc>) -> BillingResult<()> {
        let result = sqlx::query(
            "UPDATE billing_events SET notified_at = COALESCE(notified_at, $2) WHERE id = $1",
        )
        .bind(event_id)
        .bind(notified_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("Billing event {}", event_id)));
        }
        Ok(())
    }

    async fn claim_notification(
        &self,
        notification_id: &str,
        notification_type: &str,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_webhooks (notification_id, notification_type)
            VALUES ($1, $2)
            ON CONFLICT (notification_id) DO NOTHING
            "#,
        )
        .bind(notification_id)
        .bind(notification_type)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_notification(&self, notification_id: &str) -> BillingResult<()> {
        sqlx::query("DELETE FROM processed_webhooks WHERE notification_id = $1")
            .bind(notification_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
