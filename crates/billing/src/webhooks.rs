//! Payment gateway webhook handling
//!
//! Verifies the signature of inbound notifications, de-duplicates deliveries
//! and routes payment outcomes to the invoice generator or the subscription
//! manager. Transport (HTTP) is left to the embedding application.
//!
//! Signature header format: `t=<unix seconds>,v1=<hex HMAC-SHA256>` where the
//! MAC covers `"{t}.{payload}"`.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{BillingError, BillingResult};
use crate::gateway::GatewayPaymentStatus;
use crate::invoice::InvoiceGenerator;
use crate::store::EventStore;
use crate::subscription::SubscriptionManager;

type HmacSha256 = Hmac<Sha256>;

/// Inbound payment notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookNotification {
    /// Unique per notification; redeliveries reuse it
    pub id: String,
    #[serde(rename = "type")]
    pub notification_type: String,
    /// Gateway reference of the invoice or subscription
    pub reference: String,
    #[serde(default)]
    pub amount: Option<i64>,
    /// Unix seconds
    #[serde(default)]
    pub created: Option<i64>,
}

/// Notification types the engine acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    InvoicePaid,
    InvoicePaymentFailed,
    InvoiceVoided,
    SubscriptionCharged,
    SubscriptionChargeFailed,
}

impl NotificationKind {
    pub fn parse(notification_type: &str) -> Option<Self> {
        match notification_type {
            "invoice.paid" => Some(Self::InvoicePaid),
            "invoice.payment_failed" => Some(Self::InvoicePaymentFailed),
            "invoice.voided" => Some(Self::InvoiceVoided),
            "subscription.charged" => Some(Self::SubscriptionCharged),
            "subscription.charge_failed" => Some(Self::SubscriptionChargeFailed),
            _ => None,
        }
    }
}

/// What happened to a verified notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Applied,
    /// Already processed under the same notification id
    Duplicate,
    /// Acknowledged without changes (unknown type, unknown reference, stale)
    Ignored(String),
}

/// Webhook verifier and dispatcher
#[derive(Clone)]
pub struct WebhookHandler {
    secret: String,
    tolerance_secs: i64,
    invoices: InvoiceGenerator,
    subscriptions: SubscriptionManager,
    events: Arc<dyn EventStore>,
}

impl WebhookHandler {
    pub fn new(
        secret: impl Into<String>,
        tolerance_secs: i64,
        invoices: InvoiceGenerator,
        subscriptions: SubscriptionManager,
        events: Arc<dyn EventStore>,
    ) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs,
            invoices,
            subscriptions,
            events,
        }
    }

    /// Verify the signature and parse the payload
    pub fn verify(&self, payload: &str, signature: &str) -> BillingResult<WebhookNotification> {
        self.verify_at(payload, signature, Utc::now())
    }

    /// Verify against an explicit clock
    pub fn verify_at(
        &self,
        payload: &str,
        signature: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<WebhookNotification> {
        let mut timestamp: Option<i64> = None;
        let mut v1_signature: Option<&str> = None;

        for part in signature.split(',') {
            if let Some((key, value)) = part.trim().split_once('=') {
                match key {
                    "t" => timestamp = value.parse().ok(),
                    "v1" => v1_signature = Some(value),
                    _ => {}
                }
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::warn!("Missing timestamp in webhook signature");
            BillingError::WebhookSignatureInvalid
        })?;
        let v1_signature = v1_signature.ok_or_else(|| {
            tracing::warn!("Missing v1 signature in webhook signature");
            BillingError::WebhookSignatureInvalid
        })?;

        let expected = compute_signature(&self.secret, timestamp, payload)?;
        let matches: bool = expected.as_bytes().ct_eq(v1_signature.as_bytes()).into();
        if !matches {
            tracing::error!("Webhook signature verification failed");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let skew = (now.timestamp() - timestamp).abs();
        if skew > self.tolerance_secs {
            tracing::warn!(
                timestamp = timestamp,
                now = now.timestamp(),
                skew = skew,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook notification");
            BillingError::Validation(format!("Malformed webhook notification: {}", e))
        })
    }

    /// Verify and handle in one step
    pub async fn process(&self, payload: &str, signature: &str) -> BillingResult<WebhookOutcome> {
        let notification = self.verify(payload, signature)?;
        self.handle(notification).await
    }

    /// Handle a verified notification.
    ///
    /// The notification id is claimed first; a failure while applying it
    /// releases the claim so the gateway's redelivery is processed.
    pub async fn handle(&self, notification: WebhookNotification) -> BillingResult<WebhookOutcome> {
        let Some(kind) = NotificationKind::parse(&notification.notification_type) else {
            tracing::debug!(
                notification_id = %notification.id,
                notification_type = %notification.notification_type,
                "Skipping unhandled webhook type"
            );
            return Ok(WebhookOutcome::Ignored(format!(
                "unhandled type {}",
                notification.notification_type
            )));
        };

        let claimed = self
            .events
            .claim_notification(&notification.id, &notification.notification_type)
            .await?;
        if !claimed {
            tracing::info!(
                notification_id = %notification.id,
                "Duplicate webhook delivery, skipping"
            );
            return Ok(WebhookOutcome::Duplicate);
        }

        match self.dispatch(kind, &notification).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::error!(
                    notification_id = %notification.id,
                    notification_type = %notification.notification_type,
                    error = %e,
                    "Webhook processing failed, releasing claim"
                );
                if let Err(release_err) = self.events.release_notification(&notification.id).await {
                    tracing::error!(
                        notification_id = %notification.id,
                        error = %release_err,
                        "Failed to release webhook claim"
                    );
                }
                Err(e)
            }
        }
    }

    async fn dispatch(
        &self,
        kind: NotificationKind,
        notification: &WebhookNotification,
    ) -> BillingResult<WebhookOutcome> {
        match kind {
            NotificationKind::InvoicePaid
            | NotificationKind::InvoicePaymentFailed
            | NotificationKind::InvoiceVoided => {
                let Some(invoice) = self.invoices.find_by_reference(&notification.reference).await?
                else {
                    tracing::warn!(
                        reference = %notification.reference,
                        "Webhook references unknown invoice"
                    );
                    return Ok(WebhookOutcome::Ignored("unknown invoice".to_string()));
                };

                let status = match kind {
                    NotificationKind::InvoicePaid => GatewayPaymentStatus::Paid,
                    NotificationKind::InvoiceVoided => GatewayPaymentStatus::Void,
                    _ => GatewayPaymentStatus::Failed,
                };

                match self
                    .invoices
                    .reconcile(invoice.invoice_id, status, notification.amount)
                    .await
                {
                    Ok(_) => Ok(WebhookOutcome::Applied),
                    Err(BillingError::InvalidTransition { from, .. }) => {
                        tracing::warn!(
                            invoice_id = %invoice.invoice_id,
                            status = %from,
                            "Webhook for invoice that cannot be reconciled"
                        );
                        Ok(WebhookOutcome::Ignored(format!("invoice is {}", from)))
                    }
                    Err(e) => Err(e),
                }
            }
            NotificationKind::SubscriptionCharged | NotificationKind::SubscriptionChargeFailed => {
                let Some(subscription) = self
                    .subscriptions
                    .find_by_reference(&notification.reference)
                    .await?
                else {
                    tracing::warn!(
                        reference = %notification.reference,
                        "Webhook references unknown subscription"
                    );
                    return Ok(WebhookOutcome::Ignored("unknown subscription".to_string()));
                };

                let occurred_at = notification
                    .created
                    .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
                    .unwrap_or_else(Utc::now);

                self.subscriptions
                    .on_charge_result(
                        subscription.subscription_id,
                        kind == NotificationKind::SubscriptionCharged,
                        occurred_at,
                    )
                    .await?;
                Ok(WebhookOutcome::Applied)
            }
        }
    }
}

/// Build a signature header for a payload, as the gateway would send it
pub fn signature_header(secret: &str, timestamp: i64, payload: &str) -> BillingResult<String> {
    Ok(format!(
        "t={},v1={}",
        timestamp,
        compute_signature(secret, timestamp, payload)?
    ))
}

fn compute_signature(secret: &str, timestamp: i64, payload: &str) -> BillingResult<String> {
    let key = secret.strip_prefix("whsec_").unwrap_or(secret);
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|_| BillingError::Config("Invalid webhook secret".to_string()))?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}
