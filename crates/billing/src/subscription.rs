//! Subscription management
//!
//! Recurring fixed-amount charges, independent of the usage ledger. The
//! gateway owns the charge schedule; this module owns the local state and
//! reacts to charge outcomes:
//!
//! - success advances `next_charge_at` by one interval and clears failures
//! - failure marks the subscription `past_due`
//! - more consecutive failures than the retry limit cancels it and records a
//!   notification obligation

use std::sync::Arc;

use chrono::{DateTime, Utc};
use usagebill_shared::{
    BillingInterval, CustomerId, Subscription, SubscriptionId, SubscriptionStatus,
};

use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::gateway::{with_timeout, PaymentGateway};
use crate::policy::BillingPolicy;
use crate::store::SubscriptionStore;

/// Subscription manager service
#[derive(Clone)]
pub struct SubscriptionManager {
    store: Arc<dyn SubscriptionStore>,
    gateway: Arc<dyn PaymentGateway>,
    policy: Arc<BillingPolicy>,
    event_logger: BillingEventLogger,
}

impl SubscriptionManager {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        gateway: Arc<dyn PaymentGateway>,
        policy: Arc<BillingPolicy>,
        event_logger: BillingEventLogger,
    ) -> Self {
        Self {
            store,
            gateway,
            policy,
            event_logger,
        }
    }

    /// Create a subscription and its charge schedule at the gateway.
    ///
    /// The subscription starts `pending` unless the gateway already reports a
    /// usable payment method.
    pub async fn create(
        &self,
        customer_id: &CustomerId,
        amount: i64,
        interval: BillingInterval,
    ) -> BillingResult<Subscription> {
        if customer_id.as_str().trim().is_empty() {
            return Err(BillingError::Validation("customer_id must not be empty".to_string()));
        }
        if amount <= 0 {
            return Err(BillingError::Validation(format!(
                "subscription amount must be positive, got {}",
                amount
            )));
        }

        let now = Utc::now();
        let next_charge_at = interval
            .advance(now)
            .ok_or_else(|| BillingError::Internal("next charge date out of range".to_string()))?;

        let remote = with_timeout(
            self.policy.gateway_timeout,
            "create_subscription",
            self.gateway
                .create_subscription(customer_id, amount, &self.policy.currency, interval),
        )
        .await?;

        let status = if remote.status.has_payment_method() {
            SubscriptionStatus::Active
        } else {
            SubscriptionStatus::Pending
        };

        let subscription = Subscription {
            subscription_id: SubscriptionId::new(),
            customer_id: customer_id.clone(),
            amount,
            currency: self.policy.currency.clone(),
            interval,
            status,
            next_charge_at,
            gateway_reference: Some(remote.subscription_ref.clone()),
            failure_count: 0,
            created_at: now,
            updated_at: now,
            canceled_at: None,
        };

        if let Err(e) = self.store.insert_subscription(&subscription).await {
            tracing::error!(
                customer_id = %customer_id,
                gateway_reference = %remote.subscription_ref,
                error = %e,
                "Failed to store subscription, canceling gateway schedule"
            );
            self.cancel_remote(&remote.subscription_ref).await;
            return Err(e);
        }

        tracing::info!(
            customer_id = %customer_id,
            subscription_id = %subscription.subscription_id,
            amount = amount,
            interval = %interval,
            status = %status,
            "Created subscription"
        );
        self.event_logger
            .log_event_best_effort(
                BillingEventBuilder::new(customer_id.clone(), BillingEventType::SubscriptionCreated)
                    .subscription(subscription.subscription_id)
                    .gateway_reference(subscription.gateway_reference.as_deref())
                    .data(serde_json::json!({
                        "amount": amount,
                        "currency": subscription.currency,
                        "interval": interval,
                        "status": status,
                    })),
            )
            .await;

        Ok(subscription)
    }

    /// Gateway confirmed a payment method (`pending -> active`)
    pub async fn activate(&self, subscription_id: SubscriptionId) -> BillingResult<Subscription> {
        let mut subscription = self.get(subscription_id).await?;
        match subscription.status {
            SubscriptionStatus::Active => return Ok(subscription),
            SubscriptionStatus::Pending => {}
            other => {
                return Err(BillingError::InvalidTransition {
                    entity: format!("subscription {}", subscription_id),
                    from: other.to_string(),
                    to: SubscriptionStatus::Active.to_string(),
                });
            }
        }

        subscription.status = SubscriptionStatus::Active;
        subscription.updated_at = Utc::now();
        self.store.update_subscription(&subscription).await?;

        tracing::info!(
            customer_id = %subscription.customer_id,
            subscription_id = %subscription_id,
            "Activated subscription"
        );
        self.event_logger
            .log_event_best_effort(
                BillingEventBuilder::new(
                    subscription.customer_id.clone(),
                    BillingEventType::SubscriptionActivated,
                )
                .subscription(subscription_id)
                .gateway_reference(subscription.gateway_reference.as_deref())
                .actor_type(ActorType::Gateway),
            )
            .await;

        Ok(subscription)
    }

    /// Apply the outcome of a scheduled charge.
    ///
    /// Results for canceled subscriptions are ignored.
    pub async fn on_charge_result(
        &self,
        subscription_id: SubscriptionId,
        success: bool,
        occurred_at: DateTime<Utc>,
    ) -> BillingResult<Subscription> {
        let mut subscription = self.get(subscription_id).await?;
        if subscription.status == SubscriptionStatus::Canceled {
            tracing::debug!(
                subscription_id = %subscription_id,
                success = success,
                "Ignoring charge result for canceled subscription"
            );
            return Ok(subscription);
        }

        let now = Utc::now();
        subscription.updated_at = now;

        if success {
            subscription.next_charge_at = subscription
                .interval
                .advance(subscription.next_charge_at)
                .ok_or_else(|| BillingError::Internal("next charge date out of range".to_string()))?;
            subscription.failure_count = 0;
            subscription.status = SubscriptionStatus::Active;
            self.store.update_subscription(&subscription).await?;

            tracing::info!(
                customer_id = %subscription.customer_id,
                subscription_id = %subscription_id,
                amount = subscription.amount,
                next_charge_at = %subscription.next_charge_at,
                "Subscription charge succeeded"
            );
            self.event_logger
                .log_event_best_effort(
                    BillingEventBuilder::new(
                        subscription.customer_id.clone(),
                        BillingEventType::SubscriptionCharged,
                    )
                    .subscription(subscription_id)
                    .gateway_reference(subscription.gateway_reference.as_deref())
                    .data(serde_json::json!({
                        "amount": subscription.amount,
                        "occurred_at": occurred_at,
                        "next_charge_at": subscription.next_charge_at,
                    }))
                    .actor_type(ActorType::Gateway),
                )
                .await;

            return Ok(subscription);
        }

        subscription.failure_count += 1;
        if subscription.failure_count > self.policy.subscription_retry_limit {
            subscription.status = SubscriptionStatus::Canceled;
            subscription.canceled_at = Some(now);
            self.store.update_subscription(&subscription).await?;

            tracing::warn!(
                customer_id = %subscription.customer_id,
                subscription_id = %subscription_id,
                failure_count = subscription.failure_count,
                retry_limit = self.policy.subscription_retry_limit,
                "Canceling subscription after repeated charge failures"
            );
            if let Some(reference) = subscription.gateway_reference.as_deref() {
                self.cancel_remote(reference).await;
            }
            self.event_logger
                .log_event_best_effort(
                    BillingEventBuilder::new(
                        subscription.customer_id.clone(),
                        BillingEventType::SubscriptionCanceled,
                    )
                    .subscription(subscription_id)
                    .gateway_reference(subscription.gateway_reference.as_deref())
                    .data(serde_json::json!({
                        "reason": "payment_failures",
                        "failure_count": subscription.failure_count,
                        "occurred_at": occurred_at,
                    }))
                    .notify(),
                )
                .await;

            return Ok(subscription);
        }

        subscription.status = SubscriptionStatus::PastDue;
        self.store.update_subscription(&subscription).await?;

        tracing::warn!(
            customer_id = %subscription.customer_id,
            subscription_id = %subscription_id,
            failure_count = subscription.failure_count,
            "Subscription charge failed"
        );
        self.event_logger
            .log_event_best_effort(
                BillingEventBuilder::new(subscription.customer_id.clone(), BillingEventType::PaymentFailed)
                    .subscription(subscription_id)
                    .gateway_reference(subscription.gateway_reference.as_deref())
                    .data(serde_json::json!({
                        "amount": subscription.amount,
                        "failure_count": subscription.failure_count,
                        "occurred_at": occurred_at,
                    }))
                    .actor_type(ActorType::Gateway),
            )
            .await;

        Ok(subscription)
    }

    /// Cancel at the gateway, then locally. Canceling twice is a no-op.
    pub async fn cancel(&self, subscription_id: SubscriptionId) -> BillingResult<Subscription> {
        let mut subscription = self.get(subscription_id).await?;
        if subscription.status == SubscriptionStatus::Canceled {
            return Ok(subscription);
        }

        if let Some(reference) = subscription.gateway_reference.as_deref() {
            with_timeout(
                self.policy.gateway_timeout,
                "cancel_subscription",
                self.gateway.cancel_subscription(reference),
            )
            .await?;
        }

        let now = Utc::now();
        subscription.status = SubscriptionStatus::Canceled;
        subscription.canceled_at = Some(now);
        subscription.updated_at = now;
        self.store.update_subscription(&subscription).await?;

        tracing::info!(
            customer_id = %subscription.customer_id,
            subscription_id = %subscription_id,
            "Canceled subscription"
        );
        self.event_logger
            .log_event_best_effort(
                BillingEventBuilder::new(
                    subscription.customer_id.clone(),
                    BillingEventType::SubscriptionCanceled,
                )
                .subscription(subscription_id)
                .gateway_reference(subscription.gateway_reference.as_deref())
                .data(serde_json::json!({ "reason": "requested" }))
                .actor_type(ActorType::Operator),
            )
            .await;

        Ok(subscription)
    }

    pub async fn get(&self, subscription_id: SubscriptionId) -> BillingResult<Subscription> {
        self.store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Subscription {}", subscription_id)))
    }

    pub async fn find_by_reference(&self, reference: &str) -> BillingResult<Option<Subscription>> {
        self.store.find_subscription_by_reference(reference).await
    }

    pub async fn list_for_customer(&self, customer_id: &CustomerId) -> BillingResult<Vec<Subscription>> {
        self.store.subscriptions_for_customer(customer_id).await
    }

    /// Active or past-due subscriptions whose next charge is at or before `as_of`
    pub async fn due_for_charge(&self, as_of: DateTime<Utc>) -> BillingResult<Vec<Subscription>> {
        self.store.subscriptions_due(as_of).await
    }

    async fn cancel_remote(&self, reference: &str) {
        let result = with_timeout(
            self.policy.gateway_timeout,
            "cancel_subscription",
            self.gateway.cancel_subscription(reference),
        )
        .await;

        if let Err(e) = result {
            tracing::warn!(
                gateway_reference = %reference,
                error = %e,
                "Best-effort gateway cancellation failed"
            );
        }
    }
}
