//! usagebill billing engine
//!
//! Records billable usage, aggregates it into invoices, drives recurring
//! subscription charges through a payment gateway and projects margins.
//! Persistence and the gateway are injected; see [`BillingService`].

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

use std::sync::Arc;

pub mod error;
pub mod events;
pub mod gateway;
pub mod invoice;
pub mod ledger;
pub mod memory;
pub mod policy;
pub mod postgres;
pub mod projection;
pub mod store;
pub mod stripe_gateway;
pub mod subscription;
pub mod webhooks;

pub use error::{BillingError, BillingResult};
pub use events::{ActorType, BillingEvent, BillingEventBuilder, BillingEventLogger, BillingEventType};
pub use gateway::{
    GatewayPaymentStatus, GatewaySubscription, GatewaySubscriptionStatus, InMemoryGateway,
    PayableArtifact, PayableLine, PayableRequest, PaymentGateway, PaymentStatus,
};
pub use invoice::{aggregate, InvoiceGenerator, PaymentCheck};
pub use ledger::UsageLedger;
pub use memory::InMemoryStore;
pub use policy::{BillingPolicy, ProjectionThresholds, RoundingMode};
pub use postgres::PgStore;
pub use projection::{CostProjection, CostProjector, Recommendation};
pub use store::{EventStore, InvoiceStore, Stores, SubscriptionStore, UsageStore};
pub use stripe_gateway::StripeGateway;
pub use subscription::SubscriptionManager;
pub use webhooks::{signature_header, WebhookHandler, WebhookNotification, WebhookOutcome};

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub ledger: UsageLedger,
    pub invoices: InvoiceGenerator,
    pub subscriptions: SubscriptionManager,
    pub projector: CostProjector,
    pub events: BillingEventLogger,
    stores: Stores,
    policy: Arc<BillingPolicy>,
}

impl BillingService {
    /// Wire every component to one set of stores, one gateway and one policy
    pub fn new(stores: Stores, gateway: Arc<dyn PaymentGateway>, policy: BillingPolicy) -> Self {
        let policy = Arc::new(policy);
        let events = BillingEventLogger::new(stores.events.clone());
        let ledger = UsageLedger::new(stores.usage.clone(), events.clone());
        let invoices = InvoiceGenerator::new(
            ledger.clone(),
            stores.invoices.clone(),
            gateway.clone(),
            policy.clone(),
            events.clone(),
        );
        let subscriptions = SubscriptionManager::new(
            stores.subscriptions.clone(),
            gateway,
            policy.clone(),
            events.clone(),
        );

        Self {
            ledger,
            invoices,
            subscriptions,
            projector: CostProjector::new(policy.projection),
            events,
            stores,
            policy,
        }
    }

    /// Service backed by a fresh [`InMemoryStore`]
    pub fn in_memory(gateway: Arc<dyn PaymentGateway>, policy: BillingPolicy) -> Self {
        Self::new(
            Stores::from_backend(Arc::new(InMemoryStore::new())),
            gateway,
            policy,
        )
    }

    /// Webhook handler sharing this service's components
    pub fn webhook_handler(&self, secret: impl Into<String>) -> WebhookHandler {
        WebhookHandler::new(
            secret,
            self.policy.webhook_tolerance_secs,
            self.invoices.clone(),
            self.subscriptions.clone(),
            self.stores.events.clone(),
        )
    }

    pub fn policy(&self) -> &BillingPolicy {
        &self.policy
    }
}
