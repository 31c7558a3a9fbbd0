//! Stripe payment gateway
//!
//! Invoices are created as Stripe invoices with one invoice item per line,
//! collected with `send_invoice`, and finalized so Stripe emails the hosted
//! payment page. Subscriptions are backed by an ad-hoc recurring price.
//!
//! Every write made while creating an invoice carries an idempotency key
//! derived from our invoice id, so a retry after a timeout replays Stripe's
//! earlier responses instead of opening a second invoice. Once those keys have
//! expired, a finalized Stripe invoice tagged with our id is found by search
//! and reused.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stripe::{
    CancelSubscription, Client, CreateCustomer, CreateInvoice, CreateInvoiceItem,
    CreatePaymentLink, CreatePaymentLinkLineItems, CreatePrice, CreatePriceProductData,
    CreatePriceRecurring, CreatePriceRecurringInterval, CreateSubscription,
    CreateSubscriptionItems, Customer, Invoice, InvoiceItem, ListCustomers, PaymentLink, Price,
    RequestStrategy, Subscription,
};
use tokio::sync::Mutex;
use usagebill_shared::{BillingInterval, CustomerId, InvoiceId};

use crate::error::{BillingError, BillingResult};
use crate::gateway::{
    GatewayPaymentStatus, GatewaySubscription, GatewaySubscriptionStatus, PayableArtifact,
    PayableRequest, PaymentGateway, PaymentStatus,
};

const INVOICE_METADATA_KEY: &str = "usagebill_invoice_id";
const CUSTOMER_METADATA_KEY: &str = "usagebill_customer_id";

/// Search endpoint response; only the matches are needed
#[derive(Deserialize)]
struct SearchResult<T> {
    data: Vec<T>,
}

#[derive(Serialize)]
struct SearchQuery<'a> {
    query: &'a str,
    limit: u64,
}

/// Stripe-backed [`PaymentGateway`]
#[derive(Clone)]
pub struct StripeGateway {
    client: Client,
    /// Resolved Stripe customers, keyed by our customer id
    customers: Arc<Mutex<HashMap<CustomerId, stripe::CustomerId>>>,
}

impl StripeGateway {
    pub fn new(secret_key: &str) -> Self {
        Self {
            client: Client::new(secret_key),
            customers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Build from `STRIPE_SECRET_KEY`
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;
        Ok(Self::new(&secret_key))
    }

    /// A customer id that already names a Stripe customer
    fn direct_customer_id(customer_ref: &CustomerId) -> Option<stripe::CustomerId> {
        customer_ref.as_str().parse::<stripe::CustomerId>().ok()
    }

    fn customer_email(customer_ref: &CustomerId) -> Option<&str> {
        let value = customer_ref.as_str();
        value.contains('@').then_some(value)
    }

    fn currency(code: &str) -> BillingResult<stripe::Currency> {
        code.parse::<stripe::Currency>()
            .map_err(|_| BillingError::Config(format!("Unsupported currency: {}", code)))
    }

    fn idempotency_key(invoice_id: &InvoiceId, step: &str) -> String {
        format!("usagebill-invoice-{}-{}", invoice_id, step)
    }

    /// Stripe search clause matching one metadata value exactly
    fn metadata_query(key: &str, value: &str) -> String {
        let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
        format!("metadata['{}']:'{}'", key, escaped)
    }

    fn idempotent(&self, key: String) -> Client {
        self.client.clone().with_strategy(RequestStrategy::Idempotent(key))
    }

    async fn search<T>(&self, path: &str, query: &str) -> BillingResult<Vec<T>>
    where
        T: serde::de::DeserializeOwned + Send + 'static,
    {
        let result: SearchResult<T> = self
            .client
            .get_query(path, SearchQuery { query, limit: 1 })
            .await?;
        Ok(result.data)
    }

    /// Map our customer id to a Stripe customer, creating one on first use.
    ///
    /// `cus_` ids are used as given. An email address is matched against
    /// existing Stripe customers by email; anything else by the metadata tag
    /// written when the customer was created.
    async fn resolve_customer(&self, customer_ref: &CustomerId) -> BillingResult<stripe::CustomerId> {
        if let Some(id) = Self::direct_customer_id(customer_ref) {
            return Ok(id);
        }
        if let Some(id) = self.customers.lock().await.get(customer_ref) {
            return Ok(id.clone());
        }

        let email = Self::customer_email(customer_ref);
        let existing = match email {
            Some(email) => {
                let mut params = ListCustomers::new();
                params.email = Some(email);
                params.limit = Some(1);
                Customer::list(&self.client, &params).await?.data
            }
            None => {
                let query = Self::metadata_query(CUSTOMER_METADATA_KEY, customer_ref.as_str());
                self.search::<Customer>("/customers/search", &query).await?
            }
        };

        let stripe_id = match existing.into_iter().next() {
            Some(customer) => customer.id,
            None => {
                let mut metadata = HashMap::new();
                metadata.insert(CUSTOMER_METADATA_KEY.to_string(), customer_ref.to_string());
                let mut params = CreateCustomer::new();
                params.email = email;
                params.metadata = Some(metadata);
                let key = format!("usagebill-customer-{}", customer_ref);
                let customer = Customer::create(&self.idempotent(key), params).await?;
                tracing::info!(
                    customer_id = %customer_ref,
                    stripe_customer_id = %customer.id,
                    "Created Stripe customer"
                );
                customer.id
            }
        };

        self.customers
            .lock()
            .await
            .insert(customer_ref.clone(), stripe_id.clone());
        Ok(stripe_id)
    }

    /// A finalized Stripe invoice left behind by an earlier attempt
    async fn existing_invoice(&self, invoice_id: &InvoiceId) -> BillingResult<Option<Invoice>> {
        let query = Self::metadata_query(INVOICE_METADATA_KEY, &invoice_id.to_string());
        let found = self.search::<Invoice>("/invoices/search", &query).await?;
        Ok(found.into_iter().find(|invoice| {
            !matches!(
                invoice.status,
                None | Some(stripe::InvoiceStatus::Draft) | Some(stripe::InvoiceStatus::Void)
            )
        }))
    }

    fn invoice_id(reference: &str) -> BillingResult<stripe::InvoiceId> {
        reference
            .parse::<stripe::InvoiceId>()
            .map_err(|e| BillingError::gateway_rejected(None, format!("Invalid invoice ID: {}", e)))
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_payable(&self, request: &PayableRequest) -> BillingResult<PayableArtifact> {
        let currency = Self::currency(&request.currency)?;

        if let Some(existing) = self.existing_invoice(&request.invoice_id).await? {
            tracing::info!(
                invoice_id = %request.invoice_id,
                stripe_invoice_id = %existing.id,
                "Reusing Stripe invoice from an earlier attempt"
            );
            return Ok(PayableArtifact {
                reference: existing.id.to_string(),
                payment_url: existing.hosted_invoice_url,
            });
        }

        let customer_id = self.resolve_customer(&request.customer_ref).await?;

        let mut metadata = HashMap::new();
        metadata.insert(INVOICE_METADATA_KEY.to_string(), request.invoice_id.to_string());

        let mut invoice_params = CreateInvoice::new();
        invoice_params.customer = Some(customer_id.clone());
        invoice_params.currency = Some(currency);
        invoice_params.auto_advance = Some(true);
        invoice_params.collection_method = Some(stripe::CollectionMethod::SendInvoice);
        invoice_params.days_until_due = Some(request.days_until_due);
        invoice_params.metadata = Some(metadata);

        let create_client = self.idempotent(Self::idempotency_key(&request.invoice_id, "create"));
        let invoice = Invoice::create(&create_client, invoice_params).await?;

        for (index, line) in request.line_items.iter().enumerate() {
            let mut item_params = CreateInvoiceItem::new(customer_id.clone());
            item_params.invoice = Some(invoice.id.clone());
            item_params.amount = Some(line.amount);
            item_params.currency = Some(currency);
            item_params.description = Some(&line.description);
            let item_client =
                self.idempotent(Self::idempotency_key(&request.invoice_id, &format!("item-{}", index)));
            InvoiceItem::create(&item_client, item_params).await?;
        }

        // Keep Stripe's item sum equal to our rounded total
        let adjustment = request.rounding_adjustment();
        if adjustment != 0 {
            let mut item_params = CreateInvoiceItem::new(customer_id.clone());
            item_params.invoice = Some(invoice.id.clone());
            item_params.amount = Some(adjustment);
            item_params.currency = Some(currency);
            item_params.description = Some("Rounding adjustment");
            let item_client = self.idempotent(Self::idempotency_key(&request.invoice_id, "adjustment"));
            InvoiceItem::create(&item_client, item_params).await?;
        }

        let finalize_client = self.idempotent(Self::idempotency_key(&request.invoice_id, "finalize"));
        let finalized = Invoice::finalize(&finalize_client, &invoice.id, Default::default()).await?;

        tracing::info!(
            invoice_id = %request.invoice_id,
            stripe_invoice_id = %finalized.id,
            amount_total = request.amount_total,
            rounding_adjustment = adjustment,
            "Created Stripe invoice"
        );

        Ok(PayableArtifact {
            reference: finalized.id.to_string(),
            payment_url: finalized.hosted_invoice_url,
        })
    }

    async fn create_subscription(
        &self,
        customer_ref: &CustomerId,
        amount: i64,
        currency: &str,
        interval: BillingInterval,
    ) -> BillingResult<GatewaySubscription> {
        let currency = Self::currency(currency)?;
        let customer_id = self.resolve_customer(customer_ref).await?;

        let recurring_interval = match interval {
            BillingInterval::Day => CreatePriceRecurringInterval::Day,
            BillingInterval::Week => CreatePriceRecurringInterval::Week,
            BillingInterval::Month => CreatePriceRecurringInterval::Month,
            BillingInterval::Year => CreatePriceRecurringInterval::Year,
        };

        let mut price_params = CreatePrice::new(currency);
        price_params.unit_amount = Some(amount);
        price_params.recurring = Some(CreatePriceRecurring {
            interval: recurring_interval,
            interval_count: None,
            aggregate_usage: None,
            trial_period_days: None,
            usage_type: None,
        });
        price_params.product_data = Some(CreatePriceProductData {
            name: format!("Subscription ({} per {})", amount, interval),
            ..Default::default()
        });

        let price = Price::create(&self.client, price_params).await?;

        let mut metadata = HashMap::new();
        metadata.insert(CUSTOMER_METADATA_KEY.to_string(), customer_ref.to_string());

        let mut params = CreateSubscription::new(customer_id);
        params.items = Some(vec![CreateSubscriptionItems {
            price: Some(price.id.to_string()),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.metadata = Some(metadata);

        let subscription = Subscription::create(&self.client, params).await?;

        let status = match subscription.status {
            stripe::SubscriptionStatus::Active => GatewaySubscriptionStatus::Active,
            stripe::SubscriptionStatus::Trialing => GatewaySubscriptionStatus::Trialing,
            stripe::SubscriptionStatus::PastDue | stripe::SubscriptionStatus::Unpaid => {
                GatewaySubscriptionStatus::PastDue
            }
            stripe::SubscriptionStatus::Canceled | stripe::SubscriptionStatus::IncompleteExpired => {
                GatewaySubscriptionStatus::Canceled
            }
            _ => GatewaySubscriptionStatus::Incomplete,
        };

        tracing::info!(
            customer_id = %customer_ref,
            stripe_subscription_id = %subscription.id,
            price_id = %price.id,
            status = ?status,
            "Created Stripe subscription"
        );

        Ok(GatewaySubscription {
            subscription_ref: subscription.id.to_string(),
            status,
        })
    }

    async fn get_status(&self, reference: &str) -> BillingResult<PaymentStatus> {
        let invoice_id = Self::invoice_id(reference)?;

        let invoice = Invoice::retrieve(&self.client, &invoice_id, &[]).await?;

        let status = match invoice.status {
            Some(stripe::InvoiceStatus::Paid) => GatewayPaymentStatus::Paid,
            Some(stripe::InvoiceStatus::Uncollectible) => GatewayPaymentStatus::Failed,
            Some(stripe::InvoiceStatus::Void) => GatewayPaymentStatus::Void,
            _ => GatewayPaymentStatus::Pending,
        };

        Ok(PaymentStatus {
            status,
            amount_paid: invoice.amount_paid.unwrap_or(0),
            amount_due: invoice.amount_due.unwrap_or(0),
        })
    }

    async fn void_payable(&self, reference: &str) -> BillingResult<()> {
        let invoice_id = Self::invoice_id(reference)?;

        // Stripe refuses with 400 once the invoice is paid
        let voided: Invoice = self
            .client
            .post(&format!("/invoices/{}/void", invoice_id))
            .await?;

        tracing::info!(
            stripe_invoice_id = %voided.id,
            "Voided Stripe invoice"
        );
        Ok(())
    }

    async fn create_payment_link(
        &self,
        description: &str,
        amount: i64,
        currency: &str,
    ) -> BillingResult<String> {
        let mut price_params = CreatePrice::new(Self::currency(currency)?);
        price_params.unit_amount = Some(amount);
        price_params.product_data = Some(CreatePriceProductData {
            name: description.to_string(),
            ..Default::default()
        });
        let price = Price::create(&self.client, price_params).await?;

        let params = CreatePaymentLink::new(vec![CreatePaymentLinkLineItems {
            price: price.id.to_string(),
            quantity: 1,
            ..Default::default()
        }]);
        let link = PaymentLink::create(&self.client, params).await?;

        tracing::info!(
            payment_link_id = %link.id,
            amount = amount,
            "Created Stripe payment link"
        );
        Ok(link.url)
    }

    async fn cancel_subscription(&self, subscription_ref: &str) -> BillingResult<()> {
        let sub_id = subscription_ref
            .parse::<stripe::SubscriptionId>()
            .map_err(|e| BillingError::gateway_rejected(None, format!("Invalid subscription ID: {}", e)))?;

        let params = CancelSubscription {
            cancellation_details: None,
            invoice_now: None,
            prorate: None,
        };

        Subscription::cancel(&self.client, &sub_id, params).await?;

        tracing::info!(
            stripe_subscription_id = %subscription_ref,
            "Canceled Stripe subscription"
        );
        Ok(())
    }
}
