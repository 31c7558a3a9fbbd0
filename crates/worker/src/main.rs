//! usagebill background worker
//!
//! Runs the periodic billing jobs on cron schedules:
//! - billing cycle: invoice every customer with unbilled usage
//! - gateway retry: resend open invoices with exponential backoff
//! - payment status sweep: poll the gateway for sent invoices
//! - notification dispatch: flush pending customer notifications

mod config;
mod jobs;

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use usagebill_billing::{
    BillingPolicy, BillingService, InMemoryGateway, InMemoryStore, PaymentGateway, PgStore,
    StripeGateway, Stores,
};

use crate::config::{GatewayBackend, StoreBackend, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = WorkerConfig::from_env().context("Failed to load worker configuration")?;
    let policy = BillingPolicy::from_env().context("Failed to load billing policy")?;

    let stores = build_stores(&config).await?;
    let gateway = build_gateway(&config)?;
    let service = BillingService::new(stores, gateway, policy);

    let mut scheduler = schedule_jobs(service, config).await?;
    scheduler.start().await?;
    info!("usagebill worker started");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down worker");
    scheduler.shutdown().await?;

    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,usagebill_billing=debug".into()),
    );

    if std::env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false) {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn build_stores(config: &WorkerConfig) -> anyhow::Result<Stores> {
    match config.store {
        StoreBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL not set")?;
            let pool = usagebill_shared::create_pool(url, config.database_max_connections)
                .await
                .context("Failed to connect to database")?;
            usagebill_shared::run_migrations(&pool)
                .await
                .context("Failed to run migrations")?;
            info!("Connected to Postgres billing store");
            Ok(Stores::from_backend(Arc::new(PgStore::new(pool))))
        }
        StoreBackend::Memory => {
            info!("Using in-memory billing store; state is lost on restart");
            Ok(Stores::from_backend(Arc::new(InMemoryStore::new())))
        }
    }
}

fn build_gateway(config: &WorkerConfig) -> anyhow::Result<Arc<dyn PaymentGateway>> {
    match config.gateway {
        GatewayBackend::Stripe => {
            let gateway = StripeGateway::from_env().context("Failed to configure Stripe")?;
            Ok(Arc::new(gateway))
        }
        GatewayBackend::Memory => {
            info!("Using in-memory payment gateway");
            Ok(Arc::new(InMemoryGateway::new()))
        }
    }
}

async fn schedule_jobs(service: BillingService, config: WorkerConfig) -> anyhow::Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    // Billing cycle
    {
        let service = service.clone();
        let period_days = config.billing_period_days;
        let min_amount = config.billing_min_amount;
        scheduler
            .add(Job::new_async(config.billing_cron.as_str(), move |_uuid, _lock| {
                let service = service.clone();
                Box::pin(async move {
                    jobs::run_billing_cycle(&service, period_days, min_amount).await;
                })
            })?)
            .await?;
    }

    // Gateway retry
    {
        let service = service.clone();
        let settings = config.gateway_retry;
        let min_age = chrono::Duration::from_std(config.gateway_retry_min_age)
            .context("GATEWAY_RETRY_MIN_AGE_SECS out of range")?;
        scheduler
            .add(Job::new_async(config.gateway_retry_cron.as_str(), move |_uuid, _lock| {
                let service = service.clone();
                Box::pin(async move {
                    jobs::retry_unsent_invoices(&service, &settings, Utc::now() - min_age).await;
                })
            })?)
            .await?;
    }

    // Payment status sweep
    {
        let service = service.clone();
        scheduler
            .add(Job::new_async(config.status_poll_cron.as_str(), move |_uuid, _lock| {
                let service = service.clone();
                Box::pin(async move {
                    jobs::poll_payment_status(&service).await;
                })
            })?)
            .await?;
    }

    // Notification dispatch
    {
        let batch_size = config.notification_batch_size;
        scheduler
            .add(Job::new_async(config.notification_cron.as_str(), move |_uuid, _lock| {
                let service = service.clone();
                Box::pin(async move {
                    let delivered = jobs::dispatch_notifications(&service, batch_size).await;
                    if delivered > 0 {
                        info!(delivered = delivered, "Dispatched customer notifications");
                    }
                })
            })?)
            .await?;
    }

    info!(
        billing_cron = %config.billing_cron,
        gateway_retry_cron = %config.gateway_retry_cron,
        status_poll_cron = %config.status_poll_cron,
        notification_cron = %config.notification_cron,
        "Scheduled billing jobs"
    );

    Ok(scheduler)
}
