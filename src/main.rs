use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{routing::get, Router};
use axum_prometheus::PrometheusMetricLayer;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, EnvFilter};

use metering_backend::billing::BillingStore;
use metering_backend::config::{
    self, BillingSettings, MessagingSettings, SchedulerSettings, StoreBackend, UsageSettings,
};
use metering_backend::db::{PgBillingStore, PgSequenceStore};
use metering_backend::memory::{MemoryBillingStore, MemorySequenceStore};
use metering_backend::messaging::{MessagingProvider, TwilioMessenger, UnconfiguredMessenger};
use metering_backend::sequences::{spawn_sequence_scheduler, SequenceStore};
use metering_backend::AppServices;

async fn root() -> &'static str {
    "Metering API"
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    let billing_settings = BillingSettings::from_env()?;
    let scheduler_settings = SchedulerSettings::from_env()?;
    let messaging_settings = MessagingSettings::from_env()?;
    let usage_settings = UsageSettings::from_env();

    let (billing_store, sequence_store): (Arc<dyn BillingStore>, Arc<dyn SequenceStore>) =
        match *config::STORE_BACKEND {
            StoreBackend::Memory => {
                tracing::warn!("using in-memory stores; state is lost on restart");
                (
                    Arc::new(MemoryBillingStore::new()),
                    Arc::new(MemorySequenceStore::new()),
                )
            }
            StoreBackend::Postgres => {
                let pool = PgPoolOptions::new()
                    .max_connections(5)
                    .connect(config::DATABASE_URL.as_str())
                    .await
                    .context("failed to connect to Postgres")?;

                if let Err(error) = sqlx::migrate!().run(&pool).await {
                    if *config::ALLOW_MIGRATION_FAILURE {
                        tracing::warn!(
                            ?error,
                            "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
                        );
                    } else {
                        return Err(error).context("database migrations failed");
                    }
                }
                (
                    Arc::new(PgBillingStore::new(pool.clone())),
                    Arc::new(PgSequenceStore::new(pool)),
                )
            }
        };

    let messenger: Arc<dyn MessagingProvider> = if messaging_settings.is_configured() {
        Arc::new(TwilioMessenger::new(&messaging_settings)?)
    } else {
        tracing::warn!("messaging provider credentials missing; sequence steps will fail to send");
        Arc::new(UnconfiguredMessenger)
    };
    let messaging_ready = messaging_settings.is_configured();

    let (services, _usage_writer) = AppServices::assemble(
        billing_store,
        sequence_store,
        messenger,
        billing_settings,
        scheduler_settings,
        &usage_settings,
    )?;

    if messaging_ready {
        if spawn_sequence_scheduler(services.scheduler.clone()).is_none() {
            tracing::info!("in-process sequence scheduler disabled; relying on the cron endpoint");
        }
    } else {
        tracing::warn!("in-process sequence scheduler not started without messaging credentials");
    }

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route("/", get(root))
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(services.router())
        .layer(prometheus_layer);

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .context("invalid bind address")?;
    tracing::info!(%addr, backend = config::STORE_BACKEND.as_str(), "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
