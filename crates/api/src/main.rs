//! Billhook webhook ingress server
//!
//! Receives payment-provider webhook deliveries and feeds them through the
//! billing pipeline. The pipeline's collaborators (processed-event store,
//! account store, ledger) are Postgres-backed; the notifier falls back to
//! the null implementation when the email collaborator is unconfigured.

mod config;
mod error;
mod routes;
mod state;

use std::sync::Arc;
use std::time::Duration;

use billhook_billing::{
    EmailNotifier, NotifierConfig, Notifier, NullNotifier, PgAccountStore, PgLedgerWriter,
    PgProcessedEventStore, WebhookConfig, WebhookProcessor,
};
use sqlx::postgres::PgPoolOptions;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::routes::create_router;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,billhook_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Billhook API server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    let webhook_config = WebhookConfig::from_env()?;
    tracing::info!(
        tolerance_secs = webhook_config.signature_tolerance_secs,
        "Configuration loaded"
    );

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&config.database_url)
        .await?;
    tracing::info!("Database connection established");

    tracing::info!("Running database migrations...");
    sqlx::migrate!("../../migrations").run(&pool).await?;

    let notifier: Arc<dyn Notifier> = match NotifierConfig::from_env() {
        Some(notifier_config) => {
            tracing::info!(from = %notifier_config.from_address, "Email notifier configured");
            Arc::new(EmailNotifier::new(notifier_config))
        }
        None => {
            tracing::warn!("Email collaborator not configured - notifications disabled");
            Arc::new(NullNotifier)
        }
    };

    let processor = Arc::new(WebhookProcessor::new(
        &webhook_config,
        Arc::new(PgProcessedEventStore::new(pool.clone())),
        Arc::new(PgAccountStore::new(pool.clone())),
        Arc::new(PgLedgerWriter::new(pool.clone())),
        notifier,
    ));

    let state = AppState::new(pool, processor);
    let app = create_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "Listening for webhook deliveries");
    axum::serve(listener, app).await?;

    Ok(())
}
