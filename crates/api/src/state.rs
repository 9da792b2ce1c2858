//! Application state

use std::sync::Arc;

use billhook_billing::WebhookProcessor;
use sqlx::PgPool;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub processor: Arc<WebhookProcessor>,
}

impl AppState {
    pub fn new(pool: PgPool, processor: Arc<WebhookProcessor>) -> Self {
        Self { pool, processor }
    }
}
