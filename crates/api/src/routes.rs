//! HTTP routes
//!
//! A single inbound endpoint accepts the provider's POST with the raw
//! body and signature header. The body must reach verification byte-exact,
//! so it is extracted as a raw string, never through a JSON extractor.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use billhook_billing::{Acknowledgment, BillingError};

use crate::error::ApiError;
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/stripe", post(billing_webhook))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> StatusCode {
    match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::error!(error = %e, "Health check database probe failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Inbound webhook deliveries from the payment provider.
///
/// Responds 200 for everything the signature gate admits (success, no-op,
/// duplicate, and handler-failure-but-logged alike) and 400 only for the
/// authentication-class rejections.
async fn billing_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let signature = headers
        .get("Stripe-Signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError(BillingError::SignatureInvalid))?;

    let ack = state.processor.process(&body, signature).await?;

    let received = match &ack {
        Acknowledgment::Processed { event_id }
        | Acknowledgment::Duplicate { event_id }
        | Acknowledgment::Unrouted { event_id, .. }
        | Acknowledgment::HandlerFailed { event_id } => event_id.clone(),
    };

    Ok((
        StatusCode::OK,
        Json(serde_json::json!({ "received": received })),
    ))
}
