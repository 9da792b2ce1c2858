//! Error-to-response mapping
//!
//! The provider's redelivery policy treats any non-2xx as a failure and
//! retries with backoff, so 4xx is reserved strictly for the
//! authentication-class rejections. Nothing else ever escapes the
//! pipeline as an error.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use billhook_billing::BillingError;

pub struct ApiError(pub BillingError);

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.0.is_rejection() {
            StatusCode::BAD_REQUEST
        } else {
            // Absorbed conditions are acknowledged; reaching here means a
            // code path leaked a non-rejection error, so log it loudly but
            // still do not invite redelivery.
            tracing::error!(error = %self.0, "Non-rejection error escaped the pipeline");
            StatusCode::OK
        };

        let body = Json(serde_json::json!({
            "error": self.0.to_string(),
        }));

        (status, body).into_response()
    }
}
