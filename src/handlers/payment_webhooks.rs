use crate::{
    errors::{ApiError, ServiceError},
    services::payments::stripe::{verify_webhook_signature, StripeEvent},
    AppState,
};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde_json::json;
use tracing::{info, warn};

const SIGNATURE_HEADER: &str = "stripe-signature";

/// POST /api/v1/payments/webhooks/stripe
///
/// The raw body is verified against `Stripe-Signature` before it is parsed.
/// Deliveries that carry no PaymentIntent are acknowledged and ignored.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let Some(secret) = state.config.stripe_webhook_secret.as_deref() else {
        warn!("Stripe webhook received but no signing secret is configured");
        return Ok((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "Stripe webhooks are not configured" })),
        )
            .into_response());
    };

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("Missing Stripe-Signature header".into()))?;

    verify_webhook_signature(
        signature,
        &body,
        secret,
        state.config.stripe_webhook_tolerance_secs,
        chrono::Utc::now().timestamp(),
    )
    .map_err(|e| {
        counter!("payments.webhooks.rejected", 1);
        warn!(error = %e, "Stripe webhook signature rejected");
        ApiError::Unauthorized("Invalid webhook signature".into())
    })?;

    let event: StripeEvent = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid webhook payload: {}", e)))?;
    counter!("payments.webhooks.received", 1, "type" => event.event_type.clone());

    let Some(intent) = event.payment_intent() else {
        info!(event_id = %event.id, event_type = %event.event_type, "Ignoring Stripe event");
        return Ok(acknowledged());
    };

    match state.services.reconciler.reconcile(&intent.receipt()).await {
        Ok(outcome) => {
            info!(
                event_id = %event.id,
                order_id = %outcome.order.id,
                status = %outcome.payment_status,
                "Stripe webhook reconciled"
            );
            Ok(acknowledged())
        }
        // Declines and unknown sessions are final answers; Stripe must not retry them.
        Err(ServiceError::PaymentFailed(reason)) => {
            info!(event_id = %event.id, reason = %reason, "Stripe webhook recorded a decline");
            Ok(acknowledged())
        }
        Err(ServiceError::NotFound(message)) => {
            warn!(event_id = %event.id, message = %message, "Stripe webhook for unknown session");
            Ok(acknowledged())
        }
        Err(err) => Err(err.into()),
    }
}

fn acknowledged() -> Response {
    (StatusCode::OK, Json(json!({ "received": true }))).into_response()
}
