use super::common::{created_response, success_response};
use crate::{
    auth::AuthenticatedCustomer, errors::ApiError, services::checkout::CheckoutRequest, AppState,
};
use axum::{
    extract::{Path, State},
    response::Response,
    Json,
};
use uuid::Uuid;

/// POST /api/v1/checkout
pub async fn begin_checkout(
    State(state): State<AppState>,
    customer: AuthenticatedCustomer,
    Json(payload): Json<CheckoutRequest>,
) -> Result<Response, ApiError> {
    let session = state.services.checkout.begin(&customer, payload).await?;
    Ok(created_response(session))
}

/// POST /api/v1/checkout/:order_id/confirm
pub async fn confirm_checkout(
    State(state): State<AppState>,
    customer: AuthenticatedCustomer,
    Path(order_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let result = state
        .services
        .checkout
        .confirm(customer.customer_id, order_id)
        .await?;
    Ok(success_response(result))
}

/// POST /api/v1/checkout/:order_id/cancel
pub async fn cancel_checkout(
    State(state): State<AppState>,
    customer: AuthenticatedCustomer,
    Path(order_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let result = state
        .services
        .checkout
        .cancel(customer.customer_id, order_id)
        .await?;
    Ok(success_response(result))
}

/// GET /api/v1/payments/providers
pub async fn list_payment_providers(State(state): State<AppState>) -> Response {
    success_response(state.services.payments.providers())
}
