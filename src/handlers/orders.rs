use super::common::success_response;
use crate::{auth::AuthenticatedCustomer, errors::ApiError, AppState};
use axum::{
    extract::{Path, State},
    response::Response,
};
use uuid::Uuid;

/// GET /api/v1/orders
pub async fn list_orders(
    State(state): State<AppState>,
    customer: AuthenticatedCustomer,
) -> Result<Response, ApiError> {
    Ok(success_response(
        state
            .services
            .orders
            .list_for_customer(customer.customer_id)
            .await?,
    ))
}

/// GET /api/v1/orders/:id
pub async fn get_order(
    State(state): State<AppState>,
    customer: AuthenticatedCustomer,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    Ok(success_response(
        state
            .services
            .orders
            .get_for_customer(customer.customer_id, id)
            .await?,
    ))
}
