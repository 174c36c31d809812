use super::common::{no_content_response, notice_response, success_response, validate_input};
use crate::{
    auth::{AuthenticatedCustomer, GuestSession, RequestCartOwner},
    errors::ApiError,
    AppState,
};
use axum::{
    extract::{Path, State},
    response::Response,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize)]
pub struct AddItemRequest {
    pub product_id: Uuid,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ApplyCouponRequest {
    #[validate(length(min = 1, max = 64))]
    pub code: String,
}

/// GET /api/v1/cart
pub async fn get_cart(
    State(state): State<AppState>,
    RequestCartOwner(owner): RequestCartOwner,
) -> Result<Response, ApiError> {
    Ok(success_response(state.services.carts.get(&owner).await?))
}

/// POST /api/v1/cart/items
pub async fn add_item(
    State(state): State<AppState>,
    RequestCartOwner(owner): RequestCartOwner,
    Json(payload): Json<AddItemRequest>,
) -> Result<Response, ApiError> {
    let update = state
        .services
        .carts
        .add_product(&owner, payload.product_id)
        .await?;
    Ok(notice_response(update.cart, update.notice))
}

/// POST /api/v1/cart/bundles/:id
pub async fn add_bundle(
    State(state): State<AppState>,
    RequestCartOwner(owner): RequestCartOwner,
    Path(bundle_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let update = state.services.carts.add_bundle(&owner, bundle_id).await?;
    Ok(notice_response(update.cart, update.notice))
}

/// DELETE /api/v1/cart/items/:product_id
pub async fn remove_item(
    State(state): State<AppState>,
    RequestCartOwner(owner): RequestCartOwner,
    Path(product_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let update = state.services.carts.remove(&owner, product_id).await?;
    Ok(notice_response(update.cart, update.notice))
}

/// DELETE /api/v1/cart
pub async fn clear_cart(
    State(state): State<AppState>,
    RequestCartOwner(owner): RequestCartOwner,
) -> Result<Response, ApiError> {
    state.services.carts.clear(&owner).await?;
    Ok(no_content_response())
}

/// POST /api/v1/cart/coupon
pub async fn apply_coupon(
    State(state): State<AppState>,
    RequestCartOwner(owner): RequestCartOwner,
    Json(payload): Json<ApplyCouponRequest>,
) -> Result<Response, ApiError> {
    validate_input(&payload)?;
    let update = state
        .services
        .carts
        .apply_coupon(&owner, &payload.code)
        .await?;
    Ok(notice_response(update.cart, update.notice))
}

/// DELETE /api/v1/cart/coupon
pub async fn remove_coupon(
    State(state): State<AppState>,
    RequestCartOwner(owner): RequestCartOwner,
) -> Result<Response, ApiError> {
    let update = state.services.carts.remove_coupon(&owner).await?;
    Ok(notice_response(update.cart, update.notice))
}

/// POST /api/v1/cart/merge
///
/// Called once after sign-in with the guest session the visitor used before.
pub async fn merge_guest_cart(
    State(state): State<AppState>,
    customer: AuthenticatedCustomer,
    GuestSession(session): GuestSession,
) -> Result<Response, ApiError> {
    let update = state
        .services
        .carts
        .merge_guest_into(&session, customer.customer_id)
        .await?;
    Ok(notice_response(update.cart, update.notice))
}
