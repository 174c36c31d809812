use super::common::{created_response, success_response};
use crate::{
    auth::AuthenticatedCustomer, errors::ApiError, services::reviews::SubmitReview, AppState,
};
use axum::{
    extract::{Path, Query, State},
    response::Response,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Default, Deserialize)]
pub struct ProductQuery {
    pub category: Option<String>,
}

/// GET /api/v1/products
pub async fn list_products(
    State(state): State<AppState>,
    Query(query): Query<ProductQuery>,
) -> Result<Response, ApiError> {
    let products = state
        .services
        .catalog
        .list_active(query.category.as_deref())
        .await?;
    Ok(success_response(products))
}

/// GET /api/v1/products/:id
pub async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    Ok(success_response(state.services.catalog.get(id).await?))
}

/// GET /api/v1/products/:id/reviews
pub async fn list_reviews(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    Ok(success_response(
        state.services.reviews.list_for_product(id).await?,
    ))
}

/// POST /api/v1/products/:id/reviews
pub async fn submit_review(
    State(state): State<AppState>,
    customer: AuthenticatedCustomer,
    Path(id): Path<Uuid>,
    Json(payload): Json<SubmitReview>,
) -> Result<Response, ApiError> {
    let review = state
        .services
        .reviews
        .submit(customer.customer_id, id, payload)
        .await?;
    Ok(created_response(review))
}

/// GET /api/v1/bundles
pub async fn list_bundles(State(state): State<AppState>) -> Result<Response, ApiError> {
    Ok(success_response(
        state.services.catalog.list_active_bundles().await?,
    ))
}
