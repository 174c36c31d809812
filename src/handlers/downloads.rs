use super::common::{client_ip, success_response, user_agent};
use crate::{
    auth::AuthenticatedCustomer,
    errors::{ApiError, ServiceError},
    services::downloads::ClientInfo,
    AppState,
};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;
use uuid::Uuid;

const GENERIC_FAILURE: &str = "Download failed";

/// GET /api/v1/downloads
pub async fn list_downloads(
    State(state): State<AppState>,
    customer: AuthenticatedCustomer,
) -> Result<Response, ApiError> {
    Ok(success_response(
        state
            .services
            .downloads
            .list_for_customer(customer.customer_id)
            .await?,
    ))
}

/// POST /api/v1/downloads/:order_id/:product_id/reissue
pub async fn reissue_download(
    State(state): State<AppState>,
    customer: AuthenticatedCustomer,
    Path((order_id, product_id)): Path<(Uuid, Uuid)>,
) -> Result<Response, ApiError> {
    Ok(success_response(
        state
            .services
            .downloads
            .reissue(customer.customer_id, order_id, product_id)
            .await?,
    ))
}

/// GET /secure-download/:credential
///
/// Every failure answers 403 with a generic message.
pub async fn secure_download(
    State(state): State<AppState>,
    Path(credential): Path<String>,
    headers: HeaderMap,
) -> Response {
    let client = ClientInfo {
        ip_address: client_ip(&headers),
        user_agent: user_agent(&headers),
    };

    match state.services.downloads.redeem(&credential, client).await {
        Ok(redemption) => {
            let disposition = format!(
                "attachment; filename=\"{}\"",
                redemption.file_name.replace(['"', '\\'], "")
            );
            let disposition = HeaderValue::from_str(&disposition)
                .unwrap_or_else(|_| HeaderValue::from_static("attachment"));

            (
                StatusCode::OK,
                [
                    (
                        header::CONTENT_TYPE,
                        HeaderValue::from_static("application/octet-stream"),
                    ),
                    (header::CONTENT_DISPOSITION, disposition),
                    (
                        header::CACHE_CONTROL,
                        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
                    ),
                ],
                Body::from_stream(redemption.stream),
            )
                .into_response()
        }
        Err(ServiceError::Redemption(reason)) => forbidden(reason.public_message()),
        Err(err) => {
            error!(error = %err, "Secure download failed");
            forbidden(GENERIC_FAILURE)
        }
    }
}

fn forbidden(message: &str) -> Response {
    (StatusCode::FORBIDDEN, Json(json!({ "error": message }))).into_response()
}
