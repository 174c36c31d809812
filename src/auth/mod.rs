//! Customer authentication.
//!
//! Sessions are owned by the external identity provider. This module only
//! verifies the HS256 bearer tokens it issues and exposes the customer to
//! handlers through axum extractors.

use crate::{errors::ApiError, services::cart::CartOwner, AppState};
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// Header carrying the anonymous cart session id.
pub const CART_SESSION_HEADER: &str = "x-cart-session";

const MAX_CART_SESSION_LEN: usize = 64;

/// JWT claims issued by the identity provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Customer id
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub exp: i64,
    #[serde(default)]
    pub iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

/// The authenticated customer behind a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthenticatedCustomer {
    pub customer_id: Uuid,
    pub email: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("token expired")]
    TokenExpired,
    #[error("invalid token")]
    InvalidToken,
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        ApiError::Unauthorized(err.to_string())
    }
}

/// Verifies identity-provider tokens.
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str, issuer: Option<&str>, audience: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        if let Some(iss) = issuer {
            validation.set_issuer(&[iss]);
        }
        if let Some(aud) = audience {
            validation.set_audience(&[aud]);
        }

        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> Result<AuthenticatedCustomer, AuthError> {
        let claims = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken,
            })?
            .claims;

        let customer_id = Uuid::parse_str(&claims.sub).map_err(|_| AuthError::InvalidToken)?;

        Ok(AuthenticatedCustomer {
            customer_id,
            email: claims.email,
            name: claims.name,
        })
    }
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn cart_session(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(CART_SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty() && s.len() <= MAX_CART_SESSION_LEN)
        .map(str::to_string)
}

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedCustomer {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).ok_or(AuthError::MissingToken)?;
        let customer = state.services.token_verifier.verify(token).map_err(|e| {
            debug!(error = %e, "Rejected bearer token");
            e
        })?;
        Ok(customer)
    }
}

/// Cart owner of the request: the customer when a valid bearer token is
/// present, otherwise the guest session from `x-cart-session`.
#[derive(Debug, Clone)]
pub struct RequestCartOwner(pub CartOwner);

#[async_trait]
impl FromRequestParts<AppState> for RequestCartOwner {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        if bearer_token(parts).is_some() {
            let customer = AuthenticatedCustomer::from_request_parts(parts, state).await?;
            return Ok(RequestCartOwner(CartOwner::Customer(customer.customer_id)));
        }

        cart_session(parts)
            .map(|session| RequestCartOwner(CartOwner::Guest(session)))
            .ok_or_else(|| {
                ApiError::BadRequest(format!(
                    "Sign in or provide a {} header to use the cart",
                    CART_SESSION_HEADER
                ))
            })
    }
}

/// Guest session header, required when merging a guest cart after sign-in.
#[derive(Debug, Clone)]
pub struct GuestSession(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for GuestSession {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        cart_session(parts)
            .map(GuestSession)
            .ok_or_else(|| ApiError::BadRequest(format!("Missing {} header", CART_SESSION_HEADER)))
    }
}
