//! Bearer token authentication
//!
//! Admin endpoints go through [`require_admin`]. Agent and node WebSocket
//! upgrades authenticate in their handlers instead, since the subject has to
//! match the resource being connected.

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
    Json,
};
use fleet_auth::{FleetClaims, JwtValidator, TokenKind};
use std::sync::Arc;

use crate::error::ApiError;
use crate::models::ErrorResponse;

/// JWT validation state shared across middleware instances
#[derive(Clone)]
pub struct JwtState {
    pub validator: Arc<JwtValidator>,
}

impl JwtState {
    pub fn new(validator: Arc<JwtValidator>) -> Self {
        Self { validator }
    }

    /// Validate a token and check it was issued for `kind`
    pub fn authenticate(&self, token: &str, kind: TokenKind) -> Result<FleetClaims, ApiError> {
        let claims = self.validator.validate(token)?;
        if claims.kind != kind {
            return Err(ApiError::Forbidden(format!(
                "Token issued for {:?}, expected {:?}",
                claims.kind, kind
            )));
        }
        Ok(claims)
    }
}

/// Token from `Authorization: Bearer <token>`, else the `token` query parameter
///
/// Agents behind proxies that strip headers on upgrade fall back to the query.
pub fn bearer_token(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    let from_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());

    from_header.or_else(|| {
        query?
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == "token")
            .map(|(_, value)| value.to_string())
            .filter(|t| !t.is_empty())
    })
}

/// Middleware admitting only admin tokens
///
/// Injects the validated [`FleetClaims`] into request extensions.
pub async fn require_admin(
    State(state): State<Arc<JwtState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    let token = bearer_token(request.headers(), request.uri().query()).ok_or_else(|| {
        (
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse {
                error: "Missing bearer token".to_string(),
                code: Some("MISSING_AUTH".to_string()),
            }),
        )
    })?;

    let claims = state
        .authenticate(&token, TokenKind::Admin)
        .map_err(|e| match e {
            ApiError::Forbidden(msg) => (
                StatusCode::FORBIDDEN,
                Json(ErrorResponse {
                    error: msg,
                    code: Some("ADMIN_REQUIRED".to_string()),
                }),
            ),
            other => (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: other.to_string(),
                    code: Some("INVALID_TOKEN".to_string()),
                }),
            ),
        })?;

    request.extensions_mut().insert(claims);
    Ok(next.run(request).await)
}
