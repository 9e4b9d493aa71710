//! Token issuance and identity endpoints.
//!
//! # Endpoints
//!
//! - `POST /auth` - Exchange application credentials for a bearer token
//! - `GET /api/v1/whoami` - Claims of the presented token (protected)

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::{Extension, Json};
use tracing::{info, instrument, warn};

use crate::auth::AuthClaims;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{TokenRequest, TokenResponse, WhoAmIResponse};
use crate::state::AppState;

/// Issue a token for valid application credentials.
///
/// # Request Body
///
/// ```json
/// { "app_key": "blog", "app_secret": "s3cret" }
/// ```
///
/// # Errors
///
/// - `400` with the invalid-params code for a malformed body or empty fields
/// - `401` with the auth-not-exist code for unknown credentials
#[instrument(skip(state, payload))]
pub async fn issue_token(
    State(state): State<AppState>,
    payload: Result<Json<TokenRequest>, JsonRejection>,
) -> AppResult<Json<TokenResponse>> {
    let Json(request) = payload.map_err(|e| AppError::BadRequest(e.body_text()))?;

    if request.app_key.is_empty() || request.app_secret.is_empty() {
        return Err(AppError::BadRequest(
            "app_key and app_secret are required".to_string(),
        ));
    }

    if !state
        .credentials
        .verify(&request.app_key, &request.app_secret)
    {
        warn!(app_key = %request.app_key, "Token requested with unknown credentials");
        return Err(AppError::AuthNotExist);
    }

    let issued = state.codec.issue(&request.app_key, &request.app_secret)?;
    metrics::record_token_issued();
    info!(
        app_key = %request.app_key,
        token_id = %issued.claims.jti,
        expires_at = issued.claims.expires_at,
        "Token issued"
    );

    Ok(Json(TokenResponse::from_issued(issued)))
}

/// Return the identity carried by the caller's token.
///
/// Mounted behind the bearer auth layer, which inserts the claims.
#[instrument(skip(claims))]
pub async fn whoami(Extension(claims): Extension<AuthClaims>) -> Json<WhoAmIResponse> {
    Json(WhoAmIResponse::from(claims))
}
