//! Bearer token authentication middleware.
//!
//! Extracts `Authorization: Bearer <token>`, verifies the session
//! signature and that the account is still active, and injects the
//! `Caller` into request extensions for downstream handlers.

use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::api::error::ApiError;
use crate::api::types::ApiContext;
use crate::identity::{self, IdentityError};

/// Require a valid session token.
///
/// Accesses `ApiContext` from request extensions (injected by Extension layer).
pub async fn require_auth(
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    match require_auth_inner(req, next).await {
        Ok(resp) => resp,
        Err(err) => err.into_response(),
    }
}

async fn require_auth_inner(
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let ctx: ApiContext = req
        .extensions()
        .get::<ApiContext>()
        .cloned()
        .ok_or(ApiError::Internal("missing API context".into()))?;

    let token = req
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?
        .to_string();

    let caller = ctx
        .blocking(move |core| {
            identity::authenticate(core, &token).map_err(|e| match e {
                // A deactivated or unverified account's token is simply no
                // longer a credential.
                IdentityError::Unauthenticated
                | IdentityError::Deactivated
                | IdentityError::NotVerified
                | IdentityError::Session(_) => ApiError::Unauthorized,
                other => ApiError::from(other),
            })
        })
        .await?;

    req.extensions_mut().insert(caller);
    Ok(next.run(req).await)
}
