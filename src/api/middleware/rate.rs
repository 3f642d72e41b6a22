//! Per-caller rate limiting middleware.
//!
//! Applies sliding-window rate limits per caller:
//! - 100 requests per minute
//! - 1000 requests per hour

use std::net::SocketAddr;

use axum::extract::ConnectInfo;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::api::error::ApiError;
use crate::api::types::ApiContext;
use crate::session::Caller;

/// Windows kept before idle callers are swept out.
const PRUNE_THRESHOLD: usize = 10_000;

/// Authenticated account when auth has run, else the peer address.
///
/// The `Authorization` header itself is never trusted here: unverified
/// bearer values would let a client mint a fresh bucket per request.
fn rate_key(req: &Request<axum::body::Body>) -> String {
    if let Some(caller) = req.extensions().get::<Caller>() {
        return format!("account:{}", caller.account_id);
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| format!("addr:{}", addr.ip()))
        .unwrap_or_else(|| "anonymous".to_string())
}

/// Per-caller rate limiting. Returns 429 if exceeded.
/// Accesses `ApiContext` from request extensions.
pub async fn limit(
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    match limit_inner(req, next).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn limit_inner(
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let ctx: ApiContext = req
        .extensions()
        .get::<ApiContext>()
        .cloned()
        .ok_or(ApiError::Internal("missing API context".into()))?;

    let key = rate_key(&req);

    // MutexGuard is !Send, must drop before .await via block scope
    {
        let mut limiter = ctx
            .rate_limiter
            .lock()
            .map_err(|_| ApiError::Internal("rate limiter lock".into()))?;

        if limiter.tracked_callers() > PRUNE_THRESHOLD {
            limiter.prune();
        }
        if let Err(retry_after) = limiter.check(&key) {
            tracing::warn!(key = %key, retry_after, "Rate limit exceeded");
            return Err(ApiError::RateLimited { retry_after });
        }
    }

    Ok(next.run(req).await)
}
