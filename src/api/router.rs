//! HTTP router.
//!
//! Returns a composable `Router`. Versioned routes live under `/api/v1`;
//! `/health` sits at the root for load balancers.
//!
//! Middleware stack (outermost → innermost):
//! 1. Trace, CORS, `Cache-Control: no-store` (whole app)
//! 2. Auth validator → 3. Rate limiter keyed by account → 4. Audit logger (protected routes)
//!
//! Public routes are rate-limited by peer address.

use std::sync::Arc;

use axum::http::header::{AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderValue, Method};
use axum::routing::{delete, get, patch, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::api::endpoints;
use crate::api::error::ApiError;
use crate::api::middleware;
use crate::api::types::ApiContext;
use crate::core_state::CoreState;

pub const API_PREFIX: &str = "/api/v1";

/// Build the service router.
///
/// Middleware uses `Extension<ApiContext>` (injected as the outermost layer).
/// Endpoint handlers use `State<ApiContext>` (provided via `with_state`).
pub fn api_router(core: Arc<CoreState>) -> Router {
    build_router(ApiContext::new(core))
}

/// Build router from a pre-constructed `ApiContext`.
pub(crate) fn build_router(ctx: ApiContext) -> Router {
    // Layers are applied from bottom (innermost) to top (outermost):
    //   Extension (outermost) → Auth → Rate limit (per account) → Audit (innermost) → Handler
    //
    // Path params use `:param` syntax (matchit 0.7 / axum 0.7).
    let protected = Router::new()
        .route(
            "/accounts/me",
            get(endpoints::accounts::me).patch(endpoints::accounts::update_me),
        )
        .route(
            "/accounts/me/deactivate",
            post(endpoints::accounts::deactivate_me),
        )
        .route("/appointments/create", post(endpoints::appointments::create))
        .route(
            "/appointments/user/upcoming",
            get(endpoints::appointments::patient_upcoming),
        )
        .route(
            "/appointments/user/history",
            get(endpoints::appointments::patient_history),
        )
        .route(
            "/appointments/doctor/upcoming",
            get(endpoints::appointments::doctor_upcoming),
        )
        .route(
            "/appointments/doctor/history",
            get(endpoints::appointments::doctor_history),
        )
        .route("/appointments/:id", get(endpoints::appointments::detail))
        .route(
            "/appointments/:id/resolve",
            post(endpoints::appointments::resolve),
        )
        .route(
            "/appointments/:id/cancel",
            patch(endpoints::appointments::cancel),
        )
        .route(
            "/appointments/:id/resend-otp",
            post(endpoints::appointments::resend_otp),
        )
        .route(
            "/doctors/me/closed-dates",
            get(endpoints::doctors::closed_dates).post(endpoints::doctors::close_date),
        )
        .route(
            "/doctors/me/closed-dates/:date",
            delete(endpoints::doctors::reopen_date),
        )
        .with_state(ctx.clone())
        .layer(axum::middleware::from_fn(middleware::audit::log_access))
        .layer(axum::middleware::from_fn(middleware::rate::limit))
        .layer(axum::middleware::from_fn(middleware::auth::require_auth))
        // Extension must be outermost so middleware can extract ApiContext
        .layer(axum::Extension(ctx.clone()));

    // Unprotected routes (rate-limited only)
    let unprotected = Router::new()
        .route("/accounts/register", post(endpoints::accounts::register))
        .route("/accounts/verify-otp", post(endpoints::accounts::verify_otp))
        .route("/accounts/resend-otp", post(endpoints::accounts::resend_otp))
        .route("/accounts/login", post(endpoints::accounts::login))
        .route("/doctors", get(endpoints::doctors::search))
        .route("/doctors/:id", get(endpoints::doctors::detail))
        .with_state(ctx.clone())
        .layer(axum::middleware::from_fn(middleware::rate::limit))
        .layer(axum::Extension(ctx.clone()));

    let health = Router::new()
        .route("/health", get(endpoints::health::check))
        .with_state(ctx.clone())
        .layer(axum::middleware::from_fn(middleware::rate::limit))
        .layer(axum::Extension(ctx));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE]);

    Router::new()
        .nest(API_PREFIX, protected)
        .nest(API_PREFIX, unprotected)
        .merge(health)
        .fallback(|| async { ApiError::not_found("No such route") })
        .layer(SetResponseHeaderLayer::overriding(
            CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
