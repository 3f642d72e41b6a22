//! Audit logging middleware.
//!
//! Records every authenticated request with account id, role, method,
//! path, and response status. Runs innermost (after auth has injected
//! the `Caller`).

use axum::extract::OriginalUri;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;

use crate::api::types::ApiContext;
use crate::models::AuditEntry;
use crate::session::Caller;

pub async fn log_access(
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let method = req.method().to_string();
    // Nested routers strip their prefix from `req.uri()`.
    let path = req
        .extensions()
        .get::<OriginalUri>()
        .map(|OriginalUri(uri)| uri.path().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let ctx = req.extensions().get::<ApiContext>().cloned();
    let caller = req.extensions().get::<Caller>().copied();

    let response = next.run(req).await;

    if let Some(ctx) = ctx {
        let status = response.status().as_u16();
        let action = format!("{method} {path}");
        tracing::info!(
            account_id = ?caller.map(|c| c.account_id),
            action = %action,
            status,
            "API access"
        );
        let entry = AuditEntry {
            timestamp: ctx.core.now(),
            account_id: caller.map(|c| c.account_id.to_string()),
            role: caller.map(|c| c.role),
            action,
            outcome: status.to_string(),
        };
        // A full buffer flushes to SQLite; keep that off the async worker.
        let _ = tokio::task::spawn_blocking(move || ctx.core.log_access(entry)).await;
    }

    response
}
