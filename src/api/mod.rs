//! HTTP API.
//!
//! Routes are nested under `/api/v1/` and protected by a middleware
//! stack: Rate Limit → Auth → Audit → Handler. Handlers are thin: they
//! decode the request and call into the domain modules.

pub mod endpoints;
pub mod error;
pub mod middleware;
pub mod router;
pub mod server;
pub mod types;

pub use error::ApiError;
pub use router::api_router;
pub use server::{start, ApiServer, ServerError};
pub use types::ApiContext;
