//! HTTP middleware stack.
//!
//! Execution order (outermost → innermost):
//! 1. Rate limiter, reject early
//! 2. Auth validator, bearer token to `Caller`
//! 3. Audit logger, runs after auth so it has the account id

pub mod audit;
pub mod auth;
pub mod rate;
