//! Shared types for the HTTP layer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::Json;
use serde::Serialize;

use crate::api::error::ApiError;
use crate::core_state::CoreState;

// ═══════════════════════════════════════════════════════════
// API context: shared state for the router
// ═══════════════════════════════════════════════════════════

/// Shared context for all API routes and middleware.
/// Wraps `CoreState` plus API-specific caches.
#[derive(Clone)]
pub struct ApiContext {
    pub core: Arc<CoreState>,
    pub rate_limiter: Arc<Mutex<RateLimiter>>,
}

impl ApiContext {
    pub fn new(core: Arc<CoreState>) -> Self {
        Self {
            core,
            rate_limiter: Arc::new(Mutex::new(RateLimiter::new())),
        }
    }

    /// Run a store operation on the blocking pool.
    ///
    /// Every domain call takes the connection mutex and some hash a
    /// password, so none of them run on the async workers.
    pub async fn blocking<T, F>(&self, f: F) -> Result<T, ApiError>
    where
        F: FnOnce(&CoreState) -> Result<T, ApiError> + Send + 'static,
        T: Send + 'static,
    {
        let core = self.core.clone();
        tokio::task::spawn_blocking(move || f(core.as_ref()))
            .await
            .map_err(|e| ApiError::Internal(format!("blocking task failed: {e}")))?
    }
}

// ═══════════════════════════════════════════════════════════
// Success envelope
// ═══════════════════════════════════════════════════════════

/// `{"status":"success","message":...,"data":...}`
#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub status: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

pub fn success<T: Serialize>(message: impl Into<String>, data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        status: "success",
        message: message.into(),
        data: Some(data),
    })
}

/// An envelope with no `data` member.
pub fn done(message: impl Into<String>) -> Json<Envelope<()>> {
    Json(Envelope {
        status: "success",
        message: message.into(),
        data: None,
    })
}

// ═══════════════════════════════════════════════════════════
// Rate limiter: sliding window per caller
// ═══════════════════════════════════════════════════════════

/// Sliding-window rate limiter keyed by caller.
pub struct RateLimiter {
    windows: HashMap<String, Vec<Instant>>,
    per_minute: u32,
    per_hour: u32,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_limits(100, 1000)
    }

    pub fn with_limits(per_minute: u32, per_hour: u32) -> Self {
        Self {
            windows: HashMap::new(),
            per_minute,
            per_hour,
        }
    }

    /// Check if a caller is within rate limits. Returns `Ok(())` or
    /// `Err(retry_after_secs)` if exceeded.
    pub fn check(&mut self, key: &str) -> Result<(), u64> {
        self.check_at(key, Instant::now())
    }

    fn check_at(&mut self, key: &str, now: Instant) -> Result<(), u64> {
        let entries = self.windows.entry(key.to_string()).or_default();

        entries.retain(|ts| now.duration_since(*ts) < Duration::from_secs(3600));

        let last_minute = entries
            .iter()
            .filter(|ts| now.duration_since(**ts) < Duration::from_secs(60))
            .count() as u32;
        if last_minute >= self.per_minute {
            return Err(60);
        }

        if entries.len() as u32 >= self.per_hour {
            return Err(3600);
        }

        entries.push(now);
        Ok(())
    }

    /// Drop callers with no requests in the last hour.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.windows.retain(|_, entries| {
            entries.retain(|ts| now.duration_since(*ts) < Duration::from_secs(3600));
            !entries.is_empty()
        });
    }

    pub fn tracked_callers(&self) -> usize {
        self.windows.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_allows_within_limit() {
        let mut limiter = RateLimiter::new();
        for _ in 0..100 {
            assert!(limiter.check("token:abc").is_ok());
        }
    }

    #[test]
    fn rate_limiter_blocks_over_minute_limit() {
        let mut limiter = RateLimiter::new();
        for _ in 0..100 {
            limiter.check("token:abc").unwrap();
        }
        assert_eq!(limiter.check("token:abc"), Err(60));
    }

    #[test]
    fn rate_limiter_keys_are_independent() {
        let mut limiter = RateLimiter::with_limits(2, 10);
        limiter.check("a").unwrap();
        limiter.check("a").unwrap();
        assert!(limiter.check("a").is_err());
        assert!(limiter.check("b").is_ok());
    }

    #[test]
    fn rate_limiter_hour_window() {
        let mut limiter = RateLimiter::with_limits(100, 3);
        let start = Instant::now();
        for i in 0..3 {
            limiter.check_at("a", start + Duration::from_secs(61 * i)).unwrap();
        }
        assert_eq!(limiter.check_at("a", start + Duration::from_secs(200)), Err(3600));
        // The first request falls out of the hour window.
        assert!(limiter.check_at("a", start + Duration::from_secs(3601)).is_ok());
    }

    #[test]
    fn prune_keeps_recent_callers() {
        let mut limiter = RateLimiter::new();
        limiter.check("a").unwrap();
        limiter.prune();
        assert_eq!(limiter.tracked_callers(), 1);
    }

    #[test]
    fn envelope_shape() {
        let Json(body) = success("Booked", serde_json::json!({"id": 1}));
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["message"], "Booked");
        assert_eq!(json["data"]["id"], 1);

        let Json(body) = done("Cancelled");
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("data").is_none());
    }
}
