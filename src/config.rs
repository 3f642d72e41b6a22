use std::net::SocketAddr;
use std::path::PathBuf;

use chrono::{Duration, FixedOffset};
use thiserror::Error;

/// Application-level constants
pub const APP_NAME: &str = "HealthSync";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEFAULT_BIND: &str = "127.0.0.1:8080";
pub const DEFAULT_LOG_FILTER: &str = "healthsync=info,healthsync_lib=info,tower_http=info";

/// Get the application data directory
/// ~/HealthSync/ on all platforms
pub fn app_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Default location of the SQLite store.
pub fn default_db_path() -> PathBuf {
    app_data_dir().join("healthsync.db")
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Runtime settings. Every field can be overridden with a `HEALTHSYNC_*`
/// environment variable; unset variables keep the defaults below.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind: SocketAddr,
    pub db_path: PathBuf,
    /// Base64 master secret. `None` means an ephemeral secret per process.
    pub secret: Option<String>,
    pub mail_relay_url: Option<String>,
    pub otp_ttl: Duration,
    pub otp_max_attempts: u32,
    pub otp_resend_cooldown: Duration,
    pub otp_retention: Duration,
    /// Minimum distance between two live bookings of the same doctor.
    pub visit_separation: Duration,
    pub booking_horizon_days: u32,
    pub clinic_utc_offset_minutes: i32,
    pub token_ttl: Duration,
    pub password_iterations: u32,
    pub sweep_interval: std::time::Duration,
    pub delivery_poll_interval: std::time::Duration,
    pub delivery_max_attempts: u32,
    pub outbox_retention: Duration,
    pub audit_retention: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            db_path: default_db_path(),
            secret: None,
            mail_relay_url: None,
            otp_ttl: Duration::minutes(10),
            otp_max_attempts: 5,
            otp_resend_cooldown: Duration::seconds(30),
            otp_retention: Duration::hours(24),
            visit_separation: Duration::minutes(30),
            booking_horizon_days: 30,
            clinic_utc_offset_minutes: 0,
            token_ttl: Duration::hours(24),
            password_iterations: crate::crypto::DEFAULT_ITERATIONS,
            sweep_interval: std::time::Duration::from_secs(300),
            delivery_poll_interval: std::time::Duration::from_secs(5),
            delivery_max_attempts: 8,
            outbox_retention: Duration::days(7),
            audit_retention: Duration::days(90),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment in production).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("HEALTHSYNC_BIND") {
            config.bind = parse("HEALTHSYNC_BIND", &v)?;
        }
        if let Some(v) = get("HEALTHSYNC_DB_PATH") {
            config.db_path = PathBuf::from(v);
        }
        config.secret = get("HEALTHSYNC_SECRET");
        config.mail_relay_url = get("HEALTHSYNC_MAIL_RELAY_URL");
        if let Some(v) = get("HEALTHSYNC_OTP_TTL_SECS") {
            config.otp_ttl = Duration::seconds(positive("HEALTHSYNC_OTP_TTL_SECS", &v)?);
        }
        if let Some(v) = get("HEALTHSYNC_OTP_MAX_ATTEMPTS") {
            config.otp_max_attempts = parse::<u32>("HEALTHSYNC_OTP_MAX_ATTEMPTS", &v)?;
            if config.otp_max_attempts == 0 {
                return Err(invalid("HEALTHSYNC_OTP_MAX_ATTEMPTS", &v));
            }
        }
        if let Some(v) = get("HEALTHSYNC_OTP_RESEND_COOLDOWN_SECS") {
            let secs = parse::<i64>("HEALTHSYNC_OTP_RESEND_COOLDOWN_SECS", &v)?;
            if secs < 0 {
                return Err(invalid("HEALTHSYNC_OTP_RESEND_COOLDOWN_SECS", &v));
            }
            config.otp_resend_cooldown = Duration::seconds(secs);
        }
        if let Some(v) = get("HEALTHSYNC_VISIT_MINUTES") {
            config.visit_separation = Duration::minutes(positive("HEALTHSYNC_VISIT_MINUTES", &v)?);
        }
        if let Some(v) = get("HEALTHSYNC_TOKEN_TTL_SECS") {
            config.token_ttl = Duration::seconds(positive("HEALTHSYNC_TOKEN_TTL_SECS", &v)?);
        }
        if let Some(v) = get("HEALTHSYNC_PASSWORD_ITERATIONS") {
            config.password_iterations = parse("HEALTHSYNC_PASSWORD_ITERATIONS", &v)?;
            if config.password_iterations == 0 {
                return Err(invalid("HEALTHSYNC_PASSWORD_ITERATIONS", &v));
            }
        }
        if let Some(v) = get("HEALTHSYNC_CLINIC_UTC_OFFSET_MINUTES") {
            let minutes = parse::<i32>("HEALTHSYNC_CLINIC_UTC_OFFSET_MINUTES", &v)?;
            if FixedOffset::east_opt(minutes.saturating_mul(60)).is_none() {
                return Err(invalid("HEALTHSYNC_CLINIC_UTC_OFFSET_MINUTES", &v));
            }
            config.clinic_utc_offset_minutes = minutes;
        }
        Ok(config)
    }

    /// Offset used to turn instants into clinic wall-clock time.
    pub fn clinic_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.clinic_utc_offset_minutes.saturating_mul(60))
            .unwrap_or_else(|| chrono::Offset::fix(&chrono::Utc))
    }
}

fn invalid(key: &'static str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| invalid(key, value))
}

fn positive(key: &'static str, value: &str) -> Result<i64, ConfigError> {
    match parse::<i64>(key, value)? {
        n if n > 0 => Ok(n),
        _ => Err(invalid(key, value)),
    }
}
