//! API error types with structured JSON responses.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::appointment::AppointmentError;
use crate::core_state::CoreError;
use crate::directory::DirectoryError;
use crate::identity::IdentityError;
use crate::otp::OtpError;
use crate::scheduling::ClosedDateError;

/// `{"status":"error","error":{"code":...,"message":...}}`
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub status: &'static str,
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
}

/// API-level errors with HTTP status mapping.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Authentication required")]
    Unauthorized,
    #[error("Invalid email or password")]
    InvalidCredentials,
    #[error("Rate limit exceeded")]
    RateLimited { retry_after: u64 },
    #[error("{message}")]
    Forbidden { code: &'static str, message: String },
    #[error("{message}")]
    NotFound { code: &'static str, message: String },
    #[error("{message}")]
    Conflict { code: &'static str, message: String },
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Incorrect code")]
    OtpMismatch { attempts_remaining: u32 },
    #[error("Code has expired")]
    OtpExpired,
    #[error("Too many incorrect attempts")]
    OtpAttemptsExhausted,
    #[error("Code has already been used")]
    OtpAlreadyConsumed,
    #[error("No active code")]
    OtpNotFound,
    #[error("Code resent too soon")]
    TooSoon { retry_after: u64 },
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn forbidden(message: impl Into<String>) -> Self {
        ApiError::Forbidden {
            code: "FORBIDDEN",
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError::NotFound {
            code: "NOT_FOUND",
            message: message.into(),
        }
    }

    fn retry_after(&self) -> Option<u64> {
        match self {
            ApiError::RateLimited { retry_after } | ApiError::TooSoon { retry_after } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "AUTH_REQUIRED",
                "Authentication required".to_string(),
            ),
            ApiError::InvalidCredentials => (
                StatusCode::UNAUTHORIZED,
                "INVALID_CREDENTIALS",
                "Invalid email or password".to_string(),
            ),
            ApiError::RateLimited { retry_after } => (
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
                format!("Rate limit exceeded. Retry after {retry_after}s"),
            ),
            ApiError::Forbidden { code, message } => (StatusCode::FORBIDDEN, *code, message.clone()),
            ApiError::NotFound { code, message } => (StatusCode::NOT_FOUND, *code, message.clone()),
            ApiError::Conflict { code, message } => (StatusCode::CONFLICT, *code, message.clone()),
            ApiError::BadRequest(detail) => (StatusCode::BAD_REQUEST, "VALIDATION", detail.clone()),
            ApiError::OtpMismatch { attempts_remaining } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "OTP_MISMATCH",
                format!("Incorrect code. {attempts_remaining} attempts remaining"),
            ),
            ApiError::OtpExpired => (
                StatusCode::GONE,
                "OTP_EXPIRED",
                "Code has expired. Request a new one".to_string(),
            ),
            ApiError::OtpAttemptsExhausted => (
                StatusCode::LOCKED,
                "OTP_ATTEMPTS_EXHAUSTED",
                "Too many incorrect attempts. Request a new code".to_string(),
            ),
            ApiError::OtpAlreadyConsumed => (
                StatusCode::CONFLICT,
                "OTP_ALREADY_CONSUMED",
                "Code has already been used".to_string(),
            ),
            ApiError::OtpNotFound => (
                StatusCode::NOT_FOUND,
                "OTP_NOT_FOUND",
                "No active code. Request a new one".to_string(),
            ),
            ApiError::TooSoon { retry_after } => (
                StatusCode::TOO_MANY_REQUESTS,
                "TOO_SOON",
                format!("A code was sent recently. Retry after {retry_after}s"),
            ),
            ApiError::Internal(detail) => {
                tracing::error!(detail, "API internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = ErrorBody {
            status: "error",
            error: ErrorDetail { code, message },
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(retry_after) = self.retry_after() {
            if let Ok(val) = HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert("Retry-After", val);
            }
        }
        response
    }
}

impl From<OtpError> for ApiError {
    fn from(err: OtpError) -> Self {
        match err {
            OtpError::NotFound => ApiError::OtpNotFound,
            OtpError::Expired => ApiError::OtpExpired,
            OtpError::AttemptsExhausted => ApiError::OtpAttemptsExhausted,
            OtpError::Mismatch { attempts_remaining } => ApiError::OtpMismatch { attempts_remaining },
            OtpError::AlreadyConsumed => ApiError::OtpAlreadyConsumed,
            OtpError::TooSoon { retry_after_secs } => ApiError::TooSoon {
                retry_after: retry_after_secs,
            },
            OtpError::Database(e) => ApiError::Internal(e.to_string()),
            OtpError::Crypto(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<crate::db::DatabaseError> for ApiError {
    fn from(err: crate::db::DatabaseError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<IdentityError> for ApiError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::Validation(msg) => ApiError::BadRequest(msg),
            e @ IdentityError::EmailTaken => ApiError::Conflict {
                code: "EMAIL_TAKEN",
                message: e.to_string(),
            },
            e @ IdentityError::UsernameTaken => ApiError::Conflict {
                code: "USERNAME_TAKEN",
                message: e.to_string(),
            },
            e @ IdentityError::AlreadyActive => ApiError::Conflict {
                code: "ALREADY_ACTIVE",
                message: e.to_string(),
            },
            e @ IdentityError::AccountNotFound => ApiError::NotFound {
                code: "ACCOUNT_NOT_FOUND",
                message: e.to_string(),
            },
            IdentityError::InvalidCredentials => ApiError::InvalidCredentials,
            e @ IdentityError::NotVerified => ApiError::Forbidden {
                code: "ACCOUNT_NOT_VERIFIED",
                message: e.to_string(),
            },
            e @ IdentityError::Deactivated => ApiError::Forbidden {
                code: "ACCOUNT_DEACTIVATED",
                message: e.to_string(),
            },
            IdentityError::Unauthenticated | IdentityError::Session(_) => ApiError::Unauthorized,
            IdentityError::Otp(e) => e.into(),
            IdentityError::Notify(e) => ApiError::Internal(e.to_string()),
            IdentityError::Core(e) => e.into(),
            IdentityError::Crypto(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<AppointmentError> for ApiError {
    fn from(err: AppointmentError) -> Self {
        match err {
            AppointmentError::Validation(msg) => ApiError::BadRequest(msg),
            e @ AppointmentError::NotFound => ApiError::not_found(e.to_string()),
            e @ AppointmentError::DoctorNotFound => ApiError::NotFound {
                code: "DOCTOR_NOT_FOUND",
                message: e.to_string(),
            },
            e @ AppointmentError::Forbidden => ApiError::forbidden(e.to_string()),
            e @ AppointmentError::InvalidTransition(_) => ApiError::Conflict {
                code: "INVALID_TRANSITION",
                message: e.to_string(),
            },
            AppointmentError::SlotUnavailable(reason) => ApiError::Conflict {
                code: "SLOT_UNAVAILABLE",
                message: reason.to_string(),
            },
            AppointmentError::Otp(e) => e.into(),
            AppointmentError::Notify(e) => ApiError::Internal(e.to_string()),
            AppointmentError::Core(e) => e.into(),
        }
    }
}

impl From<ClosedDateError> for ApiError {
    fn from(err: ClosedDateError) -> Self {
        match err {
            e @ ClosedDateError::Forbidden => ApiError::forbidden(e.to_string()),
            ClosedDateError::Validation(msg) => ApiError::BadRequest(msg),
            e @ ClosedDateError::AlreadyClosed(_) => ApiError::Conflict {
                code: "ALREADY_CLOSED",
                message: e.to_string(),
            },
            e @ ClosedDateError::NotClosed(_) => ApiError::not_found(e.to_string()),
            ClosedDateError::Core(e) => e.into(),
        }
    }
}

impl From<DirectoryError> for ApiError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::Validation(msg) => ApiError::BadRequest(msg),
            e @ DirectoryError::NotFound => ApiError::NotFound {
                code: "DOCTOR_NOT_FOUND",
                message: e.to_string(),
            },
            DirectoryError::Core(e) => e.into(),
        }
    }
}
