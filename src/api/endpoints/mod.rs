//! API endpoint handlers.
//!
//! Handlers decode the request, run the domain operation on the
//! blocking pool, and wrap the result in the success envelope.

pub mod accounts;
pub mod appointments;
pub mod doctors;
pub mod health;

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query};
use axum::Json;

use crate::api::error::ApiError;

/// Body extraction errors become `VALIDATION` envelopes, not plain text.
pub(crate) fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(value)| value)
        .map_err(|e| ApiError::BadRequest(e.body_text()))
}

pub(crate) fn query_params<T>(query: Result<Query<T>, QueryRejection>) -> Result<T, ApiError> {
    query
        .map(|Query(value)| value)
        .map_err(|e| ApiError::BadRequest(e.body_text()))
}

pub(crate) fn path_param<T>(path: Result<Path<T>, PathRejection>) -> Result<T, ApiError> {
    path.map(|Path(value)| value)
        .map_err(|e| ApiError::BadRequest(e.body_text()))
}
