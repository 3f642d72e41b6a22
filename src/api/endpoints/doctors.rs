//! Doctor endpoints.
//!
//! Public directory:
//! - `GET /doctors?city=&state=&specialization=&page=&size=`
//! - `GET /doctors/:id`
//!
//! The calling doctor's closed dates:
//! - `GET` and `POST /doctors/me/closed-dates`
//! - `DELETE /doctors/me/closed-dates/:date`

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::NaiveDate;
use uuid::Uuid;

use crate::api::endpoints::{json_body, path_param, query_params};
use crate::api::error::ApiError;
use crate::api::types::{done, success, ApiContext, Envelope};
use crate::directory::{self, DirectoryQuery, DoctorCard, DoctorPage};
use crate::db::ClosedDate;
use crate::scheduling::{self, ClosedDateRequest};
use crate::session::Caller;

/// `GET /doctors`
pub async fn search(
    State(ctx): State<ApiContext>,
    query: Result<Query<DirectoryQuery>, QueryRejection>,
) -> Result<Json<Envelope<DoctorPage>>, ApiError> {
    let query = query_params(query)?;
    let page = ctx
        .blocking(move |core| directory::search(core, &query).map_err(ApiError::from))
        .await?;
    Ok(success("Doctors", page))
}

/// `GET /doctors/:id`
pub async fn detail(
    State(ctx): State<ApiContext>,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<Envelope<DoctorCard>>, ApiError> {
    let id = path_param(path)?;
    let card = ctx
        .blocking(move |core| directory::get_doctor(core, &id).map_err(ApiError::from))
        .await?;
    Ok(success("Doctor", card))
}

/// `GET /doctors/me/closed-dates`
pub async fn closed_dates(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<Envelope<Vec<ClosedDate>>>, ApiError> {
    let dates = ctx
        .blocking(move |core| scheduling::list_closed_dates(core, &caller).map_err(ApiError::from))
        .await?;
    Ok(success("Closed dates", dates))
}

/// `POST /doctors/me/closed-dates`
pub async fn close_date(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<Caller>,
    body: Result<Json<ClosedDateRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Envelope<ClosedDate>>), ApiError> {
    let request = json_body(body)?;
    let closed = ctx
        .blocking(move |core| scheduling::add_closed_date(core, &caller, request).map_err(ApiError::from))
        .await?;
    Ok((StatusCode::CREATED, success("Date closed", closed)))
}

/// `DELETE /doctors/me/closed-dates/:date`
pub async fn reopen_date(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<Caller>,
    path: Result<Path<NaiveDate>, PathRejection>,
) -> Result<Json<Envelope<()>>, ApiError> {
    let date = path_param(path)?;
    ctx.blocking(move |core| scheduling::remove_closed_date(core, &caller, date).map_err(ApiError::from))
        .await?;
    Ok(done("Date reopened"))
}
