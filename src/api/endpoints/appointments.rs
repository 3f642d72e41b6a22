//! Appointment endpoints.
//!
//! - `POST /appointments/create`: patient books a visit
//! - `GET /appointments/:id`: detail for either party
//! - `POST /appointments/:id/resolve`: doctor confirms with the patient's code
//! - `PATCH /appointments/:id/cancel`: either party cancels with a reason
//! - `POST /appointments/:id/resend-otp`: fresh code to the patient
//! - `GET /appointments/{user|doctor}/{upcoming|history}`: paged projections

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Deserialize;
use uuid::Uuid;

use crate::api::endpoints::{json_body, path_param, query_params};
use crate::api::error::ApiError;
use crate::api::types::{done, success, ApiContext, Envelope};
use crate::appointment::{self, AppointmentPage, AppointmentView, BookingRequest};
use crate::models::{PageRequest, Role};
use crate::session::Caller;

#[derive(Deserialize)]
pub struct ResolveRequest {
    pub otp: String,
}

#[derive(Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: String,
}

/// `POST /appointments/create`
pub async fn create(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<Caller>,
    body: Result<Json<BookingRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Envelope<AppointmentView>>), ApiError> {
    let request = json_body(body)?;
    let view = ctx
        .blocking(move |core| appointment::create(core, &caller, request).map_err(ApiError::from))
        .await?;
    Ok((
        StatusCode::CREATED,
        success("Appointment booked. A confirmation code was sent to your email", view),
    ))
}

/// `GET /appointments/:id`
pub async fn detail(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<Caller>,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<Envelope<AppointmentView>>, ApiError> {
    let id = path_param(path)?;
    let view = ctx
        .blocking(move |core| appointment::get(core, &caller, &id).map_err(ApiError::from))
        .await?;
    Ok(success("Appointment", view))
}

/// `POST /appointments/:id/resolve`
pub async fn resolve(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<Caller>,
    path: Result<Path<Uuid>, PathRejection>,
    body: Result<Json<ResolveRequest>, JsonRejection>,
) -> Result<Json<Envelope<AppointmentView>>, ApiError> {
    let id = path_param(path)?;
    let ResolveRequest { otp } = json_body(body)?;
    let view = ctx
        .blocking(move |core| appointment::resolve(core, &caller, &id, &otp).map_err(ApiError::from))
        .await?;
    Ok(success("Appointment resolved", view))
}

/// `PATCH /appointments/:id/cancel`
pub async fn cancel(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<Caller>,
    path: Result<Path<Uuid>, PathRejection>,
    body: Result<Json<CancelRequest>, JsonRejection>,
) -> Result<Json<Envelope<AppointmentView>>, ApiError> {
    let id = path_param(path)?;
    let CancelRequest { reason } = json_body(body)?;
    let view = ctx
        .blocking(move |core| appointment::cancel(core, &caller, &id, &reason).map_err(ApiError::from))
        .await?;
    Ok(success("Appointment cancelled", view))
}

/// `POST /appointments/:id/resend-otp`
pub async fn resend_otp(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<Caller>,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<Envelope<()>>, ApiError> {
    let id = path_param(path)?;
    ctx.blocking(move |core| appointment::resend_otp(core, &caller, &id).map_err(ApiError::from))
        .await?;
    Ok(done("A new code was sent to the patient"))
}

#[derive(Clone, Copy)]
enum Listing {
    Upcoming,
    History,
}

async fn listing(
    ctx: ApiContext,
    caller: Caller,
    audience: Role,
    kind: Listing,
    page: PageRequest,
) -> Result<Json<Envelope<AppointmentPage>>, ApiError> {
    if caller.role != audience {
        return Err(ApiError::forbidden(format!(
            "This listing is for {} accounts",
            audience.as_str()
        )));
    }
    let result = ctx
        .blocking(move |core| {
            match kind {
                Listing::Upcoming => appointment::list_upcoming(core, &caller, page),
                Listing::History => appointment::list_history(core, &caller, page),
            }
            .map_err(ApiError::from)
        })
        .await?;
    Ok(success("Appointments", result))
}

/// `GET /appointments/user/upcoming`
pub async fn patient_upcoming(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<Caller>,
    query: Result<Query<PageRequest>, QueryRejection>,
) -> Result<Json<Envelope<AppointmentPage>>, ApiError> {
    let page = query_params(query)?;
    listing(ctx, caller, Role::Patient, Listing::Upcoming, page).await
}

/// `GET /appointments/user/history`
pub async fn patient_history(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<Caller>,
    query: Result<Query<PageRequest>, QueryRejection>,
) -> Result<Json<Envelope<AppointmentPage>>, ApiError> {
    let page = query_params(query)?;
    listing(ctx, caller, Role::Patient, Listing::History, page).await
}

/// `GET /appointments/doctor/upcoming`
pub async fn doctor_upcoming(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<Caller>,
    query: Result<Query<PageRequest>, QueryRejection>,
) -> Result<Json<Envelope<AppointmentPage>>, ApiError> {
    let page = query_params(query)?;
    listing(ctx, caller, Role::Doctor, Listing::Upcoming, page).await
}

/// `GET /appointments/doctor/history`
pub async fn doctor_history(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<Caller>,
    query: Result<Query<PageRequest>, QueryRejection>,
) -> Result<Json<Envelope<AppointmentPage>>, ApiError> {
    let page = query_params(query)?;
    listing(ctx, caller, Role::Doctor, Listing::History, page).await
}
