//! Account endpoints.
//!
//! - `POST /accounts/register`, `/verify-otp`, `/resend-otp`, `/login`
//! - `GET` and `PATCH /accounts/me`, `POST /accounts/me/deactivate`

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Deserialize;

use crate::api::endpoints::json_body;
use crate::api::error::ApiError;
use crate::api::types::{done, success, ApiContext, Envelope};
use crate::identity::{self, ProfileUpdate, Registered, Registration, SessionGrant};
use crate::models::Account;
use crate::session::Caller;

#[derive(Deserialize)]
pub struct VerifyRequest {
    pub email: String,
    pub otp: String,
}

#[derive(Deserialize)]
pub struct EmailRequest {
    pub email: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// `POST /accounts/register`: create a pending account and mail its code.
pub async fn register(
    State(ctx): State<ApiContext>,
    body: Result<Json<Registration>, JsonRejection>,
) -> Result<(StatusCode, Json<Envelope<Registered>>), ApiError> {
    let registration = json_body(body)?;
    let registered = ctx
        .blocking(move |core| identity::register(core, registration).map_err(ApiError::from))
        .await?;
    Ok((
        StatusCode::CREATED,
        success(
            "Registration received. Check your email for the verification code",
            registered,
        ),
    ))
}

/// `POST /accounts/verify-otp`: activate and sign in.
pub async fn verify_otp(
    State(ctx): State<ApiContext>,
    body: Result<Json<VerifyRequest>, JsonRejection>,
) -> Result<Json<Envelope<SessionGrant>>, ApiError> {
    let VerifyRequest { email, otp } = json_body(body)?;
    let grant = ctx
        .blocking(move |core| identity::verify(core, &email, &otp).map_err(ApiError::from))
        .await?;
    Ok(success("Account verified", grant))
}

/// `POST /accounts/resend-otp`: new activation code for a pending account.
pub async fn resend_otp(
    State(ctx): State<ApiContext>,
    body: Result<Json<EmailRequest>, JsonRejection>,
) -> Result<Json<Envelope<()>>, ApiError> {
    let EmailRequest { email } = json_body(body)?;
    ctx.blocking(move |core| identity::resend_activation(core, &email).map_err(ApiError::from))
        .await?;
    Ok(done("A new verification code has been sent"))
}

/// `POST /accounts/login`
pub async fn login(
    State(ctx): State<ApiContext>,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<Envelope<SessionGrant>>, ApiError> {
    let LoginRequest { email, password } = json_body(body)?;
    let grant = ctx
        .blocking(move |core| identity::login(core, &email, &password).map_err(ApiError::from))
        .await?;
    Ok(success("Signed in", grant))
}

/// `GET /accounts/me`
pub async fn me(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<Envelope<Account>>, ApiError> {
    let account = ctx
        .blocking(move |core| identity::profile(core, &caller).map_err(ApiError::from))
        .await?;
    Ok(success("Profile", account))
}

/// `PATCH /accounts/me`
pub async fn update_me(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<Caller>,
    body: Result<Json<ProfileUpdate>, JsonRejection>,
) -> Result<Json<Envelope<Account>>, ApiError> {
    let update = json_body(body)?;
    let account = ctx
        .blocking(move |core| identity::update_profile(core, &caller, update).map_err(ApiError::from))
        .await?;
    Ok(success("Profile updated", account))
}

/// `POST /accounts/me/deactivate`
pub async fn deactivate_me(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<Envelope<()>>, ApiError> {
    ctx.blocking(move |core| identity::deactivate(core, &caller).map_err(ApiError::from))
        .await?;
    Ok(done("Account deactivated"))
}
