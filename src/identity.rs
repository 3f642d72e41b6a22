//! Identity activation, login, and profile management.
//!
//! Registration creates a PENDING_VERIFICATION account and issues an
//! ACCOUNT_ACTIVATION challenge in the same transaction. `verify` consumes
//! the challenge and flips the account to ACTIVE, exactly once.

use std::sync::LazyLock;

use chrono::{NaiveTime, Weekday};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::core_state::{CoreError, CoreState, TxOutcome};
use crate::crypto::{hash_password, verify_password, CryptoError};
use crate::db::{self, DatabaseError};
use crate::models::{
    clock_time, weekday_list, Account, AccountProfile, AccountStatus, DoctorProfile, OtpPurpose,
    PatientProfile, Role,
};
use crate::notify::{self, NotifyError};
use crate::otp::OtpError;
use crate::session::{Caller, SessionError};

const MIN_PASSWORD_LEN: usize = 8;
const MAX_PASSWORD_LEN: usize = 128;

static EMAIL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9._%+\-]+@[a-z0-9.\-]+\.[a-z]{2,}$").unwrap());

static USERNAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.]{3,30}$").unwrap());

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("{0}")]
    Validation(String),
    #[error("An account with this email already exists")]
    EmailTaken,
    #[error("This username is already taken")]
    UsernameTaken,
    #[error("Account not found")]
    AccountNotFound,
    #[error("Account is already active")]
    AlreadyActive,
    #[error("Invalid email or password")]
    InvalidCredentials,
    #[error("Account email has not been verified")]
    NotVerified,
    #[error("Account has been deactivated")]
    Deactivated,
    #[error("Authentication required")]
    Unauthenticated,
    #[error(transparent)]
    Otp(#[from] OtpError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Notify(#[from] NotifyError),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl From<DatabaseError> for IdentityError {
    fn from(e: DatabaseError) -> Self {
        IdentityError::Core(CoreError::Database(e))
    }
}

impl TxOutcome for IdentityError {
    fn preserves_writes(&self) -> bool {
        match self {
            IdentityError::Otp(e) => e.preserves_writes(),
            _ => false,
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Request types
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(flatten)]
    pub profile: RegistrationProfile,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "role", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistrationProfile {
    Patient { username: String },
    Doctor(DoctorRegistration),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoctorRegistration {
    pub fullname: String,
    pub specialization: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub clinic_name: Option<String>,
    #[serde(default)]
    pub clinic_address: Option<String>,
    #[serde(default)]
    pub about: Option<String>,
    #[serde(default)]
    pub reg_number: Option<String>,
    #[serde(default)]
    pub profile_image_url: Option<String>,
    #[serde(default, with = "clock_time")]
    pub clinic_open_time: Option<NaiveTime>,
    #[serde(default, with = "clock_time")]
    pub clinic_close_time: Option<NaiveTime>,
    #[serde(default, with = "weekday_list")]
    pub working_days: Vec<Weekday>,
}

/// Partial profile edit. Absent fields are left unchanged; email, role and
/// specialization cannot be changed.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdate {
    pub username: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub password: Option<String>,
    pub fullname: Option<String>,
    pub phone: Option<String>,
    pub clinic_name: Option<String>,
    pub clinic_address: Option<String>,
    pub about: Option<String>,
    pub profile_image_url: Option<String>,
    #[serde(default, with = "clock_time")]
    pub clinic_open_time: Option<NaiveTime>,
    #[serde(default, with = "clock_time")]
    pub clinic_close_time: Option<NaiveTime>,
    #[serde(default, with = "optional_weekdays")]
    pub working_days: Option<Vec<Weekday>>,
}

mod optional_weekdays {
    use chrono::Weekday;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<Weekday>>, D::Error> {
        #[derive(Deserialize)]
        struct Wrapper(#[serde(with = "crate::models::weekday_list")] Vec<Weekday>);
        Ok(Option::<Wrapper>::deserialize(d)?.map(|w| w.0))
    }
}

// ═══════════════════════════════════════════════════════════
// Results
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Registered {
    pub account_id: Uuid,
    pub email: String,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionGrant {
    pub token: String,
    pub expires_in: i64,
    pub account: Account,
}

// ═══════════════════════════════════════════════════════════
// Validation
// ═══════════════════════════════════════════════════════════

/// Trimmed, lower-cased, and syntactically plausible.
pub fn normalize_email(raw: &str) -> Result<String, IdentityError> {
    let email = raw.trim().to_lowercase();
    if email.len() > 254 || !EMAIL_PATTERN.is_match(&email) {
        return Err(IdentityError::Validation("A valid email address is required".into()));
    }
    Ok(email)
}

fn check_password(password: &str) -> Result<(), IdentityError> {
    let len = password.chars().count();
    if !(MIN_PASSWORD_LEN..=MAX_PASSWORD_LEN).contains(&len) {
        return Err(IdentityError::Validation(format!(
            "Password must be {MIN_PASSWORD_LEN} to {MAX_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

fn check_username(raw: &str) -> Result<String, IdentityError> {
    let username = raw.trim();
    if !USERNAME_PATTERN.is_match(username) {
        return Err(IdentityError::Validation(
            "Username must be 3 to 30 letters, digits, '.' or '_'".into(),
        ));
    }
    Ok(username.to_string())
}

fn required(field: &str, raw: &str) -> Result<String, IdentityError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(IdentityError::Validation(format!("{field} is required")));
    }
    Ok(value.to_string())
}

fn optional(raw: Option<String>) -> Option<String> {
    raw.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn check_hours(open: Option<NaiveTime>, close: Option<NaiveTime>) -> Result<(), IdentityError> {
    match (open, close) {
        (None, None) => Ok(()),
        (Some(open), Some(close)) if open < close => Ok(()),
        (Some(_), Some(_)) => Err(IdentityError::Validation(
            "Clinic opening time must be before closing time".into(),
        )),
        _ => Err(IdentityError::Validation(
            "Clinic opening and closing times must be given together".into(),
        )),
    }
}

fn build_profile(profile: RegistrationProfile) -> Result<AccountProfile, IdentityError> {
    match profile {
        RegistrationProfile::Patient { username } => Ok(AccountProfile::Patient(PatientProfile {
            username: check_username(&username)?,
        })),
        RegistrationProfile::Doctor(doctor) => {
            check_hours(doctor.clinic_open_time, doctor.clinic_close_time)?;
            Ok(AccountProfile::Doctor(DoctorProfile {
                fullname: required("fullname", &doctor.fullname)?,
                phone: optional(doctor.phone),
                specialization: required("specialization", &doctor.specialization)?,
                clinic_name: optional(doctor.clinic_name),
                clinic_address: optional(doctor.clinic_address),
                about: optional(doctor.about),
                reg_number: optional(doctor.reg_number),
                profile_image_url: optional(doctor.profile_image_url),
                clinic_open_time: doctor.clinic_open_time,
                clinic_close_time: doctor.clinic_close_time,
                working_days: doctor.working_days,
            }))
        }
    }
}

fn username_of(profile: &AccountProfile) -> Option<&str> {
    match profile {
        AccountProfile::Patient(p) => Some(&p.username),
        AccountProfile::Doctor(_) => None,
    }
}

// ═══════════════════════════════════════════════════════════
// Operations
// ═══════════════════════════════════════════════════════════

/// Create (or overwrite, while still unverified) an account and send its
/// activation code.
pub fn register(core: &CoreState, registration: Registration) -> Result<Registered, IdentityError> {
    let email = normalize_email(&registration.email)?;
    check_password(&registration.password)?;
    let profile = build_profile(registration.profile)?;
    let credential = hash_password(&registration.password, core.config().password_iterations);
    let now = core.now();

    let registered = core.transact(|conn| {
        let existing = db::find_account_by_email(conn, &email)?;
        if let Some(existing) = &existing {
            if existing.status == AccountStatus::Active {
                return Err(IdentityError::EmailTaken);
            }
        }
        if let Some(username) = username_of(&profile) {
            if db::username_in_use(conn, username, existing.as_ref().map(|a| &a.id))? {
                return Err(IdentityError::UsernameTaken);
            }
        }

        let account = Account {
            id: existing.as_ref().map(|a| a.id).unwrap_or_else(Uuid::new_v4),
            email: email.clone(),
            status: AccountStatus::PendingVerification,
            city: optional(registration.city.clone()),
            state: optional(registration.state.clone()),
            created_at: existing.as_ref().map(|a| a.created_at).unwrap_or(now),
            activated_at: None,
            deactivated_at: None,
            profile: profile.clone(),
        };
        let subject = account.id.to_string();

        let issued = if existing.is_some() {
            if !db::replace_pending_account(conn, &account, &credential, &now)? {
                return Err(IdentityError::EmailTaken);
            }
            core.otp()
                .resend(conn, &subject, OtpPurpose::AccountActivation, now)?
        } else {
            db::insert_account(conn, &account, &credential).map_err(|e| {
                if e.is_unique_violation() {
                    IdentityError::EmailTaken
                } else {
                    e.into()
                }
            })?;
            core.otp()
                .issue(conn, &subject, OtpPurpose::AccountActivation, now)?
        };

        notify::enqueue(
            conn,
            core.keys().sealing_key(),
            &notify::activation_code(
                &account.email,
                account.display_name(),
                &issued.code,
                core.otp().policy().ttl.num_minutes(),
            ),
            now,
        )?;

        Ok(Registered {
            account_id: account.id,
            email: account.email.clone(),
            role: account.role(),
        })
    })?;

    tracing::info!(
        account_id = %registered.account_id,
        role = %registered.role,
        "Account registered, activation code queued"
    );
    Ok(registered)
}

/// Consume the activation code and activate the account.
pub fn verify(core: &CoreState, email: &str, code: &str) -> Result<SessionGrant, IdentityError> {
    let email = normalize_email(email)?;
    let now = core.now();

    let account = core.transact(|conn| {
        let account = db::find_account_by_email(conn, &email)?.ok_or(IdentityError::AccountNotFound)?;
        if account.deactivated_at.is_some() {
            return Err(IdentityError::Deactivated);
        }
        let subject = account.id.to_string();

        if account.status == AccountStatus::Active {
            return match core
                .otp()
                .validate(conn, &subject, OtpPurpose::AccountActivation, code, now)
            {
                Err(OtpError::NotFound) | Ok(()) => Err(IdentityError::AlreadyActive),
                Err(e) => Err(e.into()),
            };
        }

        core.otp()
            .validate(conn, &subject, OtpPurpose::AccountActivation, code, now)?;
        if !db::activate_account(conn, &account.id, &now)? {
            return Err(IdentityError::AlreadyActive);
        }
        db::get_account(conn, &account.id)?.ok_or(IdentityError::AccountNotFound)
    })?;

    tracing::info!(account_id = %account.id, role = %account.role(), "Account activated");
    grant(core, account)
}

/// Issue a fresh activation code, subject to the resend cooldown.
pub fn resend_activation(core: &CoreState, email: &str) -> Result<(), IdentityError> {
    let email = normalize_email(email)?;
    let now = core.now();

    core.transact(|conn| {
        let account = db::find_account_by_email(conn, &email)?.ok_or(IdentityError::AccountNotFound)?;
        if account.status == AccountStatus::Active {
            return Err(IdentityError::AlreadyActive);
        }
        let issued = core.otp().resend(
            conn,
            &account.id.to_string(),
            OtpPurpose::AccountActivation,
            now,
        )?;
        notify::enqueue(
            conn,
            core.keys().sealing_key(),
            &notify::activation_code(
                &account.email,
                account.display_name(),
                &issued.code,
                core.otp().policy().ttl.num_minutes(),
            ),
            now,
        )?;
        tracing::info!(account_id = %account.id, "Activation code re-sent");
        Ok(())
    })
}

/// Password login. Unknown email and wrong password are indistinguishable.
pub fn login(core: &CoreState, email: &str, password: &str) -> Result<SessionGrant, IdentityError> {
    let email = normalize_email(email).map_err(|_| IdentityError::InvalidCredentials)?;

    let found = core.read(|conn| {
        let Some(account) = db::find_account_by_email(conn, &email)? else {
            return Ok::<_, IdentityError>(None);
        };
        let hash = db::get_password_hash(conn, &account.id)?;
        Ok(hash.map(|h| (account, h)))
    })?;

    let Some((account, stored)) = found else {
        // Burn comparable time so a missing account is not observable.
        let _ = hash_password(password, core.config().password_iterations);
        return Err(IdentityError::InvalidCredentials);
    };
    if !verify_password(password, &stored)? {
        tracing::info!(account_id = %account.id, "Login rejected: bad password");
        return Err(IdentityError::InvalidCredentials);
    }
    if account.deactivated_at.is_some() {
        return Err(IdentityError::Deactivated);
    }
    if account.status != AccountStatus::Active {
        return Err(IdentityError::NotVerified);
    }

    tracing::info!(account_id = %account.id, role = %account.role(), "Login");
    grant(core, account)
}

fn grant(core: &CoreState, account: Account) -> Result<SessionGrant, IdentityError> {
    let token = core.sessions().issue(account.id, account.role(), core.now())?;
    Ok(SessionGrant {
        token,
        expires_in: core.sessions().ttl().num_seconds(),
        account,
    })
}

/// Resolve a bearer token to a caller whose account is still usable.
pub fn authenticate(core: &CoreState, token: &str) -> Result<Caller, IdentityError> {
    let claims = core
        .sessions()
        .verify(token, core.now())
        .map_err(|_| IdentityError::Unauthenticated)?;
    let account = core
        .read(|conn| db::get_account(conn, &claims.sub).map_err(IdentityError::from))?
        .ok_or(IdentityError::Unauthenticated)?;
    if account.role() != claims.role {
        return Err(IdentityError::Unauthenticated);
    }
    if account.deactivated_at.is_some() {
        return Err(IdentityError::Deactivated);
    }
    if account.status != AccountStatus::Active {
        return Err(IdentityError::NotVerified);
    }
    Ok(Caller::from(&claims))
}

pub fn profile(core: &CoreState, caller: &Caller) -> Result<Account, IdentityError> {
    core.read(|conn| db::get_account(conn, &caller.account_id).map_err(IdentityError::from))?
        .ok_or(IdentityError::AccountNotFound)
}

/// Apply a partial edit to the caller's own profile.
pub fn update_profile(
    core: &CoreState,
    caller: &Caller,
    update: ProfileUpdate,
) -> Result<Account, IdentityError> {
    let credential = match update.password.as_deref() {
        Some(password) => {
            check_password(password)?;
            Some(hash_password(password, core.config().password_iterations))
        }
        None => None,
    };
    let now = core.now();

    let account = core.transact(|conn| {
        let mut account =
            db::get_account(conn, &caller.account_id)?.ok_or(IdentityError::AccountNotFound)?;
        if let Some(city) = update.city.clone() {
            account.city = optional(Some(city));
        }
        if let Some(state) = update.state.clone() {
            account.state = optional(Some(state));
        }

        match &mut account.profile {
            AccountProfile::Patient(patient) => {
                if update.fullname.is_some()
                    || update.phone.is_some()
                    || update.clinic_name.is_some()
                    || update.clinic_address.is_some()
                    || update.about.is_some()
                    || update.profile_image_url.is_some()
                    || update.clinic_open_time.is_some()
                    || update.clinic_close_time.is_some()
                    || update.working_days.is_some()
                {
                    return Err(IdentityError::Validation(
                        "Clinic fields can only be set on doctor accounts".into(),
                    ));
                }
                if let Some(username) = update.username.as_deref() {
                    let username = check_username(username)?;
                    if db::username_in_use(conn, &username, Some(&caller.account_id))? {
                        return Err(IdentityError::UsernameTaken);
                    }
                    patient.username = username;
                }
            }
            AccountProfile::Doctor(doctor) => {
                if update.username.is_some() {
                    return Err(IdentityError::Validation(
                        "Doctor accounts do not have a username".into(),
                    ));
                }
                if let Some(fullname) = update.fullname.as_deref() {
                    doctor.fullname = required("fullname", fullname)?;
                }
                if let Some(phone) = update.phone.clone() {
                    doctor.phone = optional(Some(phone));
                }
                if let Some(name) = update.clinic_name.clone() {
                    doctor.clinic_name = optional(Some(name));
                }
                if let Some(address) = update.clinic_address.clone() {
                    doctor.clinic_address = optional(Some(address));
                }
                if let Some(about) = update.about.clone() {
                    doctor.about = optional(Some(about));
                }
                if let Some(url) = update.profile_image_url.clone() {
                    doctor.profile_image_url = optional(Some(url));
                }
                if update.clinic_open_time.is_some() {
                    doctor.clinic_open_time = update.clinic_open_time;
                }
                if update.clinic_close_time.is_some() {
                    doctor.clinic_close_time = update.clinic_close_time;
                }
                check_hours(doctor.clinic_open_time, doctor.clinic_close_time)?;
                if let Some(days) = update.working_days.clone() {
                    doctor.working_days = days;
                }
            }
        }

        db::update_account_profile(conn, &account, &now).map_err(|e| {
            if e.is_unique_violation() {
                IdentityError::UsernameTaken
            } else {
                e.into()
            }
        })?;
        if let Some(hash) = credential.as_deref() {
            db::update_password_hash(conn, &account.id, hash, &now)?;
        }
        db::get_account(conn, &account.id)?.ok_or(IdentityError::AccountNotFound)
    })?;

    tracing::info!(
        account_id = %account.id,
        password_changed = credential.is_some(),
        "Profile updated"
    );
    Ok(account)
}

/// Soft-delete. The record stays for appointment history; the account can
/// no longer log in or use existing tokens.
pub fn deactivate(core: &CoreState, caller: &Caller) -> Result<(), IdentityError> {
    let now = core.now();
    core.transact(|conn| {
        if !db::deactivate_account(conn, &caller.account_id, &now)? {
            return Err(IdentityError::AccountNotFound);
        }
        Ok(())
    })?;
    tracing::info!(account_id = %caller.account_id, "Account deactivated");
    Ok(())
}

#[cfg(test)]
impl Registration {
    pub fn patient(email: &str, password: &str, username: &str) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
            city: None,
            state: None,
            profile: RegistrationProfile::Patient {
                username: username.into(),
            },
        }
    }

    pub fn doctor(email: &str, password: &str, doctor: DoctorRegistration) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
            city: None,
            state: None,
            profile: RegistrationProfile::Doctor(doctor),
        }
    }
}
