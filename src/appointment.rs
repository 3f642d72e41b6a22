//! Appointment lifecycle: PENDING → RESOLVED (OTP-gated) or CANCELLED.
//!
//! Every transition runs inside one IMMEDIATE transaction together with its
//! ledger write and its outbox message. Mail is sent later by the delivery
//! worker, so a failed send never undoes or repeats a transition.

use std::collections::HashMap;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::core_state::{CoreError, CoreState, TxOutcome};
use crate::db::{self, DatabaseError, Projection};
use crate::models::{clock_time, Account, Appointment, AppointmentStatus, OtpPurpose, PageRequest, Role};
use crate::notify::{self, NotifyError};
use crate::otp::OtpError;
use crate::scheduling::{self, SlotPolicy, SlotRejection};
use crate::session::Caller;

const MAX_MESSAGE_LEN: usize = 1000;
const MAX_REASON_LEN: usize = 500;

#[derive(Error, Debug)]
pub enum AppointmentError {
    #[error("{0}")]
    Validation(String),
    #[error("Appointment not found")]
    NotFound,
    #[error("Doctor not found")]
    DoctorNotFound,
    #[error("Not permitted for this appointment")]
    Forbidden,
    #[error("Appointment is already {0}")]
    InvalidTransition(AppointmentStatus),
    #[error("Slot unavailable: {0}")]
    SlotUnavailable(SlotRejection),
    #[error(transparent)]
    Otp(#[from] OtpError),
    #[error(transparent)]
    Notify(#[from] NotifyError),
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl From<DatabaseError> for AppointmentError {
    fn from(e: DatabaseError) -> Self {
        AppointmentError::Core(CoreError::Database(e))
    }
}

impl TxOutcome for AppointmentError {
    fn preserves_writes(&self) -> bool {
        match self {
            AppointmentError::Otp(e) => e.preserves_writes(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingRequest {
    pub doctor_id: Uuid,
    /// Omitted: the first admissible date within the booking horizon.
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default, with = "clock_time")]
    pub time: Option<NaiveTime>,
    #[serde(default)]
    pub message: Option<String>,
}

/// An appointment as one of its parties sees it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppointmentView {
    #[serde(flatten)]
    pub appointment: Appointment,
    pub patient_name: String,
    pub doctor_name: String,
    /// PENDING, but its time has passed without being resolved.
    pub lapsed: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppointmentPage {
    pub appointments: Vec<AppointmentView>,
    pub page: u32,
    pub total_pages: u32,
}

// ═══════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════

fn load(conn: &Connection, id: &Uuid) -> Result<Appointment, AppointmentError> {
    db::get_appointment(conn, id)?.ok_or(AppointmentError::NotFound)
}

/// The caller's side of `appt`, which must match the role in their token.
fn party_of(appt: &Appointment, caller: &Caller) -> Result<Role, AppointmentError> {
    match appt.party_role(caller.account_id) {
        Some(role) if role == caller.role => Ok(role),
        _ => Err(AppointmentError::Forbidden),
    }
}

fn require_pending(appt: &Appointment) -> Result<(), AppointmentError> {
    if appt.status != AppointmentStatus::Pending {
        return Err(AppointmentError::InvalidTransition(appt.status));
    }
    Ok(())
}

fn account(conn: &Connection, id: &Uuid) -> Result<Account, AppointmentError> {
    db::get_account(conn, id)?.ok_or_else(|| {
        AppointmentError::Core(CoreError::Database(DatabaseError::NotFound {
            entity_type: "account".into(),
            id: id.to_string(),
        }))
    })
}

fn bounded_text(field: &str, raw: Option<&str>, max: usize) -> Result<Option<String>, AppointmentError> {
    let Some(text) = raw.map(str::trim).filter(|t| !t.is_empty()) else {
        return Ok(None);
    };
    if text.chars().count() > max {
        return Err(AppointmentError::Validation(format!(
            "{field} must be at most {max} characters"
        )));
    }
    Ok(Some(text.to_string()))
}

struct Names<'c> {
    conn: &'c Connection,
    cache: HashMap<Uuid, String>,
}

impl<'c> Names<'c> {
    fn new(conn: &'c Connection) -> Self {
        Self {
            conn,
            cache: HashMap::new(),
        }
    }

    fn of(&mut self, id: Uuid) -> Result<String, AppointmentError> {
        if let Some(name) = self.cache.get(&id) {
            return Ok(name.clone());
        }
        let name = account(self.conn, &id)?.display_name().to_string();
        self.cache.insert(id, name.clone());
        Ok(name)
    }

    fn view(&mut self, appointment: Appointment, clinic_now: NaiveDateTime) -> Result<AppointmentView, AppointmentError> {
        Ok(AppointmentView {
            patient_name: self.of(appointment.patient_id)?,
            doctor_name: self.of(appointment.doctor_id)?,
            lapsed: appointment.has_lapsed(clinic_now),
            appointment,
        })
    }
}

// ═══════════════════════════════════════════════════════════
// Transitions
// ═══════════════════════════════════════════════════════════

/// Book a visit for the calling patient. Admission, insert, OTP issue and
/// the booking mail are one atomic unit.
pub fn create(
    core: &CoreState,
    caller: &Caller,
    request: BookingRequest,
) -> Result<AppointmentView, AppointmentError> {
    if caller.role != Role::Patient {
        return Err(AppointmentError::Forbidden);
    }
    let time = request
        .time
        .ok_or_else(|| AppointmentError::Validation("Appointment time is required".into()))?;
    let message = bounded_text("Message", request.message.as_deref(), MAX_MESSAGE_LEN)?;
    let policy = SlotPolicy::from_config(core.config());
    let now = core.now();
    let clinic_now = core.clinic_now();

    let view = core.transact(|conn| {
        let doctor = db::get_account(conn, &request.doctor_id)?
            .filter(|a| a.role() == Role::Doctor && a.is_active())
            .ok_or(AppointmentError::DoctorNotFound)?;
        let patient = account(conn, &caller.account_id)?;

        let date = match request.date {
            Some(date) => date,
            None => scheduling::next_available_date(conn, &policy, &doctor.id, time, clinic_now)?
                .ok_or(AppointmentError::SlotUnavailable(SlotRejection::NoOpening(
                    policy.horizon_days,
                )))?,
        };
        let scheduled_at = date.and_time(time);

        if let Some(rejection) = scheduling::check(conn, &policy, &doctor.id, scheduled_at, clinic_now)? {
            tracing::info!(
                doctor_id = %doctor.id,
                %scheduled_at,
                reason = %rejection,
                "Booking rejected"
            );
            return Err(AppointmentError::SlotUnavailable(rejection));
        }

        let appointment = Appointment {
            id: Uuid::new_v4(),
            patient_id: patient.id,
            doctor_id: doctor.id,
            scheduled_at,
            message: message.clone(),
            status: AppointmentStatus::Pending,
            cancelled_by: None,
            cancel_reason: None,
            cancelled_at: None,
            resolved_at: None,
            resolved_by: None,
            created_at: now,
        };
        db::insert_appointment(conn, &appointment).map_err(|e| {
            if e.is_unique_violation() {
                AppointmentError::SlotUnavailable(SlotRejection::Conflict)
            } else {
                e.into()
            }
        })?;

        let issued = core.otp().issue(
            conn,
            &appointment.id.to_string(),
            OtpPurpose::AppointmentResolution,
            now,
        )?;
        notify::enqueue(
            conn,
            core.keys().sealing_key(),
            &notify::booking_otp(
                &patient.email,
                patient.display_name(),
                doctor.display_name(),
                &scheduled_at,
                &issued.code,
            ),
            now,
        )?;

        Ok(AppointmentView {
            patient_name: patient.display_name().to_string(),
            doctor_name: doctor.display_name().to_string(),
            lapsed: false,
            appointment,
        })
    })?;

    tracing::info!(
        appointment_id = %view.appointment.id,
        doctor_id = %view.appointment.doctor_id,
        patient_id = %view.appointment.patient_id,
        scheduled_at = %view.appointment.scheduled_at,
        "Appointment booked"
    );
    Ok(view)
}

/// Doctor confirms the visit with the patient's code.
pub fn resolve(
    core: &CoreState,
    caller: &Caller,
    appointment_id: &Uuid,
    code: &str,
) -> Result<AppointmentView, AppointmentError> {
    let now = core.now();
    let clinic_now = core.clinic_now();

    let view = core.transact(|conn| {
        let appt = load(conn, appointment_id)?;
        if caller.role != Role::Doctor || appt.doctor_id != caller.account_id {
            return Err(AppointmentError::Forbidden);
        }
        require_pending(&appt)?;

        core.otp().validate(
            conn,
            &appt.id.to_string(),
            OtpPurpose::AppointmentResolution,
            code,
            now,
        )?;
        if !db::mark_resolved(conn, &appt.id, &caller.account_id, &now)? {
            return Err(AppointmentError::InvalidTransition(appt.status));
        }

        let patient = account(conn, &appt.patient_id)?;
        let doctor = account(conn, &appt.doctor_id)?;
        notify::enqueue(
            conn,
            core.keys().sealing_key(),
            &notify::appointment_completed(
                &patient.email,
                patient.display_name(),
                doctor.display_name(),
                &appt.scheduled_at,
            ),
            now,
        )?;

        Names::new(conn).view(load(conn, &appt.id)?, clinic_now)
    });

    match &view {
        Ok(_) => tracing::info!(appointment_id = %appointment_id, doctor_id = %caller.account_id, "Appointment resolved"),
        Err(AppointmentError::Otp(e)) => {
            tracing::info!(appointment_id = %appointment_id, reason = %e, "Resolution refused")
        }
        Err(_) => {}
    }
    view
}

/// Either party backs out. No code needed, but a reason is.
pub fn cancel(
    core: &CoreState,
    caller: &Caller,
    appointment_id: &Uuid,
    reason: &str,
) -> Result<AppointmentView, AppointmentError> {
    let reason = bounded_text("Reason", Some(reason), MAX_REASON_LEN)?
        .ok_or_else(|| AppointmentError::Validation("A cancellation reason is required".into()))?;
    let now = core.now();
    let clinic_now = core.clinic_now();

    let view = core.transact(|conn| {
        let appt = load(conn, appointment_id)?;
        let by = party_of(&appt, caller)?;
        require_pending(&appt)?;

        if !db::mark_cancelled(conn, &appt.id, by, &reason, &now)? {
            return Err(AppointmentError::InvalidTransition(appt.status));
        }
        core.otp().retire(
            conn,
            &appt.id.to_string(),
            OtpPurpose::AppointmentResolution,
            now,
        )?;

        let patient = account(conn, &appt.patient_id)?;
        let doctor = account(conn, &appt.doctor_id)?;
        let mail = match by {
            Role::Doctor => notify::cancelled_by_doctor(
                &patient.email,
                patient.display_name(),
                doctor.display_name(),
                &appt.scheduled_at,
                &reason,
            ),
            Role::Patient => notify::cancelled_by_patient(
                &doctor.email,
                doctor.display_name(),
                patient.display_name(),
                &appt.scheduled_at,
                &reason,
            ),
        };
        notify::enqueue(conn, core.keys().sealing_key(), &mail, now)?;

        Names::new(conn).view(load(conn, &appt.id)?, clinic_now)
    })?;

    tracing::info!(
        appointment_id = %appointment_id,
        cancelled_by = %caller.role,
        reason = %reason,
        "Appointment cancelled"
    );
    Ok(view)
}

/// Re-issue the resolution code to the patient. Either party may ask.
pub fn resend_otp(core: &CoreState, caller: &Caller, appointment_id: &Uuid) -> Result<(), AppointmentError> {
    let now = core.now();
    core.transact(|conn| {
        let appt = load(conn, appointment_id)?;
        party_of(&appt, caller)?;
        require_pending(&appt)?;

        let issued = core.otp().resend(
            conn,
            &appt.id.to_string(),
            OtpPurpose::AppointmentResolution,
            now,
        )?;
        let patient = account(conn, &appt.patient_id)?;
        notify::enqueue(
            conn,
            core.keys().sealing_key(),
            &notify::otp_resend(
                &patient.email,
                patient.display_name(),
                &appt.scheduled_at,
                &issued.code,
            ),
            now,
        )?;
        Ok::<_, AppointmentError>(())
    })?;
    tracing::info!(appointment_id = %appointment_id, requested_by = %caller.role, "Appointment code re-sent");
    Ok(())
}

// ═══════════════════════════════════════════════════════════
// Projections
// ═══════════════════════════════════════════════════════════

pub fn get(core: &CoreState, caller: &Caller, appointment_id: &Uuid) -> Result<AppointmentView, AppointmentError> {
    let clinic_now = core.clinic_now();
    core.read(|conn| {
        let appt = load(conn, appointment_id)?;
        party_of(&appt, caller)?;
        Names::new(conn).view(appt, clinic_now)
    })
}

pub fn list_upcoming(
    core: &CoreState,
    caller: &Caller,
    page: PageRequest,
) -> Result<AppointmentPage, AppointmentError> {
    list(core, caller, Projection::Upcoming, page)
}

/// Resolved and cancelled visits, plus pending ones whose time has passed
/// (flagged `lapsed`, status unchanged).
pub fn list_history(
    core: &CoreState,
    caller: &Caller,
    page: PageRequest,
) -> Result<AppointmentPage, AppointmentError> {
    list(core, caller, Projection::History, page)
}

fn list(
    core: &CoreState,
    caller: &Caller,
    projection: Projection,
    page: PageRequest,
) -> Result<AppointmentPage, AppointmentError> {
    if !page.is_valid() {
        return Err(AppointmentError::Validation(
            "Page size must be between 1 and 100".into(),
        ));
    }
    let clinic_now = core.clinic_now();
    core.read(|conn| {
        let (items, total) =
            db::list_for_party(conn, &caller.account_id, caller.role, projection, &clinic_now, &page)?;
        let mut names = Names::new(conn);
        let appointments = items
            .into_iter()
            .map(|appt| names.view(appt, clinic_now))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(AppointmentPage {
            appointments,
            page: page.page,
            total_pages: page.total_pages(total),
        })
    })
}
