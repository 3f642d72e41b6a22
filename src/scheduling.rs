//! Slot admission for new bookings, plus doctor closed dates.
//!
//! `check` runs against a connection the caller already holds inside an
//! IMMEDIATE transaction, so the decision and the insert that follows it are
//! one atomic unit.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use rusqlite::Connection;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::core_state::{CoreError, CoreState, TxOutcome};
use crate::db::{self, ClosedDate, DatabaseError};
use crate::models::{weekday_name, Role};
use crate::session::Caller;

/// Why a requested time cannot be booked.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SlotRejection {
    #[error("The requested time is in the past")]
    InPast,
    #[error("Doctor is not accepting bookings")]
    DoctorUnavailable,
    #[error("Doctor has not published clinic hours")]
    NoClinicHours,
    #[error("Outside clinic hours ({open}-{close})")]
    OutsideHours { open: NaiveTime, close: NaiveTime },
    #[error("Clinic is closed on {}", weekday_name(*.0))]
    NotWorkingDay(Weekday),
    #[error("Clinic is closed on {0}")]
    ClosedDate(NaiveDate),
    #[error("Another appointment is booked too close to this time")]
    Conflict,
    #[error("No open date in the next {0} days at that time")]
    NoOpening(u32),
}

#[derive(Debug, Clone, Copy)]
pub struct SlotPolicy {
    /// Minimum distance between two live bookings with the same doctor.
    pub separation: Duration,
    /// Days searched forward by `next_available_date`.
    pub horizon_days: u32,
}

impl SlotPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            separation: config.visit_separation,
            horizon_days: config.booking_horizon_days,
        }
    }
}

impl Default for SlotPolicy {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Decide whether `doctor_id` can take a visit at `at`. `Ok(None)` means
/// admissible.
pub fn check(
    conn: &Connection,
    policy: &SlotPolicy,
    doctor_id: &Uuid,
    at: NaiveDateTime,
    clinic_now: NaiveDateTime,
) -> Result<Option<SlotRejection>, DatabaseError> {
    if at <= clinic_now {
        return Ok(Some(SlotRejection::InPast));
    }

    let Some(doctor) = db::get_account(conn, doctor_id)? else {
        return Ok(Some(SlotRejection::DoctorUnavailable));
    };
    let Some(profile) = doctor.as_doctor().filter(|_| doctor.is_active()) else {
        return Ok(Some(SlotRejection::DoctorUnavailable));
    };

    let Some((open, close)) = profile.clinic_hours() else {
        return Ok(Some(SlotRejection::NoClinicHours));
    };
    if profile.working_days.is_empty() {
        return Ok(Some(SlotRejection::NoClinicHours));
    }
    let time = at.time();
    if time < open || time >= close {
        return Ok(Some(SlotRejection::OutsideHours { open, close }));
    }
    let weekday = at.date().weekday();
    if !profile.working_days.contains(&weekday) {
        return Ok(Some(SlotRejection::NotWorkingDay(weekday)));
    }
    if db::is_closed_on(conn, doctor_id, &at.date())? {
        return Ok(Some(SlotRejection::ClosedDate(at.date())));
    }

    let conflicts = db::find_conflicting_appointments(conn, doctor_id, &at, policy.separation)?;
    if !conflicts.is_empty() {
        tracing::debug!(
            doctor_id = %doctor_id,
            conflicts = conflicts.len(),
            "Slot rejected: conflicting booking"
        );
        return Ok(Some(SlotRejection::Conflict));
    }
    Ok(None)
}

pub fn is_admissible(
    conn: &Connection,
    policy: &SlotPolicy,
    doctor_id: &Uuid,
    at: NaiveDateTime,
    clinic_now: NaiveDateTime,
) -> Result<bool, DatabaseError> {
    Ok(check(conn, policy, doctor_id, at, clinic_now)?.is_none())
}

/// First date within the horizon, starting today, on which `time` is
/// admissible.
pub fn next_available_date(
    conn: &Connection,
    policy: &SlotPolicy,
    doctor_id: &Uuid,
    time: NaiveTime,
    clinic_now: NaiveDateTime,
) -> Result<Option<NaiveDate>, DatabaseError> {
    let today = clinic_now.date();
    for offset in 0..i64::from(policy.horizon_days) {
        let date = today + Duration::days(offset);
        if check(conn, policy, doctor_id, date.and_time(time), clinic_now)?.is_none() {
            return Ok(Some(date));
        }
    }
    Ok(None)
}

// ═══════════════════════════════════════════════════════════
// Closed dates
// ═══════════════════════════════════════════════════════════

#[derive(Error, Debug)]
pub enum ClosedDateError {
    #[error("Only doctors can manage closed dates")]
    Forbidden,
    #[error("{0}")]
    Validation(String),
    #[error("{0} is already marked closed")]
    AlreadyClosed(NaiveDate),
    #[error("{0} is not marked closed")]
    NotClosed(NaiveDate),
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl From<DatabaseError> for ClosedDateError {
    fn from(e: DatabaseError) -> Self {
        ClosedDateError::Core(CoreError::Database(e))
    }
}

impl TxOutcome for ClosedDateError {}

#[derive(Debug, Clone, Deserialize)]
pub struct ClosedDateRequest {
    pub date: NaiveDate,
    #[serde(default)]
    pub reason: Option<String>,
}

fn require_doctor(caller: &Caller) -> Result<(), ClosedDateError> {
    if caller.role != Role::Doctor {
        return Err(ClosedDateError::Forbidden);
    }
    Ok(())
}

/// Mark a future date closed. Existing bookings on it are left alone.
pub fn add_closed_date(
    core: &CoreState,
    caller: &Caller,
    request: ClosedDateRequest,
) -> Result<ClosedDate, ClosedDateError> {
    require_doctor(caller)?;
    if request.date < core.clinic_now().date() {
        return Err(ClosedDateError::Validation(
            "Closed dates cannot be in the past".into(),
        ));
    }
    let reason = request
        .reason
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty());
    let now = core.now();

    core.transact(|conn| {
        if !db::insert_closed_date(conn, &caller.account_id, &request.date, reason.as_deref(), &now)? {
            return Err(ClosedDateError::AlreadyClosed(request.date));
        }
        Ok(())
    })?;

    tracing::info!(doctor_id = %caller.account_id, date = %request.date, "Closed date added");
    Ok(ClosedDate {
        date: request.date,
        reason,
    })
}

pub fn remove_closed_date(
    core: &CoreState,
    caller: &Caller,
    date: NaiveDate,
) -> Result<(), ClosedDateError> {
    require_doctor(caller)?;
    core.transact(|conn| {
        if !db::delete_closed_date(conn, &caller.account_id, &date)? {
            return Err(ClosedDateError::NotClosed(date));
        }
        Ok(())
    })?;
    tracing::info!(doctor_id = %caller.account_id, date = %date, "Closed date removed");
    Ok(())
}

/// Closed dates from today onwards.
pub fn list_closed_dates(core: &CoreState, caller: &Caller) -> Result<Vec<ClosedDate>, ClosedDateError> {
    require_doctor(caller)?;
    let today = core.clinic_now().date();
    core.read(|conn| {
        db::list_closed_dates(conn, &caller.account_id, &today).map_err(ClosedDateError::from)
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{Account, AccountProfile, AccountStatus, Appointment, AppointmentStatus, DoctorProfile};
    use chrono::{TimeZone, Utc};

    pub fn at(day: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 1, day)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    /// Active doctor, 09:00-17:00, Monday to Friday.
    pub fn weekday_doctor() -> DoctorProfile {
        DoctorProfile {
            fullname: "Meera Rao".into(),
            phone: None,
            specialization: "General".into(),
            clinic_name: Some("Rao Clinic".into()),
            clinic_address: None,
            about: None,
            reg_number: None,
            profile_image_url: None,
            clinic_open_time: NaiveTime::from_hms_opt(9, 0, 0),
            clinic_close_time: NaiveTime::from_hms_opt(17, 0, 0),
            working_days: vec![Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri],
        }
    }

    fn insert_doctor(conn: &Connection, profile: DoctorProfile) -> Uuid {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let account = Account {
            id: Uuid::new_v4(),
            email: format!("{}@clinic.test", Uuid::new_v4()),
            status: AccountStatus::Active,
            city: None,
            state: None,
            created_at: now,
            activated_at: Some(now),
            deactivated_at: None,
            profile: AccountProfile::Doctor(profile),
        };
        db::insert_account(conn, &account, "x").unwrap();
        account.id
    }

    fn book(conn: &Connection, doctor_id: Uuid, when: NaiveDateTime, status: AppointmentStatus) {
        let patient = Account {
            id: Uuid::new_v4(),
            email: format!("{}@x.test", Uuid::new_v4()),
            status: AccountStatus::Active,
            city: None,
            state: None,
            created_at: Utc::now(),
            activated_at: Some(Utc::now()),
            deactivated_at: None,
            profile: AccountProfile::Patient(crate::models::PatientProfile {
                username: Uuid::new_v4().simple().to_string()[..12].to_string(),
            }),
        };
        db::insert_account(conn, &patient, "x").unwrap();
        let appt = Appointment {
            id: Uuid::new_v4(),
            patient_id: patient.id,
            doctor_id,
            scheduled_at: when,
            message: None,
            status: AppointmentStatus::Pending,
            cancelled_by: None,
            cancel_reason: None,
            cancelled_at: None,
            resolved_at: None,
            resolved_by: None,
            created_at: Utc::now(),
        };
        db::insert_appointment(conn, &appt).unwrap();
        match status {
            AppointmentStatus::Pending => {}
            AppointmentStatus::Resolved => {
                db::mark_resolved(conn, &appt.id, &doctor_id, &Utc::now()).unwrap();
            }
            AppointmentStatus::Cancelled => {
                db::mark_cancelled(conn, &appt.id, Role::Patient, "busy", &Utc::now()).unwrap();
            }
        }
    }

    // 2025-01-06 is a Monday; "now" is that morning.
    fn now() -> NaiveDateTime {
        at(6, 8, 0)
    }

    #[test]
    fn open_slot_is_admissible() {
        let conn = db::open_memory_database().unwrap();
        let doctor = insert_doctor(&conn, weekday_doctor());
        let policy = SlotPolicy::default();
        assert!(is_admissible(&conn, &policy, &doctor, at(10, 10, 0), now()).unwrap());
    }

    #[test]
    fn separation_window_rejects_neighbours() {
        let conn = db::open_memory_database().unwrap();
        let doctor = insert_doctor(&conn, weekday_doctor());
        let policy = SlotPolicy::default();
        book(&conn, doctor, at(10, 10, 0), AppointmentStatus::Pending);

        assert_eq!(
            check(&conn, &policy, &doctor, at(10, 10, 15), now()).unwrap(),
            Some(SlotRejection::Conflict)
        );
        assert_eq!(
            check(&conn, &policy, &doctor, at(10, 9, 45), now()).unwrap(),
            Some(SlotRejection::Conflict)
        );
        assert!(is_admissible(&conn, &policy, &doctor, at(10, 10, 30), now()).unwrap());
        assert!(is_admissible(&conn, &policy, &doctor, at(10, 9, 30), now()).unwrap());
    }

    #[test]
    fn exact_collision_rejected_with_zero_window() {
        let conn = db::open_memory_database().unwrap();
        let doctor = insert_doctor(&conn, weekday_doctor());
        let policy = SlotPolicy {
            separation: Duration::zero(),
            horizon_days: 30,
        };
        book(&conn, doctor, at(10, 10, 0), AppointmentStatus::Pending);
        assert_eq!(
            check(&conn, &policy, &doctor, at(10, 10, 0), now()).unwrap(),
            Some(SlotRejection::Conflict)
        );
        assert!(is_admissible(&conn, &policy, &doctor, at(10, 10, 1), now()).unwrap());
    }

    #[test]
    fn resolved_blocks_but_cancelled_frees() {
        let conn = db::open_memory_database().unwrap();
        let doctor = insert_doctor(&conn, weekday_doctor());
        let policy = SlotPolicy::default();
        book(&conn, doctor, at(9, 11, 0), AppointmentStatus::Resolved);
        book(&conn, doctor, at(10, 11, 0), AppointmentStatus::Cancelled);

        assert_eq!(
            check(&conn, &policy, &doctor, at(9, 11, 0), at(6, 8, 0)).unwrap(),
            Some(SlotRejection::Conflict)
        );
        assert!(is_admissible(&conn, &policy, &doctor, at(10, 11, 0), now()).unwrap());
    }

    #[test]
    fn hours_are_half_open() {
        let conn = db::open_memory_database().unwrap();
        let doctor = insert_doctor(&conn, weekday_doctor());
        let policy = SlotPolicy::default();
        assert!(is_admissible(&conn, &policy, &doctor, at(10, 9, 0), now()).unwrap());
        assert!(is_admissible(&conn, &policy, &doctor, at(10, 16, 59), now()).unwrap());
        assert!(matches!(
            check(&conn, &policy, &doctor, at(10, 17, 0), now()).unwrap(),
            Some(SlotRejection::OutsideHours { .. })
        ));
        assert!(matches!(
            check(&conn, &policy, &doctor, at(10, 8, 59), now()).unwrap(),
            Some(SlotRejection::OutsideHours { .. })
        ));
    }

    #[test]
    fn weekend_and_closed_dates_rejected() {
        let conn = db::open_memory_database().unwrap();
        let doctor = insert_doctor(&conn, weekday_doctor());
        let policy = SlotPolicy::default();
        assert_eq!(
            check(&conn, &policy, &doctor, at(11, 10, 0), now()).unwrap(),
            Some(SlotRejection::NotWorkingDay(Weekday::Sat))
        );

        let closed = NaiveDate::from_ymd_opt(2025, 1, 10).unwrap();
        db::insert_closed_date(&conn, &doctor, &closed, Some("conference"), &Utc::now()).unwrap();
        assert_eq!(
            check(&conn, &policy, &doctor, at(10, 10, 0), now()).unwrap(),
            Some(SlotRejection::ClosedDate(closed))
        );
    }

    #[test]
    fn past_and_unknown_rejected() {
        let conn = db::open_memory_database().unwrap();
        let doctor = insert_doctor(&conn, weekday_doctor());
        let policy = SlotPolicy::default();
        assert_eq!(
            check(&conn, &policy, &doctor, at(6, 8, 0), now()).unwrap(),
            Some(SlotRejection::InPast)
        );
        assert_eq!(
            check(&conn, &policy, &Uuid::new_v4(), at(10, 10, 0), now()).unwrap(),
            Some(SlotRejection::DoctorUnavailable)
        );
    }

    #[test]
    fn doctor_without_hours_takes_no_bookings() {
        let conn = db::open_memory_database().unwrap();
        let policy = SlotPolicy::default();
        let no_hours = insert_doctor(
            &conn,
            DoctorProfile {
                clinic_open_time: None,
                clinic_close_time: None,
                ..weekday_doctor()
            },
        );
        let no_days = insert_doctor(
            &conn,
            DoctorProfile {
                working_days: vec![],
                ..weekday_doctor()
            },
        );
        for doctor in [no_hours, no_days] {
            assert_eq!(
                check(&conn, &policy, &doctor, at(10, 10, 0), now()).unwrap(),
                Some(SlotRejection::NoClinicHours)
            );
        }
    }

    #[test]
    fn next_available_skips_blocked_days() {
        let conn = db::open_memory_database().unwrap();
        let doctor = insert_doctor(&conn, weekday_doctor());
        let policy = SlotPolicy::default();
        let ten = NaiveTime::from_hms_opt(10, 0, 0).unwrap();

        assert_eq!(
            next_available_date(&conn, &policy, &doctor, ten, now()).unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, 6)
        );

        book(&conn, doctor, at(6, 10, 0), AppointmentStatus::Pending);
        db::insert_closed_date(&conn, &doctor, &NaiveDate::from_ymd_opt(2025, 1, 7).unwrap(), None, &Utc::now())
            .unwrap();
        assert_eq!(
            next_available_date(&conn, &policy, &doctor, ten, now()).unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, 8)
        );

        // Friday evening: the weekend is skipped.
        assert_eq!(
            next_available_date(&conn, &policy, &doctor, ten, at(10, 18, 0)).unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, 13)
        );
    }

    #[test]
    fn next_available_respects_horizon() {
        let conn = db::open_memory_database().unwrap();
        let doctor = insert_doctor(&conn, weekday_doctor());
        let policy = SlotPolicy {
            separation: Duration::minutes(30),
            horizon_days: 2,
        };
        let ten = NaiveTime::from_hms_opt(10, 0, 0).unwrap();
        // Saturday + Sunday only.
        assert_eq!(
            next_available_date(&conn, &policy, &doctor, ten, at(11, 8, 0)).unwrap(),
            None
        );
    }

    #[test]
    fn closed_date_management() {
        use crate::clock::ManualClock;
        use crate::otp::FixedCodes;
        use std::sync::Arc;

        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 6, 8, 0, 0).unwrap()));
        let core = CoreState::for_tests(clock, FixedCodes::always("123456"));
        let doctor_id = core
            .read(|conn| Ok::<_, CoreError>(insert_doctor(conn, weekday_doctor())))
            .unwrap();
        let doctor = Caller {
            account_id: doctor_id,
            role: Role::Doctor,
        };
        let friday = NaiveDate::from_ymd_opt(2025, 1, 10).unwrap();

        let added = add_closed_date(
            &core,
            &doctor,
            ClosedDateRequest {
                date: friday,
                reason: Some("  conference ".into()),
            },
        )
        .unwrap();
        assert_eq!(added.reason.as_deref(), Some("conference"));
        assert!(matches!(
            add_closed_date(&core, &doctor, ClosedDateRequest { date: friday, reason: None }),
            Err(ClosedDateError::AlreadyClosed(_))
        ));
        assert!(matches!(
            add_closed_date(
                &core,
                &doctor,
                ClosedDateRequest {
                    date: NaiveDate::from_ymd_opt(2025, 1, 5).unwrap(),
                    reason: None,
                }
            ),
            Err(ClosedDateError::Validation(_))
        ));
        assert_eq!(list_closed_dates(&core, &doctor).unwrap(), vec![added]);

        let patient = Caller {
            account_id: Uuid::new_v4(),
            role: Role::Patient,
        };
        assert!(matches!(
            list_closed_dates(&core, &patient),
            Err(ClosedDateError::Forbidden)
        ));

        remove_closed_date(&core, &doctor, friday).unwrap();
        assert!(matches!(
            remove_closed_date(&core, &doctor, friday),
            Err(ClosedDateError::NotClosed(_))
        ));
        assert!(list_closed_dates(&core, &doctor).unwrap().is_empty());
    }
}
