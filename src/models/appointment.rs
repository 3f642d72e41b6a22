use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::enums::{AppointmentStatus, Role};

/// A booked visit. `scheduled_at` is clinic-local wall time.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Appointment {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub doctor_id: Uuid,
    pub scheduled_at: NaiveDateTime,
    pub message: Option<String>,
    pub status: AppointmentStatus,
    pub cancelled_by: Option<Role>,
    pub cancel_reason: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Appointment {
    /// Which side of this appointment `account_id` is on, if any.
    pub fn party_role(&self, account_id: Uuid) -> Option<Role> {
        if account_id == self.patient_id {
            Some(Role::Patient)
        } else if account_id == self.doctor_id {
            Some(Role::Doctor)
        } else {
            None
        }
    }

    /// Still PENDING although its visit time has passed.
    pub fn has_lapsed(&self, clinic_now: NaiveDateTime) -> bool {
        self.status == AppointmentStatus::Pending && self.scheduled_at <= clinic_now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 1, 10)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn pending() -> Appointment {
        Appointment {
            id: Uuid::new_v4(),
            patient_id: Uuid::new_v4(),
            doctor_id: Uuid::new_v4(),
            scheduled_at: at(10, 0),
            message: None,
            status: AppointmentStatus::Pending,
            cancelled_by: None,
            cancel_reason: None,
            cancelled_at: None,
            resolved_at: None,
            resolved_by: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn party_role_identifies_both_sides() {
        let appt = pending();
        assert_eq!(appt.party_role(appt.patient_id), Some(Role::Patient));
        assert_eq!(appt.party_role(appt.doctor_id), Some(Role::Doctor));
        assert_eq!(appt.party_role(Uuid::new_v4()), None);
    }

    #[test]
    fn lapsed_only_applies_to_pending() {
        let mut appt = pending();
        assert!(!appt.has_lapsed(at(9, 59)));
        assert!(appt.has_lapsed(at(10, 0)));
        appt.status = AppointmentStatus::Resolved;
        assert!(!appt.has_lapsed(at(11, 0)));
    }

    #[test]
    fn serializes_naive_schedule() {
        let json = serde_json::to_value(pending()).unwrap();
        assert_eq!(json["scheduledAt"], "2025-01-10T10:00:00");
        assert_eq!(json["status"], "PENDING");
    }
}
