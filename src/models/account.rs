use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::Serialize;
use uuid::Uuid;

use super::enums::{AccountStatus, Role};
use crate::db::DatabaseError;

/// An identity record. The role-specific half lives in `profile`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: Uuid,
    pub email: String,
    pub status: AccountStatus,
    pub city: Option<String>,
    pub state: Option<String>,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deactivated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub profile: AccountProfile,
}

impl Account {
    pub fn role(&self) -> Role {
        match self.profile {
            AccountProfile::Patient(_) => Role::Patient,
            AccountProfile::Doctor(_) => Role::Doctor,
        }
    }

    /// Verified and not soft-deactivated.
    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active && self.deactivated_at.is_none()
    }

    pub fn display_name(&self) -> &str {
        match &self.profile {
            AccountProfile::Patient(p) => &p.username,
            AccountProfile::Doctor(d) => &d.fullname,
        }
    }

    pub fn as_doctor(&self) -> Option<&DoctorProfile> {
        match &self.profile {
            AccountProfile::Doctor(d) => Some(d),
            AccountProfile::Patient(_) => None,
        }
    }
}

/// Role-tagged profile. Serialized with a `role` discriminator.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "role", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountProfile {
    Patient(PatientProfile),
    Doctor(DoctorProfile),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PatientProfile {
    pub username: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DoctorProfile {
    pub fullname: String,
    pub phone: Option<String>,
    pub specialization: String,
    pub clinic_name: Option<String>,
    pub clinic_address: Option<String>,
    pub about: Option<String>,
    pub reg_number: Option<String>,
    pub profile_image_url: Option<String>,
    #[serde(with = "clock_time")]
    pub clinic_open_time: Option<NaiveTime>,
    #[serde(with = "clock_time")]
    pub clinic_close_time: Option<NaiveTime>,
    #[serde(with = "weekday_list")]
    pub working_days: Vec<Weekday>,
}

impl DoctorProfile {
    /// Opening hours as a half-open `[open, close)` window, if declared.
    pub fn clinic_hours(&self) -> Option<(NaiveTime, NaiveTime)> {
        match (self.clinic_open_time, self.clinic_close_time) {
            (Some(open), Some(close)) if open < close => Some((open, close)),
            _ => None,
        }
    }
}

// ─── Clinic hours ─────────────────────────────────────────────────────────────

/// Parse `HH:MM` or `HH:MM:SS`.
pub fn parse_clock_time(s: &str) -> Option<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .ok()
}

pub fn format_clock_time(t: &NaiveTime) -> String {
    t.format("%H:%M").to_string()
}

/// Serde adapter: `Option<NaiveTime>` as `"HH:MM"`.
pub mod clock_time {
    use chrono::NaiveTime;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<NaiveTime>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(t) => s.serialize_some(&super::format_clock_time(t)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<NaiveTime>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        raw.map(|s| {
            super::parse_clock_time(&s)
                .ok_or_else(|| D::Error::custom(format!("invalid time '{s}', expected HH:MM")))
        })
        .transpose()
    }
}

// ─── Working days ─────────────────────────────────────────────────────────────

pub fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "MONDAY",
        Weekday::Tue => "TUESDAY",
        Weekday::Wed => "WEDNESDAY",
        Weekday::Thu => "THURSDAY",
        Weekday::Fri => "FRIDAY",
        Weekday::Sat => "SATURDAY",
        Weekday::Sun => "SUNDAY",
    }
}

/// Accepts full or three-letter day names in any case.
pub fn parse_weekday(s: &str) -> Option<Weekday> {
    match s.trim().to_ascii_uppercase().as_str() {
        "MONDAY" | "MON" => Some(Weekday::Mon),
        "TUESDAY" | "TUE" => Some(Weekday::Tue),
        "WEDNESDAY" | "WED" => Some(Weekday::Wed),
        "THURSDAY" | "THU" => Some(Weekday::Thu),
        "FRIDAY" | "FRI" => Some(Weekday::Fri),
        "SATURDAY" | "SAT" => Some(Weekday::Sat),
        "SUNDAY" | "SUN" => Some(Weekday::Sun),
        _ => None,
    }
}

/// Storage form: comma-separated upper-case names, duplicates removed.
pub fn join_weekdays(days: &[Weekday]) -> String {
    let mut seen: Vec<Weekday> = Vec::with_capacity(days.len());
    for day in days {
        if !seen.contains(day) {
            seen.push(*day);
        }
    }
    seen.iter()
        .map(|d| weekday_name(*d))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn split_weekdays(stored: &str) -> Result<Vec<Weekday>, DatabaseError> {
    stored
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            parse_weekday(s).ok_or_else(|| DatabaseError::InvalidEnum {
                field: "working_days".into(),
                value: s.into(),
            })
        })
        .collect()
}

/// Serde adapter: `Vec<Weekday>` as `["MONDAY", ...]`.
pub mod weekday_list {
    use chrono::Weekday;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(days: &[Weekday], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(days.iter().map(|d| super::weekday_name(*d)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Weekday>, D::Error> {
        let raw = Vec::<String>::deserialize(d)?;
        raw.iter()
            .map(|s| {
                super::parse_weekday(s)
                    .ok_or_else(|| D::Error::custom(format!("unknown weekday '{s}'")))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patient() -> Account {
        Account {
            id: Uuid::nil(),
            email: "ana@x.com".into(),
            status: AccountStatus::Active,
            city: Some("Pune".into()),
            state: None,
            created_at: Utc::now(),
            activated_at: None,
            deactivated_at: None,
            profile: AccountProfile::Patient(PatientProfile {
                username: "ana".into(),
            }),
        }
    }

    #[test]
    fn account_serializes_role_tag() {
        let json = serde_json::to_value(patient()).unwrap();
        assert_eq!(json["role"], "PATIENT");
        assert_eq!(json["username"], "ana");
        assert_eq!(json["status"], "ACTIVE");
        assert!(json.get("deactivatedAt").is_none());
    }

    #[test]
    fn deactivated_account_is_not_active() {
        let mut account = patient();
        assert!(account.is_active());
        account.deactivated_at = Some(Utc::now());
        assert!(!account.is_active());
    }

    #[test]
    fn weekday_parsing_accepts_short_and_long_names() {
        assert_eq!(parse_weekday("monday"), Some(Weekday::Mon));
        assert_eq!(parse_weekday(" FRI "), Some(Weekday::Fri));
        assert_eq!(parse_weekday("someday"), None);
    }

    #[test]
    fn weekdays_join_and_split() {
        let stored = join_weekdays(&[Weekday::Mon, Weekday::Wed, Weekday::Mon]);
        assert_eq!(stored, "MONDAY,WEDNESDAY");
        assert_eq!(split_weekdays(&stored).unwrap(), vec![Weekday::Mon, Weekday::Wed]);
        assert!(split_weekdays("").unwrap().is_empty());
        assert!(split_weekdays("MONDAY,NOPE").is_err());
    }

    #[test]
    fn clinic_hours_require_open_before_close() {
        let mut doctor = DoctorProfile {
            fullname: "Dr. Rao".into(),
            phone: None,
            specialization: "Cardiology".into(),
            clinic_name: None,
            clinic_address: None,
            about: None,
            reg_number: None,
            profile_image_url: None,
            clinic_open_time: parse_clock_time("09:00"),
            clinic_close_time: parse_clock_time("17:00"),
            working_days: vec![Weekday::Mon],
        };
        assert!(doctor.clinic_hours().is_some());
        doctor.clinic_close_time = parse_clock_time("08:00");
        assert!(doctor.clinic_hours().is_none());
    }

    #[test]
    fn clock_time_accepts_seconds() {
        assert_eq!(parse_clock_time("10:30:00"), parse_clock_time("10:30"));
        assert!(parse_clock_time("25:00").is_none());
    }
}
