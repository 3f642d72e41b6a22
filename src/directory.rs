//! Read-only doctor directory.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::core_state::{CoreError, CoreState};
use crate::db::{self, DatabaseError, DoctorFilter};
use crate::models::{Account, AccountProfile, DoctorProfile, PageRequest, DEFAULT_PAGE_SIZE};

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("{0}")]
    Validation(String),
    #[error("Doctor not found")]
    NotFound,
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl From<DatabaseError> for DirectoryError {
    fn from(e: DatabaseError) -> Self {
        DirectoryError::Core(CoreError::Database(e))
    }
}

/// Query-string filters. Blank values are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DirectoryQuery {
    pub city: Option<String>,
    pub state: Option<String>,
    pub specialization: Option<String>,
    #[serde(default)]
    pub page: u32,
    pub size: Option<u32>,
}

impl DirectoryQuery {
    fn filter(&self) -> DoctorFilter {
        let clean = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        DoctorFilter {
            city: clean(&self.city),
            state: clean(&self.state),
            specialization: clean(&self.specialization),
        }
    }

    fn page(&self) -> PageRequest {
        PageRequest::new(self.page, self.size.unwrap_or(DEFAULT_PAGE_SIZE))
    }
}

/// What anyone may see about a doctor. No email, status or credentials.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DoctorCard {
    pub id: Uuid,
    pub city: Option<String>,
    pub state: Option<String>,
    #[serde(flatten)]
    pub profile: DoctorProfile,
}

impl DoctorCard {
    fn from_account(account: Account) -> Option<Self> {
        match account.profile {
            AccountProfile::Doctor(profile) => Some(Self {
                id: account.id,
                city: account.city,
                state: account.state,
                profile,
            }),
            AccountProfile::Patient(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DoctorPage {
    pub doctors: Vec<DoctorCard>,
    pub page: u32,
    pub total_pages: u32,
}

pub fn search(core: &CoreState, query: &DirectoryQuery) -> Result<DoctorPage, DirectoryError> {
    let page = query.page();
    if !page.is_valid() {
        return Err(DirectoryError::Validation(
            "Page size must be between 1 and 100".into(),
        ));
    }
    let filter = query.filter();
    let (accounts, total) = core.read(|conn| {
        db::search_doctors(conn, &filter, &page).map_err(DirectoryError::from)
    })?;
    Ok(DoctorPage {
        doctors: accounts.into_iter().filter_map(DoctorCard::from_account).collect(),
        page: page.page,
        total_pages: page.total_pages(total),
    })
}

/// A single active doctor.
pub fn get_doctor(core: &CoreState, id: &Uuid) -> Result<DoctorCard, DirectoryError> {
    let account = core
        .read(|conn| db::get_account(conn, id).map_err(DirectoryError::from))?
        .filter(Account::is_active)
        .ok_or(DirectoryError::NotFound)?;
    DoctorCard::from_account(account).ok_or(DirectoryError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{AccountStatus, PatientProfile};
    use crate::otp::FixedCodes;
    use crate::scheduling::tests::weekday_doctor;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn core() -> CoreState {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 6, 8, 0, 0).unwrap()));
        CoreState::for_tests(clock, FixedCodes::always("123456"))
    }

    fn add(core: &CoreState, name: &str, city: &str, specialization: &str, active: bool) -> Uuid {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let account = Account {
            id: Uuid::new_v4(),
            email: format!("{name}@clinic.test"),
            status: if active {
                AccountStatus::Active
            } else {
                AccountStatus::PendingVerification
            },
            city: Some(city.into()),
            state: Some("MH".into()),
            created_at: now,
            activated_at: active.then_some(now),
            deactivated_at: None,
            profile: AccountProfile::Doctor(DoctorProfile {
                fullname: name.into(),
                specialization: specialization.into(),
                ..weekday_doctor()
            }),
        };
        core.read(|conn| db::insert_account(conn, &account, "pbkdf2-sha256$1$x$y").map_err(DirectoryError::from))
            .unwrap();
        account.id
    }

    #[test]
    fn filters_are_case_insensitive_and_skip_inactive() {
        let core = core();
        add(&core, "Rao", "Pune", "Cardiology", true);
        add(&core, "Lee", "pune", "Dermatology", true);
        add(&core, "Kim", "Mumbai", "Cardiology", true);
        add(&core, "New", "Pune", "Cardiology", false);

        let query = DirectoryQuery {
            city: Some("PUNE".into()),
            ..DirectoryQuery::default()
        };
        let names: Vec<_> = search(&core, &query)
            .unwrap()
            .doctors
            .into_iter()
            .map(|d| d.profile.fullname)
            .collect();
        assert_eq!(names, vec!["Lee", "Rao"]);

        let query = DirectoryQuery {
            specialization: Some("cardiology".into()),
            city: Some("  ".into()),
            ..DirectoryQuery::default()
        };
        assert_eq!(search(&core, &query).unwrap().doctors.len(), 2);
    }

    #[test]
    fn paging_and_bounds() {
        let core = core();
        for name in ["A", "B", "C"] {
            add(&core, name, "Pune", "ENT", true);
        }
        let page = search(
            &core,
            &DirectoryQuery {
                page: 1,
                size: Some(2),
                ..DirectoryQuery::default()
            },
        )
        .unwrap();
        assert_eq!(page.total_pages, 2);
        assert_eq!(page.doctors.len(), 1);

        assert!(matches!(
            search(
                &core,
                &DirectoryQuery {
                    size: Some(500),
                    ..DirectoryQuery::default()
                }
            ),
            Err(DirectoryError::Validation(_))
        ));
    }

    #[test]
    fn card_hides_private_fields() {
        let core = core();
        let id = add(&core, "Rao", "Pune", "ENT", true);
        let card = get_doctor(&core, &id).unwrap();
        let json = serde_json::to_value(&card).unwrap();
        assert_eq!(json["fullname"], "Rao");
        assert_eq!(json["clinicOpenTime"], "09:00");
        for hidden in ["email", "status", "passwordHash", "role"] {
            assert!(json.get(hidden).is_none(), "{hidden} leaked");
        }
    }

    #[test]
    fn get_doctor_rejects_patients_and_pending() {
        let core = core();
        let pending = add(&core, "New", "Pune", "ENT", false);
        assert!(matches!(get_doctor(&core, &pending), Err(DirectoryError::NotFound)));
        assert!(matches!(get_doctor(&core, &Uuid::new_v4()), Err(DirectoryError::NotFound)));

        let now = Utc::now();
        let patient = Account {
            id: Uuid::new_v4(),
            email: "ana@x.com".into(),
            status: AccountStatus::Active,
            city: None,
            state: None,
            created_at: now,
            activated_at: Some(now),
            deactivated_at: None,
            profile: AccountProfile::Patient(PatientProfile { username: "ana".into() }),
        };
        core.read(|conn| db::insert_account(conn, &patient, "x").map_err(DirectoryError::from))
            .unwrap();
        assert!(matches!(get_doctor(&core, &patient.id), Err(DirectoryError::NotFound)));
    }
}
