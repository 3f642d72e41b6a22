use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::db::{parse_optional_timestamp, parse_timestamp, parse_uuid, timestamp, DatabaseError};
use crate::models::*;

const ACCOUNT_SELECT: &str =
    "SELECT a.id, a.role, a.email, a.username, a.status, a.city, a.state,
            a.created_at, a.activated_at, a.deactivated_at,
            d.fullname, d.phone, d.specialization, d.clinic_name, d.clinic_address,
            d.about, d.reg_number, d.profile_image_url,
            d.clinic_open_time, d.clinic_close_time, d.working_days
     FROM accounts a
     LEFT JOIN doctor_profiles d ON d.account_id = a.id";

/// Raw column values; converted outside the rusqlite row closure so
/// parse failures surface as `DatabaseError`.
struct AccountRow {
    id: String,
    role: String,
    email: String,
    username: Option<String>,
    status: String,
    city: Option<String>,
    state: Option<String>,
    created_at: String,
    activated_at: Option<String>,
    deactivated_at: Option<String>,
    fullname: Option<String>,
    phone: Option<String>,
    specialization: Option<String>,
    clinic_name: Option<String>,
    clinic_address: Option<String>,
    about: Option<String>,
    reg_number: Option<String>,
    profile_image_url: Option<String>,
    clinic_open_time: Option<String>,
    clinic_close_time: Option<String>,
    working_days: Option<String>,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<AccountRow> {
    Ok(AccountRow {
        id: row.get(0)?,
        role: row.get(1)?,
        email: row.get(2)?,
        username: row.get(3)?,
        status: row.get(4)?,
        city: row.get(5)?,
        state: row.get(6)?,
        created_at: row.get(7)?,
        activated_at: row.get(8)?,
        deactivated_at: row.get(9)?,
        fullname: row.get(10)?,
        phone: row.get(11)?,
        specialization: row.get(12)?,
        clinic_name: row.get(13)?,
        clinic_address: row.get(14)?,
        about: row.get(15)?,
        reg_number: row.get(16)?,
        profile_image_url: row.get(17)?,
        clinic_open_time: row.get(18)?,
        clinic_close_time: row.get(19)?,
        working_days: row.get(20)?,
    })
}

fn parse_clock(field: &str, raw: Option<String>) -> Result<Option<chrono::NaiveTime>, DatabaseError> {
    raw.map(|s| {
        parse_clock_time(&s).ok_or(DatabaseError::InvalidValue {
            field: field.into(),
            value: s,
        })
    })
    .transpose()
}

impl AccountRow {
    fn into_account(self) -> Result<Account, DatabaseError> {
        let role: Role = self.role.parse()?;
        let profile = match role {
            Role::Patient => AccountProfile::Patient(PatientProfile {
                username: self.username.unwrap_or_default(),
            }),
            Role::Doctor => AccountProfile::Doctor(DoctorProfile {
                fullname: self.fullname.ok_or_else(|| DatabaseError::NotFound {
                    entity_type: "DoctorProfile".into(),
                    id: self.id.clone(),
                })?,
                phone: self.phone,
                specialization: self.specialization.unwrap_or_default(),
                clinic_name: self.clinic_name,
                clinic_address: self.clinic_address,
                about: self.about,
                reg_number: self.reg_number,
                profile_image_url: self.profile_image_url,
                clinic_open_time: parse_clock("clinic_open_time", self.clinic_open_time)?,
                clinic_close_time: parse_clock("clinic_close_time", self.clinic_close_time)?,
                working_days: split_weekdays(self.working_days.as_deref().unwrap_or(""))?,
            }),
        };

        Ok(Account {
            id: parse_uuid("accounts.id", &self.id)?,
            email: self.email,
            status: self.status.parse()?,
            city: self.city,
            state: self.state,
            created_at: parse_timestamp("accounts.created_at", &self.created_at)?,
            activated_at: parse_optional_timestamp("accounts.activated_at", self.activated_at)?,
            deactivated_at: parse_optional_timestamp(
                "accounts.deactivated_at",
                self.deactivated_at,
            )?,
            profile,
        })
    }
}

fn username_of(account: &Account) -> Option<&str> {
    match &account.profile {
        AccountProfile::Patient(p) => Some(p.username.as_str()),
        AccountProfile::Doctor(_) => None,
    }
}

fn upsert_doctor_profile(
    conn: &Connection,
    account_id: &Uuid,
    doctor: &DoctorProfile,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO doctor_profiles (account_id, fullname, phone, specialization, clinic_name,
             clinic_address, about, reg_number, profile_image_url, clinic_open_time,
             clinic_close_time, working_days)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(account_id) DO UPDATE SET
             fullname = excluded.fullname,
             phone = excluded.phone,
             specialization = excluded.specialization,
             clinic_name = excluded.clinic_name,
             clinic_address = excluded.clinic_address,
             about = excluded.about,
             reg_number = excluded.reg_number,
             profile_image_url = excluded.profile_image_url,
             clinic_open_time = excluded.clinic_open_time,
             clinic_close_time = excluded.clinic_close_time,
             working_days = excluded.working_days",
        params![
            account_id.to_string(),
            doctor.fullname,
            doctor.phone,
            doctor.specialization,
            doctor.clinic_name,
            doctor.clinic_address,
            doctor.about,
            doctor.reg_number,
            doctor.profile_image_url,
            doctor.clinic_open_time.as_ref().map(format_clock_time),
            doctor.clinic_close_time.as_ref().map(format_clock_time),
            join_weekdays(&doctor.working_days),
        ],
    )?;
    Ok(())
}

pub fn insert_account(
    conn: &Connection,
    account: &Account,
    password_hash: &str,
) -> Result<(), DatabaseError> {
    let created = timestamp(&account.created_at);
    conn.execute(
        "INSERT INTO accounts (id, role, email, username, password_hash, status, city, state,
             created_at, updated_at, activated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9, ?10)",
        params![
            account.id.to_string(),
            account.role().as_str(),
            account.email,
            username_of(account),
            password_hash,
            account.status.as_str(),
            account.city,
            account.state,
            created,
            account.activated_at.as_ref().map(timestamp),
        ],
    )?;
    if let AccountProfile::Doctor(doctor) = &account.profile {
        upsert_doctor_profile(conn, &account.id, doctor)?;
    }
    Ok(())
}

/// Overwrite a registration that was never verified. Returns `false` when
/// the row is no longer pending.
pub fn replace_pending_account(
    conn: &Connection,
    account: &Account,
    password_hash: &str,
    now: &DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let updated = conn.execute(
        "UPDATE accounts
         SET role = ?2, username = ?3, password_hash = ?4, city = ?5, state = ?6, updated_at = ?7
         WHERE id = ?1 AND status = 'pending_verification'",
        params![
            account.id.to_string(),
            account.role().as_str(),
            username_of(account),
            password_hash,
            account.city,
            account.state,
            timestamp(now),
        ],
    )?;
    if updated == 0 {
        return Ok(false);
    }
    match &account.profile {
        AccountProfile::Doctor(doctor) => upsert_doctor_profile(conn, &account.id, doctor)?,
        AccountProfile::Patient(_) => {
            conn.execute(
                "DELETE FROM doctor_profiles WHERE account_id = ?1",
                params![account.id.to_string()],
            )?;
        }
    }
    Ok(true)
}

pub fn get_account(conn: &Connection, id: &Uuid) -> Result<Option<Account>, DatabaseError> {
    let row = conn
        .query_row(
            &format!("{ACCOUNT_SELECT} WHERE a.id = ?1"),
            params![id.to_string()],
            read_row,
        )
        .optional()?;
    row.map(AccountRow::into_account).transpose()
}

/// Lookup by already-normalized email.
pub fn find_account_by_email(
    conn: &Connection,
    email: &str,
) -> Result<Option<Account>, DatabaseError> {
    let row = conn
        .query_row(
            &format!("{ACCOUNT_SELECT} WHERE a.email = ?1"),
            params![email],
            read_row,
        )
        .optional()?;
    row.map(AccountRow::into_account).transpose()
}

pub fn get_password_hash(conn: &Connection, id: &Uuid) -> Result<Option<String>, DatabaseError> {
    let hash = conn
        .query_row(
            "SELECT password_hash FROM accounts WHERE id = ?1",
            params![id.to_string()],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(hash)
}

/// Whether `username` is held by an account other than `except`.
pub fn username_in_use(
    conn: &Connection,
    username: &str,
    except: Option<&Uuid>,
) -> Result<bool, DatabaseError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM accounts WHERE username = ?1 AND (?2 IS NULL OR id != ?2)",
        params![username, except.map(|id| id.to_string())],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// PENDING_VERIFICATION → ACTIVE. Returns `false` if the account was not pending.
pub fn activate_account(
    conn: &Connection,
    id: &Uuid,
    now: &DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let ts = timestamp(now);
    let updated = conn.execute(
        "UPDATE accounts SET status = 'active', activated_at = ?2, updated_at = ?2
         WHERE id = ?1 AND status = 'pending_verification'",
        params![id.to_string(), ts],
    )?;
    Ok(updated == 1)
}

pub fn deactivate_account(
    conn: &Connection,
    id: &Uuid,
    now: &DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let ts = timestamp(now);
    let updated = conn.execute(
        "UPDATE accounts SET deactivated_at = ?2, updated_at = ?2
         WHERE id = ?1 AND deactivated_at IS NULL",
        params![id.to_string(), ts],
    )?;
    Ok(updated == 1)
}

/// Persist the mutable profile fields of an existing account.
pub fn update_account_profile(
    conn: &Connection,
    account: &Account,
    now: &DateTime<Utc>,
) -> Result<(), DatabaseError> {
    let updated = conn.execute(
        "UPDATE accounts SET username = ?2, city = ?3, state = ?4, updated_at = ?5 WHERE id = ?1",
        params![
            account.id.to_string(),
            username_of(account),
            account.city,
            account.state,
            timestamp(now),
        ],
    )?;
    if updated == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "Account".into(),
            id: account.id.to_string(),
        });
    }
    if let AccountProfile::Doctor(doctor) = &account.profile {
        upsert_doctor_profile(conn, &account.id, doctor)?;
    }
    Ok(())
}

pub fn update_password_hash(
    conn: &Connection,
    id: &Uuid,
    password_hash: &str,
    now: &DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE accounts SET password_hash = ?2, updated_at = ?3 WHERE id = ?1",
        params![id.to_string(), password_hash, timestamp(now)],
    )?;
    Ok(())
}

/// Directory filters. `None` means "any"; matches are case-insensitive and exact.
#[derive(Debug, Clone, Default)]
pub struct DoctorFilter {
    pub city: Option<String>,
    pub state: Option<String>,
    pub specialization: Option<String>,
}

/// Active, non-deactivated doctors matching `filter`, ordered by name.
/// Returns the page plus the total match count.
pub fn search_doctors(
    conn: &Connection,
    filter: &DoctorFilter,
    page: &PageRequest,
) -> Result<(Vec<Account>, u64), DatabaseError> {
    let conditions = "a.role = 'doctor' AND a.status = 'active' AND a.deactivated_at IS NULL
         AND (?1 IS NULL OR a.city = ?1 COLLATE NOCASE)
         AND (?2 IS NULL OR a.state = ?2 COLLATE NOCASE)
         AND (?3 IS NULL OR d.specialization = ?3 COLLATE NOCASE)";

    let total: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM accounts a
             LEFT JOIN doctor_profiles d ON d.account_id = a.id
             WHERE {conditions}"
        ),
        params![filter.city, filter.state, filter.specialization],
        |row| row.get(0),
    )?;

    let mut stmt = conn.prepare(&format!(
        "{ACCOUNT_SELECT} WHERE {conditions}
         ORDER BY d.fullname COLLATE NOCASE, a.id
         LIMIT ?4 OFFSET ?5"
    ))?;
    let rows = stmt.query_map(
        params![
            filter.city,
            filter.state,
            filter.specialization,
            page.limit(),
            page.offset(),
        ],
        read_row,
    )?;

    let mut doctors = Vec::new();
    for row in rows {
        doctors.push(row.map_err(DatabaseError::from)?.into_account()?);
    }
    Ok((doctors, u64::try_from(total).unwrap_or(0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::open_memory_database;
    use chrono::Weekday;

    fn patient(email: &str, username: &str) -> Account {
        Account {
            id: Uuid::new_v4(),
            email: email.into(),
            status: AccountStatus::PendingVerification,
            city: Some("Pune".into()),
            state: Some("MH".into()),
            created_at: Utc::now(),
            activated_at: None,
            deactivated_at: None,
            profile: AccountProfile::Patient(PatientProfile {
                username: username.into(),
            }),
        }
    }

    fn doctor(email: &str, fullname: &str, specialization: &str) -> Account {
        Account {
            id: Uuid::new_v4(),
            email: email.into(),
            status: AccountStatus::Active,
            city: Some("Pune".into()),
            state: Some("MH".into()),
            created_at: Utc::now(),
            activated_at: Some(Utc::now()),
            deactivated_at: None,
            profile: AccountProfile::Doctor(DoctorProfile {
                fullname: fullname.into(),
                phone: None,
                specialization: specialization.into(),
                clinic_name: Some("City Clinic".into()),
                clinic_address: None,
                about: None,
                reg_number: None,
                profile_image_url: None,
                clinic_open_time: parse_clock_time("09:00"),
                clinic_close_time: parse_clock_time("17:00"),
                working_days: vec![Weekday::Mon, Weekday::Fri],
            }),
        }
    }

    #[test]
    fn insert_and_get_patient() {
        let conn = open_memory_database().unwrap();
        let account = patient("ana@x.com", "ana");
        insert_account(&conn, &account, "hash").unwrap();

        let loaded = get_account(&conn, &account.id).unwrap().unwrap();
        assert_eq!(loaded.email, "ana@x.com");
        assert_eq!(loaded.role(), Role::Patient);
        assert_eq!(loaded.status, AccountStatus::PendingVerification);
        assert_eq!(get_password_hash(&conn, &account.id).unwrap().unwrap(), "hash");
    }

    #[test]
    fn doctor_profile_round_trips() {
        let conn = open_memory_database().unwrap();
        let account = doctor("rao@x.com", "Dr. Rao", "Cardiology");
        insert_account(&conn, &account, "hash").unwrap();

        let loaded = find_account_by_email(&conn, "rao@x.com").unwrap().unwrap();
        assert_eq!(loaded.profile, account.profile);
    }

    #[test]
    fn duplicate_email_is_unique_violation() {
        let conn = open_memory_database().unwrap();
        insert_account(&conn, &patient("ana@x.com", "ana"), "h").unwrap();
        let err = insert_account(&conn, &patient("ana@x.com", "ana2"), "h").unwrap_err();
        assert!(err.is_unique_violation());
    }

    #[test]
    fn activate_only_once() {
        let conn = open_memory_database().unwrap();
        let account = patient("ana@x.com", "ana");
        insert_account(&conn, &account, "h").unwrap();
        let now = Utc::now();
        assert!(activate_account(&conn, &account.id, &now).unwrap());
        assert!(!activate_account(&conn, &account.id, &now).unwrap());
        let loaded = get_account(&conn, &account.id).unwrap().unwrap();
        assert_eq!(loaded.status, AccountStatus::Active);
        assert!(loaded.activated_at.is_some());
    }

    #[test]
    fn replace_pending_refuses_active_rows() {
        let conn = open_memory_database().unwrap();
        let mut account = patient("ana@x.com", "ana");
        insert_account(&conn, &account, "h1").unwrap();
        account.city = Some("Goa".into());
        assert!(replace_pending_account(&conn, &account, "h2", &Utc::now()).unwrap());
        assert_eq!(get_password_hash(&conn, &account.id).unwrap().unwrap(), "h2");

        activate_account(&conn, &account.id, &Utc::now()).unwrap();
        assert!(!replace_pending_account(&conn, &account, "h3", &Utc::now()).unwrap());
    }

    #[test]
    fn username_in_use_ignores_self() {
        let conn = open_memory_database().unwrap();
        let account = patient("ana@x.com", "ana");
        insert_account(&conn, &account, "h").unwrap();
        assert!(username_in_use(&conn, "ana", None).unwrap());
        assert!(!username_in_use(&conn, "ana", Some(&account.id)).unwrap());
        assert!(!username_in_use(&conn, "bob", None).unwrap());
    }

    #[test]
    fn search_filters_case_insensitively() {
        let conn = open_memory_database().unwrap();
        insert_account(&conn, &doctor("a@x.com", "Dr. A", "Cardiology"), "h").unwrap();
        insert_account(&conn, &doctor("b@x.com", "Dr. B", "Dermatology"), "h").unwrap();
        let mut pending = doctor("c@x.com", "Dr. C", "Cardiology");
        pending.status = AccountStatus::PendingVerification;
        pending.activated_at = None;
        insert_account(&conn, &pending, "h").unwrap();

        let filter = DoctorFilter {
            city: Some("pune".into()),
            state: None,
            specialization: Some("cardiology".into()),
        };
        let (found, total) = search_doctors(&conn, &filter, &PageRequest::default()).unwrap();
        assert_eq!(total, 1);
        assert_eq!(found[0].display_name(), "Dr. A");
    }

    #[test]
    fn deactivated_doctors_leave_directory() {
        let conn = open_memory_database().unwrap();
        let account = doctor("a@x.com", "Dr. A", "Cardiology");
        insert_account(&conn, &account, "h").unwrap();
        assert!(deactivate_account(&conn, &account.id, &Utc::now()).unwrap());
        let (found, total) =
            search_doctors(&conn, &DoctorFilter::default(), &PageRequest::default()).unwrap();
        assert!(found.is_empty());
        assert_eq!(total, 0);
    }
}
