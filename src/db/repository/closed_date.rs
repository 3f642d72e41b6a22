use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use uuid::Uuid;

use crate::db::{timestamp, DatabaseError};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// A day on which a doctor takes no bookings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosedDate {
    pub date: NaiveDate,
    pub reason: Option<String>,
}

/// Returns `false` if the date was already closed.
pub fn insert_closed_date(
    conn: &Connection,
    doctor_id: &Uuid,
    date: &NaiveDate,
    reason: Option<&str>,
    now: &DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO doctor_closed_dates (doctor_id, closed_date, reason, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            doctor_id.to_string(),
            date.format(DATE_FORMAT).to_string(),
            reason,
            timestamp(now),
        ],
    )?;
    Ok(inserted == 1)
}

pub fn delete_closed_date(
    conn: &Connection,
    doctor_id: &Uuid,
    date: &NaiveDate,
) -> Result<bool, DatabaseError> {
    let deleted = conn.execute(
        "DELETE FROM doctor_closed_dates WHERE doctor_id = ?1 AND closed_date = ?2",
        params![doctor_id.to_string(), date.format(DATE_FORMAT).to_string()],
    )?;
    Ok(deleted == 1)
}

pub fn is_closed_on(
    conn: &Connection,
    doctor_id: &Uuid,
    date: &NaiveDate,
) -> Result<bool, DatabaseError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM doctor_closed_dates WHERE doctor_id = ?1 AND closed_date = ?2",
        params![doctor_id.to_string(), date.format(DATE_FORMAT).to_string()],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Closed dates on or after `from`, ascending.
pub fn list_closed_dates(
    conn: &Connection,
    doctor_id: &Uuid,
    from: &NaiveDate,
) -> Result<Vec<ClosedDate>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT closed_date, reason FROM doctor_closed_dates
         WHERE doctor_id = ?1 AND closed_date >= ?2
         ORDER BY closed_date ASC",
    )?;
    let rows = stmt
        .query_map(
            params![doctor_id.to_string(), from.format(DATE_FORMAT).to_string()],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)),
        )?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(raw, reason)| {
            NaiveDate::parse_from_str(&raw, DATE_FORMAT)
                .map(|date| ClosedDate { date, reason })
                .map_err(|_| DatabaseError::InvalidValue {
                    field: "doctor_closed_dates.closed_date".into(),
                    value: raw,
                })
        })
        .collect()
}
