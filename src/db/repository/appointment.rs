use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::db::{
    local_datetime, parse_local_datetime, parse_optional_timestamp, parse_timestamp, parse_uuid,
    timestamp, DatabaseError,
};
use crate::models::*;

const APPOINTMENT_COLUMNS: &str =
    "id, patient_id, doctor_id, scheduled_at, message, status, cancelled_by, cancel_reason,
     cancelled_at, resolved_at, resolved_by, created_at";

struct AppointmentRow {
    id: String,
    patient_id: String,
    doctor_id: String,
    scheduled_at: String,
    message: Option<String>,
    status: String,
    cancelled_by: Option<String>,
    cancel_reason: Option<String>,
    cancelled_at: Option<String>,
    resolved_at: Option<String>,
    resolved_by: Option<String>,
    created_at: String,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<AppointmentRow> {
    Ok(AppointmentRow {
        id: row.get(0)?,
        patient_id: row.get(1)?,
        doctor_id: row.get(2)?,
        scheduled_at: row.get(3)?,
        message: row.get(4)?,
        status: row.get(5)?,
        cancelled_by: row.get(6)?,
        cancel_reason: row.get(7)?,
        cancelled_at: row.get(8)?,
        resolved_at: row.get(9)?,
        resolved_by: row.get(10)?,
        created_at: row.get(11)?,
    })
}

impl AppointmentRow {
    fn into_appointment(self) -> Result<Appointment, DatabaseError> {
        Ok(Appointment {
            id: parse_uuid("appointments.id", &self.id)?,
            patient_id: parse_uuid("appointments.patient_id", &self.patient_id)?,
            doctor_id: parse_uuid("appointments.doctor_id", &self.doctor_id)?,
            scheduled_at: parse_local_datetime("appointments.scheduled_at", &self.scheduled_at)?,
            message: self.message,
            status: self.status.parse()?,
            cancelled_by: self.cancelled_by.map(|r| r.parse()).transpose()?,
            cancel_reason: self.cancel_reason,
            cancelled_at: parse_optional_timestamp("appointments.cancelled_at", self.cancelled_at)?,
            resolved_at: parse_optional_timestamp("appointments.resolved_at", self.resolved_at)?,
            resolved_by: self
                .resolved_by
                .map(|id| parse_uuid("appointments.resolved_by", &id))
                .transpose()?,
            created_at: parse_timestamp("appointments.created_at", &self.created_at)?,
        })
    }
}

fn collect(
    rows: impl Iterator<Item = rusqlite::Result<AppointmentRow>>,
) -> Result<Vec<Appointment>, DatabaseError> {
    rows.map(|r| r.map_err(DatabaseError::from)?.into_appointment())
        .collect()
}

pub fn insert_appointment(conn: &Connection, appt: &Appointment) -> Result<(), DatabaseError> {
    let created = timestamp(&appt.created_at);
    conn.execute(
        "INSERT INTO appointments (id, patient_id, doctor_id, scheduled_at, message, status,
             created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        params![
            appt.id.to_string(),
            appt.patient_id.to_string(),
            appt.doctor_id.to_string(),
            local_datetime(&appt.scheduled_at),
            appt.message,
            appt.status.as_str(),
            created,
        ],
    )?;
    Ok(())
}

pub fn get_appointment(conn: &Connection, id: &Uuid) -> Result<Option<Appointment>, DatabaseError> {
    let row = conn
        .query_row(
            &format!("SELECT {APPOINTMENT_COLUMNS} FROM appointments WHERE id = ?1"),
            params![id.to_string()],
            read_row,
        )
        .optional()?;
    row.map(AppointmentRow::into_appointment).transpose()
}

/// Ids of PENDING/RESOLVED appointments for `doctor_id` that collide with
/// a visit at `at`: same start, or starts closer than `separation`.
pub fn find_conflicting_appointments(
    conn: &Connection,
    doctor_id: &Uuid,
    at: &NaiveDateTime,
    separation: Duration,
) -> Result<Vec<String>, DatabaseError> {
    let lower = *at - separation;
    let upper = *at + separation;
    let mut stmt = conn.prepare(
        "SELECT id FROM appointments
         WHERE doctor_id = ?1
           AND status IN ('pending', 'resolved')
           AND (scheduled_at = ?2 OR (scheduled_at > ?3 AND scheduled_at < ?4))",
    )?;
    let ids = stmt
        .query_map(
            params![
                doctor_id.to_string(),
                local_datetime(at),
                local_datetime(&lower),
                local_datetime(&upper),
            ],
            |row| row.get::<_, String>(0),
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// PENDING → RESOLVED. Returns `false` if the row was not PENDING.
pub fn mark_resolved(
    conn: &Connection,
    id: &Uuid,
    doctor_id: &Uuid,
    now: &DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let ts = timestamp(now);
    let updated = conn.execute(
        "UPDATE appointments
         SET status = 'resolved', resolved_at = ?3, resolved_by = ?2, updated_at = ?3
         WHERE id = ?1 AND status = 'pending'",
        params![id.to_string(), doctor_id.to_string(), ts],
    )?;
    Ok(updated == 1)
}

/// PENDING → CANCELLED. Returns `false` if the row was not PENDING.
pub fn mark_cancelled(
    conn: &Connection,
    id: &Uuid,
    by: Role,
    reason: &str,
    now: &DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let ts = timestamp(now);
    let updated = conn.execute(
        "UPDATE appointments
         SET status = 'cancelled', cancelled_by = ?2, cancel_reason = ?3, cancelled_at = ?4,
             updated_at = ?4
         WHERE id = ?1 AND status = 'pending'",
        params![id.to_string(), by.as_str(), reason, ts],
    )?;
    Ok(updated == 1)
}

/// Which appointment list a party is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    /// PENDING and still in the future, soonest first.
    Upcoming,
    /// RESOLVED, CANCELLED, or PENDING but already past; most recent first.
    History,
}

fn party_column(role: Role) -> &'static str {
    match role {
        Role::Patient => "patient_id",
        Role::Doctor => "doctor_id",
    }
}

/// One page of a party's appointments plus the total number of matches.
pub fn list_for_party(
    conn: &Connection,
    party_id: &Uuid,
    role: Role,
    projection: Projection,
    clinic_now: &NaiveDateTime,
    page: &PageRequest,
) -> Result<(Vec<Appointment>, u64), DatabaseError> {
    let column = party_column(role);
    let (condition, order) = match projection {
        Projection::Upcoming => (
            "status = 'pending' AND scheduled_at > ?2",
            "scheduled_at ASC, id ASC",
        ),
        Projection::History => (
            "(status IN ('resolved', 'cancelled') OR scheduled_at <= ?2)",
            "scheduled_at DESC, id ASC",
        ),
    };
    let now = local_datetime(clinic_now);

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM appointments WHERE {column} = ?1 AND {condition}"),
        params![party_id.to_string(), now],
        |row| row.get(0),
    )?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {APPOINTMENT_COLUMNS} FROM appointments
         WHERE {column} = ?1 AND {condition}
         ORDER BY {order}
         LIMIT ?3 OFFSET ?4"
    ))?;
    let rows = stmt.query_map(
        params![party_id.to_string(), now, page.limit(), page.offset()],
        read_row,
    )?;
    let items = collect(rows)?;
    Ok((items, u64::try_from(total).unwrap_or(0)))
}
