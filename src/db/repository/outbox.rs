use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use crate::db::{parse_timestamp, timestamp, DatabaseError};
use crate::models::*;

struct OutboxRow {
    id: i64,
    kind: String,
    recipient: String,
    subject: String,
    sealed_body: Option<Vec<u8>>,
    attempts: i64,
    next_attempt_at: String,
    created_at: String,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<OutboxRow> {
    Ok(OutboxRow {
        id: row.get(0)?,
        kind: row.get(1)?,
        recipient: row.get(2)?,
        subject: row.get(3)?,
        sealed_body: row.get(4)?,
        attempts: row.get(5)?,
        next_attempt_at: row.get(6)?,
        created_at: row.get(7)?,
    })
}

impl OutboxRow {
    fn into_message(self) -> Result<OutboxMessage, DatabaseError> {
        Ok(OutboxMessage {
            id: self.id,
            kind: self.kind.parse()?,
            recipient: self.recipient,
            subject: self.subject,
            sealed_body: self.sealed_body,
            attempts: u32::try_from(self.attempts).unwrap_or(0),
            next_attempt_at: parse_timestamp("outbox.next_attempt_at", &self.next_attempt_at)?,
            created_at: parse_timestamp("outbox.created_at", &self.created_at)?,
        })
    }
}

pub fn insert_outbox_message(
    conn: &Connection,
    kind: MailKind,
    recipient: &str,
    subject: &str,
    sealed_body: &[u8],
    now: &DateTime<Utc>,
) -> Result<i64, DatabaseError> {
    let ts = timestamp(now);
    conn.execute(
        "INSERT INTO outbox (kind, recipient, subject, sealed_body, created_at, next_attempt_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        params![kind.as_str(), recipient, subject, sealed_body, ts],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Undelivered, not abandoned, and due at `now`. Oldest first.
pub fn due_outbox_messages(
    conn: &Connection,
    now: &DateTime<Utc>,
    limit: u32,
) -> Result<Vec<OutboxMessage>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, kind, recipient, subject, sealed_body, attempts, next_attempt_at, created_at
         FROM outbox
         WHERE delivered_at IS NULL AND abandoned_at IS NULL AND next_attempt_at <= ?1
         ORDER BY next_attempt_at ASC, id ASC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![timestamp(now), limit], read_row)?;
    rows.map(|r| r.map_err(DatabaseError::from)?.into_message())
        .collect()
}

/// Record a successful send and wipe the sealed body.
pub fn mark_delivered(conn: &Connection, id: i64, now: &DateTime<Utc>) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE outbox SET delivered_at = ?2, sealed_body = NULL, attempts = attempts + 1,
             last_error = NULL
         WHERE id = ?1",
        params![id, timestamp(now)],
    )?;
    Ok(())
}

/// Record a failed send and when to try again.
pub fn mark_failed(
    conn: &Connection,
    id: i64,
    error: &str,
    next_attempt_at: &DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE outbox SET attempts = attempts + 1, last_error = ?2, next_attempt_at = ?3
         WHERE id = ?1",
        params![id, error, timestamp(next_attempt_at)],
    )?;
    Ok(())
}

/// Give up on a message; the body is wiped.
pub fn mark_abandoned(
    conn: &Connection,
    id: i64,
    error: &str,
    now: &DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE outbox SET attempts = attempts + 1, last_error = ?2, abandoned_at = ?3,
             sealed_body = NULL
         WHERE id = ?1",
        params![id, error, timestamp(now)],
    )?;
    Ok(())
}

/// Delete delivered or abandoned rows finished before `cutoff`.
pub fn prune_outbox(conn: &Connection, cutoff: &DateTime<Utc>) -> Result<usize, DatabaseError> {
    let ts = timestamp(cutoff);
    let deleted = conn.execute(
        "DELETE FROM outbox
         WHERE (delivered_at IS NOT NULL AND delivered_at < ?1)
            OR (abandoned_at IS NOT NULL AND abandoned_at < ?1)",
        params![ts],
    )?;
    Ok(deleted)
}

pub fn count_pending_outbox(conn: &Connection) -> Result<u64, DatabaseError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM outbox WHERE delivered_at IS NULL AND abandoned_at IS NULL",
        [],
        |row| row.get(0),
    )?;
    Ok(u64::try_from(count).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::open_memory_database;
    use chrono::Duration;

    #[test]
    fn due_messages_respect_schedule() {
        let conn = open_memory_database().unwrap();
        let now = Utc::now();
        let id = insert_outbox_message(&conn, MailKind::BookingOtp, "a@x.com", "Code", b"sealed", &now)
            .unwrap();
        assert_eq!(due_outbox_messages(&conn, &now, 10).unwrap().len(), 1);

        mark_failed(&conn, id, "relay down", &(now + Duration::seconds(30))).unwrap();
        assert!(due_outbox_messages(&conn, &now, 10).unwrap().is_empty());
        let retry = due_outbox_messages(&conn, &(now + Duration::seconds(31)), 10).unwrap();
        assert_eq!(retry[0].attempts, 1);
        assert_eq!(retry[0].kind, MailKind::BookingOtp);
    }

    #[test]
    fn delivered_messages_lose_their_body() {
        let conn = open_memory_database().unwrap();
        let now = Utc::now();
        let id = insert_outbox_message(&conn, MailKind::ActivationCode, "a@x.com", "Code", b"sealed", &now)
            .unwrap();
        mark_delivered(&conn, id, &now).unwrap();
        let body: Option<Vec<u8>> = conn
            .query_row("SELECT sealed_body FROM outbox WHERE id = ?1", params![id], |r| r.get(0))
            .unwrap();
        assert!(body.is_none());
        assert_eq!(count_pending_outbox(&conn).unwrap(), 0);
        assert_eq!(prune_outbox(&conn, &(now + Duration::seconds(1))).unwrap(), 1);
    }

    #[test]
    fn abandoned_messages_are_not_due() {
        let conn = open_memory_database().unwrap();
        let now = Utc::now();
        let id = insert_outbox_message(&conn, MailKind::OtpResend, "a@x.com", "Code", b"sealed", &now)
            .unwrap();
        mark_abandoned(&conn, id, "bounced", &now).unwrap();
        assert!(due_outbox_messages(&conn, &now, 10).unwrap().is_empty());
    }
}
