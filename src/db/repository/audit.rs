use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::db::{timestamp, DatabaseError};
use crate::models::AuditEntry;

/// Insert a batch of audit entries into the audit_log table.
pub fn insert_audit_entries(conn: &Connection, entries: &[AuditEntry]) -> Result<(), DatabaseError> {
    let mut stmt = conn.prepare(
        "INSERT INTO audit_log (timestamp, account_id, role, action, outcome)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for entry in entries {
        stmt.execute(params![
            timestamp(&entry.timestamp),
            entry.account_id,
            entry.role.map(|r| r.as_str()),
            entry.action,
            entry.outcome,
        ])?;
    }
    Ok(())
}

/// Prune audit entries recorded before `cutoff`.
pub fn prune_audit_log(conn: &Connection, cutoff: &DateTime<Utc>) -> Result<usize, DatabaseError> {
    let deleted = conn.execute(
        "DELETE FROM audit_log WHERE timestamp < ?1",
        params![timestamp(cutoff)],
    )?;
    Ok(deleted)
}
