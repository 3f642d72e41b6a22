use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::db::{parse_optional_timestamp, parse_timestamp, timestamp, DatabaseError};
use crate::models::*;

const CHALLENGE_COLUMNS: &str = "id, subject_id, purpose, code_hash, salt, issued_at, expires_at,
     attempts_remaining, state, closed_at";

struct ChallengeRow {
    id: i64,
    subject_id: String,
    purpose: String,
    code_hash: Option<Vec<u8>>,
    salt: Vec<u8>,
    issued_at: String,
    expires_at: String,
    attempts_remaining: i64,
    state: String,
    closed_at: Option<String>,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<ChallengeRow> {
    Ok(ChallengeRow {
        id: row.get(0)?,
        subject_id: row.get(1)?,
        purpose: row.get(2)?,
        code_hash: row.get(3)?,
        salt: row.get(4)?,
        issued_at: row.get(5)?,
        expires_at: row.get(6)?,
        attempts_remaining: row.get(7)?,
        state: row.get(8)?,
        closed_at: row.get(9)?,
    })
}

impl ChallengeRow {
    fn into_challenge(self) -> Result<OtpChallenge, DatabaseError> {
        Ok(OtpChallenge {
            id: self.id,
            subject_id: self.subject_id,
            purpose: self.purpose.parse()?,
            code_hash: self.code_hash,
            salt: self.salt,
            issued_at: parse_timestamp("otp_challenges.issued_at", &self.issued_at)?,
            expires_at: parse_timestamp("otp_challenges.expires_at", &self.expires_at)?,
            attempts_remaining: u32::try_from(self.attempts_remaining).unwrap_or(0),
            state: self.state.parse()?,
            closed_at: parse_optional_timestamp("otp_challenges.closed_at", self.closed_at)?,
        })
    }
}

/// Fields of a challenge about to be stored.
pub struct NewChallenge<'a> {
    pub subject_id: &'a str,
    pub purpose: OtpPurpose,
    pub code_hash: &'a [u8],
    pub salt: &'a [u8],
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub attempts: u32,
}

pub fn insert_challenge(conn: &Connection, new: &NewChallenge<'_>) -> Result<i64, DatabaseError> {
    conn.execute(
        "INSERT INTO otp_challenges (subject_id, purpose, code_hash, salt, issued_at, expires_at,
             attempts_remaining, state)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'live')",
        params![
            new.subject_id,
            new.purpose.as_str(),
            new.code_hash,
            new.salt,
            timestamp(&new.issued_at),
            timestamp(&new.expires_at),
            new.attempts,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Most recently issued challenge for (subject, purpose), in any state.
pub fn latest_challenge(
    conn: &Connection,
    subject_id: &str,
    purpose: OtpPurpose,
) -> Result<Option<OtpChallenge>, DatabaseError> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {CHALLENGE_COLUMNS} FROM otp_challenges
                 WHERE subject_id = ?1 AND purpose = ?2
                 ORDER BY id DESC LIMIT 1"
            ),
            params![subject_id, purpose.as_str()],
            read_row,
        )
        .optional()?;
    row.map(ChallengeRow::into_challenge).transpose()
}

/// Close the live challenge (if any) for (subject, purpose) with `state`.
pub fn close_live_challenges(
    conn: &Connection,
    subject_id: &str,
    purpose: OtpPurpose,
    state: ChallengeState,
    now: &DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let closed = conn.execute(
        "UPDATE otp_challenges SET state = ?3, closed_at = ?4
         WHERE subject_id = ?1 AND purpose = ?2 AND state = 'live'",
        params![subject_id, purpose.as_str(), state.as_str(), timestamp(now)],
    )?;
    Ok(closed)
}

/// Compare-and-set a single challenge out of `live`. Returns `true` only for
/// the caller that performed the transition.
pub fn close_challenge(
    conn: &Connection,
    id: i64,
    state: ChallengeState,
    now: &DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let closed = conn.execute(
        "UPDATE otp_challenges SET state = ?2, closed_at = ?3 WHERE id = ?1 AND state = 'live'",
        params![id, state.as_str(), timestamp(now)],
    )?;
    Ok(closed == 1)
}

/// Burn one attempt. Returns the attempts left, or `None` if the challenge
/// was no longer live or already at zero.
pub fn decrement_attempts(conn: &Connection, id: i64) -> Result<Option<u32>, DatabaseError> {
    let updated = conn.execute(
        "UPDATE otp_challenges SET attempts_remaining = attempts_remaining - 1
         WHERE id = ?1 AND state = 'live' AND attempts_remaining > 0",
        params![id],
    )?;
    if updated == 0 {
        return Ok(None);
    }
    let remaining: i64 = conn.query_row(
        "SELECT attempts_remaining FROM otp_challenges WHERE id = ?1",
        params![id],
        |row| row.get(0),
    )?;
    Ok(Some(u32::try_from(remaining).unwrap_or(0)))
}

/// Archive every live challenge whose expiry has passed.
pub fn expire_overdue_challenges(conn: &Connection, now: &DateTime<Utc>) -> Result<usize, DatabaseError> {
    let ts = timestamp(now);
    let expired = conn.execute(
        "UPDATE otp_challenges SET state = 'expired', closed_at = ?1
         WHERE state = 'live' AND expires_at <= ?1",
        params![ts],
    )?;
    Ok(expired)
}

/// Delete superseded/expired challenges closed before `cutoff`.
pub fn delete_closed_challenges(
    conn: &Connection,
    cutoff: &DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let deleted = conn.execute(
        "DELETE FROM otp_challenges
         WHERE state IN ('superseded', 'expired') AND closed_at < ?1",
        params![timestamp(cutoff)],
    )?;
    Ok(deleted)
}

/// Drop the code hash of consumed challenges closed before `cutoff`.
/// The row stays as history.
pub fn wipe_consumed_hashes(
    conn: &Connection,
    cutoff: &DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let wiped = conn.execute(
        "UPDATE otp_challenges SET code_hash = NULL
         WHERE state = 'consumed' AND closed_at < ?1 AND code_hash IS NOT NULL",
        params![timestamp(cutoff)],
    )?;
    Ok(wiped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::open_memory_database;
    use chrono::Duration;

    fn insert(conn: &Connection, subject: &str, now: DateTime<Utc>) -> i64 {
        insert_challenge(
            conn,
            &NewChallenge {
                subject_id: subject,
                purpose: OtpPurpose::AccountActivation,
                code_hash: &[1, 2, 3],
                salt: &[9; 16],
                issued_at: now,
                expires_at: now + Duration::minutes(10),
                attempts: 5,
            },
        )
        .unwrap()
    }

    #[test]
    fn only_one_live_challenge_per_subject() {
        let conn = open_memory_database().unwrap();
        let now = Utc::now();
        insert(&conn, "s1", now);
        let second = insert_challenge(
            &conn,
            &NewChallenge {
                subject_id: "s1",
                purpose: OtpPurpose::AccountActivation,
                code_hash: &[4],
                salt: &[0; 16],
                issued_at: now,
                expires_at: now,
                attempts: 5,
            },
        );
        assert!(second.unwrap_err().is_unique_violation());

        // Same subject, other purpose is independent.
        insert_challenge(
            &conn,
            &NewChallenge {
                subject_id: "s1",
                purpose: OtpPurpose::AppointmentResolution,
                code_hash: &[4],
                salt: &[0; 16],
                issued_at: now,
                expires_at: now,
                attempts: 5,
            },
        )
        .unwrap();
    }

    #[test]
    fn close_challenge_is_compare_and_set() {
        let conn = open_memory_database().unwrap();
        let now = Utc::now();
        let id = insert(&conn, "s1", now);
        assert!(close_challenge(&conn, id, ChallengeState::Consumed, &now).unwrap());
        assert!(!close_challenge(&conn, id, ChallengeState::Consumed, &now).unwrap());
        let latest = latest_challenge(&conn, "s1", OtpPurpose::AccountActivation)
            .unwrap()
            .unwrap();
        assert_eq!(latest.state, ChallengeState::Consumed);
        assert!(latest.closed_at.is_some());
    }

    #[test]
    fn decrement_stops_at_zero() {
        let conn = open_memory_database().unwrap();
        let id = insert(&conn, "s1", Utc::now());
        for expected in (0..5).rev() {
            assert_eq!(decrement_attempts(&conn, id).unwrap(), Some(expected));
        }
        assert_eq!(decrement_attempts(&conn, id).unwrap(), None);
    }

    #[test]
    fn sweep_and_purge() {
        let conn = open_memory_database().unwrap();
        let t0 = Utc::now();
        let stale = insert(&conn, "stale", t0);
        let used = insert(&conn, "used", t0);
        close_challenge(&conn, used, ChallengeState::Consumed, &t0).unwrap();

        let later = t0 + Duration::minutes(11);
        assert_eq!(expire_overdue_challenges(&conn, &later).unwrap(), 1);
        let row = latest_challenge(&conn, "stale", OtpPurpose::AccountActivation)
            .unwrap()
            .unwrap();
        assert_eq!(row.id, stale);
        assert_eq!(row.state, ChallengeState::Expired);

        let cutoff = later + Duration::seconds(1);
        assert_eq!(delete_closed_challenges(&conn, &cutoff).unwrap(), 1);
        assert_eq!(wipe_consumed_hashes(&conn, &cutoff).unwrap(), 1);
        let consumed = latest_challenge(&conn, "used", OtpPurpose::AccountActivation)
            .unwrap()
            .unwrap();
        assert!(consumed.code_hash.is_none());
        assert_eq!(consumed.state, ChallengeState::Consumed);
        assert!(latest_challenge(&conn, "stale", OtpPurpose::AccountActivation)
            .unwrap()
            .is_none());
    }
}
