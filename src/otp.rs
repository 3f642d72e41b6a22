//! One-time passcode ledger.
//!
//! A challenge binds a six-digit code to a (subject, purpose) pair. Only
//! an HMAC of the code is stored; the plaintext leaves through
//! [`IssuedOtp`] and nowhere else. At most one challenge per pair is
//! `live` at any time: issuing a new one supersedes the previous.
//!
//! All operations take the caller's `&Connection`, so the ledger write
//! commits or rolls back together with the transition it gates.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use rusqlite::Connection;
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::config::AppConfig;
use crate::core_state::TxOutcome;
use crate::crypto::{generate_salt, keyed_digest, CryptoError, KEY_LENGTH};
use crate::db::{self, DatabaseError, NewChallenge};
use crate::models::{ChallengeState, OtpChallenge, OtpPurpose};

pub const CODE_DIGITS: usize = 6;

/// Source of plaintext codes.
pub trait CodeGenerator: Send + Sync {
    fn generate(&self) -> Zeroizing<String>;
}

/// Uniform over 000000–999999 from the OS CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomCodes;

impl CodeGenerator for RandomCodes {
    fn generate(&self) -> Zeroizing<String> {
        let n = rand::rngs::OsRng.gen_range(0..1_000_000u32);
        Zeroizing::new(format!("{n:06}"))
    }
}

/// Hands out a scripted sequence of codes, repeating the last one.
#[cfg(test)]
pub struct FixedCodes {
    codes: std::sync::Mutex<std::collections::VecDeque<String>>,
    last: std::sync::Mutex<String>,
}

#[cfg(test)]
impl FixedCodes {
    pub fn new(codes: &[&str]) -> Self {
        Self {
            codes: std::sync::Mutex::new(codes.iter().map(|c| c.to_string()).collect()),
            last: std::sync::Mutex::new(codes.last().copied().unwrap_or("000000").to_string()),
        }
    }

    pub fn always(code: &str) -> Self {
        Self::new(&[code])
    }
}

#[cfg(test)]
impl CodeGenerator for FixedCodes {
    fn generate(&self) -> Zeroizing<String> {
        let next = self.codes.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(code) = next {
            *last = code;
        }
        Zeroizing::new(last.clone())
    }
}

/// Ledger timing and lockout parameters.
#[derive(Debug, Clone, Copy)]
pub struct OtpPolicy {
    pub ttl: Duration,
    pub max_attempts: u32,
    pub resend_cooldown: Duration,
    /// How long closed challenges are kept before the sweeper removes them.
    pub retention: Duration,
}

impl OtpPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            ttl: config.otp_ttl,
            max_attempts: config.otp_max_attempts,
            resend_cooldown: config.otp_resend_cooldown,
            retention: config.otp_retention,
        }
    }
}

impl Default for OtpPolicy {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

#[derive(Error, Debug)]
pub enum OtpError {
    #[error("No active code for this request")]
    NotFound,

    #[error("Code has expired")]
    Expired,

    #[error("Too many incorrect attempts")]
    AttemptsExhausted,

    #[error("Incorrect code ({attempts_remaining} attempts remaining)")]
    Mismatch { attempts_remaining: u32 },

    #[error("Code has already been used")]
    AlreadyConsumed,

    #[error("A new code was sent recently; retry in {retry_after_secs}s")]
    TooSoon { retry_after_secs: u64 },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl TxOutcome for OtpError {
    /// A wrong guess or an expiry is recorded even though the call fails.
    fn preserves_writes(&self) -> bool {
        matches!(self, OtpError::Mismatch { .. } | OtpError::Expired)
    }
}

/// A freshly issued challenge. `code` is the only copy of the plaintext.
pub struct IssuedOtp {
    pub challenge_id: i64,
    pub code: Zeroizing<String>,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for IssuedOtp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedOtp")
            .field("challenge_id", &self.challenge_id)
            .field("code", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

pub struct OtpLedger {
    pepper: Zeroizing<[u8; KEY_LENGTH]>,
    policy: OtpPolicy,
    codes: Box<dyn CodeGenerator>,
}

impl OtpLedger {
    pub fn new(pepper: &[u8; KEY_LENGTH], policy: OtpPolicy, codes: Box<dyn CodeGenerator>) -> Self {
        Self {
            pepper: Zeroizing::new(*pepper),
            policy,
            codes,
        }
    }

    pub fn policy(&self) -> &OtpPolicy {
        &self.policy
    }

    fn digest(
        &self,
        salt: &[u8],
        subject_id: &str,
        purpose: OtpPurpose,
        code: &str,
    ) -> Result<[u8; 32], CryptoError> {
        keyed_digest(
            self.pepper.as_slice(),
            &[
                salt,
                subject_id.as_bytes(),
                purpose.as_str().as_bytes(),
                code.as_bytes(),
            ],
        )
    }

    /// Supersede any live challenge for (subject, purpose) and store a new one.
    pub fn issue(
        &self,
        conn: &Connection,
        subject_id: &str,
        purpose: OtpPurpose,
        now: DateTime<Utc>,
    ) -> Result<IssuedOtp, OtpError> {
        let superseded =
            db::close_live_challenges(conn, subject_id, purpose, ChallengeState::Superseded, &now)?;

        let code = self.codes.generate();
        let salt = generate_salt();
        let hash = self.digest(&salt, subject_id, purpose, &code)?;
        let expires_at = now + self.policy.ttl;

        let challenge_id = db::insert_challenge(
            conn,
            &NewChallenge {
                subject_id,
                purpose,
                code_hash: &hash,
                salt: &salt,
                issued_at: now,
                expires_at,
                attempts: self.policy.max_attempts,
            },
        )?;

        tracing::debug!(
            subject_id,
            purpose = %purpose,
            challenge_id,
            superseded,
            "OTP challenge issued"
        );
        Ok(IssuedOtp {
            challenge_id,
            code,
            expires_at,
        })
    }

    /// `issue`, refused while the latest challenge is younger than the cooldown.
    pub fn resend(
        &self,
        conn: &Connection,
        subject_id: &str,
        purpose: OtpPurpose,
        now: DateTime<Utc>,
    ) -> Result<IssuedOtp, OtpError> {
        if let Some(latest) = db::latest_challenge(conn, subject_id, purpose)? {
            let ready_at = latest.issued_at + self.policy.resend_cooldown;
            if now < ready_at {
                let wait_ms = (ready_at - now).num_milliseconds().max(0);
                let retry_after_secs = u64::try_from((wait_ms + 999) / 1000).unwrap_or(1).max(1);
                tracing::debug!(subject_id, purpose = %purpose, retry_after_secs, "OTP resend refused");
                return Err(OtpError::TooSoon { retry_after_secs });
            }
        }
        self.issue(conn, subject_id, purpose, now)
    }

    /// Check `candidate` against the current challenge. Succeeds at most once
    /// per challenge.
    pub fn validate(
        &self,
        conn: &Connection,
        subject_id: &str,
        purpose: OtpPurpose,
        candidate: &str,
        now: DateTime<Utc>,
    ) -> Result<(), OtpError> {
        let challenge = db::latest_challenge(conn, subject_id, purpose)?.ok_or(OtpError::NotFound)?;

        match challenge.state {
            ChallengeState::Consumed => return Err(OtpError::AlreadyConsumed),
            ChallengeState::Expired | ChallengeState::Superseded => return Err(OtpError::NotFound),
            ChallengeState::Live => {}
        }

        if challenge.is_past_expiry(now) {
            db::close_challenge(conn, challenge.id, ChallengeState::Expired, &now)?;
            tracing::info!(subject_id, purpose = %purpose, "OTP challenge expired");
            return Err(OtpError::Expired);
        }

        if challenge.attempts_remaining == 0 {
            return Err(OtpError::AttemptsExhausted);
        }

        if !self.matches(&challenge, candidate)? {
            let attempts_remaining = db::decrement_attempts(conn, challenge.id)?.unwrap_or(0);
            tracing::info!(subject_id, purpose = %purpose, attempts_remaining, "OTP mismatch");
            return Err(OtpError::Mismatch { attempts_remaining });
        }

        if !db::close_challenge(conn, challenge.id, ChallengeState::Consumed, &now)? {
            return Err(OtpError::AlreadyConsumed);
        }
        tracing::info!(subject_id, purpose = %purpose, "OTP challenge consumed");
        Ok(())
    }

    fn matches(&self, challenge: &OtpChallenge, candidate: &str) -> Result<bool, OtpError> {
        let Some(stored) = challenge.code_hash.as_deref() else {
            return Ok(false);
        };
        let candidate = Zeroizing::new(candidate.trim().to_string());
        let computed = self.digest(&challenge.salt, &challenge.subject_id, challenge.purpose, &candidate)?;
        Ok(computed.as_slice().ct_eq(stored).into())
    }

    /// Drop the live challenge once its subject can no longer use it.
    pub fn retire(
        &self,
        conn: &Connection,
        subject_id: &str,
        purpose: OtpPurpose,
        now: DateTime<Utc>,
    ) -> Result<usize, OtpError> {
        let retired =
            db::close_live_challenges(conn, subject_id, purpose, ChallengeState::Superseded, &now)?;
        Ok(retired)
    }

    /// Mark every live challenge past its TTL as expired.
    pub fn sweep_expired(&self, conn: &Connection, now: DateTime<Utc>) -> Result<usize, OtpError> {
        Ok(db::expire_overdue_challenges(conn, &now)?)
    }

    /// Delete dead challenges past retention and wipe old consumed hashes.
    /// Returns (deleted, wiped).
    pub fn purge(&self, conn: &Connection, now: DateTime<Utc>) -> Result<(usize, usize), OtpError> {
        let cutoff = now - self.policy.retention;
        let deleted = db::delete_closed_challenges(conn, &cutoff)?;
        let wiped = db::wipe_consumed_hashes(conn, &cutoff)?;
        Ok((deleted, wiped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::open_memory_database;
    use chrono::TimeZone;

    const SUBJECT: &str = "0b5c6f4e-8d1a-4f0e-9a51-6f3e2a1b7c9d";

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 10, 8, 0, 0).unwrap()
    }

    fn ledger(codes: &[&str]) -> OtpLedger {
        OtpLedger::new(&[9u8; KEY_LENGTH], OtpPolicy::default(), Box::new(FixedCodes::new(codes)))
    }

    #[test]
    fn random_codes_are_six_digits() {
        for _ in 0..200 {
            let code = RandomCodes.generate();
            assert_eq!(code.len(), CODE_DIGITS);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn issue_stores_hash_not_plaintext() {
        let conn = open_memory_database().unwrap();
        let ledger = ledger(&["482193"]);
        let issued = ledger.issue(&conn, SUBJECT, OtpPurpose::AccountActivation, t0()).unwrap();
        assert_eq!(issued.code.as_str(), "482193");
        assert_eq!(issued.expires_at, t0() + Duration::minutes(10));

        let stored = db::latest_challenge(&conn, SUBJECT, OtpPurpose::AccountActivation)
            .unwrap()
            .unwrap();
        let hash = stored.code_hash.unwrap();
        assert_eq!(hash.len(), 32);
        assert!(!hash.windows(6).any(|w| w == b"482193"));
        assert_eq!(stored.attempts_remaining, 5);
        assert!(!format!("{issued:?}").contains("482193"));
    }

    #[test]
    fn validate_succeeds_exactly_once() {
        let conn = open_memory_database().unwrap();
        let ledger = ledger(&["482193"]);
        ledger.issue(&conn, SUBJECT, OtpPurpose::AccountActivation, t0()).unwrap();

        ledger
            .validate(&conn, SUBJECT, OtpPurpose::AccountActivation, "482193", t0())
            .unwrap();
        for _ in 0..3 {
            assert!(matches!(
                ledger.validate(&conn, SUBJECT, OtpPurpose::AccountActivation, "482193", t0()),
                Err(OtpError::AlreadyConsumed)
            ));
        }
    }

    #[test]
    fn validate_without_challenge_is_not_found() {
        let conn = open_memory_database().unwrap();
        assert!(matches!(
            ledger(&["1"]).validate(&conn, SUBJECT, OtpPurpose::AccountActivation, "1", t0()),
            Err(OtpError::NotFound)
        ));
    }

    #[test]
    fn purposes_are_independent() {
        let conn = open_memory_database().unwrap();
        let ledger = ledger(&["111111", "222222"]);
        ledger.issue(&conn, SUBJECT, OtpPurpose::AccountActivation, t0()).unwrap();
        ledger.issue(&conn, SUBJECT, OtpPurpose::AppointmentResolution, t0()).unwrap();
        assert!(matches!(
            ledger.validate(&conn, SUBJECT, OtpPurpose::AccountActivation, "222222", t0()),
            Err(OtpError::Mismatch { attempts_remaining: 4 })
        ));
        ledger
            .validate(&conn, SUBJECT, OtpPurpose::AppointmentResolution, "222222", t0())
            .unwrap();
    }

    #[test]
    fn mismatch_decrements_then_locks_out() {
        let conn = open_memory_database().unwrap();
        let ledger = ledger(&["482193"]);
        ledger.issue(&conn, SUBJECT, OtpPurpose::AppointmentResolution, t0()).unwrap();

        for expected in (0..5).rev() {
            match ledger.validate(&conn, SUBJECT, OtpPurpose::AppointmentResolution, "000000", t0()) {
                Err(OtpError::Mismatch { attempts_remaining }) => {
                    assert_eq!(attempts_remaining, expected)
                }
                other => panic!("expected mismatch, got {other:?}"),
            }
        }
        assert!(matches!(
            ledger.validate(&conn, SUBJECT, OtpPurpose::AppointmentResolution, "482193", t0()),
            Err(OtpError::AttemptsExhausted)
        ));
    }

    #[test]
    fn malformed_candidate_counts_as_mismatch() {
        let conn = open_memory_database().unwrap();
        let ledger = ledger(&["482193"]);
        ledger.issue(&conn, SUBJECT, OtpPurpose::AccountActivation, t0()).unwrap();
        assert!(matches!(
            ledger.validate(&conn, SUBJECT, OtpPurpose::AccountActivation, "abc", t0()),
            Err(OtpError::Mismatch { attempts_remaining: 4 })
        ));
        ledger
            .validate(&conn, SUBJECT, OtpPurpose::AccountActivation, " 482193 ", t0())
            .unwrap();
    }

    #[test]
    fn expiry_wins_and_archives() {
        let conn = open_memory_database().unwrap();
        let ledger = ledger(&["482193"]);
        ledger.issue(&conn, SUBJECT, OtpPurpose::AccountActivation, t0()).unwrap();

        let later = t0() + Duration::minutes(10);
        assert!(matches!(
            ledger.validate(&conn, SUBJECT, OtpPurpose::AccountActivation, "482193", later),
            Err(OtpError::Expired)
        ));
        let stored = db::latest_challenge(&conn, SUBJECT, OtpPurpose::AccountActivation)
            .unwrap()
            .unwrap();
        assert_eq!(stored.state, ChallengeState::Expired);
        assert!(matches!(
            ledger.validate(&conn, SUBJECT, OtpPurpose::AccountActivation, "482193", later),
            Err(OtpError::NotFound)
        ));
    }

    #[test]
    fn reissue_supersedes_previous_code() {
        let conn = open_memory_database().unwrap();
        let ledger = ledger(&["111111", "222222"]);
        ledger.issue(&conn, SUBJECT, OtpPurpose::AccountActivation, t0()).unwrap();
        ledger.issue(&conn, SUBJECT, OtpPurpose::AccountActivation, t0()).unwrap();

        assert!(matches!(
            ledger.validate(&conn, SUBJECT, OtpPurpose::AccountActivation, "111111", t0()),
            Err(OtpError::Mismatch { .. })
        ));
        ledger
            .validate(&conn, SUBJECT, OtpPurpose::AccountActivation, "222222", t0())
            .unwrap();
    }

    #[test]
    fn resend_honours_cooldown() {
        let conn = open_memory_database().unwrap();
        let ledger = ledger(&["111111", "222222"]);
        ledger.issue(&conn, SUBJECT, OtpPurpose::AccountActivation, t0()).unwrap();

        match ledger.resend(
            &conn,
            SUBJECT,
            OtpPurpose::AccountActivation,
            t0() + Duration::milliseconds(10_500),
        ) {
            Err(OtpError::TooSoon { retry_after_secs }) => assert_eq!(retry_after_secs, 20),
            other => panic!("expected TooSoon, got {other:?}"),
        }

        let issued = ledger
            .resend(&conn, SUBJECT, OtpPurpose::AccountActivation, t0() + Duration::seconds(30))
            .unwrap();
        assert_eq!(issued.code.as_str(), "222222");
    }

    #[test]
    fn resend_without_history_issues() {
        let conn = open_memory_database().unwrap();
        let issued = ledger(&["333333"])
            .resend(&conn, SUBJECT, OtpPurpose::AppointmentResolution, t0())
            .unwrap();
        assert_eq!(issued.code.as_str(), "333333");
    }

    #[test]
    fn retire_closes_live_challenge() {
        let conn = open_memory_database().unwrap();
        let ledger = ledger(&["482193"]);
        ledger.issue(&conn, SUBJECT, OtpPurpose::AppointmentResolution, t0()).unwrap();
        assert_eq!(ledger.retire(&conn, SUBJECT, OtpPurpose::AppointmentResolution, t0()).unwrap(), 1);
        assert!(matches!(
            ledger.validate(&conn, SUBJECT, OtpPurpose::AppointmentResolution, "482193", t0()),
            Err(OtpError::NotFound)
        ));
    }

    #[test]
    fn sweep_and_purge() {
        let conn = open_memory_database().unwrap();
        let ledger = ledger(&["482193"]);
        ledger.issue(&conn, "a", OtpPurpose::AccountActivation, t0()).unwrap();
        ledger.issue(&conn, "b", OtpPurpose::AccountActivation, t0()).unwrap();
        ledger
            .validate(&conn, "b", OtpPurpose::AccountActivation, "482193", t0())
            .unwrap();

        let after_ttl = t0() + Duration::minutes(11);
        assert_eq!(ledger.sweep_expired(&conn, after_ttl).unwrap(), 1);

        let (deleted, wiped) = ledger.purge(&conn, after_ttl + Duration::hours(25)).unwrap();
        assert_eq!((deleted, wiped), (1, 1));
        assert!(db::latest_challenge(&conn, "a", OtpPurpose::AccountActivation)
            .unwrap()
            .is_none());
        let consumed = db::latest_challenge(&conn, "b", OtpPurpose::AccountActivation)
            .unwrap()
            .unwrap();
        assert_eq!(consumed.state, ChallengeState::Consumed);
        assert!(consumed.code_hash.is_none());
    }

    #[test]
    fn only_mismatch_and_expiry_preserve_writes() {
        assert!(OtpError::Mismatch { attempts_remaining: 1 }.preserves_writes());
        assert!(OtpError::Expired.preserves_writes());
        assert!(!OtpError::AttemptsExhausted.preserves_writes());
        assert!(!OtpError::AlreadyConsumed.preserves_writes());
        assert!(!OtpError::TooSoon { retry_after_secs: 3 }.preserves_writes());
    }
}
