//! Shared application state.
//!
//! `CoreState` owns the single SQLite connection, the server keys, the
//! clock, and the OTP ledger. It is wrapped in `Arc` at startup and
//! shared by the axum handlers and the background thread.
//!
//! Every write path goes through [`CoreState::transact`], which runs the
//! closure inside an IMMEDIATE transaction: SQLite takes the write lock
//! up front, so a check followed by an insert is one atomic decision.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{Connection, TransactionBehavior};

use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::crypto::{CryptoError, ServerKeys};
use crate::db::{self, DatabaseError};
use crate::models::AuditEntry;
use crate::otp::{CodeGenerator, OtpLedger, OtpPolicy, RandomCodes};
use crate::session::SessionSigner;

/// Maximum audit buffer size before flush.
const AUDIT_BUFFER_CAPACITY: usize = 100;

/// Decides whether a failed transaction still commits.
///
/// Some failures are themselves state changes (a wrong OTP burns an
/// attempt). Those commit; every other error rolls back.
pub trait TxOutcome {
    fn preserves_writes(&self) -> bool {
        false
    }
}

impl TxOutcome for CoreError {}
impl TxOutcome for DatabaseError {}

// ═══════════════════════════════════════════════════════════
// CoreState
// ═══════════════════════════════════════════════════════════

pub struct CoreState {
    conn: Mutex<Connection>,
    config: AppConfig,
    keys: ServerKeys,
    clock: Arc<dyn Clock>,
    otp: OtpLedger,
    sessions: SessionSigner,
    audit: AuditLogger,
}

impl CoreState {
    /// Open the store named by `config` and derive keys from its secret.
    pub fn open(config: AppConfig) -> Result<Self, CoreError> {
        let keys = match config.secret.as_deref() {
            Some(secret) => ServerKeys::from_base64(secret)?,
            None => {
                tracing::warn!(
                    "HEALTHSYNC_SECRET not set; using an ephemeral secret. \
                     Sessions and queued mail will not survive a restart"
                );
                ServerKeys::ephemeral()?
            }
        };
        let conn = db::open_database(&config.db_path)?;
        tracing::info!(path = %config.db_path.display(), "Database opened");
        Ok(Self::with_parts(
            conn,
            config,
            keys,
            Arc::new(SystemClock),
            Box::new(RandomCodes),
        ))
    }

    /// Assemble from already-built parts.
    pub fn with_parts(
        conn: Connection,
        config: AppConfig,
        keys: ServerKeys,
        clock: Arc<dyn Clock>,
        codes: Box<dyn CodeGenerator>,
    ) -> Self {
        let otp = OtpLedger::new(keys.otp_pepper(), OtpPolicy::from_config(&config), codes);
        let sessions = SessionSigner::new(keys.session_key(), config.token_ttl);
        Self {
            conn: Mutex::new(conn),
            config,
            keys,
            clock,
            otp,
            sessions,
            audit: AuditLogger::new(),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn keys(&self) -> &ServerKeys {
        &self.keys
    }

    pub fn otp(&self) -> &OtpLedger {
        &self.otp
    }

    pub fn sessions(&self) -> &SessionSigner {
        &self.sessions
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Current wall-clock time at the clinic, for comparing against
    /// appointment times.
    pub fn clinic_now(&self) -> NaiveDateTime {
        self.now()
            .with_timezone(&self.config.clinic_offset())
            .naive_local()
    }

    // ── Store access ───────────────────────────────────────

    /// Run a read-only closure against the connection.
    pub fn read<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: From<CoreError>,
        F: FnOnce(&Connection) -> Result<T, E>,
    {
        let conn = self.conn.lock().map_err(|_| CoreError::LockPoisoned)?;
        f(&conn)
    }

    /// Run `f` inside an IMMEDIATE transaction. Commits on `Ok`, and on
    /// errors whose [`TxOutcome::preserves_writes`] is true; rolls back
    /// otherwise.
    pub fn transact<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: From<CoreError> + TxOutcome,
        F: FnOnce(&Connection) -> Result<T, E>,
    {
        let mut conn = self.conn.lock().map_err(|_| CoreError::LockPoisoned)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| CoreError::Database(e.into()))?;

        match f(&tx) {
            Ok(value) => {
                tx.commit().map_err(|e| CoreError::Database(e.into()))?;
                Ok(value)
            }
            Err(err) if err.preserves_writes() => {
                tx.commit().map_err(|e| CoreError::Database(e.into()))?;
                Err(err)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback() {
                    tracing::error!(error = %rollback, "Transaction rollback failed");
                }
                Err(err)
            }
        }
    }

    // ── Audit logging ───────────────────────────────────────

    /// Log an access event. Auto-flushes to DB when buffer is full.
    pub fn log_access(&self, entry: AuditEntry) {
        if self.audit.log(entry) {
            if let Err(e) = self.flush_audit() {
                tracing::warn!(error = %e, "Audit flush failed");
            }
        }
    }

    /// Get the current audit buffer contents.
    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.audit.entries()
    }

    /// Write buffered audit entries to the store.
    pub fn flush_audit(&self) -> Result<usize, CoreError> {
        let entries = self.audit.drain();
        if entries.is_empty() {
            return Ok(0);
        }
        self.read(|conn| db::insert_audit_entries(conn, &entries).map_err(CoreError::from))?;
        tracing::debug!(count = entries.len(), "Flushed audit entries to database");
        Ok(entries.len())
    }
}

#[cfg(test)]
impl CoreState {
    /// In-memory store, fixed key material, and cheap password hashing.
    pub fn for_tests(
        clock: Arc<crate::clock::ManualClock>,
        codes: crate::otp::FixedCodes,
    ) -> Self {
        let config = AppConfig {
            password_iterations: 1_000,
            ..AppConfig::default()
        };
        Self::with_parts(
            db::open_memory_database().expect("memory db"),
            config,
            ServerKeys::derive(&[42u8; 32]).expect("test keys"),
            clock,
            Box::new(codes),
        )
    }
}

// ═══════════════════════════════════════════════════════════
// Error types
// ═══════════════════════════════════════════════════════════

/// Errors from CoreState operations.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Internal lock error")]
    LockPoisoned,
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("Key setup failed: {0}")]
    Keys(#[from] CryptoError),
}

// ═══════════════════════════════════════════════════════════
// Audit logger
// ═══════════════════════════════════════════════════════════

/// In-memory audit log buffer. Entries are flushed to SQLite
/// when the buffer reaches capacity or by the sweeper.
pub struct AuditLogger {
    buffer: Mutex<Vec<AuditEntry>>,
}

impl AuditLogger {
    pub fn new() -> Self {
        Self {
            buffer: Mutex::new(Vec::with_capacity(AUDIT_BUFFER_CAPACITY)),
        }
    }

    /// Buffer an entry. Returns `true` once the flush threshold is reached.
    pub fn log(&self, entry: AuditEntry) -> bool {
        if let Ok(mut buf) = self.buffer.lock() {
            buf.push(entry);
            buf.len() >= AUDIT_BUFFER_CAPACITY
        } else {
            false
        }
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.buffer
            .lock()
            .map(|buf| buf.clone())
            .unwrap_or_default()
    }

    pub fn drain(&self) -> Vec<AuditEntry> {
        self.buffer
            .lock()
            .map(|mut buf| buf.drain(..).collect())
            .unwrap_or_default()
    }
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
