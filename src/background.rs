//! Background threads: outbox delivery and store maintenance.
//!
//! Each runs on its own OS thread (mail relays are called with a blocking
//! client) and sleeps in short slices so `shutdown` is honoured quickly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::core_state::{CoreError, CoreState, TxOutcome};
use crate::db::{self, DatabaseError};
use crate::notify::{self, Mailer, NotifyError};
use crate::otp::OtpError;

/// Sleep granularity for shutdown responsiveness.
const SLEEP_SLICE: Duration = Duration::from_millis(200);

#[derive(Error, Debug)]
pub enum MaintenanceError {
    #[error(transparent)]
    Otp(#[from] OtpError),
    #[error(transparent)]
    Notify(#[from] NotifyError),
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl From<DatabaseError> for MaintenanceError {
    fn from(e: DatabaseError) -> Self {
        MaintenanceError::Core(CoreError::Database(e))
    }
}

impl TxOutcome for MaintenanceError {}

/// Handle for a background thread.
///
/// Supports graceful shutdown via `shutdown()` or automatic cleanup on `Drop`.
pub struct WorkerHandle {
    name: &'static str,
    shutdown: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Request graceful shutdown. A pass already running completes first.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

fn spawn_worker<F>(name: &'static str, interval: Duration, mut pass: F) -> WorkerHandle
where
    F: FnMut() + Send + 'static,
{
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();

    let handle = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            tracing::info!(worker = name, interval_ms = interval.as_millis() as u64, "Worker started");
            while !flag.load(Ordering::Relaxed) {
                pass();
                if !sleep_unless_shutdown(interval, &flag) {
                    break;
                }
            }
            tracing::info!(worker = name, "Worker shutting down");
        });

    let handle = match handle {
        Ok(h) => Some(h),
        Err(e) => {
            tracing::error!(worker = name, error = %e, "Failed to spawn worker thread");
            None
        }
    };

    WorkerHandle {
        name,
        shutdown,
        handle,
    }
}

/// Returns `false` if shutdown was requested while sleeping.
fn sleep_unless_shutdown(total: Duration, shutdown: &AtomicBool) -> bool {
    let mut slept = Duration::ZERO;
    while slept < total {
        if shutdown.load(Ordering::Relaxed) {
            return false;
        }
        let step = SLEEP_SLICE.min(total - slept);
        std::thread::sleep(step);
        slept += step;
    }
    !shutdown.load(Ordering::Relaxed)
}

// ═══════════════════════════════════════════════════════════
// Delivery
// ═══════════════════════════════════════════════════════════

pub fn start_delivery_worker(core: Arc<CoreState>, mailer: Arc<dyn Mailer>) -> WorkerHandle {
    let interval = core.config().delivery_poll_interval;
    spawn_worker("outbox-delivery", interval, move || {
        match notify::deliver_pending(&core, mailer.as_ref()) {
            Ok(report) if report != notify::DeliveryReport::default() => {
                tracing::info!(
                    delivered = report.delivered,
                    retried = report.retried,
                    abandoned = report.abandoned,
                    "Delivery pass"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "Delivery pass failed"),
        }
    })
}

// ═══════════════════════════════════════════════════════════
// Maintenance sweep
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub challenges_expired: usize,
    pub challenges_deleted: usize,
    pub hashes_wiped: usize,
    pub outbox_pruned: usize,
    pub audit_flushed: usize,
    pub audit_pruned: usize,
}

/// One maintenance pass: expire and purge challenges, flush the audit
/// buffer, and prune old outbox and audit rows.
pub fn sweep(core: &CoreState) -> Result<SweepReport, MaintenanceError> {
    let now = core.now();
    let config = core.config();
    let audit_flushed = core.flush_audit()?;

    let mut report = core.transact(|conn| {
        let challenges_expired = core.otp().sweep_expired(conn, now)?;
        let (challenges_deleted, hashes_wiped) = core.otp().purge(conn, now)?;
        let outbox_pruned = db::prune_outbox(conn, &(now - config.outbox_retention))?;
        let audit_pruned = db::prune_audit_log(conn, &(now - config.audit_retention))?;
        Ok::<_, MaintenanceError>(SweepReport {
            challenges_expired,
            challenges_deleted,
            hashes_wiped,
            outbox_pruned,
            audit_flushed: 0,
            audit_pruned,
        })
    })?;
    report.audit_flushed = audit_flushed;
    Ok(report)
}

pub fn start_sweeper(core: Arc<CoreState>) -> WorkerHandle {
    let interval = core.config().sweep_interval;
    spawn_worker("maintenance-sweeper", interval, move || match sweep(&core) {
        Ok(report) if report != SweepReport::default() => {
            tracing::info!(
                expired = report.challenges_expired,
                deleted = report.challenges_deleted,
                wiped = report.hashes_wiped,
                outbox_pruned = report.outbox_pruned,
                audit_flushed = report.audit_flushed,
                audit_pruned = report.audit_pruned,
                "Maintenance sweep"
            );
        }
        Ok(_) => {}
        Err(e) => tracing::error!(error = %e, "Maintenance sweep failed"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{AuditEntry, ChallengeState, OtpPurpose};
    use crate::notify::RecordingMailer;
    use crate::otp::FixedCodes;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use std::time::Instant;

    fn setup() -> (Arc<CoreState>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 6, 8, 0, 0).unwrap()));
        let core = CoreState::for_tests(clock.clone(), FixedCodes::always("482193"));
        (Arc::new(core), clock)
    }

    fn state_of(core: &CoreState, subject: &str) -> Option<ChallengeState> {
        core.read(|conn| {
            db::latest_challenge(conn, subject, OtpPurpose::AccountActivation)
                .map_err(MaintenanceError::from)
        })
        .unwrap()
        .map(|c| c.state)
    }

    #[test]
    fn sweep_expires_then_purges() {
        let (core, clock) = setup();
        core.transact(|conn| {
            core.otp()
                .issue(conn, "acct-1", OtpPurpose::AccountActivation, core.now())
                .map_err(MaintenanceError::from)
        })
        .unwrap();

        assert_eq!(sweep(&core).unwrap(), SweepReport::default());

        clock.advance(ChronoDuration::minutes(11));
        let report = sweep(&core).unwrap();
        assert_eq!(report.challenges_expired, 1);
        assert_eq!(state_of(&core, "acct-1"), Some(ChallengeState::Expired));

        clock.advance(ChronoDuration::hours(25));
        let report = sweep(&core).unwrap();
        assert_eq!(report.challenges_deleted, 1);
        assert_eq!(state_of(&core, "acct-1"), None);
    }

    #[test]
    fn sweep_flushes_and_prunes_audit() {
        let (core, clock) = setup();
        core.log_access(AuditEntry {
            timestamp: core.now(),
            account_id: Some("acct-1".into()),
            role: None,
            action: "GET /api/v1/accounts/me".into(),
            outcome: "200".into(),
        });
        assert_eq!(sweep(&core).unwrap().audit_flushed, 1);

        clock.advance(ChronoDuration::days(91));
        assert_eq!(sweep(&core).unwrap().audit_pruned, 1);
    }

    #[test]
    fn delivery_worker_sends_queued_mail() {
        let (core, _) = setup();
        core.transact(|conn| {
            notify::enqueue(
                conn,
                core.keys().sealing_key(),
                &notify::activation_code("ana@x.com", "ana", "482193", 10),
                core.now(),
            )
        })
        .unwrap();

        let mailer = Arc::new(RecordingMailer::new());
        let handle = start_delivery_worker(core.clone(), mailer.clone());
        assert_eq!(handle.name(), "outbox-delivery");

        let deadline = Instant::now() + Duration::from_secs(5);
        while mailer.sent().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        drop(handle);
        assert_eq!(mailer.last_code_for("ana@x.com").as_deref(), Some("482193"));
    }

    #[test]
    fn worker_stops_promptly() {
        let (core, _) = setup();
        let started = Instant::now();
        let handle = start_sweeper(core);
        std::thread::sleep(Duration::from_millis(50));
        drop(handle);
        // The default interval is minutes; shutdown must not wait it out.
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
