//! Notification outbox.
//!
//! State transitions never talk to a mail server. They call [`enqueue`]
//! inside their own transaction, which seals the rendered body with the
//! outbox key and stores it. The delivery worker later calls
//! [`deliver_pending`], which opens, sends, and records the outcome. A
//! failed send is retried with backoff and never touches the state the
//! message describes.

pub mod mailer;

pub use mailer::*;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use rusqlite::Connection;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::core_state::{CoreError, CoreState, TxOutcome};
use crate::crypto::{self, CryptoError, KEY_LENGTH};
use crate::db::{self, DatabaseError};
use crate::models::{MailKind, OutboxMessage, OutgoingMail};

/// Base delay before the first retry; doubles per failed attempt.
const RETRY_BASE_SECS: i64 = 30;
/// Longest wait between two attempts.
const RETRY_CAP_SECS: i64 = 3600;
/// Messages handled per delivery pass.
pub const DELIVERY_BATCH: u32 = 50;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl From<DatabaseError> for NotifyError {
    fn from(e: DatabaseError) -> Self {
        NotifyError::Core(CoreError::Database(e))
    }
}

impl TxOutcome for NotifyError {}

/// Seal and queue `mail`. Call with the same connection as the transition
/// that produced it.
pub fn enqueue(
    conn: &Connection,
    sealing_key: &[u8; KEY_LENGTH],
    mail: &OutgoingMail,
    now: DateTime<Utc>,
) -> Result<i64, NotifyError> {
    let sealed = crypto::seal(sealing_key, mail.body.as_bytes())?;
    let id = db::insert_outbox_message(conn, mail.kind, &mail.recipient, &mail.subject, &sealed, &now)?;
    tracing::debug!(outbox_id = id, kind = %mail.kind, "Message queued");
    Ok(id)
}

/// Outcome counts of one delivery pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub retried: usize,
    pub abandoned: usize,
}

/// Delay before attempt number `attempts + 1`.
pub fn retry_delay(attempts: u32) -> Duration {
    let exp = attempts.min(16);
    Duration::seconds((RETRY_BASE_SECS << exp).min(RETRY_CAP_SECS))
}

/// Send every due message once. Mail goes out with no store lock held.
pub fn deliver_pending(core: &CoreState, mailer: &dyn Mailer) -> Result<DeliveryReport, NotifyError> {
    let now = core.now();
    let due = core.read(|conn| {
        db::due_outbox_messages(conn, &now, DELIVERY_BATCH).map_err(NotifyError::from)
    })?;

    let max_attempts = core.config().delivery_max_attempts;
    let mut report = DeliveryReport::default();

    for message in due {
        let outcome = match open_message(core.keys().sealing_key(), &message) {
            Ok(mail) => mailer.send(&mail).map_err(|e| e.to_string()),
            Err(e) => {
                tracing::error!(outbox_id = message.id, error = %e, "Sealed body unreadable");
                core.read(|conn| {
                    db::mark_abandoned(conn, message.id, "sealed body unreadable", &now)
                        .map_err(NotifyError::from)
                })?;
                report.abandoned += 1;
                continue;
            }
        };

        match outcome {
            Ok(()) => {
                core.read(|conn| {
                    db::mark_delivered(conn, message.id, &core.now()).map_err(NotifyError::from)
                })?;
                report.delivered += 1;
            }
            Err(error) if message.attempts + 1 >= max_attempts => {
                tracing::error!(
                    outbox_id = message.id,
                    kind = %message.kind,
                    attempts = message.attempts + 1,
                    error = %error,
                    "Giving up on message"
                );
                core.read(|conn| {
                    db::mark_abandoned(conn, message.id, &error, &core.now()).map_err(NotifyError::from)
                })?;
                report.abandoned += 1;
            }
            Err(error) => {
                let next = core.now() + retry_delay(message.attempts);
                tracing::warn!(
                    outbox_id = message.id,
                    kind = %message.kind,
                    attempts = message.attempts + 1,
                    error = %error,
                    "Delivery failed, will retry"
                );
                core.read(|conn| {
                    db::mark_failed(conn, message.id, &error, &next).map_err(NotifyError::from)
                })?;
                report.retried += 1;
            }
        }
    }

    if report != DeliveryReport::default() {
        tracing::info!(
            delivered = report.delivered,
            retried = report.retried,
            abandoned = report.abandoned,
            "Outbox pass complete"
        );
    }
    Ok(report)
}

fn open_message(key: &[u8; KEY_LENGTH], message: &OutboxMessage) -> Result<OutgoingMail, CryptoError> {
    let sealed = message.sealed_body.as_deref().ok_or(CryptoError::CorruptedData)?;
    let plain = Zeroizing::new(crypto::open(key, sealed)?);
    let body = String::from_utf8(plain.to_vec()).map_err(|_| CryptoError::CorruptedData)?;
    Ok(OutgoingMail {
        kind: message.kind,
        recipient: message.recipient.clone(),
        subject: message.subject.clone(),
        body: Zeroizing::new(body),
    })
}

// ═══════════════════════════════════════════════════════════
// Message templates
// ═══════════════════════════════════════════════════════════

fn when(at: &NaiveDateTime) -> String {
    at.format("%A %d %B %Y at %H:%M").to_string()
}

fn mail(kind: MailKind, recipient: &str, subject: &str, body: String) -> OutgoingMail {
    OutgoingMail {
        kind,
        recipient: recipient.to_string(),
        subject: subject.to_string(),
        body: Zeroizing::new(body),
    }
}

pub fn activation_code(recipient: &str, name: &str, code: &str, ttl_minutes: i64) -> OutgoingMail {
    mail(
        MailKind::ActivationCode,
        recipient,
        "Verify your HealthSync account",
        format!(
            "Your verification code is {code}.\n\n\
             Hello {name}, enter this code to activate your account. \
             It expires in {ttl_minutes} minutes."
        ),
    )
}

pub fn booking_otp(
    recipient: &str,
    patient_name: &str,
    doctor_name: &str,
    at: &NaiveDateTime,
    code: &str,
) -> OutgoingMail {
    mail(
        MailKind::BookingOtp,
        recipient,
        "Your appointment is booked",
        format!(
            "Your appointment code is {code}.\n\n\
             Hello {patient_name}, your appointment with Dr. {doctor_name} is booked for {}. \
             Give this code to the doctor at the end of your visit.",
            when(at)
        ),
    )
}

pub fn otp_resend(recipient: &str, patient_name: &str, at: &NaiveDateTime, code: &str) -> OutgoingMail {
    mail(
        MailKind::OtpResend,
        recipient,
        "Your new appointment code",
        format!(
            "Your new appointment code is {code}.\n\n\
             Hello {patient_name}, this replaces any earlier code for your appointment on {}.",
            when(at)
        ),
    )
}

pub fn appointment_completed(
    recipient: &str,
    patient_name: &str,
    doctor_name: &str,
    at: &NaiveDateTime,
) -> OutgoingMail {
    mail(
        MailKind::AppointmentCompleted,
        recipient,
        "Appointment completed",
        format!(
            "Hello {patient_name}, your appointment with Dr. {doctor_name} on {} \
             has been marked as completed.",
            when(at)
        ),
    )
}

pub fn cancelled_by_doctor(
    recipient: &str,
    patient_name: &str,
    doctor_name: &str,
    at: &NaiveDateTime,
    reason: &str,
) -> OutgoingMail {
    mail(
        MailKind::CancelledByDoctor,
        recipient,
        "Appointment cancelled by your doctor",
        format!(
            "Hello {patient_name}, Dr. {doctor_name} cancelled your appointment on {}.\n\
             Reason: {reason}",
            when(at)
        ),
    )
}

pub fn cancelled_by_patient(
    recipient: &str,
    doctor_name: &str,
    patient_name: &str,
    at: &NaiveDateTime,
    reason: &str,
) -> OutgoingMail {
    mail(
        MailKind::CancelledByPatient,
        recipient,
        "Appointment cancelled by patient",
        format!(
            "Hello Dr. {doctor_name}, {patient_name} cancelled the appointment on {}.\n\
             Reason: {reason}",
            when(at)
        ),
    )
}
