use std::fmt;

use chrono::{DateTime, Utc};
use zeroize::Zeroizing;

use super::enums::{MailKind, Role};

/// A queued outbound message. The body is sealed at rest.
#[derive(Debug, Clone)]
pub struct OutboxMessage {
    pub id: i64,
    pub kind: MailKind,
    pub recipient: String,
    pub subject: String,
    pub sealed_body: Option<Vec<u8>>,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A message ready to hand to a mailer. The body may carry a passcode.
#[derive(Clone)]
pub struct OutgoingMail {
    pub kind: MailKind,
    pub recipient: String,
    pub subject: String,
    pub body: Zeroizing<String>,
}

impl fmt::Debug for OutgoingMail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingMail")
            .field("kind", &self.kind)
            .field("recipient", &self.recipient)
            .field("subject", &self.subject)
            .field("body", &"<redacted>")
            .finish()
    }
}

/// One line of the request audit trail.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub account_id: Option<String>,
    pub role: Option<Role>,
    pub action: String,
    pub outcome: String,
}
