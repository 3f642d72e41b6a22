use serde::Serialize;
use thiserror::Error;

use crate::models::OutgoingMail;

#[derive(Error, Debug)]
pub enum MailError {
    #[error("Cannot connect to mail relay at {0}")]
    Connection(String),
    #[error("Mail relay HTTP error: {0}")]
    HttpClient(String),
    #[error("Mail relay rejected message (status {status})")]
    Rejected { status: u16 },
}

/// Hands a rendered message to whatever actually delivers mail.
///
/// Called from the delivery thread, never while the store is locked.
pub trait Mailer: Send + Sync {
    fn send(&self, mail: &OutgoingMail) -> Result<(), MailError>;
}

/// Default mailer: logs who would have been written to. Never logs the body.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send(&self, mail: &OutgoingMail) -> Result<(), MailError> {
        tracing::info!(
            kind = %mail.kind,
            recipient = %mail.recipient,
            subject = %mail.subject,
            "Mail dispatched (log only)"
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct RelayRequest<'a> {
    kind: &'a str,
    to: &'a str,
    subject: &'a str,
    body: &'a str,
}

/// POSTs each message as JSON to an HTTP mail relay.
pub struct HttpRelayMailer {
    url: String,
    client: reqwest::blocking::Client,
}

impl HttpRelayMailer {
    pub fn new(url: &str, timeout_secs: u64) -> Result<Self, MailError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| MailError::HttpClient(e.to_string()))?;
        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Mailer for HttpRelayMailer {
    fn send(&self, mail: &OutgoingMail) -> Result<(), MailError> {
        let body = RelayRequest {
            kind: mail.kind.as_str(),
            to: &mail.recipient,
            subject: &mail.subject,
            body: mail.body.as_str(),
        };

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .map_err(|e| {
                if e.is_connect() {
                    MailError::Connection(self.url.clone())
                } else {
                    MailError::HttpClient(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(MailError::Rejected {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

/// Keeps every message it is given. Can be told to fail.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingMailer {
    sent: std::sync::Mutex<Vec<OutgoingMail>>,
    failing: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<OutgoingMail> {
        self.sent.lock().unwrap().clone()
    }

    /// The six-digit code in the most recent message to `recipient`.
    pub fn last_code_for(&self, recipient: &str) -> Option<String> {
        self.sent()
            .iter()
            .rev()
            .find(|m| m.recipient == recipient)
            .and_then(|m| {
                m.body
                    .split(|c: char| !c.is_ascii_digit())
                    .find(|word| word.len() == 6)
                    .map(str::to_string)
            })
    }
}

#[cfg(test)]
impl Mailer for RecordingMailer {
    fn send(&self, mail: &OutgoingMail) -> Result<(), MailError> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(MailError::Rejected { status: 503 });
        }
        self.sent.lock().unwrap().push(mail.clone());
        Ok(())
    }
}
