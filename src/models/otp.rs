use chrono::{DateTime, Utc};

use super::enums::{ChallengeState, OtpPurpose};

/// One issued passcode, as stored. Only the keyed hash of the code is kept.
#[derive(Debug, Clone)]
pub struct OtpChallenge {
    pub id: i64,
    pub subject_id: String,
    pub purpose: OtpPurpose,
    /// `None` once a consumed challenge has passed retention and was wiped.
    pub code_hash: Option<Vec<u8>>,
    pub salt: Vec<u8>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub attempts_remaining: u32,
    pub state: ChallengeState,
    pub closed_at: Option<DateTime<Utc>>,
}

impl OtpChallenge {
    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
