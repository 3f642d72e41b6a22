//! Stateless bearer tokens.
//!
//! `base64url(claims JSON) "." base64url(HMAC-SHA256(payload))`. Nothing is
//! kept server-side; every request re-verifies the MAC and the expiry.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use thiserror::Error;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::crypto::{keyed_digest, CryptoError, KEY_LENGTH};
use crate::models::Role;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Malformed session token")]
    Malformed,
    #[error("Session token signature mismatch")]
    BadSignature,
    #[error("Session token expired")]
    Expired,
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: Uuid,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
}

/// The authenticated party behind a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub account_id: Uuid,
    pub role: Role,
}

impl From<&SessionClaims> for Caller {
    fn from(claims: &SessionClaims) -> Self {
        Self {
            account_id: claims.sub,
            role: claims.role,
        }
    }
}

pub struct SessionSigner {
    key: Zeroizing<[u8; KEY_LENGTH]>,
    ttl: Duration,
}

impl SessionSigner {
    pub fn new(key: &[u8; KEY_LENGTH], ttl: Duration) -> Self {
        Self {
            key: Zeroizing::new(*key),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn issue(&self, account_id: Uuid, role: Role, now: DateTime<Utc>) -> Result<String, SessionError> {
        let claims = SessionClaims {
            sub: account_id,
            role,
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
        };
        let json = serde_json::to_vec(&claims).map_err(|_| SessionError::Malformed)?;
        let payload = URL_SAFE_NO_PAD.encode(json);
        let mac = keyed_digest(self.key.as_slice(), &[payload.as_bytes()])?;
        Ok(format!("{payload}.{}", URL_SAFE_NO_PAD.encode(mac)))
    }

    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<SessionClaims, SessionError> {
        let (payload, signature) = token.split_once('.').ok_or(SessionError::Malformed)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| SessionError::Malformed)?;

        let expected = keyed_digest(self.key.as_slice(), &[payload.as_bytes()])?;
        if expected.as_slice().ct_eq(&signature).unwrap_u8() == 0 {
            return Err(SessionError::BadSignature);
        }

        let json = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| SessionError::Malformed)?;
        let claims: SessionClaims =
            serde_json::from_slice(&json).map_err(|_| SessionError::Malformed)?;
        if now.timestamp() >= claims.exp {
            return Err(SessionError::Expired);
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 10, 8, 0, 0).unwrap()
    }

    fn signer() -> SessionSigner {
        SessionSigner::new(&[4u8; KEY_LENGTH], Duration::hours(24))
    }

    #[test]
    fn issued_token_verifies() {
        let id = Uuid::new_v4();
        let token = signer().issue(id, Role::Doctor, t0()).unwrap();
        let claims = signer().verify(&token, t0() + Duration::hours(1)).unwrap();
        assert_eq!(claims.sub, id);
        assert_eq!(claims.role, Role::Doctor);
        assert_eq!(claims.exp - claims.iat, 24 * 3600);
        assert_eq!(Caller::from(&claims).role, Role::Doctor);
    }

    #[test]
    fn expired_token_rejected() {
        let token = signer().issue(Uuid::new_v4(), Role::Patient, t0()).unwrap();
        assert!(matches!(
            signer().verify(&token, t0() + Duration::hours(24)),
            Err(SessionError::Expired)
        ));
    }

    #[test]
    fn tampered_claims_rejected() {
        let token = signer().issue(Uuid::new_v4(), Role::Patient, t0()).unwrap();
        let (_, sig) = token.split_once('.').unwrap();
        let forged_claims = SessionClaims {
            sub: Uuid::new_v4(),
            role: Role::Doctor,
            iat: t0().timestamp(),
            exp: t0().timestamp() + 3600,
        };
        let forged = format!(
            "{}.{sig}",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged_claims).unwrap())
        );
        assert!(matches!(
            signer().verify(&forged, t0()),
            Err(SessionError::BadSignature)
        ));
    }

    #[test]
    fn other_key_rejected() {
        let token = signer().issue(Uuid::new_v4(), Role::Patient, t0()).unwrap();
        let other = SessionSigner::new(&[5u8; KEY_LENGTH], Duration::hours(24));
        assert!(matches!(other.verify(&token, t0()), Err(SessionError::BadSignature)));
    }

    #[test]
    fn garbage_is_malformed() {
        for token in ["", "abc", "abc.!!!"] {
            assert!(matches!(
                signer().verify(token, t0()),
                Err(SessionError::Malformed)
            ));
        }
    }
}
