use base64::Engine;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::CryptoError;

pub const KEY_LENGTH: usize = 32; // AES-256 / HMAC-SHA256

const HKDF_SALT: &[u8] = b"healthsync-server-keys";

/// Sub-keys expanded from the server master secret. Zeroed on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ServerKeys {
    session: [u8; KEY_LENGTH],
    otp_pepper: [u8; KEY_LENGTH],
    sealing: [u8; KEY_LENGTH],
}

impl ServerKeys {
    /// Expand a master secret into the three purpose-bound keys.
    pub fn derive(master: &[u8]) -> Result<Self, CryptoError> {
        if master.len() < KEY_LENGTH {
            return Err(CryptoError::InvalidSecret(format!(
                "master secret must be at least {KEY_LENGTH} bytes"
            )));
        }
        let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), master);
        let mut keys = Self {
            session: [0u8; KEY_LENGTH],
            otp_pepper: [0u8; KEY_LENGTH],
            sealing: [0u8; KEY_LENGTH],
        };
        hk.expand(b"session-signing/v1", &mut keys.session)
            .map_err(|_| CryptoError::KeyDerivation)?;
        hk.expand(b"otp-pepper/v1", &mut keys.otp_pepper)
            .map_err(|_| CryptoError::KeyDerivation)?;
        hk.expand(b"outbox-sealing/v1", &mut keys.sealing)
            .map_err(|_| CryptoError::KeyDerivation)?;
        Ok(keys)
    }

    /// Master secret given as standard base64.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let master = Zeroizing::new(
            base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|_| CryptoError::InvalidSecret("master secret is not valid base64".into()))?,
        );
        Self::derive(&master)
    }

    /// Fresh random master secret. Tokens and sealed mail do not survive a restart.
    pub fn ephemeral() -> Result<Self, CryptoError> {
        let master = Zeroizing::new(generate_salt());
        Self::derive(&master[..])
    }

    pub fn session_key(&self) -> &[u8; KEY_LENGTH] {
        &self.session
    }

    pub fn otp_pepper(&self) -> &[u8; KEY_LENGTH] {
        &self.otp_pepper
    }

    pub fn sealing_key(&self) -> &[u8; KEY_LENGTH] {
        &self.sealing
    }
}

/// HMAC-SHA256 over length-prefixed parts, so ("ab","c") and ("a","bc") differ.
pub fn keyed_digest(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 32], CryptoError> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).map_err(|_| CryptoError::KeyDerivation)?;
    for part in parts {
        mac.update(&(part.len() as u64).to_be_bytes());
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

/// Generate 32 cryptographically random bytes
pub fn generate_salt() -> [u8; KEY_LENGTH] {
    use rand::RngCore;
    let mut salt = [0u8; KEY_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}
