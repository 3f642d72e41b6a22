//! At-rest sealing for outbox mail bodies.
//!
//! Layout: `[version: 1][nonce: 12][ciphertext + tag]`. The version byte is
//! bound as associated data so a blob cannot be replayed under another format.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};

use super::keys::KEY_LENGTH;
use super::CryptoError;

const SEAL_VERSION: u8 = 1;
const NONCE_LENGTH: usize = 12;
const TAG_LENGTH: usize = 16;
const HEADER_LENGTH: usize = 1 + NONCE_LENGTH;

fn cipher(key: &[u8; KEY_LENGTH]) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key))
}

/// Seal a message body for storage under a fresh random nonce.
pub fn seal(key: &[u8; KEY_LENGTH], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut sealed = Vec::with_capacity(HEADER_LENGTH + plaintext.len() + TAG_LENGTH);
    sealed.push(SEAL_VERSION);
    sealed.resize(HEADER_LENGTH, 0);
    OsRng.fill_bytes(&mut sealed[1..HEADER_LENGTH]);

    let body = cipher(key)
        .encrypt(
            Nonce::from_slice(&sealed[1..HEADER_LENGTH]),
            Payload {
                msg: plaintext,
                aad: &[SEAL_VERSION],
            },
        )
        .map_err(|_| CryptoError::EncryptionFailed)?;
    sealed.extend_from_slice(&body);
    Ok(sealed)
}

/// Open a body sealed with [`seal`].
pub fn open(key: &[u8; KEY_LENGTH], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < HEADER_LENGTH + TAG_LENGTH || sealed[0] != SEAL_VERSION {
        return Err(CryptoError::CorruptedData);
    }
    let (header, body) = sealed.split_at(HEADER_LENGTH);
    cipher(key)
        .decrypt(
            Nonce::from_slice(&header[1..]),
            Payload {
                msg: body,
                aad: &header[..1],
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed)
}
