pub mod encryption;
pub mod keys;
pub mod password;

pub use encryption::*;
pub use keys::*;
pub use password::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: wrong key or corrupted data")]
    DecryptionFailed,

    #[error("Corrupted sealed data")]
    CorruptedData,

    #[error("Key derivation failed")]
    KeyDerivation,

    #[error("Invalid server secret: {0}")]
    InvalidSecret(String),

    #[error("Malformed password hash")]
    MalformedHash,
}
