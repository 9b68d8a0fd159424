//! Password hashing compatible with the existing credential files.
//!
//! PBKDF2-HMAC-SHA512, 10 000 rounds, 128-byte output, base64 encoded. The
//! salt is 128 random bytes, base64 encoded, and the base64 *text* is what
//! goes into PBKDF2.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use latchkey_core::constants::{PASSWORD_HASH_LEN, PASSWORD_SALT_LEN, PBKDF2_ITERATIONS};
use rand::RngCore;
use sha2::Sha512;
use subtle::ConstantTimeEq;

/// Salt used for the dummy derivation on unknown names.
const DUMMY_SALT: &str = "bGF0Y2hrZXktZHVtbXktc2FsdA==";

/// Hash and salt as stored in a credential file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordHash {
    pub hash: String,
    pub salt: String,
}

/// Hash a new password with a fresh random salt.
pub fn hash_password(password: &str) -> PasswordHash {
    let mut salt = [0u8; PASSWORD_SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let salt = STANDARD.encode(salt);

    PasswordHash {
        hash: derive(password, &salt),
        salt,
    }
}

/// Derive the base64 hash of `password` under the stored `salt`.
pub fn derive(password: &str, salt: &str) -> String {
    let mut out = [0u8; PASSWORD_HASH_LEN];
    pbkdf2::pbkdf2_hmac::<Sha512>(
        password.as_bytes(),
        salt.as_bytes(),
        PBKDF2_ITERATIONS,
        &mut out,
    );
    STANDARD.encode(out)
}

/// Check `password` against a stored hash in constant time.
pub fn verify(password: &str, salt: &str, hash: &str) -> bool {
    let computed = derive(password, salt);
    computed.as_bytes().ct_eq(hash.as_bytes()).into()
}

/// Spend the same effort as [`verify`] without a stored record.
///
/// Keeps unknown names as slow as wrong passwords.
pub fn dummy_verify(password: &str) -> bool {
    let _ = derive(password, DUMMY_SALT);
    false
}
