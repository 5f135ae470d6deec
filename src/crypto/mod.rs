pub mod keys;
pub mod stream;

use rand::Rng;
use sha1::{Digest, Sha1};

pub const SALT_LEN: usize = 32;
pub const SESSION_KEY_LEN: usize = 48;

const ALPHANUMERIC: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    Decrypt,
    Encrypt,
    Sign,
    Verify,
    Key(String),
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::Decrypt => write!(f, "decryption failed"),
            CryptoError::Encrypt => write!(f, "encryption failed"),
            CryptoError::Sign => write!(f, "signing failed"),
            CryptoError::Verify => write!(f, "signature verification failed"),
            CryptoError::Key(err) => write!(f, "key error: {}", err),
        }
    }
}

/// SHA-1 over `salt ∥ password`, rendered as 40 lowercase hex chars.
pub fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    to_hex(&hasher.finalize())
}

pub fn generate_salt(length: usize) -> String {
    random_string(length.max(SALT_LEN))
}

/// Opaque printable token shared across Auth, Game and Margin for one session.
pub fn generate_session_key() -> String {
    random_string(SESSION_KEY_LEN)
}

fn random_string(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| ALPHANUMERIC[rng.gen_range(0..ALPHANUMERIC.len())] as char)
        .collect()
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

/// Comparison whose duration depends only on the input lengths, not content.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
