use cipher::{KeyIvInit as _, StreamCipher};
use ctr::Ctr128BE;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use twofish::Twofish;

pub const CIPHER_KEY_LEN: usize = 16;

const KDF_LABEL: &[u8] = b"game-udp-cipher";

type TwofishCtr = Ctr128BE<Twofish>;

/// Expands the printable session key into the 16-byte datagram cipher key.
pub fn derive_cipher_key(session_key: &str) -> [u8; CIPHER_KEY_LEN] {
    let mut mac = Hmac::<Sha1>::new_from_slice(session_key.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(KDF_LABEL);
    let digest = mac.finalize().into_bytes();
    let mut key = [0u8; CIPHER_KEY_LEN];
    key.copy_from_slice(&digest[..CIPHER_KEY_LEN]);
    key
}

/// Per-session payload cipher. CTR keystream keyed by the derived session key
/// with the datagram sequence number as nonce prefix, so every reliable
/// datagram gets a distinct keystream until the seq space wraps.
#[derive(Clone, Copy)]
pub struct PayloadCipher {
    key: [u8; CIPHER_KEY_LEN],
}

impl PayloadCipher {
    pub fn new(key: [u8; CIPHER_KEY_LEN]) -> Self {
        Self { key }
    }

    pub fn from_session_key(session_key: &str) -> Self {
        Self::new(derive_cipher_key(session_key))
    }

    /// Encrypts or decrypts in place; CTR mode is its own inverse.
    pub fn apply(&self, seq: u16, data: &mut [u8]) {
        let mut iv = [0u8; 16];
        iv[..2].copy_from_slice(&seq.to_be_bytes());
        let mut cipher = TwofishCtr::new_from_slices(&self.key, &iv)
            .expect("Twofish accepts 128-bit keys");
        cipher.apply_keystream(data);
    }
}
