use std::fs;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64_ENGINE;
use base64::Engine as _;
use md5::Md5;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};

use crate::crypto::CryptoError;
use crate::net::packet::{PacketReader, PacketWriter};

const HANDSHAKE_KEY_FILE: &str = "handshake.key";
const SIGN_1024_KEY_FILE: &str = "sign1024.key";
const SIGN_2048_KEY_FILE: &str = "sign2048.key";

const HANDSHAKE_KEY_BITS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignKeySize {
    Bits1024,
    Bits2048,
}

/// Long-lived server key material: the handshake encryption pair the clients
/// encrypt credentials against, plus the signing pairs whose public halves
/// ship with the client.
pub struct AuthKeyring {
    handshake: RsaPrivateKey,
    signer_1024: RsaPrivateKey,
    signer_2048: RsaPrivateKey,
}

impl AuthKeyring {
    pub fn generate() -> Result<Self, CryptoError> {
        let mut rng = rand::thread_rng();
        Ok(Self {
            handshake: RsaPrivateKey::new(&mut rng, HANDSHAKE_KEY_BITS)
                .map_err(|err| CryptoError::Key(err.to_string()))?,
            signer_1024: RsaPrivateKey::new(&mut rng, 1024)
                .map_err(|err| CryptoError::Key(err.to_string()))?,
            signer_2048: RsaPrivateKey::new(&mut rng, 2048)
                .map_err(|err| CryptoError::Key(err.to_string()))?,
        })
    }

    /// Loads persisted keys from `dir`, generating and writing them on first
    /// start. Key generation happens once per install, not per boot.
    pub fn load_or_generate(dir: &Path) -> Result<Self, String> {
        let handshake = load_key(dir, HANDSHAKE_KEY_FILE)?;
        let signer_1024 = load_key(dir, SIGN_1024_KEY_FILE)?;
        let signer_2048 = load_key(dir, SIGN_2048_KEY_FILE)?;
        match (handshake, signer_1024, signer_2048) {
            (Some(handshake), Some(signer_1024), Some(signer_2048)) => Ok(Self {
                handshake,
                signer_1024,
                signer_2048,
            }),
            _ => {
                let keyring = Self::generate().map_err(|err| err.to_string())?;
                fs::create_dir_all(dir)
                    .map_err(|err| format!("key directory create failed: {}", err))?;
                store_key(dir, HANDSHAKE_KEY_FILE, &keyring.handshake)?;
                store_key(dir, SIGN_1024_KEY_FILE, &keyring.signer_1024)?;
                store_key(dir, SIGN_2048_KEY_FILE, &keyring.signer_2048)?;
                Ok(keyring)
            }
        }
    }

    fn signer(&self, size: SignKeySize) -> &RsaPrivateKey {
        match size {
            SignKeySize::Bits1024 => &self.signer_1024,
            SignKeySize::Bits2048 => &self.signer_2048,
        }
    }

    pub fn verifier(&self, size: SignKeySize) -> RsaPublicKey {
        self.signer(size).to_public_key()
    }

    pub fn handshake_public(&self) -> RsaPublicKey {
        self.handshake.to_public_key()
    }

    /// Challenge payload: `[mod_len:u16][modulus][sig_len:u16][signature]`,
    /// signature = PKCS1v15-MD5 over the modulus bytes.
    pub fn challenge_blob(&self, size: SignKeySize) -> Result<Vec<u8>, CryptoError> {
        let modulus = self.handshake.to_public_key().n().to_bytes_be();
        let digest = Md5::digest(&modulus);
        let signature = self
            .signer(size)
            .sign(Pkcs1v15Sign::new::<Md5>(), &digest)
            .map_err(|_| CryptoError::Sign)?;
        let mut writer = PacketWriter::with_capacity(4 + modulus.len() + signature.len());
        writer.write_u16_le(modulus.len() as u16);
        writer.write_bytes(&modulus);
        writer.write_u16_le(signature.len() as u16);
        writer.write_bytes(&signature);
        Ok(writer.into_vec())
    }

    pub fn decrypt_handshake(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.handshake
            .decrypt(Oaep::new::<Sha1>(), ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }
}

/// Client-side verification of a challenge blob against a trusted verifying
/// key. Returns the advertised handshake modulus.
pub fn verify_challenge_blob(
    blob: &[u8],
    verifier: &RsaPublicKey,
) -> Result<Vec<u8>, CryptoError> {
    let mut reader = PacketReader::new(blob);
    let mod_len = reader.read_u16_le().ok_or(CryptoError::Verify)? as usize;
    let modulus = reader
        .read_bytes(mod_len)
        .ok_or(CryptoError::Verify)?
        .to_vec();
    let sig_len = reader.read_u16_le().ok_or(CryptoError::Verify)? as usize;
    let signature = reader.read_bytes(sig_len).ok_or(CryptoError::Verify)?;
    let digest = Md5::digest(&modulus);
    verifier
        .verify(Pkcs1v15Sign::new::<Md5>(), &digest, signature)
        .map_err(|_| CryptoError::Verify)?;
    Ok(modulus)
}

/// Client-side handshake encryption, also used by the tests.
pub fn encrypt_handshake(
    public: &RsaPublicKey,
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let mut rng = rand::thread_rng();
    public
        .encrypt(&mut rng, Oaep::new::<Sha1>(), plaintext)
        .map_err(|_| CryptoError::Encrypt)
}

fn load_key(dir: &Path, name: &str) -> Result<Option<RsaPrivateKey>, String> {
    let path = dir.join(name);
    let encoded = match fs::read_to_string(&path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(format!("key read failed for {}: {}", path.display(), err)),
    };
    let der = BASE64_ENGINE
        .decode(encoded.trim())
        .map_err(|err| format!("key decode failed for {}: {}", path.display(), err))?;
    let key = RsaPrivateKey::from_pkcs8_der(&der)
        .map_err(|err| format!("key parse failed for {}: {}", path.display(), err))?;
    Ok(Some(key))
}

fn store_key(dir: &Path, name: &str, key: &RsaPrivateKey) -> Result<(), String> {
    let path = dir.join(name);
    let der = key
        .to_pkcs8_der()
        .map_err(|err| format!("key encode failed for {}: {}", path.display(), err))?;
    let encoded = BASE64_ENGINE.encode(der.as_bytes());
    fs::write(&path, encoded)
        .map_err(|err| format!("key write failed for {}: {}", path.display(), err))
}
