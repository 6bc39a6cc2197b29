use base64::{engine::general_purpose::STANDARD, Engine};
use openssl::rand::rand_bytes;
use openssl::symm::{decrypt_aead, encrypt_aead, Cipher};
use sha2::{Digest, Sha256};
use thiserror::Error;

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    Seal(String),
    #[error("sealed value is malformed")]
    Malformed,
    #[error("decryption failed")]
    Open,
}

/// SHA-256 hex digest of a raw API key. This is the only form in which keys
/// are looked up and cached.
pub fn hash_api_key(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// AES-256-GCM with a key derived from the configured secret. Sealed values
/// are `base64(iv || ciphertext || tag)`.
#[derive(Clone)]
pub struct SecretCipher {
    key: [u8; 32],
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretCipher(..)")
    }
}

impl SecretCipher {
    pub fn new(secret: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        Self {
            key: hasher.finalize().into(),
        }
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, CryptoError> {
        let mut iv = [0u8; IV_LEN];
        rand_bytes(&mut iv).map_err(|e| CryptoError::Seal(e.to_string()))?;
        let mut tag = [0u8; TAG_LEN];
        let ciphertext = encrypt_aead(
            Cipher::aes_256_gcm(),
            &self.key,
            Some(&iv),
            &[],
            plaintext.as_bytes(),
            &mut tag,
        )
        .map_err(|e| CryptoError::Seal(e.to_string()))?;

        let mut out = Vec::with_capacity(IV_LEN + ciphertext.len() + TAG_LEN);
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        out.extend_from_slice(&tag);
        Ok(STANDARD.encode(out))
    }

    pub fn open(&self, sealed: &str) -> Result<String, CryptoError> {
        let raw = STANDARD.decode(sealed.trim()).map_err(|_| CryptoError::Malformed)?;
        if raw.len() < IV_LEN + TAG_LEN {
            return Err(CryptoError::Malformed);
        }
        let (iv, rest) = raw.split_at(IV_LEN);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);
        let plaintext = decrypt_aead(Cipher::aes_256_gcm(), &self.key, Some(iv), &[], ciphertext, tag)
            .map_err(|_| CryptoError::Open)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::Malformed)
    }
}
