//! Symmetric sealing of credentials forwarded to remote providers.
//!
//! The key is an operator-supplied string; it is stretched to 256 bits with
//! SHA-256 and used with AES-GCM. The sealed form is
//! `base64(nonce || ciphertext)`, wrapped in a `$decrypt` envelope so the
//! receiving side can tell sealed values from plain ones.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("sealing failed")]
    Seal,

    #[error("sealed value is malformed")]
    Malformed,
}

fn cipher(key: &str) -> Aes256Gcm {
    let digest = Sha256::digest(key.as_bytes());
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&digest))
}

/// Seal a secret with the given key.
pub fn seal(plaintext: &str, key: &str) -> Result<String, CryptoError> {
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher(key)
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|_| CryptoError::Seal)?;
    let mut sealed = nonce.to_vec();
    sealed.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(sealed))
}

/// Reverse of [`seal`].
pub fn open(sealed: &str, key: &str) -> Result<String, CryptoError> {
    let raw = BASE64.decode(sealed).map_err(|_| CryptoError::Malformed)?;
    if raw.len() <= NONCE_LEN {
        return Err(CryptoError::Malformed);
    }
    let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
    let plaintext = cipher(key)
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Malformed)?;
    String::from_utf8(plaintext).map_err(|_| CryptoError::Malformed)
}

/// The wire envelope for a sealed value: `{"$decrypt": {"value": <sealed>}}`.
pub fn envelope(sealed: String) -> Value {
    json!({"$decrypt": {"value": sealed}})
}

/// Unwrap a `$decrypt` envelope and open it. Plain strings pass through
/// untouched; an envelope without a usable key is an error.
pub fn open_envelope(value: &Value, key: Option<&str>) -> Result<String, CryptoError> {
    match value {
        Value::String(plain) => Ok(plain.clone()),
        Value::Object(map) => {
            let sealed = map
                .get("$decrypt")
                .and_then(|d| d.get("value"))
                .and_then(Value::as_str)
                .ok_or(CryptoError::Malformed)?;
            let key = key.ok_or(CryptoError::Malformed)?;
            open(sealed, key)
        }
        _ => Err(CryptoError::Malformed),
    }
}
