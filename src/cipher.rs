//! At-rest sealing of mailbox and account secrets
//!
//! Secrets written to the credential store or attached to linked
//! artifacts are sealed with AES-256-GCM when a master key is
//! configured. Sealed values carry an `enc:` prefix followed by the
//! base64 encoding of `<12-byte nonce><ciphertext>`; values without the
//! prefix are treated as plain text, so stores written without a key
//! keep working once one is configured.

use crate::error::{Error, Result};
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use std::fmt;

const SEALED_PREFIX: &str = "enc:";
const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

/// AES-256-GCM sealer for secrets at rest.
#[derive(Clone)]
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl SecretCipher {
    /// Build a cipher from a 64-character hex key (32 bytes).
    pub fn from_hex_key(key_hex: &str) -> Result<Self> {
        let key = hex_decode(key_hex.trim())
            .map_err(|e| Error::Config(format!("Invalid master key: {e}")))?;

        if key.len() != KEY_SIZE {
            return Err(Error::Config(format!(
                "Master key must be {KEY_SIZE} bytes (64 hex chars), got {} bytes",
                key.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| Error::Config(format!("Invalid master key: {e}")))?;
        Ok(Self { cipher })
    }

    /// Seal a plaintext secret.
    pub fn seal(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| Error::Crypto(e.to_string()))?;

        let mut combined = nonce.to_vec();
        combined.extend(ciphertext);
        Ok(format!("{SEALED_PREFIX}{}", STANDARD.encode(combined)))
    }

    /// Open a stored secret. Values without the sealed prefix are
    /// returned unchanged.
    pub fn open(&self, stored: &str) -> Result<String> {
        let Some(encoded) = stored.strip_prefix(SEALED_PREFIX) else {
            return Ok(stored.to_string());
        };

        let combined = STANDARD
            .decode(encoded)
            .map_err(|e| Error::Crypto(format!("Invalid base64: {e}")))?;
        if combined.len() < NONCE_SIZE {
            return Err(Error::Crypto("Sealed secret too short".into()));
        }

        let (nonce, ciphertext) = combined.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| Error::Crypto(e.to_string()))?;

        String::from_utf8(plaintext).map_err(|e| Error::Crypto(format!("Invalid UTF-8: {e}")))
    }
}

impl fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretCipher([REDACTED])")
    }
}

/// Whether a stored value was produced by [`SecretCipher::seal`].
#[must_use]
pub fn is_sealed(stored: &str) -> bool {
    stored.starts_with(SEALED_PREFIX)
}

/// Seal `plaintext` when a cipher is configured, otherwise keep it as is.
pub fn seal_optional(cipher: Option<&SecretCipher>, plaintext: &str) -> Result<String> {
    cipher.map_or_else(|| Ok(plaintext.to_string()), |c| c.seal(plaintext))
}

/// Open `stored` with the configured cipher.
///
/// A sealed value without a cipher is an error: the key needed to read
/// it is missing.
pub fn open_optional(cipher: Option<&SecretCipher>, stored: &str) -> Result<String> {
    match cipher {
        Some(c) => c.open(stored),
        None if is_sealed(stored) => Err(Error::Config(
            "Secret is sealed but no master key is configured".into(),
        )),
        None => Ok(stored.to_string()),
    }
}

fn hex_decode(hex: &str) -> std::result::Result<Vec<u8>, String> {
    if !hex.len().is_multiple_of(2) {
        return Err("hex string must have even length".to_string());
    }

    (0..hex.len())
        .step_by(2)
        .map(|i| {
            hex.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| format!("invalid hex at position {i}"))
        })
        .collect()
}
