use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::RngCore;

use crate::error::{Error, Result};

const NONCE_LEN: usize = 12;

/// AEAD black box for credential-at-rest encryption (§6, §9). Each call
/// picks a fresh random 12-byte nonce and stores it alongside the
/// ciphertext; the stored form is `base64(nonce || ciphertext)`.
pub fn encrypt(key: &[u8; 32], plaintext: &str) -> Result<String> {
    let cipher = ChaCha20Poly1305::new(key.into());
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| Error::Fatal(anyhow::anyhow!("encryption failed: {e}")))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(base64::engine::general_purpose::STANDARD.encode(out))
}

pub fn decrypt(key: &[u8; 32], stored: &str) -> Result<String> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(stored)
        .map_err(|e| Error::Fatal(anyhow::anyhow!("stored ciphertext is not valid base64: {e}")))?;
    if raw.len() < NONCE_LEN {
        return Err(Error::Fatal(anyhow::anyhow!("stored ciphertext is too short")));
    }
    let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(key.into());
    let nonce = Nonce::from_slice(nonce_bytes);

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| Error::Fatal(anyhow::anyhow!("decryption failed: {e}")))?;
    String::from_utf8(plaintext).map_err(|e| Error::Fatal(anyhow::anyhow!("decrypted credential is not utf8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_and_uses_fresh_nonces() {
        let key = [7u8; 32];
        let a = encrypt(&key, "super-secret-key").unwrap();
        let b = encrypt(&key, "super-secret-key").unwrap();
        assert_ne!(a, b, "nonce must be fresh per call");
        assert_eq!(decrypt(&key, &a).unwrap(), "super-secret-key");
        assert_eq!(decrypt(&key, &b).unwrap(), "super-secret-key");
    }

    #[test]
    fn rejects_tampered_ciphertext() {
        let key = [1u8; 32];
        let mut stored = encrypt(&key, "access-key-id").unwrap();
        stored.push('A');
        assert!(decrypt(&key, &stored).is_err());
    }
}
