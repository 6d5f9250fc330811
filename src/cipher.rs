//! AES-256-GCM token encryption.
//!
//! Tokens rest in SQLite as a versioned envelope:
//! `base64(version || nonce || ciphertext+tag)`. The key comes from the
//! `MAILWATCH_TOKEN_KEY` environment variable as 64 hex characters. Losing
//! the key only forces accounts through a re-consent, so there is no key
//! rotation machinery here.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};

use crate::credentials::SecretCipher;

pub const TOKEN_KEY_ENV: &str = "MAILWATCH_TOKEN_KEY";
const KEY_BYTES: usize = 32;
const NONCE_BYTES: usize = 12;
const ENVELOPE_VERSION: u8 = 1;

pub struct AesGcmCipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl AesGcmCipher {
    pub fn new(key_bytes: &[u8]) -> Result<Self, String> {
        if key_bytes.len() != KEY_BYTES {
            return Err(format!(
                "token key must be {} bytes, got {}",
                KEY_BYTES,
                key_bytes.len()
            ));
        }
        let unbound = UnboundKey::new(&AES_256_GCM, key_bytes)
            .map_err(|_| "invalid AES-256-GCM key".to_string())?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Build a cipher from the `MAILWATCH_TOKEN_KEY` env var (64 hex chars).
    pub fn from_env() -> Result<Self, String> {
        let raw = std::env::var(TOKEN_KEY_ENV)
            .map_err(|_| format!("{} is not set", TOKEN_KEY_ENV))?;
        let bytes = hex::decode(raw.trim())
            .map_err(|e| format!("{} is not valid hex: {}", TOKEN_KEY_ENV, e))?;
        Self::new(&bytes)
    }
}

impl SecretCipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String, String> {
        let mut nonce_bytes = [0u8; NONCE_BYTES];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| "nonce generation failed".to_string())?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut buf = plaintext.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut buf)
            .map_err(|_| "encryption failed".to_string())?;

        let mut envelope = Vec::with_capacity(1 + NONCE_BYTES + buf.len());
        envelope.push(ENVELOPE_VERSION);
        envelope.extend_from_slice(&nonce_bytes);
        envelope.extend_from_slice(&buf);
        Ok(STANDARD.encode(envelope))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String, String> {
        let envelope = STANDARD
            .decode(ciphertext.trim())
            .map_err(|e| format!("bad token envelope encoding: {}", e))?;
        if envelope.len() < 1 + NONCE_BYTES {
            return Err("token envelope too short".to_string());
        }
        if envelope[0] != ENVELOPE_VERSION {
            return Err(format!("unknown token envelope version {}", envelope[0]));
        }

        let mut nonce_bytes = [0u8; NONCE_BYTES];
        nonce_bytes.copy_from_slice(&envelope[1..1 + NONCE_BYTES]);
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut buf = envelope[1 + NONCE_BYTES..].to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut buf)
            .map_err(|_| "token decryption failed (wrong key?)".to_string())?;
        String::from_utf8(plaintext.to_vec()).map_err(|e| format!("token not UTF-8: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> AesGcmCipher {
        AesGcmCipher::new(&[7u8; 32]).unwrap()
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let c = cipher();
        let sealed = c.encrypt("ya29.secret-token").unwrap();
        assert_ne!(sealed, "ya29.secret-token");
        assert_eq!(c.decrypt(&sealed).unwrap(), "ya29.secret-token");
    }

    #[test]
    fn each_encryption_uses_a_fresh_nonce() {
        let c = cipher();
        let a = c.encrypt("same").unwrap();
        let b = c.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails_closed() {
        let sealed = cipher().encrypt("tok").unwrap();
        let other = AesGcmCipher::new(&[9u8; 32]).unwrap();
        assert!(other.decrypt(&sealed).is_err());
    }

    #[test]
    fn rejects_short_and_unversioned_envelopes() {
        let c = cipher();
        assert!(c.decrypt("AAAA").is_err());

        let mut envelope = vec![99u8];
        envelope.extend_from_slice(&[0u8; 30]);
        assert!(c.decrypt(&STANDARD.encode(envelope)).is_err());
    }

    #[test]
    fn rejects_bad_key_length() {
        assert!(AesGcmCipher::new(&[1u8; 16]).is_err());
    }
}
