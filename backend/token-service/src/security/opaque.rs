//! Opaque refresh-token wrap.
//!
//! The authorization engine hands refresh tokens to clients as an
//! AES-256-GCM-encrypted JSON payload, base64url-encoded with the nonce
//! prepended. This side only needs the reversible decode to recover the
//! `refresh_token_id` field; the encrypt half exists for the engine-facing
//! fixtures. Any structural defect maps to `MalformedToken` — extraction
//! never falls back to a default identifier.

use crate::error::{Result, TokenError};
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::prelude::*;

const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct OpaqueTokenCipher {
    cipher: Aes256Gcm,
}

impl OpaqueTokenCipher {
    /// Build a cipher from the base64-encoded 256-bit key shared with the
    /// authorization engine.
    pub fn new(key_base64: &str) -> Result<Self> {
        let key = BASE64_STANDARD.decode(key_base64).map_err(|_| {
            TokenError::Internal("refresh token key is not valid base64".to_string())
        })?;

        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| {
            TokenError::Internal("refresh token key must be 32 bytes".to_string())
        })?;

        Ok(Self { cipher })
    }

    /// Wrap a JSON payload the way the engine does. Used by fixtures and
    /// the engine-side tooling; production decode-only paths never call it.
    pub fn encrypt_payload(&self, payload: &serde_json::Value) -> Result<String> {
        let plaintext = serde_json::to_vec(payload)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_ref())
            .map_err(|_| TokenError::Internal("refresh token encryption failed".to_string()))?;

        let mut raw = nonce.to_vec();
        raw.extend_from_slice(&ciphertext);
        Ok(BASE64_URL_SAFE_NO_PAD.encode(raw))
    }

    /// Unwrap an opaque token to its JSON payload.
    pub fn decrypt(&self, token: &str) -> Result<serde_json::Value> {
        let raw = BASE64_URL_SAFE_NO_PAD.decode(token).map_err(|_| {
            TokenError::MalformedToken("refresh token is not valid base64url".to_string())
        })?;

        if raw.len() <= NONCE_LEN {
            return Err(TokenError::MalformedToken(
                "refresh token payload is too short".to_string(),
            ));
        }

        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                TokenError::MalformedToken("refresh token failed to decrypt".to_string())
            })?;

        serde_json::from_slice(&plaintext).map_err(|_| {
            TokenError::MalformedToken("decrypted refresh token is not JSON".to_string())
        })
    }

    /// Recover the refresh token identifier from an opaque token.
    pub fn extract_refresh_token_id(&self, token: &str) -> Result<String> {
        let payload = self.decrypt(token)?;
        payload
            .get("refresh_token_id")
            .and_then(|value| value.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                TokenError::MalformedToken(
                    "decrypted refresh token missing refresh_token_id".to_string(),
                )
            })
    }
}
