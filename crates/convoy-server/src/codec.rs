//! AES-256-GCM secret envelopes.
//!
//! An envelope looks like `convoy.secret(<nonce hex>.<ciphertext hex>)`. The
//! ciphertext holds the value together with a regular expression of the
//! pipelines allowed to decrypt it.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use convoy_core::secret::SecretCodec;
use convoy_core::{Error, Result};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use tracing::warn;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Whitelist matching every pipeline.
pub const ALL_PIPELINES: &str = ".*";

static ENVELOPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"convoy\.secret\(([0-9a-f]+)\.([0-9a-f]+)\)").unwrap());

#[derive(Debug, Serialize, Deserialize)]
struct Payload {
    value: String,
    pipelines: String,
}

pub struct AesEnvelopeCodec {
    cipher: Aes256Gcm,
}

impl AesEnvelopeCodec {
    /// Create a codec from a hex-encoded 256-bit key.
    pub fn from_hex(key: &str) -> Result<Self> {
        let bytes = hex::decode(key.trim()).map_err(|e| Error::Codec(format!("invalid key: {e}")))?;
        Self::from_bytes(&bytes)
    }

    fn from_bytes(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_LEN {
            return Err(Error::Codec(format!(
                "key must be {KEY_LEN} bytes, got {}",
                key.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| Error::Codec(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// A codec with a freshly generated key, returned hex-encoded.
    fn generate() -> (Self, String) {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        let codec = Self {
            cipher: Aes256Gcm::new(&key),
        };
        (codec, hex::encode(key))
    }

    fn seal(&self, payload: &Payload) -> Result<String> {
        let plaintext = serde_json::to_vec(payload).map_err(|e| Error::Codec(e.to_string()))?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|e| Error::Codec(format!("encryption failed: {e}")))?;
        Ok(format!(
            "convoy.secret({}.{})",
            hex::encode(nonce),
            hex::encode(ciphertext)
        ))
    }

    fn open(&self, nonce: &str, ciphertext: &str) -> Result<Payload> {
        let nonce = hex::decode(nonce).map_err(|e| Error::Codec(e.to_string()))?;
        if nonce.len() != NONCE_LEN {
            return Err(Error::Codec("malformed envelope nonce".to_string()));
        }
        let ciphertext = hex::decode(ciphertext).map_err(|e| Error::Codec(e.to_string()))?;
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| Error::Codec("envelope cannot be decrypted with this key".to_string()))?;
        serde_json::from_slice(&plaintext).map_err(|e| Error::Codec(e.to_string()))
    }

    /// Decrypt a single envelope, checking `pipeline` against its whitelist.
    pub fn decrypt_envelope(&self, envelope: &str, pipeline: &str) -> Result<String> {
        let captures = ENVELOPE
            .captures(envelope)
            .ok_or_else(|| Error::Codec("not a secret envelope".to_string()))?;
        let payload = self.open(&captures[1], &captures[2])?;
        check_whitelist(&payload.pipelines, pipeline)?;
        Ok(payload.value)
    }
}

fn is_whitelisted(pipelines: &str, pipeline: &str) -> Result<bool> {
    let whitelist = Regex::new(&format!("^(?:{pipelines})$"))
        .map_err(|e| Error::Codec(format!("invalid pipeline whitelist: {e}")))?;
    Ok(whitelist.is_match(pipeline))
}

fn check_whitelist(pipelines: &str, pipeline: &str) -> Result<()> {
    if is_whitelisted(pipelines, pipeline)? {
        Ok(())
    } else {
        Err(Error::Codec(format!("secret is not allowed for pipeline {pipeline}")))
    }
}

impl SecretCodec for AesEnvelopeCodec {
    fn reencrypt_all_envelopes(&self, blob: &str, pipeline: &str) -> Result<(String, String)> {
        let (job_codec, job_key) = Self::generate();

        // Envelopes restricted to other pipelines are blanked, not resealed.
        let mut failure = None;
        let rewritten = ENVELOPE.replace_all(blob, |caps: &Captures| {
            let resealed = self.open(&caps[1], &caps[2]).and_then(|payload| {
                if is_whitelisted(&payload.pipelines, pipeline)? {
                    job_codec.seal(&payload)
                } else {
                    warn!(pipeline, "Dropping secret not allowed for pipeline");
                    Ok(String::new())
                }
            });
            match resealed {
                Ok(envelope) => envelope,
                Err(e) => {
                    failure.get_or_insert(e);
                    String::new()
                }
            }
        });

        if let Some(e) = failure {
            return Err(e);
        }
        Ok((rewritten.into_owned(), job_key))
    }

    fn encrypt_envelope(&self, value: &str, pipeline_whitelist: &str) -> Result<String> {
        Regex::new(pipeline_whitelist)
            .map_err(|e| Error::Codec(format!("invalid pipeline whitelist: {e}")))?;
        self.seal(&Payload {
            value: value.to_string(),
            pipelines: pipeline_whitelist.to_string(),
        })
    }
}
