//! Job-scoped tokens the executor uses to call back into the CI server.

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::{ExecResult, ExecutorError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTokenClaims {
    pub job: String,
    pub exp: i64,
    pub jti: String,
}

/// Signs `{hex(claims)}.{hex(hmac-sha256)}` tokens.
#[derive(Clone)]
pub struct JobTokenSigner {
    secret: Vec<u8>,
    validity: Duration,
}

impl JobTokenSigner {
    pub fn new(secret: impl AsRef<[u8]>, validity_hours: i64) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            validity: Duration::hours(validity_hours),
        }
    }

    pub fn sign(&self, job_name: &str, now: DateTime<Utc>) -> ExecResult<String> {
        let claims = JobTokenClaims {
            job: job_name.to_string(),
            exp: (now + self.validity).timestamp(),
            jti: uuid::Uuid::new_v4().to_string(),
        };
        let payload = serde_json::to_vec(&claims)?;
        let signature = self.mac(&payload).finalize().into_bytes();
        Ok(format!("{}.{}", hex::encode(&payload), hex::encode(signature)))
    }

    /// Check signature and expiry, returning the claims.
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> ExecResult<JobTokenClaims> {
        let invalid = || ExecutorError::Core(convoy_core::Error::InvalidInput("invalid job token".into()));

        let (payload_hex, sig_hex) = token.split_once('.').ok_or_else(invalid)?;
        let payload = hex::decode(payload_hex).map_err(|_| invalid())?;
        let signature = hex::decode(sig_hex).map_err(|_| invalid())?;

        self.mac(&payload)
            .verify_slice(&signature)
            .map_err(|_| invalid())?;

        let claims: JobTokenClaims = serde_json::from_slice(&payload)?;
        if claims.exp < now.timestamp() {
            return Err(ExecutorError::Core(convoy_core::Error::InvalidInput(
                "job token expired".into(),
            )));
        }
        Ok(claims)
    }

    fn mac(&self, payload: &[u8]) -> Hmac<Sha256> {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.secret).expect("HMAC can take any size key");
        mac.update(payload);
        mac
    }
}
