//! Secret envelope codec.

use crate::Result;

/// Encrypts pipeline secrets into envelopes embedded in manifests and
/// configuration, and re-keys them for a single executor job.
pub trait SecretCodec: Send + Sync {
    /// Re-encrypt every envelope found in `blob` with a freshly generated
    /// key. Envelopes restricted to other pipelines than `pipeline` are
    /// rejected. Returns the rewritten blob and the new key.
    fn reencrypt_all_envelopes(&self, blob: &str, pipeline: &str) -> Result<(String, String)>;

    /// Encrypt `value` into an envelope usable by pipelines matching
    /// `pipeline_whitelist` (a regular expression, `.*` for all).
    fn encrypt_envelope(&self, value: &str, pipeline_whitelist: &str) -> Result<String>;
}
