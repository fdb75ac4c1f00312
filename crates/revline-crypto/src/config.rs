use serde::{Deserialize, Serialize};

/// Tunables for the encryption core.
///
/// Deserializable so the host app can keep it alongside its other settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Pre-keys generated when a fresh account is created.
    pub initial_pre_keys: usize,
    /// Below this many unconsumed pre-keys the account asks for more.
    pub pre_key_low_watermark: usize,
    /// Upper bound on the pre-key pool; the oldest keys are evicted past it.
    pub max_pre_keys: usize,
    /// How far ahead of the last consumed index a message may be.
    pub max_skip: u32,
    /// Skipped message keys buffered per pairwise session.
    pub max_stored_skipped_keys: usize,
    /// Outbound group sessions should rotate after this many messages...
    pub group_rotation_messages: u32,
    /// ...or after this many seconds, whichever comes first.
    pub group_rotation_period_secs: u64,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            initial_pre_keys: 5,
            pre_key_low_watermark: 2,
            max_pre_keys: 100,
            max_skip: 2000,
            max_stored_skipped_keys: 2000,
            group_rotation_messages: 100,
            group_rotation_period_secs: 7 * 24 * 60 * 60,
        }
    }
}
