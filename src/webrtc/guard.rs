//! Signal signature guard
//!
//! Stamps negotiation signals with a digest over `(sender, request, timestamp)` and
//! rejects signals that are stale or were signed for another call. The digest is a
//! 32-bit string hash with no secret, so it only stops casual cross-call replay on a
//! shared relay; anyone who can read the relay can forge it.

use tracing::trace;

/// Default freshness window for signed signals
pub const DEFAULT_MAX_AGE_MS: i64 = 30_000;

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Current Unix time in milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Compute the signature for a signal sent by `user_id` in call `request_id`
pub fn sign(user_id: &str, request_id: &str, timestamp: i64) -> String {
    let data = format!("{}:{}:{}", user_id, request_id, timestamp);
    let mut hash: i32 = 0;
    for unit in data.encode_utf16() {
        hash = hash
            .wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(i32::from(unit));
    }
    to_base36(i64::from(hash).unsigned_abs())
}

/// Verify a signature against the current clock
pub fn verify(
    sender_id: &str,
    request_id: &str,
    timestamp: i64,
    signature: &str,
    max_age_ms: i64,
) -> bool {
    verify_at(now_ms(), sender_id, request_id, timestamp, signature, max_age_ms)
}

/// Verify a signature against an explicit clock reading
pub fn verify_at(
    now: i64,
    sender_id: &str,
    request_id: &str,
    timestamp: i64,
    signature: &str,
    max_age_ms: i64,
) -> bool {
    // Freshness is checked first, independent of the digest
    // Timestamps come off the wire, so the age may not fit in an i64
    let age = now.abs_diff(timestamp);
    if age > u64::try_from(max_age_ms).unwrap_or(0) {
        trace!("Signal from {} is stale ({} ms)", sender_id, age);
        return false;
    }
    sign(sender_id, request_id, timestamp) == signature
}

fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(BASE36[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

/// Guard bound to a single call
#[derive(Debug, Clone)]
pub struct SignatureGuard {
    request_id: String,
    max_age_ms: i64,
}

impl SignatureGuard {
    pub fn new(request_id: impl Into<String>, max_age_ms: i64) -> Self {
        Self {
            request_id: request_id.into(),
            max_age_ms,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Returns `(timestamp, signature)` for a signal sent now
    pub fn stamp(&self, user_id: &str) -> (i64, String) {
        let timestamp = now_ms();
        (timestamp, sign(user_id, &self.request_id, timestamp))
    }

    pub fn verify(&self, sender_id: &str, timestamp: i64, signature: &str) -> bool {
        self.verify_at(now_ms(), sender_id, timestamp, signature)
    }

    pub fn verify_at(&self, now: i64, sender_id: &str, timestamp: i64, signature: &str) -> bool {
        verify_at(
            now,
            sender_id,
            &self.request_id,
            timestamp,
            signature,
            self.max_age_ms,
        )
    }
}
