//! Webhook front-end: signature verification and result-to-re-entry mapping
//!
//! The webhook itself (an HTTP endpoint) is out of scope here; this module
//! provides the two pieces a binary wiring one up needs: verifying an
//! incoming delivery's HMAC signature against a current/next key pair (to
//! support rotation without downtime), and mapping an [`ExecutionOutcome`]
//! to the re-entry the scheduler should arrange next.

use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::execution::ExecutionOutcome;

type HmacSha256 = Hmac<Sha256>;

/// Verifies webhook deliveries against a current signing key and, during
/// rotation, a next key. A signature matching either is accepted.
pub struct WebhookVerifier {
    current_key: String,
    next_key: Option<String>,
}

impl WebhookVerifier {
    pub fn new(current_key: String, next_key: Option<String>) -> Self {
        Self { current_key, next_key }
    }

    /// `signature_hex` is the hex-encoded HMAC-SHA256 of `body`.
    pub fn verify(&self, body: &[u8], signature_hex: &str) -> bool {
        Self::verify_with_key(&self.current_key, body, signature_hex)
            || self
                .next_key
                .as_deref()
                .is_some_and(|key| Self::verify_with_key(key, body, signature_hex))
    }

    fn verify_with_key(key: &str, body: &[u8], signature_hex: &str) -> bool {
        let Ok(signature) = hex::decode(signature_hex) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(key.as_bytes()) else {
            return false;
        };
        mac.update(body);
        mac.verify_slice(&signature).is_ok()
    }
}

/// Drop messages older than this (spec.md §4.8); the endpoint should still
/// ack (return success) to prevent endless re-delivery from the sender.
pub const MESSAGE_AGE_CAP: Duration = Duration::from_secs(86_400);

pub fn is_too_old(created_at_epoch_ms: i64, now_epoch_ms: i64, cap: Duration) -> bool {
    now_epoch_ms.saturating_sub(created_at_epoch_ms) > cap.as_millis() as i64
}

/// What the scheduler should do next, derived from one executor delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum ReentryDecision {
    /// Terminal for this delivery; no further scheduling.
    Ack,
    ScheduleAfter { delay: Duration, retry_count: i32 },
    ScheduleAt { epoch_ms: i64 },
}

pub fn decide_reentry(outcome: &ExecutionOutcome) -> ReentryDecision {
    match outcome {
        ExecutionOutcome::Completed { .. } | ExecutionOutcome::Cancelled => ReentryDecision::Ack,
        ExecutionOutcome::Sleeping { wake_at_epoch_ms } => ReentryDecision::ScheduleAt {
            epoch_ms: *wake_at_epoch_ms,
        },
        ExecutionOutcome::WaitingForSignal {
            timeout_at_epoch_ms, ..
        } => match timeout_at_epoch_ms {
            Some(epoch_ms) => ReentryDecision::ScheduleAt { epoch_ms: *epoch_ms },
            None => ReentryDecision::Ack,
        },
        // A fatal failure is already recorded on the execution row; nothing
        // left for the scheduler to do. Retryable failures surface as
        // `NeedsRetry`, not `Failed`, by the time they reach here.
        ExecutionOutcome::Failed { .. } => ReentryDecision::Ack,
        ExecutionOutcome::NeedsRetry { delay, retry_count } => ReentryDecision::ScheduleAfter {
            delay: *delay,
            retry_count: *retry_count,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifies_signature_with_current_key() {
        let verifier = WebhookVerifier::new("current-secret".into(), None);
        let body = b"{\"executionId\":\"abc\"}";

        let mut mac = HmacSha256::new_from_slice(b"current-secret").unwrap();
        mac.update(body);
        let signature = hex::encode(mac.finalize().into_bytes());

        assert!(verifier.verify(body, &signature));
    }

    #[test]
    fn accepts_signature_from_next_key_during_rotation() {
        let verifier = WebhookVerifier::new("current-secret".into(), Some("next-secret".into()));
        let body = b"payload";

        let mut mac = HmacSha256::new_from_slice(b"next-secret").unwrap();
        mac.update(body);
        let signature = hex::encode(mac.finalize().into_bytes());

        assert!(verifier.verify(body, &signature));
    }

    #[test]
    fn rejects_signature_from_unknown_key() {
        let verifier = WebhookVerifier::new("current-secret".into(), None);
        let body = b"payload";

        let mut mac = HmacSha256::new_from_slice(b"wrong-secret").unwrap();
        mac.update(body);
        let signature = hex::encode(mac.finalize().into_bytes());

        assert!(!verifier.verify(body, &signature));
    }

    #[test]
    fn age_cap_drops_old_messages() {
        let now = 1_000_000_000_000;
        assert!(is_too_old(now - 90_000_000, now, MESSAGE_AGE_CAP));
        assert!(!is_too_old(now - 1_000, now, MESSAGE_AGE_CAP));
    }

    #[test]
    fn maps_outcomes_to_decisions() {
        assert_eq!(
            decide_reentry(&ExecutionOutcome::Cancelled),
            ReentryDecision::Ack
        );
        assert_eq!(
            decide_reentry(&ExecutionOutcome::Sleeping { wake_at_epoch_ms: 42 }),
            ReentryDecision::ScheduleAt { epoch_ms: 42 }
        );
        assert_eq!(
            decide_reentry(&ExecutionOutcome::NeedsRetry {
                delay: Duration::from_secs(2),
                retry_count: 1
            }),
            ReentryDecision::ScheduleAfter {
                delay: Duration::from_secs(2),
                retry_count: 1
            }
        );
    }
}
