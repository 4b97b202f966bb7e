//! Decides whether a disconnected peer is worth retrying and, if so, how
//! long to wait before the next attempt.

use std::time::Duration;

use rand::Rng;

use crate::error::DisconnectReason;

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: f64,
    pub max_retries: u32,
    /// A connection that stayed up at least this long before dropping is
    /// considered to have proven itself; its retry counter resets rather
    /// than continuing to climb the backoff curve.
    pub stable_threshold: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: 0.2,
            max_retries: 5,
            stable_threshold: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    pub fn should_reconnect(&self, attempt: u32, reason: DisconnectReason) -> bool {
        reason.is_retriable() && attempt < self.max_retries
    }

    /// Exponential backoff with multiplicative jitter, capped at
    /// `max_delay`. `attempt` is zero-based (the delay before the first
    /// retry is `delay(0)`).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = self.multiplier.powi(attempt as i32);
        let base_millis = self.base_delay.as_millis() as f64 * exponent;
        let capped_millis = base_millis.min(self.max_delay.as_millis() as f64);

        let jitter_span = capped_millis * self.jitter;
        let offset = rand::thread_rng().gen_range(-jitter_span..=jitter_span);
        let jittered = (capped_millis + offset).max(0.0);
        Duration::from_millis(jittered as u64)
    }

    /// Whether a prior connection that survived `uptime` before
    /// disconnecting counts as stable, resetting the retry counter.
    pub fn is_stable(&self, uptime: Duration) -> bool {
        uptime >= self.stable_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_reasons_never_reconnect() {
        let policy = ReconnectPolicy::default();
        for reason in [
            DisconnectReason::LocalClose,
            DisconnectReason::Gated,
            DisconnectReason::LimitExceeded,
            DisconnectReason::SelfDial,
            DisconnectReason::PeerIdMismatch,
        ] {
            assert!(!policy.should_reconnect(0, reason));
        }
    }

    #[test]
    fn permitted_reasons_reconnect_until_max_retries() {
        let policy = ReconnectPolicy::default();
        for attempt in 0..policy.max_retries {
            assert!(policy.should_reconnect(attempt, DisconnectReason::RemoteClose));
        }
        assert!(!policy.should_reconnect(policy.max_retries, DisconnectReason::RemoteClose));
    }

    #[test]
    fn delay_grows_with_attempt_and_stays_capped() {
        let policy = ReconnectPolicy {
            jitter: 0.0,
            ..ReconnectPolicy::default()
        };
        assert_eq!(policy.delay(0), policy.base_delay);
        assert!(policy.delay(1) > policy.delay(0));
        assert!(policy.delay(20) <= policy.max_delay);
    }

    #[test]
    fn stability_threshold_distinguishes_long_and_short_lived_connections() {
        let policy = ReconnectPolicy::default();
        assert!(!policy.is_stable(Duration::from_secs(1)));
        assert!(policy.is_stable(Duration::from_secs(60)));
    }
}
