//! Keepalive challenge/response liveness monitoring
//!
//! One monitor per connection, driven once per tick. Sends a numeric
//! challenge on a fixed interval, measures round-trip latency from the echo,
//! and evicts peers that stop responding. Trusted (loopback) peers still
//! exchange challenges for latency measurement but are never timed out:
//! a hanging trusted peer is a different failure class than a dead link.

use std::time::{Duration, Instant};

use crate::constants::keepalive;

/// Whether the hard response deadline is enforced for this peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPolicy {
    /// Normal remote peer: no response within the limit means eviction
    Enforced,
    /// Loopback/trusted peer: latency is measured, timeout never fires
    Trusted,
}

/// Liveness state for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeepAliveState {
    Idle,
    ChallengeSent { token: u64, sent_at: Instant },
}

/// What the owning connection must do after a monitor tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveAction {
    None,
    /// Send a challenge carrying this token
    SendChallenge(u64),
    /// The peer failed to respond within the hard limit
    TimedOut,
    /// The peer has been stuck in Closing past the grace window
    StuckClosing,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum KeepAliveError {
    #[error("keepalive token mismatch: expected {expected}, got {got}")]
    TokenMismatch { expected: u64, got: u64 },
    #[error("unsolicited keepalive response")]
    Unsolicited,
}

#[derive(Debug)]
pub struct KeepAliveMonitor {
    state: KeepAliveState,
    policy: TimeoutPolicy,
    interval: Duration,
    timeout: Duration,
    /// Monotonic base for challenge tokens
    epoch: Instant,
    last_sent: Instant,
    /// Exponentially smoothed round-trip estimate
    latency_ms: u32,
    has_latency_sample: bool,
}

impl KeepAliveMonitor {
    pub fn new(policy: TimeoutPolicy, interval: Duration, timeout: Duration, now: Instant) -> Self {
        Self {
            state: KeepAliveState::Idle,
            policy,
            interval,
            timeout,
            epoch: now,
            last_sent: now,
            latency_ms: 0,
            has_latency_sample: false,
        }
    }

    pub fn with_defaults(policy: TimeoutPolicy, now: Instant) -> Self {
        Self::new(policy, keepalive::INTERVAL, keepalive::TIMEOUT, now)
    }

    /// Advance the monitor one tick. `closing_since` is set while the owning
    /// connection is in its Closing state; once closing, the grace window is
    /// the only deadline that matters, even if a challenge is still unanswered.
    pub fn tick(&mut self, now: Instant, closing_since: Option<Instant>) -> KeepAliveAction {
        if let Some(since) = closing_since {
            if now.duration_since(since) >= keepalive::STUCK_CLOSE_GRACE {
                return KeepAliveAction::StuckClosing;
            }
            return KeepAliveAction::None;
        }
        match self.state {
            KeepAliveState::ChallengeSent { sent_at, .. } => {
                if self.policy == TimeoutPolicy::Enforced
                    && now.duration_since(sent_at) >= self.timeout
                {
                    KeepAliveAction::TimedOut
                } else {
                    KeepAliveAction::None
                }
            }
            KeepAliveState::Idle => {
                if now.duration_since(self.last_sent) < self.interval {
                    return KeepAliveAction::None;
                }
                let token = now.duration_since(self.epoch).as_millis() as u64;
                self.state = KeepAliveState::ChallengeSent {
                    token,
                    sent_at: now,
                };
                self.last_sent = now;
                KeepAliveAction::SendChallenge(token)
            }
        }
    }

    /// Handle an echoed token. A mismatch or an unsolicited echo is a client
    /// protocol violation, not a timeout.
    pub fn on_response(&mut self, token: u64, now: Instant) -> Result<u32, KeepAliveError> {
        match self.state {
            KeepAliveState::ChallengeSent {
                token: expected,
                sent_at,
            } => {
                if token != expected {
                    return Err(KeepAliveError::TokenMismatch {
                        expected,
                        got: token,
                    });
                }
                let sample = now.duration_since(sent_at).as_millis() as u32;
                self.latency_ms = if self.has_latency_sample {
                    (self.latency_ms * 3 + sample) / 4
                } else {
                    sample
                };
                self.has_latency_sample = true;
                self.state = KeepAliveState::Idle;
                Ok(self.latency_ms)
            }
            KeepAliveState::Idle => Err(KeepAliveError::Unsolicited),
        }
    }

    pub fn latency_ms(&self) -> u32 {
        self.latency_ms
    }

    pub fn awaiting_response(&self) -> bool {
        matches!(self.state, KeepAliveState::ChallengeSent { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(policy: TimeoutPolicy, now: Instant) -> KeepAliveMonitor {
        KeepAliveMonitor::new(
            policy,
            Duration::from_secs(15),
            Duration::from_secs(30),
            now,
        )
    }

    #[test]
    fn test_no_challenge_before_interval() {
        let start = Instant::now();
        let mut m = monitor(TimeoutPolicy::Enforced, start);
        let action = m.tick(start + Duration::from_secs(14), None);
        assert_eq!(action, KeepAliveAction::None);
    }

    #[test]
    fn test_challenge_after_interval_then_ack() {
        let start = Instant::now();
        let mut m = monitor(TimeoutPolicy::Enforced, start);

        let t1 = start + Duration::from_secs(15);
        let token = match m.tick(t1, None) {
            KeepAliveAction::SendChallenge(token) => token,
            other => panic!("expected challenge, got {other:?}"),
        };
        assert!(m.awaiting_response());

        let latency = m.on_response(token, t1 + Duration::from_millis(80)).unwrap();
        assert_eq!(latency, 80);
        assert!(!m.awaiting_response());
    }

    #[test]
    fn test_latency_smoothing() {
        let start = Instant::now();
        let mut m = monitor(TimeoutPolicy::Enforced, start);

        let t1 = start + Duration::from_secs(15);
        let token = match m.tick(t1, None) {
            KeepAliveAction::SendChallenge(t) => t,
            other => panic!("expected challenge, got {other:?}"),
        };
        m.on_response(token, t1 + Duration::from_millis(100)).unwrap();

        let t2 = t1 + Duration::from_secs(15);
        let token = match m.tick(t2, None) {
            KeepAliveAction::SendChallenge(t) => t,
            other => panic!("expected challenge, got {other:?}"),
        };
        let latency = m.on_response(token, t2 + Duration::from_millis(20)).unwrap();
        // (100*3 + 20) / 4 = 80
        assert_eq!(latency, 80);
    }

    #[test]
    fn test_timeout_fires_only_after_hard_limit() {
        let start = Instant::now();
        let mut m = monitor(TimeoutPolicy::Enforced, start);

        let t1 = start + Duration::from_secs(15);
        assert!(matches!(
            m.tick(t1, None),
            KeepAliveAction::SendChallenge(_)
        ));

        // Just under the limit: still waiting
        let almost = t1 + Duration::from_secs(29);
        assert_eq!(m.tick(almost, None), KeepAliveAction::None);

        let late = t1 + Duration::from_secs(30);
        assert_eq!(m.tick(late, None), KeepAliveAction::TimedOut);
    }

    #[test]
    fn test_trusted_peer_never_times_out() {
        let start = Instant::now();
        let mut m = monitor(TimeoutPolicy::Trusted, start);

        let t1 = start + Duration::from_secs(15);
        let token = match m.tick(t1, None) {
            KeepAliveAction::SendChallenge(t) => t,
            other => panic!("expected challenge, got {other:?}"),
        };

        let much_later = t1 + Duration::from_secs(600);
        assert_eq!(m.tick(much_later, None), KeepAliveAction::None);

        // Latency measurement still works for trusted peers
        let latency = m.on_response(token, much_later).unwrap();
        assert!(latency >= 600_000);
    }

    #[test]
    fn test_mismatched_token_is_violation() {
        let start = Instant::now();
        let mut m = monitor(TimeoutPolicy::Enforced, start);

        let t1 = start + Duration::from_secs(15);
        let token = match m.tick(t1, None) {
            KeepAliveAction::SendChallenge(t) => t,
            other => panic!("expected challenge, got {other:?}"),
        };

        let result = m.on_response(token.wrapping_add(1), t1);
        assert!(matches!(result, Err(KeepAliveError::TokenMismatch { .. })));
    }

    #[test]
    fn test_unsolicited_response_is_violation() {
        let start = Instant::now();
        let mut m = monitor(TimeoutPolicy::Enforced, start);
        assert!(matches!(
            m.on_response(7, start),
            Err(KeepAliveError::Unsolicited)
        ));
    }

    #[test]
    fn test_stuck_close_detection() {
        let start = Instant::now();
        let mut m = monitor(TimeoutPolicy::Enforced, start);

        let closing_since = start + Duration::from_secs(12);
        // Interval elapsed but grace window not yet: no action
        let t1 = start + Duration::from_secs(15);
        assert_eq!(m.tick(t1, Some(closing_since)), KeepAliveAction::None);

        // Past the grace window: force-drop
        let t2 = closing_since + keepalive::STUCK_CLOSE_GRACE;
        assert_eq!(m.tick(t2, Some(closing_since)), KeepAliveAction::StuckClosing);
    }

    #[test]
    fn test_stuck_close_fires_with_challenge_outstanding() {
        let start = Instant::now();
        let mut m = monitor(TimeoutPolicy::Enforced, start);

        let t1 = start + Duration::from_secs(15);
        assert!(matches!(
            m.tick(t1, None),
            KeepAliveAction::SendChallenge(_)
        ));
        assert!(m.awaiting_response());

        // Close begins while the challenge is unanswered; the grace window
        // still governs, not the pending challenge
        let closing_since = t1 + Duration::from_secs(2);
        assert_eq!(
            m.tick(closing_since + Duration::from_secs(9), Some(closing_since)),
            KeepAliveAction::None
        );
        assert_eq!(
            m.tick(
                closing_since + keepalive::STUCK_CLOSE_GRACE,
                Some(closing_since)
            ),
            KeepAliveAction::StuckClosing
        );
    }
}
