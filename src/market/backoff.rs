use std::time::Duration;

pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
pub const DEFAULT_BACKOFF_CAP_MS: u64 = 30_000;

/// Exponential reconnect delay: `min(cap, base * 2^attempt)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    base_ms: u64,
    cap_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_BASE_MS, DEFAULT_BACKOFF_CAP_MS)
    }
}

impl ReconnectPolicy {
    pub fn new(base_ms: u64, cap_ms: u64) -> Self {
        Self {
            base_ms,
            cap_ms: cap_ms.max(base_ms),
        }
    }

    pub fn next_delay_ms(&self, attempt: u32) -> u64 {
        let multiplier = 1_u64.checked_shl(attempt.min(63)).unwrap_or(u64::MAX);
        self.base_ms.saturating_mul(multiplier).min(self.cap_ms)
    }

    pub fn next_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.next_delay_ms(attempt))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconnectState {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl ReconnectState {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn record_failure(&mut self) -> Duration {
        let delay = self.policy.next_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
