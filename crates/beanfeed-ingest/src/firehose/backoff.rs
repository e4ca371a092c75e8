use rand::{Rng, thread_rng};
use std::time::Duration;

/// Default wait between reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Consecutive failures after which reconnect attempts are logged as errors.
pub const DEFAULT_ALARM_AFTER: u32 = 10;

/// How long to wait before reconnecting to the firehose.
///
/// The default is a fixed delay. With a `max_delay` greater than the base the
/// delay doubles per consecutive failure up to that cap.
#[derive(Clone, Debug, PartialEq)]
pub struct ReconnectPolicy {
    base_delay: Duration,
    max_delay: Option<Duration>,
    jitter_fraction: f64,
    alarm_after: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_RECONNECT_DELAY)
    }
}

impl ReconnectPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: None,
            jitter_fraction: 0.0,
            alarm_after: DEFAULT_ALARM_AFTER,
        }
    }

    /// Doubling delay starting at `base`, capped at `max`. A cap at or below
    /// `base` degrades to a fixed delay.
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self {
            max_delay: (max > base).then_some(max),
            ..Self::fixed(base)
        }
    }

    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn with_alarm_after(mut self, failures: u32) -> Self {
        self.alarm_after = failures.max(1);
        self
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn is_fixed(&self) -> bool {
        self.max_delay.is_none()
    }

    /// Delay before reconnect attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }

        let raw = match self.max_delay {
            None => self.base_delay,
            Some(max) => {
                let shift = attempt.saturating_sub(1).min(31);
                self.base_delay.saturating_mul(1u32 << shift).min(max)
            }
        };

        if self.jitter_fraction <= 0.0 {
            return raw;
        }
        let factor = thread_rng().gen_range((1.0 - self.jitter_fraction)..=(1.0 + self.jitter_fraction));
        raw.mul_f64(factor)
    }

    pub fn backoff(&self) -> ReconnectBackoff {
        ReconnectBackoff {
            policy: self.clone(),
            failures: 0,
        }
    }
}

/// Tracks consecutive failures against a [`ReconnectPolicy`].
#[derive(Debug)]
pub struct ReconnectBackoff {
    policy: ReconnectPolicy,
    failures: u32,
}

impl ReconnectBackoff {
    /// Count a failed or lost connection and return how long to wait.
    pub fn record_failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.policy.delay_for_attempt(self.failures)
    }

    /// Forget past failures after a connection was established.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    /// Whether failures have persisted long enough to escalate logging.
    pub fn should_alarm(&self) -> bool {
        self.failures >= self.policy.alarm_after
    }
}
