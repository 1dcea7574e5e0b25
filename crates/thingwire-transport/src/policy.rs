use std::fmt::Debug;
use std::time::Duration;

use rand::Rng;

/// Decides how long to wait before the next connection attempt.
pub trait ReconnectPolicy: Send + Sync + Debug {
    /// `attempt` counts consecutive failures, starting at 1.
    fn delay(&self, attempt: u32) -> Duration;
}

/// Retry at once, every time.
#[derive(Clone, Copy, Debug, Default)]
pub struct Immediate;

impl ReconnectPolicy for Immediate {
    fn delay(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }
}

/// `base * 2^(attempt - 1)`, capped at `max_delay`, with `± jitter_factor` noise.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.2,
        }
    }
}

impl ExponentialBackoff {
    fn capped_ms(&self, attempt: u32) -> f64 {
        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let exp_delay = self.base_delay.as_millis() as f64 * 2.0_f64.powi(exponent);
        exp_delay.min(self.max_delay.as_millis() as f64)
    }
}

impl ReconnectPolicy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let capped = self.capped_ms(attempt);
        if capped <= 0.0 {
            return Duration::ZERO;
        }
        let jitter_range = capped * self.jitter_factor.clamp(0.0, 1.0);
        let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}
