//! Exponential backoff with jitter.

use std::time::Duration;

use chroma_agent_core::AgentConfig;

/// Doubling delay between `initial` and `max`, each delay jittered by a
/// relative `jitter` fraction.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    jitter: f64,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            initial,
            max,
            jitter,
            current: initial,
            attempts: 0,
        }
    }

    /// Transport retry policy.
    pub fn transport(config: &AgentConfig) -> Self {
        Self::new(config.backoff_initial, config.backoff_max, config.backoff_jitter)
    }

    /// Session request re-issue policy (no jitter).
    pub fn session_request(config: &AgentConfig) -> Self {
        Self::new(config.session_backoff_min, config.session_backoff_max, 0.0)
    }

    /// Delay before the next attempt; doubles the base for the one after.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        self.attempts += 1;
        jitter(base, self.jitter)
    }

    /// Base delay the next call to [`Backoff::next_delay`] will use.
    pub fn peek(&self) -> Duration {
        self.current
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }
}

/// `base` scaled by a uniform factor in `[1 - fraction, 1 + fraction]`.
pub fn jitter(base: Duration, fraction: f64) -> Duration {
    if fraction <= 0.0 {
        return base;
    }
    let factor = 1.0 + fraction * (2.0 * random_unit() - 1.0);
    base.mul_f64(factor.max(0.0))
}

/// `interval` shifted by a uniform offset in `[-spread, +spread]`.
pub fn spread(interval: Duration, spread: Duration) -> Duration {
    if spread.is_zero() {
        return interval;
    }
    let offset = spread.as_secs_f64() * (2.0 * random_unit() - 1.0);
    Duration::from_secs_f64((interval.as_secs_f64() + offset).max(0.0))
}

/// Uniform value in `[0, 1)`.
fn random_unit() -> f64 {
    let mut bytes = [0u8; 8];
    if getrandom::getrandom(&mut bytes).is_err() {
        return 0.5;
    }
    (u64::from_le_bytes(bytes) >> 11) as f64 / (1u64 << 53) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 0.0);
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_secs()).collect();
        // 1 → 2 → 4 → 8 → 16 → 32 → 60 → 60
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        assert_eq!(backoff.attempts(), 8);
    }

    #[test]
    fn reset_returns_to_initial() {
        let mut backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(60), 0.0);
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.peek(), Duration::from_secs(40));
        backoff.reset();
        assert_eq!(backoff.peek(), Duration::from_secs(10));
        assert_eq!(backoff.attempts(), 0);
    }

    #[test]
    fn jitter_stays_in_band() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let d = jitter(base, 0.2);
            assert!(d >= Duration::from_secs(8) && d <= Duration::from_secs(12), "{d:?}");
        }
    }

    #[test]
    fn spread_stays_in_band() {
        for _ in 0..100 {
            let d = spread(Duration::from_secs(10), Duration::from_secs(1));
            assert!(d >= Duration::from_secs(9) && d <= Duration::from_secs(11), "{d:?}");
        }
    }

    #[test]
    fn config_policies() {
        let config = AgentConfig::default();
        assert_eq!(Backoff::transport(&config).peek(), Duration::from_secs(1));
        assert_eq!(Backoff::session_request(&config).peek(), Duration::from_secs(10));
    }
}
