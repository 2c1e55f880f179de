//! Backoff policies for reconnect and rejoin scheduling.
//!
//! A policy is a step table plus a cap: attempt `n` waits `steps[n - 1]`,
//! attempts past the table wait `cap`. Jitter is applied as a separate pure
//! function so schedules stay deterministic under a seeded RNG.

use rand::Rng;
use std::time::Duration;

/// Maps an attempt count to a wait duration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    steps: Vec<Duration>,
    cap: Duration,
}

impl Backoff {
    /// A policy with an explicit step table and cap.
    pub fn new(steps: Vec<Duration>, cap: Duration) -> Self {
        Self { steps, cap }
    }

    /// Default reconnect schedule: 10ms, 50ms, 100ms, 150ms, 200ms, 250ms,
    /// 500ms, 1s, 2s, then 5s per attempt.
    pub fn reconnect() -> Self {
        Self::new(
            [10u64, 50, 100, 150, 200, 250, 500, 1000, 2000]
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
            Duration::from_secs(5),
        )
    }

    /// Default rejoin schedule: 1s, 2s, 5s, then 10s per attempt.
    pub fn rejoin() -> Self {
        Self::new(
            [1u64, 2, 5]
                .iter()
                .map(|secs| Duration::from_secs(*secs))
                .collect(),
            Duration::from_secs(10),
        )
    }

    /// The wait before attempt number `tries` (1-based).
    pub fn wait_for(&self, tries: u32) -> Duration {
        if tries == 0 {
            return self.steps.first().copied().unwrap_or(self.cap);
        }
        self.steps
            .get(tries as usize - 1)
            .copied()
            .unwrap_or(self.cap)
    }
}

/// Spread `base` uniformly into `[base * (1 - spread), base * (1 + spread)]`.
///
/// `spread` is a fraction in `[0, 1]`; `0.0` returns `base` unchanged, which
/// is what tests use to keep schedules exact.
pub fn jitter<R: Rng>(base: Duration, spread: f64, rng: &mut R) -> Duration {
    if spread <= 0.0 {
        return base;
    }
    let factor = 1.0 + spread * rng.gen_range(-1.0..=1.0);
    base.mul_f64(factor.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_reconnect_schedule_steps_then_caps() {
        let backoff = Backoff::reconnect();
        assert_eq!(backoff.wait_for(1), Duration::from_millis(10));
        assert_eq!(backoff.wait_for(2), Duration::from_millis(50));
        assert_eq!(backoff.wait_for(9), Duration::from_millis(2000));
        assert_eq!(backoff.wait_for(10), Duration::from_secs(5));
        assert_eq!(backoff.wait_for(100), Duration::from_secs(5));
    }

    #[test]
    fn test_rejoin_schedule_steps_then_caps() {
        let backoff = Backoff::rejoin();
        assert_eq!(backoff.wait_for(1), Duration::from_secs(1));
        assert_eq!(backoff.wait_for(2), Duration::from_secs(2));
        assert_eq!(backoff.wait_for(3), Duration::from_secs(5));
        assert_eq!(backoff.wait_for(4), Duration::from_secs(10));
        assert_eq!(backoff.wait_for(50), Duration::from_secs(10));
    }

    #[test]
    fn test_zero_spread_is_identity() {
        let mut rng = StdRng::seed_from_u64(7);
        let base = Duration::from_millis(500);
        assert_eq!(jitter(base, 0.0, &mut rng), base);
    }

    #[test]
    fn test_jitter_stays_within_spread() {
        let mut rng = StdRng::seed_from_u64(42);
        let base = Duration::from_millis(1000);
        for _ in 0..100 {
            let jittered = jitter(base, 0.25, &mut rng);
            assert!(jittered >= Duration::from_millis(750));
            assert!(jittered <= Duration::from_millis(1250));
        }
    }
}
