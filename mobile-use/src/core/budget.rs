//! Backoff between retries of transient provider and driver errors.

use std::time::Duration;

use rand::Rng;

/// Bounded exponential backoff with symmetric jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub jitter_pct: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter_pct: u32) -> Self {
        Self {
            base,
            max,
            jitter_pct: jitter_pct.min(100),
        }
    }

    /// Delay before retry `attempt` (1-based) without jitter.
    pub fn nominal(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.base
            .saturating_mul(1u32 << exponent)
            .min(self.max)
    }

    /// Apply jitter for a sample in `[-1.0, 1.0]`, never exceeding `max`.
    pub fn with_jitter(&self, attempt: u32, sample: f64) -> Duration {
        let nominal = self.nominal(attempt).as_millis() as f64;
        let spread = nominal * f64::from(self.jitter_pct) / 100.0;
        let jittered = (nominal + spread * sample.clamp(-1.0, 1.0)).max(0.0).round();
        Duration::from_millis(jittered as u64).min(self.max)
    }

    pub fn delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let sample = if self.jitter_pct == 0 {
            0.0
        } else {
            rng.gen_range(-1.0..=1.0)
        };
        self.with_jitter(attempt, sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn backoff() -> Backoff {
        Backoff::new(Duration::from_millis(500), Duration::from_secs(8), 20)
    }

    #[test]
    fn nominal_doubles_until_capped() {
        let b = backoff();
        assert_eq!(b.nominal(1), Duration::from_millis(500));
        assert_eq!(b.nominal(2), Duration::from_millis(1000));
        assert_eq!(b.nominal(4), Duration::from_millis(4000));
        assert_eq!(b.nominal(9), Duration::from_secs(8));
    }

    #[test]
    fn jitter_stays_within_spread_and_cap() {
        let b = backoff();
        assert_eq!(b.with_jitter(1, 1.0), Duration::from_millis(600));
        assert_eq!(b.with_jitter(1, -1.0), Duration::from_millis(400));
        assert_eq!(b.with_jitter(10, 1.0), Duration::from_secs(8));

        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 1..6 {
            let delay = b.delay(attempt, &mut rng);
            assert!(delay <= b.max);
            assert!(delay >= b.nominal(attempt).mul_f64(0.8) - Duration::from_millis(1));
        }
    }
}
