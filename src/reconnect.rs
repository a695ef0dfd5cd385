use std::time::Duration;

use rand::{rngs::StdRng, Rng, SeedableRng};

/// Picks the delay before a closed stream tunnel tries again: a uniformly random point between
/// `min` and `max`, so that many clients losing the same relay don't reconnect in lockstep.
#[derive(Debug)]
pub struct ReconnectPolicy {
    min: Duration,
    max: Duration,
    rng: StdRng,
}

impl ReconnectPolicy {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self::with_rng(min, max, StdRng::from_entropy())
    }

    pub fn with_rng(min: Duration, max: Duration, rng: StdRng) -> Self {
        Self { min, max, rng }
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn next_delay(&mut self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }

        let span = (self.max - self.min).as_millis() as u64;
        self.min + Duration::from_millis(self.rng.gen_range(0..=span))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_within_bounds() {
        let min = Duration::from_secs(3);
        let max = Duration::from_secs(10);
        let mut policy = ReconnectPolicy::with_rng(min, max, StdRng::seed_from_u64(7));

        let delays: Vec<Duration> = (0..1000).map(|_| policy.next_delay()).collect();
        assert!(delays.iter().all(|d| (min..=max).contains(d)));
        assert!(delays.iter().any(|d| *d != delays[0]));
    }

    #[test]
    fn test_degenerate_range() {
        let mut policy = ReconnectPolicy::new(Duration::from_secs(2), Duration::from_secs(2));
        assert_eq!(policy.next_delay(), Duration::from_secs(2));
    }
}
