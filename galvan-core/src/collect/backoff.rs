use std::time::Duration;

use rand::Rng;

/// Reconnect backoff: exponential from `initial` doubling to `max`, with
/// ±20 % jitter so a plant full of collectors does not reconnect in lockstep.
#[derive(Debug)]
pub struct ReconnectBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl ReconnectBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Next delay to wait before a reconnect attempt.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        jitter(base)
    }

    /// Call after a successful connect so the next failure starts over.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

fn jitter(base: Duration) -> Duration {
    let factor = rand::rng().random_range(0.8..=1.2);
    base.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_to_cap_and_resets() {
        let mut backoff =
            ReconnectBackoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let mut bases = Vec::new();
        for _ in 0..8 {
            bases.push(backoff.next_delay());
        }
        // Jitter is ±20 %, so compare against the envelope.
        assert!(bases[0] >= Duration::from_millis(800) && bases[0] <= Duration::from_millis(1200));
        assert!(bases[7] >= Duration::from_secs(24) && bases[7] <= Duration::from_secs(36));

        backoff.reset();
        let after_reset = backoff.next_delay();
        assert!(after_reset <= Duration::from_millis(1200));
    }
}
