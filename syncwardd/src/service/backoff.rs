use rand::Rng;
use std::time::Duration;

/// Delay schedule for polling the engine's control endpoint while it boots.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let exp = base_ms.saturating_mul(1u64 << attempt.min(16)).min(max_ms);
        // Never sleep zero with jitter on; the handshake would spin.
        let delay_ms = if self.jitter && exp > 0 {
            rng.gen_range(exp / 2..=exp)
        } else {
            exp
        };
        Duration::from_millis(delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn handshake_delays_double_until_capped() {
        let backoff = Backoff::new(
            Duration::from_millis(100),
            Duration::from_millis(800),
            false,
        );
        let mut rng = StdRng::seed_from_u64(1);
        let delays: Vec<u64> = (0..5)
            .map(|attempt| backoff.delay_with_rng(attempt, &mut rng).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 800]);
    }

    #[test]
    fn jittered_delay_stays_in_upper_half() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(800), true);
        let mut rng = StdRng::seed_from_u64(42);
        for attempt in 0..8 {
            let delay = backoff.delay_with_rng(attempt, &mut rng);
            let cap = Duration::from_millis(100 * (1 << attempt.min(3)));
            assert!(delay <= cap);
            assert!(delay >= cap / 2);
        }
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30), false);
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(30));
    }
}
