use rand::Rng;
use std::time::Duration;

/// Exponential delay between retries of failed sync cycles.
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

    pub fn delay(&self, failures: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(failures, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, failures: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let shift = failures.saturating_sub(1).min(16);
        let exp = base_ms.saturating_mul(1u64 << shift).min(max_ms);
        let delay_ms = if self.jitter {
            // Jitter within the upper half of the step.
            rng.gen_range(exp / 2..=exp)
        } else {
            exp
        };
        Duration::from_millis(delay_ms)
    }
}

/// Decides how long the scheduled loop sleeps before the next cycle.
#[derive(Debug, Clone)]
pub struct CycleSchedule {
    interval: Duration,
    backoff: Backoff,
    failures: u32,
}

impl CycleSchedule {
    pub fn new(interval: Duration, backoff: Backoff) -> Self {
        Self {
            interval,
            backoff,
            failures: 0,
        }
    }

    pub fn record_success(&mut self) -> Duration {
        self.failures = 0;
        self.interval
    }

    pub fn record_failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.backoff.delay(self.failures).min(self.interval)
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn backoff_without_jitter_doubles_per_failure() {
        let backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(40), false);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(backoff.delay_with_rng(1, &mut rng), Duration::from_secs(5));
        assert_eq!(backoff.delay_with_rng(2, &mut rng), Duration::from_secs(10));
        assert_eq!(backoff.delay_with_rng(3, &mut rng), Duration::from_secs(20));
        assert_eq!(backoff.delay_with_rng(4, &mut rng), Duration::from_secs(40));
        assert_eq!(backoff.delay_with_rng(9, &mut rng), Duration::from_secs(40));
    }

    #[test]
    fn backoff_with_jitter_stays_within_step() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(800), true);
        let mut rng = StdRng::seed_from_u64(42);
        let delay = backoff.delay_with_rng(3, &mut rng);
        assert!(delay >= Duration::from_millis(200));
        assert!(delay <= Duration::from_millis(400));
    }

    #[test]
    fn schedule_resets_after_success() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), false);
        let mut schedule = CycleSchedule::new(Duration::from_secs(30), backoff);

        assert_eq!(schedule.record_failure(), Duration::from_secs(1));
        assert_eq!(schedule.record_failure(), Duration::from_secs(2));
        assert_eq!(schedule.failures(), 2);
        assert_eq!(schedule.record_success(), Duration::from_secs(30));
        assert_eq!(schedule.failures(), 0);
    }

    #[test]
    fn schedule_never_waits_longer_than_interval() {
        let backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(600), false);
        let mut schedule = CycleSchedule::new(Duration::from_secs(15), backoff);

        schedule.record_failure();
        assert_eq!(schedule.record_failure(), Duration::from_secs(15));
    }
}
