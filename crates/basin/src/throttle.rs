//! Token-bucket pacing for the clean worker's zero-fill writes.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Sleeping in bounded slices keeps worker shutdown responsive even when
/// a large debt is outstanding.
const MAX_SLEEP_SLICE: Duration = Duration::from_millis(100);

const NANOS_PER_SEC: u128 = 1_000_000_000;

#[derive(Debug)]
struct Bucket {
    /// May go negative: a consume takes its tokens up front and the
    /// caller sleeps the debt off.
    available: i128,
    last_refill: Instant,
}

/// Blocking token bucket.
///
/// Tokens accrue at a fixed rate and cap out at one second's worth of
/// burst. [`consume`](Self::consume) debits immediately and sleeps until
/// the balance is non-negative again, so a sustained caller converges on
/// the configured rate regardless of its per-call token count.
#[derive(Debug)]
pub struct IopsThrottle {
    /// Tokens per second; zero disables the throttle entirely.
    rate: u64,
    bucket: Mutex<Bucket>,
}

impl IopsThrottle {
    #[must_use]
    pub fn new(tokens_per_sec: u64) -> Self {
        Self {
            rate: tokens_per_sec,
            bucket: Mutex::new(Bucket {
                available: i128::from(tokens_per_sec),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take `n` tokens, sleeping until the budget allows.
    pub fn consume(&self, n: u64) {
        if self.rate == 0 {
            return;
        }
        let debt_nanos = {
            let mut bucket = self.bucket.lock();
            self.refill(&mut bucket);
            bucket.available -= i128::from(n);
            if bucket.available >= 0 {
                return;
            }
            let debt = bucket.available.unsigned_abs();
            debt * NANOS_PER_SEC / u128::from(self.rate)
        };

        let mut remaining = Duration::from_nanos(u64::try_from(debt_nanos).unwrap_or(u64::MAX));
        while !remaining.is_zero() {
            let slice = remaining.min(MAX_SLEEP_SLICE);
            std::thread::sleep(slice);
            remaining -= slice;
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_nanos();
        bucket.last_refill = now;
        let accrued = elapsed * u128::from(self.rate) / NANOS_PER_SEC;
        let accrued = i128::try_from(accrued).unwrap_or(i128::MAX);
        bucket.available = bucket
            .available
            .saturating_add(accrued)
            .min(i128::from(self.rate));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_rate_never_blocks() {
        let throttle = IopsThrottle::new(0);
        let start = Instant::now();
        for _ in 0..1000 {
            throttle.consume(1 << 20);
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn burst_within_budget_does_not_block() {
        let throttle = IopsThrottle::new(1_000_000);
        let start = Instant::now();
        throttle.consume(1_000_000);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn overdraft_sleeps_the_debt_off() {
        let throttle = IopsThrottle::new(1000);
        // Bucket starts with 1000 tokens; 1300 leaves a 300-token debt,
        // which at 1000 tokens/sec is ~300 ms.
        let start = Instant::now();
        throttle.consume(1300);
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_millis(250),
            "expected to block, returned after {elapsed:?}"
        );
    }
}
