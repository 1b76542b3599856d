//! Cancellable sleep for the background workers.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A sleep that can be cut short from another thread.
///
/// Interruption is sticky: once [`interrupt`](Self::interrupt) has been
/// called, every wait returns `false` immediately until
/// [`reset`](Self::reset) re-arms the sleeper. Workers use the return
/// value as their run/exit signal.
#[derive(Debug, Default)]
pub struct Sleeper {
    interrupted: Mutex<bool>,
    cond: Condvar,
}

impl Sleeper {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `timeout` unless interrupted. Returns `false` when the
    /// sleeper was interrupted before or during the wait, `true` after a
    /// full sleep.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut interrupted = self.interrupted.lock();
        while !*interrupted {
            if self.cond.wait_until(&mut interrupted, deadline).timed_out() {
                return !*interrupted;
            }
        }
        false
    }

    /// Wake all current waiters and make subsequent waits return
    /// immediately.
    pub fn interrupt(&self) {
        *self.interrupted.lock() = true;
        self.cond.notify_all();
    }

    /// Re-arm after a stop/start cycle.
    pub fn reset(&self) {
        *self.interrupted.lock() = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn full_sleep_returns_true() {
        let sleeper = Sleeper::new();
        let start = Instant::now();
        assert!(sleeper.wait_for(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn interrupt_wakes_a_waiter_early() {
        let sleeper = Arc::new(Sleeper::new());
        let waiter = Arc::clone(&sleeper);
        let handle = std::thread::spawn(move || waiter.wait_for(Duration::from_secs(30)));

        std::thread::sleep(Duration::from_millis(20));
        sleeper.interrupt();
        assert!(!handle.join().unwrap());
    }

    #[test]
    fn interruption_is_sticky_until_reset() {
        let sleeper = Sleeper::new();
        sleeper.interrupt();
        assert!(!sleeper.wait_for(Duration::from_millis(1)));
        assert!(!sleeper.wait_for(Duration::from_millis(1)));

        sleeper.reset();
        assert!(sleeper.wait_for(Duration::from_millis(1)));
    }
}
