//! Cooperative stop signal shared by worker loops.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Cloneable stop flag that also wakes sleeping loops.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the signal and wakes every waiter. Idempotent.
    pub fn stop(&self) {
        let (flag, wakeup) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        wakeup.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleeps up to `timeout` or until stopped. Returns whether stopped.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, wakeup) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut stopped = flag.lock().unwrap_or_else(PoisonError::into_inner);
        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            stopped = wakeup
                .wait_timeout(stopped, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *stopped
    }
}

#[cfg(test)]
mod tests {
    use super::StopSignal;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn wait_times_out_when_not_stopped() {
        let signal = StopSignal::new();
        assert!(!signal.wait_timeout(Duration::from_millis(20)));
        assert!(!signal.is_stopped());
    }

    #[test]
    fn stop_wakes_a_sleeping_waiter() {
        let signal = StopSignal::new();
        let waiter = signal.clone();
        let started = Instant::now();
        let handle = thread::spawn(move || waiter.wait_timeout(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(20));
        signal.stop();
        assert!(handle.join().unwrap());
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
