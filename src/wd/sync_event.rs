use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Win32-style event built on a mutex and a condition variable.
///
/// Auto-reset events wake a single waiter per signal and clear themselves as
/// part of a successful wait; manual-reset events wake every waiter and stay
/// signaled until `reset_event` is called.
pub struct SyncEvent {
    signaled: Mutex<bool>,
    cv: Condvar,
    auto_reset: bool,
}

impl SyncEvent {
    pub fn new(initial_state: bool, auto_reset: bool) -> Self {
        Self {
            signaled: Mutex::new(initial_state),
            cv: Condvar::new(),
            auto_reset,
        }
    }

    /// Signals the event. Returns true if the event was not already signaled.
    pub fn set_event(&self) -> bool {
        let mut signaled = self.signaled.lock().unwrap_or_else(|p| p.into_inner());
        let was_signaled = *signaled;
        *signaled = true;
        if self.auto_reset {
            self.cv.notify_one();
        } else {
            self.cv.notify_all();
        }
        !was_signaled
    }

    /// Clears the signaled state. Returns true if the event was signaled.
    pub fn reset_event(&self) -> bool {
        let mut signaled = self.signaled.lock().unwrap_or_else(|p| p.into_inner());
        let was_signaled = *signaled;
        *signaled = false;
        was_signaled
    }

    /// Blocks until the event is signaled.
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock().unwrap_or_else(|p| p.into_inner());
        while !*signaled {
            signaled = self.cv.wait(signaled).unwrap_or_else(|p| p.into_inner());
        }
        if self.auto_reset {
            *signaled = false;
        }
    }

    /// Blocks until the event is signaled or the timeout expires.
    /// Returns true if the event was signaled.
    pub fn wait_timeout(&self, milliseconds: u64) -> bool {
        let signaled = self.signaled.lock().unwrap_or_else(|p| p.into_inner());
        let (mut signaled, _) = self
            .cv
            .wait_timeout_while(signaled, Duration::from_millis(milliseconds), |s| !*s)
            .unwrap_or_else(|p| p.into_inner());
        let success = *signaled;
        if success && self.auto_reset {
            *signaled = false;
        }
        success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn unsignaled_wait_times_out() {
        let event = SyncEvent::new(false, true);
        assert!(!event.wait_timeout(10));
    }

    #[test]
    fn signaled_wait_succeeds() {
        let event = SyncEvent::new(false, true);
        event.reset_event();
        assert!(!event.wait_timeout(10));
        assert!(event.set_event());
        assert!(event.wait_timeout(10));
        // auto-reset: consumed by the previous wait
        assert!(!event.wait_timeout(10));
    }

    #[test]
    fn set_event_reports_prior_state() {
        let event = SyncEvent::new(false, true);
        assert!(event.set_event());
        assert!(!event.set_event());
        assert!(event.reset_event());
        assert!(!event.reset_event());
    }

    #[test]
    fn auto_reset_wakes_exactly_one_waiter_per_signal() {
        let event = Arc::new(SyncEvent::new(false, true));
        let wakeups = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let event = Arc::clone(&event);
            let wakeups = Arc::clone(&wakeups);
            handles.push(thread::spawn(move || {
                if event.wait_timeout(500) {
                    wakeups.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }

        thread::sleep(Duration::from_millis(50));
        event.set_event();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(wakeups.load(Ordering::SeqCst), 1);

        // release the remaining waiters so the threads can finish
        for _ in 0..3 {
            event.set_event();
            thread::sleep(Duration::from_millis(20));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(wakeups.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn manual_reset_wakes_all_waiters_until_reset() {
        let event = Arc::new(SyncEvent::new(false, false));
        let wakeups = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let event = Arc::clone(&event);
            let wakeups = Arc::clone(&wakeups);
            handles.push(thread::spawn(move || {
                if event.wait_timeout(500) {
                    wakeups.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }

        thread::sleep(Duration::from_millis(50));
        event.set_event();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(wakeups.load(Ordering::SeqCst), 4);

        // the event stays signaled until explicitly reset
        assert!(event.wait_timeout(10));
        event.reset_event();
        assert!(!event.wait_timeout(10));
    }
}
