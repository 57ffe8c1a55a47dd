//! One-shot events for cross-thread signalling.
//!
//! The runner coordinates with its supervisor thread purely through these:
//! one event for "workload is ready", one for "workload has exited".

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Lock a mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A value that is set at most once and can be awaited by any number of
/// threads.
#[derive(Debug)]
pub struct OneShot<T> {
    value: Mutex<Option<T>>,
    fired: Condvar,
}

impl<T: Clone> OneShot<T> {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
            fired: Condvar::new(),
        }
    }

    /// Fire the event. Returns `false` if it had already fired; the first
    /// value is kept.
    pub fn set(&self, value: T) -> bool {
        let mut slot = lock(&self.value);
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        self.fired.notify_all();
        true
    }

    /// Current value without blocking.
    pub fn get(&self) -> Option<T> {
        lock(&self.value).clone()
    }

    pub fn is_set(&self) -> bool {
        lock(&self.value).is_some()
    }

    /// Block until the event fires.
    pub fn wait(&self) -> T {
        let mut slot = lock(&self.value);
        loop {
            if let Some(value) = slot.as_ref() {
                return value.clone();
            }
            slot = self
                .fired
                .wait(slot)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Block until the event fires or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = lock(&self.value);
        loop {
            if let Some(value) = slot.as_ref() {
                return Some(value.clone());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            slot = self
                .fired
                .wait_timeout(slot, remaining)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
    }
}

impl<T: Clone> Default for OneShot<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_first_set_wins() {
        let ev = OneShot::new();
        assert!(ev.set(1));
        assert!(!ev.set(2));
        assert_eq!(ev.get(), Some(1));
        assert_eq!(ev.wait(), 1);
    }

    #[test]
    fn test_wait_timeout_expires() {
        let ev: OneShot<u8> = OneShot::new();
        let start = Instant::now();
        assert_eq!(ev.wait_timeout(Duration::from_millis(50)), None);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_wakes_waiter_from_other_thread() {
        let ev = Arc::new(OneShot::new());
        let setter = {
            let ev = Arc::clone(&ev);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                ev.set("exited")
            })
        };
        assert_eq!(ev.wait_timeout(Duration::from_secs(5)), Some("exited"));
        assert!(setter.join().unwrap());
    }
}
