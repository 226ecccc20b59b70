//! Single-assignment outcome slot shared by the execution thread and waiters.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Holds at most one value. The first `set` wins; later calls are ignored.
#[derive(Debug)]
pub struct OutcomeSlot<T> {
    value: Mutex<Option<T>>,
    filled: Condvar,
}

impl<T> Default for OutcomeSlot<T> {
    fn default() -> Self {
        Self {
            value: Mutex::new(None),
            filled: Condvar::new(),
        }
    }
}

impl<T: Clone> OutcomeSlot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` if the slot is empty. Returns whether it was stored.
    pub fn set(&self, value: T) -> bool {
        let mut guard = self.lock();
        if guard.is_some() {
            return false;
        }
        *guard = Some(value);
        self.filled.notify_all();
        true
    }

    pub fn is_set(&self) -> bool {
        self.lock().is_some()
    }

    pub fn get(&self) -> Option<T> {
        self.lock().clone()
    }

    /// Block until the slot is filled or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock();
        loop {
            if let Some(value) = guard.as_ref() {
                return Some(value.clone());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            guard = match self.filled.wait_timeout(guard, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        // A panicking writer cannot leave a half-written Option behind.
        self.value.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_first_set_wins() {
        let slot = OutcomeSlot::new();
        assert!(!slot.is_set());
        assert!(slot.set(1));
        assert!(!slot.set(2));
        assert_eq!(slot.get(), Some(1));
    }

    #[test]
    fn test_wait_timeout_expires() {
        let slot: OutcomeSlot<u8> = OutcomeSlot::new();
        let start = Instant::now();
        assert_eq!(slot.wait_timeout(Duration::from_millis(50)), None);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_wait_wakes_on_set() {
        let slot = Arc::new(OutcomeSlot::new());
        let writer = Arc::clone(&slot);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            writer.set("done".to_string());
        });
        let start = Instant::now();
        assert_eq!(slot.wait_timeout(Duration::from_secs(5)), Some("done".to_string()));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }
}
