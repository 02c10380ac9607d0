use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Timeout value meaning "wait forever".
pub const WAIT_FOREVER: u64 = 0;

/// Locks a mutex, recovering the guard if a panicking thread poisoned it.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Auto-reset event: `set` wakes one waiter, or the next one to arrive.
#[derive(Default)]
pub struct Event {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        *lock(&self.signaled) = true;
        self.cond.notify_all();
    }

    /// Waits for the event and consumes it. A timeout of [`WAIT_FOREVER`] waits indefinitely.
    /// Returns false if the timeout elapsed first.
    pub fn wait(&self, timeout_ms: u64) -> bool {
        let deadline = if timeout_ms == WAIT_FOREVER {
            None
        } else {
            Some(Instant::now() + Duration::from_millis(timeout_ms))
        };

        let mut signaled = lock(&self.signaled);

        while !*signaled {
            match deadline {
                None => {
                    signaled = self
                        .cond
                        .wait(signaled)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    signaled = self
                        .cond
                        .wait_timeout(signaled, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }

        *signaled = false;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::thread;

    #[test]
    fn auto_reset() {
        let event = Event::new();

        assert!(!event.wait(10));

        event.set();
        assert!(event.wait(10));
        assert!(!event.wait(10));
    }

    #[test]
    fn wakes_waiter() {
        let event = Arc::new(Event::new());
        let event_clone = Arc::clone(&event);

        let waiter = thread::spawn(move || event_clone.wait(WAIT_FOREVER));

        thread::sleep(Duration::from_millis(20));
        event.set();

        assert!(waiter.join().unwrap());
    }
}
