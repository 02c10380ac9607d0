use std::sync::Mutex;
use std::time::Instant;

use crate::event::{lock, Event};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Thresholds {
    /// In-flight count at which writers block.
    pub lock: usize,
    /// In-flight count at or below which blocked writers resume.
    pub unlock: usize,
}

/// Dual-threshold flow control over a session's in-flight packet count.
pub struct Hysteresis {
    thresholds: Mutex<Thresholds>,
    event: Event,
}

impl Hysteresis {
    pub fn new(lock: usize, unlock: usize) -> Self {
        debug_assert!(unlock < lock);

        Self {
            thresholds: Mutex::new(Thresholds { lock, unlock }),
            event: Event::new(),
        }
    }

    #[cfg(test)]
    pub fn thresholds(&self) -> Thresholds {
        *lock(&self.thresholds)
    }

    pub fn should_lock(&self, in_flight: usize) -> bool {
        in_flight >= lock(&self.thresholds).lock
    }

    pub fn can_unlock(&self, in_flight: usize) -> bool {
        in_flight <= lock(&self.thresholds).unlock
    }

    /// Drops the release threshold to zero so waiters resume only once everything is
    /// acknowledged.
    pub fn release_all(&self) {
        lock(&self.thresholds).unlock = 0;
        self.event.set();
    }

    pub fn signal(&self) {
        self.event.set();
    }

    /// Blocks while `in_flight()` is above the release threshold, re-checking at least every
    /// `poll_ms`. Returns false if `abort()` holds or `deadline` passes before release.
    pub fn wait_for_release<C, A>(
        &self,
        in_flight: C,
        abort: A,
        poll_ms: u64,
        deadline: Option<Instant>,
    ) -> bool
    where
        C: Fn() -> usize,
        A: Fn() -> bool,
    {
        debug_assert!(poll_ms > 0);

        loop {
            if self.can_unlock(in_flight()) {
                return true;
            }

            if abort() {
                return false;
            }

            let wait_ms = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    ((deadline - now).as_millis() as u64).clamp(1, poll_ms)
                }
                None => poll_ms,
            };

            self.event.wait(wait_ms);
        }
    }
}
