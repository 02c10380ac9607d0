use std::time::{Duration, Instant};

/// Millisecond clock shared by a context, its sessions and their timers.
pub struct Epoch {
    time_base: Instant,
}

impl Epoch {
    pub fn new() -> Self {
        Self {
            time_base: Instant::now(),
        }
    }

    pub fn time_now_ms(&self) -> u64 {
        self.time_base.elapsed().as_millis() as u64
    }

    /// Absolute time `delay_ms` from now.
    pub fn deadline_ms(&self, delay_ms: u64) -> u64 {
        self.time_now_ms().saturating_add(delay_ms)
    }

    /// Time remaining until `deadline_ms`, zero if it already passed.
    pub fn until(&self, deadline_ms: u64) -> Duration {
        Duration::from_millis(deadline_ms.saturating_sub(self.time_now_ms()))
    }
}
