use std::sync::{Condvar, Mutex, PoisonError};
use crate::epoch::Epoch;
use crate::event::lock;

/// The four deadlines driving a session's sender thread, in firing priority order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimerName {
    Ack,
    Repeat,
    Lost,
    Send,
}

const TIMER_NAMES: [TimerName; 4] = [
    TimerName::Ack,
    TimerName::Repeat,
    TimerName::Lost,
    TimerName::Send,
];

impl TimerName {
    fn index(self) -> usize {
        match self {
            Self::Ack => 0,
            Self::Repeat => 1,
            Self::Lost => 2,
            Self::Send => 3,
        }
    }
}

struct TimerState {
    // None = idle, Some(t) = armed to fire at t
    deadlines: [Option<u64>; 4],
    interrupted: bool,
}

/// Per-session timer set. Each timer is either idle or armed with an absolute deadline.
pub struct SenderTimers {
    state: Mutex<TimerState>,
    cond: Condvar,
}

impl SenderTimers {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TimerState {
                deadlines: [None; 4],
                interrupted: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Arms `name` unless it is already pending. Returns true if the timer was armed.
    pub fn arm_if_idle(&self, name: TimerName, deadline_ms: u64) -> bool {
        let mut state = lock(&self.state);

        let ref mut slot = state.deadlines[name.index()];
        if slot.is_some() {
            return false;
        }
        *slot = Some(deadline_ms);

        self.cond.notify_all();
        true
    }

    /// Arms `name` if it is idle or pending with a later deadline. Returns true if the deadline
    /// changed.
    pub fn arm_earliest(&self, name: TimerName, deadline_ms: u64) -> bool {
        let mut state = lock(&self.state);

        let ref mut slot = state.deadlines[name.index()];
        match *slot {
            Some(current_ms) if current_ms <= deadline_ms => return false,
            _ => *slot = Some(deadline_ms),
        }

        self.cond.notify_all();
        true
    }

    #[cfg(test)]
    pub fn deadline(&self, name: TimerName) -> Option<u64> {
        lock(&self.state).deadlines[name.index()]
    }

    /// If `name` has expired, returns it to idle and returns true.
    pub fn take_expired(&self, name: TimerName, now_ms: u64) -> bool {
        let mut state = lock(&self.state);

        let ref mut slot = state.deadlines[name.index()];
        match *slot {
            Some(deadline_ms) if deadline_ms <= now_ms => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    /// Blocks until a timer expires and returns it, idle again. Among expired timers the one
    /// listed first in [`TimerName`] wins. Returns `None` once interrupted.
    pub fn wait_next(&self, epoch: &Epoch) -> Option<TimerName> {
        let mut state = lock(&self.state);

        loop {
            if state.interrupted {
                return None;
            }

            let now_ms = epoch.time_now_ms();

            let expired = TIMER_NAMES.iter().copied().find(|name| {
                matches!(state.deadlines[name.index()], Some(deadline_ms) if deadline_ms <= now_ms)
            });

            if let Some(name) = expired {
                state.deadlines[name.index()] = None;
                return Some(name);
            }

            let next_deadline_ms = state.deadlines.iter().flatten().copied().min();

            state = match next_deadline_ms {
                Some(deadline_ms) => {
                    let timeout = epoch.until(deadline_ms);
                    self.cond
                        .wait_timeout(state, timeout)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .cond
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    /// Makes the current and every future `wait_next` return `None`.
    pub fn interrupt(&self) {
        lock(&self.state).interrupted = true;
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn pending_timer_is_not_rearmed() {
        let timers = SenderTimers::new();

        assert!(timers.arm_if_idle(TimerName::Ack, 100));
        assert!(!timers.arm_if_idle(TimerName::Ack, 50));
        assert_eq!(timers.deadline(TimerName::Ack), Some(100));

        assert!(!timers.take_expired(TimerName::Ack, 99));
        assert!(timers.take_expired(TimerName::Ack, 100));
        assert_eq!(timers.deadline(TimerName::Ack), None);

        assert!(timers.arm_if_idle(TimerName::Ack, 50));
    }

    #[test]
    fn earliest_deadline_wins() {
        let timers = SenderTimers::new();

        assert!(timers.arm_earliest(TimerName::Repeat, 2000));
        assert!(timers.arm_earliest(TimerName::Repeat, 10));
        assert!(!timers.arm_earliest(TimerName::Repeat, 2000));
        assert_eq!(timers.deadline(TimerName::Repeat), Some(10));
    }

    #[test]
    fn fires_in_priority_order() {
        let epoch = Epoch::new();
        let timers = SenderTimers::new();

        timers.arm_if_idle(TimerName::Send, 0);
        timers.arm_if_idle(TimerName::Lost, 0);
        timers.arm_if_idle(TimerName::Ack, 0);
        timers.arm_if_idle(TimerName::Repeat, epoch.deadline_ms(30));

        assert_eq!(timers.wait_next(&epoch), Some(TimerName::Ack));
        assert_eq!(timers.wait_next(&epoch), Some(TimerName::Lost));
        assert_eq!(timers.wait_next(&epoch), Some(TimerName::Send));
        assert_eq!(timers.wait_next(&epoch), Some(TimerName::Repeat));
        assert!(epoch.time_now_ms() >= 30);
    }

    #[test]
    fn interrupt_releases_waiter() {
        let epoch = Arc::new(Epoch::new());
        let timers = Arc::new(SenderTimers::new());

        let waiter = {
            let epoch = Arc::clone(&epoch);
            let timers = Arc::clone(&timers);
            thread::spawn(move || timers.wait_next(&epoch))
        };

        thread::sleep(Duration::from_millis(20));
        timers.interrupt();

        assert_eq!(waiter.join().unwrap(), None);
    }

    #[test]
    fn arming_wakes_waiter() {
        let epoch = Arc::new(Epoch::new());
        let timers = Arc::new(SenderTimers::new());

        let waiter = {
            let epoch = Arc::clone(&epoch);
            let timers = Arc::clone(&timers);
            thread::spawn(move || timers.wait_next(&epoch))
        };

        thread::sleep(Duration::from_millis(20));
        timers.arm_if_idle(TimerName::Send, epoch.time_now_ms());

        assert_eq!(waiter.join().unwrap(), Some(TimerName::Send));
    }
}
