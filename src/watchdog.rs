//! Transition watchdog and autonomous-operation deadlines.
//!
//! The state machine never sleeps; it emits arm/cancel actions and the
//! session loop keeps the deadlines here, sleeping until the earliest one.
//! One table serves all timers of a session: the per-group transition
//! watchdog, the per-ASE autonomous-operation timers and the periodic link
//! quality reads.

use embassy_time::{Duration, Instant};
use heapless::Vec;

/// Deadlines a session can hold at once: per-group watchdogs, autonomous
/// timers and one link quality watch per CIS.
pub const MAX_TIMERS: usize = 16;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKey {
    /// Watchdog guarding a group transition; at most one per group.
    Transition { group_id: u8 },
    /// Bounded watch on the second half of an autonomous bidirectional
    /// disable.
    Autonomous { group_id: u8, device: u8, ase: u8 },
    /// Periodic ISO link quality read on an established CIS.
    LinkQuality { group_id: u8, cis_conn_handle: u16 },
}

#[derive(Debug, Clone, Copy)]
struct TimerEntry {
    key: TimerKey,
    deadline: Instant,
    period: Option<Duration>,
}

/// Bounded deadline table. Arming an existing key replaces its deadline.
#[derive(Default)]
pub struct TimerTable {
    entries: Vec<TimerEntry, MAX_TIMERS>,
}

impl TimerTable {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn arm(&mut self, key: TimerKey, now: Instant, timeout: Duration) {
        self.insert(key, now + timeout, None);
    }

    pub fn arm_periodic(&mut self, key: TimerKey, now: Instant, period: Duration) {
        self.insert(key, now + period, Some(period));
    }

    fn insert(&mut self, key: TimerKey, deadline: Instant, period: Option<Duration>) {
        self.cancel(key);
        if self
            .entries
            .push(TimerEntry {
                key,
                deadline,
                period,
            })
            .is_err()
        {
            error!("timer table full, deadline dropped");
        }
    }

    pub fn cancel(&mut self, key: TimerKey) {
        if let Some(index) = self.entries.iter().position(|e| e.key == key) {
            self.entries.swap_remove(index);
        }
    }

    pub fn is_armed(&self, key: TimerKey) -> bool {
        self.entries.iter().any(|e| e.key == key)
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|e| e.deadline).min()
    }

    /// Take one expired timer. Periodic timers re-arm themselves.
    pub fn pop_expired(&mut self, now: Instant) -> Option<TimerKey> {
        let index = self.entries.iter().position(|e| e.deadline <= now)?;
        let key = self.entries[index].key;
        match self.entries[index].period {
            Some(period) => self.entries[index].deadline = now + period,
            None => {
                self.entries.swap_remove(index);
            }
        }
        Some(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ticks: u64) -> Instant {
        Instant::from_ticks(ticks)
    }

    #[test]
    fn rearm_replaces_deadline() {
        let mut timers = TimerTable::new();
        let key = TimerKey::Transition { group_id: 1 };
        timers.arm(key, at(0), Duration::from_ticks(100));
        timers.arm(key, at(50), Duration::from_ticks(100));
        assert_eq!(timers.next_deadline(), Some(at(150)));
        assert!(timers.pop_expired(at(100)).is_none());
        assert_eq!(timers.pop_expired(at(150)), Some(key));
        assert!(!timers.is_armed(key));
    }

    #[test]
    fn earliest_deadline_wins() {
        let mut timers = TimerTable::new();
        let slow = TimerKey::Transition { group_id: 1 };
        let fast = TimerKey::Autonomous {
            group_id: 1,
            device: 0,
            ase: 1,
        };
        timers.arm(slow, at(0), Duration::from_ticks(500));
        timers.arm(fast, at(0), Duration::from_ticks(100));
        assert_eq!(timers.next_deadline(), Some(at(100)));
        assert_eq!(timers.pop_expired(at(100)), Some(fast));
        assert_eq!(timers.next_deadline(), Some(at(500)));
    }

    #[test]
    fn periodic_timer_rearms() {
        let mut timers = TimerTable::new();
        let key = TimerKey::LinkQuality {
            group_id: 1,
            cis_conn_handle: 0x60,
        };
        timers.arm_periodic(key, at(0), Duration::from_ticks(100));
        assert_eq!(timers.pop_expired(at(100)), Some(key));
        assert_eq!(timers.next_deadline(), Some(at(200)));
        timers.cancel(key);
        assert_eq!(timers.next_deadline(), None);
    }
}
