//! Per-task scheduling state.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::enclave::StatusWord;
use crate::types::{BarrierToken, CpuId, Gtid, TimeDeltaNs, TimeNs, DEFAULT_SLICE_NS};

/// Lifecycle stage of a managed task. Exactly one at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Not runnable; in no runqueue, on no CPU.
    Blocked,
    /// Runnable but momentarily in no structure (between dequeue and
    /// commit, or mid-handler).
    Runnable,
    /// Sitting in exactly one deque of its owning CPU's runqueue.
    Queued,
    /// The current task of its owning CPU.
    OnCpu,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Blocked => "blocked",
            TaskState::Runnable => "runnable",
            TaskState::Queued => "queued",
            TaskState::OnCpu => "oncpu",
        };
        f.write_str(s)
    }
}

/// Shared handle to a task record. The allocator owns the canonical map;
/// runqueues and `current` slots hold clones.
pub type TaskRef = Arc<Mutex<Task>>;

/// One managed task.
///
/// All fields are mutated on the owning CPU's agent, with two documented
/// exceptions: initial admission (default agent) and tick accounting (the
/// agent that consumed the tick, which may differ when ticks land on the
/// default channel). The record lives behind a mutex for those paths.
pub struct Task {
    pub gtid: Gtid,
    pub state: TaskState,
    /// Owning CPU. Fixed after admission.
    pub cpu: Option<CpuId>,
    /// Barrier token from the most recent kernel message.
    pub seqnum: BarrierToken,
    /// Unspent portion of the current slice. Zero or negative means the
    /// slice is exhausted.
    pub remaining_ns: TimeDeltaNs,
    /// Timestamp of the most recent transition onto a CPU.
    pub last_pick_ns: TimeNs,
    /// Set while the task waits in a runqueue because it was involuntarily
    /// preempted. Cleared when it next goes on CPU.
    pub preempted: bool,
    /// Front-of-queue placement on the next enqueue. Cleared on CPU.
    pub prio_boost: bool,
    pub status_word: Arc<dyn StatusWord>,
}

impl Task {
    pub fn new(gtid: Gtid, seqnum: BarrierToken, status_word: Arc<dyn StatusWord>) -> Self {
        Self {
            gtid,
            state: TaskState::Blocked,
            cpu: None,
            seqnum,
            remaining_ns: DEFAULT_SLICE_NS,
            last_pick_ns: 0,
            preempted: false,
            prio_boost: false,
            status_word,
        }
    }

    pub fn blocked(&self) -> bool {
        self.state == TaskState::Blocked
    }

    pub fn queued(&self) -> bool {
        self.state == TaskState::Queued
    }

    /// Hand the task a fresh default slice.
    pub fn refill_slice(&mut self) {
        self.remaining_ns = DEFAULT_SLICE_NS;
    }

    pub fn slice_expired(&self) -> bool {
        self.remaining_ns <= 0
    }

    /// Charge runtime since the last pick when the task leaves the CPU.
    /// The pick timestamp is not advanced; the next [`Task::stamp_pick`]
    /// does that.
    pub fn charge_off_cpu(&mut self, now: TimeNs) {
        self.remaining_ns -= (now - self.last_pick_ns) as TimeDeltaNs;
    }

    /// Tick-time accounting: charge runtime since the last pick, advance
    /// the pick timestamp, and report whether the slice ran out.
    pub fn charge_tick(&mut self, now: TimeNs) -> bool {
        self.remaining_ns -= (now - self.last_pick_ns) as TimeDeltaNs;
        self.last_pick_ns = now;
        self.slice_expired()
    }

    /// Record the moment the task went on CPU.
    pub fn stamp_pick(&mut self, now: TimeNs) {
        self.last_pick_ns = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullStatusWord;

    impl StatusWord for NullStatusWord {
        fn on_cpu(&self) -> bool {
            false
        }

        fn barrier(&self) -> BarrierToken {
            BarrierToken(0)
        }
    }

    fn task() -> Task {
        Task::new(Gtid(1), BarrierToken(1), Arc::new(NullStatusWord))
    }

    #[test]
    fn new_task_is_blocked_with_full_slice() {
        let t = task();
        assert_eq!(t.state, TaskState::Blocked);
        assert_eq!(t.remaining_ns, DEFAULT_SLICE_NS);
        assert!(t.cpu.is_none());
    }

    #[test]
    fn off_cpu_charge_keeps_pick_timestamp() {
        let mut t = task();
        t.stamp_pick(1_000_000);
        t.charge_off_cpu(4_000_000);
        assert_eq!(t.remaining_ns, DEFAULT_SLICE_NS - 3_000_000);
        assert_eq!(t.last_pick_ns, 1_000_000);
    }

    #[test]
    fn tick_charge_advances_pick_timestamp() {
        let mut t = task();
        t.stamp_pick(0);
        assert!(!t.charge_tick(2_000_000));
        assert_eq!(t.last_pick_ns, 2_000_000);
        assert_eq!(t.remaining_ns, DEFAULT_SLICE_NS - 2_000_000);
    }

    #[test]
    fn tick_charge_reports_exhaustion() {
        let mut t = task();
        t.stamp_pick(0);
        assert!(t.charge_tick(DEFAULT_SLICE_NS as TimeNs + 2_000_000));
        assert!(t.slice_expired());
        assert_eq!(t.remaining_ns, -2_000_000);
    }
}
