//! Two-array per-CPU runqueue.
//!
//! The O(1) design: an *active* deque of tasks with slice time left and an
//! *expired* deque of tasks whose slice was refilled for the next rotation.
//! When the active deque drains, the two are swapped in O(1). Boosted tasks
//! go to the front of whichever deque receives them; everyone else appends.
//!
//! The internal mutex makes the queue safe against the two off-agent
//! writers (admission on the default agent, tick accounting), and the tick
//! accountant additionally serializes its current-task check through
//! [`RunQueue::locked`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::task::{TaskRef, TaskState};
use crate::types::Gtid;

#[derive(Default)]
struct Arrays {
    active: VecDeque<TaskRef>,
    expired: VecDeque<TaskRef>,
}

impl Arrays {
    fn place(deque: &mut VecDeque<TaskRef>, task: TaskRef, front: bool) {
        if front {
            deque.push_front(task);
        } else {
            deque.push_back(task);
        }
    }

    /// Remove `task` from one deque. Checks the back first: boost and
    /// preempt traffic overwhelmingly touches the most recent enqueue.
    fn remove(deque: &mut VecDeque<TaskRef>, task: &TaskRef) -> bool {
        if let Some(back) = deque.back() {
            if Arc::ptr_eq(back, task) {
                deque.pop_back();
                return true;
            }
        }
        if let Some(pos) = deque.iter().position(|t| Arc::ptr_eq(t, task)) {
            deque.remove(pos);
            return true;
        }
        false
    }
}

/// One CPU's active/expired runqueue pair.
#[derive(Default)]
pub struct RunQueue {
    arrays: Mutex<Arrays>,
}

impl RunQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy enqueue: active while slice time remains, otherwise refill
    /// and park in expired for the next rotation.
    pub fn enqueue(&self, task: &TaskRef) {
        let mut arrays = self.arrays.lock().unwrap();
        let mut t = task.lock().unwrap();
        assert!(t.cpu.is_some(), "enqueue of unassigned task {}", t.gtid);
        assert_eq!(
            t.state,
            TaskState::Runnable,
            "enqueue of {} in state {}",
            t.gtid,
            t.state
        );
        t.state = TaskState::Queued;
        if t.remaining_ns > 0 {
            Arrays::place(&mut arrays.active, task.clone(), t.prio_boost);
        } else {
            t.refill_slice();
            Arrays::place(&mut arrays.expired, task.clone(), t.prio_boost);
        }
    }

    /// Force placement in the active array, bypassing the slice check.
    pub fn enqueue_active(&self, task: &TaskRef) {
        let mut arrays = self.arrays.lock().unwrap();
        let mut t = task.lock().unwrap();
        assert!(t.cpu.is_some(), "enqueue of unassigned task {}", t.gtid);
        assert_eq!(t.state, TaskState::Runnable);
        t.state = TaskState::Queued;
        Arrays::place(&mut arrays.active, task.clone(), t.prio_boost);
    }

    /// Force placement in the expired array. Refills the slice, preserving
    /// the invariant that every expired entry carries a full slice.
    pub fn enqueue_expired(&self, task: &TaskRef) {
        let mut arrays = self.arrays.lock().unwrap();
        let mut t = task.lock().unwrap();
        assert!(t.cpu.is_some(), "enqueue of unassigned task {}", t.gtid);
        assert_eq!(t.state, TaskState::Runnable);
        t.state = TaskState::Queued;
        t.refill_slice();
        Arrays::place(&mut arrays.expired, task.clone(), t.prio_boost);
    }

    /// Pop the next task to run. Swaps the arrays when active is empty;
    /// returns None only when both are.
    pub fn dequeue(&self) -> Option<TaskRef> {
        let mut arrays = self.arrays.lock().unwrap();
        if arrays.active.is_empty() {
            if arrays.expired.is_empty() {
                return None;
            }
            let Arrays { active, expired } = &mut *arrays;
            std::mem::swap(active, expired);
        }
        let task = arrays.active.pop_front().unwrap();
        {
            let mut t = task.lock().unwrap();
            assert!(t.queued(), "dequeued {} in state {}", t.gtid, t.state);
            t.state = TaskState::Runnable;
        }
        Some(task)
    }

    /// Remove a queued task from whichever deque holds it. Not finding it
    /// is a placement-invariant breach.
    pub fn erase(&self, task: &TaskRef) {
        let mut arrays = self.arrays.lock().unwrap();
        {
            let t = task.lock().unwrap();
            assert!(t.queued(), "erase of {} in state {}", t.gtid, t.state);
        }
        let Arrays { active, expired } = &mut *arrays;
        let found = Arrays::remove(active, task) || Arrays::remove(expired, task);
        let mut t = task.lock().unwrap();
        assert!(found, "queued task {} missing from both arrays", t.gtid);
        t.state = TaskState::Runnable;
    }

    pub fn is_empty(&self) -> bool {
        let arrays = self.arrays.lock().unwrap();
        arrays.active.is_empty() && arrays.expired.is_empty()
    }

    /// (active, expired) lengths.
    pub fn lens(&self) -> (usize, usize) {
        let arrays = self.arrays.lock().unwrap();
        (arrays.active.len(), arrays.expired.len())
    }

    /// Front-to-back gtid listing of both arrays, for diagnostics and
    /// placement assertions.
    pub fn queued_gtids(&self) -> (Vec<Gtid>, Vec<Gtid>) {
        let arrays = self.arrays.lock().unwrap();
        let ids = |dq: &VecDeque<TaskRef>| dq.iter().map(|t| t.lock().unwrap().gtid).collect();
        (ids(&arrays.active), ids(&arrays.expired))
    }

    /// Run `f` with the queue mutex held. The tick accountant uses this to
    /// serialize its current-task check against admission-side enqueues.
    pub fn locked<R>(&self, f: impl FnOnce() -> R) -> R {
        let _arrays = self.arrays.lock().unwrap();
        f()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enclave::StatusWord;
    use crate::task::Task;
    use crate::types::{BarrierToken, CpuId, DEFAULT_SLICE_NS};

    struct NullStatusWord;

    impl StatusWord for NullStatusWord {
        fn on_cpu(&self) -> bool {
            false
        }

        fn barrier(&self) -> BarrierToken {
            BarrierToken(0)
        }
    }

    fn runnable(id: u64) -> TaskRef {
        let mut t = Task::new(Gtid(id), BarrierToken(0), Arc::new(NullStatusWord));
        t.state = TaskState::Runnable;
        t.cpu = Some(CpuId(0));
        Arc::new(Mutex::new(t))
    }

    #[test]
    fn enqueue_splits_by_remaining_time() {
        let rq = RunQueue::new();
        let fresh = runnable(1);
        let spent = runnable(2);
        spent.lock().unwrap().remaining_ns = 0;

        rq.enqueue(&fresh);
        rq.enqueue(&spent);

        let (active, expired) = rq.queued_gtids();
        assert_eq!(active, vec![Gtid(1)]);
        assert_eq!(expired, vec![Gtid(2)]);
    }

    #[test]
    fn expired_entry_gets_full_slice() {
        let rq = RunQueue::new();
        let spent = runnable(1);
        spent.lock().unwrap().remaining_ns = -3_000_000;

        rq.enqueue(&spent);

        assert_eq!(spent.lock().unwrap().remaining_ns, DEFAULT_SLICE_NS);
    }

    #[test]
    fn boost_goes_to_the_front() {
        let rq = RunQueue::new();
        let a = runnable(1);
        let b = runnable(2);
        b.lock().unwrap().prio_boost = true;

        rq.enqueue(&a);
        rq.enqueue(&b);

        let (active, _) = rq.queued_gtids();
        assert_eq!(active, vec![Gtid(2), Gtid(1)]);
    }

    #[test]
    fn explicit_variants_bypass_the_slice_check() {
        let rq = RunQueue::new();
        let spent = runnable(1);
        spent.lock().unwrap().remaining_ns = 0;
        rq.enqueue_active(&spent);
        assert_eq!(rq.lens(), (1, 0));
        assert_eq!(spent.lock().unwrap().remaining_ns, 0);

        let fresh = runnable(2);
        fresh.lock().unwrap().remaining_ns = 1;
        rq.enqueue_expired(&fresh);
        assert_eq!(rq.lens(), (1, 1));
        assert_eq!(fresh.lock().unwrap().remaining_ns, DEFAULT_SLICE_NS);
    }

    #[test]
    fn dequeue_swaps_when_active_drains() {
        let rq = RunQueue::new();
        let a = runnable(1);
        let b = runnable(2);
        for t in [&a, &b] {
            t.lock().unwrap().remaining_ns = 0;
            rq.enqueue(t);
        }
        assert_eq!(rq.lens(), (0, 2));

        let first = rq.dequeue().unwrap();
        assert_eq!(first.lock().unwrap().gtid, Gtid(1));
        assert_eq!(rq.lens(), (1, 0));

        let second = rq.dequeue().unwrap();
        assert_eq!(second.lock().unwrap().gtid, Gtid(2));
        assert!(rq.dequeue().is_none());
    }

    #[test]
    fn dequeue_marks_runnable() {
        let rq = RunQueue::new();
        let a = runnable(1);
        rq.enqueue(&a);
        let out = rq.dequeue().unwrap();
        assert_eq!(out.lock().unwrap().state, TaskState::Runnable);
    }

    #[test]
    fn erase_handles_back_and_middle() {
        let rq = RunQueue::new();
        let tasks: Vec<_> = (1..=3).map(runnable).collect();
        for t in &tasks {
            rq.enqueue(t);
        }

        rq.erase(&tasks[2]); // back fast path
        rq.erase(&tasks[0]); // scan path

        let (active, _) = rq.queued_gtids();
        assert_eq!(active, vec![Gtid(2)]);
        assert_eq!(tasks[0].lock().unwrap().state, TaskState::Runnable);
    }

    #[test]
    fn erase_finds_expired_entries() {
        let rq = RunQueue::new();
        let spent = runnable(1);
        spent.lock().unwrap().remaining_ns = 0;
        rq.enqueue(&spent);

        rq.erase(&spent);
        assert!(rq.is_empty());
    }

    #[test]
    #[should_panic(expected = "missing from both arrays")]
    fn erase_of_untracked_task_is_fatal() {
        let rq = RunQueue::new();
        let ghost = runnable(1);
        ghost.lock().unwrap().state = TaskState::Queued;
        rq.erase(&ghost);
    }
}
