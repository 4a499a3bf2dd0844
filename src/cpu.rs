//! Per-CPU agent state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::enclave::Channel;
use crate::rq::RunQueue;
use crate::task::TaskRef;
use crate::types::CpuId;

/// Everything one agent owns for its CPU: the bound message channel, the
/// two-array runqueue, the current task slot, and the pending-preempt flag
/// raised by the tick accountant.
pub struct CpuState {
    pub cpu: CpuId,
    pub channel: Arc<dyn Channel>,
    pub rq: RunQueue,
    curr: Mutex<Option<TaskRef>>,
    preempt_curr: AtomicBool,
}

impl CpuState {
    pub fn new(cpu: CpuId, channel: Arc<dyn Channel>) -> Self {
        Self {
            cpu,
            channel,
            rq: RunQueue::new(),
            curr: Mutex::new(None),
            preempt_curr: AtomicBool::new(false),
        }
    }

    pub fn current(&self) -> Option<TaskRef> {
        self.curr.lock().unwrap().clone()
    }

    pub fn set_current(&self, task: TaskRef) {
        *self.curr.lock().unwrap() = Some(task);
    }

    pub fn is_current(&self, task: &TaskRef) -> bool {
        self.curr
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|c| Arc::ptr_eq(c, task))
    }

    /// Clear the current slot if `task` occupies it. Returns whether it did.
    pub fn clear_current_if(&self, task: &TaskRef) -> bool {
        let mut curr = self.curr.lock().unwrap();
        if curr.as_ref().is_some_and(|c| Arc::ptr_eq(c, task)) {
            *curr = None;
            true
        } else {
            false
        }
    }

    pub fn flag_preempt(&self) {
        self.preempt_curr.store(true, Ordering::SeqCst);
    }

    /// Consume the pending-preempt flag.
    pub fn take_preempt(&self) -> bool {
        self.preempt_curr.swap(false, Ordering::SeqCst)
    }
}
