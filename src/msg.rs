//! Kernel message model.
//!
//! The kernel produces one FIFO stream of messages per managed CPU. Every
//! message carries a `seqnum` that becomes the subject task's new barrier
//! token. A `switchto_cpu` of `Some(c)` marks a message produced at the end
//! of a kernel switch-to chain; the agent on `c` must be pinged so it
//! notices the task that landed there.

use crate::types::{BarrierToken, CpuId, Gtid};

/// One kernel event, as read from a per-CPU channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub seqnum: BarrierToken,
    pub payload: Payload,
}

/// Tagged event payloads delivered by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// A task entered the enclave. `runnable` tasks are admitted immediately.
    TaskNew { gtid: Gtid, runnable: bool },
    /// A blocked task woke up. Non-deferrable wakeups get front-of-queue
    /// preference on their next enqueue.
    TaskWakeup { gtid: Gtid, deferrable: bool },
    /// The task went to sleep.
    TaskBlocked { gtid: Gtid, switchto_cpu: Option<CpuId> },
    /// The task gave up the CPU voluntarily but stays runnable.
    TaskYield { gtid: Gtid, switchto_cpu: Option<CpuId> },
    /// The kernel took the CPU away from the task.
    TaskPreempt { gtid: Gtid, switchto_cpu: Option<CpuId> },
    /// The task left the enclave.
    TaskDeparted { gtid: Gtid, switchto_cpu: Option<CpuId> },
    /// The task exited while blocked.
    TaskDead { gtid: Gtid },
    /// The task entered a kernel switch-to chain. Annotation only: the
    /// follow-up wakeup or preempt message does the re-queueing.
    TaskSwitchto { gtid: Gtid },
    /// Periodic tick for a CPU. May arrive on the default channel for a
    /// different CPU than the consuming agent's.
    CpuTick { cpu: CpuId },
}

impl Message {
    /// The task this message is about, if it is task-scoped.
    pub fn gtid(&self) -> Option<Gtid> {
        match self.payload {
            Payload::TaskNew { gtid, .. }
            | Payload::TaskWakeup { gtid, .. }
            | Payload::TaskBlocked { gtid, .. }
            | Payload::TaskYield { gtid, .. }
            | Payload::TaskPreempt { gtid, .. }
            | Payload::TaskDeparted { gtid, .. }
            | Payload::TaskDead { gtid }
            | Payload::TaskSwitchto { gtid } => Some(gtid),
            Payload::CpuTick { .. } => None,
        }
    }
}
