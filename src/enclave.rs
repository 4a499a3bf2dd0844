//! Trait seams toward the host scheduling framework.
//!
//! The core never talks to a kernel directly. Everything it needs from the
//! host (per-CPU message channels, the run-request commit primitive, agent
//! pings, shared status words) comes in through the traits below. The only
//! in-tree implementation is the in-memory one in [`crate::sim`].

use std::sync::Arc;

use crate::msg::Message;
use crate::types::{BarrierToken, CpuId, Gtid};

/// Commit the transaction at txn-commit time (the only mode the core uses).
pub const COMMIT_AT_TXN_COMMIT: u32 = 1 << 0;

/// Ask the kernel to return control to the agent once the CPU idles.
pub const YIELD_RETURN_ON_IDLE: u32 = 1 << 0;

/// A dispatch transaction: "put `target` on this CPU", fenced by the
/// target's and the agent's barrier tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnSpec {
    pub target: Gtid,
    pub target_barrier: BarrierToken,
    pub agent_barrier: BarrierToken,
    pub commit_flags: u32,
}

/// Per-CPU transaction handle.
pub trait RunRequest: Send + Sync {
    fn open(&self, spec: TxnSpec);

    /// Commit the open transaction. False means concurrent kernel activity
    /// invalidated a barrier; the caller retries by requeueing the target.
    fn commit(&self) -> bool;

    /// Give the CPU back to the kernel without dispatching anything.
    fn local_yield(&self, agent_barrier: BarrierToken, flags: u32);
}

/// Read-only kernel-shared record for one task (or one agent).
pub trait StatusWord: Send + Sync {
    /// Whether the kernel currently has the task on some CPU.
    fn on_cpu(&self) -> bool;

    fn barrier(&self) -> BarrierToken;

    /// Agent status words only: the kernel wants the agent to yield the CPU
    /// to a higher-priority sched class instead of dispatching.
    fn boosted_priority(&self) -> bool {
        false
    }
}

/// FIFO message channel bound to one CPU. The consuming agent is the sole
/// reader; `peek` never blocks.
pub trait Channel: Send + Sync {
    fn peek(&self) -> Option<Message>;

    fn consume(&self, msg: &Message);

    /// Re-route a task's future messages to this channel. False means the
    /// supplied barrier was stale; the caller decides whether that is
    /// retryable (agent association) or a contract breach (task admission).
    fn associate_task(&self, gtid: Gtid, barrier: BarrierToken) -> bool;
}

/// Handle to the agent thread bound to one CPU.
pub trait CpuAgent: Send + Sync {
    fn gtid(&self) -> Gtid;

    fn barrier(&self) -> BarrierToken;

    /// Kick the agent so it runs another scheduling pass.
    fn ping(&self);
}

/// The host framework grouping the managed CPUs under agent control.
pub trait Enclave: Send + Sync {
    fn make_channel(&self, cap: usize, node: u32, cpus: &[CpuId]) -> Arc<dyn Channel>;

    fn agent(&self, cpu: CpuId) -> Arc<dyn CpuAgent>;

    fn run_request(&self, cpu: CpuId) -> Arc<dyn RunRequest>;

    fn set_deliver_ticks(&self, enabled: bool);

    /// Status word for a task entering the enclave.
    fn task_status_word(&self, gtid: Gtid) -> Arc<dyn StatusWord>;
}
