//! Newtype wrappers and crate-wide tunables.
//!
//! Newtypes for identifiers (gtids, CPU ids, barrier tokens) prevent silent
//! type confusion. Quantities (timestamps, slice remainders) stay plain
//! integer aliases.

use std::fmt;

/// Global task identifier, opaque to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Gtid(pub u64);

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// CPU identifier within the managed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CpuId(pub u32);

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic token fencing channel association and transaction commit
/// against stale kernel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BarrierToken(pub u64);

/// Monotonic timestamp in nanoseconds.
pub type TimeNs = u64;

/// Signed nanosecond quantity. Slice remainders go negative when a task
/// overruns its allocation.
pub type TimeDeltaNs = i64;

/// Default time slice handed to a task on every refill.
pub const DEFAULT_SLICE_NS: TimeDeltaNs = 10_000_000;

/// Requested capacity for each per-CPU kernel message channel.
pub const CHANNEL_CAP: usize = 1024;

/// Iteration bound for the on-cpu wait before a dispatch commit. Past this
/// the candidate is requeued with a boost instead of spinning further.
pub const ONCPU_SPIN_LIMIT: u32 = 10_000;
