//! twinq - user-space CPU scheduling agent core.
//!
//! The host kernel framework (the "enclave") delegates dispatch decisions
//! for a set of CPUs to this crate. One agent per managed CPU drains that
//! CPU's kernel message channel, drives the task state machine, and
//! commits dispatch transactions that place the chosen task on the CPU.
//!
//! # Architecture
//!
//! - **Scheduler** ([`sched`]): message dispatch, the per-CPU scheduling
//!   loop, round-robin admission, tick accounting
//! - **Runqueue** ([`rq`]): the O(1) two-array (active/expired) design
//!   with slice-refill rotation
//! - **Tasks** ([`task`], [`alloc`]): per-task lifecycle state behind a
//!   process-wide allocator
//! - **Enclave seams** ([`enclave`]): traits for the channels, run-request
//!   transactions, status words and agent pings the host provides
//! - **Sim** ([`sim`]): deterministic in-memory enclave for tests and the
//!   `twinq-sim` binary
//!
//! # Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use twinq::sim::{SimClock, SimEnclave};
//! use twinq::{CpuId, Gtid, Payload, Scheduler};
//!
//! let cpus = vec![CpuId(0), CpuId(1)];
//! let enclave = SimEnclave::new(&cpus);
//! let clock = SimClock::new();
//! let sched = Scheduler::new(enclave.clone(), cpus, clock).unwrap();
//! sched.enclave_ready();
//!
//! enclave.post(CpuId(0), Payload::TaskNew { gtid: Gtid(1), runnable: true });
//! sched.schedule(CpuId(0), &*enclave.agent_sw(CpuId(0)));
//! ```

pub mod alloc;
pub mod clock;
pub mod cpu;
pub mod enclave;
pub mod msg;
pub mod rq;
pub mod sched;
pub mod sim;
pub mod stats;
pub mod task;
pub mod types;

pub use clock::{Clock, MonotonicClock};
pub use enclave::{
    Channel, CpuAgent, Enclave, RunRequest, StatusWord, TxnSpec, COMMIT_AT_TXN_COMMIT,
    YIELD_RETURN_ON_IDLE,
};
pub use msg::{Message, Payload};
pub use rq::RunQueue;
pub use sched::{Scheduler, DUMP_ALL_TASKS, DUMP_EMPTY_RQ, SCHEDULER_NAME};
pub use stats::Metrics;
pub use task::{Task, TaskRef, TaskState};
pub use types::{
    BarrierToken, CpuId, Gtid, TimeDeltaNs, TimeNs, CHANNEL_CAP, DEFAULT_SLICE_NS,
    ONCPU_SPIN_LIMIT,
};
