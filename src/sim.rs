//! In-memory enclave.
//!
//! Implements every host-framework seam single-process and deterministic:
//! hand-advanced clock, recorded transactions, programmable commit
//! verdicts. The integration tests and the `twinq-sim` binary both drive
//! the scheduling core through this module.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::enclave::{Channel, CpuAgent, Enclave, RunRequest, StatusWord, TxnSpec};
use crate::msg::{Message, Payload};
use crate::types::{BarrierToken, CpuId, Gtid, TimeNs};

/// Manually advanced nanosecond clock.
#[derive(Default)]
pub struct SimClock {
    now: AtomicU64,
}

impl SimClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn advance(&self, delta_ns: TimeNs) {
        self.now.fetch_add(delta_ns, Ordering::SeqCst);
    }
}

impl Clock for SimClock {
    fn now_ns(&self) -> TimeNs {
        self.now.load(Ordering::SeqCst)
    }
}

/// Status word whose kernel side the test scripts by hand.
#[derive(Default)]
pub struct SimStatusWord {
    on_cpu: AtomicBool,
    barrier: AtomicU64,
    boosted: AtomicBool,
}

impl SimStatusWord {
    pub fn set_on_cpu(&self, on_cpu: bool) {
        self.on_cpu.store(on_cpu, Ordering::SeqCst);
    }

    pub fn set_barrier(&self, barrier: BarrierToken) {
        self.barrier.store(barrier.0, Ordering::SeqCst);
    }

    pub fn set_boosted_priority(&self, boosted: bool) {
        self.boosted.store(boosted, Ordering::SeqCst);
    }
}

impl StatusWord for SimStatusWord {
    fn on_cpu(&self) -> bool {
        self.on_cpu.load(Ordering::SeqCst)
    }

    fn barrier(&self) -> BarrierToken {
        BarrierToken(self.barrier.load(Ordering::SeqCst))
    }

    fn boosted_priority(&self) -> bool {
        self.boosted.load(Ordering::SeqCst)
    }
}

/// FIFO channel with scriptable association staleness.
#[derive(Default)]
pub struct SimChannel {
    queue: Mutex<VecDeque<Message>>,
    associations: Mutex<Vec<(Gtid, BarrierToken)>>,
    stale_budget: AtomicU32,
}

impl SimChannel {
    pub fn push(&self, msg: Message) {
        self.queue.lock().unwrap().push_back(msg);
    }

    pub fn associations(&self) -> Vec<(Gtid, BarrierToken)> {
        self.associations.lock().unwrap().clone()
    }

    /// Make the next `n` association attempts report a stale barrier.
    pub fn force_stale(&self, n: u32) {
        self.stale_budget.store(n, Ordering::SeqCst);
    }

    pub fn backlog(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

impl Channel for SimChannel {
    fn peek(&self) -> Option<Message> {
        self.queue.lock().unwrap().front().cloned()
    }

    fn consume(&self, msg: &Message) {
        let head = self.queue.lock().unwrap().pop_front();
        assert_eq!(head.as_ref(), Some(msg), "consume out of order");
    }

    fn associate_task(&self, gtid: Gtid, barrier: BarrierToken) -> bool {
        if self
            .stale_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return false;
        }
        self.associations.lock().unwrap().push((gtid, barrier));
        true
    }
}

/// Transaction handle that records everything and commits on demand.
#[derive(Default)]
pub struct SimRunRequest {
    open_txn: Mutex<Option<TxnSpec>>,
    commits: Mutex<Vec<TxnSpec>>,
    yields: Mutex<Vec<(BarrierToken, u32)>>,
    verdicts: Mutex<VecDeque<bool>>,
}

impl SimRunRequest {
    /// Make the next `n` commits fail.
    pub fn fail_next_commits(&self, n: usize) {
        self.verdicts.lock().unwrap().extend(vec![false; n]);
    }

    /// Successfully committed transactions, in order.
    pub fn commits(&self) -> Vec<TxnSpec> {
        self.commits.lock().unwrap().clone()
    }

    /// Recorded local yields as (agent_barrier, flags) pairs.
    pub fn yields(&self) -> Vec<(BarrierToken, u32)> {
        self.yields.lock().unwrap().clone()
    }
}

impl RunRequest for SimRunRequest {
    fn open(&self, spec: TxnSpec) {
        let prev = self.open_txn.lock().unwrap().replace(spec);
        assert!(prev.is_none(), "transaction opened twice without commit");
    }

    fn commit(&self) -> bool {
        let spec = self
            .open_txn
            .lock()
            .unwrap()
            .take()
            .expect("commit without open transaction");
        let ok = self.verdicts.lock().unwrap().pop_front().unwrap_or(true);
        if ok {
            self.commits.lock().unwrap().push(spec);
        }
        ok
    }

    fn local_yield(&self, agent_barrier: BarrierToken, flags: u32) {
        self.open_txn.lock().unwrap().take();
        self.yields.lock().unwrap().push((agent_barrier, flags));
    }
}

/// Agent handle with a ping counter and its own status word.
pub struct SimAgent {
    gtid: Gtid,
    status_word: Arc<SimStatusWord>,
    pings: AtomicU64,
}

impl SimAgent {
    fn new(gtid: Gtid) -> Arc<Self> {
        Arc::new(Self {
            gtid,
            status_word: Arc::new(SimStatusWord::default()),
            pings: AtomicU64::new(0),
        })
    }

    pub fn pings(&self) -> u64 {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn status_word(&self) -> Arc<SimStatusWord> {
        self.status_word.clone()
    }
}

impl CpuAgent for SimAgent {
    fn gtid(&self) -> Gtid {
        self.gtid
    }

    fn barrier(&self) -> BarrierToken {
        self.status_word.barrier()
    }

    fn ping(&self) {
        self.pings.fetch_add(1, Ordering::SeqCst);
    }
}

/// Gtid namespace for the per-CPU agents, clear of any test task ids.
const AGENT_GTID_BASE: u64 = 1_000_000;

/// The whole fake host: per-CPU channels, agents and run requests, plus
/// the task status-word registry.
pub struct SimEnclave {
    channels: Mutex<HashMap<CpuId, Arc<SimChannel>>>,
    agents: HashMap<CpuId, Arc<SimAgent>>,
    run_requests: HashMap<CpuId, Arc<SimRunRequest>>,
    status_words: Mutex<HashMap<Gtid, Arc<SimStatusWord>>>,
    ticks_enabled: AtomicBool,
    next_seqnum: AtomicU64,
}

impl SimEnclave {
    pub fn new(cpus: &[CpuId]) -> Arc<Self> {
        let agents = cpus
            .iter()
            .map(|&c| (c, SimAgent::new(Gtid(AGENT_GTID_BASE + c.0 as u64))))
            .collect();
        let run_requests = cpus
            .iter()
            .map(|&c| (c, Arc::new(SimRunRequest::default())))
            .collect();
        Arc::new(Self {
            channels: Mutex::new(HashMap::new()),
            agents,
            run_requests,
            status_words: Mutex::new(HashMap::new()),
            ticks_enabled: AtomicBool::new(false),
            next_seqnum: AtomicU64::new(1),
        })
    }

    /// Append a kernel message to `cpu`'s channel, stamping the next
    /// barrier token. Returns the stamped token.
    pub fn post(&self, cpu: CpuId, payload: Payload) -> BarrierToken {
        let seqnum = BarrierToken(self.next_seqnum.fetch_add(1, Ordering::SeqCst));
        self.channel(cpu).push(Message { seqnum, payload });
        seqnum
    }

    pub fn channel(&self, cpu: CpuId) -> Arc<SimChannel> {
        self.channels.lock().unwrap()[&cpu].clone()
    }

    pub fn sim_agent(&self, cpu: CpuId) -> Arc<SimAgent> {
        self.agents[&cpu].clone()
    }

    pub fn sim_run_request(&self, cpu: CpuId) -> Arc<SimRunRequest> {
        self.run_requests[&cpu].clone()
    }

    /// The agent-side status word handed to `Scheduler::schedule`.
    pub fn agent_sw(&self, cpu: CpuId) -> Arc<SimStatusWord> {
        self.agents[&cpu].status_word()
    }

    /// The kernel-shared record for one task, created on first use.
    pub fn task_sw(&self, gtid: Gtid) -> Arc<SimStatusWord> {
        self.status_words
            .lock()
            .unwrap()
            .entry(gtid)
            .or_default()
            .clone()
    }

    pub fn ticks_enabled(&self) -> bool {
        self.ticks_enabled.load(Ordering::SeqCst)
    }
}

impl Enclave for SimEnclave {
    fn make_channel(&self, _cap: usize, _node: u32, cpus: &[CpuId]) -> Arc<dyn Channel> {
        assert_eq!(cpus.len(), 1, "sim channels bind exactly one cpu");
        let channel = Arc::new(SimChannel::default());
        let prev = self
            .channels
            .lock()
            .unwrap()
            .insert(cpus[0], channel.clone());
        assert!(prev.is_none(), "channel for cpu {} already exists", cpus[0]);
        channel
    }

    fn agent(&self, cpu: CpuId) -> Arc<dyn CpuAgent> {
        self.sim_agent(cpu)
    }

    fn run_request(&self, cpu: CpuId) -> Arc<dyn RunRequest> {
        self.sim_run_request(cpu)
    }

    fn set_deliver_ticks(&self, enabled: bool) {
        self.ticks_enabled.store(enabled, Ordering::SeqCst);
    }

    fn task_status_word(&self, gtid: Gtid) -> Arc<dyn StatusWord> {
        self.task_sw(gtid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_is_fifo_and_peek_does_not_consume() {
        let ch = SimChannel::default();
        let m1 = Message {
            seqnum: BarrierToken(1),
            payload: Payload::TaskDead { gtid: Gtid(1) },
        };
        let m2 = Message {
            seqnum: BarrierToken(2),
            payload: Payload::TaskDead { gtid: Gtid(2) },
        };
        ch.push(m1.clone());
        ch.push(m2.clone());

        assert_eq!(ch.peek(), Some(m1.clone()));
        assert_eq!(ch.peek(), Some(m1.clone()));
        ch.consume(&m1);
        assert_eq!(ch.peek(), Some(m2.clone()));
        ch.consume(&m2);
        assert!(ch.peek().is_none());
    }

    #[test]
    fn association_staleness_is_bounded() {
        let ch = SimChannel::default();
        ch.force_stale(2);
        assert!(!ch.associate_task(Gtid(1), BarrierToken(1)));
        assert!(!ch.associate_task(Gtid(1), BarrierToken(1)));
        assert!(ch.associate_task(Gtid(1), BarrierToken(1)));
        assert_eq!(ch.associations(), vec![(Gtid(1), BarrierToken(1))]);
    }

    #[test]
    fn commit_verdicts_drain_then_default_to_success() {
        let req = SimRunRequest::default();
        let spec = TxnSpec {
            target: Gtid(1),
            target_barrier: BarrierToken(1),
            agent_barrier: BarrierToken(0),
            commit_flags: 0,
        };
        req.fail_next_commits(1);

        req.open(spec);
        assert!(!req.commit());
        req.open(spec);
        assert!(req.commit());
        assert_eq!(req.commits(), vec![spec]);
    }
}
