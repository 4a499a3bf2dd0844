//! The scheduling core: message dispatch, the per-CPU scheduling loop,
//! round-robin admission, and tick-driven slice accounting.
//!
//! One agent thread per managed CPU calls [`Scheduler::schedule`] in a
//! loop. Each pass drains the CPU's message channel in order, honors any
//! pending tick preemption, picks the next task from the two-array
//! runqueue, and commits a dispatch transaction through the enclave's
//! run-request primitive. Commit failures are retryable: the candidate is
//! requeued with a priority boost so the next pass picks it right back up.
//!
//! Lock hierarchy, outermost first: runqueue, current slot, task record.
//! No path acquires them in any other order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use log::{debug, info, trace};

use crate::alloc::TaskAllocator;
use crate::clock::Clock;
use crate::cpu::CpuState;
use crate::enclave::{Enclave, StatusWord, TxnSpec, COMMIT_AT_TXN_COMMIT, YIELD_RETURN_ON_IDLE};
use crate::msg::{Message, Payload};
use crate::stats::{Metrics, Stats};
use crate::task::{Task, TaskRef, TaskState};
use crate::types::{BarrierToken, CpuId, Gtid, CHANNEL_CAP, ONCPU_SPIN_LIMIT};

pub const SCHEDULER_NAME: &str = "twinq";

/// `dump_state` flag: also dump the all-task table.
pub const DUMP_ALL_TASKS: u32 = 1 << 0;
/// `dump_state` flag: print CPUs with nothing queued and nothing running.
pub const DUMP_EMPTY_RQ: u32 = 1 << 1;

/// Round-robin admission cursor. Owned by the scheduler but only ever
/// advanced from the agent bound to the default channel; the mutex makes
/// that discipline safe rather than merely documented.
struct Admitter {
    cpus: Vec<CpuId>,
    next: usize,
}

impl Admitter {
    fn new(cpus: Vec<CpuId>) -> Self {
        Self { cpus, next: 0 }
    }

    fn assign(&mut self) -> CpuId {
        let cpu = self.cpus[self.next];
        self.next = (self.next + 1) % self.cpus.len();
        cpu
    }
}

pub struct Scheduler {
    enclave: Arc<dyn Enclave>,
    clock: Arc<dyn Clock>,
    cpus: Vec<CpuId>,
    cpu_states: HashMap<CpuId, CpuState>,
    allocator: TaskAllocator,
    admitter: Mutex<Admitter>,
    stats: Stats,
}

impl Scheduler {
    /// Build the per-CPU state and bind one kernel channel per managed
    /// CPU. The first CPU's channel is the default channel: admission
    /// traffic (new tasks, wakeups of unassigned tasks) arrives there.
    pub fn new(enclave: Arc<dyn Enclave>, cpus: Vec<CpuId>, clock: Arc<dyn Clock>) -> Result<Self> {
        if cpus.is_empty() {
            bail!("no CPUs to manage");
        }
        let mut cpu_states = HashMap::new();
        for &cpu in &cpus {
            let channel = enclave.make_channel(CHANNEL_CAP, 0, &[cpu]);
            if cpu_states.insert(cpu, CpuState::new(cpu, channel)).is_some() {
                bail!("cpu {cpu} listed twice");
            }
        }
        info!("{} managing {} cpus", SCHEDULER_NAME, cpus.len());
        Ok(Self {
            enclave,
            clock,
            admitter: Mutex::new(Admitter::new(cpus.clone())),
            cpus,
            cpu_states,
            allocator: TaskAllocator::new(),
            stats: Stats::default(),
        })
    }

    /// One-time association of every agent with its CPU's channel, retried
    /// while the agent barrier is stale. Tick delivery is enabled only
    /// after the last association lands: until then the default-channel
    /// agent could see ticks for CPUs whose channels are still unbound.
    pub fn enclave_ready(&self) {
        for &cpu in &self.cpus {
            let cs = self.cpu_state(cpu);
            let agent = self.enclave.agent(cpu);
            while !cs.channel.associate_task(agent.gtid(), agent.barrier()) {
                trace!("cpu {cpu}: agent association stale, retrying");
            }
        }
        self.enclave.set_deliver_ticks(true);
        info!("{} enclave ready", SCHEDULER_NAME);
    }

    /// One agent pass: drain the CPU's channel, then pick and commit.
    pub fn schedule(&self, cpu: CpuId, agent_sw: &dyn StatusWord) {
        let agent_barrier = agent_sw.barrier();
        let cs = self.cpu_state(cpu);

        while let Some(msg) = cs.channel.peek() {
            trace!("cpu {cpu}: {:?}", msg.payload);
            self.dispatch(&msg);
            cs.channel.consume(&msg);
        }

        self.schedule_cpu(cpu, agent_barrier, agent_sw.boosted_priority());
    }

    /// Whether this CPU has nothing running and nothing queued. The agent
    /// harness polls this during teardown.
    pub fn is_empty(&self, cpu: CpuId) -> bool {
        let cs = self.cpu_state(cpu);
        cs.current().is_none() && cs.rq.is_empty()
    }

    pub fn metrics(&self) -> Metrics {
        self.stats.snapshot()
    }

    pub fn current_gtid(&self, cpu: CpuId) -> Option<Gtid> {
        self.cpu_state(cpu)
            .current()
            .map(|t| t.lock().unwrap().gtid)
    }

    /// Front-to-back (active, expired) gtid listing for one CPU.
    pub fn queued_gtids(&self, cpu: CpuId) -> (Vec<Gtid>, Vec<Gtid>) {
        self.cpu_state(cpu).rq.queued_gtids()
    }

    pub fn allocator(&self) -> &TaskAllocator {
        &self.allocator
    }

    pub fn dump_state(&self, cpu: CpuId, flags: u32) {
        if flags & DUMP_ALL_TASKS != 0 {
            self.dump_all_tasks();
        }
        let cs = self.cpu_state(cpu);
        let (active, expired) = cs.rq.lens();
        let current = self.current_gtid(cpu);
        if flags & DUMP_EMPTY_RQ == 0 && current.is_none() && active + expired == 0 {
            return;
        }
        let current = current.map_or_else(|| "none".to_string(), |g| g.to_string());
        eprintln!("SchedState[{cpu}]: {current} active={active} expired={expired}");
    }

    pub fn dump_all_tasks(&self) {
        eprintln!("{:<12}{:<10}{:<6}flags", "task", "state", "cpu");
        self.allocator.for_each(|t| {
            let cpu = t.cpu.map_or_else(|| "-".to_string(), |c| c.to_string());
            eprintln!(
                "{:<12}{:<10}{:<6}{}{}",
                t.gtid.to_string(),
                t.state.to_string(),
                cpu,
                if t.preempted { 'P' } else { '-' },
                if t.prio_boost { 'B' } else { '-' },
            );
        });
    }

    fn cpu_state(&self, cpu: CpuId) -> &CpuState {
        self.cpu_states
            .get(&cpu)
            .unwrap_or_else(|| panic!("cpu {cpu} is not managed"))
    }

    fn task(&self, gtid: Gtid) -> TaskRef {
        self.allocator
            .get(gtid)
            .unwrap_or_else(|| panic!("message for unknown task {gtid}"))
    }

    fn dispatch(&self, msg: &Message) {
        let seqnum = msg.seqnum;
        // Every task-scoped message advances its task's barrier. TaskNew
        // records the token at creation instead.
        if let Some(gtid) = msg.gtid() {
            if !matches!(msg.payload, Payload::TaskNew { .. }) {
                self.task(gtid).lock().unwrap().seqnum = seqnum;
            }
        }
        match msg.payload {
            Payload::TaskNew { gtid, runnable } => self.task_new(gtid, runnable, seqnum),
            Payload::TaskWakeup { gtid, deferrable } => self.task_wakeup(gtid, deferrable, seqnum),
            Payload::TaskBlocked { gtid, switchto_cpu } => self.task_blocked(gtid, switchto_cpu),
            Payload::TaskYield { gtid, switchto_cpu } => self.task_yield(gtid, switchto_cpu),
            Payload::TaskPreempt { gtid, switchto_cpu } => self.task_preempt(gtid, switchto_cpu),
            Payload::TaskDeparted { gtid, switchto_cpu } => self.task_departed(gtid, switchto_cpu),
            Payload::TaskDead { gtid } => self.task_dead(gtid),
            Payload::TaskSwitchto { gtid } => self.task_switchto(gtid),
            Payload::CpuTick { cpu } => self.cpu_tick(cpu),
        }
    }

    fn task_new(&self, gtid: Gtid, runnable: bool, seqnum: BarrierToken) {
        let status_word = self.enclave.task_status_word(gtid);
        let task = self.allocator.insert(Task::new(gtid, seqnum, status_word));
        if runnable {
            task.lock().unwrap().state = TaskState::Runnable;
            let cpu = self.assign_cpu();
            self.migrate(&task, cpu, seqnum);
        }
        // A non-runnable task stays Blocked and unassigned until its
        // wakeup shows up on the default channel.
    }

    fn task_wakeup(&self, gtid: Gtid, deferrable: bool, seqnum: BarrierToken) {
        let task = self.task(gtid);
        let cpu = {
            let mut t = task.lock().unwrap();
            assert!(t.blocked(), "wakeup of {} in state {}", t.gtid, t.state);
            t.state = TaskState::Runnable;
            // A non-deferrable waker may be waiting on resources this task
            // holds; give it the same queue preference as a preempted task.
            t.prio_boost = !deferrable;
            t.cpu
        };
        match cpu {
            None => {
                let cpu = self.assign_cpu();
                self.migrate(&task, cpu, seqnum);
            }
            Some(cpu) => self.cpu_state(cpu).rq.enqueue(&task),
        }
    }

    fn task_blocked(&self, gtid: Gtid, switchto_cpu: Option<CpuId>) {
        let task = self.task(gtid);
        let (state, cpu) = {
            let t = task.lock().unwrap();
            (t.state, t.cpu)
        };
        if state == TaskState::Queued {
            // The agent already preempted this task itself; the block
            // message arrived behind that. Pull it out of the queue.
            let cpu = cpu.unwrap_or_else(|| panic!("queued task {gtid} has no cpu"));
            self.cpu_state(cpu).rq.erase(&task);
            task.lock().unwrap().state = TaskState::Blocked;
        } else {
            self.off_cpu(&task, true, switchto_cpu.is_some());
        }
        self.ping_switchto(switchto_cpu);
    }

    fn task_yield(&self, gtid: Gtid, switchto_cpu: Option<CpuId>) {
        let task = self.task(gtid);
        self.off_cpu(&task, false, switchto_cpu.is_some());
        let cpu = task.lock().unwrap().cpu.expect("yield of unassigned task");
        self.cpu_state(cpu).rq.enqueue(&task);
        self.ping_switchto(switchto_cpu);
    }

    fn task_preempt(&self, gtid: Gtid, switchto_cpu: Option<CpuId>) {
        let task = self.task(gtid);
        let (state, cpu) = {
            let t = task.lock().unwrap();
            (t.state, t.cpu)
        };
        if state == TaskState::Queued {
            // Already waiting in the queue; the preempt only upgrades its
            // placement.
            let cpu = cpu.unwrap_or_else(|| panic!("queued task {gtid} has no cpu"));
            self.cpu_state(cpu).rq.erase(&task);
        } else {
            self.off_cpu(&task, false, switchto_cpu.is_some());
        }
        {
            let mut t = task.lock().unwrap();
            t.preempted = true;
            t.prio_boost = true;
        }
        let cpu = task
            .lock()
            .unwrap()
            .cpu
            .expect("preempt of unassigned task");
        self.cpu_state(cpu).rq.enqueue(&task);
        self.ping_switchto(switchto_cpu);
    }

    fn task_departed(&self, gtid: Gtid, switchto_cpu: Option<CpuId>) {
        let task = self.task(gtid);
        let (state, cpu) = {
            let t = task.lock().unwrap();
            (t.state, t.cpu)
        };
        if state == TaskState::OnCpu || switchto_cpu.is_some() {
            self.off_cpu(&task, false, switchto_cpu.is_some());
        } else if state == TaskState::Queued {
            let cpu = cpu.unwrap_or_else(|| panic!("queued task {gtid} has no cpu"));
            self.cpu_state(cpu).rq.erase(&task);
        } else {
            assert_eq!(state, TaskState::Blocked, "departed {gtid} in state {state}");
        }
        self.ping_switchto(switchto_cpu);
        debug!("{gtid} departed");
        self.allocator.free(gtid);
    }

    fn task_dead(&self, gtid: Gtid) {
        let task = self.task(gtid);
        {
            let t = task.lock().unwrap();
            assert!(t.blocked(), "dead message for {} in state {}", gtid, t.state);
        }
        self.allocator.free(gtid);
    }

    /// The kernel chained this task into a switch-to; it is off the CPU
    /// from the agent's perspective. Annotation only: the follow-up wakeup
    /// or preempt message re-queues it.
    fn task_switchto(&self, gtid: Gtid) {
        let task = self.task(gtid);
        self.off_cpu(&task, true, false);
    }

    /// Tick accountant. Runs under the runqueue lock to serialize with
    /// admission-side enqueues; the actual preemption happens at the top
    /// of the next scheduling pass.
    fn cpu_tick(&self, cpu: CpuId) {
        let cs = self.cpu_state(cpu);
        let now = self.clock.now_ns();
        cs.rq.locked(|| {
            if let Some(current) = cs.current() {
                let mut t = current.lock().unwrap();
                if t.charge_tick(now) {
                    cs.flag_preempt();
                    Stats::bump(&self.stats.nr_tick_preemptions);
                    debug!("cpu {cpu}: slice expired for {}", t.gtid);
                }
            }
        });
        Stats::bump(&self.stats.nr_ticks);
    }

    fn assign_cpu(&self) -> CpuId {
        self.admitter.lock().unwrap().assign()
    }

    /// Initial placement onto the assigned CPU. Association must precede
    /// runqueue visibility: a task that can already be picked while still
    /// producing into the old channel would race its own messages.
    fn migrate(&self, task: &TaskRef, cpu: CpuId, seqnum: BarrierToken) {
        let gtid = {
            let t = task.lock().unwrap();
            assert_eq!(t.state, TaskState::Runnable);
            assert!(t.cpu.is_none(), "migrate of already-assigned {}", t.gtid);
            t.gtid
        };
        let cs = self.cpu_state(cpu);
        assert!(
            cs.channel.associate_task(gtid, seqnum),
            "stale barrier associating {gtid} at admission"
        );
        task.lock().unwrap().cpu = Some(cpu);
        cs.rq.enqueue(task);
        debug!("{gtid} admitted to cpu {cpu}");
        self.enclave.agent(cpu).ping();
        Stats::bump(&self.stats.nr_pings);
    }

    fn ping_switchto(&self, switchto_cpu: Option<CpuId>) {
        if let Some(cpu) = switchto_cpu {
            self.enclave.agent(cpu).ping();
            Stats::bump(&self.stats.nr_pings);
        }
    }

    /// Take `task` off its CPU: charge the elapsed runtime against its
    /// slice, release the current slot, and land it in the destination
    /// state. The charge is always applied to the departing task itself;
    /// the current slot is cleared only when the task actually holds it.
    /// A task coming off a kernel switch-to chain never does.
    fn off_cpu(&self, task: &TaskRef, blocked: bool, from_switchto: bool) {
        let now = self.clock.now_ns();
        let (gtid, state, cpu) = {
            let t = task.lock().unwrap();
            (t.gtid, t.state, t.cpu)
        };
        let cpu = cpu.unwrap_or_else(|| panic!("off-cpu of unassigned task {gtid}"));
        let cs = self.cpu_state(cpu);
        match state {
            TaskState::OnCpu => {
                assert!(
                    cs.clear_current_if(task),
                    "{gtid} marked oncpu but is not cpu {cpu}'s current"
                );
            }
            TaskState::Blocked => {
                assert!(from_switchto, "off-cpu of blocked task {gtid}");
            }
            other => panic!("off-cpu of {gtid} in state {other}"),
        }
        let mut t = task.lock().unwrap();
        t.charge_off_cpu(now);
        t.state = if blocked {
            TaskState::Blocked
        } else {
            TaskState::Runnable
        };
    }

    /// Place `task` as the CPU's current. Stamps the pick time and
    /// consumes the preempted/boost flags.
    fn on_cpu(&self, task: &TaskRef, cpu: CpuId) {
        let now = self.clock.now_ns();
        let gtid = {
            let mut t = task.lock().unwrap();
            t.state = TaskState::OnCpu;
            t.cpu = Some(cpu);
            t.stamp_pick(now);
            t.preempted = false;
            t.prio_boost = false;
            t.gtid
        };
        self.cpu_state(cpu).set_current(task.clone());
        debug!("{gtid} on cpu {cpu}");
    }

    /// Put a failed or stuck candidate back at the head of the line so the
    /// next pass retries it promptly.
    fn requeue_with_boost(&self, cs: &CpuState, task: &TaskRef) {
        if cs.is_current(task) {
            self.off_cpu(task, false, false);
        }
        task.lock().unwrap().prio_boost = true;
        cs.rq.enqueue(task);
    }

    /// Selection and commit for one CPU, after the channel is drained.
    fn schedule_cpu(&self, cpu: CpuId, agent_barrier: BarrierToken, prio_boost: bool) {
        let cs = self.cpu_state(cpu);

        if cs.take_preempt() {
            if let Some(prev) = cs.current() {
                debug!("cpu {cpu}: preempting current");
                self.off_cpu(&prev, false, false);
                cs.rq.enqueue(&prev);
            }
        }

        // A boosted agent means a higher-priority sched class wants the
        // CPU; pick nothing and yield below.
        let next = if prio_boost {
            None
        } else {
            cs.current().or_else(|| cs.rq.dequeue())
        };

        let req = self.enclave.run_request(cpu);
        let Some(next) = next else {
            let mut flags = 0;
            if prio_boost && (cs.current().is_some() || !cs.rq.is_empty()) {
                flags |= YIELD_RETURN_ON_IDLE;
            }
            req.local_yield(agent_barrier, flags);
            Stats::bump(&self.stats.nr_local_yields);
            return;
        };

        let (gtid, target_barrier, status_word) = {
            let t = next.lock().unwrap();
            (t.gtid, t.seqnum, t.status_word.clone())
        };

        // A switch-to target can still be running on another CPU behind
        // the agent's back; committing would fail against its barrier.
        // Wait it out briefly, and if the kernel state does not clear,
        // requeue with a boost instead of spinning forever.
        let mut spins = 0;
        while status_word.on_cpu() {
            spins += 1;
            if spins >= ONCPU_SPIN_LIMIT {
                debug!("cpu {cpu}: {gtid} still on a remote cpu, requeueing");
                Stats::bump(&self.stats.nr_spin_fallbacks);
                self.requeue_with_boost(cs, &next);
                return;
            }
            std::hint::spin_loop();
        }

        req.open(TxnSpec {
            target: gtid,
            target_barrier,
            agent_barrier,
            commit_flags: COMMIT_AT_TXN_COMMIT,
        });

        if req.commit() {
            self.on_cpu(&next, cpu);
            Stats::bump(&self.stats.nr_dispatches);
        } else {
            debug!("cpu {cpu}: commit failed for {gtid}");
            Stats::bump(&self.stats.nr_commit_failures);
            self.requeue_with_boost(cs, &next);
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        info!("{} scheduler shut down", SCHEDULER_NAME);
    }
}
