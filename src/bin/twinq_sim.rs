//! twinq-sim: drive the scheduling core against the in-memory enclave.
//!
//! Admits a batch of CPU-bound tasks, then runs tick-driven rounds so the
//! slice accountant forces rotations through the active/expired arrays.
//! Prints the per-CPU state and the scheduler counters at the end.

use anyhow::Result;
use clap::Parser;
use log::info;

use twinq::sim::{SimClock, SimEnclave};
use twinq::{CpuId, Gtid, Payload, Scheduler, DUMP_ALL_TASKS};

#[derive(Debug, Parser)]
struct Opts {
    /// Number of simulated CPUs.
    #[clap(short, long, default_value_t = 2)]
    cpus: u32,

    /// Number of CPU-bound tasks admitted at startup.
    #[clap(short, long, default_value_t = 8)]
    tasks: u64,

    /// Scheduling rounds to run.
    #[clap(short, long, default_value_t = 200)]
    rounds: u64,

    /// Simulated microseconds between rounds (tick spacing).
    #[clap(long, default_value_t = 1000)]
    tick_us: u64,

    /// Enable verbose output.
    #[clap(short, long, action = clap::ArgAction::SetTrue)]
    verbose: bool,
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let loglevel = if opts.verbose {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Info
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        loglevel,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let cpus: Vec<CpuId> = (0..opts.cpus).map(CpuId).collect();
    let enclave = SimEnclave::new(&cpus);
    let clock = SimClock::new();
    let sched = Scheduler::new(enclave.clone(), cpus.clone(), clock.clone())?;
    sched.enclave_ready();

    // Admission traffic arrives on the default channel.
    for id in 1..=opts.tasks {
        enclave.post(
            cpus[0],
            Payload::TaskNew {
                gtid: Gtid(id),
                runnable: true,
            },
        );
    }

    for _ in 0..opts.rounds {
        clock.advance(opts.tick_us * 1_000);
        for &cpu in &cpus {
            enclave.post(cpu, Payload::CpuTick { cpu });
            sched.schedule(cpu, &*enclave.agent_sw(cpu));
        }
    }

    for &cpu in &cpus {
        sched.dump_state(cpu, if cpu == cpus[0] { DUMP_ALL_TASKS } else { 0 });
    }

    let metrics = sched.metrics();
    info!("dispatches:       {}", metrics.nr_dispatches);
    info!("commit failures:  {}", metrics.nr_commit_failures);
    info!("local yields:     {}", metrics.nr_local_yields);
    info!("pings:            {}", metrics.nr_pings);
    info!("ticks:            {}", metrics.nr_ticks);
    info!("tick preemptions: {}", metrics.nr_tick_preemptions);
    info!("spin fallbacks:   {}", metrics.nr_spin_fallbacks);

    Ok(())
}
