// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use log::info;
use scx_central::CentralConfig;
use scx_central::CentralOps;
use scx_central::CENTRAL_QUEUE_CAP_DFL;
use scx_core::host_nr_cpus;
use scx_core::CpuId;
use scx_core::SchedHandle;
use scx_core::ScxConfig;
use scx_core::ScxLink;
use scx_core::SimClock;
use scx_core::UserExitInfo;
use scx_core::WorkloadRunner;
use scx_core::SCX_EXIT_DUMP_DFL_LEN;

/// scx_central: A central FIFO sched_ext scheduler
///
/// All scheduling decisions are made on the central CPU, which hands tasks
/// to the other CPUs on request and enforces slices from a periodic timer.
#[derive(Debug, Parser)]
struct Opts {
    /// Override slice duration in microseconds.
    #[clap(short = 's', long, default_value = "20000")]
    slice_us: u64,

    /// Override the central CPU.
    #[clap(short = 'c', long, default_value = "0")]
    central_cpu: u32,

    /// Capacity of the central queue.
    #[clap(short = 'q', long, default_value_t = CENTRAL_QUEUE_CAP_DFL)]
    queue_capacity: usize,

    /// If specified, only tasks which have their scheduling policy set to
    /// SCHED_EXT are switched. Otherwise, all tasks are switched.
    #[clap(short = 'p', long, action = clap::ArgAction::SetTrue)]
    partial: bool,

    /// Number of simulated CPUs. 0 uses the number of possible CPUs of the
    /// host.
    #[clap(short = 'n', long, default_value = "0")]
    nr_cpus: u32,

    /// Number of tasks in the generated workload.
    #[clap(short = 't', long, default_value = "32")]
    nr_tasks: usize,

    /// Seed of the generated workload.
    #[clap(long, default_value = "42")]
    seed: u32,

    /// Exit debug dump buffer length. 0 indicates default.
    #[clap(long, default_value = "0")]
    exit_dump_len: u32,

    /// Enable verbose output. Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

struct Scheduler {
    ops: Arc<CentralOps>,
    handle: SchedHandle,
    link: ScxLink,
    workload: WorkloadRunner,
}

impl Scheduler {
    fn init(opts: &Opts) -> Result<Self> {
        let nr_cpus = match opts.nr_cpus {
            0 => host_nr_cpus()?,
            nr => nr,
        };
        let cfg = ScxConfig {
            nr_cpus,
            switch_partial: opts.partial,
            exit_dump_len: match opts.exit_dump_len {
                0 => SCX_EXIT_DUMP_DFL_LEN,
                len => len as usize,
            },
            ..Default::default()
        };

        let ops = Arc::new(CentralOps::new(
            nr_cpus,
            CentralConfig {
                central_cpu: CpuId(opts.central_cpu),
                slice_ns: opts.slice_us * 1000,
                queue_capacity: opts.queue_capacity,
            },
        )?);
        let clock = Arc::new(SimClock::new(0));
        let handle = SchedHandle::open_and_load(ops.clone(), &cfg, clock.clone())?;
        let link = handle.attach()?;
        info!(
            "Central Scheduler Attached (central CPU {}, {} CPUs)",
            opts.central_cpu, nr_cpus
        );

        let workload = WorkloadRunner::start(&handle, clock, opts.nr_tasks, opts.seed)?;

        Ok(Self {
            ops,
            handle,
            link,
            workload,
        })
    }

    fn run(self, shutdown: Arc<AtomicBool>) -> Result<UserExitInfo> {
        let Self {
            ops,
            handle,
            link,
            workload,
        } = self;

        let uei = handle.wait_for_exit(link, &shutdown, Duration::from_secs(1), |_| {
            let stats = ops.stats();
            info!(
                "total={} local={} queued={} lost={} overflow={}",
                stats.total, stats.local, stats.queued, stats.lost, stats.overflow
            );
            info!("started={} kicked={}", stats.started, stats.kicked);
            Ok(())
        })?;
        workload.stop()?;

        uei.report()?;
        Ok(uei)
    }
}

/// Help exits 0, any other argument error exits 1.
fn usage_exit_code(e: &clap::Error) -> i32 {
    if e.exit_code() == 0 {
        0
    } else {
        1
    }
}

fn main() -> Result<()> {
    let opts = match Opts::try_parse() {
        Ok(opts) => opts,
        Err(e) => {
            let _ = e.print();
            std::process::exit(usage_exit_code(&e));
        }
    };

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    loop {
        let sched = Scheduler::init(&opts)?;
        if !sched.run(shutdown.clone())?.should_restart() {
            break;
        }
    }
    Ok(())
}
