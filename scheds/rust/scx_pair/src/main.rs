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
use scx_core::host_nr_cpus;
use scx_core::SchedHandle;
use scx_core::ScxConfig;
use scx_core::ScxLink;
use scx_core::SimClock;
use scx_core::UserExitInfo;
use scx_core::WorkloadRunner;
use scx_core::SCX_EXIT_DUMP_DFL_LEN;
use scx_pair::PairOps;

/// scx_pair: A demo sched_ext core-scheduler
///
/// Every CPU is paired with another CPU `stride` away and each pair only
/// executes tasks of one cgroup at a time.
#[derive(Debug, Parser)]
struct Opts {
    /// Distance between the two CPUs of a pair. Defaults to half the number
    /// of CPUs.
    #[clap(short = 'S', long)]
    stride: Option<u32>,

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

    /// If specified, only tasks which have their scheduling policy set to
    /// SCHED_EXT are switched. Otherwise, all tasks are switched.
    #[clap(short = 'p', long, action = clap::ArgAction::SetTrue)]
    partial: bool,

    /// Exit debug dump buffer length. 0 indicates default.
    #[clap(long, default_value = "0")]
    exit_dump_len: u32,

    /// Enable verbose output. Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

struct Scheduler {
    ops: Arc<PairOps>,
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
        let stride = opts.stride.unwrap_or(nr_cpus / 2);
        let cfg = ScxConfig {
            nr_cpus,
            switch_partial: opts.partial,
            exit_dump_len: match opts.exit_dump_len {
                0 => SCX_EXIT_DUMP_DFL_LEN,
                len => len as usize,
            },
            ..Default::default()
        };

        let ops = Arc::new(PairOps::new(nr_cpus, stride)?);
        let pairs: Vec<String> = ops
            .pairs()
            .pairs()
            .iter()
            .map(|(a, b)| format!("[{}, {}]", a, b))
            .collect();
        info!("Pairs: {}", pairs.join(" "));

        let clock = Arc::new(SimClock::new(0));
        let handle = SchedHandle::open_and_load(ops.clone(), &cfg, clock.clone())?;
        let link = handle.attach()?;
        info!("Pair Scheduler Attached (stride {})", stride);

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
                "total:{} dispatch:{} missing:{}",
                stats.total, stats.dispatched, stats.missing
            );
            info!("kicks:{} preemptions:{}", stats.kicks, stats.preemptions);
            info!(
                "exp:{} exp_empty:{} exp_drain:{}",
                stats.exp, stats.exp_empty, stats.exp_drain
            );
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
