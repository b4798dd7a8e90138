// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::fs;
use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use log::debug;
use log::info;
use scx_core::host_nr_cpus;
use scx_core::SchedHandle;
use scx_core::ScxConfig;
use scx_core::ScxLink;
use scx_core::SimClock;
use scx_core::UserExitInfo;
use scx_core::WorkloadRunner;
use scx_core::SCX_EXIT_DUMP_DFL_LEN;
use scx_layered::alloc::LayerCpuAllocator;
use scx_layered::config::example_config;
use scx_layered::stats::LayerStats;
use scx_layered::stats::Stats;
use scx_layered::stats::SysStats;
use scx_layered::verify_layer_specs;
use scx_layered::LayerConfig;
use scx_layered::LayerSpec;
use scx_layered::LayeredOps;

/// scx_layered: A highly configurable multi-layer sched_ext scheduler
///
/// scx_layered allows classifying tasks into multiple layers and applying
/// different scheduling policies to them. The configuration is specified in
/// json and composed of two parts - matches and policies.
///
/// Matches
/// =======
///
/// Whenever a task comes under the scheduler, it goes through a series of
/// matches to determine the layer it belongs to. A match set is composed of
/// OR groups of AND blocks. An example:
///
///   "matches": [
///     [
///       {
///         "CgroupPrefix": "/system.slice"
///       }
///     ],
///     [
///       {
///         "CommPrefix": "batch"
///       },
///       {
///         "NiceAbove": 0
///       }
///     ]
///   ],
///
/// The outer array contains the OR groups and the inner AND blocks, so the
/// above matches:
///
/// - Tasks which are in the cgroup sub-hierarchy under "/system.slice".
///
/// - Or tasks whose comm starts with "batch" and have a nice value > 0.
///
/// Currently, the following matches are supported:
///
/// - CgroupPrefix: Matches the prefix of the cgroup that the task belongs
///   to. As this is a string match, whether the pattern has the trailing
///   '/' makes a difference.
///
/// - CommPrefix: Matches the task's comm prefix.
///
/// - NiceAbove, NiceBelow, NiceEquals: Match if the task's nice value is
///   greater than, smaller than or equal to the pattern.
///
/// - PIDEquals, TGIDEquals: Match the task's pid or tgid.
///
/// - IsKthread: Matches kernel worker threads if true, everything else if
///   false.
///
/// Policies
/// ========
///
/// The following is an example policy configuration for a layer.
///
///   "kind": {
///     "Confined": {
///       "cpus_range": [1, 8],
///       "util_range": [0.8, 0.9]
///     }
///   }
///
/// It's of "Confined" kind, which tries to concentrate the layer's tasks
/// into a limited number of CPUs. In the above case, the number of CPUs
/// assigned to the layer is scaled between 1 and 8 so that the per-cpu
/// utilization is kept between 80% and 90%. If the CPUs are loaded higher
/// than 90%, more CPUs are allocated to the layer. If the utilization drops
/// below 80%, the layer loses CPUs.
///
/// Currently, the following policy kinds are supported:
///
/// - Confined: Tasks are restricted to the allocated CPUs. The number of
///   CPUs allocated is modulated to keep the per-CPU utilization in
///   "util_range". The range can optionally be restricted with the
///   "cpus_range" property.
///
/// - Grouped: Similar to Confined but tasks may spill outside if there are
///   idle CPUs outside the allocated ones.
///
/// - Open: Prefer the CPUs which are not occupied by Confined or Grouped
///   layers. Tasks in this group will spill into occupied CPUs if there are
///   no unoccupied idle CPUs.
///
/// All layers take the following options:
///
/// - min_exec_us: Minimum execution time in microseconds. Whenever a task
///   is scheduled in, this is the minimum CPU time that it's charged no
///   matter how short the actual execution time may be.
///
/// - preempt: If true, tasks in the layer will preempt tasks which belong
///   to other non-preempting layers when no idle CPUs are available.
///
/// - exclusive: If true, tasks in the layer will occupy the whole core.
///   Simulated CPUs have no SMT siblings, so this is only reported.
///
/// - slice_us: Scheduling slice duration in microseconds. 0 uses
///   --slice-us.
///
/// Configuration example and running scx_layered
/// =============================================
///
/// Running the following will write an example configuration into
/// example.json.
///
///   $ scx_layered -e example.json
///
/// Note that the last layer in the configuration must have an empty match set
/// as a catch-all for tasks which haven't been matched into previous layers.
///
/// By default, an argument to scx_layered is interpreted as a JSON string. If
/// the argument is a pointer to a JSON file, it should be prefixed with file:
/// or f: as follows:
///
///   $ scx_layered f:example.json
///
/// Statistics
/// ==========
///
/// Every --monitor interval the following is logged:
///
///   tot=   5912 local=86.20 open_idle= 0.21 affn_viol= 1.37 proc=0ms
///   busy= 34.2 util=  173.6 load=    412.1 fallback_cpu=  1 task_err=0
///     batch    : util/frac=   11.8/  6.7 load/frac=     29.7:  7.2 tasks=    17
///                tot=    348 local=67.80 wake/exp/reenq=20.11/12.09/ 0.00
///                open_idle= 0.00 affn_viol= 0.00 preempt/fail= 0.00/ 0.00 min_exec= 3.16
///                cpus=  2 [  2,  2] 00000003
///
/// - tot: Total scheduling events in the period.
///
/// - local: % that got scheduled directly into an idle CPU.
///
/// - open_idle: % of open layer tasks scheduled into idle CPUs occupied by
///   other layers.
///
/// - affn_viol: % which violated configured policies due to CPU affinity
///   restrictions.
///
/// - preempt/fail: % of enqueues that preempted another CPU or found none
///   to preempt.
///
/// - cpus: CUR_NR_CPUS [MIN_NR_CPUS, MAX_NR_CPUS] CUR_CPU_MASK
#[derive(Debug, Parser)]
#[command(verbatim_doc_comment)]
struct Opts {
    /// Scheduling slice duration in microseconds.
    #[clap(short = 's', long, default_value = "20000")]
    slice_us: u64,

    /// Scheduling interval in seconds.
    #[clap(short = 'i', long, default_value = "0.1")]
    interval: f64,

    /// Statistics reporting interval in seconds.
    #[clap(short = 'm', long, default_value = "2.0")]
    monitor: f64,

    /// Disable load-fraction based max layer CPU limit. Layers may take more
    /// CPUs than their share of the total load.
    #[clap(short = 'n', long)]
    no_load_frac_limit: bool,

    /// Report statistics as JSON lines.
    #[clap(short = 'j', long)]
    json: bool,

    /// If specified, only tasks which have their scheduling policy set to
    /// SCHED_EXT are switched. Otherwise, all tasks are switched.
    #[clap(short = 'p', long)]
    partial: bool,

    /// Number of simulated CPUs. 0 uses the number of possible CPUs of the
    /// host.
    #[clap(long, default_value = "0")]
    nr_cpus: u32,

    /// Number of tasks in the generated workload.
    #[clap(long, default_value = "64")]
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

    /// Write example layer specifications into the file and exit.
    #[clap(short = 'e', long)]
    example: Option<String>,

    /// Run with the example layer specifications (useful for e.g. CI pipelines)
    #[clap(long)]
    run_example: bool,

    /// Layer specification. See --help.
    specs: Vec<String>,
}

struct Scheduler {
    ops: Arc<LayeredOps>,
    handle: SchedHandle,
    link: Option<ScxLink>,
    workload: WorkloadRunner,

    cpu_alloc: LayerCpuAllocator,
    sched_stats: Stats,
    report_stats: Stats,

    sched_intv: Duration,
    monitor_intv: Duration,
    json: bool,

    processing_dur: Duration,
}

impl Scheduler {
    fn init(opts: &Opts, layer_specs: &[LayerSpec]) -> Result<Self> {
        let nr_cpus = match opts.nr_cpus {
            0 => host_nr_cpus()?,
            nr => nr,
        };

        if opts.interval <= 0.0 || opts.monitor <= 0.0 {
            bail!("Intervals must be positive");
        }

        let ops = Arc::new(LayeredOps::new(
            nr_cpus as usize,
            layer_specs,
            opts.slice_us * 1000,
        )?);
        let cpu_alloc =
            LayerCpuAllocator::new(layer_specs, nr_cpus as usize, opts.no_load_frac_limit)?;

        let cfg = ScxConfig {
            nr_cpus,
            switch_partial: opts.partial,
            exit_dump_len: match opts.exit_dump_len {
                0 => SCX_EXIT_DUMP_DFL_LEN,
                len => len as usize,
            },
            ..Default::default()
        };
        let clock = Arc::new(SimClock::new(0));
        let handle = SchedHandle::open_and_load(ops.clone(), &cfg, clock.clone())?;
        let link = handle.attach()?;
        info!("Layered Scheduler Attached");

        let workload = WorkloadRunner::start(&handle, clock, opts.nr_tasks, opts.seed)?;

        let sched_stats = Stats::new(handle.session(), &ops);
        let report_stats = sched_stats.clone();

        Ok(Self {
            ops,
            handle,
            link: Some(link),
            workload,

            cpu_alloc,
            sched_stats,
            report_stats,

            sched_intv: Duration::from_secs_f64(opts.interval),
            monitor_intv: Duration::from_secs_f64(opts.monitor),
            json: opts.json,

            processing_dur: Duration::ZERO,
        })
    }

    fn step(&mut self) -> Result<()> {
        let started_at = Instant::now();
        self.sched_stats
            .refresh(self.handle.session(), &self.ops, self.processing_dur)?;
        self.cpu_alloc
            .refresh_cpumasks(&self.sched_stats, &self.ops)?;
        self.processing_dur += started_at.elapsed();
        Ok(())
    }

    fn report(&mut self) -> Result<()> {
        let sess = self.handle.session();
        self.report_stats
            .refresh(sess, &self.ops, self.processing_dur)?;
        let stats = &self.report_stats;

        let mut sys_stats = SysStats::new(stats, sess.now(), self.cpu_alloc.fallback_cpu());
        let cpus_ranges = self.cpu_alloc.take_cpus_ranges();
        for (lidx, layer) in self.cpu_alloc.layers().iter().enumerate() {
            let layer_stats = LayerStats::new(lidx, layer, stats, cpus_ranges[lidx]);
            sys_stats.layers.insert(layer.name.clone(), layer_stats);
        }

        if self.json {
            info!("{}", serde_json::to_string(&sys_stats)?);
            return Ok(());
        }

        let mut buf = Vec::new();
        sys_stats.format_all(&mut buf)?;
        for line in String::from_utf8_lossy(&buf).lines() {
            info!("{}", line);
        }
        Ok(())
    }

    fn run(mut self, shutdown: Arc<AtomicBool>) -> Result<UserExitInfo> {
        let now = Instant::now();
        let mut next_sched_at = now + self.sched_intv;
        let mut next_monitor_at = now + self.monitor_intv;

        while !shutdown.load(Ordering::Relaxed) && !self.handle.exited() {
            let now = Instant::now();

            if now >= next_sched_at {
                self.step()?;
                next_sched_at += self.sched_intv;
                if next_sched_at < now {
                    next_sched_at = now + self.sched_intv;
                }
            }

            if now >= next_monitor_at {
                self.report()?;
                next_monitor_at += self.monitor_intv;
                if next_monitor_at < now {
                    next_monitor_at = now + self.monitor_intv;
                }
            }

            std::thread::sleep(
                next_sched_at
                    .min(next_monitor_at)
                    .saturating_duration_since(Instant::now()),
            );
        }

        self.link.take();
        self.workload.stop()?;

        let uei = self.handle.exit_info();
        uei.report()?;
        Ok(uei)
    }
}

fn write_example_file(path: &str) -> Result<()> {
    let mut f = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .with_context(|| format!("Failed to create {:?}", path))?;
    Ok(f.write_all(serde_json::to_string_pretty(&example_config())?.as_bytes())?)
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

    debug!("opts={:?}", &opts);

    if let Some(path) = &opts.example {
        write_example_file(path)?;
        return Ok(());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    let mut layer_config = match opts.run_example {
        true => example_config(),
        false => LayerConfig { specs: vec![] },
    };

    for (idx, input) in opts.specs.iter().enumerate() {
        layer_config.specs.append(
            &mut LayerSpec::parse(input)
                .with_context(|| format!("Failed to parse specs[{}] ({:?})", idx, input))?,
        );
    }

    debug!("specs={}", serde_json::to_string_pretty(&layer_config)?);
    verify_layer_specs(&layer_config.specs)?;

    loop {
        let sched = Scheduler::init(&opts, &layer_config.specs)?;
        if !sched.run(shutdown.clone())?.should_restart() {
            break;
        }
    }

    Ok(())
}
