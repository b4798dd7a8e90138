// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use log::info;
use metrics::counter;
use metrics::gauge;
use metrics::histogram;
use metrics::Counter;
use metrics::Gauge;
use metrics::Histogram;
use metrics_exporter_prometheus::PrometheusBuilder;
use scx_core::host_nr_cpus;
use scx_core::SchedHandle;
use scx_core::ScxConfig;
use scx_core::ScxLink;
use scx_core::SimClock;
use scx_core::UserExitInfo;
use scx_core::WorkloadRunner;
use scx_core::SCX_EXIT_DUMP_DFL_LEN;
use scx_rusty::load_balance::LoadBalancer;
use scx_rusty::load_balance::NumaStat;
use scx_rusty::stats::ClusterStats;
use scx_rusty::DomainGroup;
use scx_rusty::RustyConfig;
use scx_rusty::RustyOps;
use scx_rusty::RustyStat;
use scx_rusty::RustyStats;
use scx_rusty::Tuner;

/// scx_rusty: A multi-domain sched_ext scheduler
///
/// The policy does simple vtime or round robin scheduling in each domain
/// while tracking average load of each domain and duty cycle of each task.
///
/// The user space part performs two roles. First, it makes higher frequency
/// (100ms) tuning decisions. It identifies CPUs which are not too heavily
/// loaded and marks them so that they can pull tasks from other overloaded
/// domains on the fly.
///
/// Second, it drives lower frequency (2s) load balancing. It determines
/// whether load balancing is necessary by comparing domain load averages.
/// If there are large enough load differences, it examines up to 1024
/// recently active tasks on the domain to determine which should be
/// migrated.
///
/// The policy runs on a simulated host of --nr-cpus CPUs against a generated
/// mix of interactive, batch and kernel worker tasks.
///
/// WARNING: scx_rusty currently assumes that all domains have equal
/// processing power and are at similar distances from each other.
#[derive(Debug, Parser)]
struct Opts {
    /// Scheduling slice duration for under-utilized hosts, in microseconds.
    #[clap(short = 'u', long, default_value = "20000")]
    slice_us_underutil: u64,

    /// Scheduling slice duration for over-utilized hosts, in microseconds.
    #[clap(short = 'o', long, default_value = "1000")]
    slice_us_overutil: u64,

    /// Monitoring and load balance interval in seconds.
    #[clap(short = 'i', long, default_value = "2.0")]
    interval: f64,

    /// Tuner runs at higher frequency than the load balancer to dynamically
    /// tune scheduling behavior. Tuning interval in seconds.
    #[clap(short = 'I', long, default_value = "0.1")]
    tune_interval: f64,

    /// The half-life of task and domain load running averages in seconds.
    #[clap(short = 'l', long, default_value = "1.0")]
    load_half_life: f64,

    /// Number of domains to split the CPUs into. 0 creates one domain for
    /// every 8 CPUs.
    #[clap(long, default_value = "0")]
    nr_doms: usize,

    /// Number of NUMA nodes to spread the domains over.
    #[clap(long, default_value = "1")]
    nr_nodes: usize,

    /// Instead of splitting the CPUs evenly, set the cpumask for each domain
    /// manually, provide multiple --cpumasks, one for each domain. E.g.
    /// --cpumasks 0xff_00ff --cpumasks 0xff00 will create two domains with
    /// the corresponding CPUs belonging to each domain. Each CPU must
    /// belong to at most one domain.
    #[clap(short = 'C', long, num_args = 1.., conflicts_with_all = ["nr_doms", "nr_nodes"])]
    cpumasks: Vec<String>,

    /// When non-zero, enable greedy task stealing. When a domain is idle, a cpu
    /// will attempt to steal tasks from another domain as follows:
    ///
    /// 1. Try to consume a task from the current domain
    /// 2. Try to consume a task from another domain in the current NUMA node
    ///    (or globally, if running on a single-node system), if the domain
    ///    has at least this specified number of tasks enqueued.
    ///
    /// See greedy_threshold_x_numa to enable task stealing across NUMA nodes.
    /// Tasks stolen in this manner are not permanently stolen from their
    /// domain.
    #[clap(short = 'g', long, default_value = "1")]
    greedy_threshold: u32,

    /// When non-zero, enable greedy task stealing across NUMA nodes. The order
    /// of greedy task stealing follows greedy-threshold as described above, and
    /// greedy-threshold must be nonzero to enable task stealing across NUMA
    /// nodes.
    #[clap(long, default_value = "0")]
    greedy_threshold_x_numa: u32,

    /// Disable load balancing. Unless disabled, periodically user space will
    /// calculate the load factor of each domain and instruct the policy which
    /// processes to move.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    no_load_balance: bool,

    /// Put per-cpu kthreads directly into local dsq's.
    #[clap(short = 'k', long, action = clap::ArgAction::SetTrue)]
    kthreads_local: bool,

    /// Exclude kworkers from load balancing. Greedy executions still apply.
    #[clap(short = 'b', long, action = clap::ArgAction::SetTrue)]
    balanced_kworkers: bool,

    /// Use FIFO scheduling instead of weighted vtime scheduling.
    #[clap(short = 'f', long, action = clap::ArgAction::SetTrue)]
    fifo_sched: bool,

    /// Idle CPUs with utilization lower than this will get remote tasks
    /// directly pushed on them. 0 disables, 100 enables always.
    #[clap(short = 'D', long, default_value = "90.0")]
    direct_greedy_under: f64,

    /// Idle CPUs with utilization lower than this may get kicked to
    /// accelerate stealing when a task is queued on a saturated remote
    /// domain. 0 disables, 100 enables always.
    #[clap(short = 'K', long, default_value = "100.0")]
    kick_greedy_under: f64,

    /// Whether tasks can be pushed directly to idle CPUs on NUMA nodes
    /// different than its domain's node. If direct-greedy-under is disabled,
    /// this option is a no-op. Otherwise, if this option is set to false
    /// (default), tasks will only be directly pushed to idle CPUs if they
    /// reside on the same NUMA node as the task's domain.
    #[clap(short = 'r', long, action = clap::ArgAction::SetTrue)]
    direct_greedy_numa: bool,

    /// If specified, only tasks which have their scheduling policy set to
    /// SCHED_EXT are switched. Otherwise, all tasks are switched.
    #[clap(short = 'p', long, action = clap::ArgAction::SetTrue)]
    partial: bool,

    /// Number of simulated CPUs. 0 uses the number of possible CPUs of the
    /// host.
    #[clap(short = 'n', long, default_value = "0")]
    nr_cpus: u32,

    /// Number of tasks in the generated workload.
    #[clap(short = 't', long, default_value = "64")]
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

    /// Enable the Prometheus endpoint for metrics on port 9000.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    enable_prometheus: bool,
}

struct Metrics {
    wsync: Counter,
    wsync_prev_idle: Counter,
    prev_idle: Counter,
    greedy_idle: Counter,
    pinned: Counter,
    direct_dispatch: Counter,
    direct_greedy: Counter,
    direct_greedy_far: Counter,
    dsq: Counter,
    greedy_local: Counter,
    greedy_xnuma: Counter,
    kick_greedy: Counter,
    repatriate: Counter,
    task_errors: Counter,
    lb_data_errors: Counter,
    load_balance: Counter,
    slice_length: Gauge,
    cpu_busy_pct: Histogram,
    processing_duration: Histogram,
}

impl Metrics {
    fn new() -> Self {
        Self {
            wsync: counter!("dispatched_tasks_total", "type" => "wsync"),
            wsync_prev_idle: counter!("dispatched_tasks_total", "type" => "wsync_prev_idle"),
            prev_idle: counter!("dispatched_tasks_total", "type" => "prev_idle"),
            greedy_idle: counter!("dispatched_tasks_total", "type" => "greedy_idle"),
            pinned: counter!("dispatched_tasks_total", "type" => "pinned"),
            direct_dispatch: counter!("dispatched_tasks_total", "type" => "direct_dispatch"),
            direct_greedy: counter!("dispatched_tasks_total", "type" => "direct_greedy"),
            direct_greedy_far: counter!("dispatched_tasks_total", "type" => "direct_greedy_far"),
            dsq: counter!("dispatched_tasks_total", "type" => "dsq"),
            greedy_local: counter!("dispatched_tasks_total", "type" => "greedy_local"),
            greedy_xnuma: counter!("dispatched_tasks_total", "type" => "greedy_xnuma"),
            kick_greedy: counter!("kick_greedy_total"),
            repatriate: counter!("repatriate_total"),
            task_errors: counter!("task_errors_total"),
            lb_data_errors: counter!("lb_data_errors_total"),
            load_balance: counter!("load_balance_total"),

            slice_length: gauge!("slice_length_us"),

            cpu_busy_pct: histogram!("cpu_busy_pct"),
            processing_duration: histogram!("processing_duration_us"),
        }
    }
}

struct Scheduler {
    ops: Arc<RustyOps>,
    handle: SchedHandle,
    link: Option<ScxLink>,
    workload: WorkloadRunner,

    sched_interval: Duration,
    tune_interval: Duration,
    balance_load: bool,
    balanced_kworkers: bool,

    nr_lb_data_errors: u64,

    tuner: Tuner,

    metrics: Metrics,
}

impl Scheduler {
    fn init(opts: &Opts) -> Result<Self> {
        let nr_cpus = match opts.nr_cpus {
            0 => host_nr_cpus()?,
            nr => nr,
        };

        if opts.interval <= 0.0 || opts.tune_interval <= 0.0 {
            bail!("Intervals must be positive");
        }

        let domains = if opts.cpumasks.is_empty() {
            let nr_doms = match opts.nr_doms {
                0 => (nr_cpus as usize).div_ceil(8),
                nr => nr,
            };
            DomainGroup::split(nr_cpus as usize, nr_doms, opts.nr_nodes)?
        } else {
            DomainGroup::from_cpumasks(nr_cpus as usize, &opts.cpumasks)?
        };
        let domains = Arc::new(domains);

        for node in 0..domains.nr_nodes() {
            info!("NUMA[{:02}] mask= {}", node, domains.numa_mask(node));
            for dom in domains.numa_doms(node).iter() {
                info!("  DOM[{:02}] mask= {}", dom.id(), dom.mask());
            }
        }

        let rcfg = RustyConfig {
            slice_ns: opts.slice_us_underutil * 1000,
            load_half_life: (opts.load_half_life * 1_000_000_000.0) as u64,
            kthreads_local: opts.kthreads_local,
            fifo_sched: opts.fifo_sched,
            greedy_threshold: opts.greedy_threshold,
            greedy_threshold_x_numa: opts.greedy_threshold_x_numa,
            direct_greedy_numa: opts.direct_greedy_numa,
        };
        let ops = Arc::new(RustyOps::new(domains.clone(), rcfg)?);

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
        info!("Rusty Scheduler Attached");

        let workload = WorkloadRunner::start(&handle, clock, opts.nr_tasks, opts.seed)?;

        Ok(Self {
            ops,
            handle,
            link: Some(link),
            workload,

            sched_interval: Duration::from_secs_f64(opts.interval),
            tune_interval: Duration::from_secs_f64(opts.tune_interval),
            balance_load: !opts.no_load_balance,
            balanced_kworkers: opts.balanced_kworkers,

            nr_lb_data_errors: 0,

            tuner: Tuner::new(
                domains,
                opts.direct_greedy_under,
                opts.kick_greedy_under,
                opts.slice_us_underutil * 1000,
                opts.slice_us_overutil * 1000,
            )?,

            metrics: Metrics::new(),
        })
    }

    fn report(&self, stats: &RustyStats, lb_stats: &[NumaStat], nr_lb_data_errors: u64, cpu_used: f64) -> Result<()> {
        let stat = |s| stats.get(s);

        self.metrics.wsync.increment(stat(RustyStat::WakeSync));
        self.metrics.wsync_prev_idle.increment(stat(RustyStat::SyncPrevIdle));
        self.metrics.prev_idle.increment(stat(RustyStat::PrevIdle));
        self.metrics.greedy_idle.increment(stat(RustyStat::GreedyIdle));
        self.metrics.pinned.increment(stat(RustyStat::Pinned));
        self.metrics.direct_dispatch.increment(stat(RustyStat::DirectDispatch));
        self.metrics.direct_greedy.increment(stat(RustyStat::DirectGreedy));
        self.metrics.direct_greedy_far.increment(stat(RustyStat::DirectGreedyFar));
        self.metrics.dsq.increment(stat(RustyStat::DsqDispatch));
        self.metrics.greedy_local.increment(stat(RustyStat::GreedyLocal));
        self.metrics.greedy_xnuma.increment(stat(RustyStat::GreedyXnuma));
        self.metrics.kick_greedy.increment(stat(RustyStat::KickGreedy));
        self.metrics.repatriate.increment(stat(RustyStat::Repatriate));
        self.metrics.task_errors.increment(stat(RustyStat::TaskGetErr));
        self.metrics.lb_data_errors.increment(nr_lb_data_errors);
        self.metrics.load_balance.increment(stat(RustyStat::LoadBalance));

        self.metrics.slice_length.set(self.tuner.slice_ns as f64 / 1000.0);

        // Nodes and domains are only known at runtime. The recorder caches
        // the handles.
        for node in lb_stats.iter() {
            histogram!("load_avg", "node" => node.id.to_string()).record(node.load.load_avg());
            for dom in node.domains.iter() {
                histogram!("load_avg", "node" => node.id.to_string(), "dom" => dom.id.to_string())
                    .record(dom.load.load_avg());
            }
        }

        let ti = self.ops.tune_input();
        let mut cluster = ClusterStats::new(self.tuner.cpu_busy, stats, lb_stats, self.nr_lb_data_errors, cpu_used);
        cluster.slice_us = self.tuner.slice_ns / 1000;
        cluster.direct_greedy_cpus = Some(ti.direct_greedy_cpumask.clone());
        cluster.kick_greedy_cpus = Some(ti.kick_greedy_cpumask.clone());

        let mut buf = Vec::new();
        cluster.format(&mut buf)?;
        for line in String::from_utf8_lossy(&buf).lines() {
            info!("{}", line);
        }
        Ok(())
    }

    fn lb_step(&mut self) -> Result<()> {
        let started_at = Instant::now();
        let stats = self.ops.read_stats();
        self.metrics.cpu_busy_pct.record(self.tuner.cpu_busy * 100.0);

        let now = self.handle.session().now();
        let mut lb = LoadBalancer::new(
            &self.ops,
            now,
            self.balanced_kworkers,
            self.tuner.fully_utilized,
            self.balance_load,
        );

        lb.load_balance()?;
        let nr_lb_data_errors = lb.nr_lb_data_errors();
        let lb_stats = lb.get_stats();
        let elapsed = started_at.elapsed();
        self.metrics.processing_duration.record(elapsed.as_micros() as f64);

        self.nr_lb_data_errors += nr_lb_data_errors;
        self.report(&stats, &lb_stats, nr_lb_data_errors, elapsed.as_secs_f64())
    }

    fn run(mut self, shutdown: Arc<AtomicBool>) -> Result<UserExitInfo> {
        let now = Instant::now();
        let mut next_tune_at = now + self.tune_interval;
        let mut next_sched_at = now + self.sched_interval;

        while !shutdown.load(Ordering::Relaxed) && !self.handle.exited() {
            let now = Instant::now();

            if now >= next_tune_at {
                self.tuner.step(self.handle.session(), &self.ops)?;
                next_tune_at += self.tune_interval;
                if next_tune_at < now {
                    next_tune_at = now + self.tune_interval;
                }
            }

            if now >= next_sched_at {
                self.lb_step()?;
                next_sched_at += self.sched_interval;
                if next_sched_at < now {
                    next_sched_at = now + self.sched_interval;
                }
            }

            std::thread::sleep(
                next_sched_at
                    .min(next_tune_at)
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

    if opts.enable_prometheus {
        info!("Enabling Prometheus endpoint: http://localhost:9000");
        PrometheusBuilder::new()
            .install()
            .context("Failed to install Prometheus recorder")?;
    }

    loop {
        let sched = Scheduler::init(&opts)?;
        if !sched.run(shutdown.clone())?.should_restart() {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argument_errors_exit_1() {
        let err = Opts::try_parse_from(["scx_rusty", "--bogus"]).unwrap_err();
        assert_eq!(usage_exit_code(&err), 1);

        let help = Opts::try_parse_from(["scx_rusty", "-h"]).unwrap_err();
        assert_eq!(usage_exit_code(&help), 0);

        assert!(Opts::try_parse_from(["scx_rusty"]).is_ok());
    }
}
