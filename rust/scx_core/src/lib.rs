// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # sched_ext core
//!
//! sched_ext lets a scheduling policy be plugged into the scheduler as its
//! own class. This crate models the core side of that contract and the user
//! space plumbing shared by the schedulers:
//!
//! - Dispatch queues: per-CPU local queues, the global queue and custom
//!   queues created by the policy, FIFO or vtime ordered.
//! - The ops contract: the [`SchedOps`] trait a policy implements and the
//!   [`ScxCtx`] handle through which it dispatches, consumes and kicks.
//! - The class switch shim ([`ScxSession`]): decides which tasks the policy
//!   governs, consults it before the default class, enforces the watchdog
//!   and falls back to the default class on any error.
//! - The exit protocol: a write-once exit record reported to user space.
//! - The control plane: [`SchedHandle`] loads, attaches, polls and waits.
//! - A deterministic, tick-driven [`Engine`] that runs scripted tasks
//!   against a session in simulated time.
//!
//! ```rust,no_run
//! use scx_core::*;
//! use std::sync::Arc;
//!
//! struct Fifo;
//!
//! impl SchedOps for Fifo {
//!     fn name(&self) -> &str {
//!         "fifo"
//!     }
//!
//!     fn enqueue(&self, ctx: &ScxCtx, task: &TaskRef, enq_flags: EnqFlags) {
//!         ctx.dispatch(task, DsqId::GLOBAL, SCX_SLICE_DFL, enq_flags);
//!     }
//! }
//!
//! # fn main() -> anyhow::Result<()> {
//! let clock = Arc::new(SimClock::new(0));
//! let cfg = ScxConfig::default();
//! let handle = SchedHandle::open_and_load(Arc::new(Fifo), &cfg, clock.clone())?;
//! let _link = handle.attach()?;
//!
//! let mut engine = Engine::new(handle.session().clone(), clock, cfg.tick_ns)?;
//! engine.add_task(&TaskDef::new(Pid(1), "spin", TaskBehavior::cpu_bound()))?;
//! engine.run_for(100_000_000);
//! engine.trace().dump();
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod cpumask;
pub mod dsq;
pub mod engine;
pub mod exit;
pub mod loader;
pub mod ops;
pub mod percpu;
pub mod ravg;
pub mod scenario;
pub mod session;
pub mod stats;
pub mod task;
pub mod trace;
pub mod types;
mod util;
pub mod watchdog;
pub mod workloads;

pub use clock::Clock;
pub use clock::MonotonicClock;
pub use clock::SimClock;
pub use cpumask::read_cpulist;
pub use cpumask::Cpumask;
pub use dsq::BoundedQueue;
pub use dsq::DsqError;
pub use engine::Engine;
pub use exit::ExitInfo;
pub use exit::ScxExitKind;
pub use exit::UserExitInfo;
pub use exit::SCX_ECODE_ACT_RESTART;
pub use loader::host_nr_cpus;
pub use loader::SchedHandle;
pub use loader::ScxConfig;
pub use loader::ScxLink;
pub use loader::SCX_EXIT_DUMP_DFL_LEN;
pub use ops::SchedOps;
pub use ops::ScxCtx;
pub use ops::ScxOp;
pub use percpu::PerCpu;
pub use percpu::PerCpuCounters;
pub use ravg::Ravg;
pub use ravg::USAGE_HALF_LIFE;
pub use scenario::Phase;
pub use scenario::Scenario;
pub use scenario::TaskBehavior;
pub use scenario::TaskDef;
pub use session::PrevState;
pub use session::SchedClass;
pub use session::ScxOpsState;
pub use session::ScxSession;
pub use stats::ScxStatsSnapshot;
pub use task::nice_to_weight;
pub use task::SchedPolicy;
pub use task::TaskAttrs;
pub use task::TaskCtxStore;
pub use task::TaskRef;
pub use trace::Trace;
pub use trace::TraceKind;
pub use types::*;
pub use workloads::mixed_workload;
pub use workloads::WorkloadRunner;
