// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! User space side of a policy: load, attach, monitor, report.

use crate::clock::Clock;
use crate::cpumask::read_cpulist;
use crate::exit::ScxExitKind;
use crate::exit::UserExitInfo;
use crate::ops::SchedOps;
use crate::session::ScxSession;
use crate::session::SessionParams;
use crate::stats::ScxStatsSnapshot;
use crate::types::MAX_CPUS;
use crate::types::SCX_WATCHDOG_MAX_TIMEOUT_MS;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use crossbeam::channel::RecvTimeoutError;
use log::debug;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

/// Default tick interval of the engine, HZ=250.
pub const SCX_TICK_NS_DFL: u64 = 4_000_000;

/// Bytes of debug dump kept in an error exit record.
pub const SCX_EXIT_DUMP_DFL_LEN: usize = 32768;

/// Number of possible CPUs of this host, capped at `MAX_CPUS`.
pub fn host_nr_cpus() -> Result<u32> {
    let nr = match std::fs::read_to_string("/sys/devices/system/cpu/possible") {
        Ok(possible) => read_cpulist(possible.trim())
            .context("Failed to parse possible CPUs")?
            .into_iter()
            .max()
            .map_or(1, |max| max + 1),
        Err(_) => std::thread::available_parallelism()
            .context("Failed to determine the number of CPUs")?
            .get(),
    };
    Ok((nr as u32).min(MAX_CPUS))
}

#[derive(Debug, Clone)]
pub struct ScxConfig {
    pub nr_cpus: u32,
    /// Overrides the policy's own watchdog timeout.
    pub timeout_ms: Option<u32>,
    pub switch_partial: bool,
    pub exit_dump_len: usize,
    pub tick_ns: u64,
}

impl Default for ScxConfig {
    fn default() -> Self {
        Self {
            nr_cpus: 4,
            timeout_ms: None,
            switch_partial: false,
            exit_dump_len: SCX_EXIT_DUMP_DFL_LEN,
            tick_ns: SCX_TICK_NS_DFL,
        }
    }
}

impl ScxConfig {
    pub fn validate(&self) -> Result<()> {
        if self.nr_cpus == 0 || self.nr_cpus > MAX_CPUS {
            bail!("nr_cpus {} out of range [1, {}]", self.nr_cpus, MAX_CPUS);
        }
        if let Some(timeout_ms) = self.timeout_ms {
            if timeout_ms > SCX_WATCHDOG_MAX_TIMEOUT_MS {
                bail!(
                    "timeout_ms {} exceeds the maximum of {}ms",
                    timeout_ms,
                    SCX_WATCHDOG_MAX_TIMEOUT_MS
                );
            }
        }
        if self.tick_ns == 0 {
            bail!("tick interval must be positive");
        }
        Ok(())
    }
}

/// A loaded policy. Nothing is scheduled by it until [`SchedHandle::attach`].
#[derive(Debug)]
pub struct SchedHandle {
    sess: Arc<ScxSession>,
    cfg: ScxConfig,
}

impl SchedHandle {
    /// Validate `cfg`, build the session and run `ops.init()`.
    pub fn open_and_load(
        ops: Arc<dyn SchedOps>,
        cfg: &ScxConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        cfg.validate().context("Invalid sched_ext configuration")?;
        let name = ops.name().to_string();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            bail!("Invalid ops name {:?}", name);
        }
        let timeout_ms = cfg.timeout_ms.unwrap_or_else(|| ops.timeout_ms());
        if timeout_ms > SCX_WATCHDOG_MAX_TIMEOUT_MS {
            bail!(
                "{}: timeout_ms {} exceeds the maximum of {}ms",
                name,
                timeout_ms,
                SCX_WATCHDOG_MAX_TIMEOUT_MS
            );
        }

        let params = SessionParams {
            nr_cpus: cfg.nr_cpus,
            timeout_ms,
            switch_partial: cfg.switch_partial,
            exit_dump_len: cfg.exit_dump_len,
        };
        let sess = ScxSession::new(ops, &params, clock)?;
        sess.init()
            .with_context(|| format!("Failed to load {}", name))?;
        debug!("{} loaded on {} CPUs", name, cfg.nr_cpus);

        Ok(Self {
            sess,
            cfg: cfg.clone(),
        })
    }

    pub fn session(&self) -> &Arc<ScxSession> {
        &self.sess
    }

    pub fn config(&self) -> &ScxConfig {
        &self.cfg
    }

    /// Start scheduling with the policy. Dropping the link detaches it.
    pub fn attach(&self) -> Result<ScxLink> {
        self.sess
            .enable()
            .with_context(|| format!("Failed to attach {}", self.sess.name()))?;
        Ok(ScxLink {
            sess: self.sess.clone(),
        })
    }

    pub fn poll_stats(&self) -> ScxStatsSnapshot {
        self.sess.stats()
    }

    pub fn exited(&self) -> bool {
        self.sess.exit_info().is_some()
    }

    pub fn exit_info(&self) -> UserExitInfo {
        UserExitInfo::new(self.sess.exit_info())
    }

    /// Block until the policy exits or `shutdown` is set, calling
    /// `on_interval` every `interval`. On shutdown the link is dropped, which
    /// unregisters the policy. Returns the exit record either way.
    pub fn wait_for_exit<F>(
        &self,
        link: ScxLink,
        shutdown: &AtomicBool,
        interval: Duration,
        mut on_interval: F,
    ) -> Result<UserExitInfo>
    where
        F: FnMut(&Self) -> Result<()>,
    {
        let exit_rx = self.sess.exit_receiver();
        let mut next_at = Instant::now() + interval;

        while !shutdown.load(Ordering::Relaxed) && !self.exited() {
            let timeout = next_at.saturating_duration_since(Instant::now());
            match exit_rx.recv_timeout(timeout.min(Duration::from_millis(100))) {
                Ok(_) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
            let now = Instant::now();
            if now >= next_at {
                on_interval(self)?;
                next_at += interval;
                if next_at < now {
                    next_at = now + interval;
                }
            }
        }

        drop(link);
        Ok(self.exit_info())
    }
}

/// An attached policy.
#[derive(Debug)]
pub struct ScxLink {
    sess: Arc<ScxSession>,
}

impl Drop for ScxLink {
    fn drop(&mut self) {
        self.sess
            .disable(ScxExitKind::Unreg, "unregistered from user space");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimClock;
    use crate::ops::ScxCtx;
    use crate::task::TaskRef;
    use crate::types::DsqId;
    use crate::types::EnqFlags;

    struct Fifo(&'static str);

    impl SchedOps for Fifo {
        fn name(&self) -> &str {
            self.0
        }

        fn enqueue(&self, ctx: &ScxCtx, task: &TaskRef, enq_flags: EnqFlags) {
            ctx.dispatch(task, DsqId::GLOBAL, 0, enq_flags);
        }
    }

    struct FailInit;

    impl SchedOps for FailInit {
        fn name(&self) -> &str {
            "fail_init"
        }

        fn init(&self, ctx: &ScxCtx) -> Result<()> {
            ctx.create_dsq(DsqId::GLOBAL, None)?;
            Ok(())
        }

        fn enqueue(&self, _ctx: &ScxCtx, _task: &TaskRef, _enq_flags: EnqFlags) {}
    }

    fn clock() -> Arc<dyn Clock> {
        Arc::new(SimClock::new(0))
    }

    #[test]
    fn test_host_nr_cpus() {
        let nr = host_nr_cpus().unwrap();
        assert!(nr >= 1 && nr <= MAX_CPUS);
    }

    #[test]
    fn test_config_validation() {
        let mut cfg = ScxConfig::default();
        assert!(cfg.validate().is_ok());
        cfg.nr_cpus = 0;
        assert!(cfg.validate().is_err());
        cfg.nr_cpus = MAX_CPUS + 1;
        assert!(cfg.validate().is_err());
        cfg.nr_cpus = 2;
        cfg.timeout_ms = Some(SCX_WATCHDOG_MAX_TIMEOUT_MS + 1);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_attach_detach() {
        let handle =
            SchedHandle::open_and_load(Arc::new(Fifo("fifo")), &ScxConfig::default(), clock())
                .unwrap();
        assert!(!handle.session().scx_enabled());
        let link = handle.attach().unwrap();
        assert!(handle.session().scx_enabled());
        assert!(!handle.exited());

        drop(link);
        assert!(!handle.session().scx_enabled());
        let uei = handle.exit_info();
        assert!(uei.exited());
        assert_eq!(uei.kind, ScxExitKind::Unreg);
        assert!(uei.report().is_ok());
    }

    #[test]
    fn test_bad_name_rejected() {
        let res =
            SchedHandle::open_and_load(Arc::new(Fifo("no spaces")), &ScxConfig::default(), clock());
        assert!(res.is_err());
    }

    #[test]
    fn test_init_failure_is_load_failure() {
        let res = SchedHandle::open_and_load(Arc::new(FailInit), &ScxConfig::default(), clock());
        let err = res.unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to load fail_init"));
    }

    #[test]
    fn test_wait_for_exit_on_shutdown() {
        let handle =
            SchedHandle::open_and_load(Arc::new(Fifo("fifo")), &ScxConfig::default(), clock())
                .unwrap();
        let link = handle.attach().unwrap();
        let shutdown = AtomicBool::new(false);
        let mut ticks = 0;
        let uei = handle
            .wait_for_exit(link, &shutdown, Duration::from_millis(1), |_| {
                ticks += 1;
                if ticks == 3 {
                    shutdown.store(true, Ordering::Relaxed);
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(ticks, 3);
        assert_eq!(uei.kind, ScxExitKind::Unreg);
    }
}
