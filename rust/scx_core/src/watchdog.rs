// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Stall detection.
//!
//! Two things are watched. The watchdog work must check in at least once
//! per timeout, and no runnable task may wait longer than the timeout
//! without getting on a CPU. Either failure is reported once through the
//! error exit path with `ErrorStall`.

use crate::task::OpsState;
use crate::task::TaskRef;
use crate::types::TimeNs;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// Timeout used when the policy doesn't ask for one.
pub const SCX_WATCHDOG_DFL_TIMEOUT_MS: u32 = 30_000;

#[derive(Debug)]
pub struct Watchdog {
    timeout_ns: u64,
    last_checkin: AtomicU64,
}

fn fmt_secs(ns: u64) -> String {
    let ms = ns / 1_000_000;
    format!("{}.{:03}s", ms / 1000, ms % 1000)
}

impl Watchdog {
    /// `timeout_ms == 0` selects the default timeout.
    pub fn new(timeout_ms: u32, now: TimeNs) -> Self {
        let timeout_ms = match timeout_ms {
            0 => SCX_WATCHDOG_DFL_TIMEOUT_MS,
            v => v,
        };
        Self {
            timeout_ns: timeout_ms as u64 * 1_000_000,
            last_checkin: AtomicU64::new(now),
        }
    }

    pub fn timeout_ns(&self) -> u64 {
        self.timeout_ns
    }

    /// Period at which the watchdog work is expected to check in.
    pub fn period_ns(&self) -> u64 {
        (self.timeout_ns / 2).max(1)
    }

    pub fn checkin(&self, now: TimeNs) {
        self.last_checkin.fetch_max(now, Ordering::Relaxed);
    }

    pub fn last_checkin(&self) -> TimeNs {
        self.last_checkin.load(Ordering::Relaxed)
    }

    pub fn check_checkin(&self, now: TimeNs) -> Option<String> {
        let last = self.last_checkin();
        let elapsed = now.saturating_sub(last);
        (elapsed > self.timeout_ns)
            .then(|| format!("watchdog failed to check in for {}", fmt_secs(elapsed)))
    }

    pub fn check_task(&self, now: TimeNs, task: &TaskRef) -> Option<String> {
        if !task.on_scx() {
            return None;
        }
        match task.ops_state() {
            OpsState::Queued | OpsState::Dispatched(_) => {}
            _ => return None,
        }
        let waited = now.saturating_sub(task.runnable_at());
        (waited > self.timeout_ns).then(|| {
            format!(
                "{}[{}] failed to run for {}",
                task.comm,
                task.pid,
                fmt_secs(waited)
            )
        })
    }

    /// First stall found among the check-in and `tasks`.
    pub fn check<'a>(
        &self,
        now: TimeNs,
        tasks: impl IntoIterator<Item = &'a TaskRef>,
    ) -> Option<String> {
        if let Some(msg) = self.check_checkin(now) {
            return Some(msg);
        }
        tasks.into_iter().find_map(|task| self.check_task(now, task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;
    use crate::task::TaskAttrs;
    use crate::types::Pid;
    use std::sync::Arc;

    const MS: u64 = 1_000_000;

    #[test]
    fn checkin_overdue() {
        let wd = Watchdog::new(5000, 0);
        assert_eq!(wd.period_ns(), 2500 * MS);
        assert!(wd.check_checkin(5000 * MS).is_none());
        let msg = wd.check_checkin(5001 * MS).unwrap();
        assert_eq!(msg, "watchdog failed to check in for 5.001s");
        wd.checkin(5001 * MS);
        assert!(wd.check_checkin(6000 * MS).is_none());
        // Late check-ins never move the timestamp backwards.
        wd.checkin(10);
        assert_eq!(wd.last_checkin(), 5001 * MS);
    }

    #[test]
    fn default_timeout() {
        assert_eq!(Watchdog::new(0, 0).timeout_ns(), 30_000 * MS);
    }

    #[test]
    fn only_waiting_scx_tasks_stall() {
        let wd = Watchdog::new(100, 0);
        let task = Arc::new(Task::new(&TaskAttrs::new(Pid(9), "hog"), 1).unwrap());
        task.set_runnable_at(0);
        assert!(wd.check_task(200 * MS, &task).is_none());

        task.set_on_scx(true);
        assert!(wd.check_task(200 * MS, &task).is_none());

        *task.ops_state_lock() = OpsState::Queued;
        let msg = wd.check(200 * MS, [&task]);
        assert!(msg.is_some());
        wd.checkin(200 * MS);
        assert_eq!(
            wd.check(200 * MS, [&task]).unwrap(),
            "hog[9] failed to run for 0.200s"
        );
    }
}
