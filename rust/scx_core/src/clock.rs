// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use crate::types::TimeNs;
use std::fmt::Debug;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// Time source of a session.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> TimeNs;
}

/// Clock that only moves when told to. Drives deterministic runs.
#[derive(Debug, Default)]
pub struct SimClock {
    now: AtomicU64,
}

impl SimClock {
    pub fn new(start: TimeNs) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    pub fn advance(&self, delta: TimeNs) -> TimeNs {
        self.now.fetch_add(delta, Ordering::AcqRel) + delta
    }

    pub fn set(&self, now: TimeNs) {
        self.now.store(now, Ordering::Release);
    }
}

impl Clock for SimClock {
    fn now(&self) -> TimeNs {
        self.now.load(Ordering::Acquire)
    }
}

/// CLOCK_MONOTONIC.
#[derive(Debug, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> TimeNs {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // clock_gettime() can't fail for CLOCK_MONOTONIC with a valid pointer.
        unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
    }
}
