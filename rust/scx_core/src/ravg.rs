// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Running average of a piecewise-constant signal with exponential decay.
//!
//! The signal holds `cur` since `cur_at`. Reading at `now` folds that segment
//! into the average with weight `1 - 0.5^((now - cur_at) / half_life)`. With
//! `cur` toggled between 1 and 0 on run/stop the average is a duty cycle.

use crate::types::TimeNs;

pub const USAGE_HALF_LIFE: TimeNs = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ravg {
    avg: f64,
    cur: f64,
    cur_at: TimeNs,
    half_life: TimeNs,
}

impl Ravg {
    pub fn new(half_life: TimeNs, now: TimeNs) -> Self {
        Self {
            avg: 0.0,
            cur: 0.0,
            cur_at: now,
            half_life: half_life.max(1),
        }
    }

    fn project(&self, now: TimeNs) -> f64 {
        let dur = now.saturating_sub(self.cur_at) as f64;
        let decay = 0.5f64.powf(dur / self.half_life as f64);
        self.cur + (self.avg - self.cur) * decay
    }

    /// Fold the segment ending at `now` and switch the signal to `val`.
    pub fn accumulate(&mut self, val: f64, now: TimeNs) {
        if now > self.cur_at {
            self.avg = self.project(now);
            self.cur_at = now;
        }
        self.cur = val;
    }

    /// Add `delta` to the signal from `now` on.
    pub fn add(&mut self, delta: f64, now: TimeNs) {
        let val = self.cur + delta;
        self.accumulate(val.max(0.0), now);
    }

    pub fn read(&self, now: TimeNs) -> f64 {
        self.project(now)
    }

    pub fn cur(&self) -> f64 {
        self.cur
    }
}
