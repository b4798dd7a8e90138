// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Identifiers, flag sets and constants shared by the core and the policies.
//!
//! Identifiers are newtypes so that a CPU number can never be passed where a
//! DSQ id is expected. Plain quantities (timestamps, weights) are aliases.

use serde::Deserialize;
use serde::Serialize;
use std::fmt;

/// Default time slice handed out by the core and most policies.
pub const SCX_SLICE_DFL: u64 = 20 * 1_000_000;
/// Slice that is never exhausted by the tick.
pub const SCX_SLICE_INF: u64 = u64::MAX;
/// Upper bound accepted for `timeout_ms`.
pub const SCX_WATCHDOG_MAX_TIMEOUT_MS: u32 = 30_000;
/// Maximum number of ops.dispatch() rounds per balance.
pub const SCX_DSP_MAX_LOOPS: u32 = 32;
/// Maximum number of dispatches a single ops.dispatch() invocation may issue.
pub const SCX_DSP_MAX_BATCH: u32 = 32;
/// Largest CPU count a session can be configured with.
pub const MAX_CPUS: u32 = 512;

/// Nanoseconds, either simulated or monotonic.
pub type TimeNs = u64;

/// Compound weight in `[1, 10000]`, 100 being the weight of a nice-0 task.
pub type Weight = u32;

/// Dispatch queue identifier. The top bits carry the built-in flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DsqId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pid(pub i32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct CpuId(pub u32);

impl DsqId {
    pub const FLAG_BUILTIN: u64 = 1u64 << 63;
    pub const FLAG_LOCAL_ON: u64 = 1u64 << 62;
    pub const INVALID: DsqId = DsqId(Self::FLAG_BUILTIN);
    pub const GLOBAL: DsqId = DsqId(Self::FLAG_BUILTIN | 1);
    pub const LOCAL: DsqId = DsqId(Self::FLAG_BUILTIN | 2);
    pub const LOCAL_ON_MASK: u64 = Self::FLAG_BUILTIN | Self::FLAG_LOCAL_ON;
    pub const LOCAL_CPU_MASK: u64 = 0x0000_0000_FFFF_FFFF;

    /// `LOCAL_ON | cpu`: the local DSQ of a specific CPU.
    pub fn local_on(cpu: CpuId) -> DsqId {
        DsqId(Self::LOCAL_ON_MASK | cpu.0 as u64)
    }

    pub fn is_local(self) -> bool {
        self == Self::LOCAL
    }

    pub fn is_local_on(self) -> bool {
        self.0 & Self::LOCAL_ON_MASK == Self::LOCAL_ON_MASK
    }

    /// Built-in DSQs (LOCAL, GLOBAL, LOCAL_ON) refuse vtime ordering.
    pub fn is_builtin(self) -> bool {
        self.0 & Self::FLAG_BUILTIN != 0
    }

    pub fn local_on_cpu(self) -> CpuId {
        CpuId((self.0 & Self::LOCAL_CPU_MASK) as u32)
    }
}

impl fmt::Display for DsqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::GLOBAL => f.write_str("GLOBAL"),
            Self::LOCAL => f.write_str("LOCAL"),
            Self::INVALID => f.write_str("INVALID"),
            id if id.is_local_on() => write!(f, "LOCAL_ON|{}", id.local_on_cpu().0),
            id => write!(f, "0x{:x}", id.0),
        }
    }
}

impl Pid {
    pub fn raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl CpuId {
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! scx_flags {
    ($(#[$meta:meta])* $name:ident { $($flag:ident = $val:expr),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(u64);

        impl $name {
            pub const NONE: $name = $name(0);
            $(pub const $flag: $name = $name($val);)*

            pub fn from_raw(raw: u64) -> Self {
                $name(raw)
            }

            pub fn contains(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }

            pub fn intersects(self, other: $name) -> bool {
                self.0 & other.0 != 0
            }

            pub fn insert(&mut self, other: $name) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: $name) {
                self.0 &= !other.0;
            }

            pub fn raw(self) -> u64 {
                self.0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = $name;

            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: $name) {
                self.0 |= rhs.0;
            }
        }
    };
}

scx_flags!(
    /// Flags passed to ops.enqueue() and to the dispatch kfuncs.
    EnqFlags {
        WAKEUP = 1 << 0,
        HEAD = 1 << 4,
        PREEMPT = 1 << 32,
        REENQ = 1 << 40,
        LAST = 1 << 41,
    }
);

scx_flags!(
    /// Flags passed to ops.dequeue() and ops.quiescent().
    DeqFlags {
        SLEEP = 1 << 0,
    }
);

scx_flags!(
    /// Wakeup flags passed to ops.select_cpu().
    WakeFlags {
        FORK = 0x04,
        TTWU = 0x08,
        SYNC = 0x10,
    }
);

scx_flags!(
    /// Flags for `ScxCtx::kick_cpu`.
    KickFlags {
        IDLE = 1 << 0,
        PREEMPT = 1 << 1,
    }
);

scx_flags!(
    /// Policy-wide behavior flags returned by `SchedOps::flags`.
    OpsFlags {
        KEEP_BUILTIN_IDLE = 1 << 0,
        ENQ_LAST = 1 << 1,
        ENQ_EXITING = 1 << 2,
        SWITCH_PARTIAL = 1 << 3,
    }
);

impl OpsFlags {
    pub const ALL: OpsFlags = OpsFlags(
        Self::KEEP_BUILTIN_IDLE.0 | Self::ENQ_LAST.0 | Self::ENQ_EXITING.0 | Self::SWITCH_PARTIAL.0,
    );
}

/// Virtual time. Ordering is wrapping, like the kernel's `time_before64`,
/// so a counter that wrapped around still compares as later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Vtime(pub u64);

impl PartialOrd for Vtime {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Vtime {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.0.wrapping_sub(other.0) as i64).cmp(&0)
    }
}

impl fmt::Display for Vtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `a` happens before `b` in wrapping time.
pub fn vtime_before(a: u64, b: u64) -> bool {
    (a.wrapping_sub(b) as i64) < 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_on_roundtrips_cpu() {
        let dsq = DsqId::local_on(CpuId(7));
        assert!(dsq.is_local_on());
        assert!(dsq.is_builtin());
        assert!(!dsq.is_local());
        assert_eq!(dsq.local_on_cpu(), CpuId(7));
        assert!(!DsqId::GLOBAL.is_local_on());
        assert!(!DsqId::LOCAL.is_local_on());
        assert!(!DsqId(42).is_builtin());
    }

    #[test]
    fn vtime_orders_across_wraparound() {
        assert!(Vtime(u64::MAX) < Vtime(0));
        assert!(Vtime(5) < Vtime(6));
        assert!(vtime_before(u64::MAX - 10, 3));
        assert!(!vtime_before(3, 3));
    }

    #[test]
    fn flags_compose() {
        let mut flags = EnqFlags::WAKEUP | EnqFlags::HEAD;
        assert!(flags.contains(EnqFlags::HEAD));
        flags.remove(EnqFlags::HEAD);
        assert!(!flags.contains(EnqFlags::HEAD));
        assert!(flags.intersects(EnqFlags::WAKEUP | EnqFlags::LAST));
        assert!(OpsFlags::ALL.contains(OpsFlags::SWITCH_PARTIAL));
    }

    #[test]
    fn dsq_id_display() {
        assert_eq!(DsqId::GLOBAL.to_string(), "GLOBAL");
        assert_eq!(DsqId::local_on(CpuId(3)).to_string(), "LOCAL_ON|3");
        assert_eq!(DsqId(0x10).to_string(), "0x10");
    }
}
