// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Exit protocol: why a policy stopped and what it said on the way out.
//!
//! The exit record is written once. Whoever gets there first (an ops error,
//! the watchdog, an unregistration) decides the kind and message; later
//! writers are ignored.

use crate::types::TimeNs;
use anyhow::bail;
use anyhow::Result;
use serde::Serialize;
use std::fmt;
use std::sync::OnceLock;

/// Exit code bit asking the control program to load the policy again.
pub const SCX_ECODE_ACT_RESTART: u64 = 1 << 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
#[repr(i32)]
pub enum ScxExitKind {
    #[default]
    None = 0,
    Done = 1,
    Unreg = 64,
    SysRq = 65,
    Error = 1024,
    ErrorBpf = 1025,
    ErrorStall = 1026,
}

impl ScxExitKind {
    pub fn reason(self) -> &'static str {
        match self {
            ScxExitKind::None => "",
            ScxExitKind::Done => "Scheduler exited",
            ScxExitKind::Unreg => "Scheduler unregistered from user space",
            ScxExitKind::SysRq => "disabled by sysrq-S",
            ScxExitKind::Error => "runtime error",
            ScxExitKind::ErrorBpf => "scx_bpf_error",
            ScxExitKind::ErrorStall => "runnable task stall",
        }
    }

    /// `normal`, `error` or `stall`.
    pub fn exit_type(self) -> &'static str {
        match self {
            ScxExitKind::ErrorStall => "stall",
            ScxExitKind::Error | ScxExitKind::ErrorBpf => "error",
            _ => "normal",
        }
    }

    pub fn is_error(self) -> bool {
        self >= ScxExitKind::Error
    }
}

impl fmt::Display for ScxExitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.exit_type())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    pub kind: ScxExitKind,
    pub exit_code: u64,
    pub reason: String,
    pub msg: String,
    pub dump: Option<String>,
    pub timestamp_ns: TimeNs,
}

impl ExitInfo {
    pub fn new(kind: ScxExitKind, msg: impl Into<String>, timestamp_ns: TimeNs) -> Self {
        Self {
            kind,
            exit_code: 0,
            reason: kind.reason().to_string(),
            msg: msg.into(),
            dump: None,
            timestamp_ns,
        }
    }
}

/// Write-once exit record.
#[derive(Debug, Default)]
pub struct ExitCell {
    info: OnceLock<ExitInfo>,
}

impl ExitCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `info` unless something was recorded before. Returns whether
    /// this call won.
    pub fn set(&self, info: ExitInfo) -> bool {
        self.info.set(info).is_ok()
    }

    pub fn get(&self) -> Option<&ExitInfo> {
        self.info.get()
    }

    pub fn is_set(&self) -> bool {
        self.info.get().is_some()
    }

    pub fn kind(&self) -> ScxExitKind {
        self.info.get().map_or(ScxExitKind::None, |info| info.kind)
    }
}

/// What the control program learns about the exit.
#[derive(Debug, Default, Clone)]
pub struct UserExitInfo {
    /// `ScxExitKind::None` means the policy is still running.
    pub kind: ScxExitKind,
    pub exit_code: u64,
    pub reason: Option<String>,
    pub msg: Option<String>,
    pub dump: Option<String>,
}

impl UserExitInfo {
    pub fn new(info: Option<&ExitInfo>) -> Self {
        let Some(info) = info else {
            return Self::default();
        };
        let nonempty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Self {
            kind: info.kind,
            exit_code: info.exit_code,
            reason: nonempty(&info.reason),
            msg: nonempty(&info.msg),
            dump: info.dump.clone(),
        }
    }

    pub fn exited(&self) -> bool {
        self.kind != ScxExitKind::None
    }

    /// Print a normal exit and return `Ok`. Error exits become `Err`.
    pub fn report(&self) -> Result<()> {
        if self.kind == ScxExitKind::None {
            return Ok(());
        }

        if let Some(dump) = &self.dump {
            eprintln!("\nDEBUG DUMP");
            eprintln!("================================================================================\n");
            eprintln!("{}", dump);
            eprintln!("================================================================================\n");
        }

        let why = match (&self.reason, &self.msg) {
            (Some(reason), None) => format!("EXIT: {} [{}]", reason, self.kind),
            (Some(reason), Some(msg)) => format!("EXIT: {} ({}) [{}]", reason, msg, self.kind),
            _ => "<UNKNOWN>".into(),
        };

        if self.kind.is_error() {
            bail!("{}", why)
        } else {
            eprintln!("{}", why);
            Ok(())
        }
    }

    /// The policy asked to be restarted through its exit code.
    pub fn should_restart(&self) -> bool {
        self.kind == ScxExitKind::Done && self.exit_code & SCX_ECODE_ACT_RESTART != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_writer_wins() {
        let cell = ExitCell::new();
        assert!(!cell.is_set());
        assert!(cell.set(ExitInfo::new(ScxExitKind::ErrorStall, "stalled", 10)));
        assert!(!cell.set(ExitInfo::new(ScxExitKind::Unreg, "", 20)));
        assert_eq!(cell.kind(), ScxExitKind::ErrorStall);
        assert_eq!(cell.get().unwrap().msg, "stalled");
    }

    #[test]
    fn report_distinguishes_normal_and_error_exits() {
        let normal = UserExitInfo::new(Some(&ExitInfo::new(ScxExitKind::Unreg, "", 0)));
        assert!(normal.exited());
        assert!(normal.report().is_ok());

        let err = UserExitInfo::new(Some(&ExitInfo::new(ScxExitKind::ErrorBpf, "boom", 0)));
        let msg = format!("{}", err.report().unwrap_err());
        assert!(msg.contains("boom"), "{msg}");
        assert!(msg.contains("[error]"), "{msg}");

        assert!(!UserExitInfo::new(None).exited());
        assert!(UserExitInfo::new(None).report().is_ok());
    }

    #[test]
    fn exit_types() {
        assert_eq!(ScxExitKind::ErrorStall.exit_type(), "stall");
        assert_eq!(ScxExitKind::Error.exit_type(), "error");
        assert_eq!(ScxExitKind::Done.exit_type(), "normal");
        assert!(ScxExitKind::ErrorBpf.is_error());
        assert!(!ScxExitKind::SysRq.is_error());
    }

    #[test]
    fn restart_request() {
        let mut info = ExitInfo::new(ScxExitKind::Done, "restart", 0);
        info.exit_code = SCX_ECODE_ACT_RESTART | 1;
        assert!(UserExitInfo::new(Some(&info)).should_restart());
        info.exit_code = 1;
        assert!(!UserExitInfo::new(Some(&info)).should_restart());
    }
}
