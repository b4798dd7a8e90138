// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::fs;
use std::io::Read;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use scx_core::task::Task;
use serde::Deserialize;
use serde::Serialize;

pub const MAX_LAYERS: usize = 16;
pub const MAX_LAYER_MATCH_ORS: usize = 32;
pub const NR_LAYER_MATCH_KINDS: usize = 8;
pub const MAX_PATH: usize = 4096;
pub const MAX_COMM: usize = 16;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerConfig {
    pub specs: Vec<LayerSpec>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LayerSpec {
    pub name: String,
    pub comment: Option<String>,
    pub matches: Vec<Vec<LayerMatch>>,
    pub kind: LayerKind,
}

impl LayerSpec {
    /// Parse a JSON array of layer specs. Input starting with "f:" or
    /// "file:" names a file to read the JSON from.
    pub fn parse(input: &str) -> Result<Vec<Self>> {
        let config: LayerConfig = match input
            .strip_prefix("f:")
            .or_else(|| input.strip_prefix("file:"))
        {
            Some(path) => {
                let mut f = fs::OpenOptions::new()
                    .read(true)
                    .open(path)
                    .with_context(|| format!("Failed to open {:?}", path))?;
                let mut content = String::new();
                f.read_to_string(&mut content)?;
                serde_json::from_str(&content)?
            }
            None => serde_json::from_str(input)?,
        };
        Ok(config.specs)
    }

    /// A task belongs to the layer if all conditions of any OR block match.
    pub fn matches_task(&self, task: &Task) -> bool {
        self.matches
            .iter()
            .any(|ands| ands.iter().all(|one| one.matches(task)))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LayerMatch {
    CgroupPrefix(String),
    CommPrefix(String),
    NiceAbove(i32),
    NiceBelow(i32),
    NiceEquals(i32),
    #[serde(alias = "PidEquals")]
    PIDEquals(u32),
    #[serde(alias = "TgidEquals")]
    TGIDEquals(u32),
    IsKthread(bool),
}

impl LayerMatch {
    pub fn matches(&self, task: &Task) -> bool {
        match self {
            LayerMatch::CgroupPrefix(prefix) => task.cgroup.starts_with(prefix.as_str()),
            LayerMatch::CommPrefix(prefix) => task.comm.starts_with(prefix.as_str()),
            LayerMatch::NiceAbove(nice) => task.nice > *nice,
            LayerMatch::NiceBelow(nice) => task.nice < *nice,
            LayerMatch::NiceEquals(nice) => task.nice == *nice,
            LayerMatch::PIDEquals(pid) => task.pid.0 as i64 == *pid as i64,
            LayerMatch::TGIDEquals(tgid) => task.tgid.0 as i64 == *tgid as i64,
            LayerMatch::IsKthread(kthread) => task.kworker == *kthread,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerCommon {
    #[serde(default)]
    pub min_exec_us: u64,
    #[serde(default)]
    pub slice_us: u64,
    #[serde(default)]
    pub preempt: bool,
    #[serde(default)]
    pub exclusive: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LayerKind {
    Confined {
        util_range: (f64, f64),
        #[serde(default)]
        cpus_range: Option<(usize, usize)>,

        #[serde(flatten)]
        common: LayerCommon,
    },
    Grouped {
        util_range: (f64, f64),
        #[serde(default)]
        cpus_range: Option<(usize, usize)>,

        #[serde(flatten)]
        common: LayerCommon,
    },
    Open {
        #[serde(flatten)]
        common: LayerCommon,
    },
}

impl LayerKind {
    pub fn common(&self) -> &LayerCommon {
        match self {
            LayerKind::Confined { common, .. }
            | LayerKind::Grouped { common, .. }
            | LayerKind::Open { common, .. } => common,
        }
    }

    /// Whether tasks of the layer may run on CPUs the layer doesn't own.
    pub fn is_open(&self) -> bool {
        !matches!(self, LayerKind::Confined { .. })
    }

    /// `(cpus_range, util_range)` of layers that get sized by user space.
    pub fn sizing(&self) -> Option<(Option<(usize, usize)>, (f64, f64))> {
        match self {
            LayerKind::Confined {
                cpus_range,
                util_range,
                ..
            }
            | LayerKind::Grouped {
                cpus_range,
                util_range,
                ..
            } => Some((*cpus_range, *util_range)),
            LayerKind::Open { .. } => None,
        }
    }
}

pub fn example_config() -> LayerConfig {
    LayerConfig {
        specs: vec![
            LayerSpec {
                name: "batch".into(),
                comment: Some("tasks under system.slice or tasks with nice value > 0".into()),
                matches: vec![
                    vec![LayerMatch::CgroupPrefix("/system.slice".into())],
                    vec![LayerMatch::NiceAbove(0)],
                ],
                kind: LayerKind::Confined {
                    cpus_range: Some((0, 16)),
                    util_range: (0.8, 0.9),
                    common: LayerCommon {
                        min_exec_us: 1000,
                        slice_us: 20000,
                        preempt: false,
                        exclusive: false,
                    },
                },
            },
            LayerSpec {
                name: "immediate".into(),
                comment: Some("tasks under workload.slice with nice value < 0".into()),
                matches: vec![vec![
                    LayerMatch::CgroupPrefix("/workload.slice/".into()),
                    LayerMatch::NiceBelow(0),
                ]],
                kind: LayerKind::Open {
                    common: LayerCommon {
                        min_exec_us: 100,
                        slice_us: 20000,
                        preempt: true,
                        exclusive: true,
                    },
                },
            },
            LayerSpec {
                name: "normal".into(),
                comment: Some("the rest".into()),
                matches: vec![vec![]],
                kind: LayerKind::Grouped {
                    cpus_range: None,
                    util_range: (0.5, 0.6),
                    common: LayerCommon {
                        min_exec_us: 200,
                        slice_us: 20000,
                        preempt: false,
                        exclusive: false,
                    },
                },
            },
        ],
    }
}

pub fn verify_layer_specs(specs: &[LayerSpec]) -> Result<()> {
    let nr_specs = specs.len();
    if nr_specs == 0 {
        bail!("No layer spec");
    }
    if nr_specs > MAX_LAYERS {
        bail!("Too many layer specs");
    }

    for (idx, spec) in specs.iter().enumerate() {
        if idx < nr_specs - 1 {
            if spec.matches.is_empty() {
                bail!("Non-terminal spec {:?} has NULL matches", spec.name);
            }
        } else if spec.matches.len() != 1 || !spec.matches[0].is_empty() {
            bail!("Terminal spec {:?} must have an empty match", spec.name);
        }

        if spec.matches.len() > MAX_LAYER_MATCH_ORS {
            bail!(
                "Spec {:?} has too many ({}) OR match blocks",
                spec.name,
                spec.matches.len()
            );
        }

        for (ands_idx, ands) in spec.matches.iter().enumerate() {
            if ands.len() > NR_LAYER_MATCH_KINDS {
                bail!(
                    "Spec {:?}'s {}th OR block has too many ({}) match conditions",
                    spec.name,
                    ands_idx,
                    ands.len()
                );
            }
            for one in ands.iter() {
                match one {
                    LayerMatch::CgroupPrefix(prefix) => {
                        if prefix.len() > MAX_PATH {
                            bail!("Spec {:?} has too long a cgroup prefix", spec.name);
                        }
                    }
                    LayerMatch::CommPrefix(prefix) => {
                        if prefix.len() > MAX_COMM {
                            bail!("Spec {:?} has too long a comm prefix", spec.name);
                        }
                    }
                    _ => {}
                }
            }
        }

        if let Some((cpus_range, util_range)) = spec.kind.sizing() {
            if let Some((cpus_min, cpus_max)) = cpus_range {
                if cpus_min > cpus_max {
                    bail!(
                        "Spec {:?} has invalid cpus_range({}, {})",
                        spec.name,
                        cpus_min,
                        cpus_max
                    );
                }
            }
            if util_range.0 >= util_range.1 {
                bail!(
                    "Spec {:?} has invalid util_range ({}, {})",
                    spec.name,
                    util_range.0,
                    util_range.1
                );
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use scx_core::Pid;
    use scx_core::TaskAttrs;

    fn task(pid: i32, comm: &str, cgroup: &str, nice: i32) -> Task {
        let mut attrs = TaskAttrs::new(Pid(pid), comm);
        attrs.cgroup = cgroup.into();
        attrs.nice = nice;
        Task::new(&attrs, 4).unwrap()
    }

    #[test]
    fn test_parse_inline_json() {
        let specs = LayerSpec::parse(
            r#"[
                {
                    "name": "hot",
                    "comment": null,
                    "matches": [[{"CommPrefix": "web"}, {"NiceBelow": 0}], [{"PidEquals": 7}]],
                    "kind": {"Open": {"preempt": true, "slice_us": 5000}}
                },
                {
                    "name": "rest",
                    "comment": null,
                    "matches": [[]],
                    "kind": {"Confined": {"util_range": [0.5, 0.7], "cpus_range": [1, 2]}}
                }
            ]"#,
        )
        .unwrap();

        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].matches[1], vec![LayerMatch::PIDEquals(7)]);
        assert!(specs[0].kind.common().preempt);
        assert_eq!(specs[0].kind.common().slice_us, 5000);
        assert_eq!(specs[0].kind.common().min_exec_us, 0);
        assert_eq!(
            specs[1].kind.sizing(),
            Some((Some((1, 2)), (0.5, 0.7)))
        );
        assert!(!specs[1].kind.is_open());
        verify_layer_specs(&specs).unwrap();
    }

    #[test]
    fn test_match_or_of_ands() {
        let spec = &example_config().specs[1];
        assert!(spec.matches_task(&task(1, "web-1", "/workload.slice/web", -3)));
        assert!(!spec.matches_task(&task(2, "web-2", "/workload.slice/web", 0)));
        assert!(!spec.matches_task(&task(3, "sys-3", "/system.slice", -3)));

        let batch = &example_config().specs[0];
        assert!(batch.matches_task(&task(4, "sys-4", "/system.slice", 0)));
        assert!(batch.matches_task(&task(5, "batch-5", "/workload.slice/batch", 5)));
        assert!(!batch.matches_task(&task(6, "web-6", "/workload.slice/web", 0)));
    }

    #[test]
    fn test_example_config_is_valid() {
        verify_layer_specs(&example_config().specs).unwrap();
    }

    #[test]
    fn test_verify_rejects_bad_specs() {
        assert!(verify_layer_specs(&[]).is_err());

        let mut specs = example_config().specs;
        specs[2].matches = vec![vec![LayerMatch::NiceAbove(0)]];
        assert!(verify_layer_specs(&specs).is_err());

        let mut specs = example_config().specs;
        specs[0].matches.clear();
        assert!(verify_layer_specs(&specs).is_err());

        let mut specs = example_config().specs;
        specs[0].matches = vec![vec![LayerMatch::CommPrefix("x".repeat(MAX_COMM + 1))]];
        assert!(verify_layer_specs(&specs).is_err());

        let mut specs = example_config().specs;
        if let LayerKind::Confined { util_range, .. } = &mut specs[0].kind {
            *util_range = (0.9, 0.8);
        }
        assert!(verify_layer_specs(&specs).is_err());

        let mut specs = example_config().specs;
        if let LayerKind::Confined { cpus_range, .. } = &mut specs[0].kind {
            *cpus_range = Some((4, 2));
        }
        assert!(verify_layer_specs(&specs).is_err());
    }
}
