// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Rusty load balancer
//!
//! The module that includes logic for performing load balancing in the
//! scx_rusty scheduler.
//!
//! Load Balancing
//! --------------
//!
//! scx_rusty performs load balancing using the following general workflow:
//!
//! 1. Read the load average of every domain from the policy. When the host
//!    is fully utilized the load is weighted by task weight, otherwise the
//!    plain sum of the duty cycles of the domain's tasks is used.
//!
//! 2. Build a hierarchy of NUMA nodes and domains. Each entity is sorted
//!    into push, pull or balanced depending on how far its load is from the
//!    average of its level:
//!
//! ```text
//!                         o-------------------------------o
//!                         |            LB Root            |
//!                         | PushNodes / PullNodes /       |
//!                         | BalancedNodes                 |
//!                         o---------------o---------------o
//!                                         |
//!                    o--------------------o--------------------o
//!                    |                                         |
//!    o---------------o--------------o         o----------------o--------------o
//!    |         NumaNode 0           |   ...   |          NumaNode N           |
//!    | PushDomains / PullDomains /  |         | PushDomains / PullDomains /   |
//!    | BalancedDomains, LoadSum,    |         | BalancedDomains, LoadSum,     |
//!    | LoadAvg, LoadImbal           |         | LoadAvg, LoadImbal            |
//!    o---------------o--------------o         o-------------------------------o
//!                    |
//!    o---------------o--------------o
//!    |           Domain             |
//!    | Tasks <Load, Task>, LoadSum, |
//!    | LoadAvg, LoadImbal           |
//!    o------------------------------o
//! ```
//!
//! 3. Migrate load from push nodes to pull nodes. Migrations between nodes
//!    need a larger imbalance than migrations inside a node.
//!
//! 4. Within every node, migrate load from push domains to pull domains.
//!
//! A migration moves one task: the candidate whose load is closest to the
//! amount that should be transferred between the two domains. Candidates
//! are the tasks that recently ran in the pushing domain and are allowed to
//! run in the pulling one. The policy applies the migration the next time
//! the task is enqueued.
//!
//! The load hierarchy is always created when load_balance() is called on a
//! LoadBalancer object, but migrations are only requested if balancing is
//! enabled.

use core::cmp::Ordering;

use crate::RustyOps;
use crate::LB_MAX_WEIGHT;

use std::cell::Cell;
use std::fmt;

use anyhow::bail;
use anyhow::Result;
use log::debug;
use log::warn;
use ordered_float::OrderedFloat;
use scx_core::Pid;
use scx_core::TimeNs;
use sorted_vec::SortedVec;

#[derive(Clone, Copy, Debug, PartialEq)]
enum BalanceState {
    Balanced,
    NeedsPush,
    NeedsPull,
}

impl fmt::Display for BalanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BalanceState::Balanced => write!(f, "BALANCED"),
            BalanceState::NeedsPush => write!(f, "OVER-LOADED"),
            BalanceState::NeedsPull => write!(f, "UNDER-LOADED"),
        }
    }
}

macro_rules! impl_ord_for_type {
    ($($t:ty),*) => {
        $(
            impl PartialEq for $t {
                fn eq(&self, other: &Self) -> bool {
                    <dyn LoadOrdered>::eq(self, other)
                }
            }

            impl Eq for $t {}

            impl PartialOrd for $t {
                fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                    Some(self.cmp(other))
                }
            }

            impl Ord for $t {
                fn cmp(&self, other: &Self) -> Ordering {
                    <dyn LoadOrdered>::cmp(self, other)
                }
            }
        )*
    };
}

trait LoadOrdered {
    fn get_load(&self) -> OrderedFloat<f64>;
}

impl dyn LoadOrdered {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.get_load().eq(&other.get_load())
    }

    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        self.get_load().cmp(&other.get_load())
    }
}

#[derive(Debug, Clone)]
pub struct LoadEntity {
    cost_ratio: f64,
    push_max_ratio: f64,
    xfer_ratio: f64,
    load_sum: OrderedFloat<f64>,
    load_avg: f64,
    load_delta: f64,
    bal_state: BalanceState,
}

impl LoadEntity {
    fn new(
        cost_ratio: f64,
        push_max_ratio: f64,
        xfer_ratio: f64,
        load_sum: f64,
        load_avg: f64,
    ) -> Self {
        let mut entity = Self {
            cost_ratio,
            push_max_ratio,
            xfer_ratio,
            load_sum: OrderedFloat(load_sum),
            load_avg,
            load_delta: 0.0f64,
            bal_state: BalanceState::Balanced,
        };
        entity.add_load(0.0f64);
        entity
    }

    pub fn load_sum(&self) -> f64 {
        *self.load_sum
    }

    pub fn load_avg(&self) -> f64 {
        self.load_avg
    }

    pub fn imbal(&self) -> f64 {
        self.load_sum() - self.load_avg
    }

    pub fn delta(&self) -> f64 {
        self.load_delta
    }

    fn state(&self) -> BalanceState {
        self.bal_state
    }

    fn rebalance(&mut self, new_load: f64) {
        self.load_sum = OrderedFloat(new_load);

        let imbal = self.imbal();
        let needs_balance = imbal.abs() > self.load_avg * self.cost_ratio;

        self.bal_state = if needs_balance {
            if imbal > 0f64 {
                BalanceState::NeedsPush
            } else {
                BalanceState::NeedsPull
            }
        } else {
            BalanceState::Balanced
        };
    }

    fn add_load(&mut self, delta: f64) {
        self.rebalance(self.load_sum() + delta);
        self.load_delta += delta;
    }

    fn push_cutoff(&self) -> f64 {
        self.imbal().abs() * self.push_max_ratio
    }

    fn xfer_between(&self, other: &LoadEntity) -> f64 {
        self.imbal().min(other.imbal()).abs() * self.xfer_ratio
    }
}

#[derive(Debug)]
struct TaskInfo {
    pid: Pid,
    load: OrderedFloat<f64>,
    dom_mask: u64,
    migrated: Cell<bool>,
    is_kworker: bool,
}

impl LoadOrdered for TaskInfo {
    fn get_load(&self) -> OrderedFloat<f64> {
        self.load
    }
}
impl_ord_for_type!(TaskInfo);

struct Domain {
    id: usize,
    queried_tasks: bool,
    load: LoadEntity,
    tasks: SortedVec<TaskInfo>,
}

impl Domain {
    const LOAD_IMBAL_HIGH_RATIO: f64 = 0.05;
    const LOAD_IMBAL_XFER_TARGET_RATIO: f64 = 0.50;
    const LOAD_IMBAL_PUSH_MAX_RATIO: f64 = 0.50;

    fn new(id: usize, load_sum: f64, load_avg: f64) -> Self {
        Self {
            id,
            queried_tasks: false,
            load: LoadEntity::new(
                Domain::LOAD_IMBAL_HIGH_RATIO,
                Domain::LOAD_IMBAL_PUSH_MAX_RATIO,
                Domain::LOAD_IMBAL_XFER_TARGET_RATIO,
                load_sum,
                load_avg,
            ),
            tasks: SortedVec::new(),
        }
    }

    fn transfer_load(&mut self, load: f64, pid: Pid, other: &mut Domain, ops: &RustyOps) -> bool {
        // Ask the policy to execute the migration.
        let requested = match ops.lb_migrate(pid, other.id) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to request migration for pid={} error={:?}", pid, &e);
                false
            }
        };

        self.load.add_load(-load);
        other.load.add_load(load);

        debug!(
            "  DOM {} sending [pid: {:05}](load: {:.06}) --> DOM {} ",
            self.id, pid, load, other.id
        );
        requested
    }

    fn xfer_between(&self, other: &Domain) -> f64 {
        self.load.xfer_between(&other.load)
    }
}

impl LoadOrdered for Domain {
    fn get_load(&self) -> OrderedFloat<f64> {
        self.load.load_sum
    }
}
impl_ord_for_type!(Domain);

struct NumaNode {
    id: usize,
    load: LoadEntity,
    push_domains: SortedVec<Domain>,
    pull_domains: SortedVec<Domain>,
    balanced_domains: Vec<Domain>,
}

impl NumaNode {
    const LOAD_IMBAL_HIGH_RATIO: f64 = 0.17;
    const LOAD_IMBAL_XFER_TARGET_RATIO: f64 = 0.50;
    const LOAD_IMBAL_PUSH_MAX_RATIO: f64 = 0.50;

    fn new(id: usize, numa_load_avg: f64) -> Self {
        Self {
            id,
            load: LoadEntity::new(
                NumaNode::LOAD_IMBAL_HIGH_RATIO,
                NumaNode::LOAD_IMBAL_PUSH_MAX_RATIO,
                NumaNode::LOAD_IMBAL_XFER_TARGET_RATIO,
                0.0f64,
                numa_load_avg,
            ),
            push_domains: SortedVec::new(),
            pull_domains: SortedVec::new(),
            balanced_domains: Vec::new(),
        }
    }

    fn allocate_domain(&mut self, id: usize, load: f64, dom_load_avg: f64) {
        let domain = Domain::new(id, load, dom_load_avg);

        self.insert_domain(domain);
        self.load.rebalance(self.load.load_sum() + load);
    }

    fn xfer_between(&self, other: &NumaNode) -> f64 {
        self.load.xfer_between(&other.load)
    }

    fn insert_domain(&mut self, domain: Domain) {
        match domain.load.state() {
            BalanceState::Balanced => {
                self.balanced_domains.push(domain);
            }
            BalanceState::NeedsPush => {
                self.push_domains.insert(domain);
            }
            BalanceState::NeedsPull => {
                self.pull_domains.insert(domain);
            }
        }
    }

    fn update_load(&mut self, delta: f64) {
        self.load.add_load(delta);
    }

    fn numa_stat(&self) -> NumaStat {
        let mut domains: Vec<DomainStat> = self
            .push_domains
            .iter()
            .chain(self.pull_domains.iter())
            .chain(self.balanced_domains.iter())
            .map(|dom| DomainStat {
                id: dom.id,
                load: dom.load.clone(),
            })
            .collect();
        domains.sort_by_key(|dom| dom.id);

        NumaStat {
            id: self.id,
            load: self.load.clone(),
            domains,
        }
    }
}

impl LoadOrdered for NumaNode {
    fn get_load(&self) -> OrderedFloat<f64> {
        self.load.load_sum
    }
}
impl_ord_for_type!(NumaNode);

pub struct DomainStat {
    pub id: usize,
    pub load: LoadEntity,
}

fn fmt_balance_stat(f: &mut fmt::Formatter<'_>, load: &LoadEntity, preamble: String) -> fmt::Result {
    let imbal = load.imbal();
    let load_sum = load.load_sum();
    let load_delta = load.delta();
    let get_fmt = |num: f64| {
        if num >= 0.0f64 {
            format!("{:+4.2}", num)
        } else {
            format!("{:4.2}", num)
        }
    };

    write!(
        f,
        "{} load={:4.2} imbal={} load_delta={}",
        preamble,
        load_sum,
        get_fmt(imbal),
        get_fmt(load_delta)
    )
}

impl fmt::Display for DomainStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_balance_stat(f, &self.load, format!("  DOMAIN[{:02}]", self.id))
    }
}

pub struct NumaStat {
    pub id: usize,
    pub load: LoadEntity,
    pub domains: Vec<DomainStat>,
}

impl fmt::Display for NumaStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_balance_stat(f, &self.load, format!("NODE[{:02}]", self.id))
    }
}

pub struct LoadBalancer<'a> {
    ops: &'a RustyOps,
    now: TimeNs,
    skip_kworkers: bool,

    infeas_threshold: f64,

    push_nodes: SortedVec<NumaNode>,
    pull_nodes: SortedVec<NumaNode>,
    balanced_nodes: Vec<NumaNode>,

    lb_apply_weight: bool,
    balance_load: bool,

    nr_lb_data_errors: u64,
}

impl<'a> LoadBalancer<'a> {
    pub fn new(
        ops: &'a RustyOps,
        now: TimeNs,
        skip_kworkers: bool,
        lb_apply_weight: bool,
        balance_load: bool,
    ) -> Self {
        Self {
            ops,
            now,
            skip_kworkers,

            infeas_threshold: LB_MAX_WEIGHT as f64,

            push_nodes: SortedVec::new(),
            pull_nodes: SortedVec::new(),
            balanced_nodes: Vec::new(),

            lb_apply_weight,
            balance_load,

            nr_lb_data_errors: 0,
        }
    }

    /// Number of migrations the policy refused during this round.
    pub fn nr_lb_data_errors(&self) -> u64 {
        self.nr_lb_data_errors
    }

    /// Perform load balancing calculations. When load balancing is enabled,
    /// also perform rebalances between NUMA nodes (when running on a
    /// multi-node host) and domains.
    pub fn load_balance(&mut self) -> Result<()> {
        self.create_domain_hierarchy()?;

        if self.balance_load {
            self.perform_balancing()?
        }

        Ok(())
    }

    pub fn get_stats(&self) -> Vec<NumaStat> {
        let mut numa_stats: Vec<NumaStat> = self
            .push_nodes
            .iter()
            .chain(self.pull_nodes.iter())
            .chain(self.balanced_nodes.iter())
            .map(|node| node.numa_stat())
            .collect();
        numa_stats.sort_by_key(|node| node.id);
        numa_stats
    }

    fn create_domain_hierarchy(&mut self) -> Result<()> {
        let dom_group = self.ops.dom_group().clone();
        let nr_doms = dom_group.nr_doms();

        let dom_loads: Vec<f64> = (0..nr_doms)
            .map(|dom_id| {
                if self.lb_apply_weight {
                    self.ops.dom_load(dom_id, self.now)
                } else {
                    self.ops.dom_dcycle(dom_id, self.now)
                }
            })
            .collect();
        let total_load: f64 = dom_loads.iter().sum();

        let num_numa_nodes = dom_group.nr_nodes();
        let numa_load_avg = total_load / num_numa_nodes as f64;

        let mut nodes: Vec<NumaNode> = (0..num_numa_nodes)
            .map(|id| NumaNode::new(id, numa_load_avg))
            .collect();

        let dom_load_avg = total_load / nr_doms as f64;
        for (dom_id, load) in dom_loads.iter().enumerate() {
            let numa_id = match dom_group.dom_numa_id(dom_id) {
                Some(id) if id < num_numa_nodes => id,
                id => bail!("NUMA ID {:?} of domain {} exceeds maximum {}", id, dom_id, num_numa_nodes),
            };

            nodes[numa_id].allocate_domain(dom_id, *load, dom_load_avg);
        }

        for node in nodes.into_iter() {
            self.insert_node(node);
        }

        Ok(())
    }

    fn insert_node(&mut self, node: NumaNode) {
        match node.load.state() {
            BalanceState::Balanced => {
                self.balanced_nodes.push(node);
            }
            BalanceState::NeedsPush => {
                self.push_nodes.insert(node);
            }
            BalanceState::NeedsPull => {
                self.pull_nodes.insert(node);
            }
        }
    }

    /// @dom needs to push out tasks to balance loads. Make sure its
    /// tasks are populated so that the victim tasks can be picked.
    fn populate_tasks_by_load(&mut self, dom: &mut Domain) {
        if dom.queried_tasks {
            return;
        }
        dom.queried_tasks = true;

        let mut pids = self.ops.read_active_pids(dom.id);
        pids.sort();
        pids.dedup();

        for pid in pids.into_iter() {
            let Some(task) = self.ops.task_load(pid, self.now) else {
                continue;
            };
            if task.dom_id != dom.id {
                continue;
            }

            let load = if self.lb_apply_weight {
                (task.weight as f64).min(self.infeas_threshold) * task.dcycle
            } else {
                task.dcycle
            };

            dom.tasks.insert(TaskInfo {
                pid,
                load: OrderedFloat(load),
                dom_mask: task.dom_mask,
                migrated: Cell::new(false),
                is_kworker: task.is_kworker,
            });
        }
    }

    // Find the first candidate pid which hasn't already been migrated and
    // can run in @pull_dom.
    fn find_first_candidate<'d, I>(
        tasks_by_load: I,
        pull_dom: usize,
        skip_kworkers: bool,
    ) -> Option<&'d TaskInfo>
    where
        I: IntoIterator<Item = &'d TaskInfo>,
    {
        tasks_by_load.into_iter().find(|task| {
            !task.migrated.get()
                && (task.dom_mask & (1u64 << pull_dom) != 0)
                && !(skip_kworkers && task.is_kworker)
        })
    }

    /// Try to find a task in @push_dom to be moved into @pull_dom. If a task is
    /// found, move the task between the domains, and return the amount of load
    /// transferred between the two.
    fn try_find_move_task(
        &mut self,
        (push_dom, to_push): (&mut Domain, f64),
        (pull_dom, to_pull): (&mut Domain, f64),
        to_xfer: f64,
    ) -> Result<Option<f64>> {
        let to_pull = to_pull.abs();
        let calc_new_imbal = |xfer: f64| (to_push - xfer).abs() + (to_pull - xfer).abs();

        self.populate_tasks_by_load(push_dom);

        // We want to pick a task to transfer from push_dom to pull_dom to
        // reduce the load imbalance between the two closest to $to_xfer.
        // IOW, pick a task which has the closest load value to $to_xfer
        // that can be migrated. Find such task by locating the first
        // migratable task while scanning left from $to_xfer and the
        // counterpart while scanning right and picking the better of the
        // two.
        let tasks = std::mem::take(&mut push_dom.tasks).into_vec();
        let (task, new_imbal) = match (
            Self::find_first_candidate(
                tasks
                    .as_slice()
                    .iter()
                    .filter(|x| x.load <= OrderedFloat(to_xfer))
                    .rev(),
                pull_dom.id,
                self.skip_kworkers,
            ),
            Self::find_first_candidate(
                tasks
                    .as_slice()
                    .iter()
                    .filter(|x| x.load >= OrderedFloat(to_xfer)),
                pull_dom.id,
                self.skip_kworkers,
            ),
        ) {
            (None, None) => {
                push_dom.tasks = SortedVec::from_unsorted(tasks);
                return Ok(None);
            }
            (Some(task), None) | (None, Some(task)) => (task, calc_new_imbal(*task.load)),
            (Some(task0), Some(task1)) => {
                let (new_imbal0, new_imbal1) =
                    (calc_new_imbal(*task0.load), calc_new_imbal(*task1.load));
                if new_imbal0 <= new_imbal1 {
                    (task0, new_imbal0)
                } else {
                    (task1, new_imbal1)
                }
            }
        };

        // If the best candidate can't reduce the imbalance, there's nothing
        // to do for this pair.
        let old_imbal = to_push + to_pull;
        if old_imbal < new_imbal {
            push_dom.tasks = SortedVec::from_unsorted(tasks);
            return Ok(None);
        }

        let load = *(task.load);
        let pid = task.pid;
        task.migrated.set(true);
        push_dom.tasks = SortedVec::from_unsorted(tasks);

        if !push_dom.transfer_load(load, pid, pull_dom, self.ops) {
            self.nr_lb_data_errors += 1;
        }
        Ok(Some(load))
    }

    fn transfer_between_nodes(
        &mut self,
        push_node: &mut NumaNode,
        pull_node: &mut NumaNode,
    ) -> Result<f64> {
        let n_push_doms = push_node.push_domains.len();
        let n_pull_doms = pull_node.pull_domains.len();
        debug!(
            "Inter node {} -> {} started ({} push domains -> {} pull domains)",
            push_node.id, pull_node.id, n_push_doms, n_pull_doms
        );

        if n_push_doms == 0 || n_pull_doms == 0 {
            return Ok(0.0f64);
        }

        let push_imbal = push_node.load.imbal();
        let pull_imbal = pull_node.load.imbal();
        let xfer = push_node.xfer_between(pull_node);

        let mut delta = 0.0f64;
        let mut push_doms = std::mem::take(&mut push_node.push_domains).into_vec();
        for push_dom in push_doms.iter_mut().rev() {
            let mut pull_doms = std::mem::take(&mut pull_node.pull_domains).into_vec();
            for pull_dom in pull_doms.iter_mut() {
                if let Some(transferred) =
                    self.try_find_move_task((push_dom, push_imbal), (pull_dom, pull_imbal), xfer)?
                {
                    delta = transferred;
                    pull_node.update_load(delta);
                    break;
                }
            }
            pull_node.pull_domains = SortedVec::from_unsorted(pull_doms);
            if delta > 0.0f64 {
                push_node.update_load(-delta);
                break;
            }
        }
        push_node.push_domains = SortedVec::from_unsorted(push_doms);

        Ok(delta)
    }

    fn balance_between_nodes(&mut self) -> Result<()> {
        let n_push_nodes = self.push_nodes.len();
        let n_pull_nodes = self.pull_nodes.len();

        debug!(
            "Node <-> Node LB started ({} pushers -> {} pullers)",
            n_push_nodes, n_pull_nodes
        );

        if n_push_nodes == 0 || n_pull_nodes == 0 {
            return Ok(());
        }

        let mut push_nodes = std::mem::take(&mut self.push_nodes).into_vec();

        // Push from the most imbalanced to least.
        for push_node in push_nodes.iter_mut().rev() {
            let push_cutoff = push_node.load.push_cutoff();
            let mut pushed = 0f64;

            if push_node.load.imbal() < 0.0f64 {
                bail!(
                    "Push node {} had imbal {}",
                    push_node.id,
                    push_node.load.imbal()
                );
            }

            // Always try to send load to the nodes that need it most, in
            // descending order.
            loop {
                let mut transfer_occurred = false;
                let mut pull_nodes = std::mem::take(&mut self.pull_nodes).into_vec();

                for pull_node in pull_nodes.iter_mut() {
                    if pull_node.load.imbal() >= 0.0f64 {
                        continue;
                    }
                    let migrated = self.transfer_between_nodes(push_node, pull_node)?;
                    if migrated > 0.0f64 {
                        // Break after a successful migration so that the
                        // pulling nodes are re-sorted before the next
                        // attempt.
                        pushed += migrated;
                        transfer_occurred = true;
                        debug!(
                            "NODE {} sending {:.06} --> NODE {}",
                            push_node.id, migrated, pull_node.id
                        );
                        break;
                    }
                }
                self.pull_nodes = SortedVec::from_unsorted(pull_nodes);

                if !transfer_occurred || pushed >= push_cutoff {
                    break;
                }
            }

            if pushed > 0.0f64 {
                debug!("NODE {} pushed {:.06} total load", push_node.id, pushed);
            }
        }
        self.push_nodes = SortedVec::from_unsorted(push_nodes);

        Ok(())
    }

    fn balance_within_node(&mut self, node: &mut NumaNode) -> Result<()> {
        let n_push_doms = node.push_domains.len();
        let n_pull_doms = node.pull_domains.len();

        debug!(
            "Intra node {} LB started ({} push domains -> {} pull domains)",
            node.id, n_push_doms, n_pull_doms
        );

        if n_push_doms == 0 || n_pull_doms == 0 {
            return Ok(());
        }

        let mut push_doms = std::mem::take(&mut node.push_domains).into_vec();
        for push_dom in push_doms
            .iter_mut()
            .filter(|x| x.load.state() == BalanceState::NeedsPush)
            .rev()
        {
            let push_cutoff = push_dom.load.push_cutoff();
            let mut load = 0.0f64;
            if push_dom.load.imbal() < 0.0f64 {
                bail!(
                    "Push dom {} had imbal {}",
                    push_dom.id,
                    push_dom.load.imbal()
                );
            }

            loop {
                let mut did_transfer = false;
                let mut pull_doms = std::mem::take(&mut node.pull_domains).into_vec();
                for pull_dom in pull_doms
                    .iter_mut()
                    .filter(|x| x.load.state() == BalanceState::NeedsPull)
                {
                    let push_imbal = push_dom.load.imbal();
                    let pull_imbal = pull_dom.load.imbal();
                    let xfer = push_dom.xfer_between(pull_dom);
                    if let Some(transferred) = self.try_find_move_task(
                        (push_dom, push_imbal),
                        (pull_dom, pull_imbal),
                        xfer,
                    )? {
                        if transferred > 0.0f64 {
                            load += transferred;
                            did_transfer = true;
                        }
                    }
                }
                node.pull_domains = SortedVec::from_unsorted(pull_doms);

                if !did_transfer || load >= push_cutoff {
                    break;
                }
            }
            if load > 0.0f64 {
                debug!("DOM {} pushed {:.06} total load", push_dom.id, load);
            }
        }
        node.push_domains = SortedVec::from_unsorted(push_doms);

        Ok(())
    }

    fn perform_balancing(&mut self) -> Result<()> {
        self.ops.clear_lb_migrations();

        // First balance load between the NUMA nodes. Balancing here has a
        // higher cost function than balancing between domains inside of NUMA
        // nodes, but the mechanics are the same. Adjustments made here are
        // reflected in intra-node balancing decisions made next.
        if self.ops.dom_group().nr_nodes() > 1 {
            self.balance_between_nodes()?;
        }

        // Now that the NUMA nodes have been balanced, do another balance round
        // amongst the domains in each node.
        debug!("Intra node LBs started");

        // Assume all nodes are now balanced.
        self.balanced_nodes
            .append(&mut std::mem::take(&mut self.push_nodes).into_vec());
        self.balanced_nodes
            .append(&mut std::mem::take(&mut self.pull_nodes).into_vec());

        let mut bal_nodes = std::mem::take(&mut self.balanced_nodes);
        for node in bal_nodes.iter_mut() {
            self.balance_within_node(node)?;
        }
        self.balanced_nodes = bal_nodes;

        Ok(())
    }
}
