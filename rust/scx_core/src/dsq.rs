// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Dispatch queues.
//!
//! A DSQ is either FIFO or vtime-ordered for as long as it holds tasks;
//! inserting in the other order is an error. GLOBAL always exists, custom
//! DSQs are created and destroyed by the policy, and every DSQ has its own
//! lock so CPUs consuming from different queues never contend.

use crate::task::TaskRef;
use crate::types::CpuId;
use crate::types::DsqId;
use crate::types::Pid;
use crate::types::Vtime;
use crate::util::lock;
use crate::util::read;
use crate::util::write;
use crossbeam::queue::ArrayQueue;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DsqMode {
    Empty,
    Fifo,
    Priq,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DsqError {
    NotFound(DsqId),
    Exists(DsqId),
    Builtin(DsqId),
    /// Bounded DSQ at capacity.
    Full(DsqId),
    /// FIFO insertion into a vtime DSQ or the reverse.
    MixedOrder(DsqId),
}

impl fmt::Display for DsqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DsqError::NotFound(id) => write!(f, "non-existent DSQ {id}"),
            DsqError::Exists(id) => write!(f, "DSQ {id} already exists"),
            DsqError::Builtin(id) => write!(f, "DSQ {id} is built-in"),
            DsqError::Full(id) => write!(f, "DSQ {id} is full"),
            DsqError::MixedOrder(id) => {
                write!(f, "cannot mix FIFO and vtime ordering on DSQ {id}")
            }
        }
    }
}

impl std::error::Error for DsqError {}

#[derive(Debug)]
pub struct Dsq {
    id: DsqId,
    capacity: Option<usize>,
    vtime_entries: BTreeMap<(Vtime, u64), TaskRef>,
    fifo_entries: VecDeque<TaskRef>,
    seq: u64,
    mode: DsqMode,
}

impl Dsq {
    pub fn new(id: DsqId, capacity: Option<usize>) -> Self {
        Dsq {
            id,
            capacity,
            vtime_entries: BTreeMap::new(),
            fifo_entries: VecDeque::new(),
            seq: 0,
            mode: DsqMode::Empty,
        }
    }

    pub fn id(&self) -> DsqId {
        self.id
    }

    fn check_room(&self) -> Result<(), DsqError> {
        match self.capacity {
            Some(cap) if self.len() >= cap => Err(DsqError::Full(self.id)),
            _ => Ok(()),
        }
    }

    pub fn insert(&mut self, task: TaskRef, head: bool) -> Result<(), DsqError> {
        if self.mode == DsqMode::Priq {
            return Err(DsqError::MixedOrder(self.id));
        }
        self.check_room()?;
        self.mode = DsqMode::Fifo;
        if head {
            self.fifo_entries.push_front(task);
        } else {
            self.fifo_entries.push_back(task);
        }
        Ok(())
    }

    pub fn insert_vtime(&mut self, task: TaskRef, vtime: u64) -> Result<(), DsqError> {
        if self.id.is_builtin() {
            return Err(DsqError::Builtin(self.id));
        }
        if self.mode == DsqMode::Fifo {
            return Err(DsqError::MixedOrder(self.id));
        }
        self.check_room()?;
        self.mode = DsqMode::Priq;
        let seq = self.seq;
        self.seq += 1;
        self.vtime_entries.insert((Vtime(vtime), seq), task);
        Ok(())
    }

    /// Pop the first task, in queue order, accepted by `pred`.
    pub fn pop_first(&mut self, pred: impl Fn(&TaskRef) -> bool) -> Option<TaskRef> {
        let task = match self.mode {
            DsqMode::Priq => {
                let key = self
                    .vtime_entries
                    .iter()
                    .find(|(_, task)| pred(task))
                    .map(|(key, _)| *key)?;
                self.vtime_entries.remove(&key)
            }
            DsqMode::Fifo => {
                let pos = self.fifo_entries.iter().position(|task| pred(task))?;
                self.fifo_entries.remove(pos)
            }
            DsqMode::Empty => None,
        };
        if self.is_empty() {
            self.mode = DsqMode::Empty;
        }
        task
    }

    pub fn pop(&mut self) -> Option<TaskRef> {
        self.pop_first(|_| true)
    }

    pub fn remove(&mut self, pid: Pid) -> Option<TaskRef> {
        self.pop_first(|task| task.pid == pid)
    }

    pub fn len(&self) -> usize {
        self.vtime_entries.len() + self.fifo_entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vtime_entries.is_empty() && self.fifo_entries.is_empty()
    }

    /// All PIDs in dispatch order.
    pub fn pids(&self) -> Vec<Pid> {
        match self.mode {
            DsqMode::Priq => self.vtime_entries.values().map(|t| t.pid).collect(),
            DsqMode::Fifo => self.fifo_entries.iter().map(|t| t.pid).collect(),
            DsqMode::Empty => Vec::new(),
        }
    }

    pub fn drain(&mut self) -> Vec<TaskRef> {
        let mut tasks: Vec<TaskRef> = std::mem::take(&mut self.vtime_entries)
            .into_values()
            .collect();
        tasks.extend(self.fifo_entries.drain(..));
        self.mode = DsqMode::Empty;
        tasks
    }
}

/// GLOBAL plus the custom DSQs of the running policy. Per-CPU local DSQs
/// live in the run queues.
#[derive(Debug)]
pub struct DsqTable {
    dsqs: RwLock<HashMap<DsqId, Arc<Mutex<Dsq>>>>,
}

impl DsqTable {
    pub fn new() -> Self {
        let mut dsqs = HashMap::new();
        dsqs.insert(
            DsqId::GLOBAL,
            Arc::new(Mutex::new(Dsq::new(DsqId::GLOBAL, None))),
        );
        Self {
            dsqs: RwLock::new(dsqs),
        }
    }

    pub fn create(&self, id: DsqId, capacity: Option<usize>) -> Result<(), DsqError> {
        if id.is_builtin() {
            return Err(DsqError::Builtin(id));
        }
        let mut dsqs = write(&self.dsqs);
        if dsqs.contains_key(&id) {
            return Err(DsqError::Exists(id));
        }
        dsqs.insert(id, Arc::new(Mutex::new(Dsq::new(id, capacity))));
        Ok(())
    }

    /// Remove a custom DSQ and hand back whatever was still queued on it.
    pub fn destroy(&self, id: DsqId) -> Result<Vec<TaskRef>, DsqError> {
        if id.is_builtin() {
            return Err(DsqError::Builtin(id));
        }
        let dsq = write(&self.dsqs)
            .remove(&id)
            .ok_or(DsqError::NotFound(id))?;
        let tasks = lock(&dsq).drain();
        Ok(tasks)
    }

    fn get(&self, id: DsqId) -> Result<Arc<Mutex<Dsq>>, DsqError> {
        read(&self.dsqs).get(&id).cloned().ok_or(DsqError::NotFound(id))
    }

    pub fn exists(&self, id: DsqId) -> bool {
        read(&self.dsqs).contains_key(&id)
    }

    pub fn insert(&self, id: DsqId, task: TaskRef, head: bool) -> Result<(), DsqError> {
        lock(&*self.get(id)?).insert(task, head)
    }

    pub fn insert_vtime(&self, id: DsqId, task: TaskRef, vtime: u64) -> Result<(), DsqError> {
        lock(&*self.get(id)?).insert_vtime(task, vtime)
    }

    /// Pop the first task of `id` that may run on `cpu`.
    pub fn pop_for_cpu(&self, id: DsqId, cpu: CpuId) -> Result<Option<TaskRef>, DsqError> {
        let dsq = self.get(id)?;
        let task = lock(&dsq).pop_first(|task| task.cpus_allowed.has(cpu));
        Ok(task)
    }

    pub fn remove(&self, id: DsqId, pid: Pid) -> Option<TaskRef> {
        let dsq = self.get(id).ok()?;
        let task = lock(&dsq).remove(pid);
        task
    }

    pub fn nr_queued(&self, id: DsqId) -> Result<usize, DsqError> {
        Ok(lock(&*self.get(id)?).len())
    }

    pub fn pids(&self, id: DsqId) -> Result<Vec<Pid>, DsqError> {
        Ok(lock(&*self.get(id)?).pids())
    }

    pub fn ids(&self) -> Vec<DsqId> {
        let mut ids: Vec<DsqId> = read(&self.dsqs).keys().copied().collect();
        ids.sort();
        ids
    }

    /// Empty every DSQ and drop the custom ones.
    pub fn drain_all(&self) -> Vec<TaskRef> {
        let mut dsqs = write(&self.dsqs);
        let mut tasks = vec![];
        for dsq in dsqs.values() {
            tasks.extend(lock(dsq).drain());
        }
        dsqs.retain(|id, _| id.is_builtin());
        tasks
    }
}

impl Default for DsqTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-capacity FIFO shared between CPUs, the model of a BPF queue map.
/// A push into a full queue fails and hands the item back to the caller,
/// who decides where the overflow goes.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    ring: ArrayQueue<T>,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: ArrayQueue::new(capacity.max(1)),
        }
    }

    pub fn push(&self, item: T) -> Result<(), T> {
        self.ring.push(item)
    }

    pub fn pop(&self) -> Option<T> {
        self.ring.pop()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;
    use crate::task::TaskAttrs;

    fn task(pid: i32, cpus: Option<Vec<u32>>) -> TaskRef {
        let mut attrs = TaskAttrs::new(Pid(pid), "t");
        attrs.allowed_cpus = cpus;
        Arc::new(Task::new(&attrs, 4).unwrap())
    }

    #[test]
    fn fifo_and_head_insertion() {
        let mut dsq = Dsq::new(DsqId(1), None);
        dsq.insert(task(1, None), false).unwrap();
        dsq.insert(task(2, None), false).unwrap();
        dsq.insert(task(3, None), true).unwrap();
        assert_eq!(dsq.pids(), vec![Pid(3), Pid(1), Pid(2)]);
        assert_eq!(dsq.pop().map(|t| t.pid), Some(Pid(3)));
        assert_eq!(dsq.len(), 2);
    }

    #[test]
    fn vtime_order_with_fifo_tiebreak() {
        let mut dsq = Dsq::new(DsqId(1), None);
        dsq.insert_vtime(task(1, None), 30).unwrap();
        dsq.insert_vtime(task(2, None), 10).unwrap();
        dsq.insert_vtime(task(3, None), 10).unwrap();
        assert_eq!(dsq.pids(), vec![Pid(2), Pid(3), Pid(1)]);
    }

    #[test]
    fn mixing_orders_is_rejected() {
        let mut dsq = Dsq::new(DsqId(1), None);
        dsq.insert(task(1, None), false).unwrap();
        assert_eq!(
            dsq.insert_vtime(task(2, None), 5),
            Err(DsqError::MixedOrder(DsqId(1)))
        );
        dsq.pop();
        dsq.insert_vtime(task(2, None), 5).unwrap();

        let mut global = Dsq::new(DsqId::GLOBAL, None);
        assert_eq!(
            global.insert_vtime(task(3, None), 1),
            Err(DsqError::Builtin(DsqId::GLOBAL))
        );
    }

    #[test]
    fn bounded_dsq_reports_full() {
        let mut dsq = Dsq::new(DsqId(7), Some(1));
        dsq.insert(task(1, None), false).unwrap();
        assert_eq!(dsq.insert(task(2, None), false), Err(DsqError::Full(DsqId(7))));
    }

    #[test]
    fn pop_for_cpu_skips_disallowed_tasks() {
        let table = DsqTable::new();
        table.insert(DsqId::GLOBAL, task(1, Some(vec![0])), false).unwrap();
        table.insert(DsqId::GLOBAL, task(2, Some(vec![1])), false).unwrap();
        let t = table.pop_for_cpu(DsqId::GLOBAL, CpuId(1)).unwrap().unwrap();
        assert_eq!(t.pid, Pid(2));
        assert!(table.pop_for_cpu(DsqId::GLOBAL, CpuId(1)).unwrap().is_none());
        assert_eq!(table.nr_queued(DsqId::GLOBAL).unwrap(), 1);
    }

    #[test]
    fn table_create_destroy() {
        let table = DsqTable::new();
        table.create(DsqId(5), None).unwrap();
        assert_eq!(table.create(DsqId(5), None), Err(DsqError::Exists(DsqId(5))));
        assert_eq!(
            table.create(DsqId::GLOBAL, None),
            Err(DsqError::Builtin(DsqId::GLOBAL))
        );
        table.insert(DsqId(5), task(1, None), false).unwrap();
        assert_eq!(table.destroy(DsqId(5)).unwrap().len(), 1);
        assert!(!table.exists(DsqId(5)));
        assert_eq!(
            table.insert(DsqId(5), task(2, None), false),
            Err(DsqError::NotFound(DsqId(5)))
        );
        assert_eq!(table.ids(), vec![DsqId::GLOBAL]);
    }

    #[test]
    fn bounded_queue_hands_back_overflow() {
        let q = BoundedQueue::new(2);
        q.push(1).unwrap();
        q.push(2).unwrap();
        assert_eq!(q.push(3), Err(3));
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.len(), 1);
        assert_eq!(q.capacity(), 2);
    }
}
