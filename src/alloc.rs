//! Process-wide task allocator.
//!
//! Owns the canonical gtid → task map and hands out stable shared handles.
//! Thread-safe: admission on the default agent inserts while other agents
//! look tasks up.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::task::{Task, TaskRef};
use crate::types::Gtid;

#[derive(Default)]
pub struct TaskAllocator {
    tasks: Mutex<HashMap<Gtid, TaskRef>>,
}

impl TaskAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly created task. A duplicate gtid is a kernel
    /// contract breach.
    pub fn insert(&self, task: Task) -> TaskRef {
        let gtid = task.gtid;
        let task = Arc::new(Mutex::new(task));
        let prev = self.tasks.lock().unwrap().insert(gtid, task.clone());
        assert!(prev.is_none(), "duplicate task {gtid}");
        task
    }

    pub fn get(&self, gtid: Gtid) -> Option<TaskRef> {
        self.tasks.lock().unwrap().get(&gtid).cloned()
    }

    /// Drop a departed or dead task. Freeing an unknown gtid is fatal.
    pub fn free(&self, gtid: Gtid) {
        let prev = self.tasks.lock().unwrap().remove(&gtid);
        assert!(prev.is_some(), "free of unknown task {gtid}");
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().unwrap().is_empty()
    }

    /// Visit every live task in gtid order, each under its own lock.
    pub fn for_each(&self, mut f: impl FnMut(&Task)) {
        let tasks = self.tasks.lock().unwrap();
        let mut gtids: Vec<_> = tasks.keys().copied().collect();
        gtids.sort();
        for gtid in gtids {
            let task = tasks[&gtid].lock().unwrap();
            f(&task);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enclave::StatusWord;
    use crate::types::BarrierToken;

    struct NullStatusWord;

    impl StatusWord for NullStatusWord {
        fn on_cpu(&self) -> bool {
            false
        }

        fn barrier(&self) -> BarrierToken {
            BarrierToken(0)
        }
    }

    fn task(id: u64) -> Task {
        Task::new(Gtid(id), BarrierToken(0), Arc::new(NullStatusWord))
    }

    #[test]
    fn insert_get_free_roundtrip() {
        let alloc = TaskAllocator::new();
        alloc.insert(task(7));
        assert!(alloc.get(Gtid(7)).is_some());
        assert_eq!(alloc.len(), 1);

        alloc.free(Gtid(7));
        assert!(alloc.get(Gtid(7)).is_none());
        assert!(alloc.is_empty());
    }

    #[test]
    #[should_panic(expected = "duplicate task")]
    fn duplicate_insert_is_fatal() {
        let alloc = TaskAllocator::new();
        alloc.insert(task(7));
        alloc.insert(task(7));
    }

    #[test]
    #[should_panic(expected = "free of unknown task")]
    fn free_of_unknown_task_is_fatal() {
        let alloc = TaskAllocator::new();
        alloc.free(Gtid(9));
    }

    #[test]
    fn for_each_visits_in_gtid_order() {
        let alloc = TaskAllocator::new();
        for id in [3u64, 1, 2] {
            alloc.insert(task(id));
        }
        let mut seen = Vec::new();
        alloc.for_each(|t| seen.push(t.gtid));
        assert_eq!(seen, vec![Gtid(1), Gtid(2), Gtid(3)]);
    }
}
