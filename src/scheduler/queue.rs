use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::scheduler::task::Task;

/// Heap key. Removed or replaced tasks leave stale entries behind; an entry is
/// live only while its `seq` matches the index.
#[derive(Debug, PartialEq, Eq)]
struct Entry {
    priority: i32,
    created_at: Option<DateTime<Utc>>,
    seq: u64,
    id: String,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct Inner {
    heap: BinaryHeap<Reverse<Entry>>,
    index: HashMap<String, (u64, Task)>,
    next_seq: u64,
}

impl Inner {
    fn is_live(&self, entry: &Entry) -> bool {
        self.index
            .get(&entry.id)
            .is_some_and(|(seq, _)| *seq == entry.seq)
    }

    /// Drop stale entries sitting on top of the heap.
    fn settle(&mut self) {
        while let Some(Reverse(top)) = self.heap.peek() {
            if self.is_live(top) {
                break;
            }
            self.heap.pop();
        }
    }

    /// Rebuild the heap once stale entries dominate it.
    fn compact(&mut self) {
        if self.heap.len() <= 2 * self.index.len() + 64 {
            return;
        }
        let heap = std::mem::take(&mut self.heap);
        self.heap = heap
            .into_iter()
            .filter(|Reverse(entry)| self.is_live(entry))
            .collect();
    }
}

/// In-memory priority index over pending tasks.
///
/// Lower `priority` runs first, ties broken by `created_at` and then by arrival.
/// The durable store stays authoritative; this queue is rebuilt on restart.
#[derive(Debug, Default)]
pub struct TaskQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a task and wake the dispatcher. Returns false if the ID is already queued.
    pub fn push(&self, task: Task) -> bool {
        let inserted = self.insert(task);
        if inserted {
            self.notify.notify_one();
        }
        inserted
    }

    /// Insert a task without waking the dispatcher. Used for tasks that are not
    /// runnable yet, so the next tick picks them up instead.
    pub fn push_deferred(&self, task: Task) -> bool {
        self.insert(task)
    }

    fn insert(&self, task: Task) -> bool {
        let mut inner = self.lock();
        if inner.index.contains_key(&task.id) {
            return false;
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(Reverse(Entry {
            priority: task.priority,
            created_at: task.created_at,
            seq,
            id: task.id.clone(),
        }));
        inner.index.insert(task.id.clone(), (seq, task));
        true
    }

    /// Remove and return the highest-priority task.
    pub fn pop(&self) -> Option<Task> {
        let mut inner = self.lock();
        while let Some(Reverse(entry)) = inner.heap.pop() {
            if inner.is_live(&entry) {
                return inner.index.remove(&entry.id).map(|(_, task)| task);
            }
        }
        None
    }

    pub fn peek(&self) -> Option<Task> {
        let mut inner = self.lock();
        inner.settle();
        let Reverse(top) = inner.heap.peek()?;
        inner.index.get(&top.id).map(|(_, task)| task.clone())
    }

    /// Remove a task by ID. Returns true only for the call that actually removed it.
    pub fn remove(&self, id: &str) -> bool {
        let mut inner = self.lock();
        let removed = inner.index.remove(id).is_some();
        if removed {
            inner.compact();
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.lock().index.get(id).map(|(_, task)| task.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().index.is_empty()
    }

    /// Snapshot of queued tasks in pop order.
    pub fn list(&self) -> Vec<Task> {
        let inner = self.lock();
        let mut entries: Vec<_> = inner.index.values().collect();
        entries.sort_by(|(seq_a, a), (seq_b, b)| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| seq_a.cmp(seq_b))
        });
        entries.into_iter().map(|(_, task)| task.clone()).collect()
    }

    /// Wait until a push signals new work. Signals raised while nobody waits
    /// coalesce into a single pending wakeup.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}
