//! Per-executor priority structure over runnable nodes (§4.5.1).
//!
//! Source nodes are ordered by the `SourceProcessOrder` their calculator
//! declared; non-source nodes by invocation timestamp, smaller first. The two
//! groups don't mix in practice (a node is either a source or it isn't, for
//! the lifetime of a run) but share one queue per executor so a single
//! worker pool can serve both.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;

use crate::handlers::Invocation;
use crate::timestamp::Timestamp;

/// One ready invocation, paired with the node it runs on.
#[derive(Clone)]
pub struct QueuedInvocation {
    pub node: usize,
    pub invocation: Invocation,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PriorityKey {
    /// `0` for source nodes, `1` for everything else; sources drain first
    /// since downstream nodes depend on the data they produce.
    group: u8,
    order: Timestamp,
    sequence: u64,
}

struct HeapEntry {
    key: PriorityKey,
    item: QueuedInvocation,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the smallest key pops first.
        other.key.cmp(&self.key)
    }
}

/// A single executor's ready-work queue.
#[derive(Default)]
pub struct SchedulerQueue {
    heap: Mutex<BinaryHeap<HeapEntry>>,
    next_sequence: AtomicU64,
}

impl SchedulerQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a source node's invocation, prioritized by its declared
    /// `SourceProcessOrder`.
    pub fn push_source(&self, node: usize, invocation: Invocation, source_process_order: i64) {
        self.push_with_key(node, invocation, 0, Timestamp::new(source_process_order));
    }

    /// Enqueues a non-source node's invocation, prioritized by timestamp.
    pub fn push_non_source(&self, node: usize, invocation: Invocation) {
        let ts = invocation.timestamp;
        self.push_with_key(node, invocation, 1, ts);
    }

    fn push_with_key(&self, node: usize, invocation: Invocation, group: u8, order: Timestamp) {
        let sequence = self.next_sequence.fetch_add(1, AtomicOrdering::SeqCst);
        let key = PriorityKey { group, order, sequence };
        self.heap.lock().unwrap().push(HeapEntry { key, item: QueuedInvocation { node, invocation } });
    }

    /// Pushes a source invocation and immediately pops the current
    /// highest-priority entry, atomically with respect to concurrent callers
    /// — so a burst of near-simultaneous `schedule` calls still competes on
    /// priority rather than degenerating into push-then-immediately-pop-self.
    pub fn push_source_and_dispatch(&self, node: usize, invocation: Invocation, source_process_order: i64) -> QueuedInvocation {
        self.push_and_dispatch(node, invocation, 0, Timestamp::new(source_process_order))
    }

    /// Non-source counterpart of [`Self::push_source_and_dispatch`].
    pub fn push_non_source_and_dispatch(&self, node: usize, invocation: Invocation) -> QueuedInvocation {
        let ts = invocation.timestamp;
        self.push_and_dispatch(node, invocation, 1, ts)
    }

    fn push_and_dispatch(&self, node: usize, invocation: Invocation, group: u8, order: Timestamp) -> QueuedInvocation {
        let sequence = self.next_sequence.fetch_add(1, AtomicOrdering::SeqCst);
        let key = PriorityKey { group, order, sequence };
        let mut heap = self.heap.lock().unwrap();
        heap.push(HeapEntry { key, item: QueuedInvocation { node, invocation } });
        heap.pop().expect("heap just received an entry").item
    }

    /// Removes and returns the highest-priority ready invocation, if any.
    pub fn pop(&self) -> Option<QueuedInvocation> {
        self.heap.lock().unwrap().pop().map(|e| e.item)
    }

    /// Whether the queue currently holds no work.
    pub fn is_empty(&self) -> bool {
        self.heap.lock().unwrap().is_empty()
    }

    /// The number of invocations currently queued.
    pub fn len(&self) -> usize {
        self.heap.lock().unwrap().len()
    }
}
