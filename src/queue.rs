//! Binary min-heap priority queue over owned `TaggedTask`s with a
//! pluggable comparator.
//!
//! The comparator is modeled as the requested `Policy` rather than a boxed
//! closure: both policies compare the same field every time (`ARRIVED` or
//! `expected_ms`), so a `match` in one `less()` method captures "pluggable
//! comparator, identical algorithm" without trait-object overhead, and it
//! keeps the queue itself trivially `Clone`.

use crate::config::Policy;
use crate::task::{Phase, TaggedTask};

pub struct PriorityQueue {
    policy: Policy,
    heap: Vec<TaggedTask>,
}

impl PriorityQueue {
    pub fn new(policy: Policy) -> PriorityQueue {
        PriorityQueue {
            policy,
            heap: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    fn less(&self, a: &TaggedTask, b: &TaggedTask) -> bool {
        match self.policy {
            Policy::Fcfs => a.stamp(Phase::Arrived) < b.stamp(Phase::Arrived),
            Policy::Sjf => a.expected_ms < b.expected_ms,
        }
    }

    /// Inserts `task`, taking ownership, and sifts it up into place.
    /// Amortized O(log n); the backing `Vec` grows by doubling like any
    /// other Rust vector.
    pub fn insert(&mut self, task: TaggedTask) {
        self.heap.push(task);
        let mut i = self.heap.len() - 1;
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.less(&self.heap[i], &self.heap[parent]) {
                self.heap.swap(i, parent);
                i = parent;
            } else {
                break;
            }
        }
    }

    /// Removes and returns the minimum element under the configured
    /// policy, or `None` if the queue is empty.
    pub fn remove_top(&mut self) -> Option<TaggedTask> {
        if self.heap.is_empty() {
            return None;
        }
        let last = self.heap.len() - 1;
        self.heap.swap(0, last);
        let top = self.heap.pop();
        self.sift_down(0);
        top
    }

    fn sift_down(&mut self, mut i: usize) {
        let n = self.heap.len();
        loop {
            let l = 2 * i + 1;
            let r = 2 * i + 2;
            let mut smallest = i;
            if l < n && self.less(&self.heap[l], &self.heap[smallest]) {
                smallest = l;
            }
            if r < n && self.less(&self.heap[r], &self.heap[smallest]) {
                smallest = r;
            }
            if smallest == i {
                break;
            }
            self.heap.swap(i, smallest);
            i = smallest;
        }
    }

    /// Unordered borrow of the current members, for status snapshots.
    /// Callers must not assume heap order is sorted order.
    pub fn enumerate(&self) -> impl Iterator<Item = &TaggedTask> {
        self.heap.iter()
    }
}

impl Clone for PriorityQueue {
    fn clone(&self) -> Self {
        PriorityQueue {
            policy: self.policy,
            heap: self.heap.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaggedTask, TaskKind, Timestamp};

    fn task(id: u32, expected_ms: u32, arrived_secs: u64) -> TaggedTask {
        let program = crate::task::Program::new(vec!["echo".into()]).unwrap();
        let mut t = TaggedTask::new(id, expected_ms, "echo".into(), TaskKind::pipeline(vec![program]).unwrap());
        t.set_stamp(Phase::Sent, Timestamp { secs: arrived_secs.saturating_sub(1), nanos: 0 });
        t.set_stamp(Phase::Arrived, Timestamp { secs: arrived_secs, nanos: 0 });
        t
    }

    #[test]
    fn fcfs_orders_by_arrival() {
        let mut q = PriorityQueue::new(Policy::Fcfs);
        q.insert(task(1, 100, 30));
        q.insert(task(2, 50, 10));
        q.insert(task(3, 10, 20));
        let order: Vec<u32> = std::iter::from_fn(|| q.remove_top().map(|t| t.id)).collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn sjf_orders_by_expected_ms() {
        let mut q = PriorityQueue::new(Policy::Sjf);
        q.insert(task(1, 300, 1));
        q.insert(task(2, 100, 2));
        q.insert(task(3, 200, 3));
        let order: Vec<u32> = std::iter::from_fn(|| q.remove_top().map(|t| t.id)).collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn remove_top_on_empty_queue_is_none() {
        let mut q = PriorityQueue::new(Policy::Fcfs);
        assert!(q.remove_top().is_none());
    }
}
