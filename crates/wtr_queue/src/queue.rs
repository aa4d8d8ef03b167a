use std::sync::atomic::AtomicUsize;

use parking_lot::Mutex;
use wtr_utils::atomic;

use crate::group::{GroupId, TestGroup};

/// Collects groups before a run starts. Sealing it with [WriteQueue::to_read] is the only way to
/// hand groups to managers, so no group can appear after a manager has seen the queue drained.
#[derive(Default, Debug)]
pub struct WriteQueue {
    groups: Vec<TestGroup>,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a group, assigning it the next [GroupId].
    pub fn push(&mut self, mut group: TestGroup) -> GroupId {
        let id = GroupId(self.groups.len());
        group.id = id;
        self.groups.push(group);
        id
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn to_read(self) -> ReadQueue {
        ReadQueue::new(self.groups)
    }
}

impl Extend<TestGroup> for WriteQueue {
    fn extend<I: IntoIterator<Item = TestGroup>>(&mut self, groups: I) {
        for group in groups {
            self.push(group);
        }
    }
}

/// Concurrently-accessible queue of test groups for a run.
///
/// Each pop claims a slot with a single atomic increment, so every group is handed to exactly
/// one caller, in queue order, without a peek-then-remove race.
#[derive(Debug)]
pub struct ReadQueue {
    slots: Vec<Mutex<Option<TestGroup>>>,
    /// Index of the next slot to hand out.
    ptr: AtomicUsize,
}

impl ReadQueue {
    fn new(groups: Vec<TestGroup>) -> Self {
        Self {
            slots: groups.into_iter().map(|g| Mutex::new(Some(g))).collect(),
            ptr: AtomicUsize::new(0),
        }
    }

    /// Takes the next group, or `None` once the queue is drained.
    pub fn pop(&self) -> Option<TestGroup> {
        let idx = self.ptr.fetch_add(1, atomic::ORDERING);
        if idx >= self.slots.len() {
            // Clamp back down so that repeated pops on a drained queue cannot overflow.
            self.ptr.store(self.slots.len(), atomic::ORDERING);
            return None;
        }
        // The slot at `idx` was claimed by this call alone, so the lock is never contested.
        self.slots[idx].lock().take()
    }

    /// Takes every group that has not been handed out yet.
    pub fn drain(&self) -> Vec<TestGroup> {
        std::iter::from_fn(|| self.pop()).collect()
    }

    /// Total number of groups the queue was sealed with.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_at_end(&self) -> bool {
        self.ptr.load(atomic::ORDERING) >= self.slots.len()
    }

    /// Groups not yet handed out, at a given point in time. Not atomic with respect to pops.
    pub fn remaining(&self) -> usize {
        self.slots
            .len()
            .saturating_sub(self.ptr.load(atomic::ORDERING))
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    use wtr_utils::atomic;

    use super::{ReadQueue, WriteQueue};
    use crate::group::{GroupId, GroupMetadata, TestGroup};
    use crate::test_spec::{Test, TestKey, TestType};

    fn queue_of(num_groups: usize) -> ReadQueue {
        let mut queue = WriteQueue::new();
        for i in 0..num_groups {
            let test = Arc::new(Test::new(
                format!("/t/{i}.html"),
                TestType::Testharness,
                Duration::from_secs(10),
            ));
            queue.push(TestGroup::new(
                TestKey::new("", TestType::Testharness),
                [test],
                GroupMetadata::new(),
            ));
        }
        queue.to_read()
    }

    #[test]
    fn pops_in_order_then_none() {
        let queue = queue_of(3);
        assert_eq!(queue.remaining(), 3);
        let ids: Vec<_> = std::iter::from_fn(|| queue.pop()).map(|g| g.id).collect();
        assert_eq!(ids, vec![GroupId(0), GroupId(1), GroupId(2)]);
        assert!(queue.is_at_end());
        assert!(queue.pop().is_none());
        assert!(queue.pop().is_none());
        assert_eq!(queue.remaining(), 0);
    }

    #[test]
    fn empty_queue_is_at_end() {
        let queue = WriteQueue::new().to_read();
        assert!(queue.is_empty());
        assert!(queue.is_at_end());
        assert!(queue.pop().is_none());
    }

    #[test]
    fn fuzz_concurrent_access() {
        for _ in 0..20 {
            let num_groups = 5_000;
            let num_threads = 16;
            let num_popped = Arc::new(AtomicUsize::new(0));
            let queue = Arc::new(queue_of(num_groups));

            let threads: Vec<_> = (0..num_threads)
                .map(|_| {
                    let queue = queue.clone();
                    let num_popped = num_popped.clone();
                    std::thread::spawn(move || {
                        let mut seen = vec![];
                        while let Some(group) = queue.pop() {
                            num_popped.fetch_add(1, atomic::ORDERING);
                            seen.push(group.id);
                        }
                        seen
                    })
                })
                .collect();

            let mut all_seen = BTreeSet::new();
            for handle in threads {
                let seen = handle.join().unwrap();
                // Each thread observes its groups in queue order.
                assert!(seen.windows(2).all(|w| w[0] < w[1]));
                for id in seen {
                    assert!(all_seen.insert(id), "{id} delivered twice");
                }
            }

            assert_eq!(num_popped.load(atomic::ORDERING), num_groups);
            assert_eq!(all_seen.len(), num_groups);
            assert!(queue.is_at_end());
        }
    }
}
