//! Priority ready queue
//!
//! One FIFO per priority plus a bitmap of non-empty priorities, so picking
//! the highest ready thread is a scan of four words.

use crate::config::PRIO_NUM;
use crate::kernel_bug;
use crate::object::{Object, ObjectId};
use hashbrown::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;

const BITMAP_WORDS: usize = PRIO_NUM / 64;

/// Set of priorities with at least one queued thread
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PrioBitmap([u64; BITMAP_WORDS]);

impl PrioBitmap {
    pub fn set(&mut self, prio: usize) {
        self.0[prio / 64] |= 1 << (prio % 64);
    }

    pub fn clear(&mut self, prio: usize) {
        self.0[prio / 64] &= !(1 << (prio % 64));
    }

    pub fn contains(&self, prio: usize) -> bool {
        self.0[prio / 64] & (1 << (prio % 64)) != 0
    }

    /// Highest set priority
    pub fn highest(&self) -> Option<usize> {
        self.0
            .iter()
            .enumerate()
            .rev()
            .find(|(_, word)| **word != 0)
            .map(|(i, word)| i * 64 + 63 - word.leading_zeros() as usize)
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }
}

/// Per-core run queue
pub struct ReadyQueue {
    queues: Vec<VecDeque<Arc<Object>>>,
    bitmap: PrioBitmap,
    members: HashSet<ObjectId>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self {
            queues: (0..PRIO_NUM).map(|_| VecDeque::new()).collect(),
            bitmap: PrioBitmap::default(),
            members: HashSet::new(),
        }
    }

    /// Append `thread` at the tail of its priority.
    ///
    /// Queueing a thread twice is a kernel bug.
    pub fn enqueue(&mut self, thread: Arc<Object>, prio: usize) {
        if !self.members.insert(thread.id()) {
            kernel_bug!("double enqueue of {:?}", thread.id());
        }
        self.queues[prio].push_back(thread);
        self.bitmap.set(prio);
    }

    /// Put `thread` back at the head of its priority.
    pub fn enqueue_front(&mut self, thread: Arc<Object>, prio: usize) {
        if !self.members.insert(thread.id()) {
            kernel_bug!("double enqueue of {:?}", thread.id());
        }
        self.queues[prio].push_front(thread);
        self.bitmap.set(prio);
    }

    /// Remove and return the head of the highest non-empty priority.
    pub fn pop_highest(&mut self) -> Option<(Arc<Object>, usize)> {
        let prio = self.bitmap.highest()?;
        let queue = &mut self.queues[prio];
        let Some(thread) = queue.pop_front() else {
            kernel_bug!("ready bitmap marks empty priority {}", prio);
        };
        if queue.is_empty() {
            self.bitmap.clear(prio);
        }
        self.members.remove(&thread.id());
        Some((thread, prio))
    }

    /// Remove `thread` wherever it is queued. Returns false if absent.
    pub fn remove(&mut self, thread: &Arc<Object>) -> bool {
        if !self.members.remove(&thread.id()) {
            return false;
        }
        for (prio, queue) in self.queues.iter_mut().enumerate() {
            if let Some(pos) = queue.iter().position(|t| Arc::ptr_eq(t, thread)) {
                queue.remove(pos);
                if queue.is_empty() {
                    self.bitmap.clear(prio);
                }
                return true;
            }
        }
        kernel_bug!("ready member {:?} missing from its queue", thread.id());
    }

    pub fn highest_prio(&self) -> Option<usize> {
        self.bitmap.highest()
    }

    pub fn contains(&self, thread: &Object) -> bool {
        self.members.contains(&thread.id())
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Queued threads, highest priority first.
    pub fn snapshot(&self) -> Vec<Arc<Object>> {
        self.queues.iter().rev().flat_map(|q| q.iter().cloned()).collect()
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::notification::Notification;
    use crate::object::ObjectBody;

    fn obj() -> Arc<Object> {
        Object::new(ObjectBody::Notification(Notification::new()))
    }

    #[test]
    fn test_bitmap_highest() {
        let mut bm = PrioBitmap::default();
        assert_eq!(bm.highest(), None);
        bm.set(3);
        bm.set(130);
        bm.set(64);
        assert_eq!(bm.highest(), Some(130));
        bm.clear(130);
        assert_eq!(bm.highest(), Some(64));
        bm.set(255);
        assert_eq!(bm.highest(), Some(255));
        assert!(bm.contains(3));
    }

    #[test]
    fn test_fifo_within_priority() {
        let mut rq = ReadyQueue::new();
        let (a, b, c) = (obj(), obj(), obj());
        rq.enqueue(a.clone(), 10);
        rq.enqueue(b.clone(), 20);
        rq.enqueue(c.clone(), 10);
        assert_eq!(rq.highest_prio(), Some(20));
        assert!(Arc::ptr_eq(&rq.pop_highest().unwrap().0, &b));
        assert!(Arc::ptr_eq(&rq.pop_highest().unwrap().0, &a));
        assert!(Arc::ptr_eq(&rq.pop_highest().unwrap().0, &c));
        assert!(rq.pop_highest().is_none());
        assert!(rq.is_empty());
    }

    #[test]
    fn test_remove_clears_bitmap() {
        let mut rq = ReadyQueue::new();
        let a = obj();
        rq.enqueue(a.clone(), 7);
        assert!(rq.contains(&a));
        assert!(rq.remove(&a));
        assert!(!rq.remove(&a));
        assert_eq!(rq.highest_prio(), None);
    }

    #[test]
    #[should_panic(expected = "double enqueue")]
    fn test_double_enqueue_is_fatal() {
        let mut rq = ReadyQueue::new();
        let a = obj();
        rq.enqueue(a.clone(), 1);
        rq.enqueue(a, 2);
    }
}
