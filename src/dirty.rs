// src/dirty.rs
//! Per-frame update registration.
//!
//! Anything with pending GPU writes inserts its key into the surface's
//! [`DirtySet`] through a cloned [`DirtyTracker`]. The surface drains the set
//! exactly once per frame, inside the upload pass; a key inserted several
//! times in one frame is processed once.

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;

struct Inner<K> {
    order: Vec<K>,
    seen: HashSet<K>,
}

/// Cheap, cloneable handle for marking a key dirty.
pub struct DirtyTracker<K> {
    inner: Arc<Mutex<Inner<K>>>,
}

impl<K> Clone for DirtyTracker<K> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<K: Copy + Eq + Hash> DirtyTracker<K> {
    /// Returns `false` if the key was already pending this frame.
    pub fn mark(&self, key: K) -> bool {
        let mut inner = self.inner.lock();
        if inner.seen.insert(key) {
            inner.order.push(key);
            true
        } else {
            false
        }
    }

    /// Drop a key that no longer exists (e.g. a destroyed model).
    pub fn forget(&self, key: K) {
        let mut inner = self.inner.lock();
        if inner.seen.remove(&key) {
            inner.order.retain(|k| *k != key);
        }
    }
}

pub struct DirtySet<K> {
    tracker: DirtyTracker<K>,
}

impl<K: Copy + Eq + Hash> DirtySet<K> {
    pub fn new() -> Self {
        Self {
            tracker: DirtyTracker {
                inner: Arc::new(Mutex::new(Inner {
                    order: Vec::new(),
                    seen: HashSet::new(),
                })),
            },
        }
    }

    pub fn tracker(&self) -> DirtyTracker<K> {
        self.tracker.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.inner.lock().order.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tracker.inner.lock().order.len()
    }

    /// Takes every pending key in first-marked order and leaves the set empty.
    /// Keys marked while the caller processes the batch belong to next frame.
    pub fn drain(&self) -> Vec<K> {
        let mut inner = self.tracker.inner.lock();
        inner.seen.clear();
        std::mem::take(&mut inner.order)
    }
}

impl<K: Copy + Eq + Hash> Default for DirtySet<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_marks_drain_once() {
        let set = DirtySet::<u32>::new();
        let tracker = set.tracker();

        assert!(tracker.mark(3));
        assert!(tracker.mark(1));
        assert!(!tracker.mark(3));

        assert_eq!(set.drain(), vec![3, 1]);
        assert!(set.is_empty());
        assert!(set.drain().is_empty());
    }

    #[test]
    fn marks_after_drain_land_in_next_frame() {
        let set = DirtySet::<u32>::new();
        let tracker = set.tracker();
        tracker.mark(1);

        let frame = set.drain();
        assert!(tracker.mark(1));
        assert_eq!(frame, vec![1]);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn forgotten_keys_are_skipped() {
        let set = DirtySet::<u32>::new();
        let tracker = set.tracker();
        tracker.mark(1);
        tracker.mark(2);
        tracker.forget(1);
        assert_eq!(set.drain(), vec![2]);
    }
}
