//! Bounded per-source window of recently processed message ids

use std::collections::{HashSet, VecDeque};

/// Default number of ids remembered per source.
pub const DEFAULT_WINDOW_CAPACITY: usize = 1000;

/// Insertion-ordered set of recently seen message ids.
///
/// When the window grows past its capacity it is truncated to its most
/// recently inserted half. The bound caps memory; it is approximate
/// eviction, not an exact LRU.
#[derive(Debug)]
pub struct DedupWindow {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(2),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Record an id. Returns false if it was already in the window, which
    /// makes re-delivery of the same id a no-op for callers.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        if self.order.len() > self.capacity {
            let drop = self.order.len() / 2;
            for old in self.order.drain(..drop) {
                self.seen.remove(&old);
            }
        }
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_then_duplicate() {
        let mut window = DedupWindow::default();
        assert!(window.insert("100"));
        assert!(!window.insert("100"));
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let mut window = DedupWindow::default();
        for i in 0..5000 {
            window.insert(&i.to_string());
            assert!(window.len() <= DEFAULT_WINDOW_CAPACITY);
        }
    }

    #[test]
    fn test_eviction_keeps_newest_half() {
        let mut window = DedupWindow::new(10);
        for i in 0..11 {
            window.insert(&i.to_string());
        }
        // the insert that crossed capacity dropped the oldest half
        assert!(window.len() <= 6);
        assert!(!window.contains("0"));
        assert!(window.contains("10"));
    }

    #[test]
    fn test_evicted_id_can_reenter() {
        let mut window = DedupWindow::new(10);
        for i in 0..11 {
            window.insert(&i.to_string());
        }
        assert!(window.insert("0"));
    }
}
