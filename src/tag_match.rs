//! Tag matching store: the expected and unexpected queues.
//!
//! Both queues are strict FIFO and are searched linearly in arrival/post
//! order. First-match semantics within a tag+mask equivalence class are
//! load-bearing: with wildcard masks, reordering equally-matching entries
//! would deliver messages to the wrong request.

use std::collections::VecDeque;

use crate::desc::RecvDesc;

/// Check whether an incoming tag matches a posted (tag, mask) pair.
#[inline]
pub(crate) fn tag_matches(incoming: u64, tag: u64, mask: u64) -> bool {
    (incoming & mask) == (tag & mask)
}

/// A posted receive waiting in the expected queue.
pub(crate) struct ExpEntry {
    pub req: usize,
    pub tag: u64,
    pub mask: u64,
}

/// Per-worker matching store for tagged receives.
#[derive(Default)]
pub(crate) struct TagMatchStore {
    /// Posted receives not yet matched, in post order.
    expected: VecDeque<ExpEntry>,
    /// Arrived descriptors not yet matched, in arrival order.
    unexpected: VecDeque<RecvDesc>,
}

impl TagMatchStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queue a posted request, preserving post order.
    pub(crate) fn exp_push(&mut self, req: usize, tag: u64, mask: u64) {
        self.expected.push_back(ExpEntry { req, tag, mask });
    }

    /// Match an arrived tag against the expected queue; removes and returns
    /// the first (oldest-posted) matching request.
    pub(crate) fn exp_match(&mut self, incoming: u64) -> Option<usize> {
        let pos = self
            .expected
            .iter()
            .position(|e| tag_matches(incoming, e.tag, e.mask))?;
        Some(self.expected.remove(pos).expect("position in range").req)
    }

    /// Remove a specific request from the expected queue (cancellation).
    pub(crate) fn exp_remove(&mut self, req: usize) -> bool {
        match self.expected.iter().position(|e| e.req == req) {
            Some(pos) => {
                self.expected.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Queue an arrived descriptor, preserving arrival order.
    pub(crate) fn unexp_push(&mut self, desc: RecvDesc) {
        self.unexpected.push_back(desc);
    }

    /// Match a posted (tag, mask) against the unexpected queue; removes and
    /// returns the first (oldest-arrived) matching descriptor.
    pub(crate) fn unexp_match(&mut self, tag: u64, mask: u64) -> Option<RecvDesc> {
        let pos = self
            .unexpected
            .iter()
            .position(|d| tag_matches(d.tag, tag, mask))?;
        self.unexpected.remove(pos)
    }

    /// Peek at the first matching unexpected descriptor without removing it.
    pub(crate) fn unexp_find(&self, tag: u64, mask: u64) -> Option<&RecvDesc> {
        self.unexpected
            .iter()
            .find(|d| tag_matches(d.tag, tag, mask))
    }

    /// Number of queued unexpected descriptors.
    pub(crate) fn unexp_len(&self) -> usize {
        self.unexpected.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desc::{DescKind, Payload};

    fn desc(tag: u64, byte: u8) -> RecvDesc {
        RecvDesc::new(
            tag,
            DescKind::EagerOnly { sync: None },
            Payload::Borrowed(&[byte]),
            0,
        )
    }

    #[test]
    fn test_mask_matching() {
        assert!(tag_matches(0x10, 0x10, 0xFF));
        assert!(tag_matches(0x110, 0x10, 0xFF));
        assert!(!tag_matches(0x110, 0x10, 0xFFFF));
        assert!(tag_matches(0xABCD, 0, 0));
    }

    #[test]
    fn test_unexp_first_match_in_arrival_order() {
        let mut store = TagMatchStore::new();
        store.unexp_push(desc(0x10, 1));
        store.unexp_push(desc(0x110, 2));
        store.unexp_push(desc(0x10, 3));

        // Wildcard across the low byte: oldest arrival wins.
        let d = store.unexp_match(0x10, 0xFF).unwrap();
        assert_eq!(d.payload(), &[1]);
        let d = store.unexp_match(0x10, 0xFF).unwrap();
        assert_eq!(d.payload(), &[2]);
        // Exact mask skips the non-matching tail entry.
        assert!(store.unexp_match(0x110, u64::MAX).is_none());
        let d = store.unexp_match(0x10, u64::MAX).unwrap();
        assert_eq!(d.payload(), &[3]);
    }

    #[test]
    fn test_exp_drains_in_post_order() {
        let mut store = TagMatchStore::new();
        store.exp_push(7, 0x10, 0xFF);
        store.exp_push(8, 0x10, 0xFF);

        assert_eq!(store.exp_match(0x210), Some(7));
        assert_eq!(store.exp_match(0x10), Some(8));
        assert_eq!(store.exp_match(0x10), None);
    }

    #[test]
    fn test_exp_remove_for_cancel() {
        let mut store = TagMatchStore::new();
        store.exp_push(1, 5, u64::MAX);
        store.exp_push(2, 5, u64::MAX);

        assert!(store.exp_remove(1));
        assert!(!store.exp_remove(1));
        assert_eq!(store.exp_match(5), Some(2));
    }
}
