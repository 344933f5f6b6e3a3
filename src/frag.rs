//! Eager fragment reassembly associations.
//!
//! Multi-fragment eager messages are correlated by (endpoint, message id).
//! The first fragment establishes the association; middle fragments must
//! find it. While the first fragment sits unmatched, later fragments queue
//! here in arrival order; once a request matches, the association pins that
//! request until the last byte arrives. At most one request is ever in
//! flight per message id.

use std::collections::{HashMap, VecDeque};

use crate::desc::RecvDesc;

/// State of one (endpoint, message id) association.
pub(crate) enum FragList {
    /// First fragment queued unexpected; later fragments pile up here.
    Unmatched(VecDeque<RecvDesc>),
    /// A request is reassembling this message; the value is its slab index.
    Matched(usize),
}

#[derive(Default)]
pub(crate) struct FragStore {
    map: HashMap<(u64, u64), FragList>,
}

impl FragStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Establish an association for an unexpected first fragment.
    pub(crate) fn start_unmatched(&mut self, key: (u64, u64)) {
        let prev = self.map.insert(key, FragList::Unmatched(VecDeque::new()));
        assert!(
            prev.is_none(),
            "duplicate first fragment for message id {:#x} on endpoint {:#x}",
            key.1,
            key.0
        );
    }

    /// Look up the association a middle fragment belongs to. `None` means
    /// no first fragment was seen — an in-order-delivery violation the
    /// caller must treat as fatal.
    pub(crate) fn get_mut(&mut self, key: (u64, u64)) -> Option<&mut FragList> {
        self.map.get_mut(&key)
    }

    /// Pin a request to the association, returning any fragments that
    /// arrived while it was unmatched (in arrival order). Creates the
    /// association when the first fragment matched an expected request.
    pub(crate) fn attach(&mut self, key: (u64, u64), req: usize) -> VecDeque<RecvDesc> {
        match self.map.insert(key, FragList::Matched(req)) {
            None => VecDeque::new(),
            Some(FragList::Unmatched(queued)) => queued,
            Some(FragList::Matched(_)) => {
                panic!(
                    "message id {:#x} on endpoint {:#x} already has a request in flight",
                    key.1, key.0
                )
            }
        }
    }

    /// Drop the association once the message is fully reassembled.
    pub(crate) fn finish(&mut self, key: (u64, u64)) {
        let removed = self.map.remove(&key);
        assert!(
            matches!(removed, Some(FragList::Matched(_))),
            "finishing reassembly for message id {:#x} with no request attached",
            key.1
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desc::{DescKind, Payload};

    fn middle(ep: u64, msg_id: u64, byte: u8) -> RecvDesc {
        RecvDesc::new(
            0,
            DescKind::EagerMiddle { ep, msg_id },
            Payload::Borrowed(&[byte]),
            0,
        )
    }

    #[test]
    fn test_attach_returns_queued_fragments_in_order() {
        let mut store = FragStore::new();
        let key = (1, 100);
        store.start_unmatched(key);

        match store.get_mut(key).unwrap() {
            FragList::Unmatched(q) => {
                q.push_back(middle(1, 100, 2));
                q.push_back(middle(1, 100, 3));
            }
            FragList::Matched(_) => unreachable!(),
        }

        let queued = store.attach(key, 9);
        let bytes: Vec<u8> = queued.iter().map(|d| d.payload()[0]).collect();
        assert_eq!(bytes, vec![2, 3]);

        match store.get_mut(key).unwrap() {
            FragList::Matched(req) => assert_eq!(*req, 9),
            FragList::Unmatched(_) => unreachable!(),
        }

        store.finish(key);
        assert!(store.get_mut(key).is_none());
    }

    #[test]
    fn test_unknown_middle_has_no_association() {
        let mut store = FragStore::new();
        assert!(store.get_mut((1, 42)).is_none());
    }

    #[test]
    #[should_panic(expected = "already has a request in flight")]
    fn test_double_attach_panics() {
        let mut store = FragStore::new();
        store.attach((1, 5), 0);
        store.attach((1, 5), 1);
    }
}
