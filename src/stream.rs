//! Per-endpoint stream queues.
//!
//! Streaming delivery has no tags: each endpoint owns a single FIFO that
//! holds whichever side showed up first — unmatched data descriptors or
//! posted receive requests. The two never coexist: arriving data drains
//! pending requests before anything is queued, and a posted receive drains
//! queued data before it is queued, so at any instant the queue is all
//! descriptors (`has_data`) or all requests.

use std::collections::{HashMap, VecDeque};

use crate::desc::RecvDesc;

pub(crate) enum StreamEntry {
    Desc(RecvDesc),
    Req(usize),
}

/// Stream state for one endpoint.
#[derive(Default)]
pub(crate) struct EpStream {
    q: VecDeque<StreamEntry>,
    has_data: bool,
}

impl EpStream {
    /// True when the queue holds unconsumed data descriptors.
    #[inline]
    pub(crate) fn has_data(&self) -> bool {
        self.has_data
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    pub(crate) fn push_desc(&mut self, desc: RecvDesc) {
        debug_assert!(self.q.is_empty() || self.has_data);
        self.q.push_back(StreamEntry::Desc(desc));
        self.has_data = true;
    }

    pub(crate) fn push_req(&mut self, req: usize) {
        debug_assert!(!self.has_data);
        self.q.push_back(StreamEntry::Req(req));
    }

    /// Total buffered payload bytes across queued descriptors.
    pub(crate) fn data_len(&self) -> usize {
        if !self.has_data {
            return 0;
        }
        self.q
            .iter()
            .map(|e| match e {
                StreamEntry::Desc(d) => d.len(),
                StreamEntry::Req(_) => 0,
            })
            .sum()
    }

    /// Head descriptor, for in-place consumption.
    pub(crate) fn head_desc_mut(&mut self) -> Option<&mut RecvDesc> {
        if !self.has_data {
            return None;
        }
        match self.q.front_mut() {
            Some(StreamEntry::Desc(d)) => Some(d),
            _ => panic!("stream queue marked has_data with a request at head"),
        }
    }

    /// Dequeue the head descriptor, clearing `has_data` when the queue
    /// empties.
    pub(crate) fn pop_desc(&mut self) -> Option<RecvDesc> {
        if !self.has_data {
            return None;
        }
        let desc = match self.q.pop_front() {
            Some(StreamEntry::Desc(d)) => d,
            _ => panic!("stream queue marked has_data with a request at head"),
        };
        if self.q.is_empty() {
            self.has_data = false;
        }
        Some(desc)
    }

    /// Head pending request, if the queue is in request mode.
    pub(crate) fn head_req(&self) -> Option<usize> {
        if self.has_data {
            return None;
        }
        match self.q.front() {
            Some(StreamEntry::Req(r)) => Some(*r),
            _ => None,
        }
    }

    /// Dequeue the head pending request.
    pub(crate) fn pop_req(&mut self) -> Option<usize> {
        match self.head_req() {
            Some(r) => {
                self.q.pop_front();
                Some(r)
            }
            None => None,
        }
    }

    /// Consume the queue for endpoint teardown.
    pub(crate) fn into_entries(self) -> VecDeque<StreamEntry> {
        self.q
    }

    /// Remove a specific pending request (cancellation).
    pub(crate) fn remove_req(&mut self, req: usize) -> bool {
        if self.has_data {
            return false;
        }
        let pos = self
            .q
            .iter()
            .position(|e| matches!(e, StreamEntry::Req(r) if *r == req));
        match pos {
            Some(pos) => {
                self.q.remove(pos);
                true
            }
            None => false,
        }
    }
}

/// Per-worker registry of endpoint stream state, created lazily.
#[derive(Default)]
pub(crate) struct StreamStore {
    eps: HashMap<u64, EpStream>,
}

impl StreamStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get_or_create(&mut self, ep: u64) -> &mut EpStream {
        self.eps.entry(ep).or_default()
    }

    pub(crate) fn get_mut(&mut self, ep: u64) -> Option<&mut EpStream> {
        self.eps.get_mut(&ep)
    }

    /// Take an endpoint's whole queue for teardown.
    pub(crate) fn take(&mut self, ep: u64) -> Option<EpStream> {
        self.eps.remove(&ep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desc::{DescKind, Payload};

    fn data(bytes: &[u8]) -> RecvDesc {
        RecvDesc::new(0, DescKind::Stream, Payload::Borrowed(bytes), 0)
    }

    #[test]
    fn test_fifo_data_mode() {
        let mut ep = EpStream::default();
        assert!(!ep.has_data());
        ep.push_desc(data(&[1]));
        ep.push_desc(data(&[2]));
        assert!(ep.has_data());

        assert_eq!(ep.pop_desc().unwrap().payload(), &[1]);
        assert!(ep.has_data());
        assert_eq!(ep.pop_desc().unwrap().payload(), &[2]);
        assert!(!ep.has_data());
        assert!(ep.pop_desc().is_none());
    }

    #[test]
    fn test_request_mode() {
        let mut ep = EpStream::default();
        ep.push_req(3);
        ep.push_req(4);
        assert!(!ep.has_data());
        assert_eq!(ep.pop_req(), Some(3));
        assert!(ep.remove_req(4));
        assert!(!ep.remove_req(4));
        assert!(ep.is_empty());
    }

    #[test]
    fn test_head_desc_shrink() {
        let mut ep = EpStream::default();
        ep.push_desc(data(&[1, 2, 3, 4]));
        ep.head_desc_mut().unwrap().advance(2);
        assert_eq!(ep.head_desc_mut().unwrap().payload(), &[3, 4]);
    }

    #[test]
    fn test_store_lazy_creation() {
        let mut store = StreamStore::new();
        assert!(store.get_mut(9).is_none());
        store.get_or_create(9).push_req(0);
        assert!(store.get_mut(9).is_some());
        assert!(store.take(9).is_some());
        assert!(store.get_mut(9).is_none());
    }
}
