//! Receive requests and their completion state machine.
//!
//! A request is created when the application posts a receive that cannot
//! complete in place, lives in the worker's slab, and is driven
//! `Posted → Matched → InProgress → Completed` by the matching engine.
//! Completion happens exactly once; the slab entry is freed when both the
//! `COMPLETED` and `RELEASED` flags are set, in either order.

use crate::dt::{DtClass, DtIter, RecvBuf};
use crate::error::Status;

/// Request flag bits.
pub(crate) mod flags {
    /// This is a receive request.
    pub const RECV: u16 = 1 << 0;
    /// Linked into the expected queue (tag) — cleared on match or cancel.
    pub const EXPECTED: u16 = 1 << 1;
    /// Linked into an endpoint stream queue.
    pub const STREAM_QUEUED: u16 = 1 << 2;
    /// Terminal: the request completed. Set exactly once.
    pub const COMPLETED: u16 = 1 << 3;
    /// Ownership returned by the application; free the slab entry once
    /// completed.
    pub const RELEASED: u16 = 1 << 4;
    /// Stream receive must fill the whole buffer before completing.
    pub const STREAM_WAITALL: u16 = 1 << 5;
    /// Matched a sync-eager message: completion additionally requires
    /// `SYNC_ACK_SENT`.
    pub const SYNC_WAIT_ACK: u16 = 1 << 6;
    /// The receipt acknowledgment was handed to the ack hook.
    pub const SYNC_ACK_SENT: u16 = 1 << 7;
    /// All message bytes were received (local unpack done).
    pub const DATA_DONE: u16 = 1 << 8;
}

/// Handle to a posted receive request.
///
/// Handles are generation-stamped: a handle to a freed-and-recycled slab
/// slot is detected and ignored rather than touching the new occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReqHandle {
    pub(crate) index: usize,
    pub(crate) generation: u64,
}

/// Completion information for a tag receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagRecvInfo {
    /// The sender's tag.
    pub sender_tag: u64,
    /// Total length of the arrived message in bytes. On truncation this is
    /// the sender's length, larger than what the buffer could hold.
    pub length: usize,
}

/// Callback for tag receives: (status, info, destination buffer).
pub type TagRecvCb = Box<dyn FnOnce(Status, TagRecvInfo, RecvBuf)>;

/// Callback for stream receives: (status, bytes delivered, destination
/// buffer).
pub type StreamRecvCb = Box<dyn FnOnce(Status, usize, RecvBuf)>;

pub(crate) enum ReqKind {
    Tag {
        tag: u64,
        mask: u64,
        info: TagRecvInfo,
        cb: Option<TagRecvCb>,
        /// Set while this request owns a fragment-reassembly association.
        frag_key: Option<(u64, u64)>,
    },
    Stream {
        ep: u64,
        cb: Option<StreamRecvCb>,
    },
}

pub(crate) struct Request {
    pub flags: u16,
    pub status: Status,
    pub dt: DtIter,
    /// Message bytes received so far. Advances by the full fragment length
    /// even when the buffer is too small to store it all, so truncated
    /// receives still terminate when the sender's length is reached.
    pub recvd: usize,
    /// Expected total message length, known once matched (tag mode).
    pub total_len: usize,
    pub kind: ReqKind,
    pub generation: u64,
    /// Destination buffer parked here at completion when no callback was
    /// registered, reclaimed via `Worker::request_free`.
    pub parked: Option<RecvBuf>,
}

impl Request {
    pub(crate) fn new_tag(
        dt: DtIter,
        tag: u64,
        mask: u64,
        cb: Option<TagRecvCb>,
        generation: u64,
    ) -> Self {
        let total_len = dt.length();
        Self {
            flags: flags::RECV,
            status: Status::Ok,
            dt,
            recvd: 0,
            total_len,
            kind: ReqKind::Tag {
                tag,
                mask,
                info: TagRecvInfo {
                    sender_tag: 0,
                    length: 0,
                },
                cb,
                frag_key: None,
            },
            generation,
            parked: None,
        }
    }

    pub(crate) fn new_stream(
        dt: DtIter,
        ep: u64,
        waitall: bool,
        cb: Option<StreamRecvCb>,
        generation: u64,
    ) -> Self {
        let total_len = dt.length();
        let mut flags = flags::RECV;
        if waitall {
            flags |= self::flags::STREAM_WAITALL;
        }
        Self {
            flags,
            status: Status::Ok,
            dt,
            recvd: 0,
            total_len,
            kind: ReqKind::Stream { ep, cb },
            generation,
            parked: None,
        }
    }

    #[inline]
    pub(crate) fn set(&mut self, f: u16) {
        self.flags |= f;
    }

    #[inline]
    pub(crate) fn clear(&mut self, f: u16) {
        self.flags &= !f;
    }

    #[inline]
    pub(crate) fn test(&self, f: u16) -> bool {
        self.flags & f != 0
    }

    #[inline]
    pub(crate) fn is_completed(&self) -> bool {
        self.test(flags::COMPLETED)
    }

    /// Sync-eager completion gate: both "local unpack done" and "ack sent"
    /// must be observed, in either order. Non-sync requests only need the
    /// data.
    #[inline]
    pub(crate) fn completion_gate_passed(&self) -> bool {
        self.test(flags::DATA_DONE)
            && (!self.test(flags::SYNC_WAIT_ACK) || self.test(flags::SYNC_ACK_SENT))
    }

    /// Stream completion criterion: complete when full, or when any data at
    /// element granularity has arrived and WAITALL was not requested.
    /// Non-contiguous destinations complete at any non-zero amount; a
    /// 0-length request is satisfied only explicitly (offset 0 with a
    /// non-zero length never completes).
    pub(crate) fn can_complete_stream(&self) -> bool {
        if self.dt.offset() == self.dt.length() {
            return true;
        }
        if self.test(flags::STREAM_WAITALL) || self.dt.offset() == 0 {
            return false;
        }
        if self.dt.class() != DtClass::Contig {
            return true;
        }
        self.dt.offset() % self.dt.elem_size() == 0
    }
}
