//! The receive worker: matching engine, delivery entry point, and request
//! lifecycle.
//!
//! A worker owns all receive-side state for one progress domain: the tag
//! matching store, the fragment reassembler, the per-endpoint stream queues,
//! and the request slab. It is single-threaded by construction; interior
//! mutability goes through `RefCell` and the type is neither `Send` nor
//! `Sync`, so the usual protocol-layer lock is the type system itself.
//!
//! Completion callbacks and the rendezvous/ack hooks are never invoked while
//! internal state is borrowed. Every mutating entry point stages them on a
//! deferred queue and drains it just before returning, so a callback may
//! reenter the worker freely.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

use log::trace;
use slab::Slab;

use crate::config::WorkerConfig;
use crate::desc::{DescKind, Payload, RecvDesc, RndvRts, StreamData, SyncInfo, TagMessage};
use crate::dt::{DtClass, DtIter, RecvBuf};
use crate::error::{Error, Result, Status};
use crate::frag::{FragList, FragStore};
use crate::packet::{
    AmId, EagerFirstHdr, EagerMiddleHdr, RndvRtsHdr, StreamHdr, SyncHdr, TagHdr,
    EAGER_FIRST_HDR_SIZE, EAGER_MIDDLE_HDR_SIZE, STREAM_HDR_SIZE, SYNC_HDR_SIZE, TAG_HDR_SIZE,
};
use crate::request::{
    flags, ReqHandle, ReqKind, Request, StreamRecvCb, TagRecvCb, TagRecvInfo,
};
use crate::stream::{StreamEntry, StreamStore};
use crate::tag_match::TagMatchStore;

/// Tag mask matching every bit (exact-tag receive).
pub const TAG_MASK_FULL: u64 = u64::MAX;

/// Outcome of posting a tagged receive.
pub enum PostRecv {
    /// The receive finished before returning; the callback has already run.
    Completed,
    /// The receive is outstanding (or completed without a callback, with the
    /// buffer parked for [`Worker::request_free`]).
    Pending(ReqHandle),
}

/// Outcome of posting a stream receive.
pub enum StreamRecv {
    /// Data was delivered in place, without allocating a request.
    Data {
        /// The destination buffer, filled from the head of the queue.
        buf: RecvBuf,
        /// Bytes delivered.
        length: usize,
    },
    /// The receive finished in place and the callback has already run.
    Completed,
    /// The receive is outstanding.
    Pending(ReqHandle),
}

/// Outcome of delivering an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The message was unpacked into a waiting request (or consumed as a
    /// no-op).
    Consumed,
    /// No request was waiting; a descriptor was queued.
    Queued,
}

/// Stream receive flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamFlags(u32);

impl StreamFlags {
    /// No flags.
    pub const NONE: StreamFlags = StreamFlags(0);
    /// Complete only once the whole buffer is filled.
    pub const WAITALL: StreamFlags = StreamFlags(1 << 0);
    /// Require immediate in-place completion; fail with
    /// [`Error::NoResource`] otherwise.
    pub const IMMEDIATE: StreamFlags = StreamFlags(1 << 1);

    #[inline]
    pub fn contains(self, other: StreamFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for StreamFlags {
    type Output = StreamFlags;

    #[inline]
    fn bitor(self, rhs: StreamFlags) -> StreamFlags {
        StreamFlags(self.0 | rhs.0)
    }
}

/// Work staged while internal state is borrowed, drained before each entry
/// point returns.
enum Deferred {
    TagDone {
        cb: TagRecvCb,
        status: Status,
        info: TagRecvInfo,
        buf: RecvBuf,
    },
    StreamDone {
        cb: StreamRecvCb,
        status: Status,
        length: usize,
        buf: RecvBuf,
    },
    Rndv {
        handle: ReqHandle,
        rts: RndvRts,
    },
    Ack(SyncInfo),
}

/// Receive-side matching engine for one progress domain.
pub struct Worker {
    config: WorkerConfig,
    reqs: RefCell<Slab<Request>>,
    tm: RefCell<TagMatchStore>,
    frags: RefCell<FragStore>,
    streams: RefCell<StreamStore>,
    /// Queued descriptors across all stores, bounded by
    /// `config.max_unexpected`.
    desc_count: Cell<usize>,
    generation: Cell<u64>,
    rndv_cb: Option<Box<dyn Fn(ReqHandle, RndvRts)>>,
    ack_cb: Option<Box<dyn Fn(SyncInfo)>>,
    deferred: RefCell<VecDeque<Deferred>>,
}

impl Default for Worker {
    fn default() -> Self {
        Self::new(WorkerConfig::default())
    }
}

impl Worker {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            reqs: RefCell::new(Slab::new()),
            tm: RefCell::new(TagMatchStore::new()),
            frags: RefCell::new(FragStore::new()),
            streams: RefCell::new(StreamStore::new()),
            desc_count: Cell::new(0),
            generation: Cell::new(0),
            rndv_cb: None,
            ack_cb: None,
            deferred: RefCell::new(VecDeque::new()),
        }
    }

    /// Register the rendezvous hand-off hook, invoked once per matched
    /// rendezvous message with the request handle and the sender's RTS info.
    /// The transfer subsystem later calls [`Worker::rndv_unpack`] and
    /// [`Worker::rndv_complete`] on that handle.
    pub fn set_rndv_handler(&mut self, f: impl Fn(ReqHandle, RndvRts) + 'static) {
        self.rndv_cb = Some(Box::new(f));
    }

    /// Register the sync acknowledgment hook, invoked once per received
    /// sync-flagged message with the sender's ack target.
    pub fn set_sync_ack_handler(&mut self, f: impl Fn(SyncInfo) + 'static) {
        self.ack_cb = Some(Box::new(f));
    }

    // ---- tag matching ------------------------------------------------

    /// Post a tagged receive.
    ///
    /// The unexpected queue is searched first, oldest arrival winning within
    /// the tag+mask equivalence class. A single-fragment hit completes
    /// before returning without allocating a request (when a callback is
    /// given); everything else returns a pending handle.
    pub fn tag_recv(
        &self,
        dt: DtIter,
        tag: u64,
        tag_mask: u64,
        cb: Option<TagRecvCb>,
    ) -> Result<PostRecv> {
        let r = self.tag_recv_inner(dt, tag, tag_mask, cb);
        self.flush_deferred();
        r
    }

    fn tag_recv_inner(
        &self,
        dt: DtIter,
        tag: u64,
        tag_mask: u64,
        cb: Option<TagRecvCb>,
    ) -> Result<PostRecv> {
        let matched = self.tm.borrow_mut().unexp_match(tag, tag_mask);
        match matched {
            Some(desc) => {
                self.desc_released(1);
                trace!("tag_recv tag={:#x} matched unexpected", tag);
                self.recv_matched(dt, desc, cb)
            }
            None => {
                let mut reqs = self.reqs.borrow_mut();
                let has_cb = cb.is_some();
                let generation = self.next_generation();
                let req = Request::new_tag(dt, tag, tag_mask, cb, generation);
                let index = self.alloc_req(&mut reqs, req)?;
                {
                    let req = &mut reqs[index];
                    req.set(flags::EXPECTED);
                    if has_cb {
                        req.set(flags::RELEASED);
                    }
                }
                self.tm.borrow_mut().exp_push(index, tag, tag_mask);
                trace!("tag_recv tag={:#x} queued expected req={}", tag, index);
                Ok(PostRecv::Pending(ReqHandle { index, generation }))
            }
        }
    }

    /// Look at the first unexpected message matching (tag, mask) without
    /// removing it.
    pub fn tag_peek(&self, tag: u64, tag_mask: u64) -> Option<TagRecvInfo> {
        self.tm
            .borrow()
            .unexp_find(tag, tag_mask)
            .map(|d| TagRecvInfo {
                sender_tag: d.tag,
                length: d.message_len(),
            })
    }

    /// Remove the first unexpected message matching (tag, mask) and hand it
    /// to the caller. The message must eventually be passed to
    /// [`Worker::tag_msg_recv`] to be received.
    pub fn tag_probe(&self, tag: u64, tag_mask: u64) -> Option<TagMessage> {
        let desc = self.tm.borrow_mut().unexp_match(tag, tag_mask)?;
        self.desc_released(1);
        Some(TagMessage { desc })
    }

    /// Receive a specific message obtained from [`Worker::tag_probe`].
    pub fn tag_msg_recv(
        &self,
        msg: TagMessage,
        dt: DtIter,
        cb: Option<TagRecvCb>,
    ) -> Result<PostRecv> {
        let r = self.recv_matched(dt, msg.desc, cb);
        self.flush_deferred();
        r
    }

    /// Receive into `dt` from a descriptor that already matched.
    fn recv_matched(
        &self,
        mut dt: DtIter,
        desc: RecvDesc,
        cb: Option<TagRecvCb>,
    ) -> Result<PostRecv> {
        match desc.kind {
            DescKind::EagerOnly { sync } => {
                if let Some(s) = sync {
                    self.deferred.borrow_mut().push_back(Deferred::Ack(s));
                }
                let sender_len = desc.len();
                let status = if sender_len > dt.length() {
                    Status::Truncated
                } else {
                    Status::Ok
                };
                let info = TagRecvInfo {
                    sender_tag: desc.tag,
                    length: sender_len,
                };
                dt.unpack(desc.payload());
                match cb {
                    Some(cb) => {
                        // Immediate path: no request allocated.
                        self.deferred.borrow_mut().push_back(Deferred::TagDone {
                            cb,
                            status,
                            info,
                            buf: dt.take_buf(),
                        });
                        Ok(PostRecv::Completed)
                    }
                    None => {
                        // Park the buffer in a completed request so the
                        // poller can reclaim it.
                        let mut reqs = self.reqs.borrow_mut();
                        let generation = self.next_generation();
                        let req = Request::new_tag(dt, desc.tag, TAG_MASK_FULL, None, generation);
                        let index = self.alloc_req(&mut reqs, req)?;
                        {
                            let req = &mut reqs[index];
                            if let ReqKind::Tag { info: i, .. } = &mut req.kind {
                                *i = info;
                            }
                            req.recvd = sender_len;
                            req.set(flags::DATA_DONE);
                        }
                        self.complete_locked(&mut reqs, index, status);
                        Ok(PostRecv::Pending(ReqHandle { index, generation }))
                    }
                }
            }
            DescKind::EagerFirst {
                ep,
                msg_id,
                total_len,
                sync,
            } => {
                let mut reqs = self.reqs.borrow_mut();
                let has_cb = cb.is_some();
                let generation = self.next_generation();
                let req = Request::new_tag(dt, desc.tag, TAG_MASK_FULL, cb, generation);
                let index = self.alloc_req(&mut reqs, req)?;
                {
                    let req = &mut reqs[index];
                    if has_cb {
                        req.set(flags::RELEASED);
                    }
                    req.total_len = total_len;
                    if let ReqKind::Tag { info, frag_key, .. } = &mut req.kind {
                        info.sender_tag = desc.tag;
                        info.length = total_len;
                        *frag_key = Some((ep, msg_id));
                    }
                    if let Some(s) = sync {
                        req.set(flags::SYNC_WAIT_ACK | flags::SYNC_ACK_SENT);
                        self.deferred.borrow_mut().push_back(Deferred::Ack(s));
                    }
                    req.dt.unpack(desc.payload());
                    req.recvd = desc.len();
                }
                let queued = self.frags.borrow_mut().attach((ep, msg_id), index);
                self.desc_released(queued.len());
                for d in queued {
                    let req = &mut reqs[index];
                    req.dt.unpack(d.payload());
                    req.recvd += d.len();
                }
                if self.frag_maybe_done(&mut reqs, index, (ep, msg_id)) && has_cb {
                    return Ok(PostRecv::Completed);
                }
                Ok(PostRecv::Pending(ReqHandle { index, generation }))
            }
            DescKind::Rndv { rts } => {
                let mut reqs = self.reqs.borrow_mut();
                let has_cb = cb.is_some();
                let generation = self.next_generation();
                let req = Request::new_tag(dt, desc.tag, TAG_MASK_FULL, cb, generation);
                let index = self.alloc_req(&mut reqs, req)?;
                {
                    let req = &mut reqs[index];
                    if has_cb {
                        req.set(flags::RELEASED);
                    }
                    req.total_len = rts.size as usize;
                    if let ReqKind::Tag { info, .. } = &mut req.kind {
                        info.sender_tag = desc.tag;
                        info.length = rts.size as usize;
                    }
                }
                let handle = ReqHandle { index, generation };
                self.deferred
                    .borrow_mut()
                    .push_back(Deferred::Rndv { handle, rts });
                trace!("rendezvous matched req={} size={}", index, rts.size);
                Ok(PostRecv::Pending(handle))
            }
            DescKind::EagerMiddle { .. } | DescKind::Stream => {
                unreachable!("only whole-message descriptors sit in the unexpected tag queue")
            }
        }
    }

    /// Check whether a reassembling request got its last byte; if so, close
    /// the association and complete (subject to the sync gate). Returns true
    /// when the request completed.
    fn frag_maybe_done(&self, reqs: &mut Slab<Request>, index: usize, key: (u64, u64)) -> bool {
        let (done, status) = {
            let req = &mut reqs[index];
            if req.recvd < req.total_len {
                return false;
            }
            req.set(flags::DATA_DONE);
            if let ReqKind::Tag { frag_key, .. } = &mut req.kind {
                *frag_key = None;
            }
            let status = if req.total_len > req.dt.length() {
                Status::Truncated
            } else {
                Status::Ok
            };
            (req.completion_gate_passed(), status)
        };
        self.frags.borrow_mut().finish(key);
        if done {
            self.complete_locked(reqs, index, status);
        }
        done
    }

    // ---- delivery ----------------------------------------------------

    /// Deliver one inbound message to the engine.
    ///
    /// Parses the header for `am` off the front of the payload and routes
    /// it: tag matching, fragment reassembly, rendezvous hand-off, or stream
    /// queueing.
    pub fn deliver(&self, am: AmId, payload: Payload<'_>) -> Result<Delivery> {
        let r = match am {
            AmId::EagerOnly => self.deliver_eager_only(false, payload),
            AmId::EagerSyncOnly => self.deliver_eager_only(true, payload),
            AmId::EagerFirst => self.deliver_eager_first(false, payload),
            AmId::EagerSyncFirst => self.deliver_eager_first(true, payload),
            AmId::EagerMiddle => self.deliver_eager_middle(payload),
            AmId::RndvRts => self.deliver_rndv_rts(payload),
            AmId::StreamData => self.deliver_stream(payload),
        };
        self.flush_deferred();
        r
    }

    fn deliver_eager_only(&self, sync: bool, payload: Payload<'_>) -> Result<Delivery> {
        let (hdr, rest) = TagHdr::parse(payload.bytes())?;
        let tag = hdr.tag;
        let (sync_info, hdr_len) = if sync {
            let (s, _) = SyncHdr::parse(rest)?;
            (
                Some(SyncInfo {
                    ep_id: s.ep_id,
                    req_id: s.req_id,
                }),
                TAG_HDR_SIZE + SYNC_HDR_SIZE,
            )
        } else {
            (None, TAG_HDR_SIZE)
        };

        let matched = self.tm.borrow_mut().exp_match(tag);
        match matched {
            Some(index) => {
                let data = &payload.bytes()[hdr_len..];
                let mut reqs = self.reqs.borrow_mut();
                let status = {
                    let req = &mut reqs[index];
                    req.clear(flags::EXPECTED);
                    if let Some(s) = sync_info {
                        req.set(flags::SYNC_WAIT_ACK | flags::SYNC_ACK_SENT);
                        self.deferred.borrow_mut().push_back(Deferred::Ack(s));
                    }
                    if let ReqKind::Tag { info, .. } = &mut req.kind {
                        info.sender_tag = tag;
                        info.length = data.len();
                    }
                    req.dt.unpack(data);
                    req.recvd = data.len();
                    req.set(flags::DATA_DONE);
                    if data.len() > req.dt.length() {
                        Status::Truncated
                    } else {
                        Status::Ok
                    }
                };
                if reqs[index].completion_gate_passed() {
                    self.complete_locked(&mut reqs, index, status);
                }
                trace!("eager tag={:#x} len={} consumed by req={}", tag, data.len(), index);
                Ok(Delivery::Consumed)
            }
            None => {
                self.check_unexp_budget()?;
                let desc = RecvDesc::new(tag, DescKind::EagerOnly { sync: sync_info }, payload, hdr_len);
                self.tm.borrow_mut().unexp_push(desc);
                self.desc_queued(1);
                trace!("eager tag={:#x} queued unexpected", tag);
                Ok(Delivery::Queued)
            }
        }
    }

    fn deliver_eager_first(&self, sync: bool, payload: Payload<'_>) -> Result<Delivery> {
        let (hdr, rest) = EagerFirstHdr::parse(payload.bytes())?;
        let tag = hdr.tag;
        let key = (hdr.ep_id, hdr.msg_id);
        let total_len = hdr.total_len as usize;
        let (sync_info, hdr_len) = if sync {
            let (s, _) = SyncHdr::parse(rest)?;
            (
                Some(SyncInfo {
                    ep_id: s.ep_id,
                    req_id: s.req_id,
                }),
                EAGER_FIRST_HDR_SIZE + SYNC_HDR_SIZE,
            )
        } else {
            (None, EAGER_FIRST_HDR_SIZE)
        };

        let matched = self.tm.borrow_mut().exp_match(tag);
        match matched {
            Some(index) => {
                let data = &payload.bytes()[hdr_len..];
                let mut reqs = self.reqs.borrow_mut();
                {
                    let req = &mut reqs[index];
                    req.clear(flags::EXPECTED);
                    req.total_len = total_len;
                    if let ReqKind::Tag { info, frag_key, .. } = &mut req.kind {
                        info.sender_tag = tag;
                        info.length = total_len;
                        *frag_key = Some(key);
                    }
                    if let Some(s) = sync_info {
                        req.set(flags::SYNC_WAIT_ACK | flags::SYNC_ACK_SENT);
                        self.deferred.borrow_mut().push_back(Deferred::Ack(s));
                    }
                    req.dt.unpack(data);
                    req.recvd = data.len();
                }
                // First fragment of a fresh message: nothing can be queued
                // yet, this just pins the request.
                let queued = self.frags.borrow_mut().attach(key, index);
                debug_assert!(queued.is_empty());
                self.frag_maybe_done(&mut reqs, index, key);
                trace!("eager-first tag={:#x} total={} matched req={}", tag, total_len, index);
                Ok(Delivery::Consumed)
            }
            None => {
                self.check_unexp_budget()?;
                self.frags.borrow_mut().start_unmatched(key);
                let desc = RecvDesc::new(
                    tag,
                    DescKind::EagerFirst {
                        ep: key.0,
                        msg_id: key.1,
                        total_len,
                        sync: sync_info,
                    },
                    payload,
                    hdr_len,
                );
                self.tm.borrow_mut().unexp_push(desc);
                self.desc_queued(1);
                trace!("eager-first tag={:#x} total={} queued unexpected", tag, total_len);
                Ok(Delivery::Queued)
            }
        }
    }

    fn deliver_eager_middle(&self, payload: Payload<'_>) -> Result<Delivery> {
        let (hdr, _) = EagerMiddleHdr::parse(payload.bytes())?;
        let key = (hdr.ep_id, hdr.msg_id);

        let mut frags = self.frags.borrow_mut();
        match frags.get_mut(key) {
            None => panic!(
                "middle fragment for unknown message id {:#x} on endpoint {:#x}",
                key.1, key.0
            ),
            Some(FragList::Unmatched(q)) => {
                self.check_unexp_budget()?;
                q.push_back(RecvDesc::new(
                    0,
                    DescKind::EagerMiddle {
                        ep: key.0,
                        msg_id: key.1,
                    },
                    payload,
                    EAGER_MIDDLE_HDR_SIZE,
                ));
                self.desc_queued(1);
                Ok(Delivery::Queued)
            }
            Some(FragList::Matched(index)) => {
                let index = *index;
                drop(frags);
                let data = &payload.bytes()[EAGER_MIDDLE_HDR_SIZE..];
                let mut reqs = self.reqs.borrow_mut();
                {
                    let req = &mut reqs[index];
                    req.dt.unpack(data);
                    req.recvd += data.len();
                }
                self.frag_maybe_done(&mut reqs, index, key);
                Ok(Delivery::Consumed)
            }
        }
    }

    fn deliver_rndv_rts(&self, payload: Payload<'_>) -> Result<Delivery> {
        let (hdr, _) = RndvRtsHdr::parse(payload.bytes())?;
        let tag = hdr.tag;
        let rts = RndvRts {
            seq: hdr.seq,
            size: hdr.size,
            address: hdr.address,
        };

        let matched = self.tm.borrow_mut().exp_match(tag);
        match matched {
            Some(index) => {
                let mut reqs = self.reqs.borrow_mut();
                let generation = {
                    let req = &mut reqs[index];
                    req.clear(flags::EXPECTED);
                    req.total_len = rts.size as usize;
                    if let ReqKind::Tag { info, .. } = &mut req.kind {
                        info.sender_tag = tag;
                        info.length = rts.size as usize;
                    }
                    req.generation
                };
                let handle = ReqHandle { index, generation };
                self.deferred
                    .borrow_mut()
                    .push_back(Deferred::Rndv { handle, rts });
                trace!("rts tag={:#x} size={} matched req={}", tag, rts.size, index);
                Ok(Delivery::Consumed)
            }
            None => {
                self.check_unexp_budget()?;
                // The RTS carries no inline payload; the descriptor is empty.
                let hdr_len = payload.bytes().len();
                let desc = RecvDesc::new(tag, DescKind::Rndv { rts }, payload, hdr_len);
                self.tm.borrow_mut().unexp_push(desc);
                self.desc_queued(1);
                Ok(Delivery::Queued)
            }
        }
    }

    fn deliver_stream(&self, payload: Payload<'_>) -> Result<Delivery> {
        let (hdr, _) = StreamHdr::parse(payload.bytes())?;
        let ep = hdr.ep_id;
        let total = payload.bytes().len();
        let mut off = STREAM_HDR_SIZE;
        if off == total {
            // Zero-length stream data is a no-op.
            return Ok(Delivery::Consumed);
        }

        let mut streams = self.streams.borrow_mut();
        let eps = streams.get_or_create(ep);
        if !eps.has_data() {
            // Pending requests drain the data head-first.
            let mut reqs = self.reqs.borrow_mut();
            while off < total {
                let index = match eps.head_req() {
                    Some(i) => i,
                    None => break,
                };
                let exhausted = {
                    let req = &mut reqs[index];
                    let n = req.dt.unpack(&payload.bytes()[off..]);
                    req.recvd += n;
                    off += n;
                    off == total
                };
                if reqs[index].dt.remaining() == 0
                    || (exhausted && reqs[index].can_complete_stream())
                {
                    eps.pop_req();
                    reqs[index].clear(flags::STREAM_QUEUED);
                    reqs[index].set(flags::DATA_DONE);
                    self.complete_locked(&mut reqs, index, Status::Ok);
                } else if exhausted {
                    // Partially filled, below its completion granularity.
                    break;
                }
            }
        }
        if off == total {
            trace!("stream ep={:#x} len={} consumed", ep, total - STREAM_HDR_SIZE);
            return Ok(Delivery::Consumed);
        }

        self.check_unexp_budget()?;
        let desc = if off == STREAM_HDR_SIZE {
            RecvDesc::new(0, DescKind::Stream, payload, STREAM_HDR_SIZE)
        } else {
            RecvDesc::new(0, DescKind::Stream, Payload::Borrowed(&payload.bytes()[off..]), 0)
        };
        eps.push_desc(desc);
        self.desc_queued(1);
        trace!("stream ep={:#x} queued {} bytes", ep, total - off);
        Ok(Delivery::Queued)
    }

    // ---- stream receives ---------------------------------------------

    /// Post a stream receive on an endpoint.
    ///
    /// Queued data is delivered in place when possible: the fast path fills
    /// the buffer from the head of the queue, rounded down to element
    /// granularity, without allocating a request. A zero-length receive
    /// completes immediately and never consumes queued data.
    pub fn stream_recv(
        &self,
        dt: DtIter,
        ep: u64,
        stream_flags: StreamFlags,
        cb: Option<StreamRecvCb>,
    ) -> Result<StreamRecv> {
        let r = self.stream_recv_inner(dt, ep, stream_flags, cb);
        self.flush_deferred();
        r
    }

    fn stream_recv_inner(
        &self,
        mut dt: DtIter,
        ep: u64,
        stream_flags: StreamFlags,
        cb: Option<StreamRecvCb>,
    ) -> Result<StreamRecv> {
        let waitall = stream_flags.contains(StreamFlags::WAITALL);
        if waitall && dt.length() == 0 {
            return Err(Error::InvalidParam("waitall receive with zero-length buffer"));
        }
        if dt.length() == 0 {
            return Ok(StreamRecv::Data {
                buf: dt.take_buf(),
                length: 0,
            });
        }

        if let Some(length) = self.stream_try_recv_inplace(&mut dt, ep, waitall) {
            trace!("stream_recv ep={:#x} in place {} bytes", ep, length);
            return match cb {
                Some(cb) => {
                    self.deferred.borrow_mut().push_back(Deferred::StreamDone {
                        cb,
                        status: Status::Ok,
                        length,
                        buf: dt.take_buf(),
                    });
                    Ok(StreamRecv::Completed)
                }
                None => Ok(StreamRecv::Data {
                    buf: dt.take_buf(),
                    length,
                }),
            };
        }
        if stream_flags.contains(StreamFlags::IMMEDIATE) {
            return Err(Error::NoResource);
        }

        let mut reqs = self.reqs.borrow_mut();
        let has_cb = cb.is_some();
        let generation = self.next_generation();
        let req = Request::new_stream(dt, ep, waitall, cb, generation);
        let index = self.alloc_req(&mut reqs, req)?;
        if has_cb {
            reqs[index].set(flags::RELEASED);
        }

        // Drain whatever is queued before deciding to wait. A generic
        // destination takes at most one descriptor per call unless waitall,
        // since its completion granularity is unknown.
        let mut streams = self.streams.borrow_mut();
        let eps = streams.get_or_create(ep);
        let generic = reqs[index].dt.class() == DtClass::Generic;
        let mut released = 0;
        while reqs[index].dt.remaining() > 0 {
            let head = match eps.head_desc_mut() {
                Some(h) => h,
                None => break,
            };
            let req = &mut reqs[index];
            let n = req.dt.unpack(head.payload());
            req.recvd += n;
            if n == head.len() {
                eps.pop_desc();
                released += 1;
            } else {
                head.advance(n);
            }
            if generic && !waitall {
                break;
            }
        }
        self.desc_released(released);

        if reqs[index].can_complete_stream() {
            reqs[index].set(flags::DATA_DONE);
            self.complete_locked(&mut reqs, index, Status::Ok);
            return Ok(if has_cb {
                StreamRecv::Completed
            } else {
                StreamRecv::Pending(ReqHandle { index, generation })
            });
        }
        reqs[index].set(flags::STREAM_QUEUED);
        eps.push_req(index);
        trace!("stream_recv ep={:#x} queued req={}", ep, index);
        Ok(StreamRecv::Pending(ReqHandle { index, generation }))
    }

    /// In-place fast path: fill `dt` from the endpoint's queued data
    /// without allocating a request. Returns the delivered length, or None
    /// when the fast path does not apply.
    fn stream_try_recv_inplace(&self, dt: &mut DtIter, ep: u64, waitall: bool) -> Option<usize> {
        if dt.class() == DtClass::Generic {
            return None;
        }
        let mut streams = self.streams.borrow_mut();
        let eps = streams.get_mut(ep)?;
        if !eps.has_data() {
            return None;
        }
        let available = eps.data_len();
        let mut want = dt.remaining().min(available);
        if want < dt.remaining() {
            if waitall {
                return None;
            }
            want -= want % dt.elem_size();
            if want == 0 {
                return None;
            }
        }
        let length = want;
        let mut released = 0;
        while want > 0 {
            let head = eps.head_desc_mut().expect("accounted data present");
            let n = want.min(head.len());
            dt.unpack(&head.payload()[..n]);
            want -= n;
            if n == head.len() {
                eps.pop_desc();
                released += 1;
            } else {
                head.advance(n);
            }
        }
        self.desc_released(released);
        Some(length)
    }

    /// Extract the head of an endpoint's queued data zero-copy. The guard
    /// releases the descriptor on drop.
    pub fn stream_recv_data(&self, ep: u64) -> Option<StreamData> {
        let mut streams = self.streams.borrow_mut();
        let desc = streams.get_mut(ep)?.pop_desc()?;
        self.desc_released(1);
        Some(desc.into_stream_data())
    }

    /// Release extracted stream data. Equivalent to dropping the guard.
    pub fn stream_data_release(&self, data: StreamData) {
        drop(data);
    }

    /// Tear down an endpoint's stream state: unconsumed data is dropped and
    /// every pending request completes with `status`.
    pub fn stream_ep_cleanup(&self, ep: u64, status: Status) {
        let taken = self.streams.borrow_mut().take(ep);
        let Some(epq) = taken else { return };
        let mut reqs = self.reqs.borrow_mut();
        for entry in epq.into_entries() {
            match entry {
                StreamEntry::Desc(_) => self.desc_released(1),
                StreamEntry::Req(index) => {
                    reqs[index].clear(flags::STREAM_QUEUED);
                    reqs[index].set(flags::DATA_DONE);
                    self.complete_locked(&mut reqs, index, status);
                }
            }
        }
        drop(reqs);
        trace!("stream ep={:#x} cleaned up", ep);
        self.flush_deferred();
    }

    // ---- rendezvous --------------------------------------------------

    /// Unpack incrementally into a rendezvous request's buffer. Fails with
    /// [`Error::Truncated`] (unpacking nothing) when the chunk does not fit.
    pub fn rndv_unpack(&self, handle: ReqHandle, data: &[u8]) -> Result<usize> {
        let mut reqs = self.reqs.borrow_mut();
        let req = reqs
            .get_mut(handle.index)
            .filter(|r| r.generation == handle.generation)
            .ok_or(Error::InvalidParam("stale request handle"))?;
        if data.len() > req.dt.remaining() {
            return Err(Error::Truncated {
                length: req.dt.offset() + data.len(),
                capacity: req.dt.length(),
            });
        }
        let n = req.dt.unpack(data);
        req.recvd += n;
        Ok(n)
    }

    /// Complete a rendezvous request once the transfer subsystem finishes.
    /// `length` is the sender's message length, reported in the completion
    /// info.
    pub fn rndv_complete(&self, handle: ReqHandle, status: Status, length: usize) -> Result<()> {
        {
            let mut reqs = self.reqs.borrow_mut();
            {
                let req = reqs
                    .get_mut(handle.index)
                    .filter(|r| r.generation == handle.generation)
                    .ok_or(Error::InvalidParam("stale request handle"))?;
                if let ReqKind::Tag { info, .. } = &mut req.kind {
                    info.length = length;
                }
                req.set(flags::DATA_DONE);
            }
            self.complete_locked(&mut reqs, handle.index, status);
        }
        self.flush_deferred();
        Ok(())
    }

    // ---- request lifecycle -------------------------------------------

    /// Cancel a pending request. Returns true iff this call completed it
    /// (with `Status::Canceled`; the callback sees the bytes delivered so
    /// far). Requests already matched into reassembly or rendezvous cannot
    /// be canceled.
    pub fn cancel(&self, handle: ReqHandle) -> bool {
        let canceled = {
            let mut reqs = self.reqs.borrow_mut();
            let ok = {
                let req = match reqs.get_mut(handle.index) {
                    Some(r) if r.generation == handle.generation && !r.is_completed() => r,
                    _ => return false,
                };
                if req.test(flags::EXPECTED) {
                    let removed = self.tm.borrow_mut().exp_remove(handle.index);
                    debug_assert!(removed);
                    req.clear(flags::EXPECTED);
                    true
                } else if req.test(flags::STREAM_QUEUED) {
                    let ep = match &req.kind {
                        ReqKind::Stream { ep, .. } => *ep,
                        ReqKind::Tag { .. } => unreachable!(),
                    };
                    let removed = self
                        .streams
                        .borrow_mut()
                        .get_mut(ep)
                        .map(|e| e.remove_req(handle.index))
                        .unwrap_or(false);
                    debug_assert!(removed);
                    req.clear(flags::STREAM_QUEUED);
                    true
                } else {
                    false
                }
            };
            if ok {
                self.complete_locked(&mut reqs, handle.index, Status::Canceled);
                trace!("canceled req={}", handle.index);
            }
            ok
        };
        self.flush_deferred();
        canceled
    }

    /// Poll a request for completion. A handle whose slot was recycled
    /// reports completed.
    pub fn is_completed(&self, handle: ReqHandle) -> bool {
        let reqs = self.reqs.borrow();
        match reqs.get(handle.index) {
            Some(req) if req.generation == handle.generation => req.is_completed(),
            _ => true,
        }
    }

    /// Return request ownership to the engine. For a completed
    /// callback-less request this hands back the parked destination buffer;
    /// otherwise the slot is freed once the request completes.
    pub fn request_free(&self, handle: ReqHandle) -> Option<RecvBuf> {
        let mut reqs = self.reqs.borrow_mut();
        let req = reqs.get_mut(handle.index)?;
        if req.generation != handle.generation {
            return None;
        }
        req.set(flags::RELEASED);
        if req.is_completed() {
            let buf = req.parked.take();
            reqs.remove(handle.index);
            buf
        } else {
            None
        }
    }

    // ---- internals ---------------------------------------------------

    fn next_generation(&self) -> u64 {
        let g = self.generation.get();
        self.generation.set(g + 1);
        g
    }

    fn alloc_req(&self, reqs: &mut Slab<Request>, req: Request) -> Result<usize> {
        if reqs.len() >= self.config.max_requests {
            return Err(Error::NoMemory);
        }
        Ok(reqs.insert(req))
    }

    fn check_unexp_budget(&self) -> Result<()> {
        if self.desc_count.get() >= self.config.max_unexpected {
            return Err(Error::NoMemory);
        }
        Ok(())
    }

    #[inline]
    fn desc_queued(&self, n: usize) {
        self.desc_count.set(self.desc_count.get() + n);
    }

    #[inline]
    fn desc_released(&self, n: usize) {
        debug_assert!(self.desc_count.get() >= n);
        self.desc_count.set(self.desc_count.get() - n);
    }

    /// Complete a request exactly once: set the terminal flag, stage the
    /// callback (or park the buffer), and free the slot if ownership was
    /// already returned. The caller has removed the request from any queue.
    fn complete_locked(&self, reqs: &mut Slab<Request>, index: usize, status: Status) {
        let released = {
            let req = &mut reqs[index];
            assert!(!req.is_completed(), "request {} completed twice", index);
            req.set(flags::COMPLETED);
            req.status = status;
            let buf = req.dt.take_buf();
            let length = req.dt.offset();
            match &mut req.kind {
                ReqKind::Tag { info, cb, .. } => {
                    let info = *info;
                    match cb.take() {
                        Some(cb) => self.deferred.borrow_mut().push_back(Deferred::TagDone {
                            cb,
                            status,
                            info,
                            buf,
                        }),
                        None => req.parked = Some(buf),
                    }
                }
                ReqKind::Stream { cb, .. } => match cb.take() {
                    Some(cb) => self.deferred.borrow_mut().push_back(Deferred::StreamDone {
                        cb,
                        status,
                        length,
                        buf,
                    }),
                    None => req.parked = Some(buf),
                },
            }
            req.test(flags::RELEASED)
        };
        trace!("completed req={} status={}", index, status);
        if released {
            reqs.remove(index);
        }
    }

    /// Run staged callbacks and hooks with no internal borrows held, one at
    /// a time so a callback may reenter the worker.
    fn flush_deferred(&self) {
        loop {
            let item = self.deferred.borrow_mut().pop_front();
            let Some(item) = item else { break };
            match item {
                Deferred::TagDone {
                    cb,
                    status,
                    info,
                    buf,
                } => cb(status, info, buf),
                Deferred::StreamDone {
                    cb,
                    status,
                    length,
                    buf,
                } => cb(status, length, buf),
                Deferred::Rndv { handle, rts } => {
                    if let Some(hook) = &self.rndv_cb {
                        hook(handle, rts);
                    }
                }
                Deferred::Ack(s) => {
                    if let Some(hook) = &self.ack_cb {
                        hook(s);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn eager_only(tag: u64, data: &[u8]) -> Vec<u8> {
        let mut msg = vec![0u8; TAG_HDR_SIZE + data.len()];
        unsafe { TagHdr::new(tag).write_to(msg.as_mut_ptr()) };
        msg[TAG_HDR_SIZE..].copy_from_slice(data);
        msg
    }

    fn contig(len: usize) -> DtIter {
        DtIter::contig(vec![0u8; len], len, 1).unwrap()
    }

    #[test]
    fn test_expected_then_deliver() {
        let w = Worker::default();
        let got = Rc::new(RefCell::new(None));
        let got2 = got.clone();
        let r = w
            .tag_recv(
                contig(4),
                0x10,
                TAG_MASK_FULL,
                Some(Box::new(move |status, info, buf| {
                    *got2.borrow_mut() = Some((status, info, buf.into_contig()));
                })),
            )
            .unwrap();
        assert!(matches!(r, PostRecv::Pending(_)));
        assert!(got.borrow().is_none());

        let d = w
            .deliver(AmId::EagerOnly, Payload::Borrowed(&eager_only(0x10, &[1, 2, 3, 4])))
            .unwrap();
        assert_eq!(d, Delivery::Consumed);
        let (status, info, buf) = got.borrow_mut().take().unwrap();
        assert!(status.is_ok());
        assert_eq!(info.sender_tag, 0x10);
        assert_eq!(info.length, 4);
        assert_eq!(buf, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_unexpected_then_recv_no_alloc() {
        let w = Worker::default();
        let d = w
            .deliver(AmId::EagerOnly, Payload::Borrowed(&eager_only(7, &[9, 9])))
            .unwrap();
        assert_eq!(d, Delivery::Queued);

        let got = Rc::new(RefCell::new(None));
        let got2 = got.clone();
        let r = w
            .tag_recv(
                contig(2),
                7,
                TAG_MASK_FULL,
                Some(Box::new(move |status, _info, buf| {
                    *got2.borrow_mut() = Some((status, buf.into_contig()));
                })),
            )
            .unwrap();
        assert!(matches!(r, PostRecv::Completed));
        let (status, buf) = got.borrow_mut().take().unwrap();
        assert!(status.is_ok());
        assert_eq!(buf, vec![9, 9]);
    }

    #[test]
    fn test_truncation_reports_sender_length() {
        let w = Worker::default();
        w.deliver(AmId::EagerOnly, Payload::Borrowed(&eager_only(1, &[1, 2, 3, 4, 5])))
            .unwrap();

        let got = Rc::new(RefCell::new(None));
        let got2 = got.clone();
        w.tag_recv(
            contig(3),
            1,
            TAG_MASK_FULL,
            Some(Box::new(move |status, info, buf| {
                *got2.borrow_mut() = Some((status, info.length, buf.into_contig()));
            })),
        )
        .unwrap();
        let (status, length, buf) = got.borrow_mut().take().unwrap();
        assert_eq!(status, Status::Truncated);
        assert_eq!(length, 5);
        assert_eq!(buf, vec![1, 2, 3]);
    }

    #[test]
    fn test_poll_path_parks_buffer() {
        let w = Worker::default();
        let r = w.tag_recv(contig(2), 5, TAG_MASK_FULL, None).unwrap();
        let handle = match r {
            PostRecv::Pending(h) => h,
            PostRecv::Completed => unreachable!(),
        };
        assert!(!w.is_completed(handle));

        w.deliver(AmId::EagerOnly, Payload::Borrowed(&eager_only(5, &[8, 8])))
            .unwrap();
        assert!(w.is_completed(handle));
        let buf = w.request_free(handle).unwrap().into_contig();
        assert_eq!(buf, vec![8, 8]);
    }

    #[test]
    fn test_request_limit() {
        let w = Worker::new(WorkerConfig::new().with_max_requests(1));
        let r1 = w.tag_recv(contig(1), 1, TAG_MASK_FULL, None);
        assert!(r1.is_ok());
        let r2 = w.tag_recv(contig(1), 2, TAG_MASK_FULL, None);
        assert!(matches!(r2, Err(Error::NoMemory)));
    }

    #[test]
    fn test_unexpected_limit() {
        let w = Worker::new(WorkerConfig::new().with_max_unexpected(1));
        assert!(w
            .deliver(AmId::EagerOnly, Payload::Borrowed(&eager_only(1, &[1])))
            .is_ok());
        let r = w.deliver(AmId::EagerOnly, Payload::Borrowed(&eager_only(2, &[2])));
        assert!(matches!(r, Err(Error::NoMemory)));
        // Consuming the queued message frees budget.
        assert!(w.tag_probe(1, TAG_MASK_FULL).is_some());
        assert!(w
            .deliver(AmId::EagerOnly, Payload::Borrowed(&eager_only(2, &[2])))
            .is_ok());
    }

    #[test]
    fn test_cancel_expected() {
        let w = Worker::default();
        let got = Rc::new(RefCell::new(None));
        let got2 = got.clone();
        let handle = match w
            .tag_recv(
                contig(4),
                3,
                TAG_MASK_FULL,
                Some(Box::new(move |status, _, _| {
                    *got2.borrow_mut() = Some(status);
                })),
            )
            .unwrap()
        {
            PostRecv::Pending(h) => h,
            PostRecv::Completed => unreachable!(),
        };
        assert!(w.cancel(handle));
        assert_eq!(got.borrow_mut().take(), Some(Status::Canceled));
        // A second cancel sees a dead handle.
        assert!(!w.cancel(handle));
    }
}
