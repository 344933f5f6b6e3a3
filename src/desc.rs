//! Receive descriptors: transient holders for unmatched inbound payloads.
//!
//! A descriptor is created only when inbound data finds no waiting request,
//! and is destroyed the moment it is fully consumed. Exactly one owner holds
//! it at any time — the queue it sits in, or the caller between dequeue and
//! release — which Rust enforces by move. Stream descriptors shrink in place
//! on partial consumption instead of being reallocated.

use std::ops::Deref;

/// Inbound payload ownership at the delivery boundary.
///
/// `Owned` transfers the bytes to the engine (queued zero-copy, header and
/// all, with the payload found by offset). `Borrowed` lends them for the
/// duration of the call only; if the engine must queue, it copies.
pub enum Payload<'a> {
    /// Descriptor ownership transferred to the engine.
    Owned(Vec<u8>),
    /// Payload valid only for this call; queueing forces an internal copy.
    Borrowed(&'a [u8]),
}

impl Payload<'_> {
    /// View the full message bytes (header included).
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        match self {
            Payload::Owned(v) => v,
            Payload::Borrowed(s) => s,
        }
    }
}

/// Sync-eager acknowledgment target, parsed from the wire sync header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncInfo {
    /// Sending endpoint id.
    pub ep_id: u64,
    /// Sender-side request id to acknowledge.
    pub req_id: u64,
}

/// Remote-descriptor info handed to the rendezvous subsystem on a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RndvRts {
    /// Rendezvous sequence number.
    pub seq: u64,
    /// Total message size in bytes.
    pub size: u64,
    /// Remote buffer address (opaque to this engine).
    pub address: u64,
}

/// What kind of message a descriptor holds, driving the match-time branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DescKind {
    /// Complete eager message in one fragment.
    EagerOnly { sync: Option<SyncInfo> },
    /// First fragment of a multi-fragment eager message.
    EagerFirst {
        ep: u64,
        msg_id: u64,
        total_len: usize,
        sync: Option<SyncInfo>,
    },
    /// Middle or last fragment, queued by the reassembler.
    EagerMiddle { ep: u64, msg_id: u64 },
    /// Rendezvous RTS awaiting a matching request.
    Rndv { rts: RndvRts },
    /// Stream bytes for a per-endpoint FIFO.
    Stream,
}

/// A queued unmatched payload.
pub(crate) struct RecvDesc {
    bytes: Vec<u8>,
    payload_offset: usize,
    length: usize,
    pub(crate) tag: u64,
    pub(crate) kind: DescKind,
}

impl RecvDesc {
    /// Build a descriptor from an inbound message whose header occupies the
    /// first `hdr_len` bytes. Owned payloads are kept whole and addressed by
    /// offset; borrowed ones are copied from the payload portion.
    pub(crate) fn new(tag: u64, kind: DescKind, payload: Payload<'_>, hdr_len: usize) -> Self {
        match payload {
            Payload::Owned(bytes) => {
                debug_assert!(hdr_len <= bytes.len());
                let length = bytes.len() - hdr_len;
                Self {
                    bytes,
                    payload_offset: hdr_len,
                    length,
                    tag,
                    kind,
                }
            }
            Payload::Borrowed(msg) => {
                let bytes = msg[hdr_len..].to_vec();
                let length = bytes.len();
                Self {
                    bytes,
                    payload_offset: 0,
                    length,
                    tag,
                    kind,
                }
            }
        }
    }

    /// Remaining payload bytes.
    #[inline]
    pub(crate) fn payload(&self) -> &[u8] {
        &self.bytes[self.payload_offset..self.payload_offset + self.length]
    }

    /// Remaining payload length.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.length
    }

    /// Consume `n` bytes from the front (stream partial delivery).
    pub(crate) fn advance(&mut self, n: usize) {
        assert!(n <= self.length, "descriptor consumed past its length");
        self.payload_offset += n;
        self.length -= n;
    }

    /// Logical length of the message this descriptor announces: the total
    /// length for a first fragment or rendezvous, the payload length
    /// otherwise.
    pub(crate) fn message_len(&self) -> usize {
        match self.kind {
            DescKind::EagerFirst { total_len, .. } => total_len,
            DescKind::Rndv { rts } => rts.size as usize,
            _ => self.length,
        }
    }

    /// Convert into a zero-copy extraction guard (stream mode).
    pub(crate) fn into_stream_data(self) -> StreamData {
        StreamData {
            bytes: self.bytes,
            offset: self.payload_offset,
            length: self.length,
        }
    }
}

/// Queued stream data extracted zero-copy from an endpoint's queue.
///
/// Dereferences to the payload bytes. The underlying descriptor is released
/// exactly once, when this guard drops (or via
/// [`Worker::stream_data_release`](crate::Worker::stream_data_release)).
pub struct StreamData {
    bytes: Vec<u8>,
    offset: usize,
    length: usize,
}

impl Deref for StreamData {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        &self.bytes[self.offset..self.offset + self.length]
    }
}

/// An unexpected tagged message handed out by
/// [`Worker::tag_probe`](crate::Worker::tag_probe).
///
/// The caller owns the underlying descriptor until it passes the message to
/// [`Worker::tag_msg_recv`](crate::Worker::tag_msg_recv) or drops it.
pub struct TagMessage {
    pub(crate) desc: RecvDesc,
}

impl TagMessage {
    /// The sender's tag.
    #[inline]
    pub fn sender_tag(&self) -> u64 {
        self.desc.tag
    }

    /// Total logical length of the message.
    #[inline]
    pub fn length(&self) -> usize {
        self.desc.message_len()
    }
}
