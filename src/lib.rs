//! # rxmatch - Receive-side message matching engine
//!
//! This crate implements the receive half of a point-to-point messaging
//! layer: tag matching, fragmented eager delivery, rendezvous hand-off, and
//! per-endpoint byte streams. A transport feeds inbound messages in through
//! [`Worker::deliver`]; the application posts receives against tags or
//! endpoints, and the engine pairs the two sides in either arrival order.
//!
//! ## Features
//!
//! - **Tag matching**: 64-bit tag with a wildcard mask, strict-FIFO
//!   first-match semantics across the expected and unexpected queues
//! - **Eager protocol**: single-fragment and multi-fragment reassembly,
//!   with sync-flagged messages gated on a receipt acknowledgment
//! - **Rendezvous hand-off**: matched large messages are handed to an
//!   external transfer subsystem and completed through the request handle
//! - **Stream delivery**: per-endpoint FIFO byte streams with an in-place
//!   fast path, partial consumption, and zero-copy extraction
//! - **Non-blocking requests**: callback or polled completion, cancellation,
//!   exactly-once semantics
//!
//! ## Usage
//!
//! ```ignore
//! use rxmatch::{AmId, DtIter, Payload, PostRecv, Worker, WorkerConfig, TAG_MASK_FULL};
//!
//! let config = WorkerConfig::default().with_max_requests(4096);
//! let worker = Worker::new(config);
//!
//! // Post a tagged receive.
//! let dt = DtIter::contig(vec![0u8; 4096], 4096, 1)?;
//! let recv = worker.tag_recv(dt, 0x10, TAG_MASK_FULL, Some(Box::new(
//!     |status, info, buf| {
//!         println!("tag {:#x}: {} bytes, {}", info.sender_tag, info.length, status);
//!     },
//! )))?;
//!
//! // Feed inbound messages from the transport.
//! loop {
//!     let (am_id, bytes) = transport.next_message()?;
//!     worker.deliver(am_id, Payload::Borrowed(&bytes))?;
//! }
//! ```
//!
//! ## Architecture
//!
//! The crate is organized as follows:
//!
//! - [`config`]: Worker configuration (`WorkerConfig`)
//! - [`packet`]: Wire header formats (`TagHdr`, `EagerFirstHdr`, ...)
//! - [`dt`]: Datatype iterator over receive destinations (`DtIter`)
//! - [`desc`]: Receive descriptors and payload ownership (`Payload`)
//! - [`request`]: Request state machine and handles (`ReqHandle`)
//! - [`tag_match`]: Expected/unexpected tag queues
//! - [`frag`]: Eager fragment reassembly
//! - [`stream`]: Per-endpoint stream queues
//! - [`worker`]: Main engine API (`Worker`)
//!
//! The worker is single-threaded: it is neither `Send` nor `Sync`, and all
//! public methods take `&self` through interior mutability. Completion
//! callbacks run with no internal state borrowed, so they may reenter the
//! worker.

pub mod config;
pub mod desc;
pub mod dt;
pub mod error;
pub mod packet;
pub mod request;
pub mod worker;

mod frag;
mod stream;
mod tag_match;

// Re-export main types
pub use config::WorkerConfig;
pub use desc::{Payload, RndvRts, StreamData, SyncInfo, TagMessage};
pub use dt::{DtClass, DtIter, RecvBuf};
pub use error::{Error, Result, Status};
pub use packet::{
    AmId, EagerFirstHdr, EagerMiddleHdr, RndvRtsHdr, StreamHdr, SyncHdr, TagHdr,
    EAGER_FIRST_HDR_SIZE, EAGER_MIDDLE_HDR_SIZE, RNDV_RTS_HDR_SIZE, STREAM_HDR_SIZE,
    SYNC_HDR_SIZE, TAG_HDR_SIZE,
};
pub use request::{ReqHandle, StreamRecvCb, TagRecvCb, TagRecvInfo};
pub use worker::{Delivery, PostRecv, StreamFlags, StreamRecv, Worker, TAG_MASK_FULL};
