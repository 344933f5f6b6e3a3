//! Active-message headers for the receive path.
//!
//! Every inbound message starts with one of these fixed-size headers,
//! selected by the active-message id. All fields are little-endian. Headers
//! are parsed off the front of the payload with [`parse`](TagHdr::parse)-style
//! functions that return the header together with the remaining payload
//! slice, so no caller ever does its own pointer arithmetic into the buffer.

use crate::error::{Error, Result};

/// Tag header size in bytes.
pub const TAG_HDR_SIZE: usize = 8;

/// Eager-first-fragment header size in bytes.
pub const EAGER_FIRST_HDR_SIZE: usize = 32;

/// Eager-middle-fragment header size in bytes.
pub const EAGER_MIDDLE_HDR_SIZE: usize = 16;

/// Sync header size in bytes.
pub const SYNC_HDR_SIZE: usize = 16;

/// Stream header size in bytes.
pub const STREAM_HDR_SIZE: usize = 8;

/// Rendezvous RTS header size in bytes.
pub const RNDV_RTS_HDR_SIZE: usize = 32;

/// Active-message id: selects the header layout and the delivery semantics
/// of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AmId {
    /// Entire tagged message in one fragment. [`TagHdr`] + payload.
    EagerOnly = 0,
    /// Single-fragment synchronous eager. [`TagHdr`] + [`SyncHdr`] + payload.
    EagerSyncOnly = 1,
    /// First fragment of a multi-fragment eager message.
    /// [`EagerFirstHdr`] + payload.
    EagerFirst = 2,
    /// First fragment, synchronous variant.
    /// [`EagerFirstHdr`] + [`SyncHdr`] + payload.
    EagerSyncFirst = 3,
    /// Middle or last fragment. [`EagerMiddleHdr`] + payload.
    EagerMiddle = 4,
    /// Rendezvous ready-to-send. [`RndvRtsHdr`], no eager payload.
    RndvRts = 5,
    /// Stream data. [`StreamHdr`] + payload.
    StreamData = 6,
}

impl TryFrom<u8> for AmId {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(AmId::EagerOnly),
            1 => Ok(AmId::EagerSyncOnly),
            2 => Ok(AmId::EagerFirst),
            3 => Ok(AmId::EagerSyncFirst),
            4 => Ok(AmId::EagerMiddle),
            5 => Ok(AmId::RndvRts),
            6 => Ok(AmId::StreamData),
            _ => Err(Error::InvalidParam("unknown active-message id")),
        }
    }
}

impl AmId {
    /// Check if this id carries the synchronous-eager ack requirement.
    #[inline]
    pub fn is_sync(self) -> bool {
        matches!(self, AmId::EagerSyncOnly | AmId::EagerSyncFirst)
    }
}

macro_rules! hdr_common {
    ($name:ident, $size:expr) => {
        impl $name {
            /// Serialize the header to a byte buffer.
            ///
            /// # Safety
            /// The destination must be at least `$size` bytes.
            #[inline]
            pub unsafe fn write_to(&self, dst: *mut u8) {
                unsafe {
                    std::ptr::copy_nonoverlapping(self as *const Self as *const u8, dst, $size);
                }
            }

            /// Deserialize a header from a byte buffer.
            ///
            /// # Safety
            /// The source must be at least `$size` bytes.
            #[inline]
            pub unsafe fn read_from(src: *const u8) -> Self {
                unsafe {
                    let mut hdr = std::mem::MaybeUninit::<Self>::uninit();
                    std::ptr::copy_nonoverlapping(src, hdr.as_mut_ptr() as *mut u8, $size);
                    hdr.assume_init()
                }
            }

            /// Split the header off the front of a message, returning it
            /// together with the remaining payload bytes.
            pub fn parse(bytes: &[u8]) -> Result<(Self, &[u8])> {
                if bytes.len() < $size {
                    return Err(Error::InvalidParam(concat!(
                        "message shorter than ",
                        stringify!($name)
                    )));
                }
                let hdr = unsafe { Self::read_from(bytes.as_ptr()) };
                Ok((hdr, &bytes[$size..]))
            }
        }
    };
}

/// Tag header (8 bytes), preceding every single-fragment eager payload.
///
/// Layout:
/// ```text
/// Offset  Size  Field
/// 0       8     tag (sender tag, little-endian)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct TagHdr {
    /// Sender tag.
    pub tag: u64,
}

impl TagHdr {
    /// Create a new tag header.
    pub fn new(tag: u64) -> Self {
        Self { tag }
    }
}

hdr_common!(TagHdr, TAG_HDR_SIZE);

/// Eager-first-fragment header (32 bytes).
///
/// Present only on the first fragment of a multi-fragment eager message; the
/// (endpoint, message id) pair correlates the remaining fragments and
/// `total_len` carries the total logical message length.
///
/// Layout:
/// ```text
/// Offset  Size  Field
/// 0       8     tag
/// 8       8     ep_id
/// 16      8     msg_id
/// 24      8     total_len
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct EagerFirstHdr {
    /// Sender tag.
    pub tag: u64,
    /// Sending endpoint id.
    pub ep_id: u64,
    /// Correlating message id.
    pub msg_id: u64,
    /// Total logical message length in bytes.
    pub total_len: u64,
}

impl EagerFirstHdr {
    /// Create a new eager-first header.
    pub fn new(tag: u64, ep_id: u64, msg_id: u64, total_len: u64) -> Self {
        Self {
            tag,
            ep_id,
            msg_id,
            total_len,
        }
    }
}

hdr_common!(EagerFirstHdr, EAGER_FIRST_HDR_SIZE);

/// Eager-middle-fragment header (16 bytes).
///
/// Layout:
/// ```text
/// Offset  Size  Field
/// 0       8     ep_id
/// 8       8     msg_id
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct EagerMiddleHdr {
    /// Sending endpoint id.
    pub ep_id: u64,
    /// Correlating message id.
    pub msg_id: u64,
}

impl EagerMiddleHdr {
    /// Create a new eager-middle header.
    pub fn new(ep_id: u64, msg_id: u64) -> Self {
        Self { ep_id, msg_id }
    }
}

hdr_common!(EagerMiddleHdr, EAGER_MIDDLE_HDR_SIZE);

/// Sync header (16 bytes), appended after the tag or eager-first header on
/// synchronous eager variants. Echoed back to the sender in the receipt ack.
///
/// Layout:
/// ```text
/// Offset  Size  Field
/// 0       8     ep_id
/// 8       8     req_id (sender-side request id)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct SyncHdr {
    /// Sending endpoint id.
    pub ep_id: u64,
    /// Sender-side request id to acknowledge.
    pub req_id: u64,
}

impl SyncHdr {
    /// Create a new sync header.
    pub fn new(ep_id: u64, req_id: u64) -> Self {
        Self { ep_id, req_id }
    }
}

hdr_common!(SyncHdr, SYNC_HDR_SIZE);

/// Stream header (8 bytes), preceding raw stream payload bytes.
///
/// Layout:
/// ```text
/// Offset  Size  Field
/// 0       8     ep_id
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct StreamHdr {
    /// Destination endpoint id.
    pub ep_id: u64,
}

impl StreamHdr {
    /// Create a new stream header.
    pub fn new(ep_id: u64) -> Self {
        Self { ep_id }
    }
}

hdr_common!(StreamHdr, STREAM_HDR_SIZE);

/// Rendezvous ready-to-send header (32 bytes).
///
/// `size` and `address` describe the remote buffer and are passed through to
/// the external bulk-transfer subsystem untouched; this engine only uses
/// `tag` for matching and `seq` for the hand-off.
///
/// Layout:
/// ```text
/// Offset  Size  Field
/// 0       8     tag
/// 8       8     seq
/// 16      8     size
/// 24      8     address
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct RndvRtsHdr {
    /// Sender tag.
    pub tag: u64,
    /// Rendezvous sequence number.
    pub seq: u64,
    /// Total message size in bytes.
    pub size: u64,
    /// Remote buffer address (opaque to this engine).
    pub address: u64,
}

impl RndvRtsHdr {
    /// Create a new RTS header.
    pub fn new(tag: u64, seq: u64, size: u64, address: u64) -> Self {
        Self {
            tag,
            seq,
            size,
            address,
        }
    }
}

hdr_common!(RndvRtsHdr, RNDV_RTS_HDR_SIZE);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hdr_sizes() {
        assert_eq!(std::mem::size_of::<TagHdr>(), TAG_HDR_SIZE);
        assert_eq!(std::mem::size_of::<EagerFirstHdr>(), EAGER_FIRST_HDR_SIZE);
        assert_eq!(std::mem::size_of::<EagerMiddleHdr>(), EAGER_MIDDLE_HDR_SIZE);
        assert_eq!(std::mem::size_of::<SyncHdr>(), SYNC_HDR_SIZE);
        assert_eq!(std::mem::size_of::<StreamHdr>(), STREAM_HDR_SIZE);
        assert_eq!(std::mem::size_of::<RndvRtsHdr>(), RNDV_RTS_HDR_SIZE);
    }

    #[test]
    fn test_tag_hdr_roundtrip() {
        let hdr = TagHdr::new(0xDEAD_BEEF_CAFE_F00D);
        let mut buf = [0u8; TAG_HDR_SIZE + 4];
        unsafe { hdr.write_to(buf.as_mut_ptr()) };
        buf[TAG_HDR_SIZE..].copy_from_slice(&[1, 2, 3, 4]);

        let (parsed, rest) = TagHdr::parse(&buf).unwrap();
        assert_eq!(parsed, hdr);
        assert_eq!(rest, &[1, 2, 3, 4]);
    }

    #[test]
    fn test_eager_first_hdr_roundtrip() {
        let hdr = EagerFirstHdr::new(7, 42, 0x1234_5678, 4096);
        let mut buf = [0u8; EAGER_FIRST_HDR_SIZE];
        unsafe { hdr.write_to(buf.as_mut_ptr()) };

        let (parsed, rest) = EagerFirstHdr::parse(&buf).unwrap();
        assert_eq!(parsed, hdr);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_parse_short_buffer() {
        let buf = [0u8; 4];
        assert!(TagHdr::parse(&buf).is_err());
        assert!(RndvRtsHdr::parse(&buf).is_err());
    }

    #[test]
    fn test_am_id_conversion() {
        for id in [
            AmId::EagerOnly,
            AmId::EagerSyncOnly,
            AmId::EagerFirst,
            AmId::EagerSyncFirst,
            AmId::EagerMiddle,
            AmId::RndvRts,
            AmId::StreamData,
        ] {
            assert_eq!(AmId::try_from(id as u8).unwrap(), id);
        }
        assert!(AmId::try_from(7).is_err());
    }

    #[test]
    fn test_am_id_sync() {
        assert!(AmId::EagerSyncOnly.is_sync());
        assert!(AmId::EagerSyncFirst.is_sync());
        assert!(!AmId::EagerOnly.is_sync());
        assert!(!AmId::EagerMiddle.is_sync());
    }
}
