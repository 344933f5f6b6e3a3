//! Datatype iterator: an incremental unpack cursor over a user buffer.
//!
//! The iterator owns the destination for the lifetime of the receive and
//! copies inbound bytes directly into it at the current offset — wire payload
//! to user memory with no intermediate staging buffer. The destination is
//! handed back through the completion callback (or reclaimed by the poller)
//! once the receive finishes.

use crate::error::{Error, Result};

/// Datatype class, determining completion granularity for stream receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtClass {
    /// Contiguous elements of a fixed size.
    Contig,
    /// Scatter list of contiguous buffers, 1-byte granularity.
    Iov,
    /// Opaque user unpacker, any granularity.
    Generic,
}

/// Destination buffer returned to the application when a receive completes.
pub enum RecvBuf {
    /// Contiguous buffer.
    Contig(Vec<u8>),
    /// Scatter list.
    Iov(Vec<Vec<u8>>),
    /// Generic destination; the data went through the user's unpacker and
    /// there is no buffer to return.
    Generic,
}

impl RecvBuf {
    /// Extract the contiguous buffer, panicking for other classes.
    /// Convenience for callers that posted with [`DtIter::contig`].
    pub fn into_contig(self) -> Vec<u8> {
        match self {
            RecvBuf::Contig(buf) => buf,
            _ => panic!("receive buffer is not contiguous"),
        }
    }
}

enum DtDest {
    Contig(Vec<u8>),
    Iov(Vec<Vec<u8>>),
    Generic(Box<dyn FnMut(usize, &[u8])>),
}

/// Incremental unpack cursor over a receive destination.
///
/// Tracks `{offset, length, elem_size}`; `offset <= length` always holds.
/// `length` is the posted receive size (`count * elem_size` for contiguous
/// data), which may be smaller than the buffer it was built from.
pub struct DtIter {
    dst: DtDest,
    offset: usize,
    length: usize,
    elem_size: usize,
}

impl DtIter {
    /// Create an iterator over a contiguous buffer holding `count` elements
    /// of `elem_size` bytes each.
    pub fn contig(buf: Vec<u8>, count: usize, elem_size: usize) -> Result<Self> {
        if elem_size == 0 {
            return Err(Error::InvalidParam("element size must be non-zero"));
        }
        let length = count
            .checked_mul(elem_size)
            .ok_or(Error::InvalidParam("receive length overflows"))?;
        if length > buf.len() {
            return Err(Error::InvalidParam("receive length exceeds buffer"));
        }
        Ok(Self {
            dst: DtDest::Contig(buf),
            offset: 0,
            length,
            elem_size,
        })
    }

    /// Create an iterator over a scatter list. The receive length is the sum
    /// of the entry lengths; element granularity is one byte.
    pub fn iov(bufs: Vec<Vec<u8>>) -> Self {
        let length = bufs.iter().map(|b| b.len()).sum();
        Self {
            dst: DtDest::Iov(bufs),
            offset: 0,
            length,
            elem_size: 1,
        }
    }

    /// Create an iterator that feeds a generic unpacker. `unpack` is called
    /// with the current offset and each inbound chunk, in order.
    pub fn generic(length: usize, unpack: Box<dyn FnMut(usize, &[u8])>) -> Self {
        Self {
            dst: DtDest::Generic(unpack),
            offset: 0,
            length,
            elem_size: 1,
        }
    }

    /// Datatype class of the destination.
    #[inline]
    pub fn class(&self) -> DtClass {
        match self.dst {
            DtDest::Contig(_) => DtClass::Contig,
            DtDest::Iov(_) => DtClass::Iov,
            DtDest::Generic(_) => DtClass::Generic,
        }
    }

    /// Bytes unpacked so far.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Total posted receive length in bytes.
    #[inline]
    pub fn length(&self) -> usize {
        self.length
    }

    /// Bytes still receivable.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.length - self.offset
    }

    /// Element size in bytes (1 for iov and generic destinations).
    #[inline]
    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    /// Unpack `src` at the current offset, advancing by the number of bytes
    /// actually stored. Bytes beyond the posted length are discarded; the
    /// caller detects truncation by comparing the return value to
    /// `src.len()`.
    pub fn unpack(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.remaining());
        if n == 0 {
            return 0;
        }
        match &mut self.dst {
            DtDest::Contig(buf) => {
                buf[self.offset..self.offset + n].copy_from_slice(&src[..n]);
            }
            DtDest::Iov(bufs) => {
                Self::iov_copy(bufs, self.offset, &src[..n]);
            }
            DtDest::Generic(unpack) => {
                unpack(self.offset, &src[..n]);
            }
        }
        self.offset += n;
        debug_assert!(self.offset <= self.length);
        n
    }

    /// Copy into a scatter list starting at a logical offset.
    fn iov_copy(bufs: &mut [Vec<u8>], mut offset: usize, mut src: &[u8]) {
        for buf in bufs.iter_mut() {
            if offset >= buf.len() {
                offset -= buf.len();
                continue;
            }
            let n = src.len().min(buf.len() - offset);
            buf[offset..offset + n].copy_from_slice(&src[..n]);
            src = &src[n..];
            offset = 0;
            if src.is_empty() {
                return;
            }
        }
        debug_assert!(src.is_empty(), "iov copy ran past the scatter list");
    }

    /// Take the destination buffer out, leaving the iterator empty.
    /// Called exactly once, at completion.
    pub(crate) fn take_buf(&mut self) -> RecvBuf {
        match std::mem::replace(&mut self.dst, DtDest::Contig(Vec::new())) {
            DtDest::Contig(buf) => RecvBuf::Contig(buf),
            DtDest::Iov(bufs) => RecvBuf::Iov(bufs),
            DtDest::Generic(_) => RecvBuf::Generic,
        }
    }
}
