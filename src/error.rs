//! Error and completion-status types for rxmatch.

use std::fmt;

/// Error type for matching-engine operations.
///
/// These are the recoverable conditions returned to the immediate caller.
/// Internal-consistency violations (double completion, fragment for an
/// unknown message id, unpack overrun) are never represented here; they
/// panic, since continuing would risk corrupting in-flight buffers.
#[derive(Debug)]
pub enum Error {
    /// A local condition prevents immediate completion (e.g. not enough
    /// buffered data for an in-place fast path). Not a failure; the caller
    /// retries or falls back to queueing.
    NoProgress,
    /// More data arrived than the posted buffer can hold.
    Truncated {
        /// Length of the arrived message.
        length: usize,
        /// Capacity of the posted buffer.
        capacity: usize,
    },
    /// Malformed datatype, header, or parameter combination.
    InvalidParam(&'static str),
    /// Allocation of a request or descriptor failed or hit its limit.
    NoMemory,
    /// An immediate-completion path was forced but could not be taken.
    NoResource,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NoProgress => write!(f, "No progress"),
            Error::Truncated { length, capacity } => {
                write!(
                    f,
                    "Message truncated: {} bytes arrived, buffer holds {}",
                    length, capacity
                )
            }
            Error::InvalidParam(msg) => write!(f, "Invalid parameter: {}", msg),
            Error::NoMemory => write!(f, "Out of memory"),
            Error::NoResource => write!(f, "No resource for immediate completion"),
        }
    }
}

impl std::error::Error for Error {}

/// Result type for matching-engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Completion status delivered to a request's callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The receive completed normally.
    Ok,
    /// The message was longer than the posted buffer; only the buffer's
    /// capacity was unpacked. Tag mode only — stream mode treats partial
    /// delivery as success.
    Truncated,
    /// The request was canceled before it matched.
    Canceled,
}

impl Status {
    /// Check if the status is a successful completion.
    #[inline]
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok => write!(f, "OK"),
            Status::Truncated => write!(f, "Truncated"),
            Status::Canceled => write!(f, "Canceled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_is_ok() {
        assert!(Status::Ok.is_ok());
        assert!(!Status::Truncated.is_ok());
        assert!(!Status::Canceled.is_ok());
    }

    #[test]
    fn test_error_display() {
        let e = Error::Truncated {
            length: 100,
            capacity: 64,
        };
        assert_eq!(
            e.to_string(),
            "Message truncated: 100 bytes arrived, buffer holds 64"
        );
    }
}
