/// Busbar Error Types
///
/// Comprehensive error handling for all bus operations.
use std::io;

use busbar_variant::VariantError;
use thiserror::Error;

/// Main error type for bus operations
#[derive(Error, Debug)]
pub enum BusError {
    /// Underlying transport syscall failed
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// Variant codec failure while building or parsing a payload
    #[error("variant error: {0}")]
    Variant(#[from] VariantError),

    /// Caller-supplied value violates a documented invariant
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Id, name or attachment collision
    #[error("duplicate: {0}")]
    Duplicate(String),

    /// Absent kernel id, interface, member or reply handle
    #[error("not found: {0}")]
    NotFound(String),

    /// Out-of-bounds attachment accessor
    #[error("index {index} out of range (len {len})")]
    Range { index: usize, len: usize },

    /// Object is latched or already claimed elsewhere
    #[error("busy: {0}")]
    Busy(String),

    /// Queue drop detected or pool slice no longer readable
    #[error("stale: {0}")]
    Stale(String),

    /// Allocation or descriptor exhaustion
    #[error("resource exhausted: {0}")]
    Resource(String),

    /// Inbound payload signature does not match the expected signature
    #[error("signature mismatch: expected '{expected}', found '{found}'")]
    SignatureMismatch { expected: String, found: String },

    /// Error relayed from a remote call handler
    #[error("remote error: {name}")]
    Remote { name: String },

    /// Numeric error code relayed over the wire
    #[error("remote errno {0}")]
    Errno(i32),
}

/// Result type alias for bus operations
pub type Result<T> = std::result::Result<T, BusError>;

impl BusError {
    /// Create an invalid-argument error with a message
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a duplicate error with a message
    pub fn duplicate(msg: impl Into<String>) -> Self {
        Self::Duplicate(msg.into())
    }

    /// Create a not-found error with a message
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a busy error with a message
    pub fn busy(msg: impl Into<String>) -> Self {
        Self::Busy(msg.into())
    }

    /// Create a stale error with a message
    pub fn stale(msg: impl Into<String>) -> Self {
        Self::Stale(msg.into())
    }

    /// The POSIX error number matching this error, as relayed on the wire
    /// for `org.bus1.Error.Errno` replies.
    #[must_use]
    pub fn errno(&self) -> i32 {
        use rustix::io::Errno;

        let e = match self {
            Self::Transport(err) => return err.raw_os_error().unwrap_or(Errno::IO.raw_os_error()),
            Self::Variant(_) => Errno::BADMSG,
            Self::InvalidArgument(_) => Errno::INVAL,
            Self::Duplicate(_) => Errno::EXIST,
            Self::NotFound(_) => Errno::NOENT,
            Self::Range { .. } => Errno::RANGE,
            Self::Busy(_) => Errno::BUSY,
            Self::Stale(_) => Errno::STALE,
            Self::Resource(_) => Errno::NOMEM,
            Self::SignatureMismatch { .. } => Errno::BADMSG,
            Self::Remote { .. } => Errno::IO,
            Self::Errno(code) => return *code,
        };
        e.raw_os_error()
    }

    /// Whether the failure came from the transport layer
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Whether retrying after draining the receive queue can help
    #[must_use]
    pub const fn is_stale(&self) -> bool {
        matches!(self, Self::Stale(_))
    }
}

impl From<rustix::io::Errno> for BusError {
    fn from(e: rustix::io::Errno) -> Self {
        Self::Transport(io::Error::from(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(BusError::invalid("x").errno(), 22); // EINVAL
        assert_eq!(BusError::duplicate("x").errno(), 17); // EEXIST
        assert_eq!(BusError::not_found("x").errno(), 2); // ENOENT
        assert_eq!(BusError::busy("x").errno(), 16); // EBUSY
        assert_eq!(BusError::Range { index: 3, len: 1 }.errno(), 34); // ERANGE
        assert_eq!(BusError::Errno(71).errno(), 71);
    }

    #[test]
    fn test_io_error_passthrough() {
        let e = BusError::from(io::Error::from_raw_os_error(9));
        assert_eq!(e.errno(), 9); // EBADF
        assert!(e.is_transport());
    }
}
