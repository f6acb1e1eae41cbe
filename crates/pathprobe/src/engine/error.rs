//! Error types for the probe engine.

use std::io;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving the probe engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Socket syscall failed with an errno.
    #[error("{operation}: {message} (errno {errno})")]
    Socket {
        /// The operation that failed.
        operation: String,
        /// The errno value from the kernel.
        errno: i32,
        /// Human-readable error message.
        message: String,
    },

    /// Invalid instance options.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No algorithm registered under this name.
    #[error("unknown algorithm: {0}")]
    UnknownAlgorithm(String),

    /// The send queue is at capacity.
    #[error("send queue full: {capacity} probes pending")]
    QueueFull {
        /// Configured queue capacity.
        capacity: usize,
    },

    /// The 64-bit probe tag space ran out.
    #[error("probe tag space exhausted")]
    TagExhausted,

    /// A packet could not be forged or parsed.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// An algorithm handler returned an error.
    #[error("handler failed: {0}")]
    Handler(String),
}

impl Error {
    /// Create a socket error from an errno value.
    pub fn from_errno(errno: i32, operation: impl Into<String>) -> Self {
        let message = io::Error::from_raw_os_error(errno).to_string();
        Self::Socket {
            operation: operation.into(),
            errno,
            message,
        }
    }

    /// Create a socket error from an I/O error, keeping the errno when
    /// one is present so the predicate helpers stay exact.
    pub fn from_io(err: io::Error, operation: impl Into<String>) -> Self {
        match err.raw_os_error() {
            Some(errno) => Self::from_errno(errno, operation),
            None => Self::Io(err),
        }
    }

    /// Check if this is a permission error (EPERM, EACCES).
    ///
    /// Raw sockets need CAP_NET_RAW; this is the signature of running
    /// unprivileged and is fatal to the engine.
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Self::Socket { errno, .. } => matches!(*errno, libc::EPERM | libc::EACCES),
            Self::Io(e) => e.kind() == io::ErrorKind::PermissionDenied,
            _ => false,
        }
    }

    /// Check if this is a transient send condition worth retrying
    /// (EAGAIN, EINTR, ENOBUFS).
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Socket { errno, .. } => {
                matches!(*errno, libc::EAGAIN | libc::EINTR | libc::ENOBUFS)
            }
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// Check if this error must stop the event loop.
    ///
    /// Per-probe failures are localized to the originating instance;
    /// only resource-level failures propagate out of `run()`.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::TagExhausted) || self.is_permission_denied()
    }

    /// Get the errno value if this is a socket error.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Socket { errno, .. } => Some(*errno),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_errno() {
        let err = Error::from_errno(libc::EPERM, "creating raw socket");
        assert!(err.is_permission_denied());
        assert!(err.is_fatal());
        assert_eq!(err.errno(), Some(libc::EPERM));
        let msg = err.to_string();
        assert!(msg.contains("creating raw socket"));
    }

    #[test]
    fn test_from_io_keeps_errno() {
        let err = Error::from_io(io::Error::from_raw_os_error(libc::EACCES), "sendto");
        assert!(err.is_permission_denied());
        assert_eq!(err.errno(), Some(libc::EACCES));

        let err = Error::from_io(io::Error::other("no errno"), "sendto");
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_is_transient() {
        assert!(Error::from_errno(libc::EAGAIN, "sendto").is_transient());
        assert!(Error::from_errno(libc::ENOBUFS, "sendto").is_transient());
        assert!(!Error::from_errno(libc::EPERM, "sendto").is_transient());
    }

    #[test]
    fn test_fatal_kinds() {
        assert!(Error::TagExhausted.is_fatal());
        assert!(!Error::InvalidArgument("min-ttl".into()).is_fatal());
        assert!(!Error::from_errno(libc::EAGAIN, "sendto").is_fatal());
    }

    #[test]
    fn test_error_messages() {
        let err = Error::UnknownAlgorithm("ping".into());
        assert_eq!(err.to_string(), "unknown algorithm: ping");

        let err = Error::QueueFull { capacity: 1024 };
        assert_eq!(err.to_string(), "send queue full: 1024 probes pending");

        let err = Error::InvalidArgument("min-ttl must be below max-ttl".into());
        assert!(err.to_string().starts_with("invalid argument"));
    }
}
