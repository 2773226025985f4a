//! Error types for netlink operations.

use std::io;

/// Result type for netlink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during netlink operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The socket was closed while an operation was pending.
    #[error("netlink socket closed")]
    SocketClosed,

    /// No datagram arrived within the configured receive timeout.
    #[error("receive timed out")]
    Timeout,

    /// A reply came from a port other than the kernel.
    #[error("unexpected sender: port id {pid}")]
    UnexpectedSender {
        /// Port id of the sender.
        pid: u32,
    },

    /// Kernel returned an error code.
    #[error("kernel error: {message} (errno {errno})")]
    Kernel {
        /// The errno value from the kernel.
        errno: i32,
        /// Human-readable error message.
        message: String,
    },

    /// Kernel error with operation context.
    #[error("{operation}: {message} (errno {errno})")]
    KernelWithContext {
        /// The operation that failed.
        operation: String,
        /// The errno value from the kernel.
        errno: i32,
        /// Human-readable error message.
        message: String,
    },

    /// Fewer than four bytes remained where an attribute header was expected.
    #[error("attribute header truncated")]
    AttrHeaderTruncated,

    /// An attribute declared more bytes than the buffer holds.
    #[error("attribute body truncated: declared {declared} bytes, {remaining} remaining")]
    AttrBodyTruncated {
        /// Length from the attribute header.
        declared: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },

    /// Message was truncated.
    #[error("message truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Expected message length.
        expected: usize,
        /// Actual bytes received.
        actual: usize,
    },

    /// Invalid message format.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Invalid attribute format.
    #[error("invalid attribute: {0}")]
    InvalidAttribute(String),

    /// An attribute or nest grew past the 16-bit length field.
    #[error("attribute too large: {len} bytes exceeds 65535")]
    AttrTooLarge {
        /// Length including header.
        len: usize,
    },

    /// Reply carried the request's sequence number but another port id.
    #[error("port id mismatch: expected {expected}, got {actual}")]
    PidMismatch {
        /// Port id of the requesting socket.
        expected: u32,
        /// Port id found in the reply.
        actual: u32,
    },

    /// A request object is missing fields the operation needs.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Operation not supported.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// Parse error.
    #[error("parse error: {0}")]
    Parse(String),

    /// Interface not found.
    #[error("interface not found: {name}")]
    InterfaceNotFound {
        /// The interface name that was not found.
        name: String,
    },

    /// Namespace not found.
    #[error("namespace not found: {name}")]
    NamespaceNotFound {
        /// The namespace name that was not found.
        name: String,
    },

    /// Generic netlink family not registered.
    #[error("generic netlink family not found: {name}")]
    FamilyNotFound {
        /// The family name.
        name: String,
    },
}

impl Error {
    /// Create a kernel error from a negative netlink error code.
    pub fn from_errno(errno: i32) -> Self {
        let message = io::Error::from_raw_os_error(-errno).to_string();
        Self::Kernel {
            errno: -errno,
            message,
        }
    }

    /// Add context to this error.
    ///
    /// Wraps kernel errors with operation context. Other errors are returned unchanged.
    pub fn with_context(self, operation: impl Into<String>) -> Self {
        match self {
            Self::Kernel { errno, message } => Self::KernelWithContext {
                operation: operation.into(),
                errno,
                message,
            },
            other => other,
        }
    }

    /// Check if this is a "not found" error (ENOENT, ENODEV, ESRCH).
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Kernel { errno, .. } | Self::KernelWithContext { errno, .. } => {
                matches!(*errno, libc::ENOENT | libc::ENODEV | libc::ESRCH)
            }
            Self::InterfaceNotFound { .. }
            | Self::NamespaceNotFound { .. }
            | Self::FamilyNotFound { .. } => true,
            _ => false,
        }
    }

    /// Check if this is a permission error (EPERM, EACCES).
    pub fn is_permission_denied(&self) -> bool {
        matches!(self.errno(), Some(libc::EPERM | libc::EACCES))
    }

    /// Check if this is a "device busy" error (EBUSY).
    pub fn is_busy(&self) -> bool {
        self.errno() == Some(libc::EBUSY)
    }

    /// Check if this is an "already exists" error (EEXIST).
    pub fn is_already_exists(&self) -> bool {
        self.errno() == Some(libc::EEXIST)
    }

    /// Check if this error means the socket was shut down.
    ///
    /// Also true for `EBADF`, which a raw read reports when the descriptor
    /// is torn down underneath it.
    pub fn is_closed(&self) -> bool {
        match self {
            Self::SocketClosed => true,
            Self::Io(e) => e.raw_os_error() == Some(libc::EBADF),
            _ => false,
        }
    }

    /// Check if this is a codec error caused by malformed wire data.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Self::AttrHeaderTruncated
                | Self::AttrBodyTruncated { .. }
                | Self::Truncated { .. }
                | Self::InvalidMessage(_)
                | Self::InvalidAttribute(_)
                | Self::Parse(_)
        )
    }

    /// Get the errno value if this is a kernel error.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Kernel { errno, .. } | Self::KernelWithContext { errno, .. } => Some(*errno),
            _ => None,
        }
    }
}
