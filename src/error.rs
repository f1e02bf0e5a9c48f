//! Crate-wide error type.
//!
//! Every fallible operation in this crate returns [`Result`], whose error
//! variants mirror the error kinds a caller needs to distinguish: invalid
//! user-supplied configuration, kernel syscall failures (which carry the
//! original OS error number), OVS subprocess failures, malformed wire
//! protocol, exhausted address/identifier pools, and unreachable routes.

use std::fmt;

/// Errors produced by this crate.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// User-supplied configuration was invalid (bad CIDR, unresolvable edge
    /// MAC, impossible subnet fragmentation, negative link weight, ...).
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A kernel syscall (netlink, ioctl, or sysctl write) failed. `code` is
    /// the raw OS error number (`errno`).
    #[error("kernel operation failed: {message} (errno {code})")]
    Kernel {
        /// Raw OS error number.
        code: i32,
        /// Human-readable description of the failing operation.
        message: String,
    },

    /// An `ovs-*` subprocess exited with a non-zero status.
    #[error("ovs command failed with exit code {code}: {command}")]
    OvsFailed {
        /// Process exit code, or -1 if terminated by a signal.
        code: i32,
        /// The command line that failed.
        command: String,
    },

    /// A netlink reply or worker response did not match the expected shape.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// An identifier/address pool (IP, MAC, OVS port) ran out before
    /// satisfying a request.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The route planner found no path between two nodes. Non-fatal; callers
    /// log this once per run and skip the pair.
    #[error("no route between nodes {from} and {to}")]
    NotRoutable {
        /// Source node id.
        from: u32,
        /// Destination node id.
        to: u32,
    },
}

impl Error {
    /// Build a [`Error::Kernel`] from the current `errno` and a description.
    pub fn kernel(message: impl fmt::Display) -> Self {
        let code = std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(0);
        Error::Kernel {
            code,
            message: message.to_string(),
        }
    }

    /// Build a [`Error::Kernel`] from an explicit errno, e.g. one parsed out
    /// of a netlink `NLMSG_ERROR` payload.
    pub fn kernel_code(code: i32, message: impl fmt::Display) -> Self {
        Error::Kernel {
            code,
            message: message.to_string(),
        }
    }

    /// Build a [`Error::ConfigInvalid`].
    pub fn config(message: impl fmt::Display) -> Self {
        Error::ConfigInvalid(message.to_string())
    }

    /// Build a [`Error::ProtocolViolation`].
    pub fn protocol(message: impl fmt::Display) -> Self {
        Error::ProtocolViolation(message.to_string())
    }

    /// Build a [`Error::ResourceExhausted`].
    pub fn exhausted(message: impl fmt::Display) -> Self {
        Error::ResourceExhausted(message.to_string())
    }

    /// The OS error number carried by this error, if any.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            Error::Kernel { code, .. } => Some(*code),
            Error::OvsFailed { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::Kernel {
            code: e as i32,
            message: e.to_string(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.raw_os_error() {
            Some(code) => Error::Kernel {
                code,
                message: e.to_string(),
            },
            None => Error::ProtocolViolation(e.to_string()),
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
