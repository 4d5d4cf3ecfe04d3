//! Error types for the unsock core.

use libc::c_int;
use thiserror::Error;

/// Failure of an intercepted socket operation.
///
/// Every variant maps to the errno the target program must observe; the
/// intercept surface publishes it next to a `-1` return value. Failures of
/// forwarded real calls are captured via [`SysError::last_os`] so the
/// kernel's errno travels through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SysError {
    /// A socket path could not be represented as a UNIX address.
    #[error("invalid socket path")]
    BadPath,

    /// The ephemeral port pool has no free port left.
    #[error("ephemeral port range exhausted")]
    PortsExhausted,

    /// The operation requires a non-zero remote port.
    #[error("remote port missing")]
    PortMissing,

    /// The operation requires a bound socket.
    #[error("socket is not bound")]
    NotBound,

    /// No fabricated address has been recorded for this socket.
    #[error("no fabricated address recorded")]
    NoAddress,

    /// The operation was rejected by a rule.
    #[error("rejected by rule (errno {0})")]
    Rejected(c_int),

    /// A real syscall failed; carries the errno it left behind.
    #[error("os error (errno {0})")]
    Os(c_int),
}

impl SysError {
    /// The errno the target program observes for this failure.
    #[must_use]
    pub fn errno(&self) -> c_int {
        match self {
            SysError::BadPath | SysError::NoAddress => libc::EFAULT,
            SysError::PortsExhausted | SysError::PortMissing => libc::EADDRNOTAVAIL,
            SysError::NotBound => libc::EINVAL,
            SysError::Rejected(e) | SysError::Os(e) => *e,
        }
    }

    /// Capture the calling thread's current errno.
    #[must_use]
    pub fn last_os() -> Self {
        SysError::Os(
            std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EIO),
        )
    }
}

/// Result of an intercepted operation: the raw return value the target
/// program should see, or the errno to publish alongside `-1`.
pub type SysResult<T = c_int> = std::result::Result<T, SysError>;

/// Errors raised while decoding or validating the rule list.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("failed to decode rule list: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("rule {index}: {reason}")]
    Invalid { index: usize, reason: String },

    #[error("rule {index}: bad address pattern: {source}")]
    Pattern {
        index: usize,
        #[source]
        source: globset::Error,
    },
}
