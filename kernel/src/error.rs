//! Kernel error taxonomy
//!
//! Every recoverable failure a syscall can report is a [`KernelError`]. The
//! syscall layer turns them into negative status codes; kernel code never
//! retries on behalf of userspace. Invariant violations are not errors: they
//! go through [`kernel_bug!`](crate::kernel_bug) and halt.

use thiserror::Error;

/// Result alias used throughout the kernel
pub type KResult<T> = Result<T, KernelError>;

/// Errors returned to the calling thread
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelError {
    /// Slot empty, of the wrong type, or revoked
    #[error("bad capability")]
    BadCapability,
    /// Rights check failed
    #[error("permission denied")]
    PermissionDenied,
    /// Non-blocking operation cannot proceed
    #[error("operation would block")]
    WouldBlock,
    /// Bounded queue saturated
    #[error("queue full")]
    Full,
    /// Deadline elapsed before completion
    #[error("timed out")]
    Timeout,
    /// Operation invalid for the current object state
    #[error("invalid object state")]
    BadState,
    /// Channel has been stopped
    #[error("channel closed")]
    ChannelClosed,
    /// Memory or object quota exhausted
    #[error("out of memory")]
    OutOfMemory,
    /// Capability table full
    #[error("no free capability slots")]
    NoSlots,
    /// Argument out of range
    #[error("invalid argument")]
    InvalidArgument,
    /// User buffer not mapped or lacks permission
    #[error("bad user address")]
    BadAddress,
    /// Transient condition, caller should retry
    #[error("try again")]
    TryAgain,
}

impl KernelError {
    /// Positive error number for this error.
    ///
    /// Values follow the classic errno assignments so that userspace
    /// libraries can reuse their tables.
    pub const fn errno(self) -> i64 {
        match self {
            KernelError::BadCapability => 9,     // EBADF
            KernelError::PermissionDenied => 13, // EACCES
            KernelError::WouldBlock => 11,       // EAGAIN/EWOULDBLOCK
            KernelError::Full => 105,            // ENOBUFS
            KernelError::Timeout => 110,         // ETIMEDOUT
            KernelError::BadState => 125,        // ECANCELED-adjacent
            KernelError::ChannelClosed => 32,    // EPIPE
            KernelError::OutOfMemory => 12,      // ENOMEM
            KernelError::NoSlots => 24,          // EMFILE
            KernelError::InvalidArgument => 22,  // EINVAL
            KernelError::BadAddress => 14,       // EFAULT
            KernelError::TryAgain => 4,          // EINTR slot, distinct from EAGAIN
        }
    }

    /// Status value placed in the user result register.
    pub const fn as_status(self) -> i64 {
        -self.errno()
    }

    /// Decode a negative status produced by [`as_status`](Self::as_status).
    pub fn from_status(status: i64) -> Option<Self> {
        const ALL: [KernelError; 12] = [
            KernelError::BadCapability,
            KernelError::PermissionDenied,
            KernelError::WouldBlock,
            KernelError::Full,
            KernelError::Timeout,
            KernelError::BadState,
            KernelError::ChannelClosed,
            KernelError::OutOfMemory,
            KernelError::NoSlots,
            KernelError::InvalidArgument,
            KernelError::BadAddress,
            KernelError::TryAgain,
        ];
        ALL.into_iter().find(|e| e.as_status() == status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_are_negative_and_distinct() {
        let all = [
            KernelError::BadCapability,
            KernelError::PermissionDenied,
            KernelError::WouldBlock,
            KernelError::Full,
            KernelError::Timeout,
            KernelError::BadState,
            KernelError::ChannelClosed,
            KernelError::OutOfMemory,
            KernelError::NoSlots,
            KernelError::InvalidArgument,
            KernelError::BadAddress,
            KernelError::TryAgain,
        ];
        let mut seen = hashbrown::HashSet::new();
        for e in all {
            assert!(e.as_status() < 0);
            assert!(seen.insert(e.as_status()), "{e:?} reuses a status code");
            assert_eq!(KernelError::from_status(e.as_status()), Some(e));
        }
    }

    #[test]
    fn test_unknown_status() {
        assert_eq!(KernelError::from_status(0), None);
        assert_eq!(KernelError::from_status(-9999), None);
    }
}
