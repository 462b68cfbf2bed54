//! Kernel error types
//!
//! Structured error values used across the kernel. Fallible operations
//! return [`KernelResult`]; fatal invariant violations panic at the site
//! that notices them instead of threading an error upward.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// No physical frames or heap blocks left to satisfy the request
    OutOfMemory { requested: usize },
    /// Address fails a range or alignment requirement
    InvalidAddress { addr: u64 },
    /// Virtual address has no mapping in the relevant directory
    UnmappedMemory { addr: u64 },
    /// A user pointer failed the per-page accessibility walk
    UserAccessDenied { addr: u64, len: usize },
    /// Task id does not name a live task
    TaskNotFound { id: u16 },
    /// Process id does not name a live address space
    ProcessNotFound { pid: u32 },
    /// A fixed table (tasks, processes, regions, handles) is full
    ResourceExhausted { resource: &'static str },
    /// State machine transition that the caller is not allowed to make
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
    /// Argument rejected before any work was done
    InvalidArgument { name: &'static str },
    /// Subsystem used before its init function ran
    NotInitialized { subsystem: &'static str },
    /// Filesystem errors
    FsError(FsError),
    /// Operation is recognized but not available on this configuration
    Unsupported { operation: &'static str },
}

/// Filesystem-specific errors surfaced through the fs_* syscalls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    AlreadyExists,
    NotADirectory,
    IsADirectory,
    DirectoryNotEmpty,
    BadHandle,
    NoSpace,
    NameTooLong,
    BadPath,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::OutOfMemory { requested } => {
                write!(f, "out of memory (requested {} bytes)", requested)
            }
            KernelError::InvalidAddress { addr } => {
                write!(f, "invalid address {:#x}", addr)
            }
            KernelError::UnmappedMemory { addr } => {
                write!(f, "unmapped memory at {:#x}", addr)
            }
            KernelError::UserAccessDenied { addr, len } => {
                write!(f, "user access denied at {:#x} (+{})", addr, len)
            }
            KernelError::TaskNotFound { id } => write!(f, "no such task {}", id),
            KernelError::ProcessNotFound { pid } => write!(f, "no such process {}", pid),
            KernelError::ResourceExhausted { resource } => {
                write!(f, "{} exhausted", resource)
            }
            KernelError::InvalidState { expected, actual } => {
                write!(f, "invalid state: expected {}, got {}", expected, actual)
            }
            KernelError::InvalidArgument { name } => write!(f, "invalid argument: {}", name),
            KernelError::NotInitialized { subsystem } => {
                write!(f, "{} not initialized", subsystem)
            }
            KernelError::FsError(e) => write!(f, "fs error: {:?}", e),
            KernelError::Unsupported { operation } => write!(f, "{} not supported", operation),
        }
    }
}

impl From<FsError> for KernelError {
    fn from(err: FsError) -> Self {
        KernelError::FsError(err)
    }
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = KernelError::OutOfMemory { requested: 4096 };
        // Display must mention the request size so serial logs stay useful
        let mut buf = alloc::string::String::new();
        use core::fmt::Write;
        write!(buf, "{}", err).expect("formatting a kernel error should not fail");
        assert!(buf.contains("4096"));
    }

    #[test]
    fn test_fs_error_conversion() {
        let err: KernelError = FsError::NotFound.into();
        assert_eq!(err, KernelError::FsError(FsError::NotFound));
    }
}
