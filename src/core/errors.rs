/*!
 * Error Types
 * Socket layer errors with errno mapping and miette diagnostics
 */

use miette::Diagnostic;
use nix::errno::Errno;
use thiserror::Error;

/// Result alias used across the socket layer
pub type SockResult<T> = Result<T, SockError>;

/// Socket layer errors
///
/// Every variant maps onto exactly one errno value via [`SockError::errno`],
/// which is what the POSIX facade surfaces to callers.
#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
#[non_exhaustive]
pub enum SockError {
    #[error("Bad descriptor: {0}")]
    #[diagnostic(
        code(sock::bad_descriptor),
        help("The descriptor is out of range or was never acquired.")
    )]
    BadDescriptor(i32),

    #[error("Descriptor table exhausted ({capacity} slots)")]
    #[diagnostic(
        code(sock::table_exhausted),
        help("Close unused descriptors or raise SOCKBRIDGE_MAX_FDS.")
    )]
    TableExhausted { capacity: usize },

    #[error("Bad address: {0}")]
    #[diagnostic(code(sock::fault))]
    Fault(&'static str),

    #[error("Invalid argument: {0}")]
    #[diagnostic(code(sock::invalid_argument))]
    InvalidArgument(&'static str),

    #[error("Bridge {op} failed: {errno}")]
    #[diagnostic(code(sock::backend))]
    Backend { op: &'static str, errno: Errno },

    #[error("Platform {op} failed: {errno}")]
    #[diagnostic(code(sock::direct))]
    Direct { op: &'static str, errno: Errno },

    #[error("Descriptor slot {0} already taken")]
    #[diagnostic(
        code(sock::slot_taken),
        help("Register descriptors opened outside the layer before creating sockets.")
    )]
    SlotTaken(i32),

    #[error("Bridge bindings already installed")]
    #[diagnostic(
        code(sock::already_installed),
        help("install_bridge runs exactly once per process.")
    )]
    AlreadyInstalled,

    #[error("Cannot rebind operations: {0} descriptors already in use")]
    #[diagnostic(
        code(sock::descriptors_in_use),
        help("Install the bridge before any descriptor is acquired.")
    )]
    DescriptorsInUse(usize),

    #[error("Socket layer not initialized")]
    #[diagnostic(code(sock::not_initialized))]
    NotInitialized,
}

impl SockError {
    #[inline]
    pub fn bad_descriptor(fd: impl Into<i32>) -> Self {
        Self::BadDescriptor(fd.into())
    }

    #[inline]
    pub fn backend(op: &'static str, errno: Errno) -> Self {
        Self::Backend { op, errno }
    }

    #[inline]
    pub fn direct(op: &'static str, errno: Errno) -> Self {
        Self::Direct { op, errno }
    }

    /// The errno value this error surfaces as
    pub fn errno(&self) -> Errno {
        match self {
            SockError::BadDescriptor(_) => Errno::EBADF,
            SockError::TableExhausted { .. } => Errno::EMFILE,
            SockError::Fault(_) => Errno::EFAULT,
            SockError::InvalidArgument(_) => Errno::EINVAL,
            SockError::Backend { errno, .. } | SockError::Direct { errno, .. } => *errno,
            SockError::SlotTaken(_)
            | SockError::AlreadyInstalled
            | SockError::DescriptorsInUse(_) => Errno::EBUSY,
            SockError::NotInitialized => Errno::ENOSYS,
        }
    }
}

/// Interpret a bridge return value: non-negative passes through, negative is `-errno`
#[inline]
pub fn bridge_result(op: &'static str, raw: i32) -> SockResult<i32> {
    if raw < 0 {
        Err(SockError::backend(op, Errno::from_raw(raw.saturating_neg())))
    } else {
        Ok(raw)
    }
}

/// Wide variant of [`bridge_result`] for byte counts
#[inline]
pub fn bridge_result_len(op: &'static str, raw: isize) -> SockResult<usize> {
    if raw < 0 {
        let errno = i32::try_from(raw.saturating_neg()).unwrap_or(libc::EIO);
        Err(SockError::backend(op, Errno::from_raw(errno)))
    } else {
        Ok(raw as usize)
    }
}
