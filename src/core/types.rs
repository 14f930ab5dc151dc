/*!
 * Core Types
 * Descriptor handles shared across the socket layer
 */

use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::SockError;

/// Caller-visible descriptor in the flat virtual space
///
/// Values are only meaningful relative to the [`FdTable`](crate::syscalls::FdTable)
/// that minted them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VirtualFd(pub u32);

impl VirtualFd {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn as_raw(self) -> i32 {
        self.0 as i32
    }
}

impl From<VirtualFd> for i32 {
    #[inline]
    fn from(fd: VirtualFd) -> Self {
        fd.as_raw()
    }
}

impl TryFrom<i32> for VirtualFd {
    type Error = SockError;

    fn try_from(raw: i32) -> Result<Self, Self::Error> {
        u32::try_from(raw)
            .map(VirtualFd)
            .map_err(|_| SockError::BadDescriptor(raw))
    }
}

impl fmt::Display for VirtualFd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vfd:{}", self.0)
    }
}

/// Descriptor value in the bridge provider's own numbering space
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendId(pub i32);

impl BackendId {
    #[inline]
    pub const fn as_raw(self) -> i32 {
        self.0
    }

    /// Index into a dense backend-numbered array, if non-negative
    #[inline]
    pub fn index(self) -> Option<usize> {
        usize::try_from(self.0).ok()
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "backend:{}", self.0)
    }
}

/// Lifecycle state of a handle table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FdState {
    #[default]
    Free,
    Socket,
    NonSocket,
}

impl FdState {
    #[inline]
    pub fn is_free(self) -> bool {
        matches!(self, FdState::Free)
    }
}
