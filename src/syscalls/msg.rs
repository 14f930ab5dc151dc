/*!
 * Message Headers
 * Safe counterparts of `struct msghdr` for recvmsg/sendmsg
 */

use std::io::{IoSlice, IoSliceMut};

/// Receive-side message header
///
/// `name_len` is the usable capacity of `name` on entry and the length of the
/// source address on return; `flags` receives the result flags.
#[derive(Debug)]
pub struct RecvMsg<'a, 'b> {
    pub name: Option<&'a mut [u8]>,
    pub name_len: u32,
    pub iov: &'a mut [IoSliceMut<'b>],
    pub flags: i32,
}

impl<'a, 'b> RecvMsg<'a, 'b> {
    /// Header without a source address buffer
    pub fn new(iov: &'a mut [IoSliceMut<'b>]) -> Self {
        Self {
            name: None,
            name_len: 0,
            iov,
            flags: 0,
        }
    }

    /// Header that also captures the source address
    pub fn with_name(iov: &'a mut [IoSliceMut<'b>], name: &'a mut [u8]) -> Self {
        let name_len = name.len() as u32;
        Self {
            name: Some(name),
            name_len,
            iov,
            flags: 0,
        }
    }

    /// Capacity of the name buffer the callee may write
    #[inline]
    pub fn name_capacity(&self) -> u32 {
        self.name
            .as_ref()
            .map_or(0, |n| self.name_len.min(n.len() as u32))
    }
}

/// Send-side message header; `name` is a raw POSIX sockaddr image
#[derive(Debug, Clone, Copy)]
pub struct SendMsg<'a, 'b> {
    pub name: Option<&'a [u8]>,
    pub iov: &'a [IoSlice<'b>],
}

impl<'a, 'b> SendMsg<'a, 'b> {
    pub fn new(iov: &'a [IoSlice<'b>]) -> Self {
        Self { name: None, iov }
    }

    pub fn to(name: &'a [u8], iov: &'a [IoSlice<'b>]) -> Self {
        Self {
            name: Some(name),
            iov,
        }
    }

    /// Total payload length
    pub fn len(&self) -> usize {
        self.iov.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
