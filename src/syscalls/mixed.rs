/*!
 * Mixed Calls
 * close/read/write/poll/select over both bridged sockets and direct descriptors
 */

use log::trace;

use super::bridged::BridgedSockets;
use super::direct::DirectOps;
use super::fdset::FdSet;
use super::multiplex::{only_socket_pollfds, only_sockets};
use crate::core::errors::SockResult;
use crate::core::types::VirtualFd;

/// Classifies each call and routes it to the bridge or the platform
///
/// Single-descriptor calls look at that descriptor alone. `poll` and `select`
/// go to the bridge only when every descriptor they name is a bridged socket;
/// otherwise the whole call takes the direct path untouched.
pub struct MixedCalls<'a> {
    bridged: &'a BridgedSockets,
    direct: &'a dyn DirectOps,
}

impl<'a> MixedCalls<'a> {
    pub fn new(bridged: &'a BridgedSockets, direct: &'a dyn DirectOps) -> Self {
        Self { bridged, direct }
    }

    #[inline]
    fn is_bridged(&self, fd: VirtualFd) -> bool {
        self.bridged.table.is_socket(fd)
    }

    pub fn close(&self, fd: VirtualFd) -> SockResult<i32> {
        if self.is_bridged(fd) {
            return self.bridged.close(fd);
        }
        trace!("close({}) -> direct", fd);
        self.direct.close(fd.as_raw()).map(|()| 0)
    }

    pub fn read(&self, fd: VirtualFd, buf: &mut [u8]) -> SockResult<usize> {
        if self.is_bridged(fd) {
            return self.bridged.read(fd, buf);
        }
        self.direct.read(fd.as_raw(), buf)
    }

    pub fn write(&self, fd: VirtualFd, buf: &[u8]) -> SockResult<usize> {
        if self.is_bridged(fd) {
            return self.bridged.write(fd, buf);
        }
        self.direct.write(fd.as_raw(), buf)
    }

    pub fn poll(&self, fds: &mut [libc::pollfd], timeout_ms: i32) -> SockResult<usize> {
        if only_socket_pollfds(&self.bridged.table, fds) {
            return self.bridged.poll(fds, timeout_ms);
        }
        trace!("poll over {} entries -> direct", fds.len());
        self.direct.poll(fds, timeout_ms)
    }

    pub fn select(
        &self,
        nfds: i32,
        read: Option<&mut FdSet>,
        write: Option<&mut FdSet>,
        except: Option<&mut FdSet>,
        timeout: Option<&mut libc::timeval>,
    ) -> SockResult<usize> {
        let table = &self.bridged.table;
        let bridged = only_sockets(table, nfds, read.as_deref())
            && only_sockets(table, nfds, write.as_deref())
            && only_sockets(table, nfds, except.as_deref());

        if bridged {
            return self.bridged.select(nfds, read, write, except, timeout);
        }
        trace!("select(nfds={}) -> direct", nfds);
        self.direct.select(nfds, read, write, except, timeout)
    }
}
