/*!
 * Socket Bridge
 * Downstream provider interface for bridged socket operations
 */

mod host;
pub mod wire;

pub use host::HostBridge;
pub use wire::{SockAddr, Timeval};

use std::io::{IoSlice, IoSliceMut};

use crate::core::types::{BackendId, VirtualFd};
use crate::syscalls::fdset::FdSet;

/// External provider that performs socket operations in its own descriptor space
///
/// Mirrors the POSIX socket surface on [`BackendId`]s. Every method returns a
/// non-negative result on success or `-errno` on failure; the adapters in
/// [`crate::syscalls`] turn that into a [`SockError`](crate::core::SockError).
///
/// Implementations must be callable from any thread. None of these methods is
/// invoked while the descriptor table lock is held.
pub trait SocketBridge: Send + Sync {
    /// Create a socket; returns the new backend id
    fn socket(&self, domain: i32, ty: i32, protocol: i32) -> i32;

    /// Accept a connection; returns the backend id of the accepted socket
    ///
    /// On entry `addr_len` is the capacity of the caller's address buffer
    /// (0 when the caller passed none). On success the provider writes the
    /// peer into `addr` and its real length into `addr_len`.
    fn accept(
        &self,
        fd: BackendId,
        addr: Option<&mut SockAddr>,
        addr_len: &mut u32,
        flags: i32,
    ) -> i32;

    /// `addr` is a raw POSIX sockaddr image
    fn bind(&self, fd: BackendId, addr: &[u8]) -> i32;

    /// `addr` is a raw POSIX sockaddr image
    fn connect(&self, fd: BackendId, addr: &[u8]) -> i32;

    fn listen(&self, fd: BackendId, backlog: i32) -> i32;

    fn close(&self, fd: BackendId) -> i32;

    fn recv(&self, fd: BackendId, buf: &mut [u8], flags: i32) -> isize;

    /// Same `addr_len` convention as [`accept`](Self::accept)
    fn recvfrom(
        &self,
        fd: BackendId,
        buf: &mut [u8],
        flags: i32,
        addr: Option<&mut SockAddr>,
        addr_len: &mut u32,
    ) -> isize;

    /// Scatter receive
    ///
    /// `name_len` carries the capacity of `name` in and the source address
    /// length out; `msg_flags` receives the result flags.
    fn recvmsg(
        &self,
        fd: BackendId,
        name: Option<&mut [u8]>,
        name_len: &mut u32,
        iov: &mut [IoSliceMut<'_>],
        flags: i32,
        msg_flags: &mut i32,
    ) -> isize;

    fn send(&self, fd: BackendId, buf: &[u8], flags: i32) -> isize;

    fn sendto(
        &self,
        fd: BackendId,
        buf: &[u8],
        flags: i32,
        addr: Option<&SockAddr>,
        addr_len: u32,
    ) -> isize;

    /// Gather send; `name` is a raw POSIX sockaddr image
    fn sendmsg(
        &self,
        fd: BackendId,
        name: Option<&[u8]>,
        iov: &[IoSlice<'_>],
        flags: i32,
    ) -> isize;

    /// Writes the peer address into `addr`; returns its length
    fn getpeername(&self, fd: BackendId, addr: &mut [u8]) -> i32;

    /// Writes the local address into `addr`; returns its length
    fn getsockname(&self, fd: BackendId, addr: &mut [u8]) -> i32;

    /// Writes the option value into `value`; returns its length
    fn getsockopt(&self, fd: BackendId, level: i32, name: i32, value: &mut [u8]) -> i32;

    fn setsockopt(&self, fd: BackendId, level: i32, name: i32, value: &[u8]) -> i32;

    fn shutdown(&self, fd: BackendId, how: i32) -> i32;

    /// `fds[i].fd` holds backend ids; the provider fills `revents` in place
    fn poll(&self, fds: &mut [libc::pollfd], timeout_ms: i32) -> i32;

    /// Sets are backend-numbered and rewritten in place to the ready members
    fn select(
        &self,
        nfds: i32,
        read: Option<&mut FdSet>,
        write: Option<&mut FdSet>,
        except: Option<&mut FdSet>,
        timeout: Option<&Timeval>,
    ) -> i32;

    /// Release provider state tied to a closed descriptor outside the socket itself
    ///
    /// Called with the *virtual* descriptor after a successful bridged close.
    fn release_side_channel(&self, _fd: VirtualFd) {}
}
