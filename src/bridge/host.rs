/*!
 * Host Bridge
 * SocketBridge provider backed by the host kernel's sockets
 */

use log::{debug, trace, warn};
use parking_lot::Mutex;
use std::io::{IoSlice, IoSliceMut};
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use super::wire::{SockAddr, Timeval};
use super::SocketBridge;
use crate::core::limits::FD_SETSIZE;
use crate::core::types::BackendId;
use crate::syscalls::fdset::FdSet;

/// Bridge provider that services calls with real host sockets
///
/// Host descriptors live in a slab and are numbered densely from 0 in the
/// provider's own space, so backend ids never coincide with host descriptor
/// values by accident. The slab lock is only held to translate ids; every
/// host call runs outside it, holding its own reference to the descriptor so
/// a concurrent `close` cannot free the number mid-call.
pub struct HostBridge {
    slab: Mutex<Vec<Option<Arc<OwnedFd>>>>,
}

#[inline]
fn neg_errno() -> i32 {
    -(nix::errno::Errno::last() as i32)
}

#[inline]
fn int_ret(r: libc::c_int) -> i32 {
    if r < 0 {
        neg_errno()
    } else {
        r
    }
}

#[inline]
fn len_ret(r: libc::ssize_t) -> isize {
    if r < 0 {
        neg_errno() as isize
    } else {
        r
    }
}

/// Copy a raw sockaddr image into storage the kernel can read
fn to_storage(addr: &[u8]) -> (libc::sockaddr_storage, libc::socklen_t) {
    // SAFETY: sockaddr_storage is plain old data
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = addr.len().min(mem::size_of::<libc::sockaddr_storage>());
    // SAFETY: len is bounded by both buffers
    unsafe {
        std::ptr::copy_nonoverlapping(
            addr.as_ptr(),
            (&mut storage as *mut libc::sockaddr_storage).cast::<u8>(),
            len,
        );
    }
    (storage, len as libc::socklen_t)
}

fn storage_bytes(storage: &libc::sockaddr_storage, len: libc::socklen_t) -> &[u8] {
    let len = (len as usize).min(mem::size_of::<libc::sockaddr_storage>());
    // SAFETY: the slice stays within the storage
    unsafe { std::slice::from_raw_parts((storage as *const libc::sockaddr_storage).cast::<u8>(), len) }
}

impl HostBridge {
    pub fn new() -> Self {
        Self {
            slab: Mutex::new(Vec::new()),
        }
    }

    /// Number of live host sockets
    pub fn open_count(&self) -> usize {
        self.slab.lock().iter().filter(|s| s.is_some()).count()
    }

    fn insert(&self, fd: OwnedFd) -> i32 {
        let fd = Arc::new(fd);
        let mut slab = self.slab.lock();
        let id = match slab.iter().position(Option::is_none) {
            Some(i) => {
                slab[i] = Some(fd);
                i
            }
            None => {
                slab.push(Some(fd));
                slab.len() - 1
            }
        };
        id as i32
    }

    fn host_fd(&self, fd: BackendId) -> Result<Arc<OwnedFd>, i32> {
        let slab = self.slab.lock();
        fd.index()
            .and_then(|i| slab.get(i))
            .and_then(|slot| slot.clone())
            .ok_or(-libc::EBADF)
    }

    fn adopt(&self, raw: RawFd) -> i32 {
        if raw < 0 {
            return neg_errno();
        }
        // SAFETY: the kernel just handed us this descriptor
        let owned = unsafe { OwnedFd::from_raw_fd(raw) };
        let id = self.insert(owned);
        trace!("Host fd {} adopted as backend {}", raw, id);
        id
    }

    /// Rewrite a backend-numbered set into host numbering; returns the highest host fd
    fn to_host_set(
        &self,
        nfds: i32,
        set: &FdSet,
        host: &mut FdSet,
        reverse: &mut [i32],
        held: &mut Vec<Arc<OwnedFd>>,
    ) -> Result<i32, i32> {
        let mut max = -1;
        for id in set.iter_below(nfds.max(0) as usize) {
            let sock = self.host_fd(BackendId(id as i32))?;
            let raw = sock.as_raw_fd();
            held.push(sock);
            if raw as usize >= FD_SETSIZE {
                return Err(-libc::EBADF);
            }
            host.insert(raw as usize);
            reverse[raw as usize] = id as i32;
            max = max.max(raw);
        }
        Ok(max)
    }
}

impl Default for HostBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HostBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBridge")
            .field("open", &self.open_count())
            .finish()
    }
}

macro_rules! host_fd_or_return {
    ($self:ident, $fd:expr) => {
        match $self.host_fd($fd) {
            Ok(sock) => sock,
            Err(e) => return e as _,
        }
    };
}

impl SocketBridge for HostBridge {
    fn socket(&self, domain: i32, ty: i32, protocol: i32) -> i32 {
        // SAFETY: plain syscall
        let raw = unsafe { libc::socket(domain, ty, protocol) };
        let id = self.adopt(raw);
        debug!("Host socket(domain={}, type={}) -> backend {}", domain, ty, id);
        id
    }

    fn accept(
        &self,
        fd: BackendId,
        addr: Option<&mut SockAddr>,
        addr_len: &mut u32,
        flags: i32,
    ) -> i32 {
        let sock = host_fd_or_return!(self, fd);
        let raw = sock.as_raw_fd();
        // SAFETY: sockaddr_storage is plain old data
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let storage_ptr = (&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr>();

        #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
        // SAFETY: storage and len describe a valid buffer
        let accepted = unsafe { libc::accept4(raw, storage_ptr, &mut len, flags) };
        #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
        // SAFETY: storage and len describe a valid buffer
        let accepted = {
            if flags != 0 {
                return -libc::EINVAL;
            }
            unsafe { libc::accept(raw, storage_ptr, &mut len) }
        };

        let id = self.adopt(accepted);
        if id >= 0 {
            if let Some(out) = addr {
                *out = SockAddr::from_raw(storage_bytes(&storage, len));
            }
            *addr_len = len;
        }
        id
    }

    fn bind(&self, fd: BackendId, addr: &[u8]) -> i32 {
        let sock = host_fd_or_return!(self, fd);
        let raw = sock.as_raw_fd();
        let (storage, len) = to_storage(addr);
        // SAFETY: storage is valid for len bytes
        int_ret(unsafe {
            libc::bind(raw, (&storage as *const libc::sockaddr_storage).cast(), len)
        })
    }

    fn connect(&self, fd: BackendId, addr: &[u8]) -> i32 {
        let sock = host_fd_or_return!(self, fd);
        let raw = sock.as_raw_fd();
        let (storage, len) = to_storage(addr);
        // SAFETY: storage is valid for len bytes
        int_ret(unsafe {
            libc::connect(raw, (&storage as *const libc::sockaddr_storage).cast(), len)
        })
    }

    fn listen(&self, fd: BackendId, backlog: i32) -> i32 {
        let sock = host_fd_or_return!(self, fd);
        let raw = sock.as_raw_fd();
        // SAFETY: plain syscall
        int_ret(unsafe { libc::listen(raw, backlog) })
    }

    fn close(&self, fd: BackendId) -> i32 {
        let owned = {
            let mut slab = self.slab.lock();
            fd.index()
                .and_then(|i| slab.get_mut(i))
                .and_then(Option::take)
        };
        let Some(shared) = owned else {
            return -libc::EBADF;
        };
        let owned = match Arc::try_unwrap(shared) {
            Ok(owned) => owned,
            Err(shared) => {
                // A call in flight still holds it; the last holder closes it
                trace!("Backend {} detached while in use (host fd {})", fd, shared.as_raw_fd());
                return 0;
            }
        };
        trace!("Closing backend {} (host fd {})", fd, owned.as_raw_fd());
        // SAFETY: ownership was taken out of the slab
        let r = unsafe { libc::close(owned.into_raw_fd()) };
        if r < 0 && nix::errno::Errno::last() == nix::errno::Errno::EINTR {
            return 0;
        }
        int_ret(r)
    }

    fn recv(&self, fd: BackendId, buf: &mut [u8], flags: i32) -> isize {
        let sock = host_fd_or_return!(self, fd);
        let raw = sock.as_raw_fd();
        // SAFETY: buf is valid for writes of its length
        len_ret(unsafe { libc::recv(raw, buf.as_mut_ptr().cast(), buf.len(), flags) })
    }

    fn recvfrom(
        &self,
        fd: BackendId,
        buf: &mut [u8],
        flags: i32,
        addr: Option<&mut SockAddr>,
        addr_len: &mut u32,
    ) -> isize {
        let sock = host_fd_or_return!(self, fd);
        let raw = sock.as_raw_fd();
        // SAFETY: sockaddr_storage is plain old data
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        // SAFETY: buf and storage are valid for their lengths
        let r = unsafe {
            libc::recvfrom(
                raw,
                buf.as_mut_ptr().cast(),
                buf.len(),
                flags,
                (&mut storage as *mut libc::sockaddr_storage).cast(),
                &mut len,
            )
        };
        if r >= 0 {
            if let Some(out) = addr {
                *out = SockAddr::from_raw(storage_bytes(&storage, len));
            }
            *addr_len = len;
        }
        len_ret(r)
    }

    fn recvmsg(
        &self,
        fd: BackendId,
        name: Option<&mut [u8]>,
        name_len: &mut u32,
        iov: &mut [IoSliceMut<'_>],
        flags: i32,
        msg_flags: &mut i32,
    ) -> isize {
        let sock = host_fd_or_return!(self, fd);
        let raw = sock.as_raw_fd();
        // SAFETY: msghdr is plain old data
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        if let Some(name) = name {
            msg.msg_name = name.as_mut_ptr().cast();
            msg.msg_namelen = (*name_len).min(name.len() as u32);
        }
        // IoSliceMut is ABI-compatible with iovec
        msg.msg_iov = iov.as_mut_ptr().cast::<libc::iovec>();
        msg.msg_iovlen = iov.len() as _;

        // SAFETY: every pointer in msg outlives the call
        let r = unsafe { libc::recvmsg(raw, &mut msg, flags) };
        if r >= 0 {
            *name_len = msg.msg_namelen;
            *msg_flags = msg.msg_flags;
        }
        len_ret(r)
    }

    fn send(&self, fd: BackendId, buf: &[u8], flags: i32) -> isize {
        let sock = host_fd_or_return!(self, fd);
        let raw = sock.as_raw_fd();
        // SAFETY: buf is valid for reads of its length
        len_ret(unsafe { libc::send(raw, buf.as_ptr().cast(), buf.len(), flags) })
    }

    fn sendto(
        &self,
        fd: BackendId,
        buf: &[u8],
        flags: i32,
        addr: Option<&SockAddr>,
        addr_len: u32,
    ) -> isize {
        let sock = host_fd_or_return!(self, fd);
        let raw = sock.as_raw_fd();
        let target = addr.map(|a| {
            let mut image = [0u8; SockAddr::SIZE];
            let n = a.write_raw(&mut image, addr_len as usize);
            to_storage(&image[..n])
        });
        let (ptr, len) = match &target {
            Some((storage, len)) => ((storage as *const libc::sockaddr_storage).cast(), *len),
            None => (std::ptr::null(), 0),
        };
        // SAFETY: buf and the optional address outlive the call
        len_ret(unsafe { libc::sendto(raw, buf.as_ptr().cast(), buf.len(), flags, ptr, len) })
    }

    fn sendmsg(
        &self,
        fd: BackendId,
        name: Option<&[u8]>,
        iov: &[IoSlice<'_>],
        flags: i32,
    ) -> isize {
        let sock = host_fd_or_return!(self, fd);
        let raw = sock.as_raw_fd();
        let target = name.map(to_storage);
        // SAFETY: msghdr is plain old data
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        if let Some((storage, len)) = &target {
            msg.msg_name = (storage as *const libc::sockaddr_storage).cast_mut().cast();
            msg.msg_namelen = *len;
        }
        // IoSlice is ABI-compatible with iovec; sendmsg never writes through it
        msg.msg_iov = iov.as_ptr().cast_mut().cast::<libc::iovec>();
        msg.msg_iovlen = iov.len() as _;

        // SAFETY: every pointer in msg outlives the call
        len_ret(unsafe { libc::sendmsg(raw, &msg, flags) })
    }

    fn getpeername(&self, fd: BackendId, addr: &mut [u8]) -> i32 {
        let sock = host_fd_or_return!(self, fd);
        let raw = sock.as_raw_fd();
        let mut len = addr.len() as libc::socklen_t;
        // SAFETY: addr is valid for len bytes
        let r = unsafe { libc::getpeername(raw, addr.as_mut_ptr().cast(), &mut len) };
        if r < 0 {
            neg_errno()
        } else {
            len as i32
        }
    }

    fn getsockname(&self, fd: BackendId, addr: &mut [u8]) -> i32 {
        let sock = host_fd_or_return!(self, fd);
        let raw = sock.as_raw_fd();
        let mut len = addr.len() as libc::socklen_t;
        // SAFETY: addr is valid for len bytes
        let r = unsafe { libc::getsockname(raw, addr.as_mut_ptr().cast(), &mut len) };
        if r < 0 {
            neg_errno()
        } else {
            len as i32
        }
    }

    fn getsockopt(&self, fd: BackendId, level: i32, name: i32, value: &mut [u8]) -> i32 {
        let sock = host_fd_or_return!(self, fd);
        let raw = sock.as_raw_fd();
        let mut len = value.len() as libc::socklen_t;
        // SAFETY: value is valid for len bytes
        let r = unsafe { libc::getsockopt(raw, level, name, value.as_mut_ptr().cast(), &mut len) };
        if r < 0 {
            neg_errno()
        } else {
            len as i32
        }
    }

    fn setsockopt(&self, fd: BackendId, level: i32, name: i32, value: &[u8]) -> i32 {
        let sock = host_fd_or_return!(self, fd);
        let raw = sock.as_raw_fd();
        // SAFETY: value is valid for its length
        int_ret(unsafe {
            libc::setsockopt(
                raw,
                level,
                name,
                value.as_ptr().cast(),
                value.len() as libc::socklen_t,
            )
        })
    }

    fn shutdown(&self, fd: BackendId, how: i32) -> i32 {
        let sock = host_fd_or_return!(self, fd);
        let raw = sock.as_raw_fd();
        // SAFETY: plain syscall
        int_ret(unsafe { libc::shutdown(raw, how) })
    }

    fn poll(&self, fds: &mut [libc::pollfd], timeout_ms: i32) -> i32 {
        let ids: Vec<i32> = fds.iter().map(|p| p.fd).collect();
        let mut held = Vec::with_capacity(fds.len());
        for entry in fds.iter_mut() {
            // Unknown ids become -1, which the kernel skips
            entry.fd = match self.host_fd(BackendId(entry.fd)) {
                Ok(sock) => {
                    let raw = sock.as_raw_fd();
                    held.push(sock);
                    raw
                }
                Err(_) => -1,
            };
        }
        // SAFETY: fds is a valid pollfd array
        let r = int_ret(unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) });
        for (entry, id) in fds.iter_mut().zip(ids) {
            entry.fd = id;
        }
        r
    }

    fn select(
        &self,
        nfds: i32,
        read: Option<&mut FdSet>,
        write: Option<&mut FdSet>,
        except: Option<&mut FdSet>,
        timeout: Option<&Timeval>,
    ) -> i32 {
        let mut reverse = vec![-1i32; FD_SETSIZE];
        let mut sets = [read, write, except];
        let mut host_sets = [FdSet::new(); 3];
        let mut held = Vec::new();
        let mut max = -1;

        for (set, host) in sets.iter().zip(host_sets.iter_mut()) {
            if let Some(set) = set {
                match self.to_host_set(nfds, set, host, &mut reverse, &mut held) {
                    Ok(m) => max = max.max(m),
                    Err(e) => return e,
                }
            }
        }

        let mut tv = timeout.map(|t| t.to_raw());
        let tv_ptr = tv
            .as_mut()
            .map_or(std::ptr::null_mut(), |t| t as *mut libc::timeval);
        let ptr = |present: bool, host: &mut FdSet| {
            if present {
                host.as_mut_ptr()
            } else {
                std::ptr::null_mut()
            }
        };
        let [h_read, h_write, h_except] = &mut host_sets;
        let (p_read, p_write, p_except) = (
            ptr(sets[0].is_some(), h_read),
            ptr(sets[1].is_some(), h_write),
            ptr(sets[2].is_some(), h_except),
        );

        // SAFETY: every non-null pointer refers to a live FdSet
        let r = int_ret(unsafe { libc::select(max + 1, p_read, p_write, p_except, tv_ptr) });
        if r < 0 {
            return r;
        }

        for (set, host) in sets.iter_mut().zip(host_sets.iter()) {
            if let Some(set) = set {
                set.clear();
                for raw in host.iter() {
                    match reverse[raw] {
                        id if id >= 0 => {
                            set.insert(id as usize);
                        }
                        _ => warn!("Host select reported unrequested fd {}", raw),
                    }
                }
            }
        }
        r
    }
}
