/*!
 * Direct Path
 * Pass-through implementations backed by the platform's own syscalls
 */

use log::trace;
use nix::errno::Errno;
use std::mem;
use std::ptr;

use super::fdset::FdSet;
use super::msg::{RecvMsg, SendMsg};
use crate::core::errors::{SockError, SockResult};
use crate::core::limits::FD_SETSIZE;

/// Platform socket/io calls on raw descriptor values
///
/// The layer hands virtual descriptors straight through on this path, so the
/// values reaching an implementation are whatever the caller passed.
pub trait DirectOps: Send + Sync {
    fn socket(&self, domain: i32, ty: i32, protocol: i32) -> SockResult<i32>;

    fn accept4(
        &self,
        fd: i32,
        addr: Option<&mut [u8]>,
        addr_len: Option<&mut u32>,
        flags: i32,
    ) -> SockResult<i32>;

    fn bind(&self, fd: i32, addr: &[u8]) -> SockResult<()>;

    fn connect(&self, fd: i32, addr: &[u8]) -> SockResult<()>;

    fn listen(&self, fd: i32, backlog: i32) -> SockResult<()>;

    /// An interrupted close still counts as closed
    fn close(&self, fd: i32) -> SockResult<()>;

    fn read(&self, fd: i32, buf: &mut [u8]) -> SockResult<usize>;

    fn write(&self, fd: i32, buf: &[u8]) -> SockResult<usize>;

    fn recv(&self, fd: i32, buf: &mut [u8], flags: i32) -> SockResult<usize>;

    fn recvfrom(
        &self,
        fd: i32,
        buf: &mut [u8],
        flags: i32,
        addr: Option<&mut [u8]>,
        addr_len: Option<&mut u32>,
    ) -> SockResult<usize>;

    fn recvmsg(&self, fd: i32, msg: &mut RecvMsg<'_, '_>, flags: i32) -> SockResult<usize>;

    fn send(&self, fd: i32, buf: &[u8], flags: i32) -> SockResult<usize>;

    fn sendto(&self, fd: i32, buf: &[u8], flags: i32, addr: Option<&[u8]>) -> SockResult<usize>;

    fn sendmsg(&self, fd: i32, msg: &SendMsg<'_, '_>, flags: i32) -> SockResult<usize>;

    fn getpeername(&self, fd: i32, addr: &mut [u8], addr_len: &mut u32) -> SockResult<()>;

    fn getsockname(&self, fd: i32, addr: &mut [u8], addr_len: &mut u32) -> SockResult<()>;

    fn getsockopt(
        &self,
        fd: i32,
        level: i32,
        name: i32,
        value: &mut [u8],
        value_len: &mut u32,
    ) -> SockResult<()>;

    fn setsockopt(&self, fd: i32, level: i32, name: i32, value: &[u8]) -> SockResult<()>;

    fn shutdown(&self, fd: i32, how: i32) -> SockResult<()>;

    fn poll(&self, fds: &mut [libc::pollfd], timeout_ms: i32) -> SockResult<usize>;

    fn select(
        &self,
        nfds: i32,
        read: Option<&mut FdSet>,
        write: Option<&mut FdSet>,
        except: Option<&mut FdSet>,
        timeout: Option<&mut libc::timeval>,
    ) -> SockResult<usize>;
}

/// [`DirectOps`] over the host libc
#[derive(Debug, Clone, Copy, Default)]
pub struct HostSyscalls;

#[inline]
fn check(op: &'static str, r: libc::c_int) -> SockResult<i32> {
    if r < 0 {
        let errno = Errno::last();
        trace!("{} failed: {}", op, errno);
        Err(SockError::direct(op, errno))
    } else {
        Ok(r)
    }
}

#[inline]
fn check_len(op: &'static str, r: libc::ssize_t) -> SockResult<usize> {
    if r < 0 {
        let errno = Errno::last();
        trace!("{} failed: {}", op, errno);
        Err(SockError::direct(op, errno))
    } else {
        Ok(r as usize)
    }
}

/// Pointer/length pair for an optional sockaddr out-parameter
fn addr_out<'a>(
    addr: Option<&mut [u8]>,
    addr_len: Option<&'a mut u32>,
) -> (*mut libc::sockaddr, Option<(&'a mut u32, libc::socklen_t)>) {
    match (addr, addr_len) {
        (Some(buf), Some(len)) => {
            let capacity = (*len).min(buf.len() as u32);
            (buf.as_mut_ptr().cast(), Some((len, capacity)))
        }
        _ => (ptr::null_mut(), None),
    }
}

#[inline]
fn opt_set(set: Option<&mut FdSet>) -> *mut libc::fd_set {
    set.map_or(ptr::null_mut(), FdSet::as_mut_ptr)
}

impl DirectOps for HostSyscalls {
    fn socket(&self, domain: i32, ty: i32, protocol: i32) -> SockResult<i32> {
        // SAFETY: plain syscall
        check("socket", unsafe { libc::socket(domain, ty, protocol) })
    }

    fn accept4(
        &self,
        fd: i32,
        addr: Option<&mut [u8]>,
        addr_len: Option<&mut u32>,
        flags: i32,
    ) -> SockResult<i32> {
        let (addr_ptr, len) = addr_out(addr, addr_len);
        let mut socklen = len.as_ref().map_or(0, |(_, cap)| *cap);
        let len_ptr = if len.is_some() {
            &mut socklen as *mut libc::socklen_t
        } else {
            ptr::null_mut()
        };

        #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
        // SAFETY: addr_ptr/len_ptr are both null or both describe a live buffer
        let r = unsafe { libc::accept4(fd, addr_ptr, len_ptr, flags) };
        #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
        let r = {
            if flags != 0 {
                return Err(SockError::InvalidArgument("accept4 flags"));
            }
            // SAFETY: addr_ptr/len_ptr are both null or both describe a live buffer
            unsafe { libc::accept(fd, addr_ptr, len_ptr) }
        };

        let accepted = check("accept4", r)?;
        if let Some((out, _)) = len {
            *out = socklen;
        }
        Ok(accepted)
    }

    fn bind(&self, fd: i32, addr: &[u8]) -> SockResult<()> {
        // SAFETY: addr is valid for its length
        check("bind", unsafe {
            libc::bind(fd, addr.as_ptr().cast(), addr.len() as libc::socklen_t)
        })
        .map(drop)
    }

    fn connect(&self, fd: i32, addr: &[u8]) -> SockResult<()> {
        // SAFETY: addr is valid for its length
        check("connect", unsafe {
            libc::connect(fd, addr.as_ptr().cast(), addr.len() as libc::socklen_t)
        })
        .map(drop)
    }

    fn listen(&self, fd: i32, backlog: i32) -> SockResult<()> {
        // SAFETY: plain syscall
        check("listen", unsafe { libc::listen(fd, backlog) }).map(drop)
    }

    fn close(&self, fd: i32) -> SockResult<()> {
        // SAFETY: plain syscall
        match check("close", unsafe { libc::close(fd) }) {
            Err(SockError::Direct {
                errno: Errno::EINTR,
                ..
            }) => Ok(()),
            other => other.map(drop),
        }
    }

    fn read(&self, fd: i32, buf: &mut [u8]) -> SockResult<usize> {
        // SAFETY: buf is valid for writes of its length
        check_len("read", unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) })
    }

    fn write(&self, fd: i32, buf: &[u8]) -> SockResult<usize> {
        // SAFETY: buf is valid for reads of its length
        check_len("write", unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) })
    }

    fn recv(&self, fd: i32, buf: &mut [u8], flags: i32) -> SockResult<usize> {
        // SAFETY: buf is valid for writes of its length
        check_len("recv", unsafe {
            libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), flags)
        })
    }

    fn recvfrom(
        &self,
        fd: i32,
        buf: &mut [u8],
        flags: i32,
        addr: Option<&mut [u8]>,
        addr_len: Option<&mut u32>,
    ) -> SockResult<usize> {
        let (addr_ptr, len) = addr_out(addr, addr_len);
        let mut socklen = len.as_ref().map_or(0, |(_, cap)| *cap);
        let len_ptr = if len.is_some() {
            &mut socklen as *mut libc::socklen_t
        } else {
            ptr::null_mut()
        };
        // SAFETY: buf is live; addr_ptr/len_ptr are both null or both valid
        let n = check_len("recvfrom", unsafe {
            libc::recvfrom(fd, buf.as_mut_ptr().cast(), buf.len(), flags, addr_ptr, len_ptr)
        })?;
        if let Some((out, _)) = len {
            *out = socklen;
        }
        Ok(n)
    }

    fn recvmsg(&self, fd: i32, msg: &mut RecvMsg<'_, '_>, flags: i32) -> SockResult<usize> {
        // SAFETY: msghdr is plain old data
        let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
        let capacity = msg.name_capacity();
        if let Some(name) = msg.name.as_deref_mut() {
            hdr.msg_name = name.as_mut_ptr().cast();
            hdr.msg_namelen = capacity;
        }
        hdr.msg_iov = msg.iov.as_mut_ptr().cast::<libc::iovec>();
        hdr.msg_iovlen = msg.iov.len() as _;

        // SAFETY: every pointer in hdr borrows from msg for the call
        let n = check_len("recvmsg", unsafe { libc::recvmsg(fd, &mut hdr, flags) })?;
        msg.name_len = hdr.msg_namelen;
        msg.flags = hdr.msg_flags;
        Ok(n)
    }

    fn send(&self, fd: i32, buf: &[u8], flags: i32) -> SockResult<usize> {
        // SAFETY: buf is valid for reads of its length
        check_len("send", unsafe {
            libc::send(fd, buf.as_ptr().cast(), buf.len(), flags)
        })
    }

    fn sendto(&self, fd: i32, buf: &[u8], flags: i32, addr: Option<&[u8]>) -> SockResult<usize> {
        let (addr_ptr, addr_len) = addr.map_or((ptr::null(), 0), |a| {
            (a.as_ptr().cast::<libc::sockaddr>(), a.len() as libc::socklen_t)
        });
        // SAFETY: buf and addr are valid for their lengths
        check_len("sendto", unsafe {
            libc::sendto(fd, buf.as_ptr().cast(), buf.len(), flags, addr_ptr, addr_len)
        })
    }

    fn sendmsg(&self, fd: i32, msg: &SendMsg<'_, '_>, flags: i32) -> SockResult<usize> {
        // SAFETY: msghdr is plain old data
        let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
        if let Some(name) = msg.name {
            hdr.msg_name = name.as_ptr().cast_mut().cast();
            hdr.msg_namelen = name.len() as libc::socklen_t;
        }
        hdr.msg_iov = msg.iov.as_ptr().cast_mut().cast::<libc::iovec>();
        hdr.msg_iovlen = msg.iov.len() as _;

        // SAFETY: sendmsg only reads through hdr
        check_len("sendmsg", unsafe { libc::sendmsg(fd, &hdr, flags) })
    }

    fn getpeername(&self, fd: i32, addr: &mut [u8], addr_len: &mut u32) -> SockResult<()> {
        let mut len = (*addr_len).min(addr.len() as u32);
        // SAFETY: addr is valid for len bytes
        check("getpeername", unsafe {
            libc::getpeername(fd, addr.as_mut_ptr().cast(), &mut len)
        })?;
        *addr_len = len;
        Ok(())
    }

    fn getsockname(&self, fd: i32, addr: &mut [u8], addr_len: &mut u32) -> SockResult<()> {
        let mut len = (*addr_len).min(addr.len() as u32);
        // SAFETY: addr is valid for len bytes
        check("getsockname", unsafe {
            libc::getsockname(fd, addr.as_mut_ptr().cast(), &mut len)
        })?;
        *addr_len = len;
        Ok(())
    }

    fn getsockopt(
        &self,
        fd: i32,
        level: i32,
        name: i32,
        value: &mut [u8],
        value_len: &mut u32,
    ) -> SockResult<()> {
        let mut len = (*value_len).min(value.len() as u32);
        // SAFETY: value is valid for len bytes
        check("getsockopt", unsafe {
            libc::getsockopt(fd, level, name, value.as_mut_ptr().cast(), &mut len)
        })?;
        *value_len = len;
        Ok(())
    }

    fn setsockopt(&self, fd: i32, level: i32, name: i32, value: &[u8]) -> SockResult<()> {
        // SAFETY: value is valid for its length
        check("setsockopt", unsafe {
            libc::setsockopt(
                fd,
                level,
                name,
                value.as_ptr().cast(),
                value.len() as libc::socklen_t,
            )
        })
        .map(drop)
    }

    fn shutdown(&self, fd: i32, how: i32) -> SockResult<()> {
        // SAFETY: plain syscall
        check("shutdown", unsafe { libc::shutdown(fd, how) }).map(drop)
    }

    fn poll(&self, fds: &mut [libc::pollfd], timeout_ms: i32) -> SockResult<usize> {
        // SAFETY: fds is a valid pollfd array
        let ready = check("poll", unsafe {
            libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms)
        })?;
        Ok(ready as usize)
    }

    fn select(
        &self,
        nfds: i32,
        read: Option<&mut FdSet>,
        write: Option<&mut FdSet>,
        except: Option<&mut FdSet>,
        timeout: Option<&mut libc::timeval>,
    ) -> SockResult<usize> {
        // The sets hold FD_SETSIZE bits; a wider nfds would reach past them
        if nfds < 0 || nfds as usize > FD_SETSIZE {
            return Err(SockError::InvalidArgument("select nfds"));
        }
        let tv = timeout.map_or(ptr::null_mut(), |t| t as *mut libc::timeval);
        // SAFETY: each pointer is null or refers to a live, layout-compatible set
        let ready = check("select", unsafe {
            libc::select(nfds, opt_set(read), opt_set(write), opt_set(except), tv)
        })?;
        Ok(ready as usize)
    }
}
