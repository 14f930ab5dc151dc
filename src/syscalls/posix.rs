/*!
 * POSIX Facade
 * Process-wide socket calls with C conventions (-1 and errno on failure)
 */

use log::{info, trace};
use nix::errno::Errno;
use std::io::{IoSlice, IoSliceMut};
use std::os::raw::{c_int, c_void};
use std::slice;
use std::sync::{Arc, OnceLock};

use super::fdset::FdSet;
use super::layer::SocketLayer;
use super::msg::{RecvMsg, SendMsg};
use crate::bridge::SocketBridge;
use crate::config::BridgeConfig;
use crate::core::errors::{SockError, SockResult};
use crate::core::types::VirtualFd;

/// Number of standard streams reserved as non-socket slots at init
pub const RESERVED_STDIO_FDS: usize = 3;

static BRIDGED: OnceLock<SocketLayer> = OnceLock::new();
static DIRECT: OnceLock<SocketLayer> = OnceLock::new();

/// Install the bridge for the whole process, configured from the environment
///
/// Must run once, at startup, before any socket is created through this
/// module. Descriptors 0..3 are reserved as non-socket slots so the standard
/// streams keep their numbers.
pub fn init_host_bindings(bridge: Arc<dyn SocketBridge>) -> SockResult<&'static SocketLayer> {
    init_host_bindings_with(BridgeConfig::from_env(), bridge)
}

/// [`init_host_bindings`] with an explicit configuration
pub fn init_host_bindings_with(
    config: BridgeConfig,
    bridge: Arc<dyn SocketBridge>,
) -> SockResult<&'static SocketLayer> {
    if BRIDGED.get().is_some() {
        return Err(SockError::AlreadyInstalled);
    }

    let mut layer = SocketLayer::new(config);
    layer.install_bridge(bridge)?;
    for fd in 0..RESERVED_STDIO_FDS.min(layer.table().capacity()) {
        layer.register_non_socket(fd as i32)?;
    }

    BRIDGED.set(layer).map_err(|_| SockError::AlreadyInstalled)?;
    info!("Host socket bindings installed");
    BRIDGED.get().ok_or(SockError::NotInitialized)
}

/// The bridged layer if installed, else a direct-only layer
pub fn layer() -> &'static SocketLayer {
    match BRIDGED.get() {
        Some(layer) => layer,
        None => DIRECT.get_or_init(|| SocketLayer::new(BridgeConfig::from_env())),
    }
}

/// True once [`init_host_bindings`] has succeeded
pub fn is_bridged() -> bool {
    BRIDGED.get().is_some()
}

/// Pin a descriptor opened outside this module so no socket is minted over it
///
/// Returns `fd` on success, or -1 with `EBADF` (outside the table) or `EBUSY`
/// (slot already taken).
pub fn register_fd(fd: c_int) -> c_int {
    ret_fd("register_fd", layer().register_non_socket(fd))
}

// =============================================================================
// ERRNO
// =============================================================================

/// Write the calling thread's `errno`
pub fn set_errno(errno: Errno) {
    // SAFETY: the errno location is a valid thread-local pointer
    unsafe {
        *errno_location() = errno as c_int;
    }
}

#[cfg(any(target_os = "linux", target_os = "emscripten", target_os = "redox"))]
unsafe fn errno_location() -> *mut c_int {
    libc::__errno_location()
}

#[cfg(target_os = "android")]
unsafe fn errno_location() -> *mut c_int {
    libc::__errno()
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
))]
unsafe fn errno_location() -> *mut c_int {
    libc::__error()
}

fn fail(op: &'static str, err: SockError) {
    trace!("{} -> -1 ({})", op, err);
    set_errno(err.errno());
}

fn ret_int(op: &'static str, result: SockResult<i32>) -> c_int {
    result.unwrap_or_else(|e| {
        fail(op, e);
        -1
    })
}

fn ret_fd(op: &'static str, result: SockResult<VirtualFd>) -> c_int {
    ret_int(op, result.map(i32::from))
}

fn ret_len(op: &'static str, result: SockResult<usize>) -> libc::ssize_t {
    match result {
        Ok(n) => n as libc::ssize_t,
        Err(e) => {
            fail(op, e);
            -1
        }
    }
}

// =============================================================================
// POINTER MARSHALING
// =============================================================================

fn vfd(fd: c_int) -> SockResult<VirtualFd> {
    VirtualFd::try_from(fd)
}

/// Borrow `len` bytes at `ptr`; null is only accepted for an empty buffer
unsafe fn bytes<'a>(ptr: *const c_void, len: usize) -> SockResult<&'a [u8]> {
    if len == 0 {
        return Ok(&[]);
    }
    if ptr.is_null() {
        return Err(SockError::Fault("buffer"));
    }
    Ok(slice::from_raw_parts(ptr.cast::<u8>(), len))
}

unsafe fn bytes_mut<'a>(ptr: *mut c_void, len: usize) -> SockResult<&'a mut [u8]> {
    if len == 0 {
        return Ok(&mut []);
    }
    if ptr.is_null() {
        return Err(SockError::Fault("buffer"));
    }
    Ok(slice::from_raw_parts_mut(ptr.cast::<u8>(), len))
}

/// Optional out-buffer sized by an in/out length
unsafe fn out_buf<'a>(ptr: *mut c_void, len: *mut libc::socklen_t) -> Option<&'a mut [u8]> {
    if ptr.is_null() {
        return None;
    }
    let capacity = len.as_ref().map_or(0, |l| *l as usize);
    Some(slice::from_raw_parts_mut(ptr.cast::<u8>(), capacity))
}

// =============================================================================
// CALLS
// =============================================================================

/// `socket(2)`
pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    ret_fd("socket", layer().socket(domain, ty, protocol))
}

/// `accept(2)`
///
/// # Safety
/// `addr`/`addrlen` must be null or valid as for the libc call.
pub unsafe fn accept(fd: c_int, addr: *mut libc::sockaddr, addrlen: *mut libc::socklen_t) -> c_int {
    accept4(fd, addr, addrlen, 0)
}

/// `accept4(2)`
///
/// # Safety
/// `addr`/`addrlen` must be null or valid as for the libc call.
pub unsafe fn accept4(
    fd: c_int,
    addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
    flags: c_int,
) -> c_int {
    let result = vfd(fd).and_then(|fd| {
        let buf = out_buf(addr.cast(), addrlen);
        layer().accept4(fd, buf, addrlen.as_mut(), flags)
    });
    ret_fd("accept4", result)
}

/// `bind(2)`
///
/// # Safety
/// `addr` must be valid for `addrlen` bytes.
pub unsafe fn bind(fd: c_int, addr: *const libc::sockaddr, addrlen: libc::socklen_t) -> c_int {
    let result = vfd(fd)
        .and_then(|fd| Ok((fd, bytes(addr.cast(), addrlen as usize)?)))
        .and_then(|(fd, addr)| layer().bind(fd, addr));
    ret_int("bind", result)
}

/// `connect(2)`
///
/// # Safety
/// `addr` must be null or valid for `addrlen` bytes.
pub unsafe fn connect(fd: c_int, addr: *const libc::sockaddr, addrlen: libc::socklen_t) -> c_int {
    let addr = (!addr.is_null())
        .then(|| slice::from_raw_parts(addr.cast::<u8>(), addrlen as usize));
    let result = vfd(fd).and_then(|fd| layer().connect(fd, addr));
    ret_int("connect", result)
}

/// `listen(2)`
pub fn listen(fd: c_int, backlog: c_int) -> c_int {
    ret_int("listen", vfd(fd).and_then(|fd| layer().listen(fd, backlog)))
}

/// `close(2)`
pub fn close(fd: c_int) -> c_int {
    ret_int("close", vfd(fd).and_then(|fd| layer().close(fd)))
}

/// `shutdown(2)`
pub fn shutdown(fd: c_int, how: c_int) -> c_int {
    ret_int("shutdown", vfd(fd).and_then(|fd| layer().shutdown(fd, how)))
}

/// `read(2)`
///
/// # Safety
/// `buf` must be valid for writes of `count` bytes.
pub unsafe fn read(fd: c_int, buf: *mut c_void, count: usize) -> libc::ssize_t {
    let result = vfd(fd).and_then(|fd| layer().read(fd, bytes_mut(buf, count)?));
    ret_len("read", result)
}

/// `write(2)`
///
/// # Safety
/// `buf` must be valid for reads of `count` bytes.
pub unsafe fn write(fd: c_int, buf: *const c_void, count: usize) -> libc::ssize_t {
    let result = vfd(fd).and_then(|fd| layer().write(fd, bytes(buf, count)?));
    ret_len("write", result)
}

/// `recv(2)`
///
/// # Safety
/// `buf` must be valid for writes of `len` bytes.
pub unsafe fn recv(fd: c_int, buf: *mut c_void, len: usize, flags: c_int) -> libc::ssize_t {
    let result = vfd(fd).and_then(|fd| layer().recv(fd, bytes_mut(buf, len)?, flags));
    ret_len("recv", result)
}

/// `recvfrom(2)`
///
/// # Safety
/// `buf` must be valid for `len` bytes; `addr`/`addrlen` null or valid.
pub unsafe fn recvfrom(
    fd: c_int,
    buf: *mut c_void,
    len: usize,
    flags: c_int,
    addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> libc::ssize_t {
    let result = vfd(fd).and_then(|fd| {
        let buf = bytes_mut(buf, len)?;
        let addr = out_buf(addr.cast(), addrlen);
        layer().recvfrom(fd, buf, flags, addr, addrlen.as_mut())
    });
    ret_len("recvfrom", result)
}

/// `recvmsg(2)`
///
/// # Safety
/// `msg` must be null or a valid `msghdr` whose buffers are writable.
pub unsafe fn recvmsg(fd: c_int, msg: *mut libc::msghdr, flags: c_int) -> libc::ssize_t {
    let result = vfd(fd).and_then(|fd| {
        let Some(hdr) = msg.as_mut() else {
            return layer().recvmsg(fd, None, flags);
        };
        let name = (!hdr.msg_name.is_null())
            .then(|| slice::from_raw_parts_mut(hdr.msg_name.cast::<u8>(), hdr.msg_namelen as usize));
        // IoSliceMut is ABI-compatible with iovec on unix
        let iov: &mut [IoSliceMut<'_>] = if hdr.msg_iov.is_null() {
            &mut []
        } else {
            slice::from_raw_parts_mut(hdr.msg_iov.cast::<IoSliceMut<'_>>(), hdr.msg_iovlen as usize)
        };
        let mut safe = RecvMsg {
            name,
            name_len: hdr.msg_namelen,
            iov,
            flags: 0,
        };
        let n = layer().recvmsg(fd, Some(&mut safe), flags)?;
        hdr.msg_namelen = safe.name_len;
        hdr.msg_flags = safe.flags;
        Ok(n)
    });
    ret_len("recvmsg", result)
}

/// `send(2)`
///
/// # Safety
/// `buf` must be valid for reads of `len` bytes.
pub unsafe fn send(fd: c_int, buf: *const c_void, len: usize, flags: c_int) -> libc::ssize_t {
    let result = vfd(fd).and_then(|fd| layer().send(fd, bytes(buf, len)?, flags));
    ret_len("send", result)
}

/// `sendto(2)`
///
/// # Safety
/// `buf` must be valid for `len` bytes; `addr` null or valid for `addrlen` bytes.
pub unsafe fn sendto(
    fd: c_int,
    buf: *const c_void,
    len: usize,
    flags: c_int,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
) -> libc::ssize_t {
    let result = vfd(fd).and_then(|fd| {
        let buf = bytes(buf, len)?;
        let addr = (!addr.is_null())
            .then(|| slice::from_raw_parts(addr.cast::<u8>(), addrlen as usize));
        layer().sendto(fd, buf, flags, addr)
    });
    ret_len("sendto", result)
}

/// `sendmsg(2)`
///
/// # Safety
/// `msg` must be null or a valid `msghdr`.
pub unsafe fn sendmsg(fd: c_int, msg: *const libc::msghdr, flags: c_int) -> libc::ssize_t {
    let result = vfd(fd).and_then(|fd| {
        let Some(hdr) = msg.as_ref() else {
            return layer().sendmsg(fd, None, flags);
        };
        let name = (!hdr.msg_name.is_null())
            .then(|| slice::from_raw_parts(hdr.msg_name.cast::<u8>(), hdr.msg_namelen as usize));
        // IoSlice is ABI-compatible with iovec on unix
        let iov: &[IoSlice<'_>] = if hdr.msg_iov.is_null() {
            &[]
        } else {
            slice::from_raw_parts(hdr.msg_iov.cast::<IoSlice<'_>>(), hdr.msg_iovlen as usize)
        };
        layer().sendmsg(fd, Some(&SendMsg { name, iov }), flags)
    });
    ret_len("sendmsg", result)
}

/// `getpeername(2)`
///
/// # Safety
/// `addr`/`addrlen` must be null or valid as for the libc call.
pub unsafe fn getpeername(fd: c_int, addr: *mut libc::sockaddr, addrlen: *mut libc::socklen_t) -> c_int {
    let buf = out_buf(addr.cast(), addrlen);
    let result = vfd(fd).and_then(|fd| layer().getpeername(fd, buf, addrlen.as_mut()));
    ret_int("getpeername", result)
}

/// `getsockname(2)`
///
/// # Safety
/// `addr`/`addrlen` must be null or valid as for the libc call.
pub unsafe fn getsockname(fd: c_int, addr: *mut libc::sockaddr, addrlen: *mut libc::socklen_t) -> c_int {
    let buf = out_buf(addr.cast(), addrlen);
    let result = vfd(fd).and_then(|fd| layer().getsockname(fd, buf, addrlen.as_mut()));
    ret_int("getsockname", result)
}

/// `getsockopt(2)`
///
/// # Safety
/// `optval`/`optlen` must be null or valid as for the libc call.
pub unsafe fn getsockopt(
    fd: c_int,
    level: c_int,
    name: c_int,
    optval: *mut c_void,
    optlen: *mut libc::socklen_t,
) -> c_int {
    let buf = out_buf(optval, optlen);
    let result = vfd(fd).and_then(|fd| layer().getsockopt(fd, level, name, buf, optlen.as_mut()));
    ret_int("getsockopt", result)
}

/// `setsockopt(2)`
///
/// # Safety
/// `optval` must be valid for `optlen` bytes.
pub unsafe fn setsockopt(
    fd: c_int,
    level: c_int,
    name: c_int,
    optval: *const c_void,
    optlen: libc::socklen_t,
) -> c_int {
    let result = vfd(fd)
        .and_then(|fd| Ok((fd, bytes(optval, optlen as usize)?)))
        .and_then(|(fd, value)| layer().setsockopt(fd, level, name, value));
    ret_int("setsockopt", result)
}

/// `poll(2)`
///
/// # Safety
/// `fds` must be valid for `nfds` entries.
pub unsafe fn poll(fds: *mut libc::pollfd, nfds: libc::nfds_t, timeout: c_int) -> c_int {
    let entries: &mut [libc::pollfd] = if nfds == 0 {
        &mut []
    } else if fds.is_null() {
        fail("poll", SockError::Fault("pollfd array"));
        return -1;
    } else {
        slice::from_raw_parts_mut(fds, nfds as usize)
    };
    ret_int("poll", layer().poll(entries, timeout).map(|n| n as i32))
}

/// `select(2)`
///
/// # Safety
/// Each set and `timeout` must be null or valid for reads and writes.
pub unsafe fn select(
    nfds: c_int,
    readfds: *mut libc::fd_set,
    writefds: *mut libc::fd_set,
    exceptfds: *mut libc::fd_set,
    timeout: *mut libc::timeval,
) -> c_int {
    let set = |ptr: *mut libc::fd_set| (!ptr.is_null()).then(|| FdSet::from_raw_mut(ptr));
    let result = layer().select(
        nfds,
        set(readfds),
        set(writefds),
        set(exceptfds),
        timeout.as_mut(),
    );
    ret_int("select", result.map(|n| n as i32))
}
