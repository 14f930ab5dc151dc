/*!
 * Socket Bridge - Demo Entry Point
 *
 * Installs the host bridge for the process and runs a loopback echo through
 * the POSIX facade:
 * - socket/bind/listen/connect/accept on virtual descriptors
 * - select and poll remapped to backend numbering
 * - send/recv/close through the bridged adapters
 */

use std::error::Error;
use std::io;
use std::mem;
use std::sync::Arc;
use tracing::info;

use sockbridge::bridge::wire::{decode_socket_addr, encode_socket_addr};
use sockbridge::syscalls::posix;
use sockbridge::{init_tracing, FdSet, HostBridge};

fn check(op: &str, r: i32) -> Result<i32, Box<dyn Error>> {
    if r < 0 {
        let err = io::Error::last_os_error();
        return Err(format!("{} failed: {}", op, err).into());
    }
    Ok(r)
}

fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();

    info!("Socket bridge demo starting...");
    let layer = posix::init_host_bindings(Arc::new(HostBridge::new()))?;
    info!("Bridge installed: {:?}", layer);

    // Listener on an ephemeral loopback port
    let listener = check("socket", posix::socket(libc::AF_INET, libc::SOCK_STREAM, 0))?;
    let any = encode_socket_addr("127.0.0.1:0".parse()?);
    // SAFETY: buffers below are live locals sized as passed
    unsafe {
        check("bind", posix::bind(listener, any.as_ptr().cast(), any.len() as u32))?;
    }
    check("listen", posix::listen(listener, 8))?;

    let mut local = [0u8; 128];
    let mut local_len = local.len() as libc::socklen_t;
    unsafe {
        check(
            "getsockname",
            posix::getsockname(listener, local.as_mut_ptr().cast(), &mut local_len),
        )?;
    }
    let bound = decode_socket_addr(&local[..local_len as usize]).ok_or("unexpected address family")?;
    info!("Listening on {} as virtual fd {}", bound, listener);

    // Client connects; the listener becomes readable
    let client = check("socket", posix::socket(libc::AF_INET, libc::SOCK_STREAM, 0))?;
    let target = encode_socket_addr(bound);
    unsafe {
        check("connect", posix::connect(client, target.as_ptr().cast(), target.len() as u32))?;
    }

    let mut readable: FdSet = [listener as usize].iter().collect();
    let mut tv = libc::timeval { tv_sec: 2, tv_usec: 0 };
    let ready = unsafe {
        check(
            "select",
            posix::select(
                listener + 1,
                readable.as_mut_ptr(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                &mut tv,
            ),
        )?
    };
    info!("select: {} ready {:?}", ready, readable);

    let server = unsafe {
        check(
            "accept",
            posix::accept(listener, std::ptr::null_mut(), std::ptr::null_mut()),
        )?
    };
    info!("Accepted virtual fd {}", server);

    // Echo one message
    let message = b"hello through the bridge";
    unsafe {
        check(
            "send",
            posix::send(client, message.as_ptr().cast(), message.len(), 0) as i32,
        )?;
    }

    // SAFETY: pollfd is plain old data
    let mut fds: [libc::pollfd; 1] = unsafe { mem::zeroed() };
    fds[0].fd = server;
    fds[0].events = libc::POLLIN;
    unsafe {
        check("poll", posix::poll(fds.as_mut_ptr(), 1, 2000))?;
    }
    info!("poll: fd {} revents {:#x}", fds[0].fd, fds[0].revents);

    let mut buf = [0u8; 64];
    let n = unsafe { check("recv", posix::recv(server, buf.as_mut_ptr().cast(), buf.len(), 0) as i32)? };
    unsafe {
        check("write", posix::write(server, buf.as_ptr().cast(), n as usize) as i32)?;
    }
    let n = unsafe { check("read", posix::read(client, buf.as_mut_ptr().cast(), buf.len()) as i32)? };
    info!("Echoed {:?}", String::from_utf8_lossy(&buf[..n as usize]));

    info!("Table stats: {}", serde_json::to_string(&layer.stats())?);

    for fd in [server, client, listener] {
        check("close", posix::close(fd))?;
    }
    info!("Table stats after close: {}", serde_json::to_string(&layer.stats())?);
    Ok(())
}
