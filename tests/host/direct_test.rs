/*!
 * Direct Path Tests
 * Platform descriptors passing through the layer unchanged
 */

use pretty_assertions::assert_eq;
use sockbridge::{BridgeConfig, FdSet, HostBridge, SocketLayer, VirtualFd};
use std::os::fd::{AsRawFd, IntoRawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

fn vfd(raw: i32) -> VirtualFd {
    VirtualFd::try_from(raw).unwrap()
}

fn exercise_pair(layer: &SocketLayer) {
    let (a, b) = UnixStream::pair().unwrap();
    let (fa, fb) = (vfd(a.as_raw_fd()), vfd(b.as_raw_fd()));

    let mut read: FdSet = [fa].into_iter().collect();
    let mut tv = libc::timeval {
        tv_sec: 0,
        tv_usec: 20_000,
    };
    assert_eq!(
        layer.select(fa.as_raw() + 1, Some(&mut read), None, None, Some(&mut tv)),
        Ok(0)
    );
    assert!(read.is_empty());

    let mut fds = [libc::pollfd {
        fd: fa.as_raw(),
        events: libc::POLLIN,
        revents: 0,
    }];
    assert_eq!(layer.poll(&mut fds, 0), Ok(0));

    assert_eq!(layer.write(fb, b"hi"), Ok(2));
    assert_eq!(layer.poll(&mut fds, 1000), Ok(1));
    assert_ne!(fds[0].revents & libc::POLLIN, 0);

    let mut read: FdSet = [fa].into_iter().collect();
    assert_eq!(
        layer.select(fa.as_raw() + 1, Some(&mut read), None, None, None),
        Ok(1)
    );
    assert!(read.contains(fa.index()));

    let mut buf = [0u8; 8];
    assert_eq!(layer.read(fa, &mut buf), Ok(2));
    assert_eq!(&buf[..2], b"hi");

    assert_eq!(layer.close(vfd(a.into_raw_fd())), Ok(0));
    assert_eq!(layer.close(vfd(b.into_raw_fd())), Ok(0));
}

#[test]
fn test_unbridged_layer_uses_platform_numbering() {
    let layer = SocketLayer::new(BridgeConfig::testing());
    exercise_pair(&layer);
    assert_eq!(layer.stats().in_use(), 0);
}

#[test]
fn test_foreign_descriptors_bypass_bridge() {
    let bridge = Arc::new(HostBridge::new());
    let mut layer = SocketLayer::new(BridgeConfig::testing());
    layer.install_bridge(bridge.clone()).unwrap();

    exercise_pair(&layer);
    assert_eq!(bridge.open_count(), 0);
}

#[test]
fn test_direct_socket_round_trip() {
    let layer = SocketLayer::new(BridgeConfig::testing());
    let fd = layer.socket(libc::AF_INET, libc::SOCK_DGRAM, 0).unwrap();

    let mut value = [0u8; 4];
    let mut len = 4u32;
    layer
        .getsockopt(fd, libc::SOL_SOCKET, libc::SO_TYPE, Some(&mut value), Some(&mut len))
        .unwrap();
    assert_eq!(i32::from_ne_bytes(value), libc::SOCK_DGRAM);

    assert_eq!(layer.close(fd), Ok(0));
}

#[test]
fn test_direct_errors_carry_errno() {
    let layer = SocketLayer::new(BridgeConfig::testing());
    let err = layer
        .listen(VirtualFd(i32::MAX as u32), 1)
        .unwrap_err();
    assert_eq!(err.errno(), nix::errno::Errno::EBADF);
}

#[test]
fn test_registered_pipe_survives_socket_minting() {
    let mut ends = [0i32; 2];
    assert_eq!(unsafe { libc::pipe(ends.as_mut_ptr()) }, 0);
    let capacity = ends[0].max(ends[1]) as usize + 3;

    let bridge = Arc::new(HostBridge::new());
    let mut layer = SocketLayer::new(BridgeConfig::testing().with_max_open_fds(capacity));
    layer.install_bridge(bridge.clone()).unwrap();
    let rd = layer.register_non_socket(ends[0]).unwrap();
    let wr = layer.register_non_socket(ends[1]).unwrap();

    // Fill every remaining slot with a bridged socket
    let mut socks = Vec::new();
    while let Ok(fd) = layer.socket(libc::AF_INET, libc::SOCK_DGRAM, 0) {
        socks.push(fd);
    }
    assert_eq!(socks.len(), capacity - 2);
    assert!(!socks.contains(&rd));
    assert!(!socks.contains(&wr));

    assert_eq!(layer.write(wr, b"x"), Ok(1));
    let mut buf = [0u8; 4];
    assert_eq!(layer.read(rd, &mut buf), Ok(1));
    assert_eq!(buf[0], b'x');

    for fd in socks {
        layer.close(fd).unwrap();
    }
    assert_eq!(bridge.open_count(), 0);

    assert_eq!(layer.close(wr), Ok(0));
    assert_eq!(layer.close(rd), Ok(0));
    layer.release_non_socket(wr);
    layer.release_non_socket(rd);
    assert_eq!(layer.stats().in_use(), 0);
}

#[test]
fn test_select_rejects_nfds_past_set() {
    let (a, _b) = UnixStream::pair().unwrap();
    let fa = vfd(a.as_raw_fd());
    let mut tv = libc::timeval {
        tv_sec: 0,
        tv_usec: 0,
    };

    let unbridged = SocketLayer::new(BridgeConfig::testing());
    let mut bridged = SocketLayer::new(BridgeConfig::testing());
    bridged.install_bridge(Arc::new(HostBridge::new())).unwrap();

    for layer in [&unbridged, &bridged] {
        let mut read: FdSet = [fa].into_iter().collect();
        let err = layer
            .select(2048, Some(&mut read), None, None, Some(&mut tv))
            .unwrap_err();
        assert_eq!(err.errno(), nix::errno::Errno::EINVAL);
    }
}
