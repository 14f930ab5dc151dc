/*!
 * Host Bridge End-to-End Tests
 * Loopback TCP and UDP through virtual descriptors
 */

use pretty_assertions::assert_eq;
use sockbridge::bridge::wire::{decode_socket_addr, encode_socket_addr};
use sockbridge::{BridgeConfig, FdSet, HostBridge, RecvMsg, SendMsg, SocketLayer, VirtualFd};
use std::io::{IoSlice, IoSliceMut};
use std::net::SocketAddr;
use std::sync::Arc;

fn host_layer(capacity: usize) -> (SocketLayer, Arc<HostBridge>) {
    let bridge = Arc::new(HostBridge::new());
    let mut layer = SocketLayer::new(BridgeConfig::testing().with_max_open_fds(capacity));
    layer.install_bridge(bridge.clone()).unwrap();
    (layer, bridge)
}

fn local_addr(layer: &SocketLayer, fd: VirtualFd) -> SocketAddr {
    let mut addr = [0u8; 128];
    let mut len = addr.len() as u32;
    layer.getsockname(fd, Some(&mut addr), Some(&mut len)).unwrap();
    decode_socket_addr(&addr[..len as usize]).unwrap()
}

fn bound(layer: &SocketLayer, ty: i32) -> (VirtualFd, SocketAddr) {
    let fd = layer.socket(libc::AF_INET, ty, 0).unwrap();
    let any = encode_socket_addr("127.0.0.1:0".parse().unwrap());
    layer.bind(fd, &any).unwrap();
    (fd, local_addr(layer, fd))
}

#[test]
fn test_tcp_loopback_echo() {
    let (layer, bridge) = host_layer(16);
    let (server, addr) = bound(&layer, libc::SOCK_STREAM);
    layer.listen(server, 8).unwrap();

    let client = layer.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
    layer
        .connect(client, Some(&encode_socket_addr(addr)))
        .unwrap();

    let mut read: FdSet = [server].into_iter().collect();
    let mut tv = libc::timeval {
        tv_sec: 2,
        tv_usec: 0,
    };
    let ready = layer
        .select(server.as_raw() + 1, Some(&mut read), None, None, Some(&mut tv))
        .unwrap();
    assert_eq!(ready, 1);
    assert!(read.contains(server.index()));

    let mut peer = [0u8; 128];
    let mut peer_len = peer.len() as u32;
    let conn = layer
        .accept(server, Some(&mut peer), Some(&mut peer_len))
        .unwrap();
    assert_eq!(peer_len, 16);
    let peer = decode_socket_addr(&peer[..16]).unwrap();
    assert_eq!(peer.ip(), addr.ip());

    assert_eq!(layer.send(client, b"ping", 0), Ok(4));
    let mut fds = [libc::pollfd {
        fd: conn.as_raw(),
        events: libc::POLLIN,
        revents: 0,
    }];
    assert_eq!(layer.poll(&mut fds, 2000), Ok(1));
    assert_eq!(fds[0].fd, conn.as_raw());
    assert_ne!(fds[0].revents & libc::POLLIN, 0);

    let mut buf = [0u8; 16];
    let n = layer.recv(conn, &mut buf, 0).unwrap();
    assert_eq!(&buf[..n], b"ping");

    assert_eq!(layer.write(conn, b"pong"), Ok(4));
    let n = layer.read(client, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"pong");

    let mut name = [0u8; 128];
    let mut name_len = name.len() as u32;
    layer
        .getpeername(client, Some(&mut name), Some(&mut name_len))
        .unwrap();
    assert_eq!(decode_socket_addr(&name[..name_len as usize]), Some(addr));

    let mut ty = [0u8; 4];
    let mut ty_len = 4u32;
    layer
        .getsockopt(client, libc::SOL_SOCKET, libc::SO_TYPE, Some(&mut ty), Some(&mut ty_len))
        .unwrap();
    assert_eq!(i32::from_ne_bytes(ty), libc::SOCK_STREAM);

    layer.shutdown(client, libc::SHUT_WR).unwrap();
    assert_eq!(layer.recv(conn, &mut buf, 0), Ok(0));

    for fd in [conn, client, server] {
        layer.close(fd).unwrap();
    }
    assert_eq!(layer.stats().in_use(), 0);
    assert_eq!(bridge.open_count(), 0);
}

#[test]
fn test_udp_datagrams() {
    let (layer, bridge) = host_layer(16);
    let (receiver, addr) = bound(&layer, libc::SOCK_DGRAM);
    let (sender, sender_addr) = bound(&layer, libc::SOCK_DGRAM);
    let target = encode_socket_addr(addr);

    assert_eq!(layer.sendto(sender, b"first", 0, Some(&target)), Ok(5));

    let mut buf = [0u8; 32];
    let mut source = [0u8; 128];
    let mut source_len = source.len() as u32;
    let n = layer
        .recvfrom(receiver, &mut buf, 0, Some(&mut source), Some(&mut source_len))
        .unwrap();
    assert_eq!(&buf[..n], b"first");
    assert_eq!(
        decode_socket_addr(&source[..source_len as usize]),
        Some(sender_addr)
    );

    let iov = [IoSlice::new(b"sec"), IoSlice::new(b"ond")];
    let out = SendMsg::to(&target, &iov);
    assert_eq!(layer.sendmsg(sender, Some(&out), 0), Ok(6));

    let mut head = [0u8; 3];
    let mut tail = [0u8; 16];
    let mut name = [0u8; 128];
    let mut iov = [IoSliceMut::new(&mut head), IoSliceMut::new(&mut tail)];
    let mut msg = RecvMsg::with_name(&mut iov, &mut name);
    assert_eq!(layer.recvmsg(receiver, Some(&mut msg), 0), Ok(6));
    let name_len = msg.name_len as usize;
    drop(iov);

    assert_eq!(&head, b"sec");
    assert_eq!(&tail[..3], b"ond");
    assert_eq!(decode_socket_addr(&name[..name_len]), Some(sender_addr));

    layer.close(receiver).unwrap();
    layer.close(sender).unwrap();
    assert_eq!(bridge.open_count(), 0);
}

#[test]
fn test_exhaustion_closes_host_socket() {
    let (layer, bridge) = host_layer(2);
    let a = layer.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
    let b = layer.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();

    let err = layer.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap_err();
    assert_eq!(err.errno(), nix::errno::Errno::EMFILE);
    assert_eq!(bridge.open_count(), 2);

    layer.close(a).unwrap();
    layer.close(b).unwrap();
    assert_eq!(bridge.open_count(), 0);
}

#[test]
fn test_select_times_out() {
    let (layer, _) = host_layer(16);
    let (fd, _) = bound(&layer, libc::SOCK_DGRAM);

    let mut read: FdSet = [fd].into_iter().collect();
    let mut tv = libc::timeval {
        tv_sec: 0,
        tv_usec: 20_000,
    };
    assert_eq!(
        layer.select(fd.as_raw() + 1, Some(&mut read), None, None, Some(&mut tv)),
        Ok(0)
    );
    assert!(read.is_empty());
    layer.close(fd).unwrap();
}
