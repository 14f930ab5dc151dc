/*!
 * Bridged Adapter Tests
 * Descriptor resolution, argument forwarding and leak-free minting
 */

use crate::common::{
    bridged_layer, fake_peer, sockaddr, BridgeCall, DirectCall, RecordingBridge, PAYLOAD,
};
use nix::errno::Errno;
use pretty_assertions::assert_eq;
use sockbridge::bridge::wire::decode_socket_addr;
use sockbridge::{BackendId, FdState, RecvMsg, SendMsg, SockError, VirtualFd};
use std::io::{IoSlice, IoSliceMut};

const ACCEPT_FLAGS: i32 = 0x800;

#[test]
fn test_unknown_descriptor_never_reaches_bridge() {
    let bridge = RecordingBridge::new();
    let (layer, _) = bridged_layer(8, bridge.clone());
    let ghost = VirtualFd(5);
    let mut buf = [0u8; 8];

    assert_eq!(layer.listen(ghost, 1), Err(SockError::BadDescriptor(5)));
    assert_eq!(layer.recv(ghost, &mut buf, 0), Err(SockError::BadDescriptor(5)));
    assert_eq!(layer.send(ghost, b"x", 0), Err(SockError::BadDescriptor(5)));
    assert_eq!(layer.shutdown(ghost, 0), Err(SockError::BadDescriptor(5)));
    assert_eq!(layer.bind(ghost, &sockaddr("127.0.0.1:1")), Err(SockError::BadDescriptor(5)));
    // Past the end of the table
    assert_eq!(layer.listen(VirtualFd(4000), 1), Err(SockError::BadDescriptor(4000)));

    assert_eq!(bridge.call_count(), 0);
}

#[test]
fn test_socket_mints_lowest_free_slot() {
    let bridge = RecordingBridge::with_first_backend(40);
    let (layer, _) = bridged_layer(8, bridge.clone());

    let a = layer.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
    let b = layer.socket(libc::AF_INET, libc::SOCK_DGRAM, 0).unwrap();
    assert_eq!((a, b), (VirtualFd(0), VirtualFd(1)));
    assert_eq!(layer.table().backend_id(a), Some(BackendId(40)));
    assert_eq!(layer.table().backend_id(b), Some(BackendId(41)));
    assert!(layer.is_bridged_socket(a));

    layer.close(a).unwrap();
    let c = layer.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
    assert_eq!(c, VirtualFd(0));
    assert_eq!(layer.table().backend_id(c), Some(BackendId(42)));
}

#[test]
fn test_socket_failure_takes_no_slot() {
    let bridge = RecordingBridge::new();
    bridge.fail("socket", libc::EAFNOSUPPORT);
    let (layer, _) = bridged_layer(4, bridge);

    let err = layer.socket(-1, libc::SOCK_STREAM, 0).unwrap_err();
    assert_eq!(err.errno(), Errno::EAFNOSUPPORT);
    assert_eq!(layer.stats().in_use(), 0);
}

#[test]
fn test_backend_errno_passes_through() {
    let bridge = RecordingBridge::new();
    bridge.fail("connect", libc::ECONNREFUSED);
    bridge.fail("send", libc::EPIPE);
    let (layer, _) = bridged_layer(4, bridge);
    let fd = layer.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();

    let err = layer.connect(fd, Some(&sockaddr("127.0.0.1:9"))).unwrap_err();
    assert_eq!(err, SockError::backend("connect", Errno::ECONNREFUSED));
    assert_eq!(layer.send(fd, b"data", 0).unwrap_err().errno(), Errno::EPIPE);
}

#[test]
fn test_connect_checks_address_before_descriptor() {
    let bridge = RecordingBridge::new();
    let (layer, _) = bridged_layer(4, bridge.clone());
    let ghost = VirtualFd(3);

    assert_eq!(layer.connect(ghost, None), Err(SockError::Fault("connect address")));
    assert_eq!(
        layer.connect(ghost, Some(&[][..])),
        Err(SockError::InvalidArgument("connect address length"))
    );
    assert_eq!(
        layer.connect(ghost, Some(&sockaddr("127.0.0.1:9"))),
        Err(SockError::BadDescriptor(3))
    );
    assert_eq!(bridge.call_count(), 0);
}

#[test]
fn test_arguments_forwarded_in_order() {
    let bridge = RecordingBridge::with_first_backend(7);
    let (layer, _) = bridged_layer(4, bridge.clone());
    let fd = layer.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
    bridge.clear();

    layer.bind(fd, &sockaddr("0.0.0.0:8080")).unwrap();
    layer.listen(fd, 17).unwrap();
    layer.setsockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, &1i32.to_ne_bytes()).unwrap();
    layer.shutdown(fd, libc::SHUT_WR).unwrap();
    layer.send(fd, b"abc", 0).unwrap();

    assert_eq!(
        bridge.calls(),
        vec![
            BridgeCall::Bind(7),
            BridgeCall::Listen(7, 17),
            BridgeCall::Setsockopt(7),
            BridgeCall::Shutdown(7, libc::SHUT_WR),
            BridgeCall::Send(7, b"abc".to_vec()),
        ]
    );
}

#[test]
fn test_accept_fills_peer_address() {
    let bridge = RecordingBridge::with_first_backend(20);
    let (layer, _) = bridged_layer(4, bridge.clone());
    let listener = layer.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();

    let mut addr = [0u8; 128];
    let mut len = addr.len() as u32;
    let conn = layer
        .accept4(listener, Some(&mut addr), Some(&mut len), ACCEPT_FLAGS)
        .unwrap();

    assert_eq!(conn, VirtualFd(1));
    assert_eq!(layer.table().backend_id(conn), Some(BackendId(21)));
    assert_eq!(len, 16);
    assert_eq!(decode_socket_addr(&addr[..len as usize]), Some(fake_peer()));
    assert!(bridge.calls().contains(&BridgeCall::Accept {
        fd: 20,
        addr_len: 128,
        flags: ACCEPT_FLAGS,
    }));
}

#[test]
fn test_accept_without_address() {
    let bridge = RecordingBridge::new();
    let (layer, _) = bridged_layer(4, bridge.clone());
    let listener = layer.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();

    let conn = layer.accept(listener, None, None).unwrap();
    assert!(layer.table().is_socket(conn));
    assert_eq!(
        bridge.calls().last(),
        Some(&BridgeCall::Accept {
            fd: 0,
            addr_len: 0,
            flags: 0,
        })
    );
}

#[test]
fn test_socket_exhaustion_closes_backend() {
    let bridge = RecordingBridge::with_first_backend(10);
    let (layer, _) = bridged_layer(2, bridge.clone());

    layer.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
    layer.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
    let err = layer.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap_err();

    assert_eq!(err, SockError::TableExhausted { capacity: 2 });
    assert_eq!(err.errno(), Errno::EMFILE);
    assert_eq!(bridge.calls().last(), Some(&BridgeCall::Close(12)));
    assert_eq!(layer.stats().in_use(), 2);
}

#[test]
fn test_accept_exhaustion_closes_backend() {
    let bridge = RecordingBridge::new();
    let (layer, _) = bridged_layer(1, bridge.clone());
    let listener = layer.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();

    let err = layer.accept(listener, None, None).unwrap_err();
    assert_eq!(err.errno(), Errno::EMFILE);
    assert_eq!(bridge.calls().last(), Some(&BridgeCall::Close(1)));
    assert!(layer.table().is_socket(listener));
}

#[test]
fn test_close_releases_slot_and_side_channel() {
    let bridge = RecordingBridge::with_first_backend(3);
    let (layer, direct) = bridged_layer(4, bridge.clone());
    let fd = layer.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
    bridge.clear();

    assert_eq!(layer.close(fd), Ok(0));
    assert_eq!(
        bridge.calls(),
        vec![BridgeCall::Close(3), BridgeCall::SideChannel(fd)]
    );
    assert_eq!(layer.table().state(fd), Some(FdState::Free));

    // The slot is gone, so a second close is no longer a bridged socket
    assert_eq!(layer.close(fd), Ok(0));
    assert_eq!(bridge.call_count(), 2);
    assert_eq!(direct.calls(), vec![DirectCall::Close(0)]);
}

#[test]
fn test_close_failure_still_releases_slot() {
    let bridge = RecordingBridge::new();
    bridge.fail("close", libc::EIO);
    let (layer, _) = bridged_layer(4, bridge.clone());
    let fd = layer.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();

    assert_eq!(layer.close(fd).unwrap_err().errno(), Errno::EIO);
    assert_eq!(layer.table().state(fd), Some(FdState::Free));
    assert!(!bridge
        .calls()
        .iter()
        .any(|c| matches!(c, BridgeCall::SideChannel(_))));
}

#[test]
fn test_getsockname_reports_written_length() {
    let bridge = RecordingBridge::with_first_backend(5);
    let (layer, _) = bridged_layer(4, bridge.clone());
    let fd = layer.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();

    let mut addr = [0u8; 128];
    let mut len = 128u32;
    assert_eq!(layer.getsockname(fd, Some(&mut addr), Some(&mut len)), Ok(0));
    assert_eq!(len, 16);
    assert_eq!(decode_socket_addr(&addr[..16]), Some(fake_peer()));

    // Truncated to the caller's stated capacity
    let mut short = [0u8; 128];
    let mut short_len = 8u32;
    layer.getpeername(fd, Some(&mut short), Some(&mut short_len)).unwrap();
    assert_eq!(short_len, 8);
    assert!(bridge.calls().contains(&BridgeCall::Getpeername(5, 8)));
}

#[test]
fn test_name_queries_require_out_params() {
    let bridge = RecordingBridge::new();
    let (layer, _) = bridged_layer(4, bridge.clone());
    let mut len = 16u32;

    // EFAULT wins over EBADF
    assert_eq!(
        layer.getsockname(VirtualFd(2), None, Some(&mut len)),
        Err(SockError::Fault("getsockname"))
    );
    assert_eq!(
        layer.getsockopt(VirtualFd(2), libc::SOL_SOCKET, libc::SO_TYPE, None, None),
        Err(SockError::Fault("getsockopt"))
    );
    assert_eq!(bridge.call_count(), 0);
}

#[test]
fn test_getsockopt_value_length() {
    let bridge = RecordingBridge::new();
    let (layer, _) = bridged_layer(4, bridge);
    let fd = layer.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();

    let mut value = [0u8; 4];
    let mut len = 4u32;
    layer
        .getsockopt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, Some(&mut value), Some(&mut len))
        .unwrap();
    assert_eq!(len, 4);
    assert_eq!(i32::from_ne_bytes(value), 1);
}

#[test]
fn test_recvfrom_reports_source() {
    let bridge = RecordingBridge::with_first_backend(9);
    let (layer, _) = bridged_layer(4, bridge.clone());
    let fd = layer.socket(libc::AF_INET, libc::SOCK_DGRAM, 0).unwrap();

    let mut buf = [0u8; 32];
    let mut addr = [0u8; 64];
    let mut len = 64u32;
    let n = layer
        .recvfrom(fd, &mut buf, 0, Some(&mut addr), Some(&mut len))
        .unwrap();

    assert_eq!(&buf[..n], PAYLOAD);
    assert_eq!(len, 16);
    assert_eq!(decode_socket_addr(&addr[..16]), Some(fake_peer()));
    assert!(bridge.calls().contains(&BridgeCall::Recvfrom { fd: 9, addr_len: 64 }));
}

#[test]
fn test_sendto_forwards_target() {
    let bridge = RecordingBridge::new();
    let (layer, _) = bridged_layer(4, bridge.clone());
    let fd = layer.socket(libc::AF_INET, libc::SOCK_DGRAM, 0).unwrap();
    let target = sockaddr("192.168.1.9:53");

    assert_eq!(layer.sendto(fd, b"query", 0, Some(&target)), Ok(5));
    layer.sendto(fd, b"again", 0, None).unwrap();

    let calls = bridge.calls();
    assert!(calls.contains(&BridgeCall::Sendto {
        fd: 0,
        addr: Some("192.168.1.9:53".parse().unwrap()),
        addr_len: 16,
    }));
    assert!(calls.contains(&BridgeCall::Sendto {
        fd: 0,
        addr: None,
        addr_len: 0,
    }));
}

#[test]
fn test_message_calls_need_header() {
    let bridge = RecordingBridge::new();
    let (layer, _) = bridged_layer(4, bridge);
    let fd = layer.socket(libc::AF_INET, libc::SOCK_DGRAM, 0).unwrap();

    // Descriptor is resolved first, then the header checked
    assert_eq!(layer.recvmsg(VirtualFd(3), None, 0), Err(SockError::BadDescriptor(3)));
    assert_eq!(
        layer.recvmsg(fd, None, 0),
        Err(SockError::InvalidArgument("recvmsg header"))
    );
    assert_eq!(
        layer.sendmsg(fd, None, 0),
        Err(SockError::InvalidArgument("sendmsg header"))
    );
}

#[test]
fn test_recvmsg_scatters_and_reports_name() {
    let bridge = RecordingBridge::new();
    let (layer, _) = bridged_layer(4, bridge.clone());
    let fd = layer.socket(libc::AF_INET, libc::SOCK_DGRAM, 0).unwrap();

    let mut head = [0u8; 2];
    let mut tail = [0u8; 8];
    let mut name = [0u8; 32];
    let mut iov = [IoSliceMut::new(&mut head), IoSliceMut::new(&mut tail)];
    let mut msg = RecvMsg::with_name(&mut iov, &mut name);

    let n = layer.recvmsg(fd, Some(&mut msg), 0).unwrap();
    assert_eq!(n, PAYLOAD.len());
    assert_eq!(msg.name_len, 16);
    assert_eq!(msg.flags, libc::MSG_TRUNC);
    assert!(bridge
        .calls()
        .contains(&BridgeCall::Recvmsg { fd: 0, name_len: 32 }));

    drop(msg);
    assert_eq!(&head, b"po");
    assert_eq!(&tail[..2], b"ng");
    assert_eq!(decode_socket_addr(&name[..16]), Some(fake_peer()));
}

#[test]
fn test_sendmsg_gathers() {
    let bridge = RecordingBridge::new();
    let (layer, _) = bridged_layer(4, bridge.clone());
    let fd = layer.socket(libc::AF_INET, libc::SOCK_DGRAM, 0).unwrap();

    let iov = [IoSlice::new(b"hello "), IoSlice::new(b"world")];
    let msg = SendMsg::new(&iov);
    assert_eq!(layer.sendmsg(fd, Some(&msg), 0), Ok(11));
    assert_eq!(bridge.calls().last(), Some(&BridgeCall::Sendmsg(0, 11)));
}

#[test]
fn test_read_write_on_socket_use_bridge() {
    let bridge = RecordingBridge::with_first_backend(30);
    let (layer, direct) = bridged_layer(4, bridge.clone());
    let fd = layer.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();

    let mut buf = [0u8; 16];
    assert_eq!(layer.read(fd, &mut buf), Ok(PAYLOAD.len()));
    assert_eq!(layer.write(fd, b"out"), Ok(3));

    let calls = bridge.calls();
    assert!(calls.contains(&BridgeCall::Recv(30)));
    assert!(calls.contains(&BridgeCall::Send(30, b"out".to_vec())));
    assert!(direct.calls().is_empty());
}
