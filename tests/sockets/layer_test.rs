/*!
 * Socket Layer Dispatch Tests
 * Bridge installation and per-call routing
 */

use crate::common::{bridged_layer, BridgeCall, DirectCall, RecordingBridge, RecordingDirect};
use pretty_assertions::assert_eq;
use sockbridge::{Binding, BridgeConfig, FdState, Operation, SockError, SocketLayer, VirtualFd};

fn unbridged() -> (SocketLayer, std::sync::Arc<RecordingDirect>) {
    let direct = RecordingDirect::new();
    let layer = SocketLayer::with_direct(BridgeConfig::testing(), direct.clone());
    (layer, direct)
}

#[test]
fn test_direct_until_installed() {
    let (layer, direct) = unbridged();

    assert!(Operation::ALL
        .iter()
        .all(|op| layer.binding(*op) == Binding::Direct));

    // Descriptor values pass straight through
    let fd = layer.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
    assert_eq!(fd, VirtualFd(100));
    layer.listen(fd, 4).unwrap();
    layer.close(fd).unwrap();

    assert_eq!(
        direct.calls(),
        vec![
            DirectCall::Socket,
            DirectCall::Listen(100),
            DirectCall::Close(100)
        ]
    );
    assert_eq!(layer.stats().in_use(), 0);
}

#[test]
fn test_direct_path_requires_headers() {
    let (layer, _) = unbridged();
    let mut len = 16u32;

    assert_eq!(
        layer.recvmsg(VirtualFd(3), None, 0),
        Err(SockError::Fault("recvmsg header"))
    );
    assert_eq!(
        layer.sendmsg(VirtualFd(3), None, 0),
        Err(SockError::Fault("sendmsg header"))
    );
    assert_eq!(
        layer.getsockname(VirtualFd(3), None, Some(&mut len)),
        Err(SockError::Fault("getsockname"))
    );
    assert_eq!(
        layer.connect(VirtualFd(3), None),
        Err(SockError::Fault("connect address"))
    );
}

#[test]
fn test_direct_errors_surface_platform_errno() {
    let (layer, _) = unbridged();
    let mut addr = [0u8; 16];
    let mut len = 16u32;

    let err = layer
        .getpeername(VirtualFd(3), Some(&mut addr), Some(&mut len))
        .unwrap_err();
    assert_eq!(err.errno(), nix::errno::Errno::ENOTCONN);
}

#[test]
fn test_install_rebinds_every_operation() {
    let (layer, _) = bridged_layer(8, RecordingBridge::new());

    assert!(layer.dispatch().is_bridged());
    for op in Operation::ALL {
        let expected = if op.is_mixed() {
            Binding::Mixed
        } else {
            Binding::Bridged
        };
        assert_eq!(layer.binding(op), expected, "{}", op);
    }
}

#[test]
fn test_install_twice_rejected() {
    let (mut layer, _) = bridged_layer(8, RecordingBridge::new());
    assert_eq!(
        layer.install_bridge(RecordingBridge::new()),
        Err(SockError::AlreadyInstalled)
    );
}

#[test]
fn test_install_after_acquisition_rejected() {
    let (mut layer, _) = unbridged();
    layer.acquire_non_socket().unwrap();

    assert_eq!(
        layer.install_bridge(RecordingBridge::new()),
        Err(SockError::DescriptorsInUse(1))
    );
    assert!(!layer.dispatch().is_bridged());
}

#[test]
fn test_mixed_calls_direct_before_install() {
    let (layer, direct) = unbridged();
    let mut buf = [0u8; 8];
    assert_eq!(layer.read(VirtualFd(0), &mut buf), Ok(4));
    assert_eq!(direct.calls(), vec![DirectCall::Read(0)]);
}

#[test]
fn test_non_socket_calls_go_direct() {
    let bridge = RecordingBridge::new();
    let (layer, direct) = bridged_layer(8, bridge.clone());
    let file = layer.acquire_non_socket().unwrap();
    let sock = layer.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
    bridge.clear();

    let mut buf = [0u8; 8];
    assert_eq!(layer.read(file, &mut buf), Ok(4));
    assert_eq!(&buf[..4], b"file");
    assert_eq!(layer.write(file, b"log line"), Ok(8));
    layer.close(file).unwrap();

    assert_eq!(bridge.call_count(), 0);
    assert_eq!(
        direct.calls(),
        vec![
            DirectCall::Read(0),
            DirectCall::Write(0, b"log line".to_vec()),
            DirectCall::Close(0),
        ]
    );

    // The file layer owns the slot; closing through here does not free it
    assert_eq!(layer.table().state(file), Some(FdState::NonSocket));
    layer.release_non_socket(file);
    assert_eq!(layer.table().state(file), Some(FdState::Free));

    layer.close(sock).unwrap();
    assert_eq!(bridge.calls()[0], BridgeCall::Close(0));
}

#[test]
fn test_non_socket_slots_keep_identity() {
    let (layer, _) = bridged_layer(8, RecordingBridge::with_first_backend(50));
    let stdin = layer.acquire_non_socket().unwrap();
    let stdout = layer.acquire_non_socket().unwrap();
    let sock = layer.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();

    assert_eq!(layer.table().backend_id(stdin), Some(sockbridge::BackendId(0)));
    assert_eq!(layer.table().backend_id(stdout), Some(sockbridge::BackendId(1)));
    assert_eq!(sock, VirtualFd(2));
    assert!(layer.is_bridged_socket(sock));
    assert!(!layer.is_bridged_socket(stdout));
}

#[test]
fn test_registered_descriptor_never_minted() {
    let bridge = RecordingBridge::new();
    let (layer, direct) = bridged_layer(4, bridge.clone());

    let pipe = layer.register_non_socket(1).unwrap();
    assert_eq!(pipe, VirtualFd(1));
    assert_eq!(layer.register_non_socket(1), Err(SockError::SlotTaken(1)));
    assert_eq!(layer.register_non_socket(4), Err(SockError::BadDescriptor(4)));
    assert_eq!(layer.register_non_socket(-1), Err(SockError::BadDescriptor(-1)));

    let socks: Vec<_> = (0..3)
        .map(|_| layer.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap())
        .collect();
    assert_eq!(socks, vec![VirtualFd(0), VirtualFd(2), VirtualFd(3)]);
    let err = layer
        .socket(libc::AF_INET, libc::SOCK_STREAM, 0)
        .unwrap_err();
    assert_eq!(err.errno(), nix::errno::Errno::EMFILE);

    bridge.clear();
    assert_eq!(layer.write(pipe, b"x"), Ok(1));
    layer.close(pipe).unwrap();
    assert_eq!(bridge.call_count(), 0);
    assert_eq!(
        direct.calls(),
        vec![DirectCall::Write(1, b"x".to_vec()), DirectCall::Close(1)]
    );
}

#[test]
fn test_stats_serialize() {
    let (layer, _) = bridged_layer(4, RecordingBridge::new());
    layer.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
    layer.acquire_non_socket().unwrap();

    let json = serde_json::to_value(layer.stats()).unwrap();
    assert_eq!(
        json,
        serde_json::json!({"capacity": 4, "sockets": 1, "non_sockets": 1, "free": 2})
    );
}
