/*!
 * Bridged Adapters
 * Per-call wrappers that resolve virtual descriptors and invoke the bridge
 */

use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;

use super::msg::{RecvMsg, SendMsg};
use super::table::FdTable;
use crate::bridge::{SockAddr, SocketBridge};
use crate::core::errors::{bridge_result, bridge_result_len, SockError, SockResult};
use crate::core::types::{BackendId, VirtualFd};
use crate::monitoring::{span_call, CallSpan};

/// Always-socket calls serviced by the bridge provider
///
/// Every adapter resolves the virtual descriptor under the table lock, drops
/// the lock, then calls the bridge. A descriptor with no live entry fails with
/// `EBADF` before the bridge is touched.
#[derive(Clone)]
pub struct BridgedSockets {
    pub(super) table: Arc<FdTable>,
    pub(super) bridge: Arc<dyn SocketBridge>,
    pub(super) slow_threshold: Duration,
}

impl BridgedSockets {
    pub fn new(table: Arc<FdTable>, bridge: Arc<dyn SocketBridge>, slow_threshold: Duration) -> Self {
        Self {
            table,
            bridge,
            slow_threshold,
        }
    }

    pub fn table(&self) -> &Arc<FdTable> {
        &self.table
    }

    pub fn bridge(&self) -> &Arc<dyn SocketBridge> {
        &self.bridge
    }

    pub(super) fn span(&self, op: &'static str, fd: i32) -> CallSpan {
        span_call(op, fd, "bridged", self.slow_threshold)
    }

    /// Backend id of a live descriptor, `EBADF` otherwise
    #[inline]
    pub fn resolve(&self, fd: VirtualFd) -> SockResult<BackendId> {
        self.table
            .backend_id(fd)
            .ok_or_else(|| SockError::bad_descriptor(fd))
    }

    /// Bind a freshly minted backend socket to a new virtual descriptor
    ///
    /// On exhaustion the backend socket is closed again so it cannot leak.
    fn adopt(&self, op: &'static str, backend: BackendId) -> SockResult<VirtualFd> {
        match self.table.acquire_bound(true, backend) {
            Some(fd) => {
                debug!("{}: {} bound to {}", op, fd, backend);
                Ok(fd)
            }
            None => {
                let closed = self.bridge.close(backend);
                warn!(
                    "{}: descriptor table full, closed {} (close returned {})",
                    op, backend, closed
                );
                Err(SockError::TableExhausted {
                    capacity: self.table.capacity(),
                })
            }
        }
    }

    pub fn socket(&self, domain: i32, ty: i32, protocol: i32) -> SockResult<VirtualFd> {
        let span = self.span("socket", -1);
        let _guard = span.enter();

        let result = bridge_result("socket", self.bridge.socket(domain, ty, protocol))
            .and_then(|raw| self.adopt("socket", BackendId(raw)));
        span.record_outcome(&result);
        result
    }

    /// `addr_len` in: capacity of `addr` (0 if absent); out: the peer's length
    pub fn accept4(
        &self,
        fd: VirtualFd,
        addr: Option<&mut [u8]>,
        addr_len: Option<&mut u32>,
        flags: i32,
    ) -> SockResult<VirtualFd> {
        let span = self.span("accept4", fd.as_raw());
        let _guard = span.enter();

        let result = (|| {
            let listener = self.resolve(fd)?;
            let capacity = addr_len.as_deref().copied().unwrap_or(0);
            let mut peer = SockAddr::zeroed();
            let mut len = capacity;

            let raw = self.bridge.accept(
                listener,
                addr.is_some().then_some(&mut peer),
                &mut len,
                flags,
            );
            let accepted = BackendId(bridge_result("accept4", raw)?);

            if let Some(out) = addr {
                peer.write_raw(out, capacity.min(len) as usize);
            }
            if let Some(out_len) = addr_len {
                *out_len = len;
            }
            self.adopt("accept4", accepted)
        })();
        span.record_outcome(&result);
        result
    }

    pub fn accept(
        &self,
        fd: VirtualFd,
        addr: Option<&mut [u8]>,
        addr_len: Option<&mut u32>,
    ) -> SockResult<VirtualFd> {
        self.accept4(fd, addr, addr_len, 0)
    }

    pub fn bind(&self, fd: VirtualFd, addr: &[u8]) -> SockResult<i32> {
        let backend = self.resolve(fd)?;
        bridge_result("bind", self.bridge.bind(backend, addr))
    }

    pub fn connect(&self, fd: VirtualFd, addr: Option<&[u8]>) -> SockResult<i32> {
        let addr = addr.ok_or(SockError::Fault("connect address"))?;
        if addr.is_empty() {
            return Err(SockError::InvalidArgument("connect address length"));
        }
        let backend = self.resolve(fd)?;
        bridge_result("connect", self.bridge.connect(backend, addr))
    }

    pub fn listen(&self, fd: VirtualFd, backlog: i32) -> SockResult<i32> {
        let backend = self.resolve(fd)?;
        bridge_result("listen", self.bridge.listen(backend, backlog))
    }

    /// Close a bridged socket
    ///
    /// The virtual slot is released whatever the bridge reports; the
    /// side-channel cleanup only runs after a successful close.
    pub fn close(&self, fd: VirtualFd) -> SockResult<i32> {
        let span = self.span("close", fd.as_raw());
        let _guard = span.enter();

        let result = self.resolve(fd).and_then(|backend| {
            let closed = bridge_result("close", self.bridge.close(backend));
            if closed.is_ok() {
                self.bridge.release_side_channel(fd);
            }
            self.table.release(fd);
            closed
        });
        span.record_outcome(&result);
        result
    }

    pub fn recv(&self, fd: VirtualFd, buf: &mut [u8], flags: i32) -> SockResult<usize> {
        let backend = self.resolve(fd)?;
        bridge_result_len("recv", self.bridge.recv(backend, buf, flags))
    }

    /// Same `addr_len` convention as [`accept4`](Self::accept4)
    pub fn recvfrom(
        &self,
        fd: VirtualFd,
        buf: &mut [u8],
        flags: i32,
        addr: Option<&mut [u8]>,
        addr_len: Option<&mut u32>,
    ) -> SockResult<usize> {
        let backend = self.resolve(fd)?;
        let capacity = addr_len.as_deref().copied().unwrap_or(0);
        let mut source = SockAddr::zeroed();
        let mut len = capacity;

        let n = bridge_result_len(
            "recvfrom",
            self.bridge.recvfrom(
                backend,
                buf,
                flags,
                addr.is_some().then_some(&mut source),
                &mut len,
            ),
        )?;

        if let Some(out) = addr {
            source.write_raw(out, capacity.min(len) as usize);
        }
        if let Some(out_len) = addr_len {
            *out_len = len;
        }
        Ok(n)
    }

    pub fn recvmsg(
        &self,
        fd: VirtualFd,
        msg: Option<&mut RecvMsg<'_, '_>>,
        flags: i32,
    ) -> SockResult<usize> {
        let backend = self.resolve(fd)?;
        let msg = msg.ok_or(SockError::InvalidArgument("recvmsg header"))?;

        let mut name_len = msg.name_capacity();
        let mut msg_flags = 0;
        let n = bridge_result_len(
            "recvmsg",
            self.bridge.recvmsg(
                backend,
                msg.name.as_deref_mut(),
                &mut name_len,
                msg.iov,
                flags,
                &mut msg_flags,
            ),
        )?;
        msg.name_len = name_len;
        msg.flags = msg_flags;
        Ok(n)
    }

    pub fn send(&self, fd: VirtualFd, buf: &[u8], flags: i32) -> SockResult<usize> {
        let backend = self.resolve(fd)?;
        bridge_result_len("send", self.bridge.send(backend, buf, flags))
    }

    /// `addr` is a raw POSIX sockaddr image
    pub fn sendto(
        &self,
        fd: VirtualFd,
        buf: &[u8],
        flags: i32,
        addr: Option<&[u8]>,
    ) -> SockResult<usize> {
        let backend = self.resolve(fd)?;
        let target = addr.map(SockAddr::from_raw);
        let target_len = addr.map_or(0, |a| a.len() as u32);
        bridge_result_len(
            "sendto",
            self.bridge
                .sendto(backend, buf, flags, target.as_ref(), target_len),
        )
    }

    pub fn sendmsg(
        &self,
        fd: VirtualFd,
        msg: Option<&SendMsg<'_, '_>>,
        flags: i32,
    ) -> SockResult<usize> {
        let backend = self.resolve(fd)?;
        let msg = msg.ok_or(SockError::InvalidArgument("sendmsg header"))?;
        bridge_result_len(
            "sendmsg",
            self.bridge.sendmsg(backend, msg.name, msg.iov, flags),
        )
    }

    pub fn getpeername(
        &self,
        fd: VirtualFd,
        addr: Option<&mut [u8]>,
        addr_len: Option<&mut u32>,
    ) -> SockResult<i32> {
        self.query_name("getpeername", fd, addr, addr_len, |bridge, backend, out| {
            bridge.getpeername(backend, out)
        })
    }

    pub fn getsockname(
        &self,
        fd: VirtualFd,
        addr: Option<&mut [u8]>,
        addr_len: Option<&mut u32>,
    ) -> SockResult<i32> {
        self.query_name("getsockname", fd, addr, addr_len, |bridge, backend, out| {
            bridge.getsockname(backend, out)
        })
    }

    pub fn getsockopt(
        &self,
        fd: VirtualFd,
        level: i32,
        name: i32,
        value: Option<&mut [u8]>,
        value_len: Option<&mut u32>,
    ) -> SockResult<i32> {
        self.query_name("getsockopt", fd, value, value_len, |bridge, backend, out| {
            bridge.getsockopt(backend, level, name, out)
        })
    }

    /// Shared shape of the calls that fill a caller buffer and report its length
    ///
    /// Both out-parameters are required (`EFAULT`, checked before resolution).
    /// The bridge's non-negative return is the written length; it lands in
    /// `len` and the call itself returns 0.
    fn query_name<F>(
        &self,
        op: &'static str,
        fd: VirtualFd,
        buf: Option<&mut [u8]>,
        len: Option<&mut u32>,
        call: F,
    ) -> SockResult<i32>
    where
        F: FnOnce(&dyn SocketBridge, BackendId, &mut [u8]) -> i32,
    {
        let (Some(buf), Some(len)) = (buf, len) else {
            return Err(SockError::Fault(op));
        };
        let backend = self.resolve(fd)?;
        let capacity = (*len as usize).min(buf.len());
        let written = bridge_result(op, call(self.bridge.as_ref(), backend, &mut buf[..capacity]))?;
        *len = written as u32;
        Ok(0)
    }

    pub fn setsockopt(&self, fd: VirtualFd, level: i32, name: i32, value: &[u8]) -> SockResult<i32> {
        let backend = self.resolve(fd)?;
        bridge_result(
            "setsockopt",
            self.bridge.setsockopt(backend, level, name, value),
        )
    }

    pub fn shutdown(&self, fd: VirtualFd, how: i32) -> SockResult<i32> {
        let backend = self.resolve(fd)?;
        bridge_result("shutdown", self.bridge.shutdown(backend, how))
    }

    /// `recv` with no flags
    pub fn read(&self, fd: VirtualFd, buf: &mut [u8]) -> SockResult<usize> {
        self.recv(fd, buf, 0)
    }

    /// `send` with no flags
    pub fn write(&self, fd: VirtualFd, buf: &[u8]) -> SockResult<usize> {
        self.send(fd, buf, 0)
    }
}

impl std::fmt::Debug for BridgedSockets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgedSockets")
            .field("table", &self.table)
            .field("slow_threshold", &self.slow_threshold)
            .finish_non_exhaustive()
    }
}
