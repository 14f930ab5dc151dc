/*!
 * Socket Layer
 * The POSIX-shaped call surface, routed through the dispatch vector
 */

use log::{debug, info};
use std::sync::Arc;

use super::bridged::BridgedSockets;
use super::direct::{DirectOps, HostSyscalls};
use super::dispatch::{Binding, DispatchVector, Operation};
use super::fdset::FdSet;
use super::mixed::MixedCalls;
use super::msg::{RecvMsg, SendMsg};
use super::table::{FdTable, TableStats};
use crate::bridge::SocketBridge;
use crate::config::BridgeConfig;
use crate::core::errors::{SockError, SockResult};
use crate::core::types::VirtualFd;

/// Owner of the descriptor space and the per-operation bindings
///
/// Until [`install_bridge`](Self::install_bridge) runs, every call goes
/// straight to the platform with the descriptor value unchanged. Afterwards
/// always-socket calls go through the bridge and `close`/`read`/`write`/
/// `poll`/`select` are classified per call.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use sockbridge::{BridgeConfig, HostBridge, SocketLayer};
///
/// let mut layer = SocketLayer::new(BridgeConfig::default());
/// layer.install_bridge(Arc::new(HostBridge::new())).unwrap();
/// let fd = layer.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
/// layer.close(fd).unwrap();
/// ```
pub struct SocketLayer {
    config: BridgeConfig,
    table: Arc<FdTable>,
    direct: Arc<dyn DirectOps>,
    bridged: Option<BridgedSockets>,
    dispatch: DispatchVector,
}

impl SocketLayer {
    /// Layer over the host libc, not yet bridged
    pub fn new(config: BridgeConfig) -> Self {
        Self::with_direct(config, Arc::new(HostSyscalls))
    }

    /// Layer over a custom direct path
    pub fn with_direct(config: BridgeConfig, direct: Arc<dyn DirectOps>) -> Self {
        let table = Arc::new(FdTable::with_capacity(config.max_open_fds));
        debug!("Socket layer created with {} descriptor slots", config.max_open_fds);
        Self {
            config,
            table,
            direct,
            bridged: None,
            dispatch: DispatchVector::new(),
        }
    }

    /// Rebind every operation to its bridged family
    ///
    /// Runs once, before any descriptor has been acquired.
    pub fn install_bridge(&mut self, bridge: Arc<dyn SocketBridge>) -> SockResult<()> {
        if self.bridged.is_some() || self.dispatch.is_bridged() {
            return Err(SockError::AlreadyInstalled);
        }
        let in_use = self.table.in_use();
        if in_use > 0 {
            return Err(SockError::DescriptorsInUse(in_use));
        }

        self.bridged = Some(BridgedSockets::new(
            Arc::clone(&self.table),
            bridge,
            self.config.slow_call_threshold(),
        ));
        self.dispatch.install_bridge();
        info!(
            "Bridge bindings installed ({} operations, {} slots)",
            Operation::COUNT,
            self.table.capacity()
        );
        Ok(())
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn table(&self) -> &Arc<FdTable> {
        &self.table
    }

    pub fn dispatch(&self) -> &DispatchVector {
        &self.dispatch
    }

    pub fn stats(&self) -> TableStats {
        self.table.stats()
    }

    #[inline]
    pub fn binding(&self, op: Operation) -> Binding {
        self.dispatch.binding(op)
    }

    /// True iff `fd` is a socket serviced by the bridge
    pub fn is_bridged_socket(&self, fd: VirtualFd) -> bool {
        self.bridged.is_some() && self.table.is_socket(fd)
    }

    /// Reserve the lowest free slot for a non-socket descriptor
    ///
    /// Non-socket slots map to themselves, so a file layer sharing this
    /// descriptor space keeps its platform numbering.
    pub fn acquire_non_socket(&self) -> SockResult<VirtualFd> {
        self.table.acquire(false).ok_or(SockError::TableExhausted {
            capacity: self.table.capacity(),
        })
    }

    /// Pin a descriptor opened outside the layer to its own number
    ///
    /// Pipes, files and other descriptors the platform hands out directly
    /// share the numbering with virtual sockets. Register them before sockets
    /// are created, or a socket may be minted at the same index and take over
    /// `read`/`write`/`close`/`poll`/`select` on that number. Fails with
    /// `EBADF` if `raw` is outside the table and `EBUSY` if the slot is taken.
    pub fn register_non_socket(&self, raw: i32) -> SockResult<VirtualFd> {
        let fd = VirtualFd::try_from(raw)?;
        if fd.index() >= self.table.capacity() {
            return Err(SockError::bad_descriptor(raw));
        }
        if !self.table.claim_at(fd, false) {
            return Err(SockError::SlotTaken(raw));
        }
        debug!("Registered non-socket descriptor {}", fd);
        Ok(fd)
    }

    /// Return a slot obtained from [`acquire_non_socket`](Self::acquire_non_socket)
    /// or [`register_non_socket`](Self::register_non_socket)
    pub fn release_non_socket(&self, fd: VirtualFd) {
        self.table.release(fd);
    }

    fn bridged(&self) -> SockResult<&BridgedSockets> {
        self.bridged.as_ref().ok_or(SockError::NotInitialized)
    }

    fn mixed(&self) -> SockResult<MixedCalls<'_>> {
        Ok(MixedCalls::new(self.bridged()?, self.direct.as_ref()))
    }

    // =========================================================================
    // CONNECTION SETUP
    // =========================================================================

    pub fn socket(&self, domain: i32, ty: i32, protocol: i32) -> SockResult<VirtualFd> {
        match self.binding(Operation::Socket) {
            Binding::Direct => VirtualFd::try_from(self.direct.socket(domain, ty, protocol)?),
            Binding::Bridged | Binding::Mixed => self.bridged()?.socket(domain, ty, protocol),
        }
    }

    pub fn accept(
        &self,
        fd: VirtualFd,
        addr: Option<&mut [u8]>,
        addr_len: Option<&mut u32>,
    ) -> SockResult<VirtualFd> {
        match self.binding(Operation::Accept) {
            Binding::Direct => {
                VirtualFd::try_from(self.direct.accept4(fd.as_raw(), addr, addr_len, 0)?)
            }
            Binding::Bridged | Binding::Mixed => self.bridged()?.accept(fd, addr, addr_len),
        }
    }

    pub fn accept4(
        &self,
        fd: VirtualFd,
        addr: Option<&mut [u8]>,
        addr_len: Option<&mut u32>,
        flags: i32,
    ) -> SockResult<VirtualFd> {
        match self.binding(Operation::Accept4) {
            Binding::Direct => {
                VirtualFd::try_from(self.direct.accept4(fd.as_raw(), addr, addr_len, flags)?)
            }
            Binding::Bridged | Binding::Mixed => {
                self.bridged()?.accept4(fd, addr, addr_len, flags)
            }
        }
    }

    pub fn bind(&self, fd: VirtualFd, addr: &[u8]) -> SockResult<i32> {
        match self.binding(Operation::Bind) {
            Binding::Direct => self.direct.bind(fd.as_raw(), addr).map(|()| 0),
            Binding::Bridged | Binding::Mixed => self.bridged()?.bind(fd, addr),
        }
    }

    pub fn connect(&self, fd: VirtualFd, addr: Option<&[u8]>) -> SockResult<i32> {
        match self.binding(Operation::Connect) {
            Binding::Direct => {
                let addr = addr.ok_or(SockError::Fault("connect address"))?;
                self.direct.connect(fd.as_raw(), addr).map(|()| 0)
            }
            Binding::Bridged | Binding::Mixed => self.bridged()?.connect(fd, addr),
        }
    }

    pub fn listen(&self, fd: VirtualFd, backlog: i32) -> SockResult<i32> {
        match self.binding(Operation::Listen) {
            Binding::Direct => self.direct.listen(fd.as_raw(), backlog).map(|()| 0),
            Binding::Bridged | Binding::Mixed => self.bridged()?.listen(fd, backlog),
        }
    }

    pub fn shutdown(&self, fd: VirtualFd, how: i32) -> SockResult<i32> {
        match self.binding(Operation::Shutdown) {
            Binding::Direct => self.direct.shutdown(fd.as_raw(), how).map(|()| 0),
            Binding::Bridged | Binding::Mixed => self.bridged()?.shutdown(fd, how),
        }
    }

    pub fn close(&self, fd: VirtualFd) -> SockResult<i32> {
        match self.binding(Operation::Close) {
            Binding::Direct => self.direct.close(fd.as_raw()).map(|()| 0),
            Binding::Bridged => self.bridged()?.close(fd),
            Binding::Mixed => self.mixed()?.close(fd),
        }
    }

    // =========================================================================
    // DATA TRANSFER
    // =========================================================================

    pub fn read(&self, fd: VirtualFd, buf: &mut [u8]) -> SockResult<usize> {
        match self.binding(Operation::Read) {
            Binding::Direct => self.direct.read(fd.as_raw(), buf),
            Binding::Bridged => self.bridged()?.read(fd, buf),
            Binding::Mixed => self.mixed()?.read(fd, buf),
        }
    }

    pub fn write(&self, fd: VirtualFd, buf: &[u8]) -> SockResult<usize> {
        match self.binding(Operation::Write) {
            Binding::Direct => self.direct.write(fd.as_raw(), buf),
            Binding::Bridged => self.bridged()?.write(fd, buf),
            Binding::Mixed => self.mixed()?.write(fd, buf),
        }
    }

    pub fn recv(&self, fd: VirtualFd, buf: &mut [u8], flags: i32) -> SockResult<usize> {
        match self.binding(Operation::Recv) {
            Binding::Direct => self.direct.recv(fd.as_raw(), buf, flags),
            Binding::Bridged | Binding::Mixed => self.bridged()?.recv(fd, buf, flags),
        }
    }

    pub fn recvfrom(
        &self,
        fd: VirtualFd,
        buf: &mut [u8],
        flags: i32,
        addr: Option<&mut [u8]>,
        addr_len: Option<&mut u32>,
    ) -> SockResult<usize> {
        match self.binding(Operation::Recvfrom) {
            Binding::Direct => self
                .direct
                .recvfrom(fd.as_raw(), buf, flags, addr, addr_len),
            Binding::Bridged | Binding::Mixed => {
                self.bridged()?.recvfrom(fd, buf, flags, addr, addr_len)
            }
        }
    }

    pub fn recvmsg(
        &self,
        fd: VirtualFd,
        msg: Option<&mut RecvMsg<'_, '_>>,
        flags: i32,
    ) -> SockResult<usize> {
        match self.binding(Operation::Recvmsg) {
            Binding::Direct => {
                let msg = msg.ok_or(SockError::Fault("recvmsg header"))?;
                self.direct.recvmsg(fd.as_raw(), msg, flags)
            }
            Binding::Bridged | Binding::Mixed => self.bridged()?.recvmsg(fd, msg, flags),
        }
    }

    pub fn send(&self, fd: VirtualFd, buf: &[u8], flags: i32) -> SockResult<usize> {
        match self.binding(Operation::Send) {
            Binding::Direct => self.direct.send(fd.as_raw(), buf, flags),
            Binding::Bridged | Binding::Mixed => self.bridged()?.send(fd, buf, flags),
        }
    }

    pub fn sendto(
        &self,
        fd: VirtualFd,
        buf: &[u8],
        flags: i32,
        addr: Option<&[u8]>,
    ) -> SockResult<usize> {
        match self.binding(Operation::Sendto) {
            Binding::Direct => self.direct.sendto(fd.as_raw(), buf, flags, addr),
            Binding::Bridged | Binding::Mixed => self.bridged()?.sendto(fd, buf, flags, addr),
        }
    }

    pub fn sendmsg(
        &self,
        fd: VirtualFd,
        msg: Option<&SendMsg<'_, '_>>,
        flags: i32,
    ) -> SockResult<usize> {
        match self.binding(Operation::Sendmsg) {
            Binding::Direct => {
                let msg = msg.ok_or(SockError::Fault("sendmsg header"))?;
                self.direct.sendmsg(fd.as_raw(), msg, flags)
            }
            Binding::Bridged | Binding::Mixed => self.bridged()?.sendmsg(fd, msg, flags),
        }
    }

    // =========================================================================
    // SOCKET QUERIES
    // =========================================================================

    pub fn getpeername(
        &self,
        fd: VirtualFd,
        addr: Option<&mut [u8]>,
        addr_len: Option<&mut u32>,
    ) -> SockResult<i32> {
        match self.binding(Operation::Getpeername) {
            Binding::Direct => {
                let (Some(addr), Some(len)) = (addr, addr_len) else {
                    return Err(SockError::Fault("getpeername"));
                };
                self.direct.getpeername(fd.as_raw(), addr, len).map(|()| 0)
            }
            Binding::Bridged | Binding::Mixed => self.bridged()?.getpeername(fd, addr, addr_len),
        }
    }

    pub fn getsockname(
        &self,
        fd: VirtualFd,
        addr: Option<&mut [u8]>,
        addr_len: Option<&mut u32>,
    ) -> SockResult<i32> {
        match self.binding(Operation::Getsockname) {
            Binding::Direct => {
                let (Some(addr), Some(len)) = (addr, addr_len) else {
                    return Err(SockError::Fault("getsockname"));
                };
                self.direct.getsockname(fd.as_raw(), addr, len).map(|()| 0)
            }
            Binding::Bridged | Binding::Mixed => self.bridged()?.getsockname(fd, addr, addr_len),
        }
    }

    pub fn getsockopt(
        &self,
        fd: VirtualFd,
        level: i32,
        name: i32,
        value: Option<&mut [u8]>,
        value_len: Option<&mut u32>,
    ) -> SockResult<i32> {
        match self.binding(Operation::Getsockopt) {
            Binding::Direct => {
                let (Some(value), Some(len)) = (value, value_len) else {
                    return Err(SockError::Fault("getsockopt"));
                };
                self.direct
                    .getsockopt(fd.as_raw(), level, name, value, len)
                    .map(|()| 0)
            }
            Binding::Bridged | Binding::Mixed => {
                self.bridged()?
                    .getsockopt(fd, level, name, value, value_len)
            }
        }
    }

    pub fn setsockopt(&self, fd: VirtualFd, level: i32, name: i32, value: &[u8]) -> SockResult<i32> {
        match self.binding(Operation::Setsockopt) {
            Binding::Direct => self
                .direct
                .setsockopt(fd.as_raw(), level, name, value)
                .map(|()| 0),
            Binding::Bridged | Binding::Mixed => self.bridged()?.setsockopt(fd, level, name, value),
        }
    }

    // =========================================================================
    // MULTIPLEXING
    // =========================================================================

    /// `pollfd::fd` values are virtual descriptors
    pub fn poll(&self, fds: &mut [libc::pollfd], timeout_ms: i32) -> SockResult<usize> {
        match self.binding(Operation::Poll) {
            Binding::Direct => self.direct.poll(fds, timeout_ms),
            Binding::Bridged => self.bridged()?.poll(fds, timeout_ms),
            Binding::Mixed => self.mixed()?.poll(fds, timeout_ms),
        }
    }

    /// Sets hold virtual descriptors and are rewritten in place to the ready members
    pub fn select(
        &self,
        nfds: i32,
        read: Option<&mut FdSet>,
        write: Option<&mut FdSet>,
        except: Option<&mut FdSet>,
        timeout: Option<&mut libc::timeval>,
    ) -> SockResult<usize> {
        match self.binding(Operation::Select) {
            Binding::Direct => self.direct.select(nfds, read, write, except, timeout),
            Binding::Bridged => self.bridged()?.select(nfds, read, write, except, timeout),
            Binding::Mixed => self.mixed()?.select(nfds, read, write, except, timeout),
        }
    }
}

impl std::fmt::Debug for SocketLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketLayer")
            .field("config", &self.config)
            .field("bridged", &self.bridged.is_some())
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}
