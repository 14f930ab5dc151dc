/*!
 * Socket Bridge Library
 * Unified virtual descriptor space over direct and bridged socket backends
 */

pub mod bridge;
pub mod config;
pub mod core;
pub mod monitoring;
pub mod syscalls;

// Re-exports
pub use bridge::{HostBridge, SockAddr, SocketBridge, Timeval};
pub use config::BridgeConfig;
pub use crate::core::errors::{SockError, SockResult};
pub use crate::core::types::{BackendId, FdState, VirtualFd};
pub use monitoring::init_tracing;
pub use syscalls::{
    Binding, DirectOps, FdSet, FdTable, HostSyscalls, Operation, RecvMsg, SendMsg, SocketLayer,
    TableStats,
};
