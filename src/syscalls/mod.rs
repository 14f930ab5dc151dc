/*!
 * Syscalls Module
 * Virtual descriptor space and the socket call surface over it
 */

pub mod bridged;
pub mod direct;
pub mod dispatch;
pub mod fdset;
pub mod layer;
pub mod mixed;
pub mod msg;
pub mod multiplex;
pub mod posix;
pub mod table;

// Re-export public API
pub use bridged::BridgedSockets;
pub use direct::{DirectOps, HostSyscalls};
pub use dispatch::{Binding, DispatchVector, Operation};
pub use fdset::FdSet;
pub use layer::SocketLayer;
pub use mixed::MixedCalls;
pub use msg::{RecvMsg, SendMsg};
pub use table::{FdTable, TableStats};
