/*!
 * Dispatch Vector
 * Per-operation binding to the direct, bridged or mixed implementation family
 */

use serde::{Deserialize, Serialize};
use std::fmt;

/// Every virtualized socket/io call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Accept,
    Accept4,
    Bind,
    Close,
    Connect,
    Listen,
    Recv,
    Recvfrom,
    Recvmsg,
    Send,
    Sendto,
    Sendmsg,
    Read,
    Write,
    Getpeername,
    Getsockname,
    Getsockopt,
    Setsockopt,
    Shutdown,
    Poll,
    Select,
    Socket,
}

impl Operation {
    pub const COUNT: usize = 22;

    pub const ALL: [Operation; Self::COUNT] = [
        Operation::Accept,
        Operation::Accept4,
        Operation::Bind,
        Operation::Close,
        Operation::Connect,
        Operation::Listen,
        Operation::Recv,
        Operation::Recvfrom,
        Operation::Recvmsg,
        Operation::Send,
        Operation::Sendto,
        Operation::Sendmsg,
        Operation::Read,
        Operation::Write,
        Operation::Getpeername,
        Operation::Getsockname,
        Operation::Getsockopt,
        Operation::Setsockopt,
        Operation::Shutdown,
        Operation::Poll,
        Operation::Select,
        Operation::Socket,
    ];

    /// POSIX name of the call
    pub fn name(self) -> &'static str {
        match self {
            Operation::Accept => "accept",
            Operation::Accept4 => "accept4",
            Operation::Bind => "bind",
            Operation::Close => "close",
            Operation::Connect => "connect",
            Operation::Listen => "listen",
            Operation::Recv => "recv",
            Operation::Recvfrom => "recvfrom",
            Operation::Recvmsg => "recvmsg",
            Operation::Send => "send",
            Operation::Sendto => "sendto",
            Operation::Sendmsg => "sendmsg",
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Getpeername => "getpeername",
            Operation::Getsockname => "getsockname",
            Operation::Getsockopt => "getsockopt",
            Operation::Setsockopt => "setsockopt",
            Operation::Shutdown => "shutdown",
            Operation::Poll => "poll",
            Operation::Select => "select",
            Operation::Socket => "socket",
        }
    }

    /// Calls that may name non-socket descriptors
    #[inline]
    pub fn is_mixed(self) -> bool {
        matches!(
            self,
            Operation::Close
                | Operation::Read
                | Operation::Write
                | Operation::Poll
                | Operation::Select
        )
    }

    /// Binding this call gets once the bridge is installed
    #[inline]
    pub fn bridged_binding(self) -> Binding {
        if self.is_mixed() {
            Binding::Mixed
        } else {
            Binding::Bridged
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Implementation family servicing an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Binding {
    /// Straight through to the platform
    #[default]
    Direct,
    /// Always via the bridge provider
    Bridged,
    /// Classified per call
    Mixed,
}

/// One binding per operation
///
/// Starts all-direct. [`install_bridge`](Self::install_bridge) switches every
/// slot to its bridged family; the owning layer guards it so it runs at most once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchVector {
    bindings: [Binding; Operation::COUNT],
}

impl DispatchVector {
    pub fn new() -> Self {
        Self {
            bindings: [Binding::Direct; Operation::COUNT],
        }
    }

    #[inline]
    pub fn binding(&self, op: Operation) -> Binding {
        self.bindings[op as usize]
    }

    pub fn install_bridge(&mut self) {
        for op in Operation::ALL {
            self.bindings[op as usize] = op.bridged_binding();
        }
    }

    /// True once any slot has left the direct family
    pub fn is_bridged(&self) -> bool {
        self.bindings.iter().any(|b| *b != Binding::Direct)
    }

    /// Snapshot of every binding, in declaration order
    pub fn snapshot(&self) -> Vec<(Operation, Binding)> {
        Operation::ALL
            .iter()
            .map(|op| (*op, self.binding(*op)))
            .collect()
    }
}

impl Default for DispatchVector {
    fn default() -> Self {
        Self::new()
    }
}
