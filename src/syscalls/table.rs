/*!
 * Descriptor Handle Table
 * Fixed-capacity registry mapping virtual descriptors to backend identities
 */

use log::trace;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::types::{BackendId, FdState, VirtualFd};

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    state: FdState,
    backend: i32,
}

/// Registry of virtual descriptors
///
/// # Design
///
/// - **Single coarse lock**: every operation takes the mutex, does bounded
///   work with no I/O, and releases it before returning
/// - **First-fit allocation**: acquisition scans from index 0, so the lowest
///   free index is always handed out first
/// - **Lenient bounds**: out-of-range indices are no-ops or `None`/`false`;
///   callers turn "no entry" into `EBADF`
///
/// Ownership is not tracked. A caller can release or rebind a descriptor it
/// never acquired; pairing acquisitions with releases is caller discipline.
pub struct FdTable {
    slots: Mutex<Vec<Slot>>,
    capacity: usize,
}

/// Point-in-time table occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStats {
    pub capacity: usize,
    pub sockets: usize,
    pub non_sockets: usize,
    pub free: usize,
}

impl TableStats {
    #[inline]
    pub fn in_use(&self) -> usize {
        self.sockets + self.non_sockets
    }
}

impl FdTable {
    /// Create a table with `capacity` free slots
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(vec![Slot::default(); capacity]),
            capacity,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    fn in_range(&self, fd: VirtualFd) -> bool {
        fd.index() < self.capacity
    }

    /// Claim the lowest free slot; the backend id defaults to the index itself
    pub fn acquire(&self, is_socket: bool) -> Option<VirtualFd> {
        let mut slots = self.slots.lock();
        Self::claim(&mut slots, is_socket, None)
    }

    /// Claim the lowest free slot already bound to `backend`
    ///
    /// Same as [`acquire`](Self::acquire) followed by
    /// [`set_backend_id`](Self::set_backend_id), under one lock hold.
    pub fn acquire_bound(&self, is_socket: bool, backend: BackendId) -> Option<VirtualFd> {
        let mut slots = self.slots.lock();
        Self::claim(&mut slots, is_socket, Some(backend))
    }

    fn claim(slots: &mut [Slot], is_socket: bool, backend: Option<BackendId>) -> Option<VirtualFd> {
        let index = slots.iter().position(|slot| slot.state.is_free())?;
        let slot = &mut slots[index];
        slot.state = if is_socket {
            FdState::Socket
        } else {
            FdState::NonSocket
        };
        slot.backend = backend.map_or(index as i32, BackendId::as_raw);
        trace!("Acquired slot {} ({:?}, backend {})", index, slot.state, slot.backend);
        Some(VirtualFd(index as u32))
    }

    /// Claim the specific slot `fd`, keeping its identity backend id
    ///
    /// Returns false if `fd` is out of range or the slot is already taken.
    pub fn claim_at(&self, fd: VirtualFd, is_socket: bool) -> bool {
        if !self.in_range(fd) {
            return false;
        }
        let mut slots = self.slots.lock();
        let slot = &mut slots[fd.index()];
        if !slot.state.is_free() {
            return false;
        }
        slot.state = if is_socket {
            FdState::Socket
        } else {
            FdState::NonSocket
        };
        slot.backend = fd.index() as i32;
        trace!("Claimed slot {} ({:?})", fd.index(), slot.state);
        true
    }

    /// Return a slot to the free pool (no-op if out of range)
    pub fn release(&self, fd: VirtualFd) {
        if !self.in_range(fd) {
            return;
        }
        self.slots.lock()[fd.index()].state = FdState::Free;
        trace!("Released slot {}", fd.index());
    }

    /// Bind a slot to a backend id (no-op if out of range)
    ///
    /// Free slots are overwritten too; the value is simply ignored until the
    /// slot is acquired again, which resets it.
    pub fn set_backend_id(&self, fd: VirtualFd, id: BackendId) {
        if !self.in_range(fd) {
            return;
        }
        self.slots.lock()[fd.index()].backend = id.as_raw();
    }

    /// True iff the slot is in range and holds a socket
    pub fn is_socket(&self, fd: VirtualFd) -> bool {
        self.state(fd) == Some(FdState::Socket)
    }

    /// Backend id of a live slot
    pub fn backend_id(&self, fd: VirtualFd) -> Option<BackendId> {
        if !self.in_range(fd) {
            return None;
        }
        let slots = self.slots.lock();
        let slot = &slots[fd.index()];
        (!slot.state.is_free()).then_some(BackendId(slot.backend))
    }

    /// State of the slot, `None` if out of range
    pub fn state(&self, fd: VirtualFd) -> Option<FdState> {
        if !self.in_range(fd) {
            return None;
        }
        Some(self.slots.lock()[fd.index()].state)
    }

    /// Number of non-free slots
    pub fn in_use(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|slot| !slot.state.is_free())
            .count()
    }

    pub fn stats(&self) -> TableStats {
        let slots = self.slots.lock();
        let mut stats = TableStats {
            capacity: self.capacity,
            sockets: 0,
            non_sockets: 0,
            free: 0,
        };
        for slot in slots.iter() {
            match slot.state {
                FdState::Free => stats.free += 1,
                FdState::Socket => stats.sockets += 1,
                FdState::NonSocket => stats.non_sockets += 1,
            }
        }
        stats
    }
}

impl std::fmt::Debug for FdTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdTable")
            .field("stats", &self.stats())
            .finish()
    }
}
