/*!
 * Multiplexing Remapper
 * select/poll over bridged sockets, translated between virtual and backend numbering
 */

use log::{trace, warn};

use super::bridged::BridgedSockets;
use super::fdset::FdSet;
use super::table::FdTable;
use crate::bridge::Timeval;
use crate::core::errors::{bridge_result, SockError, SockResult};
use crate::core::limits::FD_SETSIZE;
use crate::core::types::{BackendId, VirtualFd};

/// True iff every member of `set` below `nfds` is a live socket entry
///
/// An absent or empty set qualifies.
pub fn only_sockets(table: &FdTable, nfds: i32, set: Option<&FdSet>) -> bool {
    let Some(set) = set else {
        return true;
    };
    let limit = nfds.clamp(0, FD_SETSIZE as i32) as usize;
    set.iter_below(limit)
        .all(|fd| table.is_socket(VirtualFd(fd as u32)))
}

/// True iff every `pollfd` names a live socket entry
pub fn only_socket_pollfds(table: &FdTable, fds: &[libc::pollfd]) -> bool {
    fds.iter().all(|p| {
        VirtualFd::try_from(p.fd)
            .map(|fd| table.is_socket(fd))
            .unwrap_or(false)
    })
}

/// Reverse lookup from backend id to the virtual descriptor it came from
struct ReverseMap {
    slots: Vec<Option<VirtualFd>>,
    max_backend: usize,
}

impl ReverseMap {
    fn new() -> Self {
        Self {
            slots: vec![None; FD_SETSIZE],
            max_backend: 0,
        }
    }

    /// Build the backend-numbered counterpart of one virtual set
    fn remap(&mut self, table: &FdTable, nfds: i32, set: Option<&FdSet>) -> SockResult<Option<FdSet>> {
        let Some(set) = set else {
            return Ok(None);
        };
        let limit = nfds.clamp(0, FD_SETSIZE as i32) as usize;
        let mut mapped = FdSet::new();

        for member in set.iter_below(limit) {
            let fd = VirtualFd(member as u32);
            let backend = table
                .backend_id(fd)
                .and_then(BackendId::index)
                .filter(|id| *id < FD_SETSIZE)
                .ok_or_else(|| SockError::bad_descriptor(fd))?;

            self.max_backend = self.max_backend.max(backend);
            self.slots[backend] = Some(fd);
            mapped.insert(backend);
        }
        Ok(Some(mapped))
    }

    /// Rewrite `out` from the backend-numbered `ready` set
    ///
    /// Placement stops once `remaining` reaches zero; the counter is shared
    /// across the read, write and except sets.
    fn place(&self, remaining: &mut usize, out: Option<&mut FdSet>, ready: Option<&FdSet>) {
        let (Some(out), Some(ready)) = (out, ready) else {
            return;
        };
        out.clear();
        for backend in ready.iter() {
            if *remaining == 0 {
                break;
            }
            match self.slots[backend] {
                Some(fd) => {
                    out.insert(fd.index());
                }
                None => warn!("Bridge reported unrequested backend {} ready", backend),
            }
            *remaining -= 1;
        }
    }
}

impl BridgedSockets {
    /// Bridged `select`: remap, call the provider, remap the ready sets back
    ///
    /// Every member must resolve to a backend id in `[0, FD_SETSIZE)`, or the
    /// whole call fails with `EBADF` and the sets are left untouched.
    pub fn select(
        &self,
        nfds: i32,
        mut read: Option<&mut FdSet>,
        mut write: Option<&mut FdSet>,
        mut except: Option<&mut FdSet>,
        timeout: Option<&mut libc::timeval>,
    ) -> SockResult<usize> {
        let span = self.span("select", nfds);
        let _guard = span.enter();

        let result = (|| {
            let mut reverse = ReverseMap::new();
            let mut mapped_read = reverse.remap(&self.table, nfds, read.as_deref())?;
            let mut mapped_write = reverse.remap(&self.table, nfds, write.as_deref())?;
            let mut mapped_except = reverse.remap(&self.table, nfds, except.as_deref())?;

            let timeout = timeout.map(|tv| Timeval::from_raw(tv));
            let backend_nfds = reverse.max_backend as i32 + 1;
            trace!("select: {} virtual -> {} backend", nfds, backend_nfds);

            let ready = bridge_result(
                "select",
                self.bridge.select(
                    backend_nfds,
                    mapped_read.as_mut(),
                    mapped_write.as_mut(),
                    mapped_except.as_mut(),
                    timeout.as_ref(),
                ),
            )? as usize;

            let mut remaining = ready;
            reverse.place(&mut remaining, read.as_deref_mut(), mapped_read.as_ref());
            reverse.place(&mut remaining, write.as_deref_mut(), mapped_write.as_ref());
            reverse.place(&mut remaining, except.as_deref_mut(), mapped_except.as_ref());
            Ok(ready)
        })();
        span.record_outcome(&result);
        result
    }

    /// Bridged `poll`: rewrite descriptors to backend ids for the call
    ///
    /// Unresolvable entries are passed as `-1`. The caller's descriptor values
    /// are restored before returning, on success and failure alike.
    pub fn poll(&self, fds: &mut [libc::pollfd], timeout_ms: i32) -> SockResult<usize> {
        let span = self.span("poll", fds.len() as i32);
        let _guard = span.enter();

        let saved: Vec<i32> = fds.iter().map(|p| p.fd).collect();
        for entry in fds.iter_mut() {
            entry.fd = VirtualFd::try_from(entry.fd)
                .ok()
                .and_then(|fd| self.table.backend_id(fd))
                .map_or(-1, BackendId::as_raw);
        }

        let raw = self.bridge.poll(fds, timeout_ms);

        for (entry, fd) in fds.iter_mut().zip(saved) {
            entry.fd = fd;
        }

        let result = bridge_result("poll", raw).map(|n| n as usize);
        span.record_outcome(&result);
        result
    }
}
