//! Per-open-handle context: which subvolume a descriptor was opened on (§3 "File
//! Descriptor Context").

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::fop::Gfid;
use crate::open_flags::OpenFlags;
use crate::subvolume::SubvolId;

/// Opaque, stable identifier for an open file descriptor, as handed down by the upper
/// translator.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Debug)]
#[cfg_attr(feature = "serializable", derive(serde::Serialize, serde::Deserialize))]
pub struct FdId(pub u64);

/// The mutable half of [`FdCtx`]: which subvolume the descriptor is currently open on,
/// and the raw backend descriptor returned by that subvolume's `open`.
#[derive(Copy, Clone, Debug)]
struct FdLocation {
    subvol: SubvolId,
    backend_fd: u64,
}

/// Per-fd state. The gfid and original open flags are immutable for the fd's lifetime
/// and are kept so a migration-triggered reopen can be replayed without the caller
/// having to resupply them (§4.1 step 5 "fd-reopen walk"). The location is protected by
/// a per-fd spinlock, held only for the pointer swap, never across I/O (§5).
#[derive(Debug)]
pub struct FdCtx {
    gfid: Gfid,
    flags: OpenFlags,
    location: Mutex<FdLocation>,
}

impl FdCtx {
    pub fn new(gfid: Gfid, flags: OpenFlags, opened_on: SubvolId, backend_fd: u64) -> Self {
        FdCtx { gfid, flags, location: Mutex::new(FdLocation { subvol: opened_on, backend_fd }) }
    }

    pub fn gfid(&self) -> Gfid {
        self.gfid
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub fn subvol(&self) -> SubvolId {
        self.location.lock().subvol
    }

    pub fn backend_fd(&self) -> u64 {
        self.location.lock().backend_fd
    }

    /// Updates the descriptor's subvolume and backend fd after a successful reopen on
    /// the migration destination. Returns `false` if the descriptor is already on
    /// `new_subvol`, so the caller can skip issuing a redundant reopen (§8
    /// "idempotence").
    pub fn set_subvol(&self, new_subvol: SubvolId, new_backend_fd: u64) -> bool {
        let mut location = self.location.lock();
        if location.subvol == new_subvol {
            false
        } else {
            *location = FdLocation { subvol: new_subvol, backend_fd: new_backend_fd };
            true
        }
    }
}

/// Concurrent map from fd id to its context.
#[derive(Debug, Default)]
pub struct FdCtxTable {
    table: DashMap<FdId, Arc<FdCtx>>,
}

impl FdCtxTable {
    pub fn new() -> Self {
        FdCtxTable::default()
    }

    pub fn insert(
        &self,
        fd: FdId,
        gfid: Gfid,
        flags: OpenFlags,
        opened_on: SubvolId,
        backend_fd: u64,
    ) -> Arc<FdCtx> {
        let ctx = Arc::new(FdCtx::new(gfid, flags, opened_on, backend_fd));
        self.table.insert(fd, ctx.clone());
        ctx
    }

    pub fn get(&self, fd: FdId) -> Option<Arc<FdCtx>> {
        self.table.get(&fd).map(|r| r.clone())
    }

    /// All fds currently open on `inode`'s ctx table slice, for the migration-reopen
    /// walk (§4.1 step 5). Callers pass in the set of fd ids belonging to the inode,
    /// since this table is keyed by fd, not by inode.
    pub fn resolve_many(&self, fds: &[FdId]) -> Vec<(FdId, Arc<FdCtx>)> {
        fds.iter()
            .filter_map(|&fd| self.get(fd).map(|ctx| (fd, ctx)))
            .collect()
    }

    pub fn remove(&self, fd: FdId) {
        self.table.remove(&fd);
    }
}
