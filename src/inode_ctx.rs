//! Per-inode context: cached subvolume, MDS, lock subvolume, migration info, and the
//! concurrent side-table that holds one of these per inode (§3 "Inode Context").
//!
//! The source translator stores this cast into a `uint64_t` slot owned by the inode.
//! Here it is a typed side-table keyed by inode id, matching the "avoid casting and
//! lifetime ambiguity" guidance for this kind of context (§9).

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::layout::Layout;
use crate::subvolume::SubvolId;

/// Opaque, stable identifier for an inode, as handed down by the upper translator.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Debug)]
#[cfg_attr(feature = "serializable", derive(serde::Serialize, serde::Deserialize))]
pub struct InodeId(pub u64);

/// A file mid-migration between two subvolumes.
///
/// Separately ref-counted from the rest of [`InodeCtx`] because a reader may bump this
/// and drop the inode lock before acting on it (§3, §5).
#[derive(Clone, Debug)]
pub struct MigrationInfo {
    pub src: SubvolId,
    pub dst: SubvolId,
}

#[derive(Debug, Default)]
struct InodeCtxInner {
    layout: Option<Arc<Layout>>,
    cached_subvol: Option<SubvolId>,
    mds: Option<SubvolId>,
    lock_subvol: Option<SubvolId>,
    times: Option<(i64, i64, i64)>,
    migration: Option<Arc<MigrationInfo>>,
}

/// Per-inode state, private to this translator. Protected by a spinlock that is held
/// only for pointer swaps and list traversal, never across I/O (§5).
#[derive(Debug, Default)]
pub struct InodeCtx {
    inner: Mutex<InodeCtxInner>,
}

impl InodeCtx {
    pub fn new() -> Self {
        InodeCtx::default()
    }

    pub fn cached_subvol(&self) -> Option<SubvolId> {
        self.inner.lock().cached_subvol
    }

    pub fn layout(&self) -> Option<Arc<Layout>> {
        self.inner.lock().layout.clone()
    }

    /// Publishes a freshly healed layout and denormalizes `list[0].xlator` into the
    /// cached-subvolume hot-path field (§3).
    pub fn set_layout(&self, layout: Arc<Layout>) {
        let mut inner = self.inner.lock();
        inner.cached_subvol = layout.segments.first().map(|s| s.subvol);
        inner.layout = Some(layout);
    }

    pub fn mds(&self) -> Option<SubvolId> {
        self.inner.lock().mds
    }

    pub fn set_mds(&self, mds: SubvolId) {
        self.inner.lock().mds = Some(mds);
    }

    /// Records the subvolume a lock was first acquired on; unlock must always target
    /// this recorded value, never the (possibly since-updated) cached subvolume, to
    /// cope with NFS-style inode purging (§9 open question).
    pub fn record_lock_subvol_if_unset(&self, subvol: SubvolId) {
        let mut inner = self.inner.lock();
        if inner.lock_subvol.is_none() {
            inner.lock_subvol = Some(subvol);
        }
    }

    pub fn lock_subvol(&self) -> Option<SubvolId> {
        self.inner.lock().lock_subvol
    }

    pub fn times(&self) -> Option<(i64, i64, i64)> {
        self.inner.lock().times
    }

    /// Merges in an observed `(atime, mtime, ctime)` triple, keeping the latest of each
    /// independently (mirrors the stat-merge latest-wins rule, §4.2).
    pub fn update_times(&self, atime: i64, mtime: i64, ctime: i64) {
        let mut inner = self.inner.lock();
        inner.times = Some(match inner.times {
            None => (atime, mtime, ctime),
            Some((a, m, c)) => (a.max(atime), m.max(mtime), c.max(ctime)),
        });
    }

    pub fn migration_info(&self) -> Option<Arc<MigrationInfo>> {
        self.inner.lock().migration.clone()
    }

    /// Atomically swaps in a new migration info and, if it names a destination, updates
    /// the cached subvolume to match (§4.1 step 4).
    pub fn set_migration_info(&self, info: Option<MigrationInfo>) {
        let mut inner = self.inner.lock();
        match &info {
            Some(m) => inner.cached_subvol = Some(m.dst),
            None => {}
        }
        inner.migration = info.map(Arc::new);
    }

    /// Resets migration info — observed when the linkto xattr has vanished, meaning some
    /// other actor already completed this migration (§4.1 step 2).
    pub fn clear_migration_info(&self) {
        self.inner.lock().migration = None;
    }
}

/// Concurrent map from inode id to its context, replacing the source's cast-to-`u64`
/// opaque slot (§9 "Context stored as integers in opaque slots").
#[derive(Debug, Default)]
pub struct InodeCtxTable {
    table: DashMap<InodeId, Arc<InodeCtx>>,
}

impl InodeCtxTable {
    pub fn new() -> Self {
        InodeCtxTable::default()
    }

    /// Returns the existing context for `inode`, creating one on first access.
    pub fn get_or_create(&self, inode: InodeId) -> Arc<InodeCtx> {
        self.table
            .entry(inode)
            .or_insert_with(|| Arc::new(InodeCtx::new()))
            .clone()
    }

    pub fn get(&self, inode: InodeId) -> Option<Arc<InodeCtx>> {
        self.table.get(&inode).map(|r| r.clone())
    }

    /// Drops the context when the upper layer forgets the inode.
    pub fn forget(&self, inode: InodeId) {
        self.table.remove(&inode);
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
