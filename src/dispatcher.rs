//! The FOP dispatcher: subvolume selection, migration-transparent redirection, and
//! fan-out/reply aggregation for directory-wide operations (§4.1).
//!
//! This is the translator's main entry point — every filesystem operation an upper
//! layer issues against a DHT-managed path comes through a [`Dispatcher`] method, which
//! picks (or re-resolves) the right backend subvolume and drives the call to completion.

use std::collections::HashMap;
use std::sync::Arc;

use log::{trace, warn};

use crate::config::Config;
use crate::errno::Errno;
use crate::fd_ctx::FdId;
use crate::fop::{Attr, Gfid, LookupReply, SetAttrFlags, SubvolumeOps, Xattrs};
use crate::inode_ctx::InodeId;
use crate::layout::{merge_dir_stats, DirStat};
use crate::local::Local;
use crate::lock::{FailurePolicy, InodeLockRequest, LockManager, LockOwner, LockType, DOMAIN_ENTRY_SYNC};
use crate::open_flags::OpenFlags;
use crate::rebalance::RebalanceTasks;
use crate::subvolume::SubvolId;
use crate::xattr::{self, parse_linkto_value};

/// Drives FOPs against the configured subvolume set, resolving which backend a given
/// inode or directory entry actually lives on and transparently redirecting calls that
/// land on a migration-in-progress file (§4.1).
pub struct Dispatcher {
    config: Arc<Config>,
    backends: HashMap<SubvolId, Arc<dyn SubvolumeOps>>,
    locks: Arc<LockManager>,
    rebalance: Arc<RebalanceTasks>,
}

impl Dispatcher {
    pub fn new(
        config: Arc<Config>,
        backends: HashMap<SubvolId, Arc<dyn SubvolumeOps>>,
        locks: Arc<LockManager>,
    ) -> Self {
        let rebalance = Arc::new(RebalanceTasks::new(config.clone(), backends.clone()));
        Dispatcher { config, backends, locks, rebalance }
    }

    fn backend(&self, subvol: SubvolId) -> Result<&Arc<dyn SubvolumeOps>, Errno> {
        self.backends.get(&subvol).ok_or(Errno(libc::ENODEV))
    }

    /// Resolves which subvolume a name should be looked up on: the inode's cached
    /// subvolume if already known, otherwise a hash over the parent's layout, otherwise
    /// the first up subvolume as a last resort (§4.1 "Subvolume selection").
    fn resolve_subvol(&self, inode: Option<InodeId>, name: &str) -> Result<SubvolId, Errno> {
        if let Some(id) = inode {
            if let Some(ctx) = self.config.inode_ctx.get(id) {
                if let Some(cached) = ctx.cached_subvol() {
                    return Ok(cached);
                }
                if let Some(layout) = ctx.layout() {
                    if let Some(subvol) = layout.search(name) {
                        return Ok(subvol);
                    }
                }
            }
        }
        self.config
            .subvolumes
            .first_up()
            .map(|s| s.id())
            .ok_or(Errno(libc::ENOTCONN))
    }

    /// lookup: resolves the target subvolume, issues the child lookup, and if the reply
    /// carries a linkto stub, transparently redirects to the destination and returns
    /// *that* subvolume's attributes instead (§4.1 step 1, §3, §6).
    pub async fn lookup(
        &self,
        parent_inode: InodeId,
        parent_gfid: Gfid,
        name: &str,
    ) -> Result<(LookupReply, SubvolId), Errno> {
        let subvol = self.resolve_subvol(Some(parent_inode), name)?;
        let backend = self.backend(subvol)?;
        let reply = backend.lookup(parent_gfid, name).await?;

        if reply.attr.is_linkto() {
            let dest_name = reply
                .linkto
                .as_deref()
                .ok_or(Errno(libc::EIO))?;
            let dest = self
                .config
                .subvolumes
                .by_name(dest_name)
                .ok_or(Errno(libc::EIO))?
                .id();
            trace!("lookup redirected through linkto stub to {dest_name}");
            let dest_backend = self.backend(dest)?;
            let dest_reply = dest_backend.lookup_inode(reply.attr.gfid).await?;
            return Ok((dest_reply, dest));
        }

        Ok((reply, subvol))
    }

    /// open: resolves the subvolume, opens there, and records the fd's owning subvolume
    /// for future redirection-aware reads/writes (§4.1).
    pub async fn open(
        &self,
        inode: InodeId,
        gfid: Gfid,
        fd: FdId,
        flags: OpenFlags,
    ) -> Result<u64, Errno> {
        let subvol = self.resolve_subvol(Some(inode), "")?;
        let backend = self.backend(subvol)?;
        let backend_fd = backend.open(gfid, flags).await?;
        self.config.fd_ctx.insert(fd, gfid, flags, subvol, backend_fd);
        Ok(backend_fd)
    }

    /// Resolves the live (subvolume, backend fd) pair for an already-open fd, checking
    /// in-flight migration state first: if the inode is mid-migration and the fd is
    /// still pinned to the source, reopen it on the destination before continuing, so a
    /// read/write started mid-migration follows the file to its new home instead of
    /// failing (§4.1 "Migration-transparent dispatch", §8 scenario 3).
    async fn resolve_fd(&self, inode: InodeId, fd: FdId) -> Result<(SubvolId, u64), Errno> {
        let fctx = self.config.fd_ctx.get(fd).ok_or(Errno(libc::EBADF))?;

        if let Some(ictx) = self.config.inode_ctx.get(inode) {
            if let Some(migration) = ictx.migration_info() {
                if fctx.subvol() != migration.dst {
                    self.reopen_fd_on(&fctx, migration.dst).await?;
                }
            }
        }

        Ok((fctx.subvol(), fctx.backend_fd()))
    }

    /// Reopens one fd on `dst`, replaying its original gfid and flags (with the
    /// create/exclusive/truncate bits stripped, since the destination already holds the
    /// file) and swapping the fd context over (§4.1 step 5, §8 "idempotence").
    async fn reopen_fd_on(&self, fctx: &crate::fd_ctx::FdCtx, dst: SubvolId) -> Result<(), Errno> {
        let backend = self.backend(dst)?;
        let new_fd = backend.open(fctx.gfid(), fctx.flags().for_migration_reopen()).await?;
        fctx.set_subvol(dst, new_fd);
        Ok(())
    }

    pub async fn read(
        &self,
        inode: InodeId,
        fd: FdId,
        offset: u64,
        size: u32,
    ) -> Result<Vec<u8>, Errno> {
        let (subvol, backend_fd) = self.resolve_fd(inode, fd).await?;
        match self.backend(subvol)?.read(backend_fd, offset, size).await {
            Err(e) if e.is_migration_sentinel() => {
                let (subvol, backend_fd) = self.recover_from_migration(inode, fd, subvol, e).await?;
                self.backend(subvol)?.read(backend_fd, offset, size).await
            }
            other => other,
        }
    }

    pub async fn write(
        &self,
        inode: InodeId,
        fd: FdId,
        offset: u64,
        data: &[u8],
    ) -> Result<u32, Errno> {
        let (subvol, backend_fd) = self.resolve_fd(inode, fd).await?;
        match self.backend(subvol)?.write(backend_fd, offset, data).await {
            Err(e) if e.is_migration_sentinel() => {
                let (subvol, backend_fd) = self.recover_from_migration(inode, fd, subvol, e).await?;
                self.backend(subvol)?.write(backend_fd, offset, data).await
            }
            other => other,
        }
    }

    pub async fn flush(&self, inode: InodeId, fd: FdId) -> Result<(), Errno> {
        let (subvol, backend_fd) = self.resolve_fd(inode, fd).await?;
        match self.backend(subvol)?.flush(backend_fd).await {
            Err(e) if e.is_migration_sentinel() => {
                let (subvol, backend_fd) = self.recover_from_migration(inode, fd, subvol, e).await?;
                self.backend(subvol)?.flush(backend_fd).await
            }
            other => other,
        }
    }

    /// Runs when a data-path FOP on an already-open fd fails with a sentinel that could
    /// mean the file finished migrating out from under it (§4.1 "On any data-path FOP
    /// whose reply indicates migration"): looks up the fd's gfid on the subvolume it's
    /// still pinned to and, if the reply carries the linkto mode-bit pattern, runs
    /// `migration_complete_check_by_gfid` to follow the stub, update the inode's cached
    /// subvolume, and reopen every fd still on the source (§4.1 steps 1-5, §8 scenario
    /// 3). Returns the now-current (subvolume, backend fd) pair for the caller to
    /// retry its FOP against, or the FOP's original error if this wasn't migration.
    async fn recover_from_migration(
        &self,
        inode: InodeId,
        fd: FdId,
        stale_subvol: SubvolId,
        original_err: Errno,
    ) -> Result<(SubvolId, u64), Errno> {
        let fctx = self.config.fd_ctx.get(fd).ok_or(Errno(libc::EBADF))?;
        let gfid = fctx.gfid();
        let reply = self.backend(stale_subvol)?.lookup_inode(gfid).await.map_err(|_| original_err)?;

        if !reply.attr.is_linkto() {
            return Err(original_err);
        }

        let dest_name = reply.linkto.as_deref().ok_or(Errno(libc::EIO))?;
        let dest = self.config.subvolumes.by_name(dest_name).ok_or(Errno(libc::EIO))?.id();
        self.rebalance
            .migration_complete_check_by_gfid(inode, gfid, stale_subvol, dest, &[fd])
            .await?;

        Ok((fctx.subvol(), fctx.backend_fd()))
    }

    pub async fn truncate(&self, inode: InodeId, gfid: Gfid, size: u64) -> Result<(), Errno> {
        let subvol = self.resolve_subvol(Some(inode), "")?;
        self.backend(subvol)?.truncate(gfid, size).await
    }

    pub async fn unlink(&self, parent: InodeId, parent_gfid: Gfid, name: &str) -> Result<(), Errno> {
        let subvol = self.resolve_subvol(Some(parent), name)?;
        self.backend(subvol)?.unlink(parent_gfid, name).await
    }

    pub async fn link(
        &self,
        inode: InodeId,
        gfid: Gfid,
        new_parent_gfid: Gfid,
        new_name: &str,
    ) -> Result<(), Errno> {
        let subvol = self.resolve_subvol(Some(inode), new_name)?;
        self.backend(subvol)?.link(gfid, new_parent_gfid, new_name).await
    }

    pub async fn rename(
        &self,
        inode: InodeId,
        old_parent_gfid: Gfid,
        old_name: &str,
        new_parent_gfid: Gfid,
        new_name: &str,
    ) -> Result<(), Errno> {
        let subvol = self.resolve_subvol(Some(inode), old_name)?;
        self.backend(subvol)?
            .rename(old_parent_gfid, old_name, new_parent_gfid, new_name)
            .await
    }

    /// getxattr on the layout key is served from the cached in-memory layout rather than
    /// round-tripping to a backend (§6).
    pub async fn getxattr(&self, inode: InodeId, gfid: Gfid, key: &str) -> Result<Vec<u8>, Errno> {
        if key == xattr::XATTR_LAYOUT {
            if let Some(ctx) = self.config.inode_ctx.get(inode) {
                if let Some(layout) = ctx.layout() {
                    let mut out = Vec::with_capacity(layout.segments.len() * 16);
                    for seg in &layout.segments {
                        out.extend_from_slice(&xattr::LayoutRecord::from_segment(seg).to_bytes());
                    }
                    return Ok(out);
                }
            }
            return Err(Errno(libc::ENODATA));
        }
        let subvol = self.resolve_subvol(Some(inode), "")?;
        self.backend(subvol)?.getxattr(gfid, key).await
    }

    pub async fn setxattr(
        &self,
        inode: InodeId,
        gfid: Gfid,
        key: &str,
        value: &[u8],
    ) -> Result<(), Errno> {
        let subvol = self.resolve_subvol(Some(inode), "")?;
        self.backend(subvol)?.setxattr(gfid, key, value, false).await
    }

    pub async fn list_user_xattrs(&self, inode: InodeId, gfid: Gfid) -> Result<Xattrs, Errno> {
        let subvol = self.resolve_subvol(Some(inode), "")?;
        self.backend(subvol)?.list_user_xattrs(gfid).await
    }

    /// mkdir: fans `mkdir` out to every eligible subvolume in parallel (the directory
    /// must exist everywhere, even though only some subvolumes carry placement share),
    /// aggregating the first hard error while tolerating benign races (§4.1 "Fan-out and
    /// reply aggregation", §8).
    pub async fn mkdir(
        &self,
        parent_gfid: Gfid,
        name: &str,
        gfid_req: Option<Gfid>,
        mode: u32,
    ) -> Result<Gfid, Errno> {
        let subvols = self.config.subvolumes.eligible_for_placement();
        if subvols.is_empty() {
            return Err(Errno(libc::EINVAL));
        }

        let owner = LockOwner(rand_owner());
        let lock_reqs: Vec<InodeLockRequest> = subvols
            .iter()
            .map(|s| InodeLockRequest {
                subvol_name: s.name().to_string(),
                subvol: s.id(),
                gfid: parent_gfid,
                lock_type: LockType::Write,
                domain: DOMAIN_ENTRY_SYNC,
                owner,
                policy: FailurePolicy::IgnoreEnoentEstale,
            })
            .collect();
        let mut sorted = lock_reqs;
        crate::lock::sort_inode_locks(&mut sorted);
        let txn = self.locks.acquire_inodelk_blocking(sorted).await?;

        let results = futures::future::join_all(subvols.iter().map(|s| {
            let backend = self.backends.get(&s.id());
            async move {
                match backend {
                    Some(b) => b.mkdir(parent_gfid, name, gfid_req, mode, false).await,
                    None => Err(Errno(libc::ENODEV)),
                }
            }
        }))
        .await;

        self.locks.release_inodelk(txn).await;

        let local = Local::new();
        local.arm_fan_out(results.len() as u32);
        let mut first_gfid: Option<Gfid> = None;
        for r in results {
            local.child_returned();
            match r {
                Ok(g) => {
                    first_gfid.get_or_insert(g);
                }
                Err(e) if e.get() == libc::ESTALE => {}
                Err(e) => local.note_child_error(e, true),
            }
        }

        if let Some(e) = local.first_error() {
            warn!("mkdir fan-out for {name} failed with {e}");
            return Err(e);
        }
        first_gfid.ok_or(Errno(libc::EIO))
    }

    pub async fn rmdir(&self, parent_gfid: Gfid, name: &str) -> Result<(), Errno> {
        let subvols = self.config.subvolumes.eligible_for_placement();
        let results = futures::future::join_all(subvols.iter().map(|s| {
            let backend = self.backends.get(&s.id());
            async move {
                match backend {
                    Some(b) => b.rmdir(parent_gfid, name).await,
                    None => Err(Errno(libc::ENODEV)),
                }
            }
        }))
        .await;

        let local = Local::new();
        local.arm_fan_out(results.len() as u32);
        for r in results {
            local.child_returned();
            if let Err(e) = r {
                if e.get() != libc::ESTALE {
                    local.note_child_error(e, true);
                }
            }
        }
        match local.first_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// setattr on a directory: fan out to every subvolume, merging the first hard error
    /// (§4.1, §4.2 "Stat merge").
    pub async fn setattr_dir(
        &self,
        gfid: Gfid,
        attr: Attr,
        valid: SetAttrFlags,
    ) -> Result<(), Errno> {
        let subvols = self.config.subvolumes.eligible_for_placement();
        let results = futures::future::join_all(subvols.iter().map(|s| {
            let backend = self.backends.get(&s.id());
            async move {
                match backend {
                    Some(b) => b.setattr(gfid, attr, valid).await,
                    None => Err(Errno(libc::ENODEV)),
                }
            }
        }))
        .await;

        let local = Local::new();
        local.arm_fan_out(results.len() as u32);
        for r in results {
            local.child_returned();
            if let Err(e) = r {
                if !e.is_benign_race() {
                    local.note_child_error(e, false);
                }
            }
        }
        match local.first_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Directory stat: fans lookup out across every subvolume and merges the successful
    /// replies with [`merge_dir_stats`] (§4.2, §8 scenario 6).
    pub async fn dir_stat(&self, gfid: Gfid) -> Result<DirStat, Errno> {
        let subvols = self.config.subvolumes.eligible_for_placement();
        let results = futures::future::join_all(subvols.iter().map(|s| {
            let backend = self.backends.get(&s.id());
            async move {
                match backend {
                    Some(b) => b.lookup_inode(gfid).await,
                    None => Err(Errno(libc::ENODEV)),
                }
            }
        }))
        .await;

        let local = Local::new();
        local.arm_fan_out(results.len() as u32);
        let mut stats = Vec::new();
        for r in results {
            local.child_returned();
            match r {
                Ok(reply) => stats.push(reply.attr.to_dir_stat()),
                Err(e) if e.is_benign_race() => {}
                Err(e) => local.note_child_error(e, false),
            }
        }

        if stats.is_empty() {
            return Err(local.first_error().unwrap_or(Errno(libc::ENOENT)));
        }
        Ok(merge_dir_stats(&stats))
    }

    /// Parses a linkto xattr value, used by both the dispatcher's lookup path and the
    /// rebalance tasks (shared so the two never drift on the nul-stripping rule, §6).
    pub fn parse_linkto(raw: &[u8]) -> Option<&str> {
        parse_linkto_value(raw)
    }
}

/// A lock owner unique enough to avoid collisions within one process lifetime. The
/// source translator derives this from the frame pointer; a counter serves the same
/// purpose without exposing any real address.
fn rand_owner() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    use async_trait::async_trait;
    use dashmap::DashMap;

    use crate::config::DhtOptions;
    use crate::inode_ctx::MigrationInfo;
    use crate::lock::{LockBackend, LockOwner, LockType};
    use crate::subvolume::{Subvolume, SubvolumeSet};

    /// An in-memory backend: directories are flat string-keyed maps of gfid -> Attr,
    /// with an optional linkto target installed per gfid.
    #[derive(Default)]
    struct FakeSubvol {
        entries: DashMap<String, Gfid>,
        attrs: DashMap<Gfid, Attr>,
        linkto: DashMap<Gfid, String>,
        next_fd: AtomicU64,
        /// Backend fds that simulate a stale descriptor: the file has since migrated
        /// away and this subvolume now returns `EBADF` for any data-path call against
        /// them, the way a real backend does once the underlying file is gone.
        stale_fds: DashMap<u64, ()>,
    }

    fn gfid_from_u8(b: u8) -> Gfid {
        [b; 16]
    }

    #[async_trait]
    impl SubvolumeOps for FakeSubvol {
        async fn lookup(&self, _parent: Gfid, name: &str) -> Result<LookupReply, Errno> {
            let gfid = self.entries.get(name).map(|g| *g).ok_or(Errno(libc::ENOENT))?;
            self.lookup_inode(gfid).await
        }

        async fn lookup_inode(&self, gfid: Gfid) -> Result<LookupReply, Errno> {
            let attr = self.attrs.get(&gfid).map(|a| *a).ok_or(Errno(libc::ENOENT))?;
            let linkto = self.linkto.get(&gfid).map(|s| s.clone());
            Ok(LookupReply { attr, linkto })
        }

        async fn open(&self, _gfid: Gfid, _flags: OpenFlags) -> Result<u64, Errno> {
            Ok(self.next_fd.fetch_add(1, Ordering::Relaxed))
        }

        async fn read(&self, backend_fd: u64, _offset: u64, _size: u32) -> Result<Vec<u8>, Errno> {
            if self.stale_fds.contains_key(&backend_fd) {
                return Err(Errno(libc::EBADF));
            }
            Ok(vec![])
        }

        async fn write(&self, backend_fd: u64, _offset: u64, data: &[u8]) -> Result<u32, Errno> {
            if self.stale_fds.contains_key(&backend_fd) {
                return Err(Errno(libc::EBADF));
            }
            Ok(data.len() as u32)
        }

        async fn flush(&self, backend_fd: u64) -> Result<(), Errno> {
            if self.stale_fds.contains_key(&backend_fd) {
                return Err(Errno(libc::EBADF));
            }
            Ok(())
        }

        async fn truncate(&self, _gfid: Gfid, _size: u64) -> Result<(), Errno> {
            Ok(())
        }

        async fn unlink(&self, _parent: Gfid, name: &str) -> Result<(), Errno> {
            self.entries.remove(name);
            Ok(())
        }

        async fn link(&self, gfid: Gfid, _new_parent: Gfid, new_name: &str) -> Result<(), Errno> {
            self.entries.insert(new_name.to_string(), gfid);
            Ok(())
        }

        async fn rename(
            &self,
            _old_parent: Gfid,
            old_name: &str,
            _new_parent: Gfid,
            new_name: &str,
        ) -> Result<(), Errno> {
            if let Some((_, gfid)) = self.entries.remove(old_name) {
                self.entries.insert(new_name.to_string(), gfid);
            }
            Ok(())
        }

        async fn mkdir(
            &self,
            _parent: Gfid,
            name: &str,
            gfid_req: Option<Gfid>,
            mode: u32,
            _heal: bool,
        ) -> Result<Gfid, Errno> {
            let gfid = gfid_req.unwrap_or_else(|| gfid_from_u8(name.len() as u8 + 1));
            self.entries.insert(name.to_string(), gfid);
            self.attrs.insert(
                gfid,
                Attr { gfid, mode, file_type: libc::S_IFDIR as u32, ..Attr::default() },
            );
            Ok(gfid)
        }

        async fn rmdir(&self, _parent: Gfid, name: &str) -> Result<(), Errno> {
            self.entries.remove(name);
            Ok(())
        }

        async fn setattr(&self, gfid: Gfid, attr: Attr, _valid: SetAttrFlags) -> Result<(), Errno> {
            self.attrs.insert(gfid, attr);
            Ok(())
        }

        async fn getxattr(&self, _gfid: Gfid, _key: &str) -> Result<Vec<u8>, Errno> {
            Err(Errno(libc::ENODATA))
        }

        async fn setxattr(
            &self,
            _gfid: Gfid,
            _key: &str,
            _value: &[u8],
            _heal: bool,
        ) -> Result<(), Errno> {
            Ok(())
        }

        async fn list_user_xattrs(&self, _gfid: Gfid) -> Result<Xattrs, Errno> {
            Ok(Xattrs::new())
        }
    }

    #[derive(Default)]
    struct NoopLockBackend;

    #[async_trait]
    impl LockBackend for NoopLockBackend {
        async fn inodelk(
            &self,
            _subvol: SubvolId,
            _gfid: [u8; 16],
            _domain: &str,
            _lock_type: LockType,
            _owner: LockOwner,
            _blocking: bool,
        ) -> Result<(), Errno> {
            Ok(())
        }
        async fn unlock_inodelk(
            &self,
            _subvol: SubvolId,
            _gfid: [u8; 16],
            _domain: &str,
            _owner: LockOwner,
        ) -> Result<(), Errno> {
            Ok(())
        }
        async fn entrylk(
            &self,
            _subvol: SubvolId,
            _parent_gfid: [u8; 16],
            _basename: &str,
            _domain: &str,
            _lock_type: LockType,
            _owner: LockOwner,
            _blocking: bool,
        ) -> Result<(), Errno> {
            Ok(())
        }
        async fn unlock_entrylk(
            &self,
            _subvol: SubvolId,
            _parent_gfid: [u8; 16],
            _basename: &str,
            _domain: &str,
            _owner: LockOwner,
        ) -> Result<(), Errno> {
            Ok(())
        }
    }

    fn make_dispatcher(n: usize) -> (Dispatcher, Vec<Arc<FakeSubvol>>) {
        let mut subvols = Vec::new();
        let mut backends: StdHashMap<SubvolId, Arc<dyn SubvolumeOps>> = StdHashMap::new();
        let mut fakes = Vec::new();
        for i in 0..n {
            let s = Arc::new(Subvolume::new(SubvolId(i as u32), format!("brick-{i}")));
            s.mark_up();
            subvols.push(s);
            let fake = Arc::new(FakeSubvol::default());
            backends.insert(SubvolId(i as u32), fake.clone());
            fakes.push(fake);
        }
        let config = Arc::new(Config::new(SubvolumeSet::new(subvols), DhtOptions::default()));
        let locks = Arc::new(LockManager::new(Arc::new(NoopLockBackend)));
        (Dispatcher::new(config, backends, locks), fakes)
    }

    #[tokio::test]
    async fn lookup_follows_linkto_stub_to_destination() {
        let (dispatcher, fakes) = make_dispatcher(2);
        let parent = gfid_from_u8(0);
        let stub_gfid = gfid_from_u8(9);
        let real_gfid = gfid_from_u8(10);

        fakes[0].entries.insert("afile".to_string(), stub_gfid);
        fakes[0].attrs.insert(
            stub_gfid,
            Attr {
                gfid: stub_gfid,
                mode: libc::S_ISVTX as u32 | libc::S_ISGID as u32,
                ..Attr::default()
            },
        );
        fakes[0].linkto.insert(stub_gfid, "brick-1".to_string());
        fakes[1].attrs.insert(real_gfid, Attr { gfid: real_gfid, mode: 0o644, ..Attr::default() });

        // cached_subvol defaults to None, so resolve_subvol falls back to first_up (brick-0).
        let (reply, subvol) = dispatcher.lookup(InodeId(1), parent, "afile").await.unwrap();
        assert_eq!(subvol, SubvolId(1));
        assert_eq!(reply.attr.gfid, real_gfid);
    }

    #[tokio::test]
    async fn read_after_migration_reopens_on_destination() {
        let (dispatcher, _fakes) = make_dispatcher(2);
        let gfid = gfid_from_u8(5);
        let inode = InodeId(1);
        let fd = FdId(100);

        dispatcher.open(inode, gfid, fd, OpenFlags(libc::O_RDWR)).await.unwrap();
        assert_eq!(dispatcher.config.fd_ctx.get(fd).unwrap().subvol(), SubvolId(0));

        dispatcher
            .config
            .inode_ctx
            .get_or_create(inode)
            .set_migration_info(Some(MigrationInfo { src: SubvolId(0), dst: SubvolId(1) }));

        dispatcher.read(inode, fd, 0, 10).await.unwrap();
        assert_eq!(dispatcher.config.fd_ctx.get(fd).unwrap().subvol(), SubvolId(1));
    }

    /// §4.1: "without [reopen-under-lock], a write-after-migration would land on the
    /// fd's original (now stale) subvolume and fail with EBADF". Unlike
    /// `read_after_migration_reopens_on_destination`, no proactive migration info is
    /// installed on the inode ahead of time — the dispatcher only learns about the
    /// migration reactively, from the backend's `EBADF` on the stale fd, and must still
    /// recover transparently (§8 scenario 3: "no EBADF observed" by the caller).
    #[tokio::test]
    async fn read_recovers_from_reactive_ebadf_without_prior_migration_info() {
        let (dispatcher, fakes) = make_dispatcher(2);
        let gfid = gfid_from_u8(5);
        let inode = InodeId(1);
        let fd = FdId(100);

        let backend_fd = dispatcher.open(inode, gfid, fd, OpenFlags(libc::O_RDWR)).await.unwrap();
        assert_eq!(dispatcher.config.fd_ctx.get(fd).unwrap().subvol(), SubvolId(0));

        // No migration info installed on the inode: the dispatcher has no advance
        // warning. The source subvolume now reports EBADF for this fd, as a real
        // backend would once the file has migrated out from under it, and carries a
        // linkto stub pointing at the destination.
        fakes[0].stale_fds.insert(backend_fd, ());
        fakes[0].attrs.insert(gfid, Attr { gfid, mode: libc::S_ISVTX as u32 | libc::S_ISGID as u32, ..Attr::default() });
        fakes[0].linkto.insert(gfid, "brick-1".to_string());
        fakes[1].attrs.insert(gfid, Attr { gfid, mode: 0o644, ..Attr::default() });

        let data = dispatcher.read(inode, fd, 0, 10).await.unwrap();
        assert_eq!(data, Vec::<u8>::new());
        assert_eq!(dispatcher.config.fd_ctx.get(fd).unwrap().subvol(), SubvolId(1));
    }

    #[tokio::test]
    async fn mkdir_fans_out_and_returns_first_gfid() {
        let (dispatcher, fakes) = make_dispatcher(3);
        let parent = gfid_from_u8(0);
        let gfid = dispatcher.mkdir(parent, "newdir", Some(gfid_from_u8(42)), 0o755).await.unwrap();
        assert_eq!(gfid, gfid_from_u8(42));
        for fake in &fakes {
            assert!(fake.entries.contains_key("newdir"));
        }
    }

    #[tokio::test]
    async fn mkdir_refuses_with_einval_when_no_subvolumes_eligible() {
        let (dispatcher, _fakes) = make_dispatcher(0);
        let err = dispatcher.mkdir(gfid_from_u8(0), "x", None, 0o755).await.unwrap_err();
        assert_eq!(err, Errno(libc::EINVAL));
    }
}
