//! Rebalance coherency: the two checks a FOP runs against an inode that the rebalancer
//! is touching, so in-flight filesystem traffic stays consistent with an ongoing
//! migration instead of racing it (§4.6).

use std::collections::HashMap;
use std::sync::Arc;

use log::{info, warn};

use crate::config::Config;
use crate::errno::Errno;
use crate::fd_ctx::FdId;
use crate::fop::{Gfid, SubvolumeOps};
use crate::inode_ctx::{InodeId, MigrationInfo};
use crate::subvolume::SubvolId;
use crate::syncop::elevate_to_root;
use crate::xattr;

/// Shared machinery for the rebalance-coherency checks. Holds its own clone of the
/// backend map rather than borrowing [`crate::dispatcher::Dispatcher`]: a standalone
/// rebalance process walks inodes the dispatcher has no open call for, and
/// `Dispatcher` itself keeps one of these to run `migration_complete_check_by_gfid`
/// when a data FOP on an already-open fd hits a migration sentinel (§4.1, §4.6).
pub struct RebalanceTasks {
    config: Arc<Config>,
    backends: HashMap<SubvolId, Arc<dyn SubvolumeOps>>,
}

impl RebalanceTasks {
    pub fn new(config: Arc<Config>, backends: HashMap<SubvolId, Arc<dyn SubvolumeOps>>) -> Self {
        RebalanceTasks { config, backends }
    }

    fn backend(&self, subvol: SubvolId) -> Result<&Arc<dyn SubvolumeOps>, Errno> {
        self.backends.get(&subvol).ok_or(Errno(libc::ENODEV))
    }

    /// Installs fresh migration info on an inode just selected as a rebalance target,
    /// and eagerly reopens every fd the caller says is currently open on it, so the
    /// rebalancer doesn't have to wait for the next FOP to trigger a lazy reopen (§4.1
    /// step 4, §4.6).
    pub async fn migration_in_progress_check(
        &self,
        inode: InodeId,
        src: SubvolId,
        dst: SubvolId,
        open_fds: &[FdId],
    ) -> Result<(), Errno> {
        let ctx = self.config.inode_ctx.get_or_create(inode);
        ctx.set_migration_info(Some(MigrationInfo { src, dst }));

        // These reopens run on behalf of the rebalancer, not the fd's original opener,
        // so they must bypass that caller's access checks (§4.5 "Identity switching").
        let _root = elevate_to_root();
        for (_, fctx) in self.config.fd_ctx.resolve_many(open_fds) {
            if fctx.subvol() == src {
                let backend = self.backend(dst)?;
                match backend.open(fctx.gfid(), fctx.flags().for_migration_reopen()).await {
                    Ok(new_fd) => {
                        fctx.set_subvol(dst, new_fd);
                    }
                    Err(e) if e.is_benign_race() => {
                        warn!("fd reopen for inode {} raced a concurrent close: {e}", inode.0);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(())
    }

    /// Runs once the rebalancer believes a file's migration has finished: confirms the
    /// linkto stub is gone or points at `dst`, cross-checks the gfid so a divergent
    /// replacement file is never silently adopted, switches the inode's cached
    /// subvolume, and reopens any fd still pinned to `src` (§4.1 step 2, §8 scenario 3,
    /// §9 "ENOENT/ESTALE during migration-complete").
    pub async fn migration_complete_check(
        &self,
        inode: InodeId,
        parent: Gfid,
        name: &str,
        gfid: Gfid,
        src: SubvolId,
        dst: SubvolId,
        open_fds: &[FdId],
    ) -> Result<(), Errno> {
        if !self.linkto_still_points_here(src, gfid, dst).await? {
            return Ok(());
        }

        let dst_backend = self.backend(dst)?;
        let dst_reply = match dst_backend.lookup(parent, name).await {
            Ok(reply) => reply,
            Err(e) if e.is_benign_race() => {
                self.config.inode_ctx.get_or_create(inode).clear_migration_info();
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if dst_reply.attr.gfid != gfid {
            warn!("migration-complete gfid mismatch for {name}: expected a different file on destination");
            return Err(Errno(libc::EIO));
        }

        self.finish_migration(inode, src, dst, open_fds).await?;
        info!("migration complete for {name}, now served from {}", self.subvol_name(dst));
        Ok(())
    }

    /// Variant of [`Self::migration_complete_check`] for data-path FOPs on an already
    /// open fd, which carries a gfid but no parent/name (§3 "File Descriptor Context"
    /// keeps no path). Confirms the destination via `lookup_inode` instead of a
    /// path-based lookup; everything else matches §4.1 step 2-5.
    pub async fn migration_complete_check_by_gfid(
        &self,
        inode: InodeId,
        gfid: Gfid,
        src: SubvolId,
        dst: SubvolId,
        open_fds: &[FdId],
    ) -> Result<(), Errno> {
        if !self.linkto_still_points_here(src, gfid, dst).await? {
            return Ok(());
        }

        let dst_backend = self.backend(dst)?;
        match dst_backend.lookup_inode(gfid).await {
            Ok(_) => {}
            Err(e) if e.is_benign_race() => {
                self.config.inode_ctx.get_or_create(inode).clear_migration_info();
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        self.finish_migration(inode, src, dst, open_fds).await?;
        info!("migration complete for gfid {gfid:?}, now served from {}", self.subvol_name(dst));
        Ok(())
    }

    /// Reads the linkto xattr off `src` and reports whether it still names `dst` as the
    /// destination (§4.1 step 1). `Ok(false)` means the caller should treat the
    /// migration as already resolved by someone else and stop.
    async fn linkto_still_points_here(&self, src: SubvolId, gfid: Gfid, dst: SubvolId) -> Result<bool, Errno> {
        let src_backend = self.backend(src)?;
        let linkto_key = self.config.linkto_xattr_key();

        match src_backend.getxattr(gfid, &linkto_key).await {
            Ok(raw) => {
                let target = xattr::parse_linkto_value(&raw);
                if target.is_some_and(|t| t != self.subvol_name(dst)) {
                    // Points somewhere other than our expected destination: another
                    // rebalance pass already redirected it elsewhere. Leave our state
                    // alone; the next check will observe the new reality.
                    return Ok(false);
                }
                Ok(true)
            }
            Err(e) if e.get() == libc::ENODATA => {
                // Stub is gone: migration is done, possibly completed by another actor.
                Ok(true)
            }
            Err(e) if e.is_benign_race() => {
                // §9: the file vanished mid-check. Treat as a benign race, not a fatal
                // error — the subsequent lookup on dst will fail the same way if the
                // file is truly gone, and callers already tolerate that.
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Shared tail of both migration-complete variants: flips the inode's cached
    /// subvolume and MDS over to `dst`, clears its migration info, and walks every fd
    /// still pinned to `src`, reopening each on `dst` (§4.1 steps 4-5).
    async fn finish_migration(
        &self,
        inode: InodeId,
        src: SubvolId,
        dst: SubvolId,
        open_fds: &[FdId],
    ) -> Result<(), Errno> {
        let dst_backend = self.backend(dst)?;
        let ctx = self.config.inode_ctx.get_or_create(inode);
        ctx.clear_migration_info();
        ctx.set_mds(dst);

        let _root = elevate_to_root();
        for (_, fctx) in self.config.fd_ctx.resolve_many(open_fds) {
            if fctx.subvol() == src {
                match dst_backend.open(fctx.gfid(), fctx.flags().for_migration_reopen()).await {
                    Ok(new_fd) => {
                        fctx.set_subvol(dst, new_fd);
                    }
                    Err(e) if e.is_benign_race() => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    fn subvol_name(&self, subvol: SubvolId) -> &str {
        self.config.subvolumes.by_id(subvol).map(|s| s.name()).unwrap_or("")
    }
}
