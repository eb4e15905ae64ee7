//! Directory self-heal / fix-layout engine (§4.3).
//!
//! Runs the seven-phase protocol against one directory: acquire the namespace lock,
//! refresh the layout by querying every subvolume, create the directory wherever it is
//! missing, heal attributes and non-layout xattrs from the metadata-authoritative
//! subvolume (MDS), write the refreshed layout back everywhere, and release the lock in
//! reverse order. [`SelfHealEngine::fix_layout_only`] runs the layout-only subset (§4.3
//! "A lighter fix-layout-only pass").

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};

use crate::config::Config;
use crate::errno::Errno;
use crate::fop::{Attr, Gfid, SubvolumeOps, ROOT_GFID};
use crate::inode_ctx::InodeId;
use crate::layout::{assign_layout, fix_layout, rotation_start, Anomalies, Layout, Segment, Weight};
use crate::lock::{LockManager, LockOwner};
use crate::subvolume::SubvolId;
use crate::xattr::{self, LayoutRecord};

/// One subvolume's view of a directory, gathered during phase 2.
struct DirReplica {
    subvol: SubvolId,
    lookup_err: Errno,
    attr: Option<Attr>,
    layout_record: Option<LayoutRecord>,
    /// Decoded `trusted.glusterfs.dht.mds` value, if this replica carries one (§4.3
    /// step 4, §6).
    mds_xattr: Option<SubvolId>,
}

/// Drives the self-heal and fix-layout protocols for directories (§4.3).
pub struct SelfHealEngine {
    config: Arc<Config>,
    backends: HashMap<SubvolId, Arc<dyn SubvolumeOps>>,
    locks: Arc<LockManager>,
}

impl SelfHealEngine {
    pub fn new(
        config: Arc<Config>,
        backends: HashMap<SubvolId, Arc<dyn SubvolumeOps>>,
        locks: Arc<LockManager>,
    ) -> Self {
        SelfHealEngine { config, backends, locks }
    }

    fn backend(&self, subvol: SubvolId) -> Result<&Arc<dyn SubvolumeOps>, Errno> {
        self.backends.get(&subvol).ok_or(Errno(libc::ENODEV))
    }

    /// Phase 2: looks the directory up on every eligible subvolume and reads back its
    /// locally-stored layout record, producing one [`DirReplica`] per subvolume.
    async fn gather(&self, parent: Gfid, name: &str, dir_gfid: Gfid) -> Vec<DirReplica> {
        let subvols = self.config.subvolumes.eligible_for_placement();
        let mut out = Vec::with_capacity(subvols.len());
        for s in &subvols {
            let Ok(backend) = self.backend(s.id()) else { continue };
            let (lookup_err, attr) = match backend.lookup(parent, name).await {
                Ok(reply) => (Errno::SUCCESS, Some(reply.attr)),
                Err(e) => (e, None),
            };
            let layout_record = match backend.getxattr(dir_gfid, xattr::XATTR_LAYOUT).await {
                Ok(raw) => LayoutRecord::from_bytes(&raw),
                Err(_) => None,
            };
            let mds_xattr = match backend.getxattr(dir_gfid, xattr::XATTR_MDS).await {
                Ok(raw) => xattr::mds_from_bytes(&raw),
                Err(_) => None,
            };
            out.push(DirReplica { subvol: s.id(), lookup_err, attr, layout_record, mds_xattr });
        }
        out
    }

    /// Builds the current on-disk [`Layout`] (possibly anomalous) from gathered replicas,
    /// so [`crate::layout::Layout::anomalies`] can be run against it (§4.2, §4.3 phase 2).
    fn current_layout(replicas: &[DirReplica]) -> Layout {
        let segments = replicas
            .iter()
            .map(|r| {
                if !r.lookup_err.is_success() {
                    Segment { start: 0, stop: 0, subvol: r.subvol, err: r.lookup_err, commit_hash: 0 }
                } else if let Some(rec) = r.layout_record {
                    rec.to_segment(r.subvol, Errno::SUCCESS)
                } else {
                    Segment { start: 0, stop: 0, subvol: r.subvol, err: Errno::LAYOUT_NOT_SET, commit_hash: 0 }
                }
            })
            .collect();
        Layout::new(segments)
    }

    /// Picks the metadata-authoritative subvolume: the one recorded in a live replica's
    /// `trusted.glusterfs.dht.mds` xattr, if any replica still carries one pointing at a
    /// subvolume that answered lookup; otherwise the first replica (in subvolume-set
    /// order) that answered the lookup successfully, which becomes the MDS for this pass
    /// (§4.3 step 4, dht-selfheal.c's "MDS xattr is populated only while DHT is having
    /// more than one subvolume... consider hash subvol as a MDS to avoid MDS check
    /// failure").
    fn pick_mds(replicas: &[DirReplica]) -> Option<&DirReplica> {
        replicas
            .iter()
            .find_map(|r| r.mds_xattr)
            .and_then(|mds| replicas.iter().find(|r| r.subvol == mds && r.lookup_err.is_success()))
            .or_else(|| replicas.iter().find(|r| r.lookup_err.is_success()))
    }

    /// Phase 3: creates the directory on every subvolume where it is missing, using the
    /// MDS's gfid so every replica shares an identity (§4.3 step 3).
    async fn heal_missing(
        &self,
        parent: Gfid,
        name: &str,
        mds: &DirReplica,
        replicas: &[DirReplica],
    ) -> Result<(), Errno> {
        let mds_attr = mds.attr.as_ref().ok_or(Errno(libc::EIO))?;
        for r in replicas {
            if r.lookup_err.is_benign_race() {
                let backend = self.backend(r.subvol)?;
                match backend.mkdir(parent, name, Some(mds_attr.gfid), mds_attr.mode, true).await {
                    Ok(_) => debug!("healed missing directory {name} on subvolume {:?}", r.subvol),
                    Err(e) if e.is_benign_race() => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Phase 4: copies a source replica's attributes onto every other subvolume (§4.3
    /// step 4). For the root directory the source is the first-up subvolume's observed
    /// attrs rather than the elected MDS: root has no meaningful MDS concept, and
    /// electing a fresh one on every heal pass (§3 "Local") would make root's
    /// uid/gid/mode/times drift depending on which subvolume happened to answer lookup
    /// first. Every other directory takes the MDS's attrs, as usual.
    async fn heal_attrs(
        &self,
        gfid: Gfid,
        mds: &DirReplica,
        replicas: &[DirReplica],
    ) -> Result<(), Errno> {
        let source = if gfid == ROOT_GFID {
            self.config
                .subvolumes
                .first_up()
                .and_then(|s| replicas.iter().find(|r| r.subvol == s.id()))
                .filter(|r| r.lookup_err.is_success())
                .unwrap_or(mds)
        } else {
            mds
        };
        let source_attr = *source.attr.as_ref().ok_or(Errno(libc::EIO))?;
        let valid = crate::fop::SetAttrFlags::UID
            | crate::fop::SetAttrFlags::GID
            | crate::fop::SetAttrFlags::MODE
            | crate::fop::SetAttrFlags::ATIME
            | crate::fop::SetAttrFlags::MTIME;
        for r in replicas {
            if r.subvol == source.subvol || !r.lookup_err.is_success() {
                continue;
            }
            if r.attr != Some(source_attr) {
                let backend = self.backend(r.subvol)?;
                if let Err(e) = backend.setattr(gfid, source_attr, valid).await {
                    if !e.is_benign_race() {
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }

    /// Phase 5: copies non-layout user xattrs from the MDS onto subvolumes missing them,
    /// tagging the write as heal-issued so lower layers relax normal gating (§4.3 step
    /// 5, §6 `GF_INTERNAL_CTX_KEY`).
    async fn heal_xattrs(&self, gfid: Gfid, mds: &DirReplica, replicas: &[DirReplica]) -> Result<(), Errno> {
        let mds_backend = self.backend(mds.subvol)?;
        let mds_xattrs = mds_backend.list_user_xattrs(gfid).await?;

        for r in replicas {
            if r.subvol == mds.subvol || !r.lookup_err.is_success() {
                continue;
            }
            let backend = self.backend(r.subvol)?;
            let existing = backend.list_user_xattrs(gfid).await.unwrap_or_default();
            for (key, value) in &mds_xattrs {
                if !existing.contains_key(key) {
                    if let Err(e) = backend.setxattr(gfid, key, value, true).await {
                        if !e.is_benign_race() {
                            return Err(e);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Clears the dirty bit once heal succeeds: resets the MDS xattr on the elected MDS
    /// subvolume back to zero (§4.3 step 5, dht-selfheal.c's "After heal all custom
    /// xattr reset internal MDS xattr to 0"). A failure here is logged, not fatal — the
    /// next heal pass will simply re-derive the MDS and try again. Already-unset is a
    /// no-op: re-invoking heal on an already-healed directory must not reset what's
    /// already zero (§8 "round-trip / idempotence laws").
    async fn reset_mds_dirty_bit(&self, gfid: Gfid, mds: &DirReplica) {
        if mds.mds_xattr.is_none() {
            return;
        }
        let Ok(backend) = self.backend(mds.subvol) else { return };
        let zero = xattr::mds_to_bytes(SubvolId(xattr::MDS_UNSET));
        if let Err(e) = backend.setxattr(gfid, xattr::XATTR_MDS, &zero, true).await {
            if !e.is_benign_race() {
                warn!("failed to reset MDS xattr on {:?} after heal: {e}", mds.subvol);
            }
        }
    }

    /// Phase 6: recomputes the layout over the currently up, placement-eligible
    /// subvolumes, using [`fix_layout`] to preserve as much of the prior placement as
    /// possible, then writes a record (real or zero-range) to every subvolume the
    /// directory exists on (§4.3 step 6).
    fn recompute_layout(&self, dir_gfid: Gfid, current: &Layout) -> Layout {
        let eligible = self.config.subvolumes.eligible_for_placement();
        let weights: Vec<Weight> = eligible.iter().map(|s| Weight { subvol: s.id(), chunks: 1 }).collect();

        let spread = self.config.spread_count(weights.len());
        let (placed, zero_range): (Vec<Weight>, Vec<Weight>) = if spread < weights.len() {
            (weights[..spread].to_vec(), weights[spread..].to_vec())
        } else {
            (weights, Vec::new())
        };

        let gfid_key = hex_gfid(dir_gfid);
        let start = rotation_start(placed.len().max(1), &gfid_key);
        let commit_hash = crate::hash::name_hash(&gfid_key);

        let mut new_layout = match assign_layout(&placed, start, commit_hash) {
            Some(l) => fix_layout(current, l),
            None => Layout::new(Vec::new()),
        };

        for w in zero_range {
            new_layout.segments.push(Segment {
                start: 0,
                stop: 0,
                subvol: w.subvol,
                err: Errno::SUCCESS,
                commit_hash,
            });
        }

        new_layout
    }

    /// Writes the healed layout record to every subvolume it names, skipping any
    /// subvolume whose on-disk record (captured in `replicas` during phase 2) already
    /// matches what would be written — re-invoking heal on an already-healed directory
    /// must issue no `setxattr` at all (§8 "round-trip / idempotence laws").
    async fn write_layout(&self, gfid: Gfid, layout: &Layout, replicas: &[DirReplica]) -> Result<(), Errno> {
        for seg in &layout.segments {
            let record = if seg.is_zero_range() {
                LayoutRecord::zero_range(seg.commit_hash)
            } else {
                LayoutRecord::from_segment(seg)
            };

            let unchanged = replicas
                .iter()
                .find(|r| r.subvol == seg.subvol)
                .is_some_and(|r| r.layout_record == Some(record));
            if unchanged {
                continue;
            }

            let backend = self.backend(seg.subvol)?;
            if let Err(e) = backend.setxattr(gfid, xattr::XATTR_LAYOUT, &record.to_bytes(), true).await {
                if !e.is_benign_race() {
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Runs the full seven-phase heal against one directory: namespace lock, gather,
    /// create-missing, attr heal, xattr heal, layout heal, unlock. Returns the anomaly
    /// counts observed *before* healing, so callers can report what was fixed (§4.3,
    /// §8 property 5: anomalies must be zero after a successful heal that is then
    /// re-measured).
    pub async fn heal_directory(
        &self,
        inode: InodeId,
        parent: Gfid,
        name: &str,
        dir_gfid: Gfid,
    ) -> Result<Anomalies, Errno> {
        let owner = LockOwner(dir_gfid_to_owner(dir_gfid));
        let lock_subvol = self
            .config
            .subvolumes
            .first_up()
            .ok_or(Errno(libc::ENOTCONN))?;
        let ns = self
            .locks
            .acquire_namespace_lock(lock_subvol.name(), lock_subvol.id(), dir_gfid, name, owner)
            .await?;

        let result = self.heal_directory_locked(inode, parent, name, dir_gfid).await;

        self.locks.release_namespace_lock(ns).await;
        result
    }

    async fn heal_directory_locked(
        &self,
        inode: InodeId,
        parent: Gfid,
        name: &str,
        dir_gfid: Gfid,
    ) -> Result<Anomalies, Errno> {
        let replicas = self.gather(parent, name, dir_gfid).await;
        let current = Self::current_layout(&replicas);
        let anomalies = current.anomalies(self.config.subvolumes.eligible_for_placement().len());

        let mds = Self::pick_mds(&replicas).ok_or_else(|| {
            warn!("self-heal found no replica of {name} answering lookup, cannot pick an MDS");
            Errno(libc::ENOENT)
        })?;

        self.heal_missing(parent, name, mds, &replicas).await?;
        self.heal_attrs(dir_gfid, mds, &replicas).await?;
        self.heal_xattrs(dir_gfid, mds, &replicas).await?;
        self.reset_mds_dirty_bit(dir_gfid, mds).await;

        let healed_layout = self.recompute_layout(dir_gfid, &current);
        self.write_layout(dir_gfid, &healed_layout, &replicas).await?;
        self.config.inode_ctx.get_or_create(inode).set_layout(Arc::new(healed_layout));

        Ok(anomalies)
    }

    /// The lighter pass run during a `fix-layout`-only rebalance step: phases 1, 2 and 6
    /// only — no directory creation, no attribute or xattr healing, just a fresh layout
    /// assignment written back (§4.3 "fix-layout-only").
    pub async fn fix_layout_only(
        &self,
        inode: InodeId,
        parent: Gfid,
        name: &str,
        dir_gfid: Gfid,
    ) -> Result<(), Errno> {
        let lock_subvol = self.config.subvolumes.first_up().ok_or(Errno(libc::ENOTCONN))?;
        let owner = LockOwner(dir_gfid_to_owner(dir_gfid));
        let ns = self
            .locks
            .acquire_namespace_lock(lock_subvol.name(), lock_subvol.id(), dir_gfid, name, owner)
            .await?;

        let result = async {
            let replicas = self.gather(parent, name, dir_gfid).await;
            let current = Self::current_layout(&replicas);
            let healed = self.recompute_layout(dir_gfid, &current);
            self.write_layout(dir_gfid, &healed, &replicas).await?;
            self.config.inode_ctx.get_or_create(inode).set_layout(Arc::new(healed));
            Ok(())
        }
        .await;

        self.locks.release_namespace_lock(ns).await;
        result
    }
}

fn dir_gfid_to_owner(gfid: Gfid) -> u64 {
    u64::from_be_bytes(gfid[0..8].try_into().unwrap())
}

fn hex_gfid(gfid: Gfid) -> String {
    gfid.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    use async_trait::async_trait;
    use dashmap::DashMap;

    use crate::config::DhtOptions;
    use crate::fop::{LookupReply, SetAttrFlags, Xattrs};
    use crate::lock::{LockBackend, LockType};
    use crate::subvolume::{Subvolume, SubvolumeSet};

    #[derive(Default)]
    struct FakeSubvol {
        present: DashMap<String, Gfid>,
        attrs: DashMap<Gfid, Attr>,
        xattrs: DashMap<(Gfid, String), Vec<u8>>,
        next_fd: AtomicU64,
        /// Counts calls a re-heal of an already-healed directory must not make (§8
        /// "round-trip / idempotence laws": "no setxattr, no mkdir").
        setxattr_calls: AtomicU64,
        mkdir_calls: AtomicU64,
    }

    #[async_trait]
    impl SubvolumeOps for FakeSubvol {
        async fn lookup(&self, _parent: Gfid, name: &str) -> Result<LookupReply, Errno> {
            let gfid = self.present.get(name).map(|g| *g).ok_or(Errno(libc::ENOENT))?;
            self.lookup_inode(gfid).await
        }
        async fn lookup_inode(&self, gfid: Gfid) -> Result<LookupReply, Errno> {
            let attr = self.attrs.get(&gfid).map(|a| *a).ok_or(Errno(libc::ENOENT))?;
            Ok(LookupReply { attr, linkto: None })
        }
        async fn open(&self, _gfid: Gfid, _flags: crate::open_flags::OpenFlags) -> Result<u64, Errno> {
            Ok(self.next_fd.fetch_add(1, Ordering::Relaxed))
        }
        async fn read(&self, _fd: u64, _o: u64, _s: u32) -> Result<Vec<u8>, Errno> {
            Ok(vec![])
        }
        async fn write(&self, _fd: u64, _o: u64, d: &[u8]) -> Result<u32, Errno> {
            Ok(d.len() as u32)
        }
        async fn flush(&self, _fd: u64) -> Result<(), Errno> {
            Ok(())
        }
        async fn truncate(&self, _g: Gfid, _s: u64) -> Result<(), Errno> {
            Ok(())
        }
        async fn unlink(&self, _p: Gfid, _n: &str) -> Result<(), Errno> {
            Ok(())
        }
        async fn link(&self, _g: Gfid, _np: Gfid, _nn: &str) -> Result<(), Errno> {
            Ok(())
        }
        async fn rename(&self, _op: Gfid, _on: &str, _np: Gfid, _nn: &str) -> Result<(), Errno> {
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
            self.mkdir_calls.fetch_add(1, Ordering::Relaxed);
            let gfid = gfid_req.unwrap_or([1; 16]);
            self.present.insert(name.to_string(), gfid);
            self.attrs.insert(gfid, Attr { gfid, mode, file_type: libc::S_IFDIR as u32, ..Attr::default() });
            Ok(gfid)
        }
        async fn rmdir(&self, _parent: Gfid, _name: &str) -> Result<(), Errno> {
            Ok(())
        }
        async fn setattr(&self, gfid: Gfid, attr: Attr, _valid: SetAttrFlags) -> Result<(), Errno> {
            self.attrs.insert(gfid, attr);
            Ok(())
        }
        async fn getxattr(&self, gfid: Gfid, key: &str) -> Result<Vec<u8>, Errno> {
            self.xattrs.get(&(gfid, key.to_string())).map(|v| v.clone()).ok_or(Errno(libc::ENODATA))
        }
        async fn setxattr(&self, gfid: Gfid, key: &str, value: &[u8], _heal: bool) -> Result<(), Errno> {
            self.setxattr_calls.fetch_add(1, Ordering::Relaxed);
            self.xattrs.insert((gfid, key.to_string()), value.to_vec());
            Ok(())
        }
        async fn list_user_xattrs(&self, gfid: Gfid) -> Result<Xattrs, Errno> {
            let mut out = Xattrs::new();
            for e in self.xattrs.iter() {
                let (g, k) = e.key();
                if *g == gfid && k.as_str() != xattr::XATTR_LAYOUT {
                    out.insert(k.clone(), e.value().clone());
                }
            }
            Ok(out)
        }
    }

    #[derive(Default)]
    struct NoopLockBackend;

    #[async_trait]
    impl LockBackend for NoopLockBackend {
        async fn inodelk(
            &self,
            _s: SubvolId,
            _g: [u8; 16],
            _d: &str,
            _t: LockType,
            _o: LockOwner,
            _b: bool,
        ) -> Result<(), Errno> {
            Ok(())
        }
        async fn unlock_inodelk(&self, _s: SubvolId, _g: [u8; 16], _d: &str, _o: LockOwner) -> Result<(), Errno> {
            Ok(())
        }
        async fn entrylk(
            &self,
            _s: SubvolId,
            _p: [u8; 16],
            _b: &str,
            _d: &str,
            _t: LockType,
            _o: LockOwner,
            _bl: bool,
        ) -> Result<(), Errno> {
            Ok(())
        }
        async fn unlock_entrylk(
            &self,
            _s: SubvolId,
            _p: [u8; 16],
            _b: &str,
            _d: &str,
            _o: LockOwner,
        ) -> Result<(), Errno> {
            Ok(())
        }
    }

    fn make_engine(n: usize) -> (SelfHealEngine, Vec<Arc<FakeSubvol>>) {
        let mut subvols = Vec::new();
        let mut backends: HashMap<SubvolId, Arc<dyn SubvolumeOps>> = HashMap::new();
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
        (SelfHealEngine::new(config, backends, locks), fakes)
    }

    #[tokio::test]
    async fn heal_creates_missing_directory_and_writes_layout_everywhere() {
        let (engine, fakes) = make_engine(3);
        let parent = [0u8; 16];
        let dir_gfid = [5u8; 16];

        // Present (and healthy) on bricks 0 and 1, missing entirely on brick 2.
        for fake in &fakes[..2] {
            fake.present.insert("d".to_string(), dir_gfid);
            fake.attrs.insert(dir_gfid, Attr { gfid: dir_gfid, mode: 0o755, file_type: libc::S_IFDIR as u32, ..Attr::default() });
        }

        engine.heal_directory(InodeId(1), parent, "d", dir_gfid).await.unwrap();

        assert!(fakes[2].present.contains_key("d"));
        for fake in &fakes {
            assert!(fake.xattrs.contains_key(&(dir_gfid, xattr::XATTR_LAYOUT.to_string())));
        }
    }

    #[tokio::test]
    async fn heal_propagates_mds_attrs_to_stale_replicas() {
        let (engine, fakes) = make_engine(2);
        let parent = [0u8; 16];
        let dir_gfid = [6u8; 16];

        fakes[0].present.insert("d".to_string(), dir_gfid);
        fakes[0].attrs.insert(dir_gfid, Attr { gfid: dir_gfid, mode: 0o700, file_type: libc::S_IFDIR as u32, ..Attr::default() });
        fakes[1].present.insert("d".to_string(), dir_gfid);
        fakes[1].attrs.insert(dir_gfid, Attr { gfid: dir_gfid, mode: 0o755, file_type: libc::S_IFDIR as u32, ..Attr::default() });

        engine.heal_directory(InodeId(1), parent, "d", dir_gfid).await.unwrap();

        assert_eq!(fakes[1].attrs.get(&dir_gfid).unwrap().mode, 0o700);
    }

    #[tokio::test]
    async fn heal_honors_recorded_mds_xattr_and_resets_it_after_heal() {
        let (engine, fakes) = make_engine(2);
        let parent = [0u8; 16];
        let dir_gfid = [8u8; 16];

        for fake in &fakes {
            fake.present.insert("d".to_string(), dir_gfid);
        }
        // brick-0 answers lookup first, but the MDS xattr says brick-1 is authoritative.
        fakes[0].attrs.insert(dir_gfid, Attr { gfid: dir_gfid, mode: 0o700, file_type: libc::S_IFDIR as u32, ..Attr::default() });
        fakes[1].attrs.insert(dir_gfid, Attr { gfid: dir_gfid, mode: 0o750, file_type: libc::S_IFDIR as u32, ..Attr::default() });
        fakes[1].xattrs.insert((dir_gfid, xattr::XATTR_MDS.to_string()), xattr::mds_to_bytes(SubvolId(1)).to_vec());

        engine.heal_directory(InodeId(1), parent, "d", dir_gfid).await.unwrap();

        // Attrs were healed from brick-1 (the recorded MDS), not brick-0.
        assert_eq!(fakes[0].attrs.get(&dir_gfid).unwrap().mode, 0o750);
        // The dirty bit is cleared on the MDS after a successful heal.
        let reset = fakes[1].xattrs.get(&(dir_gfid, xattr::XATTR_MDS.to_string())).unwrap().clone();
        assert_eq!(xattr::mds_from_bytes(&reset), None);
    }

    /// §8 "round-trip / idempotence laws": "Re-invoking heal on an already-healed
    /// directory is a no-op (no setxattr, no mkdir)."
    #[tokio::test]
    async fn reheal_of_already_healed_directory_issues_no_writes() {
        let (engine, fakes) = make_engine(3);
        let parent = [0u8; 16];
        let dir_gfid = [9u8; 16];

        for fake in &fakes {
            fake.present.insert("d".to_string(), dir_gfid);
            fake.attrs.insert(dir_gfid, Attr { gfid: dir_gfid, mode: 0o755, file_type: libc::S_IFDIR as u32, ..Attr::default() });
        }

        engine.heal_directory(InodeId(1), parent, "d", dir_gfid).await.unwrap();

        for fake in &fakes {
            fake.setxattr_calls.store(0, Ordering::Relaxed);
            fake.mkdir_calls.store(0, Ordering::Relaxed);
        }

        engine.heal_directory(InodeId(1), parent, "d", dir_gfid).await.unwrap();

        for fake in &fakes {
            assert_eq!(fake.setxattr_calls.load(Ordering::Relaxed), 0);
            assert_eq!(fake.mkdir_calls.load(Ordering::Relaxed), 0);
        }
    }

    #[tokio::test]
    async fn fix_layout_only_skips_mkdir_and_attr_heal() {
        let (engine, fakes) = make_engine(2);
        let parent = [0u8; 16];
        let dir_gfid = [7u8; 16];
        // Directory only exists on brick 0; fix-layout-only must not create it on brick 1.
        fakes[0].present.insert("d".to_string(), dir_gfid);
        fakes[0].attrs.insert(dir_gfid, Attr { gfid: dir_gfid, mode: 0o755, file_type: libc::S_IFDIR as u32, ..Attr::default() });

        engine.fix_layout_only(InodeId(1), parent, "d", dir_gfid).await.unwrap();

        assert!(!fakes[1].present.contains_key("d"));
    }
}
