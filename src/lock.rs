//! Multi-subvolume `inodelk` and `entrylk` on top of single-subvolume backend locks,
//! plus the two-level "namespace" protocol self-heal uses to serialize directory
//! mutations (§4.4).

use std::sync::Arc;

use async_trait::async_trait;

use crate::errno::Errno;
use crate::subvolume::SubvolId;

/// Lock domain tags partitioning the backend lock namespace (§3 "Lock Request").
pub const DOMAIN_LAYOUT_HEAL: &str = "LAYOUT_HEAL";
pub const DOMAIN_ENTRY_SYNC: &str = "ENTRY_SYNC";

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum LockType {
    Read,
    Write,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FailurePolicy {
    FailOnAnyError,
    IgnoreEnoentEstale,
}

impl FailurePolicy {
    fn absorbs(self, err: Errno) -> bool {
        self == FailurePolicy::IgnoreEnoentEstale && err.is_benign_race()
    }
}

/// Opaque lock-owner identity, derived from the originating frame. Every unlock request
/// must carry the same owner as its matching lock so the backend can pair them; the
/// protocol never re-enters with the same owner on the same resource (§4.4).
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct LockOwner(pub u64);

/// One element of a multi-subvolume `inodelk` request array (§3 "Lock Request").
#[derive(Clone, Debug)]
pub struct InodeLockRequest {
    pub subvol_name: String,
    pub subvol: SubvolId,
    pub gfid: [u8; 16],
    pub lock_type: LockType,
    pub domain: &'static str,
    pub owner: LockOwner,
    pub policy: FailurePolicy,
}

/// One element of a multi-subvolume `entrylk` request array.
#[derive(Clone, Debug)]
pub struct EntryLockRequest {
    pub subvol_name: String,
    pub subvol: SubvolId,
    pub parent_gfid: [u8; 16],
    pub basename: String,
    pub lock_type: LockType,
    pub domain: &'static str,
    pub owner: LockOwner,
    pub policy: FailurePolicy,
}

/// The backend primitive this layer builds on: a single-subvolume blocking/non-blocking
/// lock/unlock pair. A real implementation issues these as RPCs to the child subvolume;
/// tests substitute an in-memory fake.
#[async_trait]
pub trait LockBackend: Send + Sync {
    async fn inodelk(
        &self,
        subvol: SubvolId,
        gfid: [u8; 16],
        domain: &str,
        lock_type: LockType,
        owner: LockOwner,
        blocking: bool,
    ) -> Result<(), Errno>;

    async fn unlock_inodelk(
        &self,
        subvol: SubvolId,
        gfid: [u8; 16],
        domain: &str,
        owner: LockOwner,
    ) -> Result<(), Errno>;

    async fn entrylk(
        &self,
        subvol: SubvolId,
        parent_gfid: [u8; 16],
        basename: &str,
        domain: &str,
        lock_type: LockType,
        owner: LockOwner,
        blocking: bool,
    ) -> Result<(), Errno>;

    async fn unlock_entrylk(
        &self,
        subvol: SubvolId,
        parent_gfid: [u8; 16],
        basename: &str,
        domain: &str,
        owner: LockOwner,
    ) -> Result<(), Errno>;
}

struct InodeLockSlot {
    request: InodeLockRequest,
    locked: bool,
}

struct EntryLockSlot {
    request: EntryLockRequest,
    locked: bool,
}

/// A held (or partially-held, per ignore-policy) multi-subvolume inodelk. Dropping this
/// without calling [`InodeLockTransaction::release`] leaks backend locks — the type does
/// not unlock on `Drop` because release is async; callers must release explicitly, the
/// same discipline the self-heal engine follows (§4.3 step 7).
pub struct InodeLockTransaction {
    slots: Vec<InodeLockSlot>,
}

pub struct EntryLockTransaction {
    slots: Vec<EntryLockSlot>,
}

/// Sorts a lock array by `(subvolume_name, gfid)` so every caller acquires in the same
/// global order, making cluster-wide deadlock impossible (§4.4, §8 property 3).
pub fn sort_inode_locks(requests: &mut [InodeLockRequest]) {
    requests.sort_by(|a, b| (a.subvol_name.as_str(), a.gfid).cmp(&(b.subvol_name.as_str(), b.gfid)));
}

pub fn sort_entry_locks(requests: &mut [EntryLockRequest]) {
    requests.sort_by(|a, b| {
        (a.subvol_name.as_str(), a.parent_gfid, a.basename.as_str())
            .cmp(&(b.subvol_name.as_str(), b.parent_gfid, b.basename.as_str()))
    });
}

/// Drives the inodelk/entrylk protocols against a [`LockBackend`].
pub struct LockManager {
    backend: Arc<dyn LockBackend>,
}

impl LockManager {
    pub fn new(backend: Arc<dyn LockBackend>) -> Self {
        LockManager { backend }
    }

    /// Sequential blocking `inodelk` over a pre-sorted array (§4.4 "Sequential blocking
    /// inodelk"): each request is sent in order; a failure unwinds everything already
    /// held, in reverse, and returns the original error.
    pub async fn acquire_inodelk_blocking(
        &self,
        requests: Vec<InodeLockRequest>,
    ) -> Result<InodeLockTransaction, Errno> {
        let mut slots: Vec<InodeLockSlot> =
            requests.into_iter().map(|r| InodeLockSlot { request: r, locked: false }).collect();

        let mut failure: Option<Errno> = None;
        for slot in slots.iter_mut() {
            let r = &slot.request;
            match self
                .backend
                .inodelk(r.subvol, r.gfid, r.domain, r.lock_type, r.owner, true)
                .await
            {
                Ok(()) => slot.locked = true,
                Err(e) if r.policy.absorbs(e) => {}
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(err) = failure {
            self.unlock_inodelk_slots(&mut slots).await;
            return Err(err);
        }

        Ok(InodeLockTransaction { slots })
    }

    /// Non-blocking `inodelk`: fans out every request in parallel, then cleans up
    /// whichever succeeded if any other failed (§4.4 "Non-blocking inodelk").
    pub async fn acquire_inodelk_nonblocking(
        &self,
        requests: Vec<InodeLockRequest>,
    ) -> Result<InodeLockTransaction, Errno> {
        let results = futures::future::join_all(requests.iter().map(|r| {
            self.backend.inodelk(r.subvol, r.gfid, r.domain, r.lock_type, r.owner, false)
        }))
        .await;

        let mut slots: Vec<InodeLockSlot> = Vec::with_capacity(requests.len());
        let mut failure: Option<Errno> = None;
        for (r, res) in requests.into_iter().zip(results) {
            let locked = match &res {
                Ok(()) => true,
                Err(e) if r.policy.absorbs(*e) => false,
                Err(e) => {
                    failure.get_or_insert(*e);
                    false
                }
            };
            slots.push(InodeLockSlot { request: r, locked });
        }

        if let Some(err) = failure {
            self.unlock_inodelk_slots(&mut slots).await;
            return Err(err);
        }

        Ok(InodeLockTransaction { slots })
    }

    async fn unlock_inodelk_slots(&self, slots: &mut [InodeLockSlot]) {
        for slot in slots.iter_mut().rev() {
            if slot.locked {
                let r = &slot.request;
                let _ = self.backend.unlock_inodelk(r.subvol, r.gfid, r.domain, r.owner).await;
                slot.locked = false;
            }
        }
    }

    pub async fn release_inodelk(&self, mut txn: InodeLockTransaction) {
        self.unlock_inodelk_slots(&mut txn.slots).await;
    }

    pub async fn acquire_entrylk_blocking(
        &self,
        requests: Vec<EntryLockRequest>,
    ) -> Result<EntryLockTransaction, Errno> {
        let mut slots: Vec<EntryLockSlot> =
            requests.into_iter().map(|r| EntryLockSlot { request: r, locked: false }).collect();

        let mut failure: Option<Errno> = None;
        for slot in slots.iter_mut() {
            let r = &slot.request;
            match self
                .backend
                .entrylk(r.subvol, r.parent_gfid, &r.basename, r.domain, r.lock_type, r.owner, true)
                .await
            {
                Ok(()) => slot.locked = true,
                Err(e) if r.policy.absorbs(e) => {}
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(err) = failure {
            self.unlock_entrylk_slots(&mut slots).await;
            return Err(err);
        }
        Ok(EntryLockTransaction { slots })
    }

    async fn unlock_entrylk_slots(&self, slots: &mut [EntryLockSlot]) {
        for slot in slots.iter_mut().rev() {
            if slot.locked {
                let r = &slot.request;
                let _ = self
                    .backend
                    .unlock_entrylk(r.subvol, r.parent_gfid, &r.basename, r.domain, r.owner)
                    .await;
                slot.locked = false;
            }
        }
    }

    pub async fn release_entrylk(&self, mut txn: EntryLockTransaction) {
        self.unlock_entrylk_slots(&mut txn.slots).await;
    }

    /// The "namespace" protocol (§4.4): inodelk first, then entrylk; on entrylk
    /// failure the inodelk is explicitly released so nothing leaks; release order is
    /// reversed (entrylk first, then inodelk).
    pub async fn acquire_namespace_lock(
        &self,
        subvol_name: &str,
        subvol: SubvolId,
        dir_gfid: [u8; 16],
        basename: &str,
        owner: LockOwner,
    ) -> Result<NamespaceLock, Errno> {
        let inode_txn = self
            .acquire_inodelk_blocking(vec![InodeLockRequest {
                subvol_name: subvol_name.to_string(),
                subvol,
                gfid: dir_gfid,
                lock_type: LockType::Read,
                domain: DOMAIN_LAYOUT_HEAL,
                owner,
                policy: FailurePolicy::FailOnAnyError,
            }])
            .await?;

        let entry_txn = match self
            .acquire_entrylk_blocking(vec![EntryLockRequest {
                subvol_name: subvol_name.to_string(),
                subvol,
                parent_gfid: dir_gfid,
                basename: basename.to_string(),
                lock_type: LockType::Write,
                domain: DOMAIN_ENTRY_SYNC,
                owner,
                policy: FailurePolicy::FailOnAnyError,
            }])
            .await
        {
            Ok(txn) => txn,
            Err(e) => {
                self.release_inodelk(inode_txn).await;
                return Err(e);
            }
        };

        Ok(NamespaceLock { inode_txn, entry_txn })
    }

    pub async fn release_namespace_lock(&self, ns: NamespaceLock) {
        self.release_entrylk(ns.entry_txn).await;
        self.release_inodelk(ns.inode_txn).await;
    }
}

/// The combined inodelk+entrylk namespace lock self-heal holds across its critical
/// section (§4.3 phase 1).
pub struct NamespaceLock {
    inode_txn: InodeLockTransaction,
    entry_txn: EntryLockTransaction,
}

#[cfg(test)]
mod tests {
    use super::*;
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeBackend {
        inode_held: DashMap<(SubvolId, [u8; 16], String), ()>,
        fail_subvol: Option<SubvolId>,
        fail_entrylk_subvol: Option<SubvolId>,
        fail_errno: Errno,
        unlock_calls: AtomicUsize,
    }

    #[async_trait]
    impl LockBackend for FakeBackend {
        async fn inodelk(
            &self,
            subvol: SubvolId,
            gfid: [u8; 16],
            domain: &str,
            _lock_type: LockType,
            _owner: LockOwner,
            _blocking: bool,
        ) -> Result<(), Errno> {
            if self.fail_subvol == Some(subvol) {
                return Err(self.fail_errno);
            }
            self.inode_held.insert((subvol, gfid, domain.to_string()), ());
            Ok(())
        }

        async fn unlock_inodelk(
            &self,
            _subvol: SubvolId,
            _gfid: [u8; 16],
            _domain: &str,
            _owner: LockOwner,
        ) -> Result<(), Errno> {
            self.unlock_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn entrylk(
            &self,
            subvol: SubvolId,
            _parent_gfid: [u8; 16],
            _basename: &str,
            _domain: &str,
            _lock_type: LockType,
            _owner: LockOwner,
            _blocking: bool,
        ) -> Result<(), Errno> {
            if self.fail_entrylk_subvol == Some(subvol) {
                return Err(self.fail_errno);
            }
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
            self.unlock_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn req(name: &str, id: u32, policy: FailurePolicy) -> InodeLockRequest {
        InodeLockRequest {
            subvol_name: name.to_string(),
            subvol: SubvolId(id),
            gfid: [id as u8; 16],
            lock_type: LockType::Write,
            domain: DOMAIN_LAYOUT_HEAL,
            owner: LockOwner(1),
            policy,
        }
    }

    #[tokio::test]
    async fn blocking_inodelk_succeeds_in_sorted_order() {
        let backend = Arc::new(FakeBackend::default());
        let mgr = LockManager::new(backend);
        let mut reqs = vec![
            req("B", 1, FailurePolicy::FailOnAnyError),
            req("A", 0, FailurePolicy::FailOnAnyError),
        ];
        sort_inode_locks(&mut reqs);
        assert_eq!(reqs[0].subvol_name, "A");
        let txn = mgr.acquire_inodelk_blocking(reqs).await.unwrap();
        mgr.release_inodelk(txn).await;
    }

    #[tokio::test]
    async fn failure_unwinds_everything_already_held() {
        let backend = Arc::new(FakeBackend {
            fail_subvol: Some(SubvolId(1)),
            fail_errno: Errno(libc::EIO),
            ..Default::default()
        });
        let mgr = LockManager::new(backend.clone());
        let reqs = vec![
            req("A", 0, FailurePolicy::FailOnAnyError),
            req("B", 1, FailurePolicy::FailOnAnyError),
        ];
        let err = mgr.acquire_inodelk_blocking(reqs).await.unwrap_err();
        assert_eq!(err, Errno(libc::EIO));
        assert_eq!(backend.unlock_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ignore_policy_absorbs_enoent_and_still_succeeds() {
        let backend = Arc::new(FakeBackend {
            fail_subvol: Some(SubvolId(1)),
            fail_errno: Errno(libc::ENOENT),
            ..Default::default()
        });
        let mgr = LockManager::new(backend);
        let reqs = vec![
            req("A", 0, FailurePolicy::IgnoreEnoentEstale),
            req("B", 1, FailurePolicy::IgnoreEnoentEstale),
        ];
        let txn = mgr.acquire_inodelk_blocking(reqs).await.unwrap();
        mgr.release_inodelk(txn).await;
    }

    #[tokio::test]
    async fn namespace_lock_releases_inodelk_on_entrylk_failure() {
        let backend = Arc::new(FakeBackend {
            fail_entrylk_subvol: Some(SubvolId(0)),
            fail_errno: Errno(libc::EIO),
            ..Default::default()
        });
        let mgr = LockManager::new(backend.clone());
        let result = mgr
            .acquire_namespace_lock("A", SubvolId(0), [0; 16], "child", LockOwner(7))
            .await;
        assert!(result.is_err());
        // inodelk succeeded then was released once entrylk failed.
        assert_eq!(backend.unlock_calls.load(Ordering::SeqCst), 1);
    }
}
