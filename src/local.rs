//! Per-FOP local state (§3 "Local (Per-FOP State)").
//!
//! The source translator threads a `local` struct through dozens of callbacks and frees
//! it from a memory pool when the call unwinds. An `async fn` call frame already is that
//! struct in a native implementation — its lifetime is bounded by the FOP's `.await`
//! chain — so `Local` here only needs to hold the bookkeeping the dispatcher actually
//! consults mid-flight, not a pool handle.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::errno::Errno;
use crate::fd_ctx::FdId;
use crate::inode_ctx::InodeId;
use crate::layout::Layout;
use crate::subvolume::SubvolId;

/// Rebalance bookkeeping carried on a FOP so it can be exactly replayed against a new
/// destination subvolume after a migration-transparent redirect (§3, §4.1).
#[derive(Clone, Debug, Default)]
pub struct RebalanceReplay {
    pub offset: u64,
    pub flags: i32,
    pub vector_len: u32,
}

/// Per-FOP state: original target, the cached subvolume chosen at dispatch, a layout
/// snapshot, fan-out bookkeeping, and the first error observed.
pub struct Local {
    pub inode: Option<InodeId>,
    pub fd: Option<FdId>,
    pub chosen_subvol: Option<SubvolId>,
    pub layout_snapshot: Option<Arc<Layout>>,
    pub rebalance: RebalanceReplay,
    call_count: AtomicU32,
    first_error: Mutex<Option<Errno>>,
}

impl Local {
    pub fn new() -> Self {
        Local {
            inode: None,
            fd: None,
            chosen_subvol: None,
            layout_snapshot: None,
            rebalance: RebalanceReplay::default(),
            call_count: AtomicU32::new(0),
            first_error: Mutex::new(None),
        }
    }

    /// Arms the fan-out counter for `n` outstanding child replies (§4.1 "Fan-out and
    /// reply aggregation").
    pub fn arm_fan_out(&self, n: u32) {
        self.call_count.store(n, Ordering::SeqCst);
    }

    /// Records one child reply's completion; returns `true` exactly once, for the last
    /// decrementer, which is responsible for unwinding the reply.
    pub fn child_returned(&self) -> bool {
        self.call_count.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Merges a per-child error using the dispatcher's standard policy: the first
    /// non-ignored errno wins (§4.1 "Errors specific to this layer", §7).
    pub fn note_child_error(&self, err: Errno, suppress_enoent: bool) {
        if err.get() == libc::ENOENT && suppress_enoent {
            return;
        }
        let mut slot = self.first_error.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    pub fn first_error(&self) -> Option<Errno> {
        *self.first_error.lock()
    }
}

impl Default for Local {
    fn default() -> Self {
        Local::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_last_decrementer_reports_done() {
        let local = Local::new();
        local.arm_fan_out(3);
        assert!(!local.child_returned());
        assert!(!local.child_returned());
        assert!(local.child_returned());
    }

    #[test]
    fn first_error_wins_unless_enoent_suppressed() {
        let local = Local::new();
        local.note_child_error(Errno(libc::ENOENT), true);
        assert!(local.first_error().is_none());
        local.note_child_error(Errno(libc::EIO), true);
        local.note_child_error(Errno(libc::ENOSPC), true);
        assert_eq!(local.first_error(), Some(Errno(libc::EIO)));
    }
}
