//! Backend subvolume bookkeeping: identity, connectivity and decommission state.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Stable numeric index of a subvolume, assigned at init and never renumbered
/// for the lifetime of the process even if the subvolume list is re-ordered.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Debug)]
#[cfg_attr(feature = "serializable", derive(serde::Serialize, serde::Deserialize))]
pub struct SubvolId(pub u32);

/// A handle on one backend storage child.
///
/// Cloning a [`Subvolume`] is cheap: the up/down and decommission flags live behind
/// atomics so every clone observes the same live state.
#[derive(Debug)]
pub struct Subvolume {
    id: SubvolId,
    name: String,
    up: AtomicBool,
    /// Unix-epoch millis at which connectivity was last (re-)established; zero means down.
    up_since_millis: AtomicU64,
    decommissioned: AtomicBool,
}

impl Subvolume {
    pub fn new(id: SubvolId, name: impl Into<String>) -> Self {
        Subvolume {
            id,
            name: name.into(),
            up: AtomicBool::new(false),
            up_since_millis: AtomicU64::new(0),
            decommissioned: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> SubvolId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    pub fn is_decommissioned(&self) -> bool {
        self.decommissioned.load(Ordering::Acquire)
    }

    /// A subvolume is eligible to receive new placement if it is up and not being drained.
    pub fn eligible_for_placement(&self) -> bool {
        self.is_up() && !self.is_decommissioned()
    }

    pub fn set_decommissioned(&self, value: bool) {
        self.decommissioned.store(value, Ordering::Release);
    }

    pub fn mark_up(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.up_since_millis.store(now.max(1), Ordering::Release);
        self.up.store(true, Ordering::Release);
    }

    pub fn mark_down(&self) {
        self.up.store(false, Ordering::Release);
        self.up_since_millis.store(0, Ordering::Release);
    }

    /// Instant (millis since epoch) at which connectivity was last established, or `None`
    /// if the subvolume is currently down.
    pub fn up_since(&self) -> Option<u64> {
        let t = self.up_since_millis.load(Ordering::Acquire);
        if t == 0 {
            None
        } else {
            Some(t)
        }
    }
}

impl fmt::Display for Subvolume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl PartialEq for Subvolume {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Subvolume {}

/// The ordered set of subvolumes participating in this volume.
///
/// The order given at construction is the "up-time" fallback order used when no layout
/// is available (see `dht_first_up_subvol` in the source translator): callers that need
/// up-time ordering should keep subvolumes sorted by [`Subvolume::up_since`] themselves,
/// since re-ordering here would violate the "not renumbered" invariant on [`SubvolId`].
#[derive(Debug)]
pub struct SubvolumeSet {
    subvols: Vec<std::sync::Arc<Subvolume>>,
}

impl SubvolumeSet {
    pub fn new(subvols: Vec<std::sync::Arc<Subvolume>>) -> Self {
        SubvolumeSet { subvols }
    }

    pub fn len(&self) -> usize {
        self.subvols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subvols.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &std::sync::Arc<Subvolume>> {
        self.subvols.iter()
    }

    pub fn by_id(&self, id: SubvolId) -> Option<&std::sync::Arc<Subvolume>> {
        self.subvols.iter().find(|s| s.id() == id)
    }

    pub fn by_name(&self, name: &str) -> Option<&std::sync::Arc<Subvolume>> {
        self.subvols.iter().find(|s| s.name() == name)
    }

    /// The first subvolume (in set order) that is up, regardless of decommission status.
    /// Used for resolving the well-known root gfid and as a fallback when a directory's
    /// layout is not yet known.
    pub fn first_up(&self) -> Option<&std::sync::Arc<Subvolume>> {
        self.subvols.iter().find(|s| s.is_up())
    }

    /// Subvolumes eligible to receive new file/directory placement: up and not decommissioned.
    pub fn eligible_for_placement(&self) -> Vec<std::sync::Arc<Subvolume>> {
        self.subvols
            .iter()
            .filter(|s| s.eligible_for_placement())
            .cloned()
            .collect()
    }
}
