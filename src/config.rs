//! The translator instance: subvolume set plus the small number of volume-wide options
//! that shape layout assignment and migration bookkeeping (§9 "Global subvolume
//! configuration" — reimplemented as an owned `Config` rather than a process-wide
//! pointer).

use crate::fd_ctx::FdCtxTable;
use crate::inode_ctx::InodeCtxTable;
use crate::subvolume::SubvolumeSet;

/// Volume-wide options the layout engine and self-healer consult.
#[derive(Clone, Debug)]
pub struct DhtOptions {
    /// Rotate each directory's starting subvolume by a hash of its gfid rather than its
    /// path, so renames don't change the rotation (§4.2 step 3).
    pub randomize_by_gfid: bool,
    /// When `Some(n)` with `n < subvol_count`, only `n` subvolumes carry non-zero
    /// ranges; the rest get zero-range placeholders (§9 open question — preserved as an
    /// observable behavior, not resolved as a bug).
    pub spread_cnt: Option<usize>,
    /// This translator instance's name, used to build the linkto xattr key (§6).
    pub instance_name: String,
}

impl Default for DhtOptions {
    fn default() -> Self {
        DhtOptions {
            randomize_by_gfid: true,
            spread_cnt: None,
            instance_name: "dht0".to_string(),
        }
    }
}

/// Owns the subvolume set, options, and the two per-handle side-tables for one mounted
/// volume. The source translator keeps these as process-global statics; here they are
/// fields on an instance the dispatcher holds by reference, so multiple volumes can
/// coexist in one process without cross-talk (§9 "Global subvolume configuration").
pub struct Config {
    pub subvolumes: SubvolumeSet,
    pub options: DhtOptions,
    pub inode_ctx: InodeCtxTable,
    pub fd_ctx: FdCtxTable,
}

impl Config {
    pub fn new(subvolumes: SubvolumeSet, options: DhtOptions) -> Self {
        Config {
            subvolumes,
            options,
            inode_ctx: InodeCtxTable::new(),
            fd_ctx: FdCtxTable::new(),
        }
    }

    pub fn linkto_xattr_key(&self) -> String {
        crate::xattr::linkto_xattr_key(&self.options.instance_name)
    }

    /// How many subvolumes should carry a non-zero-range layout slab, honoring
    /// `spread_cnt` (§9).
    pub fn spread_count(&self, available: usize) -> usize {
        self.options.spread_cnt.unwrap_or(available).min(available)
    }
}
