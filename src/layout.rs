//! The per-directory hash-range layout: its in-memory representation, assignment,
//! anomaly detection, in-place refresh ("fix-layout"), and directory-stat merging.

use crate::errno::Errno;
use crate::hash::name_hash;
use crate::subvolume::SubvolId;

/// Sentinel `commit_hash` meaning "the layout is in flux, do not trust it for readdir
/// optimizations".
pub const COMMIT_HASH_INVALID: u32 = 0;

/// One hash-range binding within a directory's layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(serde::Serialize, serde::Deserialize))]
pub struct Segment {
    pub start: u32,
    pub stop: u32,
    pub subvol: SubvolId,
    pub err: Errno,
    pub commit_hash: u32,
}

impl Segment {
    /// A segment with `start == stop` carries directory metadata but no placement share.
    pub fn is_zero_range(&self) -> bool {
        self.start == self.stop
    }

    pub fn contains(&self, hash: u32) -> bool {
        !self.is_zero_range() && self.err.is_success() && self.start <= hash && hash <= self.stop
    }

    fn overlap_with(&self, other: Option<(u32, u32)>) -> u64 {
        if self.is_zero_range() {
            return 0;
        }
        let Some((ostart, ostop)) = other else {
            return 0;
        };
        let lo = self.start.max(ostart);
        let hi = self.stop.min(ostop);
        if lo > hi {
            0
        } else {
            u64::from(hi - lo) + 1
        }
    }
}

/// An ordered sequence of [`Segment`]s: the directory's placement layout.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serializable", derive(serde::Serialize, serde::Deserialize))]
pub struct Layout {
    pub segments: Vec<Segment>,
}

/// Counts of each anomaly category, the sole input to the self-heal decision (§4.2).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(serde::Serialize, serde::Deserialize))]
pub struct Anomalies {
    pub holes: u32,
    pub overlaps: u32,
    pub missing: u32,
    pub down: u32,
    pub misc: u32,
}

impl Anomalies {
    pub fn needs_heal(&self) -> bool {
        self.holes > 0 || self.overlaps > 0 || self.missing > 0 || self.down > 0 || self.misc > 0
    }

    pub fn total(&self) -> u32 {
        self.holes + self.overlaps + self.missing + self.down + self.misc
    }
}

impl Layout {
    pub fn new(segments: Vec<Segment>) -> Self {
        Layout { segments }
    }

    pub fn range_for_subvol(&self, subvol: SubvolId) -> Option<(u32, u32)> {
        self.segments
            .iter()
            .find(|s| s.subvol == subvol && !s.is_zero_range() && s.err.is_success())
            .map(|s| (s.start, s.stop))
    }

    /// The `commit_hash` shared by every segment, or `None` if the layout is empty.
    /// A mismatch across segments is itself an anomaly, surfaced via [`Layout::anomalies`].
    pub fn commit_hash(&self) -> Option<u32> {
        self.segments.first().map(|s| s.commit_hash)
    }

    /// Finds the unique subvolume whose range contains `hash(name)` (§4.1, §8 property 1).
    pub fn search(&self, name: &str) -> Option<SubvolId> {
        self.search_hash(name_hash(name))
    }

    pub fn search_hash(&self, hash: u32) -> Option<SubvolId> {
        self.segments
            .iter()
            .find(|s| s.contains(hash))
            .map(|s| s.subvol)
    }

    /// Computes hole/overlap/missing/down/misc counts in a single pass (§4.2).
    pub fn anomalies(&self, expected_subvol_count: usize) -> Anomalies {
        let mut a = Anomalies::default();

        for s in &self.segments {
            match s.err.get() {
                0 => {}
                e if e == libc::ENOENT || e == libc::ESTALE => a.missing += 1,
                e if Errno(e) == Errno::LAYOUT_NOT_SET => a.holes += 1,
                e if e == libc::ENOSPC => {} // capacity exhaustion is not a coverage anomaly
                e if e == libc::EINVAL => {} // decommission is deliberate, not an anomaly
                _ => a.misc += 1,
            }
        }

        // Coverage check over the non-zero-range, error-free segments.
        let mut covering: Vec<&Segment> = self
            .segments
            .iter()
            .filter(|s| s.err.is_success() && !s.is_zero_range())
            .collect();
        covering.sort_by_key(|s| s.start);

        if covering.is_empty() {
            if expected_subvol_count > 0 {
                a.holes += 1;
            }
        } else {
            if covering[0].start != 0 {
                a.holes += 1;
            }
            for w in covering.windows(2) {
                if w[1].start > w[0].stop + 1 {
                    a.holes += 1;
                } else if w[1].start <= w[0].stop {
                    a.overlaps += 1;
                }
            }
            if covering.last().unwrap().stop != u32::MAX {
                a.holes += 1;
            }
        }

        let commit_hashes: std::collections::HashSet<u32> =
            self.segments.iter().map(|s| s.commit_hash).collect();
        if commit_hashes.len() > 1 {
            a.misc += 1;
        }

        if self.segments.len() < expected_subvol_count {
            a.missing += (expected_subvol_count - self.segments.len()) as u32;
        }

        a
    }
}

/// Per-subvolume placement weight. Uniform unless disk-capacity stats are available and
/// distinct (§4.2 "Assigning a new layout", step 1).
#[derive(Clone, Copy, Debug)]
pub struct Weight {
    pub subvol: SubvolId,
    pub chunks: u64,
}

/// Deterministic rotation of the participant list so that different directories spread
/// their starting subvolume (`randomize_by_gfid`, §4.2 step 3).
pub fn rotation_start(participant_count: usize, gfid_or_path: &str) -> usize {
    if participant_count == 0 {
        0
    } else {
        (name_hash(gfid_or_path) as usize) % participant_count
    }
}

/// Assigns a brand-new layout over `participants`, walking them in rotated order and
/// giving each a `[start, start + weight*chunk_size]` slab; the last participant's
/// `stop` is forced to `u32::MAX` to guarantee full coverage (§4.2 step 4).
///
/// Returns `None` for an empty participant set — callers must refuse the operation
/// (e.g. `mkdir`) with `EINVAL` rather than publish a zero-subvolume layout (§8).
pub fn assign_layout(
    participants: &[Weight],
    start_index: usize,
    commit_hash: u32,
) -> Option<Layout> {
    if participants.is_empty() {
        return None;
    }

    let total_weight: u64 = participants.iter().map(|w| w.chunks).sum();
    let total_weight = total_weight.max(1);
    let chunk_size = (1u64 << 32) / total_weight;

    let n = participants.len();
    let mut segments = Vec::with_capacity(n);
    let mut cursor: u64 = 0;
    for i in 0..n {
        let p = &participants[(start_index + i) % n];
        let size = (p.chunks.max(1)) * chunk_size;
        let start = cursor as u32;
        let stop = if i == n - 1 {
            u32::MAX
        } else {
            (cursor + size).min(u32::MAX as u64) as u32
        };
        segments.push(Segment {
            start,
            stop,
            subvol: p.subvol,
            err: Errno::SUCCESS,
            commit_hash,
        });
        cursor += size;
    }

    Some(Layout::new(segments))
}

/// In-place layout refresh that preserves placement as much as possible (§4.2
/// "Fix-layout"). `new` is a freshly assigned layout over the current participant set;
/// this permutes which participant ends up with which hash range so as to maximize the
/// fraction retained from `old`.
///
/// O(N^2) on the subvolume count via a diagonal-maximizing overlap matrix, matching the
/// greedy pairwise-swap procedure described for this engine.
pub fn fix_layout(old: &Layout, mut new: Layout) -> Layout {
    let k = new.segments.len();
    if k < 2 {
        return new;
    }

    let mut m: Vec<Vec<i64>> = vec![vec![0; k]; k];
    for i in 0..k {
        for j in 0..k {
            let old_range = old.range_for_subvol(new.segments[j].subvol);
            m[i][j] = new.segments[i].overlap_with(old_range) as i64;
        }
    }

    for i in 0..k {
        let mut best_j = None;
        let mut best_margin = 0i64;
        for j in (i + 1)..k {
            let delta = (m[i][j] + m[j][i]) - (m[i][i] + m[j][j]);
            if delta > best_margin {
                best_margin = delta;
                best_j = Some(j);
            }
        }
        if let Some(j) = best_j {
            new.segments.swap(i, j);
            m.swap(i, j);
        }
    }

    new
}

/// Fraction of the hash space (`[0, 2^32)`) for which `new`'s placement matches `old`'s,
/// used by tests asserting §8 property 2 (retained-placement optimality).
pub fn retained_placement_fraction(old: &Layout, new: &Layout) -> f64 {
    let retained: u64 = new
        .segments
        .iter()
        .map(|s| s.overlap_with(old.range_for_subvol(s.subvol)))
        .sum();
    retained as f64 / (1u64 << 32) as f64
}

// ---------------------------------------------------------------------------
// Directory stat merge (§4.2 "Stat merge")
// ---------------------------------------------------------------------------

/// Canonical block-count a directory reports after merge, since real directory size is
/// meaningless across a fan-out.
pub const DIR_STAT_SIZE: u64 = 4096;

/// The subset of `struct stat` fields the dispatcher merges across a directory fan-out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(serde::Serialize, serde::Deserialize))]
pub struct DirStat {
    pub size: u64,
    pub blocks: u64,
    pub uid: u32,
    pub gid: u32,
    pub atime: (i64, u32),
    pub mtime: (i64, u32),
    pub ctime: (i64, u32),
    pub gfid: [u8; 16],
    pub file_type: u32,
    pub mode: u32,
    pub nlink: u32,
    pub dev: u64,
}

/// Merges per-child `iatt` replies for a directory fan-out (§4.2, §8 example 6).
///
/// `children` must contain only successful replies (the dispatcher filters `ENOENT`
/// children out before calling this). Panics if `children` is empty — a fan-out with no
/// successful replies never reaches stat-merge; the caller short-circuits on the error.
pub fn merge_dir_stats(children: &[DirStat]) -> DirStat {
    assert!(!children.is_empty(), "merge_dir_stats requires at least one reply");

    let first = children[0];
    let mut merged = DirStat {
        size: 0,
        blocks: 0,
        uid: 0,
        gid: 0,
        atime: (i64::MIN, 0),
        mtime: (i64::MIN, 0),
        ctime: (i64::MIN, 0),
        gfid: first.gfid,
        file_type: first.file_type,
        mode: first.mode,
        nlink: first.nlink,
        dev: first.dev,
    };

    for c in children {
        merged.size += c.size;
        merged.blocks += c.blocks;
        merged.uid = merged.uid.max(c.uid);
        merged.gid = merged.gid.max(c.gid);
        merged.atime = merged.atime.max(c.atime);
        merged.mtime = merged.mtime.max(c.mtime);
        merged.ctime = merged.ctime.max(c.ctime);
    }

    merged.size = DIR_STAT_SIZE;
    merged
}
