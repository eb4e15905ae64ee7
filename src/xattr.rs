//! Persisted state: the three extended attributes this core owns, and their wire
//! encodings (§6 "External Interfaces").

use zerocopy::byteorder::big_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::layout::Segment;
use crate::subvolume::SubvolId;

/// Directory layout xattr: one 16-byte record per subvolume per directory.
pub const XATTR_LAYOUT: &str = "trusted.glusterfs.dht";
/// Metadata-authoritative-subvolume xattr: a `u32` subvolume id, or zero once cleared.
pub const XATTR_MDS: &str = "trusted.glusterfs.dht.mds";
/// Historical out-of-band file-size-passing key.
pub const XATTR_CRYPT_SIZE: &str = "trusted.glusterfs.crypt.att.size";

/// Builds the translator-instance-specific linkto xattr key (§6).
pub fn linkto_xattr_key(instance_name: &str) -> String {
    format!("trusted.glusterfs.{instance_name}.linkto")
}

/// Internal dict key marking an operation as issued by the self-healer, so lower layers
/// relax their normal gating.
pub const GF_INTERNAL_CTX_KEY: &str = "dht.internal.ctx";
/// Value carried under [`GF_INTERNAL_CTX_KEY`] to mark a heal-issued operation.
pub const GF_DHT_HEAL_DIR: &str = "heal-dir";
/// Request key asking a lower layer to reconstruct the full pathname of an inode.
pub const GET_ANCESTRY_PATH: &str = "get-ancestry-path";
/// Client-supplied gfid, passed so a healer-issued `mkdir` creates the directory with the
/// same gfid as its siblings rather than a fresh one.
pub const GFID_REQ: &str = "gfid-req";

/// Version tag of the on-disk layout record. Only version 1 is understood; anything else
/// is a hard decode error so a future format change fails loudly instead of silently
/// misinterpreting bytes.
pub const LAYOUT_RECORD_VERSION: u32 = 1;

/// The exact 16-byte, big-endian on-disk representation of one [`Segment`]
/// (§4.3 step 6, §6, §8 "round-trip" law).
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoBytes, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct LayoutRecord {
    pub record_type: U32,
    pub start: U32,
    pub stop: U32,
    pub commit_hash: U32,
}

impl LayoutRecord {
    pub fn from_segment(segment: &Segment) -> Self {
        LayoutRecord {
            record_type: U32::new(LAYOUT_RECORD_VERSION),
            start: U32::new(segment.start),
            stop: U32::new(segment.stop),
            commit_hash: U32::new(segment.commit_hash),
        }
    }

    /// A zero-range placeholder for a subvolume that carries directory metadata but no
    /// placement share (§4.3 step 6: "for every subvolume in the child list but not in
    /// the layout, write a zero-range record").
    pub fn zero_range(commit_hash: u32) -> Self {
        LayoutRecord {
            record_type: U32::new(LAYOUT_RECORD_VERSION),
            start: U32::new(0),
            stop: U32::new(0),
            commit_hash: U32::new(commit_hash),
        }
    }

    pub fn to_bytes(self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out.copy_from_slice(self.as_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        LayoutRecord::read_from_bytes(bytes).ok()
    }

    pub fn to_segment(self, subvol: SubvolId, errno: crate::errno::Errno) -> Segment {
        Segment {
            start: self.start.get(),
            stop: self.stop.get(),
            subvol,
            err: errno,
            commit_hash: self.commit_hash.get(),
        }
    }
}

/// Parses a [`linkto_xattr_key`] value: the destination subvolume's name, stored as a
/// null-terminated string on disk but handed to us already decoded as UTF-8.
pub fn parse_linkto_value(raw: &[u8]) -> Option<&str> {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    std::str::from_utf8(&raw[..end]).ok().filter(|s| !s.is_empty())
}

/// Mode bits identifying a linkto stub: sticky + setgid, with zero size (§3, §6).
pub fn is_linkto_mode(mode: u32) -> bool {
    const LINKTO_BITS: u32 = libc::S_ISVTX as u32 | libc::S_ISGID as u32;
    mode & LINKTO_BITS == LINKTO_BITS
}

/// Value meaning "no MDS recorded" — either never set, or reset after a successful heal
/// clears the dirty bit (§4.3 step 5).
pub const MDS_UNSET: u32 = 0;

/// Encodes an [`XATTR_MDS`] value: big-endian `u32`, matching [`LayoutRecord`]'s wire
/// convention for the other xattr this translator owns.
pub fn mds_to_bytes(subvol: SubvolId) -> [u8; 4] {
    U32::new(subvol.0).as_bytes().try_into().expect("U32 is 4 bytes")
}

/// Decodes an [`XATTR_MDS`] value. Any length other than 4 bytes, or a value equal to
/// [`MDS_UNSET`], decodes to `None`.
pub fn mds_from_bytes(raw: &[u8]) -> Option<SubvolId> {
    let value = U32::read_from_bytes(raw).ok()?.get();
    (value != MDS_UNSET).then_some(SubvolId(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errno::Errno;

    #[test]
    fn layout_record_round_trips() {
        let seg = Segment {
            start: 0x1000_0000,
            stop: 0x2000_0000,
            subvol: SubvolId(3),
            err: Errno::SUCCESS,
            commit_hash: 0xdead_beef,
        };
        let record = LayoutRecord::from_segment(&seg);
        let bytes = record.to_bytes();
        assert_eq!(bytes.len(), 16);
        // big-endian: the top byte of commit_hash (0xde) is the last byte written.
        assert_eq!(bytes[15], 0xef);
        assert_eq!(bytes[12], 0xde);

        let decoded = LayoutRecord::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, record);
        let round_tripped = decoded.to_segment(seg.subvol, seg.err);
        assert_eq!(round_tripped, seg);
    }

    #[test]
    fn linkto_value_strips_nul_terminator() {
        let raw = b"brick-1\0garbage";
        assert_eq!(parse_linkto_value(&raw[..8]), Some("brick-1"));
    }

    #[test]
    fn linkto_mode_detection() {
        let stub_mode = 0o644 | libc::S_ISVTX as u32 | libc::S_ISGID as u32;
        assert!(is_linkto_mode(stub_mode));
        assert!(!is_linkto_mode(0o644));
    }

    #[test]
    fn linkto_key_is_instance_scoped() {
        assert_eq!(linkto_xattr_key("dht-vol0"), "trusted.glusterfs.dht-vol0.linkto");
    }

    #[test]
    fn mds_xattr_round_trips() {
        let bytes = mds_to_bytes(SubvolId(7));
        assert_eq!(mds_from_bytes(&bytes), Some(SubvolId(7)));
    }

    #[test]
    fn mds_xattr_zero_decodes_to_unset() {
        let bytes = mds_to_bytes(SubvolId(MDS_UNSET));
        assert_eq!(mds_from_bytes(&bytes), None);
        assert_eq!(mds_from_bytes(&[]), None);
    }
}
