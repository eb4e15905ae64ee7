//! The filesystem-operation (FOP) interface a backend subvolume presents to this
//! translator, and the attribute type shared across lookup/setattr/stat-merge.
//!
//! This is the "child xlator" seam from the source translator's perspective: every call
//! the dispatcher, self-healer or rebalance tasks make against a subvolume goes through
//! here, so tests can substitute an in-memory fake instead of a real backend.

use std::collections::HashMap;

use async_trait::async_trait;
use bitflags::bitflags;

use crate::errno::Errno;
use crate::layout::DirStat;
use crate::open_flags::OpenFlags;

pub type Gfid = [u8; 16];
pub type Xattrs = HashMap<String, Vec<u8>>;

/// The well-known gfid of a volume's root directory (§4.1 "Subvolume selection").
pub const ROOT_GFID: Gfid = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];

bitflags! {
    /// Which fields of an [`Attr`] a `setattr` call should actually apply.
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct SetAttrFlags: u32 {
        const UID   = 0b0000_0001;
        const GID   = 0b0000_0010;
        const MODE  = 0b0000_0100;
        const ATIME = 0b0000_1000;
        const MTIME = 0b0001_0000;
    }
}

/// Attribute set shared by file and directory replies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(serde::Serialize, serde::Deserialize))]
pub struct Attr {
    pub gfid: Gfid,
    pub size: u64,
    pub blocks: u64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub nlink: u32,
    pub dev: u64,
    pub file_type: u32,
    pub atime: (i64, u32),
    pub mtime: (i64, u32),
    pub ctime: (i64, u32),
}

impl Attr {
    pub fn to_dir_stat(self) -> DirStat {
        DirStat {
            size: self.size,
            blocks: self.blocks,
            uid: self.uid,
            gid: self.gid,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            gfid: self.gfid,
            file_type: self.file_type,
            mode: self.mode,
            nlink: self.nlink,
            dev: self.dev,
        }
    }

    /// Mode-bit pattern marking a linkto stub (§3, §6).
    pub fn is_linkto(&self) -> bool {
        crate::xattr::is_linkto_mode(self.mode)
    }
}

/// Reply to a successful `lookup`.
#[derive(Clone, Debug)]
pub struct LookupReply {
    pub attr: Attr,
    /// Present when the looked-up entry is a linkto stub: the destination subvolume
    /// name parsed from the linkto xattr value.
    pub linkto: Option<String>,
}

/// The async FOP surface a backend subvolume exposes. All signatures mirror the
/// operations named in §4.1 ("lookup, open, read/write, truncate, xattr, flush, locks,
/// rename, unlink, link").
#[async_trait]
pub trait SubvolumeOps: Send + Sync {
    async fn lookup(&self, parent: Gfid, name: &str) -> Result<LookupReply, Errno>;
    async fn lookup_inode(&self, gfid: Gfid) -> Result<LookupReply, Errno>;

    async fn open(&self, gfid: Gfid, flags: OpenFlags) -> Result<u64, Errno>;
    async fn read(&self, backend_fd: u64, offset: u64, size: u32) -> Result<Vec<u8>, Errno>;
    async fn write(&self, backend_fd: u64, offset: u64, data: &[u8]) -> Result<u32, Errno>;
    async fn flush(&self, backend_fd: u64) -> Result<(), Errno>;
    async fn truncate(&self, gfid: Gfid, size: u64) -> Result<(), Errno>;

    async fn unlink(&self, parent: Gfid, name: &str) -> Result<(), Errno>;
    async fn link(&self, gfid: Gfid, new_parent: Gfid, new_name: &str) -> Result<(), Errno>;
    async fn rename(
        &self,
        old_parent: Gfid,
        old_name: &str,
        new_parent: Gfid,
        new_name: &str,
    ) -> Result<(), Errno>;

    async fn mkdir(
        &self,
        parent: Gfid,
        name: &str,
        gfid_req: Option<Gfid>,
        mode: u32,
        heal: bool,
    ) -> Result<Gfid, Errno>;
    async fn rmdir(&self, parent: Gfid, name: &str) -> Result<(), Errno>;
    async fn setattr(&self, gfid: Gfid, attr: Attr, valid: SetAttrFlags) -> Result<(), Errno>;

    async fn getxattr(&self, gfid: Gfid, key: &str) -> Result<Vec<u8>, Errno>;
    async fn setxattr(&self, gfid: Gfid, key: &str, value: &[u8], heal: bool) -> Result<(), Errno>;
    async fn list_user_xattrs(&self, gfid: Gfid) -> Result<Xattrs, Errno>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setattr_flags_compose() {
        let flags = SetAttrFlags::UID | SetAttrFlags::MODE;
        assert!(flags.contains(SetAttrFlags::UID));
        assert!(!flags.contains(SetAttrFlags::GID));
    }

    #[test]
    fn linkto_detection_via_attr() {
        let mut attr = Attr::default();
        attr.mode = 0o644 | libc::S_ISVTX as u32 | libc::S_ISGID as u32;
        assert!(attr.is_linkto());
    }
}
