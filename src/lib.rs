//! DHT routing translator for a clustered filesystem.
//!
//! This crate is the layer that sits in front of a set of backend storage subvolumes
//! (bricks) and presents them as one unified namespace: files are placed on exactly one
//! subvolume chosen by hashing their name against a per-directory layout, directories
//! exist on every subvolume, and a background rebalance migrates files between
//! subvolumes when the layout changes. Because a file may be *in the process of*
//! migrating while client operations arrive, the routing layer transparently redirects
//! I/O to the correct subvolume, detects migration-in-progress via filesystem metadata,
//! reopens file handles on the destination, and heals divergent directory layouts and
//! extended attributes.
//!
//! The crate is organized around five pieces:
//!   - the hash-range [`layout`] model and its on-disk/in-memory representation,
//!   - per-fd ([`fd_ctx`]) and per-inode ([`inode_ctx`]) context tracking where a file
//!     currently lives and where it was last opened,
//!   - the migration-transparent FOP [`dispatcher`], which resolves subvolumes, fans
//!     out directory operations, and redirects data-path calls around in-flight
//!     migrations,
//!   - the directory [`selfheal`] / fix-layout engine, built on the two-phase
//!     [`lock`] protocol (parent-inode lock + entry lock),
//!   - the [`syncop`] concurrency shim multi-step work (self-heal, rebalance checks)
//!     relies on to run without blocking the caller.
//!
//! A `(subvolume, gfid)` backend is anything implementing [`fop::SubvolumeOps`]; this
//! crate owns none of the storage itself.

#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]

pub mod config;
pub mod dispatcher;
pub mod errno;
pub mod fd_ctx;
pub mod fop;
pub mod hash;
pub mod inode_ctx;
pub mod layout;
pub mod local;
pub mod lock;
pub mod open_flags;
pub mod rebalance;
pub mod selfheal;
pub mod subvolume;
pub mod syncop;
pub mod xattr;

pub use config::{Config, DhtOptions};
pub use dispatcher::Dispatcher;
pub use errno::Errno;
pub use fd_ctx::{FdCtx, FdCtxTable, FdId};
pub use fop::{Attr, Gfid, LookupReply, SetAttrFlags, SubvolumeOps, Xattrs, ROOT_GFID};
pub use hash::name_hash;
pub use inode_ctx::{InodeCtx, InodeCtxTable, InodeId, MigrationInfo};
pub use layout::{assign_layout, fix_layout, merge_dir_stats, Anomalies, DirStat, Layout, Segment, Weight};
pub use local::Local;
pub use lock::{LockBackend, LockManager, LockOwner, LockType};
pub use open_flags::OpenFlags;
pub use rebalance::RebalanceTasks;
pub use selfheal::SelfHealEngine;
pub use subvolume::{SubvolId, Subvolume, SubvolumeSet};
pub use syncop::{current_identity, elevate_to_root, with_identity, Identity, RootIdentityGuard, SyncTask};
