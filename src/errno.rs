//! Errno values used throughout the dispatcher, layout engine and self-heal code.
//!
//! The core never invents its own error codes for filesystem-visible failures: it
//! reuses the raw `errno(3)` values a backend subvolume would return, plus a small
//! set of sentinels (see [`Errno::EUCLEAN`], [`Errno::LAYOUT_NOT_SET`]) that never
//! escape to a caller.

use std::fmt;

/// A raw errno value, signed as the kernel/libc convention requires.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Default)]
#[cfg_attr(feature = "serializable", derive(serde::Serialize, serde::Deserialize))]
#[repr(transparent)]
pub struct Errno(pub i32);

impl Errno {
    /// No error.
    pub const SUCCESS: Errno = Errno(0);
    /// Sentinel meaning "no reply received yet from this child" — must never reach a caller.
    pub const EUCLEAN: Errno = Errno(libc::EUCLEAN);
    /// Segment has not been assigned a subvolume yet.
    pub const LAYOUT_NOT_SET: Errno = Errno(-1);

    /// Stale file handle or missing entry — the two errnos self-heal and migration-complete
    /// treat as benign races rather than hard failures.
    pub fn is_benign_race(self) -> bool {
        matches!(self.0, libc::ENOENT | libc::ESTALE)
    }

    /// Whether a data-path reply on an already-open fd could mean the file finished
    /// migrating out from under it, and a recovery attempt (§4.1 "On any data-path FOP
    /// whose reply indicates migration") is warranted before surfacing the error. Covers
    /// both the benign-race sentinels and `EBADF`: a reopened-elsewhere destination
    /// makes the fd's original backend descriptor invalid, and the backend reports that
    /// as `EBADF` rather than `ENOENT`/`ESTALE` (spec.md's dht-helper.c reference: "the
    /// fop fails with EBADF").
    pub fn is_migration_sentinel(self) -> bool {
        self.is_benign_race() || self.0 == libc::EBADF
    }

    pub fn is_success(self) -> bool {
        self.0 == 0
    }

    pub fn from_raw(v: i32) -> Errno {
        Errno(v)
    }

    pub fn get(self) -> i32 {
        self.0
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Errno({})", self.0)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            write!(f, "success")
        } else {
            write!(f, "{}", io_error_string(self.0))
        }
    }
}

fn io_error_string(errno: i32) -> String {
    std::io::Error::from_raw_os_error(errno).to_string()
}

impl From<i32> for Errno {
    fn from(v: i32) -> Self {
        Errno(v)
    }
}

impl std::error::Error for Errno {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn benign_race_detection() {
        assert!(Errno(libc::ENOENT).is_benign_race());
        assert!(Errno(libc::ESTALE).is_benign_race());
        assert!(!Errno(libc::EIO).is_benign_race());
        assert!(!Errno::SUCCESS.is_benign_race());
    }

    #[test]
    fn euclean_never_success() {
        assert!(!Errno::EUCLEAN.is_success());
    }

    #[test]
    fn migration_sentinel_covers_ebadf_and_benign_race() {
        assert!(Errno(libc::EBADF).is_migration_sentinel());
        assert!(Errno(libc::ENOENT).is_migration_sentinel());
        assert!(Errno(libc::ESTALE).is_migration_sentinel());
        assert!(!Errno(libc::EIO).is_migration_sentinel());
    }
}
