use std::fmt;

use serde::{Deserialize, Serialize};

use crate::flags;
use crate::ids::ShortDeviceId;
use crate::version::Version;

/// Entry kind as recorded in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    File,
    Directory,
    Symlink,
}

/// Hash over the concatenated block hashes of a file, used for cheap
/// same-content lookups (rename detection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlocksHash(pub [u8; 32]);

impl fmt::Display for BlocksHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..8] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// One index entry: everything the local device knows about a path, for one
/// device's view of the folder.
///
/// `name` is the folder-relative path with `/` separators, never empty and
/// never absolute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub name: String,
    pub kind: FileKind,
    pub size: u64,
    /// Modification time, nanoseconds since the epoch.
    pub modified_ns: i64,
    pub permissions: u32,
    pub deleted: bool,
    pub version: Version,
    pub sequence: u64,
    pub blocks_hash: Option<BlocksHash>,
    pub block_count: u32,
    pub local_flags: u32,
    pub modified_by: ShortDeviceId,
}

impl FileRecord {
    pub fn new(name: impl Into<String>, kind: FileKind) -> Self {
        Self {
            name: name.into(),
            kind,
            size: 0,
            modified_ns: 0,
            permissions: 0o644,
            deleted: false,
            version: Version::new(),
            sequence: 0,
            blocks_hash: None,
            block_count: 0,
            local_flags: 0,
            modified_by: ShortDeviceId::default(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_directory(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == FileKind::Symlink
    }

    pub fn is_ignored(&self) -> bool {
        self.local_flags & flags::FLAG_LOCAL_IGNORED != 0
    }

    pub fn is_unsupported(&self) -> bool {
        self.local_flags & flags::FLAG_LOCAL_UNSUPPORTED != 0
    }

    pub fn is_receive_only_changed(&self) -> bool {
        self.local_flags & flags::FLAG_LOCAL_RECEIVE_ONLY != 0
    }

    pub fn must_rescan(&self) -> bool {
        self.local_flags & flags::FLAG_LOCAL_MUST_RESCAN != 0
    }

    /// Invalid entries never win global-version election and are not
    /// announced as content.
    pub fn is_invalid(&self) -> bool {
        self.local_flags & flags::FLAG_LOCAL_INVALID != 0
    }

    /// An entry whose content must not replace the global version in a
    /// conflict (it is invalid or unsupported on this device).
    pub fn should_conflict(&self) -> bool {
        self.is_invalid()
    }

    pub fn has_blocks(&self) -> bool {
        self.blocks_hash.is_some() && self.block_count > 0
    }

    /// Turn the entry into a local deletion stamped by `by`.
    pub fn set_deleted(&mut self, by: ShortDeviceId) {
        self.deleted = true;
        self.size = 0;
        self.blocks_hash = None;
        self.block_count = 0;
        self.version.update(by);
        self.modified_by = by;
    }

    /// Mark the entry for unconditional re-hashing on the next scan.
    pub fn set_must_rescan(&mut self, by: ShortDeviceId) {
        self.local_flags |= flags::FLAG_LOCAL_MUST_RESCAN;
        self.modified_by = by;
    }

    /// The entry as it is recorded once its path matches the ignore patterns:
    /// content dropped, flagged ignored, stamped by `by`.
    pub fn into_ignored(mut self, by: ShortDeviceId) -> FileRecord {
        self.blocks_hash = None;
        self.block_count = 0;
        self.local_flags = flags::FLAG_LOCAL_IGNORED;
        self.modified_by = by;
        self
    }

    /// The entry as it is recorded once the path has disappeared from disk.
    pub fn into_deleted(mut self, by: ShortDeviceId) -> FileRecord {
        self.set_deleted(by);
        self
    }

    /// Content equivalence modulo the local-flag bits in `ignore_flags`.
    /// Versions are deliberately not compared; this is the check behind
    /// adopting the global version for an identical local file.
    pub fn is_equivalent_ignoring(
        &self,
        other: &FileRecord,
        mod_time_window_ns: i64,
        ignore_flags: u32,
    ) -> bool {
        if self.name != other.name
            || self.kind != other.kind
            || self.deleted != other.deleted
            || self.invalid_ignoring(ignore_flags) != other.invalid_ignoring(ignore_flags)
        {
            return false;
        }
        if self.kind == FileKind::File && !self.deleted {
            if self.size != other.size
                || self.blocks_hash != other.blocks_hash
                || !mtime_within(self.modified_ns, other.modified_ns, mod_time_window_ns)
            {
                return false;
            }
        }
        self.permissions == other.permissions
    }

    fn invalid_ignoring(&self, mask: u32) -> bool {
        self.local_flags & flags::FLAG_LOCAL_INVALID & !mask != 0
    }
}

fn mtime_within(a: i64, b: i64, window_ns: i64) -> bool {
    (a - b).abs() <= window_ns
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::FLAG_LOCAL_RECEIVE_ONLY;

    fn record(name: &str) -> FileRecord {
        let mut r = FileRecord::new(name, FileKind::File);
        r.size = 10;
        r.modified_ns = 1_000;
        r.blocks_hash = Some(BlocksHash([7; 32]));
        r.block_count = 1;
        r
    }

    #[test]
    fn set_deleted_bumps_version_and_drops_content() {
        let by = ShortDeviceId(42);
        let mut r = record("a");
        let old = r.version.clone();
        r.set_deleted(by);
        assert!(r.deleted);
        assert_eq!(r.size, 0);
        assert!(r.blocks_hash.is_none());
        assert_ne!(r.version, old);
        assert_eq!(r.modified_by, by);
    }

    #[test]
    fn equivalence_ignores_masked_flags() {
        let a = record("a");
        let mut b = record("a");
        b.local_flags = FLAG_LOCAL_RECEIVE_ONLY;
        assert!(!a.is_equivalent_ignoring(&b, 0, 0));
        assert!(a.is_equivalent_ignoring(&b, 0, FLAG_LOCAL_RECEIVE_ONLY));
    }

    #[test]
    fn equivalence_respects_mod_time_window() {
        let a = record("a");
        let mut b = record("a");
        b.modified_ns = a.modified_ns + 1_500_000_000;
        assert!(!a.is_equivalent_ignoring(&b, 0, 0));
        assert!(a.is_equivalent_ignoring(&b, 2_000_000_000, 0));
    }
}
