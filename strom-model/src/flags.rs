//! Local-only flag bits carried on index entries.
//!
//! These bits never leave the device; they mark conditions the local instance
//! has to remember about an entry (ignored, pending re-hash, a receive-only
//! local modification, or an unsupported entry type).

/// Entry type is not supported on this device (e.g. symlinks on some
/// platforms). The entry is kept but treated as invalid.
pub const FLAG_LOCAL_UNSUPPORTED: u32 = 1 << 0;

/// Entry matches the ignore patterns.
pub const FLAG_LOCAL_IGNORED: u32 = 1 << 1;

/// Entry must be re-hashed on the next scan regardless of metadata.
pub const FLAG_LOCAL_MUST_RESCAN: u32 = 1 << 2;

/// Entry was changed locally in a receive-only folder and must not win
/// against the global version.
pub const FLAG_LOCAL_RECEIVE_ONLY: u32 = 1 << 3;

/// Flags that make an entry invalid for global-version election.
pub const FLAG_LOCAL_INVALID: u32 =
    FLAG_LOCAL_UNSUPPORTED | FLAG_LOCAL_IGNORED | FLAG_LOCAL_MUST_RESCAN | FLAG_LOCAL_RECEIVE_ONLY;

/// Every local flag bit.
pub const FLAG_LOCAL_ALL: u32 = FLAG_LOCAL_INVALID;
