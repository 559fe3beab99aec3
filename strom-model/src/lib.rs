//! Shared data types for the Strom synchronizer.
//!
//! Plain data only: device identities, index entries, version vectors and the
//! local-flag bits stamped on entries. All I/O and behavior lives in
//! `strom-core` and its sibling subsystems.

pub mod files;
pub mod flags;
pub mod ids;
pub mod version;

pub use files::{BlocksHash, FileKind, FileRecord};
pub use ids::{DeviceId, ShortDeviceId};
pub use version::{Version, VersionOrdering};
