//! Contract of the durable index (file set).
//!
//! The index engine itself is a sibling subsystem; controllers consume it
//! through these traits. Snapshots are point-in-time consistent views whose
//! resources are released on drop.

pub mod memory;

use strom_model::{BlocksHash, DeviceId, FileRecord};

pub trait FileSet: Send + Sync {
    /// A consistent view of the index as of now.
    fn snapshot(&self) -> Box<dyn IndexSnapshot>;

    /// Commit a batch of entries for one device's view. Sequence numbers are
    /// assigned by the index.
    fn update(&self, device: DeviceId, records: Vec<FileRecord>);

    /// Highest sequence number committed for the device.
    fn sequence(&self, device: DeviceId) -> u64;
}

pub trait IndexSnapshot: Send + Sync {
    fn get(&self, device: DeviceId, name: &str) -> Option<FileRecord>;

    /// The reconciled best-known version for a path across all devices.
    fn get_global(&self, name: &str) -> Option<FileRecord>;

    /// Entries the device has, restricted to a prefix (empty prefix means
    /// everything), ordered by name.
    fn have_prefixed<'a>(
        &'a self,
        device: DeviceId,
        prefix: &str,
    ) -> Box<dyn Iterator<Item = FileRecord> + 'a>;

    /// Entries the device lacks or has in an older version than the global
    /// view.
    fn need<'a>(&'a self, device: DeviceId) -> Box<dyn Iterator<Item = FileRecord> + 'a>;

    /// Local entries sharing a blocks hash, for rename detection.
    fn with_blocks_hash<'a>(
        &'a self,
        hash: &BlocksHash,
    ) -> Box<dyn Iterator<Item = FileRecord> + 'a>;

    /// Remote devices that hold a valid, present copy of the path.
    fn availability(&self, name: &str) -> Vec<DeviceId>;
}
