use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identity of a device participating in a share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub Uuid);

impl DeviceId {
    /// The local device in index addressing. Every controller stores its own
    /// rows under this sentinel; remote rows are keyed by real ids.
    pub const LOCAL: DeviceId = DeviceId(Uuid::nil());

    pub fn new() -> Self {
        DeviceId(Uuid::now_v7())
    }

    /// Compact stamp used on index entries instead of the full id.
    pub fn short(&self) -> ShortDeviceId {
        let bytes = self.0.as_bytes();
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[..8]);
        ShortDeviceId(u64::from_be_bytes(buf))
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Truncated device identity stamped on index entries as `modified_by`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ShortDeviceId(pub u64);

impl fmt::Display for ShortDeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_id_is_stable() {
        let id = DeviceId::new();
        assert_eq!(id.short(), id.short());
        assert_ne!(id.short(), DeviceId::LOCAL.short());
    }
}
