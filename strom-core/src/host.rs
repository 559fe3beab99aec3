//! The narrow surface a controller needs from its parent model.

/// Free and total bytes on a filesystem.
#[derive(Debug, Clone, Copy)]
pub struct DiskUsage {
    pub free: u64,
    pub total: u64,
}

/// Non-owning handle to the parent model. The model owns the controller via
/// its folder registry; the controller only ever sees this trait.
pub trait ControllerHost: Send + Sync {
    /// Called once when the controller's event loop starts.
    fn folder_started(&self);

    /// Called once when the event loop exits.
    fn folder_stopped(&self);

    /// Disk usage of the filesystem holding the index database.
    fn database_usage(&self) -> std::io::Result<DiskUsage>;

    /// Minimum free bytes required on the database disk for scans and pulls
    /// to proceed.
    fn min_database_free(&self) -> u64;
}
