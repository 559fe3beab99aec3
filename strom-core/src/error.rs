use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("folder path missing or not a directory: {0}")]
    PathMissing(String),

    #[error("insufficient space on database disk: {free} B free, {required} B required")]
    InsufficientSpace { free: u64, required: u64 },

    #[error("loading ignore patterns: {0}")]
    LoadIgnores(String),

    #[error("filesystem watcher: {0}")]
    Watch(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;
