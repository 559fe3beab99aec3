//! # Strom Core
//!
//! Per-folder synchronization controller for the Strom peer-to-peer file
//! synchronizer. Each [`folder::FolderController`] owns one shared folder:
//! it detects local changes, reconciles them with the index, and drives the
//! external puller that fetches missing content from peers.
//!
//! The controller orchestrates; it does not walk directories, hash blocks,
//! speak the wire protocol or persist index entries itself. Those
//! collaborators are consumed through the traits in [`index`], [`walker`],
//! [`ignore`], [`puller`], [`versioner`] and [`vfs`], so hosts and tests can
//! wire in their own implementations.
//!
//! ## Structure
//!
//! - [`folder`]: the controller: event loop, scan pipeline, pull
//!   scheduling, watch supervision, forced-rescan bookkeeping
//! - [`index`]: file set contract plus the in-memory implementation
//! - [`vfs`]: filesystem abstraction (tokio + notify backed, or in-memory)
//! - [`limiter`]: the process-wide heavy-I/O semaphore
//! - [`events`]: the observability event surface

pub mod config;
pub mod error;
pub mod events;
pub mod folder;
pub mod host;
pub mod ignore;
pub mod index;
pub mod limiter;
pub mod paths;
pub mod puller;
pub mod versioner;
pub mod vfs;
pub mod walker;

pub use config::{FolderConfig, FolderType};
pub use error::{Result, SyncError};
pub use folder::{ControllerDeps, FolderController};
pub use limiter::IoLimiter;

/// Re-exported shared types.
pub use strom_model as model;
