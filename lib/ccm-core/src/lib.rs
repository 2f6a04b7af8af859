//! Core building blocks shared by the controller crates
//!
//! This library provides:
//! - The error taxonomy of every reconciliation entry point
//! - Tag-encoded ownership of remote resources
//! - Cloud configuration loading
//! - A TTL snapshot cache for bulk listings

pub mod cache;
pub mod config;
pub mod error;
pub mod tags;

pub use cache::{Snapshot, SnapshotCache};
pub use config::CloudConfig;
pub use error::{ApiResultExt, CcmError, Result};
pub use tags::{ClusterTagger, Ownership, Tags};
