//! Manifest persistence and per-file diffing

pub mod diff;
pub mod store;

pub use diff::{ChunkMatch, FilePlan, ManifestDiffer};
pub use store::ManifestCache;

// vim: ts=4
