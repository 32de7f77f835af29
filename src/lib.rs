//! # depotsync - Chunked Content Depot Synchronizer
//!
//! depotsync brings a local directory to a given version (manifest) of a
//! content depot. Files are described as lists of content-addressed chunks;
//! chunks already present locally are reused, the rest are downloaded through
//! a self-replenishing pool of content servers.
//!
//! An interrupted sync leaves an "incomplete" marker in the install's
//! bookkeeping directory, so the next run re-validates everything instead of
//! trusting the previous manifest.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use depotsync::{LocalDepot, Services, SyncBuilder};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let depot = Arc::new(LocalDepot::open("./store".as_ref())?);
//!     let engine = SyncBuilder::new(Services::from_backend(depot))
//!         .max_downloads(8)
//!         .on_progress(|event| println!("{:?}", event))
//!         .build()?;
//!
//!     let summary = engine
//!         .start_sync(480, 481, 1001, "./game".as_ref(), &CancellationToken::new())
//!         .await?;
//!     println!("Downloaded {} bytes", summary.compressed_bytes);
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod config;
pub mod error;
pub mod fetch;
pub mod logging;
pub mod manifest;
pub mod pool;
pub mod progress;
pub mod reconcile;
pub mod remote;
pub mod session;
pub mod state;
pub mod sync;
pub mod types;

// Re-export commonly used types
pub use config::{Config, PoolConfig};
pub use error::{ManifestError, PoolError, StateError, SyncError};
pub use progress::{CliProgressCallback, SyncEvent, SyncPhase, SyncProgressCallback};
pub use remote::{FetchError, LocalDepot, Services};
pub use state::{InstalledVersion, InstalledVersionStore};
pub use sync::{DepotSync, SyncBuilder, SyncSummary};
pub use types::{
	AppId, ChunkEntry, ChunkId, DepotId, FileEntry, FileKind, Manifest, ManifestId,
	ServerEndpoint, ServerKind,
};

// vim: ts=4
