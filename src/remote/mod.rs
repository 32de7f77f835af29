//! Remote collaborators: server directory, authorization, manifest and chunk
//! retrieval

mod error;
mod local_depot;
mod traits;

pub use error::FetchError;
pub use local_depot::LocalDepot;
pub use traits::{
	AuthService, ChunkSource, DirectoryService, FetchResult, ManifestSource, Services,
};

// vim: ts=4
