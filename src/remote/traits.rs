//! Interfaces of the remote collaborators
//!
//! The sync engine never talks to the network directly. Server discovery,
//! authorization, manifest and chunk retrieval are all reached through these
//! traits, so that the engine can be driven by a real content network, by
//! [`LocalDepot`](super::LocalDepot), or by test doubles.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::error::FetchError;
use crate::types::{AppId, ChunkEntry, DepotId, Manifest, ManifestId, ServerEndpoint};

/// Result type for remote operations
pub type FetchResult<T> = Result<T, FetchError>;

/// Enumerates candidate content servers
#[async_trait]
pub trait DirectoryService: Send + Sync {
	/// Fetch the raw candidate list for a cell
	///
	/// `FetchError::RateLimited` makes the caller back off before retrying.
	async fn list_endpoints(
		&self,
		cell_id: u32,
		cancel: &CancellationToken,
	) -> FetchResult<Vec<ServerEndpoint>>;

	/// Whether the underlying session is still connected
	fn is_connected(&self) -> bool {
		true
	}
}

/// Hands out authorization material; both calls are idempotent
#[async_trait]
pub trait AuthService: Send + Sync {
	/// Decryption key of a depot, `None` if the account has no access
	async fn depot_key(&self, depot_id: DepotId, app_id: AppId) -> FetchResult<Option<Vec<u8>>>;

	/// Access token for a depot on a top-level host
	async fn resource_auth_token(
		&self,
		app_id: AppId,
		depot_id: DepotId,
		top_level_host: &str,
	) -> FetchResult<Option<String>>;
}

#[async_trait]
pub trait ManifestSource: Send + Sync {
	async fn download_manifest(
		&self,
		depot_id: DepotId,
		manifest_id: ManifestId,
		endpoint: &ServerEndpoint,
		token: &str,
		depot_key: &[u8],
	) -> FetchResult<Manifest>;
}

#[async_trait]
pub trait ChunkSource: Send + Sync {
	/// Download and decode one chunk, returning its uncompressed bytes
	async fn download_chunk(
		&self,
		depot_id: DepotId,
		chunk: &ChunkEntry,
		endpoint: &ServerEndpoint,
		token: &str,
		depot_key: &[u8],
	) -> FetchResult<Vec<u8>>;
}

/// The full set of collaborators a sync needs
#[derive(Clone)]
pub struct Services {
	pub directory: Arc<dyn DirectoryService>,
	pub auth: Arc<dyn AuthService>,
	pub manifests: Arc<dyn ManifestSource>,
	pub chunks: Arc<dyn ChunkSource>,
}

impl Services {
	/// Use one object for every role
	pub fn from_backend<T>(backend: Arc<T>) -> Self
	where
		T: DirectoryService + AuthService + ManifestSource + ChunkSource + 'static,
	{
		Services {
			directory: backend.clone(),
			auth: backend.clone(),
			manifests: backend.clone(),
			chunks: backend,
		}
	}
}

// vim: ts=4
