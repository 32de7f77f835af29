//! Error types for depotsync operations

use std::error::Error;
use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::types::{DepotId, ManifestId};

/// Main error type for a depot sync
///
/// Exactly one of these is reported to the caller when a sync does not
/// complete. Transient transport failures never show up here, they are
/// retried inside the chunk fetcher until the session is cancelled.
#[derive(Debug)]
pub enum SyncError {
	/// Local filesystem failure (cannot create, open or write a file)
	Io { path: PathBuf, source: io::Error },

	/// The server rejected our credentials (401/403)
	Authorization { message: String },

	/// No content server could be found
	DirectoryExhausted,

	/// Cancelled by the caller
	Cancelled,

	/// The target manifest could not be obtained
	ManifestUnavailable { depot_id: DepotId, manifest_id: ManifestId },

	/// No decryption key for the depot
	DepotKeyUnavailable { depot_id: DepotId },

	/// Manifest violates its structural invariants
	InvalidManifest { message: String },

	/// Invalid configuration
	InvalidConfig { message: String },

	/// Installed-version record store failure
	State(StateError),
}

impl SyncError {
	pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
		SyncError::Io { path: path.into(), source }
	}
}

impl fmt::Display for SyncError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SyncError::Io { path, source } => {
				write!(f, "I/O error on {}: {}", path.display(), source)
			}
			SyncError::Authorization { message } => {
				write!(f, "Authorization rejected: {}", message)
			}
			SyncError::DirectoryExhausted => write!(f, "No content servers available"),
			SyncError::Cancelled => write!(f, "Operation cancelled"),
			SyncError::ManifestUnavailable { depot_id, manifest_id } => {
				write!(f, "Unable to download manifest {} for depot {}", manifest_id, depot_id)
			}
			SyncError::DepotKeyUnavailable { depot_id } => {
				write!(f, "No valid depot key for {}, unable to download", depot_id)
			}
			SyncError::InvalidManifest { message } => write!(f, "Invalid manifest: {}", message),
			SyncError::InvalidConfig { message } => {
				write!(f, "Invalid configuration: {}", message)
			}
			SyncError::State(e) => write!(f, "State error: {}", e),
		}
	}
}

impl Error for SyncError {
	fn source(&self) -> Option<&(dyn Error + 'static)> {
		match self {
			SyncError::Io { source, .. } => Some(source),
			SyncError::State(e) => Some(e),
			_ => None,
		}
	}
}

impl From<StateError> for SyncError {
	fn from(e: StateError) -> Self {
		SyncError::State(e)
	}
}

impl From<PoolError> for SyncError {
	fn from(e: PoolError) -> Self {
		match e {
			PoolError::Cancelled => SyncError::Cancelled,
			PoolError::ShutDown => SyncError::DirectoryExhausted,
			PoolError::Authorization(e) => SyncError::Authorization { message: e.to_string() },
		}
	}
}

/// Installed-version record store errors
#[derive(Debug)]
pub enum StateError {
	/// Failed to open the record database
	OpenFailed { source: Box<dyn Error + Send + Sync> },

	/// Failed to load a record
	LoadFailed { source: Box<dyn Error + Send + Sync> },

	/// Failed to save a record
	SaveFailed { source: Box<dyn Error + Send + Sync> },

	/// Stored record is corrupted
	Corrupted { message: String },
}

impl fmt::Display for StateError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			StateError::OpenFailed { source } => write!(f, "Failed to open state: {}", source),
			StateError::LoadFailed { source } => write!(f, "Failed to load state: {}", source),
			StateError::SaveFailed { source } => write!(f, "Failed to save state: {}", source),
			StateError::Corrupted { message } => write!(f, "State corrupted: {}", message),
		}
	}
}

impl Error for StateError {}

/// Integrity failures of cached manifests
///
/// These are recovered locally by treating the cache entry as absent.
#[derive(Debug)]
pub enum ManifestError {
	/// Blob or sidecar missing
	Missing { path: PathBuf },

	/// Sidecar digest does not match the blob
	ChecksumMismatch { expected: String, actual: String },

	/// Blob could not be decoded
	Corrupt { message: String },

	/// I/O error while reading or writing the cache
	Io(io::Error),
}

impl fmt::Display for ManifestError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ManifestError::Missing { path } => write!(f, "{} not found", path.display()),
			ManifestError::ChecksumMismatch { expected, actual } => {
				write!(f, "Checksum mismatch: expected {}, got {}", expected, actual)
			}
			ManifestError::Corrupt { message } => write!(f, "Corrupt manifest: {}", message),
			ManifestError::Io(e) => write!(f, "I/O error: {}", e),
		}
	}
}

impl Error for ManifestError {}

impl From<io::Error> for ManifestError {
	fn from(e: io::Error) -> Self {
		ManifestError::Io(e)
	}
}

/// Connection lease acquisition errors
#[derive(Debug, Clone)]
pub enum PoolError {
	/// The session was cancelled while waiting for an endpoint
	Cancelled,

	/// The pool has been shut down
	ShutDown,

	/// Authorization for the resource was refused
	Authorization(crate::remote::FetchError),
}

impl fmt::Display for PoolError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			PoolError::Cancelled => write!(f, "Cancelled while waiting for a connection"),
			PoolError::ShutDown => write!(f, "Server pool shut down"),
			PoolError::Authorization(e) => write!(f, "Authorization failed: {}", e),
		}
	}
}

impl Error for PoolError {}


// vim: ts=4
