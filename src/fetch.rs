//! Chunk download through leased connections
//!
//! A chunk is retried on fresh leases until it arrives or the session is
//! cancelled. Transport failures only cost the lease; an authorization
//! rejection cancels the whole session since no endpoint will accept the
//! same credentials.

use std::sync::Arc;
use std::time::Duration;

use crate::checksum::adler32;
use crate::error::{PoolError, SyncError};
use crate::logging::*;
use crate::reconcile::FileSink;
use crate::remote::{ChunkSource, FetchError};
use crate::session::SyncSession;
use crate::types::ChunkEntry;

pub struct ChunkFetcher {
	session: Arc<SyncSession>,
	source: Arc<dyn ChunkSource>,
	depot_key: Arc<[u8]>,
	request_timeout: Duration,
}

impl ChunkFetcher {
	pub fn new(
		session: Arc<SyncSession>,
		source: Arc<dyn ChunkSource>,
		depot_key: Arc<[u8]>,
		request_timeout: Duration,
	) -> Self {
		ChunkFetcher { session, source, depot_key, request_timeout }
	}

	/// Download `chunk` and write it at its offset into `sink`
	///
	/// Returns `SyncError::Cancelled` once the session is cancelled; the cause
	/// is recorded on the session.
	pub async fn fetch(&self, chunk: &ChunkEntry, sink: &FileSink) -> Result<(), SyncError> {
		let session = &self.session;
		let cancel = session.token();

		let data = loop {
			if cancel.is_cancelled() {
				return Err(SyncError::Cancelled);
			}

			let lease = match session.pool().acquire(session.app_id, session.depot_id, cancel).await {
				Ok(lease) => lease,
				Err(PoolError::Authorization(e)) => {
					session.abort(SyncError::Authorization {
						message: format!("no token for depot {}: {}", session.depot_id, e),
					});
					return Err(SyncError::Cancelled);
				}
				Err(_) => return Err(SyncError::Cancelled),
			};

			let result = tokio::select! {
				_ = cancel.cancelled() => {
					session.pool().release(lease, true);
					return Err(SyncError::Cancelled);
				}
				r = tokio::time::timeout(
					self.request_timeout,
					self.source.download_chunk(
						session.depot_id,
						chunk,
						&lease.endpoint,
						&lease.token,
						&self.depot_key,
					),
				) => r.unwrap_or(Err(FetchError::Timeout)),
			};

			match result.and_then(|data| verify(chunk, data)) {
				Ok(data) => {
					session.pool().release(lease, true);
					break data;
				}
				Err(e) if e.is_auth_rejection() => {
					warn!("Encountered {} for chunk {}, aborting", e, chunk.id);
					let message = format!("chunk {} on {}: {}", chunk.id, lease.endpoint.host, e);
					session.pool().release(lease, false);
					session.abort(SyncError::Authorization { message });
					return Err(SyncError::Cancelled);
				}
				Err(e) => {
					warn!(
						"Encountered error downloading chunk {} from {}: {}",
						chunk.id, lease.endpoint.host, e
					);
					session.pool().release(lease, false);
				}
			}
		};

		sink.write_at(chunk.offset, &data).await?;
		session
			.counters
			.add_downloaded(chunk.compressed_length as u64, chunk.uncompressed_length as u64);
		debug!("Chunk {} written at {} in {}", chunk.id, chunk.offset, sink.path().display());
		Ok(())
	}
}

/// Reject payloads that do not match the descriptor
fn verify(chunk: &ChunkEntry, data: Vec<u8>) -> Result<Vec<u8>, FetchError> {
	if data.len() != chunk.uncompressed_length as usize {
		return Err(FetchError::transport(format!(
			"chunk {} has {} bytes, expected {}",
			chunk.id,
			data.len(),
			chunk.uncompressed_length
		)));
	}
	if adler32(&data) != chunk.checksum {
		return Err(FetchError::transport(format!("chunk {} failed checksum", chunk.id)));
	}
	Ok(data)
}


// vim: ts=4
