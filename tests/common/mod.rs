//! Scriptable in-memory depot backend shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use depotsync::checksum::{adler32, chunk_id};
use depotsync::remote::{
	AuthService, ChunkSource, DirectoryService, FetchError, FetchResult, ManifestSource,
};
use depotsync::{
	AppId, ChunkEntry, ChunkId, Config, DepotId, DepotSync, FileEntry, FileKind, Manifest,
	ManifestId, ServerEndpoint, ServerKind, Services, SyncBuilder,
};

pub const APP: AppId = 480;
pub const DEPOT: DepotId = 481;
pub const CHUNK: usize = 1024;

pub struct MockDepot {
	endpoints: Mutex<Vec<ServerEndpoint>>,
	manifests: Mutex<HashMap<(DepotId, ManifestId), Manifest>>,
	chunks: Mutex<HashMap<ChunkId, Vec<u8>>>,
	depots: Mutex<HashSet<DepotId>>,

	/// Directory replies left to answer with 429
	rate_limited: AtomicUsize,
	/// Chunks answered with 403
	forbidden: Mutex<HashSet<ChunkId>>,
	/// Chunks that fail once with 503
	flaky: Mutex<HashSet<ChunkId>>,
	/// Token requests left to fail with a timeout
	token_failures: AtomicUsize,
	/// Fail every chunk with 500 and stop advertising endpoints
	withdraw: AtomicBool,
	chunk_delay: Mutex<Duration>,

	pub directory_calls: AtomicUsize,
	pub token_calls: AtomicUsize,
	pub manifest_calls: AtomicUsize,
	pub forbidden_attempts: AtomicUsize,
	downloads: Mutex<HashMap<ChunkId, usize>>,
}

impl MockDepot {
	pub fn new() -> Arc<Self> {
		Arc::new(MockDepot {
			endpoints: Mutex::new(vec![
				ServerEndpoint::new("cache1.content.test", ServerKind::Cache),
				ServerEndpoint::new("cache2.content.test", ServerKind::Cdn),
			]),
			manifests: Mutex::new(HashMap::new()),
			chunks: Mutex::new(HashMap::new()),
			depots: Mutex::new(HashSet::new()),
			rate_limited: AtomicUsize::new(0),
			forbidden: Mutex::new(HashSet::new()),
			flaky: Mutex::new(HashSet::new()),
			token_failures: AtomicUsize::new(0),
			withdraw: AtomicBool::new(false),
			chunk_delay: Mutex::new(Duration::ZERO),
			directory_calls: AtomicUsize::new(0),
			token_calls: AtomicUsize::new(0),
			manifest_calls: AtomicUsize::new(0),
			forbidden_attempts: AtomicUsize::new(0),
			downloads: Mutex::new(HashMap::new()),
		})
	}

	/// Publish a manifest whose files are given as explicit chunk lists
	pub fn publish_chunked(
		&self,
		depot_id: DepotId,
		manifest_id: ManifestId,
		files: &[(&str, Vec<Vec<u8>>)],
	) -> Manifest {
		let mut entries = Vec::new();
		for (path, pieces) in files {
			entries.push(self.file_entry(path, pieces));
		}
		let mut manifest = Manifest { depot_id, manifest_id, creation_time: 0, files: entries };
		manifest.sort_files();

		self.depots.lock().unwrap().insert(depot_id);
		self.manifests.lock().unwrap().insert((depot_id, manifest_id), manifest.clone());
		manifest
	}

	/// Publish whole files, split into `CHUNK`-sized pieces
	pub fn publish(
		&self,
		depot_id: DepotId,
		manifest_id: ManifestId,
		files: &[(&str, Vec<u8>)],
	) -> Manifest {
		let chunked: Vec<(&str, Vec<Vec<u8>>)> =
			files.iter().map(|(path, content)| (*path, split(content))).collect();
		self.publish_chunked(depot_id, manifest_id, &chunked)
	}

	fn file_entry(&self, path: &str, pieces: &[Vec<u8>]) -> FileEntry {
		let mut offset = 0u64;
		let mut hasher = blake3::Hasher::new();
		let mut chunks = Vec::new();
		for piece in pieces {
			let id = chunk_id(piece);
			self.chunks.lock().unwrap().insert(id, piece.clone());
			hasher.update(piece);
			chunks.push(ChunkEntry {
				id,
				checksum: adler32(piece),
				offset,
				compressed_length: piece.len() as u32,
				uncompressed_length: piece.len() as u32,
			});
			offset += piece.len() as u64;
		}
		FileEntry {
			path: path.to_string(),
			kind: FileKind::File,
			total_size: offset,
			content_hash: *hasher.finalize().as_bytes(),
			chunks,
		}
	}

	pub fn set_endpoints(&self, endpoints: Vec<ServerEndpoint>) {
		*self.endpoints.lock().unwrap() = endpoints;
	}

	pub fn rate_limit(&self, replies: usize) {
		self.rate_limited.store(replies, Ordering::SeqCst);
	}

	pub fn forbid(&self, id: ChunkId) {
		self.forbidden.lock().unwrap().insert(id);
	}

	pub fn fail_once(&self, id: ChunkId) {
		self.flaky.lock().unwrap().insert(id);
	}

	pub fn fail_tokens(&self, requests: usize) {
		self.token_failures.store(requests, Ordering::SeqCst);
	}

	pub fn withdraw_servers(&self, withdraw: bool) {
		self.withdraw.store(withdraw, Ordering::SeqCst);
	}

	pub fn set_chunk_delay(&self, delay: Duration) {
		*self.chunk_delay.lock().unwrap() = delay;
	}

	pub fn downloads_of(&self, id: &ChunkId) -> usize {
		self.downloads.lock().unwrap().get(id).copied().unwrap_or(0)
	}

	pub fn total_downloads(&self) -> usize {
		self.downloads.lock().unwrap().values().sum()
	}
}

pub fn split(content: &[u8]) -> Vec<Vec<u8>> {
	content.chunks(CHUNK).map(|c| c.to_vec()).collect()
}

/// Deterministic pseudo-random bytes (xorshift), distinct per `seed`
pub fn content(seed: u8, len: usize) -> Vec<u8> {
	let mut state = 0x9E37_79B9_7F4A_7C15u64 ^ (seed as u64 + 1).wrapping_mul(0xBF58_476D_1CE4_E5B9);
	(0..len)
		.map(|_| {
			state ^= state << 13;
			state ^= state >> 7;
			state ^= state << 17;
			(state >> 24) as u8
		})
		.collect()
}

pub fn test_config() -> Config {
	let mut config = Config::default();
	config.max_downloads = 4;
	config.pool.poll_interval_ms = 10;
	config.pool.backoff_unit_ms = 5;
	config.pool.minimum_endpoints = 2;
	config.pool.request_timeout_secs = 5;
	config
}

pub fn engine(mock: &Arc<MockDepot>, config: Config) -> DepotSync {
	SyncBuilder::new(Services::from_backend(mock.clone())).config(config).build().unwrap()
}

pub fn assert_file(dir: &Path, rel: &str, expected: &[u8]) {
	let actual = std::fs::read(dir.join(rel)).unwrap();
	assert_eq!(actual.len(), expected.len(), "length of {}", rel);
	assert!(actual == expected, "content of {}", rel);
}

#[async_trait]
impl DirectoryService for MockDepot {
	async fn list_endpoints(
		&self,
		_cell_id: u32,
		_cancel: &CancellationToken,
	) -> FetchResult<Vec<ServerEndpoint>> {
		self.directory_calls.fetch_add(1, Ordering::SeqCst);
		let limited = self
			.rate_limited
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
			.is_ok();
		if limited {
			return Err(FetchError::RateLimited);
		}
		Ok(self.endpoints.lock().unwrap().clone())
	}
}

#[async_trait]
impl AuthService for MockDepot {
	async fn depot_key(&self, depot_id: DepotId, _app_id: AppId) -> FetchResult<Option<Vec<u8>>> {
		let known = self.depots.lock().unwrap().contains(&depot_id);
		Ok(known.then(|| vec![depot_id as u8; 32]))
	}

	async fn resource_auth_token(
		&self,
		_app_id: AppId,
		depot_id: DepotId,
		top_level_host: &str,
	) -> FetchResult<Option<String>> {
		self.token_calls.fetch_add(1, Ordering::SeqCst);
		tokio::time::sleep(Duration::from_millis(10)).await;
		let failing = self
			.token_failures
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
			.is_ok();
		if failing {
			return Err(FetchError::Timeout);
		}
		Ok(Some(format!("{}@{}", depot_id, top_level_host)))
	}
}

#[async_trait]
impl ManifestSource for MockDepot {
	async fn download_manifest(
		&self,
		depot_id: DepotId,
		manifest_id: ManifestId,
		_endpoint: &ServerEndpoint,
		_token: &str,
		_depot_key: &[u8],
	) -> FetchResult<Manifest> {
		self.manifest_calls.fetch_add(1, Ordering::SeqCst);
		self.manifests
			.lock()
			.unwrap()
			.get(&(depot_id, manifest_id))
			.cloned()
			.ok_or(FetchError::Status(404))
	}
}

#[async_trait]
impl ChunkSource for MockDepot {
	async fn download_chunk(
		&self,
		_depot_id: DepotId,
		chunk: &ChunkEntry,
		_endpoint: &ServerEndpoint,
		_token: &str,
		_depot_key: &[u8],
	) -> FetchResult<Vec<u8>> {
		let delay = *self.chunk_delay.lock().unwrap();
		if !delay.is_zero() {
			tokio::time::sleep(delay).await;
		}

		if self.forbidden.lock().unwrap().contains(&chunk.id) {
			self.forbidden_attempts.fetch_add(1, Ordering::SeqCst);
			return Err(FetchError::Forbidden);
		}
		if self.withdraw.load(Ordering::SeqCst) {
			self.endpoints.lock().unwrap().clear();
			return Err(FetchError::Status(500));
		}
		if self.flaky.lock().unwrap().remove(&chunk.id) {
			return Err(FetchError::Status(503));
		}

		let data = self.chunks.lock().unwrap().get(&chunk.id).cloned().ok_or(FetchError::Status(404))?;
		*self.downloads.lock().unwrap().entry(chunk.id).or_insert(0) += 1;
		Ok(data)
	}
}

// vim: ts=4
