//! Filesystem-backed depot server
//!
//! `LocalDepot` publishes directory trees as depot versions and serves them
//! back through the collaborator traits. Files are split with the Bup rolling
//! hash, chunks are stored zstd-compressed under their content id.
//!
//! Store layout:
//!
//! ```text
//! <root>/chunks/<hex content id>          zstd-compressed chunk
//! <root>/depots/<depot>/<manifest>.json   manifest
//! <root>/depots/<depot>/latest            id of the last published manifest
//! ```

use async_trait::async_trait;
use rollsum::Bup;
use std::error::Error;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use std::{fs, path};
use tokio_util::sync::CancellationToken;

use super::error::FetchError;
use super::traits::{AuthService, ChunkSource, DirectoryService, FetchResult, ManifestSource};
use crate::checksum::{adler32, chunk_id, ContentHasher};
use crate::config::CONFIG_DIR;
use crate::logging::*;
use crate::types::{
	AppId, ChunkEntry, DepotId, FileEntry, FileKind, Manifest, ManifestId, ServerEndpoint,
	ServerKind,
};

/// Chunk size in bits (2^20 = ~1MB average chunks)
pub const CHUNK_BITS: u32 = 20;

/// Maximum chunk size factor (multiplied by 2^chunk_bits)
pub const MAX_CHUNK_SIZE_FACTOR: usize = 16;

const ZSTD_LEVEL: i32 = 3;

/// Depot store rooted in a local directory
pub struct LocalDepot {
	root: PathBuf,
	chunk_bits: u32,
	endpoints: Vec<ServerEndpoint>,
	chunk_downloads: AtomicUsize,
}

impl LocalDepot {
	/// Open (or create) a store
	pub fn open(root: &Path) -> io::Result<Self> {
		fs::create_dir_all(root.join("chunks"))?;
		fs::create_dir_all(root.join("depots"))?;
		let mut endpoint = ServerEndpoint::new("local.depot", ServerKind::Cache);
		endpoint.num_entries = 4;
		Ok(LocalDepot {
			root: root.to_path_buf(),
			chunk_bits: CHUNK_BITS,
			endpoints: vec![endpoint],
			chunk_downloads: AtomicUsize::new(0),
		})
	}

	/// Use smaller or larger average chunks when publishing
	pub fn with_chunk_bits(mut self, chunk_bits: u32) -> Self {
		self.chunk_bits = chunk_bits;
		self
	}

	/// Replace the advertised endpoint list
	pub fn with_endpoints(mut self, endpoints: Vec<ServerEndpoint>) -> Self {
		self.endpoints = endpoints;
		self
	}

	/// Number of chunks served so far
	pub fn chunk_download_count(&self) -> usize {
		self.chunk_downloads.load(Ordering::SeqCst)
	}

	fn depot_dir(&self, depot_id: DepotId) -> PathBuf {
		self.root.join("depots").join(depot_id.to_string())
	}

	fn manifest_path(&self, depot_id: DepotId, manifest_id: ManifestId) -> PathBuf {
		self.depot_dir(depot_id).join(format!("{}.json", manifest_id))
	}

	fn chunk_path(&self, id: &crate::types::ChunkId) -> PathBuf {
		self.root.join("chunks").join(id.to_hex())
	}

	/// Id of the last manifest published for a depot
	pub fn latest_manifest(&self, depot_id: DepotId) -> Option<ManifestId> {
		fs::read_to_string(self.depot_dir(depot_id).join("latest")).ok()?.trim().parse().ok()
	}

	fn has_depot(&self, depot_id: DepotId) -> bool {
		self.depot_dir(depot_id).is_dir()
	}

	/// Publish the contents of `src` as version `manifest_id` of `depot_id`
	pub fn publish(
		&self,
		src: &Path,
		depot_id: DepotId,
		manifest_id: ManifestId,
	) -> Result<Manifest, Box<dyn Error>> {
		let mut files = Vec::new();
		self.publish_dir(src, src, &mut files)?;

		let mut manifest = Manifest {
			depot_id,
			manifest_id,
			creation_time: SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs(),
			files,
		};
		manifest.sort_files();

		fs::create_dir_all(self.depot_dir(depot_id))?;
		fs::write(self.manifest_path(depot_id, manifest_id), serde_json::to_vec(&manifest)?)?;
		fs::write(self.depot_dir(depot_id).join("latest"), manifest_id.to_string())?;

		info!(
			"Published depot {} manifest {}: {} entries, {} bytes",
			depot_id,
			manifest_id,
			manifest.files.len(),
			manifest.total_size()
		);
		Ok(manifest)
	}

	fn publish_dir(
		&self,
		base: &Path,
		dir: &Path,
		files: &mut Vec<FileEntry>,
	) -> Result<(), Box<dyn Error>> {
		let mut entries: Vec<fs::DirEntry> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
		entries.sort_by_key(|e| e.file_name());

		for entry in entries {
			let path = entry.path();
			let rel = relative_name(base, &path)?;
			if rel == CONFIG_DIR || rel.starts_with(&format!("{}/", CONFIG_DIR)) {
				continue;
			}

			let meta = fs::symlink_metadata(&path)?;
			if meta.is_dir() {
				files.push(FileEntry {
					path: rel,
					kind: FileKind::Directory,
					total_size: 0,
					content_hash: [0; 32],
					chunks: vec![],
				});
				self.publish_dir(base, &path, files)?;
			} else if meta.is_file() {
				files.push(self.publish_file(&path, rel)?);
			} else {
				debug!("Skipping special file {}", path.display());
			}
		}
		Ok(())
	}

	fn publish_file(&self, path: &Path, rel: String) -> Result<FileEntry, Box<dyn Error>> {
		let max_chunk_size = (1usize << self.chunk_bits) * MAX_CHUNK_SIZE_FACTOR;
		let mut f = fs::File::open(path)?;
		let mut buf: Vec<u8> = vec![0; max_chunk_size];
		let mut n = read_full(&mut f, &mut buf)?;
		let mut offset: u64 = 0;
		let mut hasher = ContentHasher::new();
		let mut chunks = Vec::new();

		while n > 0 {
			let mut bup = Bup::new_with_chunk_bits(self.chunk_bits);
			let count = match bup.find_chunk_edge(&buf[..n]) {
				Some((edge, _)) => edge,
				None => n,
			};

			let data = &buf[..count];
			hasher.update(data);
			chunks.push(self.store_chunk(data, offset)?);

			buf.copy_within(count..n, 0);
			offset += count as u64;
			n -= count;
			n += read_full(&mut f, &mut buf[n..])?;
		}

		Ok(FileEntry {
			path: rel,
			kind: FileKind::File,
			total_size: offset,
			content_hash: hasher.finalize(),
			chunks,
		})
	}

	fn store_chunk(&self, data: &[u8], offset: u64) -> Result<ChunkEntry, Box<dyn Error>> {
		let id = chunk_id(data);
		let chunk_path = self.chunk_path(&id);
		let compressed_length = match fs::metadata(&chunk_path) {
			Ok(meta) => meta.len() as u32,
			Err(_) => {
				let compressed = zstd::encode_all(data, ZSTD_LEVEL)?;
				fs::write(&chunk_path, &compressed)?;
				compressed.len() as u32
			}
		};

		Ok(ChunkEntry {
			id,
			checksum: adler32(data),
			offset,
			compressed_length,
			uncompressed_length: data.len() as u32,
		})
	}
}

/// Fill `buf` as far as the reader allows
fn read_full(f: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
	let mut total = 0;
	while total < buf.len() {
		match f.read(&mut buf[total..]) {
			Ok(0) => break,
			Ok(n) => total += n,
			Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
			Err(e) => return Err(e),
		}
	}
	Ok(total)
}

/// '/'-separated path of `path` relative to `base`
fn relative_name(base: &Path, path: &Path) -> Result<String, Box<dyn Error>> {
	let rel = path.strip_prefix(base)?;
	let mut parts = Vec::new();
	for component in rel.components() {
		match component {
			path::Component::Normal(p) => parts.push(
				p.to_str().ok_or_else(|| format!("non UTF-8 path: {}", path.display()))?.to_string(),
			),
			_ => return Err(format!("unexpected path component in {}", path.display()).into()),
		}
	}
	Ok(parts.join("/"))
}

#[async_trait]
impl DirectoryService for LocalDepot {
	async fn list_endpoints(
		&self,
		_cell_id: u32,
		_cancel: &CancellationToken,
	) -> FetchResult<Vec<ServerEndpoint>> {
		Ok(self.endpoints.clone())
	}
}

#[async_trait]
impl AuthService for LocalDepot {
	async fn depot_key(&self, depot_id: DepotId, _app_id: AppId) -> FetchResult<Option<Vec<u8>>> {
		if !self.has_depot(depot_id) {
			return Ok(None);
		}
		let key = blake3::derive_key("depotsync local depot key", &depot_id.to_le_bytes());
		Ok(Some(key.to_vec()))
	}

	async fn resource_auth_token(
		&self,
		_app_id: AppId,
		depot_id: DepotId,
		top_level_host: &str,
	) -> FetchResult<Option<String>> {
		if !self.has_depot(depot_id) {
			return Ok(None);
		}
		Ok(Some(format!("{}:{}", depot_id, top_level_host)))
	}
}

#[async_trait]
impl ManifestSource for LocalDepot {
	async fn download_manifest(
		&self,
		depot_id: DepotId,
		manifest_id: ManifestId,
		_endpoint: &ServerEndpoint,
		_token: &str,
		_depot_key: &[u8],
	) -> FetchResult<Manifest> {
		let path = self.manifest_path(depot_id, manifest_id);
		let bytes = match tokio::fs::read(&path).await {
			Ok(b) => b,
			Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(FetchError::Status(404)),
			Err(e) => return Err(FetchError::transport(e.to_string())),
		};
		serde_json::from_slice(&bytes).map_err(|e| FetchError::transport(e.to_string()))
	}
}

#[async_trait]
impl ChunkSource for LocalDepot {
	async fn download_chunk(
		&self,
		_depot_id: DepotId,
		chunk: &ChunkEntry,
		_endpoint: &ServerEndpoint,
		_token: &str,
		_depot_key: &[u8],
	) -> FetchResult<Vec<u8>> {
		let compressed = match tokio::fs::read(self.chunk_path(&chunk.id)).await {
			Ok(b) => b,
			Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(FetchError::Status(404)),
			Err(e) => return Err(FetchError::transport(e.to_string())),
		};
		let data = zstd::decode_all(compressed.as_slice())
			.map_err(|e| FetchError::transport(format!("chunk {}: {}", chunk.id, e)))?;
		self.chunk_downloads.fetch_add(1, Ordering::SeqCst);
		Ok(data)
	}
}


// vim: ts=4
