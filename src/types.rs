//! Core data types: server endpoints and depot manifests

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Component, Path, PathBuf};

pub type AppId = u32;
pub type DepotId = u32;
pub type ManifestId = u64;

/// Manifest id meaning "no manifest"
pub const INVALID_MANIFEST_ID: ManifestId = u64::MAX;

/// Kind of content server advertised by the directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerKind {
	Cache,
	Cdn,
	Other,
}

impl ServerKind {
	/// Only caches and CDN nodes serve depot content
	pub fn serves_content(&self) -> bool {
		matches!(self, ServerKind::Cache | ServerKind::Cdn)
	}
}

/// A content server candidate
///
/// Equality and hashing only consider the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEndpoint {
	pub host: String,
	pub kind: ServerKind,
	/// Declared capacity weight, the number of times the endpoint is enqueued
	pub num_entries: u32,
	/// Declared load, lower is better
	pub weighted_load: f32,
	/// Penalty from earlier failures, tracked outside the pool
	pub penalty: i32,
}

impl ServerEndpoint {
	pub fn new(host: &str, kind: ServerKind) -> Self {
		ServerEndpoint {
			host: host.to_string(),
			kind,
			num_entries: 1,
			weighted_load: 0.0,
			penalty: 0,
		}
	}
}

impl PartialEq for ServerEndpoint {
	fn eq(&self, other: &Self) -> bool {
		self.host == other.host
	}
}

impl Eq for ServerEndpoint {}

impl Hash for ServerEndpoint {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.host.hash(state);
	}
}

/// Content id of a chunk (BLAKE3 of its plaintext)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId(pub [u8; 32]);

impl ChunkId {
	pub fn to_hex(&self) -> String {
		hex::encode(self.0)
	}

	pub fn from_hex(s: &str) -> Option<Self> {
		let bytes = hex::decode(s).ok()?;
		let arr: [u8; 32] = bytes.try_into().ok()?;
		Some(ChunkId(arr))
	}
}

impl fmt::Debug for ChunkId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "ChunkId({})", &self.to_hex()[..12])
	}
}

impl fmt::Display for ChunkId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.to_hex())
	}
}

/// One chunk of a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEntry {
	pub id: ChunkId,
	/// Adler-32 of the uncompressed bytes
	pub checksum: u32,
	pub offset: u64,
	pub compressed_length: u32,
	pub uncompressed_length: u32,
}

impl ChunkEntry {
	pub fn end(&self) -> u64 {
		self.offset.saturating_add(self.uncompressed_length as u64)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileKind {
	File,
	Directory,
}

/// One entry of a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
	/// Path relative to the depot root, '/' separated
	pub path: String,
	pub kind: FileKind,
	pub total_size: u64,
	/// BLAKE3 of the whole file
	pub content_hash: [u8; 32],
	pub chunks: Vec<ChunkEntry>,
}

impl FileEntry {
	pub fn is_directory(&self) -> bool {
		self.kind == FileKind::Directory
	}

	/// Resolve the entry path below `root`
	pub fn local_path(&self, root: &Path) -> PathBuf {
		let mut p = root.to_path_buf();
		for part in self.path.split(['/', '\\']).filter(|s| !s.is_empty()) {
			p.push(part);
		}
		p
	}

	/// Check chunk layout: disjoint ranges covering exactly `total_size` bytes
	pub fn validate(&self) -> Result<(), String> {
		let rel = Path::new(&self.path);
		if self.path.is_empty()
			|| rel.is_absolute()
			|| self.path.starts_with(['/', '\\'])
			|| self.path.split(['/', '\\']).any(|part| part == ".." || part == ".")
			|| rel.components().any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
		{
			return Err(format!("unsafe path {:?}", self.path));
		}

		if self.is_directory() {
			return Ok(());
		}

		let mut ranges = Vec::with_capacity(self.chunks.len());
		for chunk in &self.chunks {
			let end = chunk
				.offset
				.checked_add(chunk.uncompressed_length as u64)
				.ok_or_else(|| format!("{}: chunk at {} overflows", self.path, chunk.offset))?;
			ranges.push((chunk.offset, end));
		}
		ranges.sort_unstable();
		let mut expected = 0u64;
		for (start, end) in ranges {
			if start != expected {
				return Err(format!(
					"{}: chunk at {} does not follow previous chunk ending at {}",
					self.path, start, expected
				));
			}
			expected = end;
		}
		if expected != self.total_size {
			return Err(format!(
				"{}: chunks cover {} bytes, file size is {}",
				self.path, expected, self.total_size
			));
		}
		Ok(())
	}
}

/// A depot version: its files and their chunk layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
	pub depot_id: DepotId,
	pub manifest_id: ManifestId,
	/// Unix timestamp
	pub creation_time: u64,
	pub files: Vec<FileEntry>,
}

impl Manifest {
	pub fn validate(&self) -> Result<(), String> {
		for file in &self.files {
			file.validate()?;
		}
		Ok(())
	}

	/// Order files by path, byte-wise
	pub fn sort_files(&mut self) {
		self.files.sort_by(|a, b| a.path.cmp(&b.path));
	}

	/// Sum of the sizes of all non-directory entries
	pub fn total_size(&self) -> u64 {
		self.files.iter().filter(|f| !f.is_directory()).map(|f| f.total_size).sum()
	}
}


// vim: ts=4
