//! Per-file materialization
//!
//! Turns a [`FilePlan`] into a file of the final length at its final path,
//! with every locally recoverable range already in place, and reports which
//! chunks still have to be downloaded.
//!
//! Patching moves the old file to a staging path first and copies verified
//! ranges back into a fresh file, so an interrupted run leaves a file of the
//! right length with some ranges unfilled. That state is caught by the next
//! run because the installed-version record still holds the sentinel.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::checksum::adler32;
use crate::config::{CONFIG_DIR, STAGING_DIR};
use crate::error::SyncError;
use crate::logging::*;
use crate::manifest::{ChunkMatch, FilePlan};
use crate::types::{ChunkEntry, FileEntry};

/// Positional writer shared by the chunk tasks of one file
///
/// Each write holds the handle for its seek and write, so concurrent writes
/// never interleave.
pub struct FileSink {
	path: PathBuf,
	file: Mutex<File>,
}

impl FileSink {
	fn new(path: PathBuf, file: File) -> Self {
		FileSink { path, file: Mutex::new(file) }
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub async fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), SyncError> {
		let mut file = self.file.lock().await;
		file.seek(SeekFrom::Start(offset)).await.map_err(|e| SyncError::io(&self.path, e))?;
		file.write_all(data).await.map_err(|e| SyncError::io(&self.path, e))?;
		Ok(())
	}

	/// Flush buffered writes to the OS
	pub async fn flush(&self) -> Result<(), SyncError> {
		let mut file = self.file.lock().await;
		file.flush().await.map_err(|e| SyncError::io(&self.path, e))
	}
}

/// A file ready to receive downloaded chunks
pub struct PreparedFile {
	pub sink: FileSink,
	/// Chunks that could not be recovered locally
	pub needed: Vec<ChunkEntry>,
	/// Bytes that were already correct or copied from the old file
	pub reused_bytes: u64,
}

/// Staging location for `entry` below the install's bookkeeping directory
pub fn staging_path(target_dir: &Path, entry: &FileEntry) -> PathBuf {
	entry.local_path(&target_dir.join(CONFIG_DIR).join(STAGING_DIR))
}

/// Execute the local part of `plan` for `entry`
///
/// Returns `None` for an up-to-date file.
pub async fn prepare_file(
	target_dir: &Path,
	entry: &FileEntry,
	plan: FilePlan,
) -> Result<Option<PreparedFile>, SyncError> {
	let path = entry.local_path(target_dir);
	let staging = staging_path(target_dir, entry);

	remove_if_exists(&staging).await?;

	match plan {
		FilePlan::UpToDate => Ok(None),
		FilePlan::Create { needed } => {
			let file = create_sized(&path, entry.total_size).await?;
			Ok(Some(PreparedFile { sink: FileSink::new(path, file), needed, reused_bytes: 0 }))
		}
		FilePlan::Patch { matches, unmatched } => {
			patch_from_old(&path, &staging, entry, matches, unmatched).await.map(Some)
		}
		FilePlan::ValidateInPlace => validate_in_place(&path, entry).await.map(Some),
	}
}

async fn patch_from_old(
	path: &Path,
	staging: &Path,
	entry: &FileEntry,
	matches: Vec<ChunkMatch>,
	mut needed: Vec<ChunkEntry>,
) -> Result<PreparedFile, SyncError> {
	if let Some(parent) = staging.parent() {
		fs::create_dir_all(parent).await.map_err(|e| SyncError::io(parent, e))?;
	}
	fs::rename(path, staging).await.map_err(|e| SyncError::io(path, e))?;

	let file = create_sized(path, entry.total_size).await?;
	let sink = FileSink::new(path.to_path_buf(), file);

	let mut old = File::open(staging).await.map_err(|e| SyncError::io(staging, e))?;
	let mut reused_bytes = 0;
	for m in matches {
		let data = read_range(&mut old, m.old.offset, m.old.uncompressed_length)
			.await
			.map_err(|e| SyncError::io(staging, e))?;
		match data {
			Some(data)
				if adler32(&data) == m.old.checksum
					&& data.len() == m.new.uncompressed_length as usize =>
			{
				sink.write_at(m.new.offset, &data).await?;
				reused_bytes += data.len() as u64;
			}
			_ => {
				debug!("{}: old chunk at {} failed verification", entry.path, m.old.offset);
				needed.push(m.new);
			}
		}
	}
	drop(old);

	fs::remove_file(staging).await.map_err(|e| SyncError::io(staging, e))?;
	needed.sort_by_key(|c| c.offset);
	debug!(
		"{}: reused {} bytes, {} chunks to download",
		entry.path,
		reused_bytes,
		needed.len()
	);

	Ok(PreparedFile { sink, needed, reused_bytes })
}

async fn validate_in_place(path: &Path, entry: &FileEntry) -> Result<PreparedFile, SyncError> {
	let mut file = OpenOptions::new()
		.read(true)
		.write(true)
		.open(path)
		.await
		.map_err(|e| SyncError::io(path, e))?;

	let len = file.metadata().await.map_err(|e| SyncError::io(path, e))?.len();
	if len != entry.total_size {
		debug!("{}: resizing from {} to {} bytes", entry.path, len, entry.total_size);
		file.set_len(entry.total_size).await.map_err(|e| SyncError::io(path, e))?;
	}

	let mut chunks = entry.chunks.clone();
	chunks.sort_by_key(|c| c.offset);

	let mut needed = Vec::new();
	let mut reused_bytes = 0;
	for chunk in chunks {
		let data = read_range(&mut file, chunk.offset, chunk.uncompressed_length)
			.await
			.map_err(|e| SyncError::io(path, e))?;
		match data {
			Some(data) if adler32(&data) == chunk.checksum => {
				reused_bytes += data.len() as u64;
			}
			_ => needed.push(chunk),
		}
	}

	Ok(PreparedFile { sink: FileSink::new(path.to_path_buf(), file), needed, reused_bytes })
}

async fn create_sized(path: &Path, len: u64) -> Result<File, SyncError> {
	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent).await.map_err(|e| SyncError::io(parent, e))?;
	}
	let file = OpenOptions::new()
		.read(true)
		.write(true)
		.create(true)
		.truncate(true)
		.open(path)
		.await
		.map_err(|e| SyncError::io(path, e))?;
	file.set_len(len).await.map_err(|e| SyncError::io(path, e))?;
	Ok(file)
}

/// Read `len` bytes at `offset`, `None` if the file ends first
async fn read_range(file: &mut File, offset: u64, len: u32) -> io::Result<Option<Vec<u8>>> {
	file.seek(SeekFrom::Start(offset)).await?;
	let mut buf = vec![0u8; len as usize];
	match file.read_exact(&mut buf).await {
		Ok(_) => Ok(Some(buf)),
		Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
		Err(e) => Err(e),
	}
}

async fn remove_if_exists(path: &Path) -> Result<(), SyncError> {
	match fs::remove_file(path).await {
		Ok(()) => {
			debug!("Removed stale staging file {}", path.display());
			Ok(())
		}
		Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
		Err(e) => Err(SyncError::io(path, e)),
	}
}


// vim: ts=4
