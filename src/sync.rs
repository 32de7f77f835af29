//! Depot sync orchestration
//!
//! A sync runs through three phases:
//!
//! 1. **LoadManifests**: obtain the depot key, the previously installed
//!    manifest (if its record and cached blob are intact) and the target
//!    manifest (cache first, then the server pool).
//! 2. **Reconcile**: write the incomplete sentinel, create directories, then
//!    plan, prepare and download every file with bounded parallelism.
//! 3. **Finalize**: record the target manifest as installed, but only if no
//!    file task failed and the session was not cancelled.

use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{PoolError, SyncError};
use crate::fetch::ChunkFetcher;
use crate::logging::*;
use crate::manifest::{ManifestCache, ManifestDiffer};
use crate::progress::{SyncEvent, SyncPhase, SyncProgressCallback};
use crate::reconcile::{self, PreparedFile};
use crate::remote::{FetchError, Services};
use crate::session::SyncSession;
use crate::state::{InstalledVersion, InstalledVersionStore};
use crate::types::{AppId, DepotId, FileEntry, Manifest, ManifestId};

/// Totals of one depot sync
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
	/// Bytes received from content servers
	pub compressed_bytes: u64,
	/// Uncompressed size of the downloaded chunks
	pub uncompressed_bytes: u64,
	/// Number of files (not directories) in the target manifest
	pub file_count: usize,
}

/// Depot sync engine
pub struct DepotSync {
	services: Services,
	config: Config,
	callback: Option<Arc<dyn SyncProgressCallback>>,
}

impl DepotSync {
	pub fn new(services: Services, config: Config) -> Self {
		DepotSync { services, config, callback: None }
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	/// Bring `target_dir` to `manifest_id` of `depot_id`
	///
	/// On failure the depot's installed-version record is left at the
	/// incomplete sentinel (or untouched if reconciliation never started).
	pub async fn start_sync(
		&self,
		app_id: AppId,
		depot_id: DepotId,
		manifest_id: ManifestId,
		target_dir: &Path,
		cancel: &CancellationToken,
	) -> Result<SyncSummary, SyncError> {
		self.config.validate()?;

		let session = Arc::new(SyncSession::start(
			app_id,
			depot_id,
			&self.services,
			&self.config,
			cancel,
			self.callback.clone(),
		));
		let span = info_span!("depot_sync", session = %session.id(), depot = depot_id);

		let result = self
			.run(session.clone(), manifest_id, target_dir.to_path_buf())
			.instrument(span)
			.await;
		session.close().await;

		let (compressed_bytes, uncompressed_bytes) = session.counters.downloaded();
		let summary = match &result {
			Ok(summary) => summary.clone(),
			Err(_) => SyncSummary { compressed_bytes, uncompressed_bytes, file_count: 0 },
		};
		session.emit(SyncEvent::Finished { depot_id, completed: result.is_ok(), summary });
		result
	}

	async fn run(
		&self,
		session: Arc<SyncSession>,
		manifest_id: ManifestId,
		target_dir: PathBuf,
	) -> Result<SyncSummary, SyncError> {
		let depot_id = session.depot_id;

		// LoadManifests
		session.emit(SyncEvent::PhaseChanged { depot_id, phase: SyncPhase::LoadManifests });
		tokio::fs::create_dir_all(&target_dir).await.map_err(|e| SyncError::io(&target_dir, e))?;
		let store = InstalledVersionStore::open(&target_dir)?;
		let cache = ManifestCache::for_install(&target_dir);

		let depot_key = self.depot_key(&session).await?;
		let installed = store.get(depot_id)?;
		let old_manifest = installed
			.and_then(|v| v.manifest_id())
			.and_then(|id| cache.load(depot_id, id));

		let mut target = match &old_manifest {
			Some(old) if old.manifest_id == manifest_id => {
				info!("Already have manifest {} for depot {}", manifest_id, depot_id);
				old.clone()
			}
			_ => match cache.load(depot_id, manifest_id) {
				Some(cached) => {
					info!("Using cached manifest {} for depot {}", manifest_id, depot_id);
					cached
				}
				None => {
					let downloaded = self.download_manifest(&session, manifest_id, &depot_key).await?;
					if let Err(e) = cache.save(&downloaded) {
						warn!("Failed to cache manifest {}: {}", manifest_id, e);
					}
					downloaded
				}
			},
		};
		target.validate().map_err(|message| SyncError::InvalidManifest { message })?;
		target.sort_files();

		// Reconcile
		session.emit(SyncEvent::PhaseChanged { depot_id, phase: SyncPhase::Reconcile });
		store.mark_incomplete(depot_id)?;

		let total = target.total_size();
		let file_count = target.files.iter().filter(|f| !f.is_directory()).count();
		session.counters.set_total(total);
		session.emit(SyncEvent::ManifestReady {
			depot_id,
			manifest_id,
			file_count,
			bytes_total: total,
		});
		create_directories(&target, &target_dir).await?;

		let completed =
			self.reconcile_files(&session, target, old_manifest, depot_key, &target_dir).await;

		// Finalize
		session.emit(SyncEvent::PhaseChanged { depot_id, phase: SyncPhase::Finalize });
		if !completed {
			let failure = session.take_failure();
			error!("Sync of depot {} aborted: {}", depot_id, failure);
			return Err(failure);
		}

		store.set(depot_id, InstalledVersion::Manifest(manifest_id))?;

		let (compressed_bytes, uncompressed_bytes) = session.counters.downloaded();
		info!(
			"Depot {} - Downloaded {} bytes ({} bytes uncompressed)",
			depot_id, compressed_bytes, uncompressed_bytes
		);
		Ok(SyncSummary { compressed_bytes, uncompressed_bytes, file_count })
	}

	async fn depot_key(&self, session: &SyncSession) -> Result<Arc<[u8]>, SyncError> {
		let depot_id = session.depot_id;
		let reply = tokio::select! {
			_ = session.token().cancelled() => return Err(session.take_failure()),
			r = session.pool().auth().depot_key(depot_id, session.app_id) => r,
		};
		match reply {
			Ok(Some(key)) => Ok(key),
			Ok(None) => {
				error!("No valid depot key for {}, unable to download", depot_id);
				Err(SyncError::DepotKeyUnavailable { depot_id })
			}
			Err(e) => {
				error!("Depot key request for {} failed: {}", depot_id, e);
				Err(SyncError::DepotKeyUnavailable { depot_id })
			}
		}
	}

	/// Fetch the target manifest through the pool, retrying transient errors
	async fn download_manifest(
		&self,
		session: &SyncSession,
		manifest_id: ManifestId,
		depot_key: &[u8],
	) -> Result<Manifest, SyncError> {
		let depot_id = session.depot_id;
		let cancel = session.token();
		let unavailable = SyncError::ManifestUnavailable { depot_id, manifest_id };
		info!("Downloading manifest {} for depot {}", manifest_id, depot_id);

		loop {
			let lease = match session.pool().acquire(session.app_id, depot_id, cancel).await {
				Ok(lease) => lease,
				Err(PoolError::Authorization(e)) => {
					error!("No token for depot manifest {} {}: {}", depot_id, manifest_id, e);
					return Err(unavailable);
				}
				Err(_) => return Err(session.take_failure()),
			};

			let result = tokio::select! {
				_ = cancel.cancelled() => {
					session.pool().release(lease, true);
					return Err(session.take_failure());
				}
				r = tokio::time::timeout(
					self.config.pool.request_timeout(),
					self.services.manifests.download_manifest(
						depot_id,
						manifest_id,
						&lease.endpoint,
						&lease.token,
						depot_key,
					),
				) => r.unwrap_or(Err(FetchError::Timeout)),
			};

			match result {
				Ok(manifest) => {
					session.pool().release(lease, true);
					if manifest.depot_id != depot_id || manifest.manifest_id != manifest_id {
						return Err(SyncError::InvalidManifest {
							message: format!(
								"server sent manifest {} of depot {}",
								manifest.manifest_id, manifest.depot_id
							),
						});
					}
					return Ok(manifest);
				}
				Err(e) if e.is_auth_rejection() || e == FetchError::Status(404) => {
					session.pool().release(lease, false);
					error!("Encountered {} for depot manifest {} {}, aborting", e, depot_id, manifest_id);
					return Err(unavailable);
				}
				Err(e) => {
					session.pool().release(lease, false);
					warn!(
						"Encountered error downloading depot manifest {} {}: {}",
						depot_id, manifest_id, e
					);
				}
			}
		}
	}

	/// Run one task per file, at most `max_downloads` at a time
	///
	/// Returns whether every file completed. Failures are recorded on the
	/// session, which is then cancelled.
	async fn reconcile_files(
		&self,
		session: &Arc<SyncSession>,
		target: Manifest,
		old_manifest: Option<Manifest>,
		depot_key: Arc<[u8]>,
		target_dir: &Path,
	) -> bool {
		let old_files: Arc<HashMap<String, FileEntry>> = Arc::new(
			old_manifest
				.map(|m| m.files.into_iter().map(|f| (f.path.clone(), f)).collect())
				.unwrap_or_default(),
		);
		let fetcher = Arc::new(ChunkFetcher::new(
			session.clone(),
			self.services.chunks.clone(),
			depot_key,
			self.config.pool.request_timeout(),
		));
		let context = Arc::new(FileTaskContext {
			session: session.clone(),
			fetcher,
			old_files,
			differ: ManifestDiffer::new(self.config.verify_all, self.config.validate_unlinked_files),
			target_dir: target_dir.to_path_buf(),
			chunk_concurrency: self.config.chunk_concurrency,
		});

		let semaphore = Arc::new(Semaphore::new(self.config.max_downloads));
		let mut tasks = JoinSet::new();
		let files: Vec<FileEntry> = target.files.into_iter().filter(|f| !f.is_directory()).collect();
		let file_count = files.len();

		for entry in files {
			let permit = tokio::select! {
				_ = session.token().cancelled() => break,
				p = semaphore.clone().acquire_owned() => match p {
					Ok(p) => p,
					Err(_) => break,
				},
			};

			let context = context.clone();
			let task = async move {
				let _permit = permit;
				let path = entry.path.clone();
				match process_file(&context, entry).await {
					Ok(()) => true,
					Err(SyncError::Cancelled) => false,
					Err(e) => {
						error!("Failed to sync {}: {}", path, e);
						context.session.abort(e);
						false
					}
				}
			};
			tasks.spawn(task.in_current_span());
		}

		let mut completed = 0;
		while let Some(joined) = tasks.join_next().await {
			match joined {
				Ok(true) => completed += 1,
				Ok(false) => {}
				Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
				Err(_) => {}
			}
		}
		completed == file_count
	}
}

struct FileTaskContext {
	session: Arc<SyncSession>,
	fetcher: Arc<ChunkFetcher>,
	old_files: Arc<HashMap<String, FileEntry>>,
	differ: ManifestDiffer,
	target_dir: PathBuf,
	chunk_concurrency: usize,
}

async fn process_file(ctx: &FileTaskContext, entry: FileEntry) -> Result<(), SyncError> {
	let session = &ctx.session;
	if session.is_cancelled() {
		return Err(SyncError::Cancelled);
	}

	let path = entry.local_path(&ctx.target_dir);
	let exists = tokio::fs::metadata(&path).await.is_ok();
	let plan = ctx.differ.plan(ctx.old_files.get(&entry.path), &entry, exists);

	let prepared = match reconcile::prepare_file(&ctx.target_dir, &entry, plan).await? {
		Some(prepared) => prepared,
		None => {
			session.counters.add_reused(entry.total_size);
			file_completed(session, &entry);
			return Ok(());
		}
	};
	let PreparedFile { sink, needed, reused_bytes } = prepared;
	session.counters.add_reused(reused_bytes);

	let mut file_done = reused_bytes;
	let sink = Arc::new(sink);
	let mut downloads = stream::iter(needed)
		.map(|chunk| {
			let fetcher = ctx.fetcher.clone();
			let sink = sink.clone();
			async move { fetcher.fetch(&chunk, &sink).await.map(|_| chunk.uncompressed_length) }
		})
		.buffer_unordered(ctx.chunk_concurrency);

	while let Some(result) = downloads.next().await {
		file_done += result? as u64;
		session.emit(SyncEvent::FileProgress {
			path: entry.path.clone(),
			percent: percent(file_done, entry.total_size),
		});
		session.emit_progress();
	}
	drop(downloads);

	sink.flush().await?;
	file_completed(session, &entry);
	Ok(())
}

fn file_completed(session: &SyncSession, entry: &FileEntry) {
	let depot_percent = session.counters.snapshot().percent();
	debug!("{:6.2}% {}", depot_percent, entry.path);
	session.emit(SyncEvent::FileCompleted { path: entry.path.clone(), depot_percent });
	session.emit_progress();
}

fn percent(done: u64, total: u64) -> f64 {
	if total == 0 {
		100.0
	} else {
		done as f64 / total as f64 * 100.0
	}
}

/// Create directory entries and the parent of every file
async fn create_directories(manifest: &Manifest, target_dir: &Path) -> Result<(), SyncError> {
	for entry in &manifest.files {
		let path = entry.local_path(target_dir);
		let dir = if entry.is_directory() {
			Some(path.as_path())
		} else {
			path.parent()
		};
		if let Some(dir) = dir {
			tokio::fs::create_dir_all(dir).await.map_err(|e| SyncError::io(dir, e))?;
		}
	}
	Ok(())
}

/// Builder for [`DepotSync`]
pub struct SyncBuilder {
	services: Services,
	config: Config,
	callback: Option<Arc<dyn SyncProgressCallback>>,
}

impl SyncBuilder {
	pub fn new(services: Services) -> Self {
		SyncBuilder { services, config: Config::default(), callback: None }
	}

	pub fn config(mut self, config: Config) -> Self {
		self.config = config;
		self
	}

	pub fn verify_all(mut self, verify_all: bool) -> Self {
		self.config.verify_all = verify_all;
		self
	}

	pub fn max_downloads(mut self, max_downloads: usize) -> Self {
		self.config.max_downloads = max_downloads;
		self
	}

	pub fn on_progress<C>(mut self, callback: C) -> Self
	where
		C: SyncProgressCallback + 'static,
	{
		self.callback = Some(Arc::new(callback));
		self
	}

	pub fn build(self) -> Result<DepotSync, SyncError> {
		self.config.validate()?;
		Ok(DepotSync { services: self.services, config: self.config, callback: self.callback })
	}
}


// vim: ts=4
