//! Progress reporting for depot syncs
//!
//! The engine reports through a single [`SyncProgressCallback`]; byte
//! counters are kept in [`SyncCounters`] and turned into snapshots on demand.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::logging::*;
use crate::sync::SyncSummary;
use crate::types::{DepotId, ManifestId};

/// Width of the progress bar display
pub const PROGRESS_BAR_WIDTH: usize = 30;

/// Bytes per megabyte for display conversions
pub const BYTES_PER_MB: f64 = 1_000_000.0;

/// Throttle progress bar updates to this many milliseconds
pub const UPDATE_THROTTLE_MS: u128 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
	LoadManifests,
	Reconcile,
	Finalize,
}

/// Aggregate progress snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
	/// Uncompressed bytes in place, whether downloaded or reused
	pub bytes_done: u64,
	pub bytes_total: u64,
	pub downloaded_compressed: u64,
	pub downloaded_uncompressed: u64,
	/// Downloaded uncompressed bytes per second
	pub transfer_rate: f64,
	pub elapsed: Duration,
}

impl ProgressUpdate {
	pub fn bytes_remaining(&self) -> u64 {
		self.bytes_total.saturating_sub(self.bytes_done)
	}

	pub fn percent(&self) -> f64 {
		if self.bytes_total == 0 {
			100.0
		} else {
			self.bytes_done as f64 / self.bytes_total as f64 * 100.0
		}
	}
}

#[derive(Debug, Clone)]
pub enum SyncEvent {
	PhaseChanged { depot_id: DepotId, phase: SyncPhase },

	/// Target manifest loaded
	ManifestReady { depot_id: DepotId, manifest_id: ManifestId, file_count: usize, bytes_total: u64 },

	/// A chunk of `path` landed on disk
	FileProgress { path: String, percent: f64 },

	/// `path` is complete; `depot_percent` is the depot-wide progress at that point
	FileCompleted { path: String, depot_percent: f64 },

	Progress(ProgressUpdate),

	Finished { depot_id: DepotId, completed: bool, summary: SyncSummary },
}

/// Receiver of sync events
pub trait SyncProgressCallback: Send + Sync {
	fn on_event(&self, _event: SyncEvent) {}
}

impl<T: Fn(SyncEvent) + Send + Sync> SyncProgressCallback for T {
	fn on_event(&self, event: SyncEvent) {
		self(event);
	}
}

/// Byte counters of one session
#[derive(Debug)]
pub struct SyncCounters {
	started: Instant,
	bytes_total: AtomicU64,
	bytes_done: AtomicU64,
	downloaded_compressed: AtomicU64,
	downloaded_uncompressed: AtomicU64,
}

impl SyncCounters {
	pub fn new() -> Self {
		SyncCounters {
			started: Instant::now(),
			bytes_total: AtomicU64::new(0),
			bytes_done: AtomicU64::new(0),
			downloaded_compressed: AtomicU64::new(0),
			downloaded_uncompressed: AtomicU64::new(0),
		}
	}

	pub fn set_total(&self, bytes: u64) {
		self.bytes_total.store(bytes, Ordering::SeqCst);
	}

	/// Bytes that were already correct on disk
	pub fn add_reused(&self, bytes: u64) {
		self.bytes_done.fetch_add(bytes, Ordering::SeqCst);
	}

	pub fn add_downloaded(&self, compressed: u64, uncompressed: u64) {
		self.downloaded_compressed.fetch_add(compressed, Ordering::SeqCst);
		self.downloaded_uncompressed.fetch_add(uncompressed, Ordering::SeqCst);
		self.bytes_done.fetch_add(uncompressed, Ordering::SeqCst);
	}

	pub fn downloaded(&self) -> (u64, u64) {
		(
			self.downloaded_compressed.load(Ordering::SeqCst),
			self.downloaded_uncompressed.load(Ordering::SeqCst),
		)
	}

	pub fn snapshot(&self) -> ProgressUpdate {
		let elapsed = self.started.elapsed();
		let (downloaded_compressed, downloaded_uncompressed) = self.downloaded();
		let secs = elapsed.as_secs_f64();
		ProgressUpdate {
			bytes_done: self.bytes_done.load(Ordering::SeqCst),
			bytes_total: self.bytes_total.load(Ordering::SeqCst),
			downloaded_compressed,
			downloaded_uncompressed,
			transfer_rate: if secs > 0.0 { downloaded_uncompressed as f64 / secs } else { 0.0 },
			elapsed,
		}
	}
}

impl Default for SyncCounters {
	fn default() -> Self {
		Self::new()
	}
}

/// CLI progress callback
///
/// Prints one `{percent}% {path}` line per completed file to stdout and a
/// throttled progress bar to stderr.
pub struct CliProgressCallback {
	last_update: Mutex<Instant>,
	show_bar: bool,
}

impl CliProgressCallback {
	pub fn new(show_bar: bool) -> Self {
		Self { last_update: Mutex::new(Instant::now()), show_bar }
	}
}

impl SyncProgressCallback for CliProgressCallback {
	fn on_event(&self, event: SyncEvent) {
		match event {
			SyncEvent::PhaseChanged { depot_id, phase } => {
				info!("Depot {}: {:?}", depot_id, phase);
			}
			SyncEvent::ManifestReady { manifest_id, file_count, bytes_total, .. } => {
				info!(
					"Manifest {}: {} entries, {:.1} MB",
					manifest_id,
					file_count,
					bytes_total as f64 / BYTES_PER_MB
				);
			}
			SyncEvent::FileCompleted { path, depot_percent } => {
				if self.show_bar {
					let _ = write!(std::io::stderr(), "\r\x1b[K");
				}
				println!("{:6.2}% {}", depot_percent, path);
			}
			SyncEvent::Progress(update) => {
				if !self.show_bar {
					return;
				}
				let mut last = self.last_update.lock().unwrap_or_else(|e| e.into_inner());
				if last.elapsed().as_millis() < UPDATE_THROTTLE_MS {
					return;
				}
				*last = Instant::now();

				let ratio = (update.percent() / 100.0).clamp(0.0, 1.0);
				let filled = (ratio * PROGRESS_BAR_WIDTH as f64) as usize;
				let _ = write!(
					std::io::stderr(),
					"\r  [{}{}] {:.1}/{:.1} MB | {:.1} MB/s",
					"=".repeat(filled),
					" ".repeat(PROGRESS_BAR_WIDTH - filled),
					update.bytes_done as f64 / BYTES_PER_MB,
					update.bytes_total as f64 / BYTES_PER_MB,
					update.transfer_rate / BYTES_PER_MB
				);
				let _ = std::io::stderr().flush();
			}
			SyncEvent::Finished { depot_id, completed, summary } => {
				if self.show_bar {
					let _ = writeln!(std::io::stderr());
				}
				if completed {
					println!(
						"Depot {} - Downloaded {} bytes ({} bytes uncompressed)",
						depot_id, summary.compressed_bytes, summary.uncompressed_bytes
					);
				}
			}
			SyncEvent::FileProgress { .. } => {}
		}
	}
}


// vim: ts=4
