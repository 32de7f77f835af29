//! Configuration for depotsync
//!
//! The configuration follows a priority chain:
//! 1. Built-in defaults (Config::default())
//! 2. Config file (~/.config/depotsync/config.toml, or an explicit path)
//! 3. Environment variables (DEPOTSYNC_* prefix)
//! 4. CLI flags (highest priority, applied by the caller)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::SyncError;

/// Name of the per-install bookkeeping directory
pub const CONFIG_DIR: &str = ".depotsync";

/// Staging directory for files being rebuilt, below CONFIG_DIR
pub const STAGING_DIR: &str = "staging";

/// Default number of files processed concurrently
pub const DEFAULT_MAX_DOWNLOADS: usize = 10;

// ============================================================================
// MAIN CONFIGURATION STRUCT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
	// ========================================================================
	// INSTALL LOCATION
	// ========================================================================
	/// Root directory for installed depots
	pub install_directory: PathBuf,

	// ========================================================================
	// SYNC BEHAVIOR
	// ========================================================================
	/// Number of files reconciled concurrently
	pub max_downloads: usize,

	/// Number of chunks fetched concurrently within one file
	pub chunk_concurrency: usize,

	/// Re-verify chunks of files whose whole-file hash did not change
	pub verify_all: bool,

	/// Check existing files that have no old manifest entry against the
	/// target manifest in place, instead of rebuilding them from scratch
	pub validate_unlinked_files: bool,

	// ========================================================================
	// SERVER POOL
	// ========================================================================
	pub pool: PoolConfig,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			install_directory: PathBuf::from("depots"),
			max_downloads: DEFAULT_MAX_DOWNLOADS,
			chunk_concurrency: 4,
			verify_all: false,
			validate_unlinked_files: true,
			pool: PoolConfig::default(),
		}
	}
}

/// Server pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PoolConfig {
	/// Cell id passed to the directory service
	pub cell_id: u32,

	/// Replenish when fewer endpoints than this are queued
	pub minimum_endpoints: usize,

	/// Interval of the replenishment loop in milliseconds
	pub poll_interval_ms: u64,

	/// One backoff step after a rate-limited directory call, in milliseconds
	pub backoff_unit_ms: u64,

	/// Maximum number of backoff steps
	pub backoff_cap: u32,

	/// Timeout for a single directory, manifest or chunk request
	pub request_timeout_secs: u64,

	/// Host suffixes sharing one authorization token (e.g. "content.example.net")
	pub token_scopes: Vec<String>,
}

impl Default for PoolConfig {
	fn default() -> Self {
		PoolConfig {
			cell_id: 0,
			minimum_endpoints: 8,
			poll_interval_ms: 1000,
			backoff_unit_ms: 1000,
			backoff_cap: 5,
			request_timeout_secs: 60,
			token_scopes: vec![],
		}
	}
}

impl PoolConfig {
	pub fn poll_interval(&self) -> Duration {
		Duration::from_millis(self.poll_interval_ms)
	}

	pub fn backoff_unit(&self) -> Duration {
		Duration::from_millis(self.backoff_unit_ms)
	}

	pub fn request_timeout(&self) -> Duration {
		Duration::from_secs(self.request_timeout_secs)
	}
}

impl Config {
	/// Default location of the config file
	pub fn default_path() -> Option<PathBuf> {
		if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
			return Some(PathBuf::from(dir).join("depotsync").join("config.toml"));
		}
		std::env::var("HOME")
			.ok()
			.map(|home| PathBuf::from(home).join(".config").join("depotsync").join("config.toml"))
	}

	/// Load defaults, then the config file (if present), then env overrides
	pub fn load(path: Option<&Path>) -> Result<Config, SyncError> {
		let path = match path {
			Some(p) => Some(p.to_path_buf()),
			None => Self::default_path().filter(|p| p.exists()),
		};

		let mut config = match path {
			Some(p) => {
				let text = std::fs::read_to_string(&p).map_err(|e| SyncError::io(&p, e))?;
				Self::from_toml(&text)?
			}
			None => Config::default(),
		};

		config.apply_env(|key| std::env::var(key).ok())?;
		config.validate()?;
		Ok(config)
	}

	pub fn from_toml(text: &str) -> Result<Config, SyncError> {
		toml::from_str(text)
			.map_err(|e| SyncError::InvalidConfig { message: format!("config file: {}", e) })
	}

	/// Apply DEPOTSYNC_* overrides, `lookup` abstracts the environment
	pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), SyncError>
	where
		F: Fn(&str) -> Option<String>,
	{
		fn parse<T: std::str::FromStr>(key: &str, value: String) -> Result<T, SyncError> {
			value.trim().parse().map_err(|_| SyncError::InvalidConfig {
				message: format!("{}: cannot parse {:?}", key, value),
			})
		}

		if let Some(v) = lookup("DEPOTSYNC_INSTALL_DIR") {
			self.install_directory = PathBuf::from(v);
		}
		if let Some(v) = lookup("DEPOTSYNC_MAX_DOWNLOADS") {
			self.max_downloads = parse("DEPOTSYNC_MAX_DOWNLOADS", v)?;
		}
		if let Some(v) = lookup("DEPOTSYNC_VERIFY_ALL") {
			self.verify_all = parse("DEPOTSYNC_VERIFY_ALL", v)?;
		}
		if let Some(v) = lookup("DEPOTSYNC_CELL_ID") {
			self.pool.cell_id = parse("DEPOTSYNC_CELL_ID", v)?;
		}
		Ok(())
	}

	pub fn validate(&self) -> Result<(), SyncError> {
		let invalid = |message: &str| SyncError::InvalidConfig { message: message.to_string() };

		if self.max_downloads == 0 {
			return Err(invalid("maxDownloads must be > 0"));
		}
		if self.chunk_concurrency == 0 {
			return Err(invalid("chunkConcurrency must be > 0"));
		}
		if self.pool.poll_interval_ms == 0 {
			return Err(invalid("pool.pollIntervalMs must be > 0"));
		}
		if self.pool.backoff_cap == 0 {
			return Err(invalid("pool.backoffCap must be > 0"));
		}
		if self.pool.request_timeout_secs == 0 {
			return Err(invalid("pool.requestTimeoutSecs must be > 0"));
		}
		Ok(())
	}
}


// vim: ts=4
