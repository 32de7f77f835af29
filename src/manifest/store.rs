//! On-disk manifest cache
//!
//! Each manifest is stored as a zstd-compressed JSON blob next to a detached
//! `.sha` sidecar holding the BLAKE3 digest of the blob. A blob that is
//! missing, fails its digest, or does not decode is treated as absent.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::checksum::digest_hex;
use crate::config::CONFIG_DIR;
use crate::error::ManifestError;
use crate::logging::*;
use crate::types::{DepotId, Manifest, ManifestId};

const ZSTD_LEVEL: i32 = 3;

pub struct ManifestCache {
	dir: PathBuf,
}

impl ManifestCache {
	/// Cache kept in the bookkeeping directory of an install
	pub fn for_install(target_dir: &Path) -> Self {
		ManifestCache { dir: target_dir.join(CONFIG_DIR).join("manifests") }
	}

	pub fn blob_path(&self, depot_id: DepotId, manifest_id: ManifestId) -> PathBuf {
		self.dir.join(format!("{}_{}.manifest", depot_id, manifest_id))
	}

	pub fn sidecar_path(&self, depot_id: DepotId, manifest_id: ManifestId) -> PathBuf {
		self.dir.join(format!("{}_{}.manifest.sha", depot_id, manifest_id))
	}

	/// Load a cached manifest, `None` if absent or failing integrity checks
	pub fn load(&self, depot_id: DepotId, manifest_id: ManifestId) -> Option<Manifest> {
		match self.read(depot_id, manifest_id) {
			Ok(manifest) => Some(manifest),
			Err(ManifestError::Missing { path }) => {
				debug!("No cached manifest at {}", path.display());
				None
			}
			Err(e) => {
				warn!("Discarding cached manifest {} of depot {}: {}", manifest_id, depot_id, e);
				None
			}
		}
	}

	pub fn read(&self, depot_id: DepotId, manifest_id: ManifestId) -> Result<Manifest, ManifestError> {
		let blob_path = self.blob_path(depot_id, manifest_id);
		let sidecar_path = self.sidecar_path(depot_id, manifest_id);

		let blob = read_existing(&blob_path)?;
		let expected = String::from_utf8_lossy(&read_existing(&sidecar_path)?).trim().to_string();
		let actual = digest_hex(&blob);
		if expected != actual {
			return Err(ManifestError::ChecksumMismatch { expected, actual });
		}

		let json = zstd::decode_all(blob.as_slice())
			.map_err(|e| ManifestError::Corrupt { message: e.to_string() })?;
		let manifest: Manifest = serde_json::from_slice(&json)
			.map_err(|e| ManifestError::Corrupt { message: e.to_string() })?;

		if manifest.depot_id != depot_id || manifest.manifest_id != manifest_id {
			return Err(ManifestError::Corrupt {
				message: format!(
					"blob holds manifest {} of depot {}",
					manifest.manifest_id, manifest.depot_id
				),
			});
		}
		manifest.validate().map_err(|message| ManifestError::Corrupt { message })?;
		Ok(manifest)
	}

	/// Persist a manifest; the sidecar is written last
	pub fn save(&self, manifest: &Manifest) -> Result<(), ManifestError> {
		fs::create_dir_all(&self.dir)?;

		let json = serde_json::to_vec(manifest)
			.map_err(|e| ManifestError::Corrupt { message: e.to_string() })?;
		let blob = zstd::encode_all(json.as_slice(), ZSTD_LEVEL)?;

		fs::write(self.blob_path(manifest.depot_id, manifest.manifest_id), &blob)?;
		fs::write(self.sidecar_path(manifest.depot_id, manifest.manifest_id), digest_hex(&blob))?;
		Ok(())
	}
}

fn read_existing(path: &Path) -> Result<Vec<u8>, ManifestError> {
	match fs::read(path) {
		Ok(bytes) => Ok(bytes),
		Err(e) if e.kind() == io::ErrorKind::NotFound => {
			Err(ManifestError::Missing { path: path.to_path_buf() })
		}
		Err(e) => Err(e.into()),
	}
}


// vim: ts=4
