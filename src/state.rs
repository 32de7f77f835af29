//! Installed-version records
//!
//! One record per depot in `<install>/.depotsync/depot.db` (redb), naming the
//! last manifest that was installed completely. Before a sync touches any
//! file the record is set to the incomplete sentinel; it is set to the real
//! manifest id only after every file task finished.
//!
//! Values are stored as a BLAKE3 digest followed by the zstd-compressed json5
//! record. A value that fails its digest is reported as absent.

use redb::{ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::CONFIG_DIR;
use crate::error::StateError;
use crate::logging::*;
use crate::types::{DepotId, ManifestId, INVALID_MANIFEST_ID};

/// Key: depot id (decimal string)
/// Value: digest + compressed record
const INSTALLED_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("installed");

const DIGEST_LEN: usize = 32;
const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstalledVersion {
	/// A sync started and did not finish
	Incomplete,
	Manifest(ManifestId),
}

impl InstalledVersion {
	fn from_id(id: ManifestId) -> Self {
		if id == INVALID_MANIFEST_ID {
			InstalledVersion::Incomplete
		} else {
			InstalledVersion::Manifest(id)
		}
	}

	fn id(&self) -> ManifestId {
		match self {
			InstalledVersion::Incomplete => INVALID_MANIFEST_ID,
			InstalledVersion::Manifest(id) => *id,
		}
	}

	pub fn manifest_id(&self) -> Option<ManifestId> {
		match self {
			InstalledVersion::Incomplete => None,
			InstalledVersion::Manifest(id) => Some(*id),
		}
	}
}

/// Stored form of a record
///
/// The manifest id is kept as a string, json5 numbers do not hold every u64.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct InstalledVersionRecord {
	#[serde(rename = "man")]
	manifest: String,
	#[serde(rename = "upd")]
	updated: u64,
}

pub struct InstalledVersionStore {
	db: redb::Database,
	db_path: PathBuf,
}

impl InstalledVersionStore {
	pub fn db_path(target_dir: &Path) -> PathBuf {
		target_dir.join(CONFIG_DIR).join("depot.db")
	}

	/// Open or create the record store of an install
	pub fn open(target_dir: &Path) -> Result<Self, StateError> {
		let db_path = Self::db_path(target_dir);
		if let Some(parent) = db_path.parent() {
			std::fs::create_dir_all(parent)
				.map_err(|e| StateError::OpenFailed { source: Box::new(e) })?;
		}

		let db = redb::Database::create(&db_path)
			.map_err(|e| StateError::OpenFailed { source: Box::new(e) })?;
		{
			let write_txn =
				db.begin_write().map_err(|e| StateError::OpenFailed { source: Box::new(e) })?;
			let _ = write_txn
				.open_table(INSTALLED_TABLE)
				.map_err(|e| StateError::OpenFailed { source: Box::new(e) })?;
			write_txn.commit().map_err(|e| StateError::OpenFailed { source: Box::new(e) })?;
		}
		Ok(InstalledVersionStore { db, db_path })
	}

	pub fn path(&self) -> &Path {
		&self.db_path
	}

	/// Record of `depot_id`, `None` if there is none or it is damaged
	pub fn get(&self, depot_id: DepotId) -> Result<Option<InstalledVersion>, StateError> {
		let read_txn =
			self.db.begin_read().map_err(|e| StateError::LoadFailed { source: Box::new(e) })?;
		let table = read_txn
			.open_table(INSTALLED_TABLE)
			.map_err(|e| StateError::LoadFailed { source: Box::new(e) })?;

		let key = depot_id.to_string();
		let value = match table
			.get(key.as_str())
			.map_err(|e| StateError::LoadFailed { source: Box::new(e) })?
		{
			Some(entry) => entry.value().to_vec(),
			None => return Ok(None),
		};

		match decode(&value) {
			Ok(version) => Ok(Some(version)),
			Err(e) => {
				warn!("Ignoring installed-version record of depot {}: {}", depot_id, e);
				Ok(None)
			}
		}
	}

	pub fn set(&self, depot_id: DepotId, version: InstalledVersion) -> Result<(), StateError> {
		let value = encode(version)?;
		let key = depot_id.to_string();

		let write_txn =
			self.db.begin_write().map_err(|e| StateError::SaveFailed { source: Box::new(e) })?;
		{
			let mut table = write_txn
				.open_table(INSTALLED_TABLE)
				.map_err(|e| StateError::SaveFailed { source: Box::new(e) })?;
			table
				.insert(key.as_str(), value.as_slice())
				.map_err(|e| StateError::SaveFailed { source: Box::new(e) })?;
		}
		write_txn.commit().map_err(|e| StateError::SaveFailed { source: Box::new(e) })?;
		debug!("Installed version of depot {} set to {:?}", depot_id, version);
		Ok(())
	}

	/// Write the incomplete sentinel for `depot_id`
	pub fn mark_incomplete(&self, depot_id: DepotId) -> Result<(), StateError> {
		self.set(depot_id, InstalledVersion::Incomplete)
	}

	/// All readable records, ordered by depot id
	pub fn list(&self) -> Result<Vec<(DepotId, InstalledVersion)>, StateError> {
		let read_txn =
			self.db.begin_read().map_err(|e| StateError::LoadFailed { source: Box::new(e) })?;
		let table = read_txn
			.open_table(INSTALLED_TABLE)
			.map_err(|e| StateError::LoadFailed { source: Box::new(e) })?;

		let mut records = Vec::new();
		for item in table.iter().map_err(|e| StateError::LoadFailed { source: Box::new(e) })? {
			let (key, value) = item.map_err(|e| StateError::LoadFailed { source: Box::new(e) })?;
			let depot_id: DepotId = match key.value().parse() {
				Ok(id) => id,
				Err(_) => continue,
			};
			if let Ok(version) = decode(value.value()) {
				records.push((depot_id, version));
			}
		}
		records.sort_by_key(|(id, _)| *id);
		Ok(records)
	}
}

fn encode(version: InstalledVersion) -> Result<Vec<u8>, StateError> {
	let record = InstalledVersionRecord {
		manifest: version.id().to_string(),
		updated: SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0),
	};
	let json = json5::to_string(&record).map_err(|e| StateError::SaveFailed { source: Box::new(e) })?;
	let payload = zstd::encode_all(json.as_bytes(), ZSTD_LEVEL)
		.map_err(|e| StateError::SaveFailed { source: Box::new(e) })?;

	let mut value = blake3::hash(&payload).as_bytes().to_vec();
	value.extend_from_slice(&payload);
	Ok(value)
}

fn decode(value: &[u8]) -> Result<InstalledVersion, StateError> {
	if value.len() < DIGEST_LEN {
		return Err(StateError::Corrupted { message: "record too short".to_string() });
	}
	let (digest, payload) = value.split_at(DIGEST_LEN);
	if blake3::hash(payload).as_bytes() != digest {
		return Err(StateError::Corrupted { message: "digest mismatch".to_string() });
	}

	let json = zstd::decode_all(payload)
		.map_err(|e| StateError::Corrupted { message: format!("decompress: {}", e) })?;
	let text = std::str::from_utf8(&json)
		.map_err(|e| StateError::Corrupted { message: format!("utf-8: {}", e) })?;
	let record: InstalledVersionRecord =
		json5::from_str(text).map_err(|e| StateError::Corrupted { message: e.to_string() })?;
	let id: ManifestId = record.manifest.parse().map_err(|_| StateError::Corrupted {
		message: format!("bad manifest id {:?}", record.manifest),
	})?;
	Ok(InstalledVersion::from_id(id))
}


// vim: ts=4
