//! Per-file chunk planning between two manifest versions
//!
//! The differ is pure: it decides from the two manifest entries (and whether
//! the file exists) what has to happen to the file. Reading old bytes and
//! verifying them is left to the reconciler.

use std::collections::HashMap;

use crate::types::{ChunkEntry, ChunkId, FileEntry};

/// A chunk of the new file whose content id also appears in the old file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMatch {
	/// Where the bytes are in the old file
	pub old: ChunkEntry,
	/// Where they go in the new file
	pub new: ChunkEntry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilePlan {
	/// Whole-file hash unchanged, nothing to do
	UpToDate,

	/// Start from an empty file of the final length and fetch every chunk
	Create { needed: Vec<ChunkEntry> },

	/// Rebuild from the old file: copy `matches` that verify, fetch `unmatched`
	Patch { matches: Vec<ChunkMatch>, unmatched: Vec<ChunkEntry> },

	/// No lineage for an existing file: check every chunk against the bytes
	/// currently at its offset and fetch the ones that differ
	ValidateInPlace,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestDiffer {
	/// Re-check chunks even when the whole-file hash is unchanged
	pub verify_all: bool,
	/// Validate existing files without an old entry in place instead of
	/// recreating them
	pub validate_unlinked_files: bool,
}

impl ManifestDiffer {
	pub fn new(verify_all: bool, validate_unlinked_files: bool) -> Self {
		ManifestDiffer { verify_all, validate_unlinked_files }
	}

	/// Plan the work for `new`, given its entry in the old manifest (if any)
	/// and whether a file already exists at its path
	pub fn plan(&self, old: Option<&FileEntry>, new: &FileEntry, exists: bool) -> FilePlan {
		if !exists {
			return FilePlan::Create { needed: new.chunks.clone() };
		}

		match old.filter(|o| !o.is_directory()) {
			Some(old) => {
				if !self.verify_all && old.content_hash == new.content_hash {
					return FilePlan::UpToDate;
				}
				let (matches, unmatched) = match_chunks(old, new);
				FilePlan::Patch { matches, unmatched }
			}
			None if self.validate_unlinked_files => FilePlan::ValidateInPlace,
			None => FilePlan::Create { needed: new.chunks.clone() },
		}
	}
}

/// Pair every chunk of `new` with the first chunk of `old` that has the same
/// content id, regardless of position
pub fn match_chunks(old: &FileEntry, new: &FileEntry) -> (Vec<ChunkMatch>, Vec<ChunkEntry>) {
	let mut by_id: HashMap<ChunkId, &ChunkEntry> = HashMap::new();
	for chunk in &old.chunks {
		by_id.entry(chunk.id).or_insert(chunk);
	}

	let mut matches = Vec::new();
	let mut unmatched = Vec::new();
	for chunk in &new.chunks {
		match by_id.get(&chunk.id) {
			Some(old_chunk) => {
				matches.push(ChunkMatch { old: (*old_chunk).clone(), new: chunk.clone() })
			}
			None => unmatched.push(chunk.clone()),
		}
	}
	(matches, unmatched)
}


// vim: ts=4
