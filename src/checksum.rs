//! Checksums used for chunk verification
//!
//! Chunks carry two digests: a BLAKE3 content id used to match chunks across
//! manifest versions, and a cheap Adler-32 checksum used to verify bytes that
//! are already on disk before they are reused.

use crate::types::ChunkId;

const ADLER_MOD: u32 = 65521;

/// Largest block that can be summed without the 32-bit accumulators overflowing
const ADLER_NMAX: usize = 5552;

/// Adler-32 checksum of `data`
pub fn adler32(data: &[u8]) -> u32 {
	let mut a: u32 = 1;
	let mut b: u32 = 0;

	for block in data.chunks(ADLER_NMAX) {
		for &byte in block {
			a += u32::from(byte);
			b += a;
		}
		a %= ADLER_MOD;
		b %= ADLER_MOD;
	}

	(b << 16) | a
}

/// Content id of a chunk
pub fn chunk_id(data: &[u8]) -> ChunkId {
	ChunkId(*blake3::hash(data).as_bytes())
}

/// Incremental whole-file hash
#[derive(Default)]
pub struct ContentHasher {
	inner: blake3::Hasher,
}

impl ContentHasher {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn update(&mut self, data: &[u8]) {
		self.inner.update(data);
	}

	pub fn finalize(&self) -> [u8; 32] {
		*self.inner.finalize().as_bytes()
	}
}

/// BLAKE3 digest rendered as hex, used for detached sidecar checksums
pub fn digest_hex(data: &[u8]) -> String {
	blake3::hash(data).to_hex().to_string()
}


// vim: ts=4
