//! End-to-end depot sync scenarios against the in-memory backend
//!
//! This test suite covers:
//! - Fresh installs and whole-file hash reconstruction
//! - Updates that reuse old chunks instead of downloading them
//! - Idempotent re-runs and manifest cache reuse
//! - The incomplete sentinel after failed or cancelled syncs

mod common;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use common::*;
use depotsync::manifest::ManifestCache;
use depotsync::{InstalledVersion, InstalledVersionStore, SyncError, SyncEvent};

fn installed(dir: &std::path::Path) -> Option<InstalledVersion> {
	InstalledVersionStore::open(dir).unwrap().get(DEPOT).unwrap()
}

// ============================================================================
// Fresh installs
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fresh_install_rebuilds_every_file() {
	let mock = MockDepot::new();
	let big = content(1, 10 * CHUNK + 17);
	let small = content(2, 300);
	let manifest = mock.publish(
		DEPOT,
		100,
		&[("bin/game.exe", big.clone()), ("readme.txt", small.clone()), ("empty.dat", Vec::new())],
	);

	let dir = TempDir::new().unwrap();
	let summary = engine(&mock, test_config())
		.start_sync(APP, DEPOT, 100, dir.path(), &CancellationToken::new())
		.await
		.unwrap();

	assert_file(dir.path(), "bin/game.exe", &big);
	assert_file(dir.path(), "readme.txt", &small);
	assert_file(dir.path(), "empty.dat", &[]);
	for entry in &manifest.files {
		let data = std::fs::read(entry.local_path(dir.path())).unwrap();
		assert_eq!(*blake3::hash(&data).as_bytes(), entry.content_hash, "hash of {}", entry.path);
	}

	assert_eq!(summary.file_count, 3);
	assert_eq!(summary.uncompressed_bytes, (big.len() + small.len()) as u64);
	assert_eq!(installed(dir.path()), Some(InstalledVersion::Manifest(100)));
}

#[tokio::test]
async fn test_progress_events_reach_callback() {
	let mock = MockDepot::new();
	mock.publish(DEPOT, 7, &[("a.bin", content(1, 3 * CHUNK)), ("b.bin", content(2, CHUNK))]);

	let completed = Arc::new(Mutex::new(Vec::new()));
	let finished = Arc::new(Mutex::new(None));
	let (c, f) = (completed.clone(), finished.clone());

	let engine = depotsync::SyncBuilder::new(depotsync::Services::from_backend(mock.clone()))
		.config(test_config())
		.on_progress(move |event: SyncEvent| match event {
			SyncEvent::FileCompleted { path, .. } => c.lock().unwrap().push(path),
			SyncEvent::Finished { completed, .. } => *f.lock().unwrap() = Some(completed),
			_ => {}
		})
		.build()
		.unwrap();

	let dir = TempDir::new().unwrap();
	engine.start_sync(APP, DEPOT, 7, dir.path(), &CancellationToken::new()).await.unwrap();

	let mut paths = completed.lock().unwrap().clone();
	paths.sort();
	assert_eq!(paths, vec!["a.bin".to_string(), "b.bin".to_string()]);
	assert_eq!(*finished.lock().unwrap(), Some(true));
}

// ============================================================================
// Updates
// ============================================================================

#[tokio::test]
async fn test_unchanged_file_is_not_downloaded_again() {
	let mock = MockDepot::new();
	let stable = content(1, 4 * CHUNK);
	mock.publish(DEPOT, 1, &[("stable.pak", stable.clone()), ("patch.pak", content(2, 2 * CHUNK))]);
	let v2 =
		mock.publish(DEPOT, 2, &[("stable.pak", stable.clone()), ("patch.pak", content(3, 2 * CHUNK))]);

	let dir = TempDir::new().unwrap();
	let engine = engine(&mock, test_config());
	engine.start_sync(APP, DEPOT, 1, dir.path(), &CancellationToken::new()).await.unwrap();
	engine.start_sync(APP, DEPOT, 2, dir.path(), &CancellationToken::new()).await.unwrap();

	let stable_entry = v2.files.iter().find(|f| f.path == "stable.pak").unwrap();
	for chunk in &stable_entry.chunks {
		assert_eq!(mock.downloads_of(&chunk.id), 1);
	}
	assert_file(dir.path(), "stable.pak", &stable);
	assert_file(dir.path(), "patch.pak", &content(3, 2 * CHUNK));
	assert_eq!(installed(dir.path()), Some(InstalledVersion::Manifest(2)));
}

#[tokio::test]
async fn test_moved_chunk_is_copied_from_old_file() {
	let mock = MockDepot::new();
	let a = content(10, CHUNK);
	let b = content(11, CHUNK);
	let c = content(12, CHUNK);
	mock.publish_chunked(DEPOT, 1, &[("data.bin", vec![a.clone(), b.clone()])]);
	let v2 = mock.publish_chunked(DEPOT, 2, &[("data.bin", vec![b.clone(), c.clone()])]);

	let dir = TempDir::new().unwrap();
	let engine = engine(&mock, test_config());
	engine.start_sync(APP, DEPOT, 1, dir.path(), &CancellationToken::new()).await.unwrap();
	let summary =
		engine.start_sync(APP, DEPOT, 2, dir.path(), &CancellationToken::new()).await.unwrap();

	let new_chunks = &v2.files[0].chunks;
	assert_eq!(mock.downloads_of(&new_chunks[0].id), 1, "B only downloaded for v1");
	assert_eq!(mock.downloads_of(&new_chunks[1].id), 1, "C downloaded for v2");
	assert_eq!(summary.uncompressed_bytes, CHUNK as u64);

	let expected: Vec<u8> = b.iter().chain(c.iter()).copied().collect();
	assert_file(dir.path(), "data.bin", &expected);
	assert!(!dir.path().join(".depotsync/staging/data.bin").exists());
}

#[tokio::test]
async fn test_damaged_local_chunk_is_downloaded() {
	let mock = MockDepot::new();
	let old = content(1, 3 * CHUNK);
	let mut new = old.clone();
	new.extend_from_slice(&content(2, CHUNK));
	mock.publish(DEPOT, 1, &[("f.bin", old.clone())]);
	let v2 = mock.publish(DEPOT, 2, &[("f.bin", new.clone())]);

	let dir = TempDir::new().unwrap();
	let engine = engine(&mock, test_config());
	engine.start_sync(APP, DEPOT, 1, dir.path(), &CancellationToken::new()).await.unwrap();

	// corrupt the middle chunk behind the engine's back
	let path = dir.path().join("f.bin");
	let mut bytes = std::fs::read(&path).unwrap();
	bytes[CHUNK + 5] ^= 0xff;
	std::fs::write(&path, bytes).unwrap();

	engine.start_sync(APP, DEPOT, 2, dir.path(), &CancellationToken::new()).await.unwrap();
	assert_file(dir.path(), "f.bin", &new);
	let chunks = &v2.files[0].chunks;
	assert_eq!(mock.downloads_of(&chunks[0].id), 1);
	assert_eq!(mock.downloads_of(&chunks[1].id), 2);
}

#[tokio::test]
async fn test_second_run_downloads_nothing() {
	let mock = MockDepot::new();
	mock.publish(DEPOT, 5, &[("a.bin", content(1, 5 * CHUNK)), ("b/c.bin", content(2, 700))]);

	let dir = TempDir::new().unwrap();
	let engine = engine(&mock, test_config());
	engine.start_sync(APP, DEPOT, 5, dir.path(), &CancellationToken::new()).await.unwrap();
	let before = mock.total_downloads();

	let summary =
		engine.start_sync(APP, DEPOT, 5, dir.path(), &CancellationToken::new()).await.unwrap();
	assert_eq!(mock.total_downloads(), before);
	assert_eq!(summary.compressed_bytes, 0);
	assert_eq!(summary.file_count, 2);
}

#[tokio::test]
async fn test_verify_all_repairs_tampered_file() {
	let mock = MockDepot::new();
	let data = content(4, 3 * CHUNK);
	mock.publish(DEPOT, 5, &[("a.bin", data.clone())]);

	let dir = TempDir::new().unwrap();
	engine(&mock, test_config())
		.start_sync(APP, DEPOT, 5, dir.path(), &CancellationToken::new())
		.await
		.unwrap();
	std::fs::write(dir.path().join("a.bin"), b"tampered").unwrap();

	let mut config = test_config();
	config.verify_all = true;
	engine(&mock, config)
		.start_sync(APP, DEPOT, 5, dir.path(), &CancellationToken::new())
		.await
		.unwrap();
	assert_file(dir.path(), "a.bin", &data);
}

#[tokio::test]
async fn test_existing_files_without_record_are_validated_in_place() {
	let mock = MockDepot::new();
	let data = content(6, 4 * CHUNK);
	mock.publish(DEPOT, 9, &[("a.bin", data.clone())]);

	let dir = TempDir::new().unwrap();
	let mut stale = data.clone();
	stale[10] ^= 1;
	stale.truncate(3 * CHUNK);
	std::fs::write(dir.path().join("a.bin"), &stale).unwrap();

	engine(&mock, test_config())
		.start_sync(APP, DEPOT, 9, dir.path(), &CancellationToken::new())
		.await
		.unwrap();
	assert_file(dir.path(), "a.bin", &data);
	// first chunk was damaged, last one missing; the middle two were kept
	assert_eq!(mock.total_downloads(), 2);
}

// ============================================================================
// Manifest cache
// ============================================================================

#[tokio::test]
async fn test_installed_manifest_is_not_downloaded_again() {
	let mock = MockDepot::new();
	mock.publish(DEPOT, 3, &[("a.bin", content(1, CHUNK))]);

	let dir = TempDir::new().unwrap();
	let engine = engine(&mock, test_config());
	engine.start_sync(APP, DEPOT, 3, dir.path(), &CancellationToken::new()).await.unwrap();
	engine.start_sync(APP, DEPOT, 3, dir.path(), &CancellationToken::new()).await.unwrap();

	assert_eq!(mock.manifest_calls.load(Ordering::SeqCst), 1);
	assert!(ManifestCache::for_install(dir.path()).load(DEPOT, 3).is_some());
}

#[tokio::test]
async fn test_damaged_cached_manifest_is_fetched_again() {
	let mock = MockDepot::new();
	mock.publish(DEPOT, 3, &[("a.bin", content(1, CHUNK))]);

	let dir = TempDir::new().unwrap();
	let engine = engine(&mock, test_config());
	engine.start_sync(APP, DEPOT, 3, dir.path(), &CancellationToken::new()).await.unwrap();

	let cache = ManifestCache::for_install(dir.path());
	std::fs::write(cache.sidecar_path(DEPOT, 3), "0000").unwrap();

	engine.start_sync(APP, DEPOT, 3, dir.path(), &CancellationToken::new()).await.unwrap();
	assert_eq!(mock.manifest_calls.load(Ordering::SeqCst), 2);
	assert!(cache.load(DEPOT, 3).is_some());
}

// ============================================================================
// Failures and the incomplete sentinel
// ============================================================================

#[tokio::test]
async fn test_exhausted_pool_leaves_sentinel_and_next_run_resumes() {
	let mock = MockDepot::new();
	let a = content(1, 2 * CHUNK);
	mock.publish(DEPOT, 1, &[("a.bin", a.clone()), ("b.bin", content(2, CHUNK))]);
	let b2 = content(3, 3 * CHUNK);
	mock.publish(DEPOT, 2, &[("a.bin", a.clone()), ("b.bin", b2.clone())]);

	let dir = TempDir::new().unwrap();
	let engine = engine(&mock, test_config());
	engine.start_sync(APP, DEPOT, 1, dir.path(), &CancellationToken::new()).await.unwrap();

	mock.withdraw_servers(true);
	let result = tokio::time::timeout(
		Duration::from_secs(10),
		engine.start_sync(APP, DEPOT, 2, dir.path(), &CancellationToken::new()),
	)
	.await
	.expect("sync must not hang once the servers are gone");
	assert!(matches!(result, Err(SyncError::DirectoryExhausted)), "got {:?}", result);
	assert_eq!(installed(dir.path()), Some(InstalledVersion::Incomplete));

	mock.withdraw_servers(false);
	mock.set_endpoints(vec![depotsync::ServerEndpoint::new(
		"cache3.content.test",
		depotsync::ServerKind::Cache,
	)]);
	engine.start_sync(APP, DEPOT, 2, dir.path(), &CancellationToken::new()).await.unwrap();
	assert_file(dir.path(), "a.bin", &a);
	assert_file(dir.path(), "b.bin", &b2);
	assert_eq!(installed(dir.path()), Some(InstalledVersion::Manifest(2)));
	// the manifest cached by the failed run was reused
	assert_eq!(mock.manifest_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_forbidden_chunk_aborts_session() {
	let mock = MockDepot::new();
	let a = content(1, CHUNK);
	let b = content(2, 2 * CHUNK);
	let c = content(3, 20 * CHUNK);
	let manifest =
		mock.publish(DEPOT, 4, &[("a.bin", a.clone()), ("b.bin", b.clone()), ("c.bin", c.clone())]);
	mock.forbid(manifest.files[1].chunks[1].id);
	mock.set_chunk_delay(Duration::from_millis(30));

	let mut config = test_config();
	config.max_downloads = 3;
	config.chunk_concurrency = 1;

	let dir = TempDir::new().unwrap();
	let result = engine(&mock, config)
		.start_sync(APP, DEPOT, 4, dir.path(), &CancellationToken::new())
		.await;

	assert!(matches!(result, Err(SyncError::Authorization { .. })), "got {:?}", result);
	assert_eq!(mock.forbidden_attempts.load(Ordering::SeqCst), 1);
	assert_file(dir.path(), "a.bin", &a);

	// the concurrent c.bin task stopped instead of finishing its chunks
	let c_fetched: usize = manifest.files[2].chunks.iter().map(|ch| mock.downloads_of(&ch.id)).sum();
	assert!(c_fetched < 10, "{} chunks of c.bin fetched after the abort", c_fetched);
	assert_eq!(installed(dir.path()), Some(InstalledVersion::Incomplete));
}

#[tokio::test]
async fn test_caller_cancellation() {
	let mock = MockDepot::new();
	mock.publish(
		DEPOT,
		8,
		&[
			("a.bin", content(1, 2 * CHUNK)),
			("b.bin", content(2, 4 * CHUNK)),
			("c.bin", content(3, 4 * CHUNK)),
		],
	);
	mock.set_chunk_delay(Duration::from_millis(20));

	let cancel = CancellationToken::new();
	let trigger = cancel.clone();
	let mut config = test_config();
	config.max_downloads = 1;
	config.chunk_concurrency = 1;
	let engine = depotsync::SyncBuilder::new(depotsync::Services::from_backend(mock.clone()))
		.config(config)
		.on_progress(move |event: SyncEvent| {
			if let SyncEvent::FileCompleted { .. } = event {
				trigger.cancel();
			}
		})
		.build()
		.unwrap();

	let dir = TempDir::new().unwrap();
	let result = engine.start_sync(APP, DEPOT, 8, dir.path(), &cancel).await;

	assert!(matches!(result, Err(SyncError::Cancelled)), "got {:?}", result);
	assert_eq!(installed(dir.path()), Some(InstalledVersion::Incomplete));
	assert!(mock.total_downloads() < 10);
}

#[tokio::test]
async fn test_unknown_manifest_is_unavailable() {
	let mock = MockDepot::new();
	mock.publish(DEPOT, 1, &[("a.bin", content(1, CHUNK))]);

	let dir = TempDir::new().unwrap();
	let result = engine(&mock, test_config())
		.start_sync(APP, DEPOT, 999, dir.path(), &CancellationToken::new())
		.await;
	assert!(matches!(result, Err(SyncError::ManifestUnavailable { manifest_id: 999, .. })));
	assert_eq!(installed(dir.path()), None);
}

#[tokio::test]
async fn test_unknown_depot_has_no_key() {
	let mock = MockDepot::new();
	let dir = TempDir::new().unwrap();
	let result = engine(&mock, test_config())
		.start_sync(APP, 12345, 1, dir.path(), &CancellationToken::new())
		.await;
	assert!(matches!(result, Err(SyncError::DepotKeyUnavailable { depot_id: 12345 })));
}

#[tokio::test]
async fn test_cancelled_before_start() {
	let mock = MockDepot::new();
	mock.publish(DEPOT, 1, &[("a.bin", content(1, CHUNK))]);
	let cancel = CancellationToken::new();
	cancel.cancel();

	let dir = TempDir::new().unwrap();
	let result = engine(&mock, test_config()).start_sync(APP, DEPOT, 1, dir.path(), &cancel).await;
	assert!(matches!(result, Err(SyncError::Cancelled)));
	assert_eq!(mock.total_downloads(), 0);
}

// vim: ts=4
