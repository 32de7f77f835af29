//! Per-invocation sync session
//!
//! A session owns everything that lives for one depot sync: the server pool,
//! the cancellation token shared by every task, the first abort cause, and
//! the byte counters. Nothing here outlives the call to `start_sync`.

use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::error::SyncError;
use crate::logging::*;
use crate::pool::{AuthCache, ServerPool};
use crate::progress::{SyncCounters, SyncEvent, SyncProgressCallback};
use crate::remote::Services;
use crate::types::{AppId, DepotId};

pub struct SyncSession {
	id: Uuid,
	pub app_id: AppId,
	pub depot_id: DepotId,
	cancel: CancellationToken,
	abort_cause: Mutex<Option<SyncError>>,
	pool: ServerPool,
	pub counters: SyncCounters,
	callback: Option<Arc<dyn SyncProgressCallback>>,
}

impl SyncSession {
	/// Create a session and start its server pool
	///
	/// The session token is a child of `parent`: cancelling the caller's token
	/// cancels the session, never the other way round.
	pub fn start(
		app_id: AppId,
		depot_id: DepotId,
		services: &Services,
		config: &Config,
		parent: &CancellationToken,
		callback: Option<Arc<dyn SyncProgressCallback>>,
	) -> Self {
		let cancel = parent.child_token();
		let auth = Arc::new(AuthCache::new(
			services.auth.clone(),
			config.pool.token_scopes.clone(),
			config.pool.request_timeout(),
		));
		let pool = ServerPool::start(services.directory.clone(), auth, &config.pool, cancel.clone());

		SyncSession {
			id: Uuid::new_v4(),
			app_id,
			depot_id,
			cancel,
			abort_cause: Mutex::new(None),
			pool,
			counters: SyncCounters::new(),
			callback,
		}
	}

	pub fn id(&self) -> Uuid {
		self.id
	}

	pub fn pool(&self) -> &ServerPool {
		&self.pool
	}

	pub fn token(&self) -> &CancellationToken {
		&self.cancel
	}

	pub fn is_cancelled(&self) -> bool {
		self.cancel.is_cancelled()
	}

	/// Cancel the session, remembering `cause` if it is the first one
	pub fn abort(&self, cause: SyncError) {
		let mut slot = self.abort_cause.lock().unwrap_or_else(|e| e.into_inner());
		if slot.is_none() {
			error!("Aborting sync of depot {}: {}", self.depot_id, cause);
			*slot = Some(cause);
		}
		drop(slot);
		self.cancel.cancel();
	}

	/// Hand out the error that ended the session
	///
	/// The recorded cause is moved out, so only the first call sees it; later
	/// calls fall back to `DirectoryExhausted` or `Cancelled`.
	pub fn take_failure(&self) -> SyncError {
		if let Some(cause) = self.abort_cause.lock().unwrap_or_else(|e| e.into_inner()).take() {
			return cause;
		}
		if self.pool.is_exhausted() {
			SyncError::DirectoryExhausted
		} else {
			SyncError::Cancelled
		}
	}

	pub fn emit(&self, event: SyncEvent) {
		if let Some(callback) = &self.callback {
			callback.on_event(event);
		}
	}

	pub fn emit_progress(&self) {
		if self.callback.is_some() {
			self.emit(SyncEvent::Progress(self.counters.snapshot()));
		}
	}

	/// Stop the server pool
	pub async fn close(&self) {
		self.pool.shutdown().await;
	}
}


// vim: ts=4
