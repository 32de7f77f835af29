//! Pool of authorized content server connections
//!
//! The pool keeps two collections: a queue of ranked endpoints fed by a
//! background monitor task, and a bag of endpoints that already served a
//! request successfully. Leases are drawn from the bag first. Broken leases
//! are dropped, so a failing endpoint only comes back if the directory
//! advertises it again.
//!
//! When the directory runs dry, or the queue is empty while the directory
//! session is disconnected, the pool cancels the exhaustion token it was
//! started with so that waiting downloads unwind instead of hanging.

pub mod auth;
pub mod directory;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::logging::*;
use crate::remote::DirectoryService;
use crate::types::{AppId, DepotId, ServerEndpoint};

pub use auth::AuthCache;
pub use directory::EndpointDirectory;

/// An endpoint paired with the token authorizing one depot on it
#[derive(Debug, Clone)]
pub struct ConnectionLease {
	pub endpoint: ServerEndpoint,
	pub token: Arc<str>,
}

struct PoolInner {
	available: Mutex<VecDeque<ServerEndpoint>>,
	active: Mutex<Vec<ServerEndpoint>>,
	/// Signalled when either collection gains an endpoint
	supply: Notify,
	/// Wakes the monitor ahead of its poll interval
	populate: Notify,
	shutdown: CancellationToken,
	exhaustion: CancellationToken,
	exhausted: AtomicBool,
	minimum_endpoints: usize,
	poll_interval: Duration,
}

impl PoolInner {
	fn available_len(&self) -> usize {
		self.available.lock().unwrap_or_else(|e| e.into_inner()).len()
	}

	fn take_endpoint(&self) -> Option<ServerEndpoint> {
		if let Some(endpoint) = self.active.lock().unwrap_or_else(|e| e.into_inner()).pop() {
			return Some(endpoint);
		}

		let mut available = self.available.lock().unwrap_or_else(|e| e.into_inner());
		if available.len() < self.minimum_endpoints {
			self.populate.notify_one();
		}
		available.pop_front()
	}

	fn mark_exhausted(&self, reason: &str) {
		warn!("Content servers exhausted: {}", reason);
		self.exhausted.store(true, Ordering::SeqCst);
		self.exhaustion.cancel();
		self.supply.notify_waiters();
	}
}

pub struct ServerPool {
	inner: Arc<PoolInner>,
	auth: Arc<AuthCache>,
	monitor: Mutex<Option<JoinHandle<()>>>,
}

impl ServerPool {
	/// Create the pool and spawn its monitor task
	///
	/// `exhaustion` is cancelled when no more endpoints can be found.
	pub fn start(
		directory: Arc<dyn DirectoryService>,
		auth: Arc<AuthCache>,
		config: &PoolConfig,
		exhaustion: CancellationToken,
	) -> Self {
		let inner = Arc::new(PoolInner {
			available: Mutex::new(VecDeque::new()),
			active: Mutex::new(Vec::new()),
			supply: Notify::new(),
			populate: Notify::new(),
			shutdown: CancellationToken::new(),
			exhaustion,
			exhausted: AtomicBool::new(false),
			minimum_endpoints: config.minimum_endpoints,
			poll_interval: config.poll_interval(),
		});

		// first monitor pass runs immediately
		inner.populate.notify_one();

		let directory = EndpointDirectory::new(directory, config);
		let monitor = tokio::spawn(monitor_loop(inner.clone(), directory));

		ServerPool { inner, auth, monitor: Mutex::new(Some(monitor)) }
	}

	pub fn auth(&self) -> &Arc<AuthCache> {
		&self.auth
	}

	/// Check out an endpoint authorized for `depot_id`
	///
	/// Waits until an endpoint is available, `cancel` fires, or the pool
	/// stops supplying endpoints. Token requests that fail transiently are
	/// retried after a poll interval; only a refusal is returned.
	pub async fn acquire(
		&self,
		app_id: AppId,
		depot_id: DepotId,
		cancel: &CancellationToken,
	) -> Result<ConnectionLease, PoolError> {
		loop {
			let endpoint = self.next_endpoint(cancel).await?;

			let token = tokio::select! {
				_ = cancel.cancelled() => {
					self.put_back(endpoint);
					return Err(PoolError::Cancelled);
				}
				t = self.auth.token(app_id, depot_id, &endpoint.host) => t,
			};

			match token {
				Ok(token) => return Ok(ConnectionLease { endpoint, token }),
				Err(e) if e.is_auth_rejection() => {
					self.put_back(endpoint);
					return Err(PoolError::Authorization(e));
				}
				Err(e) => {
					warn!("Auth token request for {} failed: {}, retrying", endpoint.host, e);
					self.put_back(endpoint);
					tokio::select! {
						_ = cancel.cancelled() => return Err(PoolError::Cancelled),
						_ = self.inner.shutdown.cancelled() => return Err(PoolError::ShutDown),
						_ = tokio::time::sleep(self.inner.poll_interval) => {}
					}
				}
			}
		}
	}

	async fn next_endpoint(&self, cancel: &CancellationToken) -> Result<ServerEndpoint, PoolError> {
		loop {
			let notified = self.inner.supply.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();

			if let Some(endpoint) = self.inner.take_endpoint() {
				return Ok(endpoint);
			}
			if self.inner.exhausted.load(Ordering::SeqCst) || self.inner.shutdown.is_cancelled() {
				return Err(PoolError::ShutDown);
			}

			tokio::select! {
				_ = cancel.cancelled() => return Err(PoolError::Cancelled),
				_ = self.inner.shutdown.cancelled() => return Err(PoolError::ShutDown),
				_ = &mut notified => {}
			}
		}
	}

	fn put_back(&self, endpoint: ServerEndpoint) {
		self.inner.active.lock().unwrap_or_else(|e| e.into_inner()).push(endpoint);
		self.inner.supply.notify_waiters();
	}

	/// Return a lease; only healthy leases are reused
	pub fn release(&self, lease: ConnectionLease, healthy: bool) {
		if healthy {
			self.put_back(lease.endpoint);
		} else {
			debug!("Dropping broken connection to {}", lease.endpoint.host);
		}
	}

	pub fn is_exhausted(&self) -> bool {
		self.inner.exhausted.load(Ordering::SeqCst)
	}

	pub fn available_count(&self) -> usize {
		self.inner.available_len()
	}

	/// Stop the monitor task and wait for it to exit
	pub async fn shutdown(&self) {
		self.inner.shutdown.cancel();
		self.inner.supply.notify_waiters();
		let monitor = self.monitor.lock().unwrap_or_else(|e| e.into_inner()).take();
		if let Some(handle) = monitor {
			if let Err(e) = handle.await {
				warn!("Server pool monitor ended abnormally: {}", e);
			}
		}
	}
}

impl Drop for ServerPool {
	fn drop(&mut self) {
		self.inner.shutdown.cancel();
	}
}

async fn monitor_loop(inner: Arc<PoolInner>, directory: EndpointDirectory) {
	let mut did_populate = false;

	loop {
		tokio::select! {
			_ = inner.shutdown.cancelled() => break,
			_ = inner.populate.notified() => {}
			_ = tokio::time::sleep(inner.poll_interval) => {}
		}

		let available = inner.available_len();
		let connected = directory.is_connected();

		if available < inner.minimum_endpoints && connected {
			let servers = match directory.fetch(&inner.shutdown).await {
				Some(servers) => servers,
				None => break,
			};
			if servers.is_empty() {
				inner.mark_exhausted("directory returned no content servers");
				break;
			}

			debug!("Adding {} endpoint entries to the pool", servers.len());
			inner.available.lock().unwrap_or_else(|e| e.into_inner()).extend(servers);
			inner.supply.notify_waiters();
			did_populate = true;
		} else if available == 0 && !connected && did_populate {
			inner.mark_exhausted("directory session disconnected");
			break;
		}
	}

	debug!("Server pool monitor stopped");
}


// vim: ts=4
