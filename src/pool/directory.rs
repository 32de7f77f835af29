//! Candidate endpoint discovery
//!
//! Wraps a [`DirectoryService`] with a per-request timeout, capped linear
//! backoff on rate limiting, and the ranking/expansion applied to the raw
//! candidate list before it is handed to the pool.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::logging::*;
use crate::remote::{DirectoryService, FetchError};
use crate::types::ServerEndpoint;

/// Delay sequence for consecutive rate-limited responses: 1, 2, 3... units,
/// never more than `cap` units
#[derive(Debug, Clone)]
pub struct Backoff {
	unit: Duration,
	cap: u32,
	step: u32,
}

impl Backoff {
	pub fn new(unit: Duration, cap: u32) -> Self {
		Backoff { unit, cap, step: 0 }
	}

	pub fn next_delay(&mut self) -> Duration {
		self.step = (self.step + 1).min(self.cap);
		self.unit * self.step
	}

	pub fn reset(&mut self) {
		self.step = 0;
	}
}

pub struct EndpointDirectory {
	service: Arc<dyn DirectoryService>,
	cell_id: u32,
	request_timeout: Duration,
	retry_interval: Duration,
	backoff_unit: Duration,
	backoff_cap: u32,
}

impl EndpointDirectory {
	pub fn new(service: Arc<dyn DirectoryService>, config: &PoolConfig) -> Self {
		EndpointDirectory {
			service,
			cell_id: config.cell_id,
			request_timeout: config.request_timeout(),
			retry_interval: config.poll_interval(),
			backoff_unit: config.backoff_unit(),
			backoff_cap: config.backoff_cap,
		}
	}

	pub fn is_connected(&self) -> bool {
		self.service.is_connected()
	}

	/// Fetch and rank the candidate list, retrying until it succeeds
	///
	/// Returns `None` only when `cancel` fires.
	pub async fn fetch(&self, cancel: &CancellationToken) -> Option<Vec<ServerEndpoint>> {
		let mut backoff = Backoff::new(self.backoff_unit, self.backoff_cap);

		loop {
			let result = tokio::select! {
				_ = cancel.cancelled() => return None,
				r = tokio::time::timeout(
					self.request_timeout,
					self.service.list_endpoints(self.cell_id, cancel),
				) => r.unwrap_or(Err(FetchError::Timeout)),
			};

			let delay = match result {
				Ok(servers) => {
					debug!("Directory returned {} candidates", servers.len());
					return Some(rank(servers));
				}
				Err(e) if e.is_rate_limited() => {
					let delay = backoff.next_delay();
					warn!("Failed to retrieve content server list: {}, retrying in {:?}", e, delay);
					delay
				}
				Err(e) => {
					warn!("Failed to retrieve content server list: {}", e);
					self.retry_interval
				}
			};

			tokio::select! {
				_ = cancel.cancelled() => return None,
				_ = tokio::time::sleep(delay) => {}
			}
		}
	}
}

/// Keep content servers, best first, each repeated by its capacity weight
pub fn rank(servers: Vec<ServerEndpoint>) -> Vec<ServerEndpoint> {
	let mut candidates: Vec<ServerEndpoint> =
		servers.into_iter().filter(|s| s.kind.serves_content()).collect();
	candidates.sort_by(|a, b| {
		a.penalty.cmp(&b.penalty).then(a.weighted_load.total_cmp(&b.weighted_load))
	});

	let mut expanded = Vec::new();
	for server in candidates {
		for _ in 0..server.num_entries {
			expanded.push(server.clone());
		}
	}
	expanded
}


// vim: ts=4
