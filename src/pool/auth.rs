//! Authorization material cache with request coalescing
//!
//! Resource tokens are keyed by `"{depot}:{top level host}"` and depot keys by
//! depot id. Concurrent requests for the same key share one in-flight call.
//! Successful results stay cached for the session; failures are evicted so a
//! later caller can try again.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::logging::*;
use crate::remote::{AuthService, FetchError, FetchResult};
use crate::types::{AppId, DepotId};

type InFlight<T> = Shared<BoxFuture<'static, FetchResult<T>>>;

/// Single-flight map from a request key to its (possibly pending) result
struct FlightMap<K, T: Clone> {
	entries: Mutex<HashMap<K, InFlight<T>>>,
}

impl<K: Eq + Hash + Clone, T: Clone> FlightMap<K, T> {
	fn new() -> Self {
		FlightMap { entries: Mutex::new(HashMap::new()) }
	}

	async fn get_or_fetch<F>(&self, key: K, fetch: F) -> FetchResult<T>
	where
		F: FnOnce() -> BoxFuture<'static, FetchResult<T>>,
	{
		let flight = {
			let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
			entries.entry(key.clone()).or_insert_with(|| fetch().shared()).clone()
		};

		let result = flight.clone().await;
		if result.is_err() {
			let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
			if entries.get(&key).is_some_and(|current| current.ptr_eq(&flight)) {
				entries.remove(&key);
			}
		}
		result
	}
}

pub struct AuthCache {
	service: Arc<dyn AuthService>,
	token_scopes: Vec<String>,
	request_timeout: Duration,
	tokens: FlightMap<String, Arc<str>>,
	depot_keys: FlightMap<DepotId, Option<Arc<[u8]>>>,
}

impl AuthCache {
	pub fn new(
		service: Arc<dyn AuthService>,
		token_scopes: Vec<String>,
		request_timeout: Duration,
	) -> Self {
		AuthCache {
			service,
			token_scopes,
			request_timeout,
			tokens: FlightMap::new(),
			depot_keys: FlightMap::new(),
		}
	}

	/// Access token for `depot_id` on the top-level host of `host`
	///
	/// A refusal from the auth service is reported as `FetchError::Unauthorized`.
	pub async fn token(&self, app_id: AppId, depot_id: DepotId, host: &str) -> FetchResult<Arc<str>> {
		let top_level = resolve_top_level_host(host, &self.token_scopes);
		let key = format!("{}:{}", depot_id, top_level);

		let service = self.service.clone();
		let timeout = self.request_timeout;
		self.tokens
			.get_or_fetch(key, move || {
				async move {
					debug!("Requesting auth token for depot {} on {}", depot_id, top_level);
					let reply = tokio::time::timeout(
						timeout,
						service.resource_auth_token(app_id, depot_id, &top_level),
					)
					.await
					.unwrap_or(Err(FetchError::Timeout));
					match reply {
						Ok(Some(token)) => Ok(Arc::<str>::from(token)),
						Ok(None) => {
							warn!("Failed to retrieve auth token for {} depot {}", top_level, depot_id);
							Err(FetchError::Unauthorized)
						}
						Err(e) => Err(e),
					}
				}
				.boxed()
			})
			.await
	}

	/// Decryption key of a depot, `None` when access is denied
	pub async fn depot_key(&self, depot_id: DepotId, app_id: AppId) -> FetchResult<Option<Arc<[u8]>>> {
		let service = self.service.clone();
		let timeout = self.request_timeout;
		self.depot_keys
			.get_or_fetch(depot_id, move || {
				async move {
					tokio::time::timeout(timeout, service.depot_key(depot_id, app_id))
						.await
						.unwrap_or(Err(FetchError::Timeout))
						.map(|key| key.map(Arc::<[u8]>::from))
				}
				.boxed()
			})
			.await
	}
}

/// Map a concrete host to the authorization scope it belongs to
///
/// The longest configured scope that equals the host or is a dot-separated
/// suffix of it wins; hosts outside every scope are their own scope.
pub fn resolve_top_level_host(host: &str, scopes: &[String]) -> String {
	scopes
		.iter()
		.filter(|scope| {
			host == scope.as_str()
				|| (host.len() > scope.len()
					&& host.ends_with(scope.as_str())
					&& host.as_bytes()[host.len() - scope.len() - 1] == b'.')
		})
		.max_by_key(|scope| scope.len())
		.cloned()
		.unwrap_or_else(|| host.to_string())
}


// vim: ts=4
