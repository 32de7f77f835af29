//! Logging prelude module for convenient access to tracing macros.
//!
//! # Usage
//!
//! ```ignore
//! use crate::logging::*;
//!
//! info!("Depot {} up to date", depot_id);
//! warn!("Manifest {} on disk did not match the expected checksum", manifest_id);
//!
//! let span = info_span!("depot_sync", depot = depot_id);
//! run().instrument(span).await;
//! ```

use tracing_subscriber::EnvFilter;

pub use tracing::{debug, error, info, info_span, warn, Instrument};

/// Install the stderr subscriber, filtered by `RUST_LOG` or `default_level`.
///
/// ```bash
/// RUST_LOG=debug depotsync sync ...
/// RUST_LOG=depotsync::pool=debug depotsync sync ...
/// RUST_LOG=depotsync::fetch=debug,depotsync::sync=info depotsync sync ...
/// ```
///
/// A second call is a no-op.
pub fn init_tracing(default_level: &str) {
	let filter =
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
	let _ = tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(std::io::stderr)
		.with_target(false)
		.try_init();
}

// vim: ts=4
