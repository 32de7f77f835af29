//! Transport-level errors reported by remote collaborators

use std::error::Error;
use std::fmt;

/// Failure of a single remote request
///
/// `Clone` so that one failed in-flight request can be handed to every
/// caller that was waiting on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
	/// HTTP 401
	Unauthorized,

	/// HTTP 403
	Forbidden,

	/// HTTP 429
	RateLimited,

	/// Any other HTTP status
	Status(u16),

	/// Request did not complete in time
	Timeout,

	/// Connection-level failure
	Transport { message: String },
}

impl FetchError {
	pub fn from_status(status: u16) -> Self {
		match status {
			401 => FetchError::Unauthorized,
			403 => FetchError::Forbidden,
			429 => FetchError::RateLimited,
			s => FetchError::Status(s),
		}
	}

	pub fn transport(message: impl Into<String>) -> Self {
		FetchError::Transport { message: message.into() }
	}

	/// Retrying will not help without new credentials
	pub fn is_auth_rejection(&self) -> bool {
		matches!(self, FetchError::Unauthorized | FetchError::Forbidden)
	}

	pub fn is_rate_limited(&self) -> bool {
		matches!(self, FetchError::RateLimited)
	}
}

impl fmt::Display for FetchError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			FetchError::Unauthorized => write!(f, "401 Unauthorized"),
			FetchError::Forbidden => write!(f, "403 Forbidden"),
			FetchError::RateLimited => write!(f, "429 Too Many Requests"),
			FetchError::Status(s) => write!(f, "HTTP status {}", s),
			FetchError::Timeout => write!(f, "Request timeout"),
			FetchError::Transport { message } => write!(f, "Transport error: {}", message),
		}
	}
}

impl Error for FetchError {}


// vim: ts=4
