use std::sync::Arc;

use sd_task_system::TaskError;
use sd_utils::FieldError;
use thiserror::Error;

use super::{config::ConfigError, transport::TransportError};

/// Errors surfaced by remote connections and their watchdogs.
///
/// It is `Clone` because a single sync or ping outcome is handed to every caller waiting on it.
#[derive(Debug, Clone, Error)]
pub enum Error {
	/// Something that was asked for doesn't exist yet, like data that was never synchronized
	#[error("not available: {0}")]
	NotAvailable(String),
	/// The operation doesn't make sense in the current state, the caller must fix the precondition
	#[error("invalid state: {0}")]
	InvalidState(String),
	#[error("timed out: {0}")]
	Timeout(String),
	#[error("shutdown in progress")]
	ShutdownInProgress,
	#[error("interrupted: {0}")]
	Interrupted(String),
	/// An invariant was violated, these are bugs and are always logged
	#[error("fatal implementation error: {0}")]
	Fatal(String),
	/// The remote side raised an error while executing the method
	#[error("remote method <{method}> failed: {message}")]
	Remote { method: String, message: String },
	#[error(transparent)]
	Transport(#[from] TransportError),
	#[error("failed to decode {what}: {source}")]
	Decode {
		what: &'static str,
		#[source]
		source: Arc<rmp_serde::decode::Error>,
	},
	#[error("failed to encode {what}: {source}")]
	Encode {
		what: &'static str,
		#[source]
		source: Arc<rmp_serde::encode::Error>,
	},
	#[error(transparent)]
	Field(#[from] FieldError),
	#[error(transparent)]
	Config(Arc<ConfigError>),
}

impl Error {
	#[must_use]
	pub const fn is_timeout(&self) -> bool {
		matches!(self, Self::Timeout(_))
	}

	#[must_use]
	pub const fn is_shutdown(&self) -> bool {
		matches!(self, Self::ShutdownInProgress)
	}

	/// Every failure observed after shutdown was initiated is just a consequence of it
	#[must_use]
	pub fn after_shutdown(self, shutdown_initiated: bool) -> Self {
		if shutdown_initiated {
			Self::ShutdownInProgress
		} else {
			self
		}
	}
}

impl From<ConfigError> for Error {
	fn from(e: ConfigError) -> Self {
		Self::Config(Arc::new(e))
	}
}

impl From<TaskError> for Error {
	fn from(e: TaskError) -> Self {
		match e {
			TaskError::Shutdown => Self::ShutdownInProgress,
			TaskError::Canceled(id) => Self::Interrupted(format!("task <id='{id}'> was canceled")),
			TaskError::Panicked(id, msg) => Self::Fatal(format!("task <id='{id}'> panicked: {msg}")),
		}
	}
}
