use std::{path::Path, time::Duration};

use sd_utils::error::FileIOError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error(transparent)]
	FileIO(#[from] FileIOError),
	#[error("failed to (de)serialize remote config: {0}")]
	SerdeJson(#[from] serde_json::Error),
}

/// Supervision delays for a single watchdog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
	/// Delay between activation attempts while the service isn't running
	pub retry_delay_ms: u64,
	/// Delay between health checks once the service is running
	pub healthy_delay_ms: u64,
	pub deactivation_timeout_ms: u64,
}

impl Default for WatchdogConfig {
	fn default() -> Self {
		Self {
			retry_delay_ms: 1_000,
			healthy_delay_ms: 60_000,
			deactivation_timeout_ms: 10_000,
		}
	}
}

impl WatchdogConfig {
	#[must_use]
	pub const fn retry_delay(&self) -> Duration {
		Duration::from_millis(self.retry_delay_ms)
	}

	#[must_use]
	pub const fn healthy_delay(&self) -> Duration {
		Duration::from_millis(self.healthy_delay_ms)
	}

	#[must_use]
	pub const fn deactivation_timeout(&self) -> Duration {
		Duration::from_millis(self.deactivation_timeout_ms)
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
	/// Timeout of the first attempt of any retried RPC call
	pub rpc_initial_timeout_ms: u64,
	/// Growth factor of the attempt timeout after each timed out attempt
	pub rpc_timeout_ratio: f64,
	/// Relative random deviation applied to every attempt timeout
	pub rpc_timeout_jitter: f64,
	pub rpc_max_timeout_ms: u64,
	pub ping_timeout_ms: u64,
	/// After failing for this long, sync retries are logged as warnings instead of debug
	pub sync_warn_threshold_ms: u64,
	pub lock_warn_threshold_ms: u64,
	/// A maintainer holding a connection for longer than this is reported
	pub lock_deadline_ms: u64,
	/// Skips self-healing after invariant violations, so they surface as errors
	pub debug_mode: bool,
	pub watchdog: WatchdogConfig,
}

impl Default for RemoteConfig {
	fn default() -> Self {
		Self {
			rpc_initial_timeout_ms: 500,
			rpc_timeout_ratio: 1.2,
			rpc_timeout_jitter: 0.1,
			rpc_max_timeout_ms: 30_000,
			ping_timeout_ms: 1_000,
			sync_warn_threshold_ms: 10_000,
			lock_warn_threshold_ms: 500,
			lock_deadline_ms: 10 * 60 * 1_000,
			debug_mode: false,
			watchdog: WatchdogConfig::default(),
		}
	}
}

impl RemoteConfig {
	pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref();

		let bytes = fs::read(path).await.map_err(|e| {
			FileIOError::from_std_io_err_with_msg(path, e, "Failed to read remote config file")
		})?;

		Ok(serde_json::from_slice(&bytes)?)
	}

	pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
		let path = path.as_ref();

		fs::write(path, serde_json::to_vec_pretty(self)?)
			.await
			.map_err(|e| {
				FileIOError::from_std_io_err_with_msg(path, e, "Failed to write remote config file")
			})?;

		Ok(())
	}

	#[must_use]
	pub const fn rpc_initial_timeout(&self) -> Duration {
		Duration::from_millis(self.rpc_initial_timeout_ms)
	}

	#[must_use]
	pub const fn rpc_max_timeout(&self) -> Duration {
		Duration::from_millis(self.rpc_max_timeout_ms)
	}

	#[must_use]
	pub const fn ping_timeout(&self) -> Duration {
		Duration::from_millis(self.ping_timeout_ms)
	}

	#[must_use]
	pub const fn sync_warn_threshold(&self) -> Duration {
		Duration::from_millis(self.sync_warn_threshold_ms)
	}

	#[must_use]
	pub const fn lock_warn_threshold(&self) -> Duration {
		Duration::from_millis(self.lock_warn_threshold_ms)
	}

	#[must_use]
	pub const fn lock_deadline(&self) -> Duration {
		Duration::from_millis(self.lock_deadline_ms)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn missing_fields_use_defaults() {
		let dir = tempfile::tempdir().expect("failed to create temp dir");
		let path = dir.path().join("remote.json");

		fs::write(&path, br#"{ "ping_timeout_ms": 250, "watchdog": { "retry_delay_ms": 5 } }"#)
			.await
			.expect("failed to write config");

		let config = RemoteConfig::load(&path).await.expect("failed to load config");

		assert_eq!(config.ping_timeout(), Duration::from_millis(250));
		assert_eq!(config.watchdog.retry_delay(), Duration::from_millis(5));
		assert_eq!(config.watchdog.healthy_delay(), Duration::from_secs(60));
		assert_eq!(config.rpc_initial_timeout(), Duration::from_millis(500));
	}

	#[tokio::test]
	async fn save_then_load() {
		let dir = tempfile::tempdir().expect("failed to create temp dir");
		let path = dir.path().join("remote.json");

		let config = RemoteConfig {
			debug_mode: true,
			rpc_timeout_ratio: 2.0,
			..Default::default()
		};
		config.save(&path).await.expect("failed to save config");

		assert_eq!(
			RemoteConfig::load(&path).await.expect("failed to load config"),
			config
		);
	}

	#[tokio::test]
	async fn missing_file_reports_path() {
		let err = RemoteConfig::load("/definitely/not/here.json")
			.await
			.expect_err("file doesn't exist");

		assert!(err.to_string().contains("/definitely/not/here.json"));
	}
}
