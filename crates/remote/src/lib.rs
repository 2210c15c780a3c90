//!
//! # Remote
//!
//! Keeps local replicas of records owned by remote controllers in sync.
//!
//! A controller publishes its record on `<scope>/status` and answers method calls on
//! `<scope>/ctrl`. A [`RemoteConnection`] subscribes to the former and calls the latter, keeping
//! both endpoints alive with a [`Watchdog`] each. Events are applied in creation order, stale
//! ones are dropped, and whenever the connection loses track of the controller it pulls the whole
//! record again with retried `requestStatus` calls.
//!
//! The middleware itself is abstracted by the traits in [`transport`], with an in process
//! implementation in [`transport::memory`].
//!
//! ## Basic example
//!
//! ```
//! use sd_remote::{
//! 	transport::memory::{MemoryBus, StatusController},
//! 	RemoteConfig, RemoteConnection, Scope,
//! };
//! use sd_task_system::TaskSystem;
//! use sd_utils::DynamicRecord;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), sd_remote::Error> {
//! 	let tasks = TaskSystem::new();
//! 	let bus = MemoryBus::new(tasks.clone());
//! 	let scope = Scope::parse("home/kitchen/light")?;
//!
//! 	let controller = StatusController::serve(
//! 		&bus,
//! 		scope.clone(),
//! 		DynamicRecord::new().with("power", true),
//! 	);
//!
//! 	let connection =
//! 		RemoteConnection::<DynamicRecord>::new(tasks.clone(), Arc::new(bus), RemoteConfig::default());
//! 	connection.init(scope).await?;
//! 	connection.activate(true).await?;
//!
//! 	assert_eq!(*connection.get_data()?, controller.record());
//!
//! 	connection.shutdown().await;
//! 	tasks.shutdown().await;
//!
//! 	Ok(())
//! }
//! ```

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

pub mod capability;
pub mod config;
pub mod connection;
pub mod error;
pub mod observer;
pub mod retry;
pub mod scope;
pub mod transport;
pub mod watchdog;

pub use capability::{Configurable, DataSynchronized, RpcCapable, ScopeAddressable};
pub use config::{ConfigError, RemoteConfig, WatchdogConfig};
pub use connection::{
	ConnectionState, ConnectionStateChange, Maintainer, RemoteConnection, RemoteData, SyncFuture,
};
pub use error::Error;
pub use observer::{Observable, ObserverId};
pub use retry::{Attempt, RetryTimeout, TimeoutSplitter};
pub use scope::Scope;
pub use watchdog::{ServiceState, Watchdog};
