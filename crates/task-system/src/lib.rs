//!
//! # Task System
//!
//! An injectable execution context for everything that runs in the background of a remote
//! connection: sync workers, asynchronous RPC calls, watchdog minders and timeout callbacks.
//!
//! Instead of process wide executors, each [`TaskSystem`] is an explicit value handed to the
//! components that need it, built on top of the current tokio runtime. This means tests can swap
//! in a current thread runtime with paused time and get a fully deterministic executor.
//!
//! Aside from spawning, it provides some niceties:
//! - A bounded worker pool ([`TaskSystem::dispatch`]) that reports its own load and warns when
//!   it gets overloaded;
//! - A separate pool for scheduled and periodic work ([`TaskSystem::schedule`]), which never
//!   waits behind busy workers;
//! - Cancelable [`TaskHandle`]s, and [`CompletableTask`]s that can be settled by whoever gets a
//!   result first, with any number of waiters;
//! - Aggregation of many tasks with [`all_of`] and [`any_of`], and [`post_process`] to run a
//!   verification step before a result is handed out;
//! - On shutdown every pending and running task is canceled and its handle resolves to
//!   [`TaskError::Shutdown`].
//!
//!
//! ## Basic example
//!
//! ```
//! use sd_task_system::{TaskError, TaskSystem};
//!
//! #[tokio::main]
//! async fn main() {
//!     let system = TaskSystem::new();
//!
//!     let handle = system.dispatch(async { 21 * 2 });
//!
//!     assert_eq!(handle.await, Ok(42));
//!
//!     system.shutdown().await;
//!
//!     assert_eq!(system.dispatch(async { 0 }).await, Err(TaskError::Shutdown));
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

mod combinators;
mod error;
mod system;
mod task;

pub use combinators::{all_of, any_of, post_process};
pub use error::TaskError;
pub use system::{TaskSystem, TaskSystemConfig, TaskSystemLoad};
pub use task::{
	CancelTaskOnDrop, CompletableTask, Completion, TaskHandle, TaskId, TaskRemoteController,
};
