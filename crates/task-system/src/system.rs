use std::{
	future::Future,
	num::NonZeroUsize,
	sync::{
		atomic::{AtomicBool, AtomicUsize, Ordering},
		Arc,
	},
	time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::{runtime::Handle, sync::Semaphore, time::sleep};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info, warn, Instrument};

use super::task::{TaskHandle, TaskId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSystemConfig {
	/// How many dispatched tasks may run at the same time
	pub workers_count: usize,

	/// Queue length at which the system reports itself as overloaded
	pub overload_threshold: usize,
}

impl Default for TaskSystemConfig {
	fn default() -> Self {
		let workers_count = std::thread::available_parallelism().map_or_else(
			|e| {
				error!("Failed to get available parallelism in the task system: {e:#?}");
				1
			},
			NonZeroUsize::get,
		);

		Self {
			workers_count,
			overload_threshold: workers_count * 16,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSystemLoad {
	pub workers_count: usize,
	pub running: usize,
	pub queued: usize,
}

struct Inner {
	runtime: Handle,
	config: TaskSystemConfig,
	permits: Arc<Semaphore>,
	running: AtomicUsize,
	queued: AtomicUsize,
	overloaded: AtomicBool,
	tracker: TaskTracker,
	shutdown: CancellationToken,
}

/// Execution context shared by every component of a remote connection, cheap to clone.
#[derive(Clone)]
pub struct TaskSystem {
	inner: Arc<Inner>,
}

impl std::fmt::Debug for TaskSystem {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TaskSystem")
			.field("load", &self.load())
			.field("is_shutdown", &self.is_shutdown())
			.finish()
	}
}

impl TaskSystem {
	/// # Panics
	///
	/// Will panic if called outside of a tokio runtime
	#[must_use]
	pub fn new() -> Self {
		Self::with_config(TaskSystemConfig::default())
	}

	/// # Panics
	///
	/// Will panic if called outside of a tokio runtime
	#[must_use]
	pub fn with_config(config: TaskSystemConfig) -> Self {
		Self::on_runtime(Handle::current(), config)
	}

	#[must_use]
	pub fn on_runtime(runtime: Handle, config: TaskSystemConfig) -> Self {
		let workers_count = config.workers_count.max(1);

		Self {
			inner: Arc::new(Inner {
				runtime,
				permits: Arc::new(Semaphore::new(workers_count)),
				config: TaskSystemConfig {
					workers_count,
					..config
				},
				running: AtomicUsize::new(0),
				queued: AtomicUsize::new(0),
				overloaded: AtomicBool::new(false),
				tracker: TaskTracker::new(),
				shutdown: CancellationToken::new(),
			}),
		}
	}

	/// Runs `fut` on the bounded worker pool, waiting for a free worker if all of them are busy
	pub fn dispatch<F>(&self, fut: F) -> TaskHandle<F::Output>
	where
		F: Future + Send + 'static,
		F::Output: Send + 'static,
	{
		let id = TaskId::new_v4();
		let inner = Arc::clone(&self.inner);

		self.spawn(id, async move {
			let permit = {
				let _queued = LoadGuard::enter(&inner.queued);
				inner.check_overload();

				tokio::select! {
					biased;
					() = inner.shutdown.cancelled() => return None,
					permit = Arc::clone(&inner.permits).acquire_owned() => permit.ok()?,
				}
			};
			inner.check_overload();

			let _running = LoadGuard::enter(&inner.running);
			let out = fut.await;
			drop(permit);

			Some(out)
		})
	}

	/// Runs `fut` on the scheduling pool, which isn't bounded by the workers count. Meant for
	/// periodic supervision loops and timers, which must not starve behind busy workers.
	pub fn schedule<F>(&self, fut: F) -> TaskHandle<F::Output>
	where
		F: Future + Send + 'static,
		F::Output: Send + 'static,
	{
		self.spawn(TaskId::new_v4(), async move { Some(fut.await) })
	}

	/// Same as [`TaskSystem::schedule`], but only starts `fut` after `delay`
	pub fn schedule_after<F>(&self, delay: Duration, fut: F) -> TaskHandle<F::Output>
	where
		F: Future + Send + 'static,
		F::Output: Send + 'static,
	{
		self.schedule(async move {
			sleep(delay).await;
			fut.await
		})
	}

	fn spawn<T, F>(&self, id: TaskId, fut: F) -> TaskHandle<T>
	where
		T: Send + 'static,
		F: Future<Output = Option<T>> + Send + 'static,
	{
		let shutdown = self.inner.shutdown.clone();

		let join = self.inner.tracker.spawn_on(
			{
				let shutdown = shutdown.clone();
				async move {
					tokio::select! {
						biased;
						() = shutdown.cancelled() => None,
						out = fut => out,
					}
				}
				.in_current_span()
			},
			&self.inner.runtime,
		);

		TaskHandle::new(id, join, shutdown)
	}

	#[must_use]
	pub fn load(&self) -> TaskSystemLoad {
		TaskSystemLoad {
			workers_count: self.inner.config.workers_count,
			running: self.inner.running.load(Ordering::Acquire),
			queued: self.inner.queued.load(Ordering::Acquire),
		}
	}

	#[must_use]
	pub fn is_overloaded(&self) -> bool {
		self.inner.overloaded.load(Ordering::Acquire)
	}

	#[must_use]
	pub fn is_shutdown(&self) -> bool {
		self.inner.shutdown.is_cancelled()
	}

	/// Cancels every pending and running task and waits for all of them to wind down
	pub async fn shutdown(&self) {
		if self.inner.shutdown.is_cancelled() {
			warn!("Trying to shutdown the task system that was already shutdown");
			return;
		}

		self.inner.shutdown.cancel();
		self.inner.tracker.close();
		self.inner.tracker.wait().await;

		info!("Task system shutdown");
	}
}

impl Inner {
	fn check_overload(&self) {
		let queued = self.queued.load(Ordering::Acquire);

		if queued > self.config.overload_threshold {
			if !self.overloaded.swap(true, Ordering::AcqRel) {
				warn!(
					%queued,
					workers_count = self.config.workers_count,
					"Task system overloaded",
				);
			}
		} else if self.overloaded.swap(false, Ordering::AcqRel) {
			info!(%queued, "Task system recovered from overload");
		}
	}
}

/// Keeps a load counter incremented while alive, even if the task gets aborted midway
struct LoadGuard<'counter>(&'counter AtomicUsize);

impl<'counter> LoadGuard<'counter> {
	fn enter(counter: &'counter AtomicUsize) -> Self {
		counter.fetch_add(1, Ordering::AcqRel);
		Self(counter)
	}
}

impl Drop for LoadGuard<'_> {
	fn drop(&mut self) {
		self.0.fetch_sub(1, Ordering::AcqRel);
	}
}
