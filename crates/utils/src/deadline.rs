use std::{
	fmt,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Mutex,
	},
	time::Duration,
};

use tokio::{
	runtime::Handle,
	task::JoinHandle,
	time::{sleep_until, Instant},
};
use tracing::{error, warn, Instrument};

use super::lock::lock_unpoisoned;

type ExpireFn = Arc<dyn Fn(&str, Duration) + Send + Sync>;

/// A restartable one-shot timer used to detect operations (or lock holders) that got stuck.
///
/// Every call to [`DeadlineTimer::start`] pushes the deadline `timeout` into the future; if the
/// timer isn't restarted or canceled before it fires, the expiration callback runs on the tokio
/// runtime. The timer only reports, it never tries to undo whatever got stuck.
pub struct DeadlineTimer {
	name: Arc<str>,
	timeout: Duration,
	on_expire: ExpireFn,
	expired: Arc<AtomicBool>,
	handle: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for DeadlineTimer {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("DeadlineTimer")
			.field("name", &self.name)
			.field("timeout", &self.timeout)
			.field("expired", &self.has_expired())
			.finish_non_exhaustive()
	}
}

impl DeadlineTimer {
	pub fn new(
		name: impl Into<Arc<str>>,
		timeout: Duration,
		on_expire: impl Fn(&str, Duration) + Send + Sync + 'static,
	) -> Self {
		Self {
			name: name.into(),
			timeout,
			on_expire: Arc::new(on_expire),
			expired: Arc::new(AtomicBool::new(false)),
			handle: Mutex::new(None),
		}
	}

	/// A timer that just logs an error when the deadline is missed
	pub fn reporting(name: impl Into<Arc<str>>, timeout: Duration) -> Self {
		Self::new(name, timeout, |name, timeout| {
			error!(%name, ?timeout, "Deadline expired");
		})
	}

	#[must_use]
	pub const fn timeout(&self) -> Duration {
		self.timeout
	}

	/// Starts the timer, or restarts it if it was already running.
	///
	/// Returns `false` if there is no tokio runtime to drive the timer, in which case nothing
	/// is monitored.
	pub fn start(&self) -> bool {
		let Ok(runtime) = Handle::try_current() else {
			warn!(name = %self.name, "No tokio runtime available, deadline timer disabled");
			return false;
		};

		self.expired.store(false, Ordering::Release);

		let deadline = Instant::now() + self.timeout;

		let task = runtime.spawn({
			let name = Arc::clone(&self.name);
			let timeout = self.timeout;
			let on_expire = Arc::clone(&self.on_expire);
			let expired = Arc::clone(&self.expired);

			async move {
				sleep_until(deadline).await;
				expired.store(true, Ordering::Release);
				on_expire(&name, timeout);
			}
			.in_current_span()
		});

		if let Some(previous) = lock_unpoisoned(&self.handle).replace(task) {
			previous.abort();
		}

		true
	}

	/// Cancels the timer, returns `true` if it was still pending
	pub fn cancel(&self) -> bool {
		lock_unpoisoned(&self.handle).take().map_or(false, |task| {
			let was_pending = !task.is_finished();
			task.abort();
			was_pending
		})
	}

	#[must_use]
	pub fn is_running(&self) -> bool {
		lock_unpoisoned(&self.handle)
			.as_ref()
			.is_some_and(|task| !task.is_finished())
	}

	#[must_use]
	pub fn has_expired(&self) -> bool {
		self.expired.load(Ordering::Acquire)
	}
}

impl Drop for DeadlineTimer {
	fn drop(&mut self) {
		self.cancel();
	}
}
