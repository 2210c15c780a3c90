use std::{
	fmt,
	ops::{Deref, DerefMut},
	sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
	time::{Duration, Instant},
};

use tokio::sync::watch;
use tracing::{error, trace, warn};

use super::deadline::DeadlineTimer;

const DEFAULT_WARN_AFTER: Duration = Duration::from_millis(500);

/// Locks a std mutex, recovering the data if a previous holder panicked
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A std [`Mutex`] whose guards report when the lock was awaited or held for too long.
///
/// Meant for short critical sections that must never be held across an `.await` point.
pub struct MonitoredMutex<T> {
	name: &'static str,
	warn_after: Duration,
	inner: Mutex<T>,
}

impl<T: fmt::Debug> fmt::Debug for MonitoredMutex<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("MonitoredMutex")
			.field("name", &self.name)
			.field("inner", &self.inner)
			.finish()
	}
}

impl<T> MonitoredMutex<T> {
	pub const fn new(name: &'static str, value: T) -> Self {
		Self {
			name,
			warn_after: DEFAULT_WARN_AFTER,
			inner: Mutex::new(value),
		}
	}

	#[must_use]
	pub const fn with_warn_after(mut self, warn_after: Duration) -> Self {
		self.warn_after = warn_after;
		self
	}

	pub fn lock(&self) -> MonitoredMutexGuard<'_, T> {
		let started = Instant::now();
		let guard = lock_unpoisoned(&self.inner);
		let waited = started.elapsed();

		if waited > self.warn_after {
			warn!(lock = self.name, ?waited, "Waited too long to acquire lock");
		}

		MonitoredMutexGuard {
			guard,
			name: self.name,
			warn_after: self.warn_after,
			acquired_at: Instant::now(),
		}
	}

	pub fn into_inner(self) -> T {
		self.inner.into_inner().unwrap_or_else(PoisonError::into_inner)
	}
}

pub struct MonitoredMutexGuard<'lock, T> {
	guard: MutexGuard<'lock, T>,
	name: &'static str,
	warn_after: Duration,
	acquired_at: Instant,
}

impl<T> Deref for MonitoredMutexGuard<'_, T> {
	type Target = T;

	fn deref(&self) -> &Self::Target {
		&self.guard
	}
}

impl<T> DerefMut for MonitoredMutexGuard<'_, T> {
	fn deref_mut(&mut self) -> &mut Self::Target {
		&mut self.guard
	}
}

impl<T> Drop for MonitoredMutexGuard<'_, T> {
	fn drop(&mut self) {
		let held = self.acquired_at.elapsed();
		if held > self.warn_after {
			warn!(lock = self.name, ?held, "Lock held longer than expected");
		}
	}
}

/// A read/write lock over some shared state (usually a record under construction) where readers
/// proceed concurrently, writers are exclusive, and every released write guard bumps a version
/// that can be observed through [`ObservableRwLock::subscribe`].
///
/// Each write arms a [`DeadlineTimer`] that reports writers holding the lock implausibly long.
pub struct ObservableRwLock<T> {
	name: Arc<str>,
	deadline: Duration,
	inner: RwLock<T>,
	changes: watch::Sender<u64>,
}

impl<T: fmt::Debug> fmt::Debug for ObservableRwLock<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ObservableRwLock")
			.field("name", &self.name)
			.field("version", &*self.changes.borrow())
			.field("inner", &self.inner)
			.finish()
	}
}

impl<T> ObservableRwLock<T> {
	pub fn new(name: impl Into<Arc<str>>, value: T, deadline: Duration) -> Self {
		Self {
			name: name.into(),
			deadline,
			inner: RwLock::new(value),
			changes: watch::Sender::new(0),
		}
	}

	pub fn read(&self) -> RwLockReadGuard<'_, T> {
		self.inner.read().unwrap_or_else(PoisonError::into_inner)
	}

	/// Exclusive access, observers are notified once the returned guard is dropped
	pub fn write(&self) -> ObservableWriteGuard<'_, T> {
		let timer = DeadlineTimer::new(
			format!("{} write lock", self.name),
			self.deadline,
			|name, deadline| {
				error!(
					%name,
					?deadline,
					"Write lock held implausibly long, some writer is probably stuck",
				);
			},
		);
		timer.start();

		ObservableWriteGuard {
			guard: Some(self.inner.write().unwrap_or_else(PoisonError::into_inner)),
			changes: &self.changes,
			timer,
		}
	}

	/// Number of writes released so far
	#[must_use]
	pub fn version(&self) -> u64 {
		*self.changes.borrow()
	}

	#[must_use]
	pub fn subscribe(&self) -> watch::Receiver<u64> {
		self.changes.subscribe()
	}
}

pub struct ObservableWriteGuard<'lock, T> {
	guard: Option<RwLockWriteGuard<'lock, T>>,
	changes: &'lock watch::Sender<u64>,
	timer: DeadlineTimer,
}

impl<T> Deref for ObservableWriteGuard<'_, T> {
	type Target = T;

	fn deref(&self) -> &Self::Target {
		self.guard
			.as_deref()
			.unwrap_or_else(|| unreachable!("write guard is only taken on drop"))
	}
}

impl<T> DerefMut for ObservableWriteGuard<'_, T> {
	fn deref_mut(&mut self) -> &mut Self::Target {
		self.guard
			.as_deref_mut()
			.unwrap_or_else(|| unreachable!("write guard is only taken on drop"))
	}
}

impl<T> Drop for ObservableWriteGuard<'_, T> {
	fn drop(&mut self) {
		// Release before notifying, so observers can immediately read the new state
		drop(self.guard.take());
		self.timer.cancel();
		self.changes.send_modify(|version| *version += 1);
		trace!(version = *self.changes.borrow(), "Write lock released");
	}
}
