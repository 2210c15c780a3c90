use std::{fmt, panic::Location, sync::Arc};

use sd_utils::DeadlineTimer;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use uuid::Uuid;

use super::{Inner, RemoteConnection, RemoteData};
use crate::Error;

/// Whoever locked a connection to be the only one allowed to (de)activate it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Maintainer(Uuid);

impl Maintainer {
	#[must_use]
	pub fn new() -> Self {
		Self(Uuid::new_v4())
	}

	#[must_use]
	pub const fn from_uuid(id: Uuid) -> Self {
		Self(id)
	}
}

impl Default for Maintainer {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for Maintainer {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "maintainer <{}>", self.0)
	}
}

pub(super) struct MaintainerLock {
	owner: Maintainer,
	// Reports maintainers that never unlock, dropped along with the lock
	_deadline: DeadlineTimer,
}

/// Marks a (re)initialization in flight, released on drop
pub(super) struct ReinitGuard<M: RemoteData> {
	inner: Arc<Inner<M>>,
}

impl<M: RemoteData> Drop for ReinitGuard<M> {
	fn drop(&mut self) {
		*self.inner.reinit.lock() = None;
	}
}

impl<M: RemoteData> Inner<M> {
	pub(super) fn verify_maintainability(&self, caller: Option<Maintainer>) -> Result<(), Error> {
		match self.maintainer.lock().as_ref() {
			Some(lock) if Some(lock.owner) != caller => Err(Error::InvalidState(format!(
				"connection is locked by {}",
				lock.owner
			))),
			_ => Ok(()),
		}
	}

	pub(super) fn take_maintainer(&self) -> Option<MaintainerLock> {
		self.maintainer.lock().take()
	}

	pub(super) fn restore_maintainer(&self, lock: Option<MaintainerLock>) {
		if lock.is_some() {
			*self.maintainer.lock() = lock;
		}
	}

	/// Fails if another (re)initialization is in flight, naming both call sites
	pub(super) fn enter_reinit(
		self: &Arc<Self>,
		caller: &'static Location<'static>,
	) -> Result<ReinitGuard<M>, Error> {
		if self.is_shutdown() {
			return Err(Error::ShutdownInProgress);
		}

		let mut reinit = self.reinit.lock();

		if let Some(running) = *reinit {
			error!(
				connection = %self.id,
				%caller,
				%running,
				"Concurrent reinit of the same connection"
			);

			return Err(Error::Fatal(format!(
				"reinit called at {caller} while another one, called at {running}, is still in flight"
			)));
		}

		*reinit = Some(caller);

		Ok(ReinitGuard {
			inner: Arc::clone(self),
		})
	}
}

impl<M: RemoteData> RemoteConnection<M> {
	/// Makes `owner` the only one allowed to activate or deactivate this connection.
	///
	/// Locking again with the same owner does nothing.
	pub fn lock(&self, owner: Maintainer) -> Result<(), Error> {
		let mut maintainer = self.inner.maintainer.lock();

		match maintainer.as_ref() {
			Some(lock) if lock.owner == owner => Ok(()),
			Some(lock) => Err(Error::InvalidState(format!(
				"connection is already locked by {}",
				lock.owner
			))),
			None => {
				let deadline = DeadlineTimer::new(
					format!("{owner} of connection <{}>", self.inner.id),
					self.inner.config.lock_deadline(),
					|name, deadline| {
						error!(%name, ?deadline, "Connection is locked for too long, was it forgotten?");
					},
				);
				deadline.start();

				*maintainer = Some(MaintainerLock {
					owner,
					_deadline: deadline,
				});

				debug!(connection = %self.inner.id, %owner, "Connection locked");

				Ok(())
			}
		}
	}

	/// Unlocking a connection that isn't locked does nothing
	pub fn unlock(&self, owner: Maintainer) -> Result<(), Error> {
		let mut maintainer = self.inner.maintainer.lock();

		match maintainer.as_ref() {
			Some(lock) if lock.owner != owner => Err(Error::InvalidState(format!(
				"connection is locked by {}, not by {owner}",
				lock.owner
			))),
			Some(_) => {
				*maintainer = None;
				debug!(connection = %self.inner.id, %owner, "Connection unlocked");
				Ok(())
			}
			None => Ok(()),
		}
	}

	#[must_use]
	pub fn is_locked(&self) -> bool {
		self.inner.maintainer.lock().is_some()
	}

	#[must_use]
	pub fn maintainer(&self) -> Option<Maintainer> {
		self.inner
			.maintainer
			.lock()
			.as_ref()
			.map(|lock| lock.owner)
	}
}
