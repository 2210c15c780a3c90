//! Supervision of a single middleware [`Service`].
//!
//! A [`Watchdog`] keeps its service activated: a minder loop on the task system's scheduling pool
//! checks the service, retrying activation quickly while it isn't running and slowing down to a
//! health check once it is.

use std::{
	fmt,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Weak,
	},
	time::Duration,
};

use sd_task_system::{TaskRemoteController, TaskSystem};
use sd_utils::MonitoredMutex;
use serde::{Deserialize, Serialize};
use tokio::{
	sync::{watch, Mutex},
	time::{sleep, timeout},
};
use tracing::{debug, info, instrument, trace, warn, Instrument};

use super::{config::WatchdogConfig, transport::Service, Error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceState {
	Constructed,
	Initializing,
	Running,
	Failed,
	Terminating,
	Finished,
	Interrupted,
}

impl ServiceState {
	/// States reached by deactivation, the watchdog does nothing more until activated again
	#[must_use]
	pub const fn is_terminal(self) -> bool {
		matches!(self, Self::Finished | Self::Interrupted)
	}
}

impl fmt::Display for ServiceState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(self, f)
	}
}

struct Inner<S: ?Sized> {
	name: String,
	service: Arc<S>,
	config: WatchdogConfig,
	tasks: TaskSystem,
	state: watch::Sender<ServiceState>,
	minder: MonitoredMutex<Option<TaskRemoteController>>,
	tick: Mutex<()>,
	shutdown: AtomicBool,
}

/// Keeps a service activated, cheap to clone
pub struct Watchdog<S: ?Sized> {
	inner: Arc<Inner<S>>,
}

impl<S: ?Sized> Clone for Watchdog<S> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

impl<S: ?Sized> fmt::Debug for Watchdog<S> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Watchdog")
			.field("name", &self.inner.name)
			.field("state", &*self.inner.state.borrow())
			.finish_non_exhaustive()
	}
}

impl<S: Service + ?Sized> Watchdog<S> {
	pub fn new(
		name: impl Into<String>,
		service: Arc<S>,
		tasks: TaskSystem,
		config: WatchdogConfig,
	) -> Self {
		Self {
			inner: Arc::new(Inner {
				name: name.into(),
				service,
				config,
				tasks,
				state: watch::Sender::new(ServiceState::Constructed),
				minder: MonitoredMutex::new("watchdog minder", None),
				tick: Mutex::new(()),
				shutdown: AtomicBool::new(false),
			}),
		}
	}

	#[must_use]
	pub fn name(&self) -> &str {
		&self.inner.name
	}

	#[must_use]
	pub fn service(&self) -> &Arc<S> {
		&self.inner.service
	}

	#[must_use]
	pub fn state(&self) -> ServiceState {
		*self.inner.state.borrow()
	}

	#[must_use]
	pub fn is_running(&self) -> bool {
		self.state() == ServiceState::Running
	}

	#[must_use]
	pub fn subscribe(&self) -> watch::Receiver<ServiceState> {
		self.inner.state.subscribe()
	}

	/// Starts supervising the service, does nothing if the minder loop is already running
	pub fn activate(&self) -> Result<(), Error> {
		if self.inner.shutdown.load(Ordering::Acquire) {
			return Err(Error::InvalidState(format!(
				"watchdog <{}> was shutdown",
				self.inner.name
			)));
		}

		let mut minder = self.inner.minder.lock();
		if minder.as_ref().is_some_and(|minder| !minder.is_done()) {
			trace!(watchdog = %self.inner.name, "Watchdog already active");
			return Ok(());
		}

		if self.state() != ServiceState::Running {
			self.inner.set_state(ServiceState::Initializing);
		}

		let handle = self.inner.tasks.schedule(
			mind(Arc::downgrade(&self.inner))
				.instrument(tracing::info_span!("watchdog", name = %self.inner.name)),
		);
		*minder = Some(handle.remote_controller());

		debug!(watchdog = %self.inner.name, "Watchdog activated");

		Ok(())
	}

	/// Stops supervising and deactivates the service.
	///
	/// Failures to deactivate are only logged, the watchdog ends up [`ServiceState::Finished`]
	/// anyway. If the service doesn't finish deactivating in time, the watchdog ends up
	/// [`ServiceState::Interrupted`] and [`Error::Interrupted`] is returned.
	#[instrument(skip(self), fields(watchdog = %self.inner.name))]
	pub async fn deactivate(&self) -> Result<(), Error> {
		if let Some(minder) = self.inner.minder.lock().take() {
			minder.cancel();
		}

		let _tick = self.inner.tick.lock().await;

		if self.state().is_terminal() {
			return Ok(());
		}

		self.inner.set_state(ServiceState::Terminating);

		if self.inner.service.is_active() {
			match timeout(
				self.inner.config.deactivation_timeout(),
				self.inner.service.deactivate(),
			)
			.await
			{
				Ok(Ok(())) => {}
				Ok(Err(e)) => warn!(?e, "Failed to deactivate service"),
				Err(_) => {
					self.inner.set_state(ServiceState::Interrupted);
					return Err(Error::Interrupted(format!(
						"deactivation of <{}> didn't finish in time",
						self.inner.name
					)));
				}
			}
		}

		self.inner.set_state(ServiceState::Finished);

		Ok(())
	}

	/// Deactivates for good, later activations are rejected
	pub async fn shutdown(&self) -> Result<(), Error> {
		self.inner.shutdown.store(true, Ordering::Release);
		self.deactivate().await
	}

	/// Waits until the watchdog reaches `state`.
	///
	/// Waiting for a non terminal state fails as soon as the watchdog gets deactivated, instead
	/// of waiting for an activation that may never come.
	pub async fn wait_for_service_state(
		&self,
		state: ServiceState,
		limit: Option<Duration>,
	) -> Result<(), Error> {
		let mut rx = self.subscribe();
		let name = &self.inner.name;

		let wait = async {
			let reached = rx
				.wait_for(|current| {
					*current == state || (!state.is_terminal() && current.is_terminal())
				})
				.await
				.map(|current| *current)
				.map_err(|_| Error::Interrupted(format!("watchdog <{name}> was dropped")))?;

			if reached == state {
				Ok(())
			} else {
				Err(Error::InvalidState(format!(
					"watchdog <{name}> reached {reached} while waiting for {state}"
				)))
			}
		};

		match limit {
			Some(limit) => timeout(limit, wait).await.map_err(|_| {
				Error::Timeout(format!("waiting for watchdog <{name}> to reach {state}"))
			})?,
			None => wait.await,
		}
	}
}

impl<S: ?Sized> Inner<S> {
	fn set_state(&self, new: ServiceState) {
		let mut old = new;
		if self.state.send_if_modified(|state| {
			old = *state;
			if *state == new {
				false
			} else {
				*state = new;
				true
			}
		}) {
			debug!(watchdog = %self.name, %old, %new, "Service state changed");
		}
	}
}

impl<S: Service + ?Sized> Inner<S> {
	/// Returns how long to wait before the next tick
	async fn tick(&self) -> Duration {
		let _tick = self.tick.lock().await;

		if self.shutdown.load(Ordering::Acquire) {
			return self.config.healthy_delay();
		}

		if self.service.is_active() {
			self.set_state(ServiceState::Running);
			return self.config.healthy_delay();
		}

		if *self.state.borrow() == ServiceState::Running {
			warn!(watchdog = %self.name, "Service is no longer active, reactivating");
			self.set_state(ServiceState::Initializing);
		}

		match self.service.activate().await {
			Ok(()) => {
				info!(watchdog = %self.name, "Service activated");
				self.set_state(ServiceState::Running);
				self.config.healthy_delay()
			}
			Err(e) => {
				warn!(watchdog = %self.name, ?e, "Failed to activate service, will retry");
				self.set_state(ServiceState::Failed);
				self.config.retry_delay()
			}
		}
	}
}

async fn mind<S: Service + ?Sized>(inner: Weak<Inner<S>>) {
	loop {
		let delay = {
			let Some(inner) = inner.upgrade() else {
				return;
			};
			inner.tick().await
		};

		sleep(delay).await;
	}
}
