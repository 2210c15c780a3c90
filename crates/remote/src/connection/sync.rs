use std::{
	fmt,
	future::IntoFuture,
	sync::{atomic::Ordering, Arc, Weak},
	time::Duration,
};

use futures::future::BoxFuture;
use sd_task_system::{CompletableTask, Completion, TaskRemoteController};
use sd_utils::{FieldValue, MonitoredMutexGuard, Record};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info_span, trace, warn, Instrument};

use super::{
	state::ConnectionState, with_limit, Inner, RemoteConnection, RemoteData, TRANSACTION_ID_FIELD,
};
use crate::{
	observer::ObserverId,
	retry::{Attempt, RetryTimeout},
	transport::{decode, Event, TransportError, REQUEST_STATUS_METHOD},
	Error,
};

pub(super) struct SyncState<M> {
	/// Shared by every caller asking for data until the next update arrives
	pub(super) future: Option<CompletableTask<Arc<M>, Error>>,
	pub(super) worker: Option<TaskRemoteController>,
	pub(super) generation: u64,
	pub(super) transaction_id: u64,
	/// Ordering key of the newest applied event
	pub(super) newest_event: Option<(u64, u64)>,
}

impl<M> Default for SyncState<M> {
	fn default() -> Self {
		Self {
			future: None,
			worker: None,
			generation: 0,
			transaction_id: 0,
			newest_event: None,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum UpdateSource {
	Event,
	Sync { generation: u64 },
}

/// Resolves with the next data update of a connection.
///
/// Every caller asking for data while an update is pending shares the same outcome. Dropping it
/// doesn't stop the synchronization.
#[must_use = "dropping a SyncFuture doesn't cancel the synchronization"]
pub struct SyncFuture<M> {
	task: CompletableTask<Arc<M>, Error>,
	owner: Weak<Inner<M>>,
}

impl<M> Clone for SyncFuture<M> {
	fn clone(&self) -> Self {
		Self {
			task: self.task.clone(),
			owner: Weak::clone(&self.owner),
		}
	}
}

impl<M> fmt::Debug for SyncFuture<M> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SyncFuture")
			.field("task", &self.task)
			.finish_non_exhaustive()
	}
}

impl<M: RemoteData> SyncFuture<M> {
	fn new(task: CompletableTask<Arc<M>, Error>, owner: Weak<Inner<M>>) -> Self {
		Self { task, owner }
	}

	fn failed(error: Error) -> Self {
		let task = CompletableTask::new();
		task.fail(error);
		Self::new(task, Weak::new())
	}

	#[must_use]
	pub fn is_done(&self) -> bool {
		self.task.is_done()
	}

	/// `true` if both futures wait for the same data update
	#[must_use]
	pub fn same_sync(&self, other: &Self) -> bool {
		self.task.same_task(&other.task)
	}

	/// The outcome, if the future already resolved
	#[must_use]
	pub fn peek(&self) -> Option<Result<Arc<M>, Error>> {
		self.task
			.peek()
			.map(|completion| into_result(completion, &self.owner))
	}

	/// Cancels this future for every caller sharing it.
	///
	/// The sync worker is only stopped when the connection already holds data, a first
	/// synchronization keeps going so the connection can eventually connect.
	pub fn cancel(&self) -> bool {
		let canceled = self.task.cancel();

		if let Some(inner) = self.owner.upgrade() {
			inner.forget_sync(&self.task);
		}

		canceled
	}

	pub async fn wait_timeout(self, limit: Duration) -> Result<Arc<M>, Error> {
		timeout(limit, self.into_future())
			.await
			.map_err(|_| Error::Timeout("waiting for a data update".to_string()))?
	}
}

impl<M: RemoteData> IntoFuture for SyncFuture<M> {
	type Output = Result<Arc<M>, Error>;
	type IntoFuture = BoxFuture<'static, Self::Output>;

	fn into_future(self) -> Self::IntoFuture {
		Box::pin(async move {
			let completion = self.task.wait().await;
			into_result(completion, &self.owner)
		})
	}
}

fn into_result<M: RemoteData>(
	completion: Completion<Arc<M>, Error>,
	owner: &Weak<Inner<M>>,
) -> Result<Arc<M>, Error> {
	match completion {
		Completion::Done(data) => Ok(data),
		Completion::Failed(e) => Err(e),
		Completion::Canceled => {
			if owner.upgrade().map_or(true, |inner| inner.is_shutdown()) {
				Err(Error::ShutdownInProgress)
			} else {
				Err(Error::Interrupted("data request was canceled".to_string()))
			}
		}
	}
}

/// Reads the transaction id of a record, any integer field named `transaction_id` counts
pub(super) fn transaction_id_of(record: &dyn Record) -> Option<u64> {
	match record.field(TRANSACTION_ID_FIELD)? {
		FieldValue::U64(id) => Some(id),
		FieldValue::I64(id) => u64::try_from(id).ok(),
		_ => None,
	}
}

impl<M: RemoteData> Inner<M> {
	/// Hands out the pending data request, starting a sync worker if none is running
	pub(super) fn request_data(self: &Arc<Self>) -> SyncFuture<M> {
		if self.is_shutdown() {
			return SyncFuture::failed(Error::ShutdownInProgress);
		}

		let mut sync = self.sync.lock();

		if let Some(future) = sync.future.as_ref().filter(|future| !future.is_done()) {
			return SyncFuture::new(future.clone(), Arc::downgrade(self));
		}

		let future = CompletableTask::new();
		sync.future = Some(future.clone());

		if sync.worker.as_ref().is_some_and(|worker| !worker.is_done()) {
			trace!("Sync worker already running, reusing it");
		} else {
			sync.generation += 1;
			let generation = sync.generation;

			let worker = self.tasks.dispatch(
				Arc::clone(self)
					.sync_loop(generation)
					.instrument(info_span!("sync", connection = %self.id, generation)),
			);
			sync.worker = Some(worker.remote_controller());
		}

		SyncFuture::new(future, Arc::downgrade(self))
	}

	pub(super) fn is_sync_running(&self) -> bool {
		self.sync
			.lock()
			.worker
			.as_ref()
			.is_some_and(|worker| !worker.is_done())
	}

	async fn sync_loop(self: Arc<Self>, generation: u64) {
		let started = Instant::now();
		let mut retry = RetryTimeout::new(&self.config);

		loop {
			if self.is_shutdown() {
				self.finish_sync(generation, Error::ShutdownInProgress);
				return;
			}

			if let Err(e) = self.prepare_sync().await {
				self.finish_sync(generation, e.after_shutdown(self.is_shutdown()));
				return;
			}

			let limit = retry.next_timeout();

			match self.sync_attempt(limit).await {
				Attempt::Ok(record) => {
					trace!(attempts = retry.attempts(), "Data synchronized");
					self.apply_update(Arc::new(record), UpdateSource::Sync { generation });
					return;
				}

				Attempt::Timeout => {
					let failing_for = started.elapsed();

					if failing_for > self.config.sync_warn_threshold() {
						warn!(
							attempts = retry.attempts(),
							?failing_for,
							"Data synchronization keeps timing out, retrying"
						);
					} else {
						debug!(attempts = retry.attempts(), ?limit, "Sync attempt timed out");
					}
				}

				Attempt::Failed(e)
					if !self.is_shutdown()
						&& self.connection_state() == ConnectionState::Reconnecting =>
				{
					debug!(?e, "Sync attempt failed while reconnecting, retrying");
				}

				Attempt::Failed(e) => {
					let e = e.after_shutdown(self.is_shutdown());

					if self.ends_sync(&e) {
						if !e.is_shutdown() {
							warn!(?e, "Data synchronization failed");
						}
						self.finish_sync(generation, e);
						return;
					}

					let failing_for = started.elapsed();
					let pause = retry.next_timeout();

					if failing_for > self.config.sync_warn_threshold() {
						warn!(
							?e,
							attempts = retry.attempts(),
							?failing_for,
							"Data synchronization keeps failing, retrying"
						);
					} else {
						debug!(?e, attempts = retry.attempts(), ?pause, "Sync attempt failed");
					}

					tokio::select! {
						biased;
						() = self.shutdown.cancelled() => {
							self.finish_sync(generation, Error::ShutdownInProgress);
							return;
						}
						() = sleep(pause) => {}
					}
				}
			}
		}
	}

	/// Failures after which retrying can't help, anything else is a hiccup
	fn ends_sync(&self, e: &Error) -> bool {
		match e {
			Error::ShutdownInProgress
			| Error::Interrupted(_)
			| Error::Fatal(_)
			| Error::Transport(TransportError::Inactive(_)) => true,
			Error::InvalidState(_) => !self.is_active(),
			_ => false,
		}
	}

	async fn prepare_sync(&self) -> Result<(), Error> {
		loop {
			if !self.is_active() {
				return Err(Error::InvalidState(
					"connection must be active to synchronize".to_string(),
				));
			}

			self.wait_while_reconnecting(None).await?;

			let epoch = self.transports_epoch.load(Ordering::Acquire);

			match self.wait_for_middleware(None).await {
				Ok(()) => return Ok(()),
				Err(e) if e.is_shutdown() => return Err(e),
				// The transports we waited on are being replaced, wait on the new ones
				Err(e)
					if self.connection_state() == ConnectionState::Reconnecting
						|| self.transports_epoch.load(Ordering::Acquire) != epoch =>
				{
					trace!(?e, "Transports rebuilt while waiting for them");
				}
				Err(e) => return Err(e),
			}
		}
	}

	async fn sync_attempt(self: &Arc<Self>, limit: Duration) -> Attempt<M> {
		match Attempt::run(limit, self.ping()).await {
			Attempt::Ok(_) => {}
			Attempt::Timeout => return Attempt::Timeout,
			Attempt::Failed(e) => return Attempt::Failed(e),
		}

		match self.call_raw(REQUEST_STATUS_METHOD, Vec::new(), limit).await {
			Attempt::Ok(reply) => match decode("status record", &reply) {
				Ok(record) => Attempt::Ok(record),
				Err(e) => Attempt::Failed(e),
			},
			Attempt::Timeout => Attempt::Timeout,
			Attempt::Failed(e) => Attempt::Failed(e),
		}
	}

	/// Settles the pending request with `error`, unless a newer worker took over
	fn finish_sync(&self, generation: u64, error: Error) {
		let mut sync = self.sync.lock();

		if sync.generation != generation {
			return;
		}

		sync.worker = None;
		if let Some(future) = sync.future.take() {
			future.fail(error);
		}
	}

	/// Settles the pending request and stops the worker, `None` cancels the request
	pub(super) fn cancel_sync(&self, error: Option<Error>) {
		let (future, worker) = {
			let mut sync = self.sync.lock();
			(sync.future.take(), sync.worker.take())
		};

		if let Some(worker) = worker {
			worker.cancel();
		}

		if let Some(future) = future {
			match error {
				Some(e) => future.fail(e),
				None => future.cancel(),
			};
		}
	}

	fn forget_sync(&self, task: &CompletableTask<Arc<M>, Error>) {
		let mut sync = self.sync.lock();

		if sync.future.as_ref().is_some_and(|future| future.same_task(task)) {
			sync.future = None;
		}

		if sync.future.is_none() && self.data.borrow().is_some() {
			if let Some(worker) = sync.worker.take() {
				debug!("Stopping redundant sync worker");
				worker.cancel();
			}
		}
	}

	pub(super) fn handle_event(self: &Arc<Self>, event: Event) {
		if self.is_shutdown() {
			trace!("Ignoring event received after shutdown");
			return;
		}

		let Some(payload) = event.payload.as_deref() else {
			self.handle_detach();
			return;
		};

		let record = match decode::<M>("event payload", payload) {
			Ok(record) => record,
			Err(e) => {
				error!(?e, "Dropping event that couldn't be decoded");
				return;
			}
		};

		let updates = self.updates.lock();

		if let Some(ordering) = event.ordering() {
			let mut sync = self.sync.lock();

			if sync.newest_event.is_some_and(|newest| ordering <= newest) {
				trace!(?ordering, newest = ?sync.newest_event, "Dropping stale event");
				return;
			}

			sync.newest_event = Some(ordering);
		} else {
			debug!("Event without creation time, applying it unordered");
		}

		self.apply_update_locked(&updates, Arc::new(record), UpdateSource::Event);
	}

	fn handle_detach(self: &Arc<Self>) {
		if self.connection_state() == ConnectionState::Reconnecting {
			debug!("Ignoring controller detach while reconnecting");
			return;
		}

		{
			let mut sync = self.sync.lock();
			sync.transaction_id = 0;
			sync.newest_event = None;
		}

		debug!(connection = %self.id, "Controller detached");
		self.set_connection_state(ConnectionState::Connecting);
	}

	fn apply_update(self: &Arc<Self>, record: Arc<M>, source: UpdateSource) {
		let updates = self.updates.lock();
		self.apply_update_locked(&updates, record, source);
	}

	fn apply_update_locked(
		self: &Arc<Self>,
		_updates: &MonitoredMutexGuard<'_, ()>,
		record: Arc<M>,
		source: UpdateSource,
	) {
		let future = {
			let mut sync = self.sync.lock();

			self.data.send_replace(Some(Arc::clone(&record)));

			match source {
				UpdateSource::Sync { generation } if generation == sync.generation => {
					sync.worker = None;
				}
				_ => {
					if let Some(worker) = sync.worker.take() {
						trace!(?source, "Stopping sync worker made redundant by an update");
						worker.cancel();
					}
				}
			}

			sync.future.take()
		};

		self.transition(ConnectionState::Connecting, ConnectionState::Connected);

		if let Some(future) = future {
			future.complete(Arc::clone(&record));
		}

		self.prioritized_observers.notify(&record);
		self.update_transaction_id(&*record);
		self.data_observers.notify(&record);
	}

	fn update_transaction_id(&self, record: &dyn Record) {
		let Some(id) = transaction_id_of(record) else {
			return;
		};

		let mut sync = self.sync.lock();

		// A controller restarting from scratch counts again from zero
		if id < sync.transaction_id && id != 0 {
			warn!(
				previous = sync.transaction_id,
				current = id,
				"Transaction id went backwards"
			);
		}

		sync.transaction_id = id;
	}

	pub(super) async fn wait_for_data(&self, limit: Option<Duration>) -> Result<Arc<M>, Error> {
		let mut rx = self.data.subscribe();

		let wait = async {
			tokio::select! {
				biased;
				res = async { rx.wait_for(Option::is_some).await.map(|data| data.clone()) } => {
					res.map_err(|_| Error::Interrupted("connection was dropped".to_string()))?
						.ok_or_else(|| Error::Fatal("data vanished after being set".to_string()))
				}
				() = self.shutdown.cancelled() => Err(Error::ShutdownInProgress),
			}
		};

		with_limit(limit, wait, || "waiting for data".to_string()).await
	}

	/// Waits until the replica caught up with transaction `target`
	pub(super) async fn wait_for_transaction(
		&self,
		target: u64,
		limit: Option<Duration>,
	) -> Result<(), Error> {
		let mut rx = self.data.subscribe();

		let wait = async {
			tokio::select! {
				biased;
				res = async {
					rx.wait_for(|data| {
						data.as_deref()
							.and_then(|data| transaction_id_of(data))
							.is_some_and(|id| id >= target)
					})
					.await
					.map(|_| ())
				} => res.map_err(|_| Error::Interrupted("connection was dropped".to_string())),
				() = self.shutdown.cancelled() => Err(Error::ShutdownInProgress),
			}
		};

		with_limit(limit, wait, || format!("waiting for transaction {target}")).await
	}
}

impl<M: RemoteData> RemoteConnection<M> {
	/// The latest data, fails with [`Error::NotAvailable`] if nothing was synchronized yet
	pub fn get_data(&self) -> Result<Arc<M>, Error> {
		let data = self.inner.data.borrow().clone();
		if let Some(data) = data {
			return Ok(data);
		}

		if self.inner.connection_state() == ConnectionState::Connected {
			error!(connection = %self.inner.id, "Connected without any data");

			if !self.inner.config.debug_mode {
				drop(self.inner.request_data());
			}

			return Err(Error::Fatal(
				"connection is connected but holds no data".to_string(),
			));
		}

		Err(Error::NotAvailable("no data was synchronized yet".to_string()))
	}

	#[must_use]
	pub fn is_data_available(&self) -> bool {
		self.inner.data.borrow().is_some()
	}

	/// Asks for fresh data, every call made before the next update shares the same future
	pub fn request_data(&self) -> SyncFuture<M> {
		self.inner.request_data()
	}

	/// Resolves with the current data, or with the first data to arrive
	pub fn get_data_future(
		&self,
	) -> impl std::future::Future<Output = Result<Arc<M>, Error>> + Send + 'static {
		let inner = Arc::clone(&self.inner);
		async move { inner.wait_for_data(None).await }
	}

	pub async fn wait_for_data(&self, limit: Option<Duration>) -> Result<Arc<M>, Error> {
		self.inner.wait_for_data(limit).await
	}

	/// Transaction id of the last applied update, reset when the controller detaches
	#[must_use]
	pub fn get_transaction_id(&self) -> u64 {
		self.inner.sync.lock().transaction_id
	}

	#[must_use]
	pub fn is_sync_running(&self) -> bool {
		self.inner.is_sync_running()
	}

	/// Observers run synchronously on each update, after the prioritized ones
	pub fn add_data_observer(
		&self,
		observer: impl Fn(&Arc<M>) + Send + Sync + 'static,
	) -> ObserverId {
		self.inner.data_observers.add(observer)
	}

	/// Prioritized observers see each update before the transaction id is advanced
	pub fn add_prioritized_data_observer(
		&self,
		observer: impl Fn(&Arc<M>) + Send + Sync + 'static,
	) -> ObserverId {
		self.inner.prioritized_observers.add(observer)
	}

	pub fn remove_data_observer(&self, id: ObserverId) -> bool {
		self.inner.data_observers.remove(id) || self.inner.prioritized_observers.remove(id)
	}
}
