//! The remote side of a remote object.
//!
//! A [`RemoteConnection`] keeps a local replica of a controller's record up to date. It
//! supervises a subscriber on `<scope>/status` and an RPC client on `<scope>/ctrl` with one
//! [`Watchdog`] each, applies broadcast events while discarding stale ones, pulls the full
//! record with `requestStatus` whenever it needs to resynchronize, and retries method calls with
//! an exponentially growing timeout.
//!
//! `Connected` always means "we hold fresh data", never just "the middleware is up": the state
//! only becomes `Connected` as the result of an actual data update.

use std::{
	fmt,
	future::Future,
	panic::Location,
	sync::{
		atomic::{AtomicBool, AtomicU64, Ordering},
		Arc,
	},
	time::Duration,
};

use sd_task_system::{TaskRemoteController, TaskSystem};
use sd_utils::{error::report_error, FieldError, FieldType, MonitoredMutex, Record};
use serde::{de::DeserializeOwned, Serialize};
use tokio::{sync::watch, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, instrument, trace, Instrument};
use uuid::Uuid;

use super::{
	config::RemoteConfig,
	observer::Observable,
	scope::Scope,
	transport::{RpcClient, Subscriber, TransportFactory},
	watchdog::{ServiceState, Watchdog},
	Error,
};

mod maintainer;
mod rpc;
mod state;
mod sync;

pub use maintainer::Maintainer;
pub use state::{ConnectionState, ConnectionStateChange};
pub use sync::SyncFuture;

use maintainer::MaintainerLock;
use rpc::PingState;
use sync::SyncState;

pub const ID_FIELD: &str = "id";
pub const LABEL_FIELD: &str = "label";
pub const SCOPE_FIELD: &str = "scope";
pub const TRANSACTION_ID_FIELD: &str = "transaction_id";

/// Records that can be synchronized through a [`RemoteConnection`]
pub trait RemoteData: Record + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> RemoteData for T where T: Record + Serialize + DeserializeOwned + Send + Sync + 'static {}

type PostInitHook = Arc<dyn Fn(&Scope) + Send + Sync>;

#[derive(Clone)]
struct Transports {
	subscriber: Watchdog<dyn Subscriber>,
	rpc: Watchdog<dyn RpcClient>,
	monitor: TaskRemoteController,
}

impl Transports {
	fn activate(&self) -> Result<(), Error> {
		self.subscriber.activate()?;
		self.rpc.activate()
	}

	async fn deactivate(&self) {
		report_error(
			"Failed to deactivate subscriber watchdog",
			&self.subscriber.deactivate().await,
		);
		report_error(
			"Failed to deactivate rpc client watchdog",
			&self.rpc.deactivate().await,
		);
	}

	async fn shutdown(self) {
		self.monitor.cancel();
		report_error(
			"Failed to shutdown subscriber watchdog",
			&self.subscriber.shutdown().await,
		);
		report_error(
			"Failed to shutdown rpc client watchdog",
			&self.rpc.shutdown().await,
		);
	}
}

struct Inner<M> {
	id: Uuid,
	tasks: TaskSystem,
	factory: Arc<dyn TransportFactory>,
	config: RemoteConfig,
	scope: MonitoredMutex<Option<Scope>>,
	transports: MonitoredMutex<Option<Transports>>,
	transports_epoch: AtomicU64,
	state: watch::Sender<ConnectionState>,
	data: watch::Sender<Option<Arc<M>>>,
	sync: MonitoredMutex<SyncState<M>>,
	// Serializes data updates, so staleness checks and applying happen as a single step
	updates: MonitoredMutex<()>,
	ping: MonitoredMutex<PingState>,
	maintainer: MonitoredMutex<Option<MaintainerLock>>,
	reinit: MonitoredMutex<Option<&'static Location<'static>>>,
	reinit_requested: AtomicBool,
	post_init: MonitoredMutex<Option<PostInitHook>>,
	active: AtomicBool,
	initialized: AtomicBool,
	shutdown_initiated: AtomicBool,
	shutdown: CancellationToken,
	prioritized_observers: Observable<Arc<M>>,
	data_observers: Observable<Arc<M>>,
	state_observers: Observable<ConnectionStateChange>,
}

/// Keeps a local replica of a remote controller's record, cheap to clone
pub struct RemoteConnection<M> {
	inner: Arc<Inner<M>>,
}

impl<M> Clone for RemoteConnection<M> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

impl<M> fmt::Debug for RemoteConnection<M> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("RemoteConnection")
			.field("id", &self.inner.id)
			.field("scope", &*self.inner.scope.lock())
			.field("state", &*self.inner.state.borrow())
			.finish_non_exhaustive()
	}
}

impl<M: RemoteData> RemoteConnection<M> {
	#[must_use]
	pub fn new(tasks: TaskSystem, factory: Arc<dyn TransportFactory>, config: RemoteConfig) -> Self {
		let warn_after = config.lock_warn_threshold();

		Self {
			inner: Arc::new(Inner {
				id: Uuid::new_v4(),
				tasks,
				factory,
				scope: MonitoredMutex::new("connection scope", None).with_warn_after(warn_after),
				transports: MonitoredMutex::new("connection transports", None)
					.with_warn_after(warn_after),
				transports_epoch: AtomicU64::new(0),
				state: watch::Sender::new(ConnectionState::Disconnected),
				data: watch::Sender::new(None),
				sync: MonitoredMutex::new("connection sync", SyncState::default())
					.with_warn_after(warn_after),
				updates: MonitoredMutex::new("connection updates", ()).with_warn_after(warn_after),
				ping: MonitoredMutex::new("connection ping", PingState::default())
					.with_warn_after(warn_after),
				maintainer: MonitoredMutex::new("connection maintainer", None)
					.with_warn_after(warn_after),
				reinit: MonitoredMutex::new("connection reinit", None).with_warn_after(warn_after),
				reinit_requested: AtomicBool::new(false),
				post_init: MonitoredMutex::new("connection post init hook", None),
				active: AtomicBool::new(false),
				initialized: AtomicBool::new(false),
				shutdown_initiated: AtomicBool::new(false),
				shutdown: CancellationToken::new(),
				prioritized_observers: Observable::new("prioritized data observers"),
				data_observers: Observable::new("data observers"),
				state_observers: Observable::new("connection state observers"),
				config,
			}),
		}
	}

	/// Identifies this connection object, not the remote controller
	#[must_use]
	pub fn connection_id(&self) -> Uuid {
		self.inner.id
	}

	#[must_use]
	pub fn config(&self) -> &RemoteConfig {
		&self.inner.config
	}

	pub fn scope(&self) -> Result<Scope, Error> {
		self.inner.scope()
	}

	/// The `id` field of the synchronized record, not to be confused with
	/// [`RemoteConnection::connection_id`]
	pub fn record_id(&self) -> Result<String, Error> {
		string_field(&*self.get_data()?, ID_FIELD)
	}

	/// The `label` field of the synchronized record, falling back to the scope
	pub fn label(&self) -> Result<String, Error> {
		self.get_data()
			.and_then(|data| string_field(&*data, LABEL_FIELD))
			.or_else(|_| self.scope().map(String::from))
	}

	#[must_use]
	pub fn is_initialized(&self) -> bool {
		self.inner.initialized.load(Ordering::Acquire)
	}

	/// Whether activation was requested, regardless of the middleware actually being up
	#[must_use]
	pub fn is_active(&self) -> bool {
		self.inner.is_active()
	}

	#[must_use]
	pub fn is_shutdown(&self) -> bool {
		self.inner.is_shutdown()
	}

	/// Runs after every (re)initialization, once the new transports are in place
	pub fn set_post_init_hook(&self, hook: impl Fn(&Scope) + Send + Sync + 'static) {
		*self.inner.post_init.lock() = Some(Arc::new(hook));
	}

	/// Binds the connection to `scope`, building its transports.
	///
	/// If the connection was active it reconnects right away, otherwise it ends up
	/// `Disconnected` until [`RemoteConnection::activate`] is called.
	#[track_caller]
	pub fn init(&self, scope: Scope) -> impl Future<Output = Result<(), Error>> + Send + '_ {
		let guard = self.inner.enter_reinit(Location::caller());

		async move {
			let _guard = guard?;
			self.inner.verify_maintainability(None)?;
			self.inner.initialize(scope).await
		}
		.instrument(info_span!("init", connection = %self.inner.id))
	}

	/// Same as [`RemoteConnection::init`], reading the scope from the `scope` field of `config`
	#[track_caller]
	pub fn init_with_config<'a>(
		&'a self,
		config: &dyn Record,
	) -> impl Future<Output = Result<(), Error>> + Send + 'a {
		let scope = string_field(config, SCOPE_FIELD).and_then(|scope| Scope::parse(&scope));
		let guard = self.inner.enter_reinit(Location::caller());

		async move {
			let _guard = guard?;
			self.inner.verify_maintainability(None)?;
			self.inner.initialize(scope?).await
		}
		.instrument(info_span!("init", connection = %self.inner.id))
	}

	/// Tears down and rebuilds the transports on the current scope, keeping the data and the
	/// maintainer.
	///
	/// Only one reinit may be in flight at any time, a second concurrent one fails with
	/// [`Error::Fatal`] naming both call sites.
	#[track_caller]
	pub fn reinit(&self) -> impl Future<Output = Result<(), Error>> + Send + '_ {
		let guard = self.inner.enter_reinit(Location::caller());

		async move {
			let _guard = guard?;
			let scope = self.scope()?;
			self.inner.reinitialize(scope).await
		}
		.instrument(info_span!("reinit", connection = %self.inner.id))
	}

	/// Same as [`RemoteConnection::reinit`], moving the connection to another scope
	#[track_caller]
	pub fn reinit_with_scope(
		&self,
		scope: Scope,
	) -> impl Future<Output = Result<(), Error>> + Send + '_ {
		let guard = self.inner.enter_reinit(Location::caller());

		async move {
			let _guard = guard?;
			self.inner.reinitialize(scope).await
		}
		.instrument(info_span!("reinit", connection = %self.inner.id))
	}

	/// Activates the transports and starts synchronizing, optionally waiting for the data
	pub async fn activate(&self, wait_for_data: bool) -> Result<(), Error> {
		self.activate_with(None, wait_for_data).await
	}

	/// Activation on behalf of the connection's maintainer
	pub async fn activate_as(&self, owner: Maintainer, wait_for_data: bool) -> Result<(), Error> {
		self.activate_with(Some(owner), wait_for_data).await
	}

	#[instrument(skip(self), fields(connection = %self.inner.id), err)]
	async fn activate_with(
		&self,
		caller: Option<Maintainer>,
		wait_for_data: bool,
	) -> Result<(), Error> {
		self.inner.verify_maintainability(caller)?;
		let sync = self.inner.activate()?;

		if wait_for_data {
			match sync {
				Some(sync) => drop(sync.await?),
				None => drop(self.inner.wait_for_data(None).await?),
			}
		}

		Ok(())
	}

	pub async fn deactivate(&self) -> Result<(), Error> {
		self.deactivate_with(None).await
	}

	pub async fn deactivate_as(&self, owner: Maintainer) -> Result<(), Error> {
		self.deactivate_with(Some(owner)).await
	}

	#[instrument(skip(self), fields(connection = %self.inner.id), err)]
	async fn deactivate_with(&self, caller: Option<Maintainer>) -> Result<(), Error> {
		self.inner.verify_maintainability(caller)?;

		if self.inner.is_shutdown() {
			return Err(Error::ShutdownInProgress);
		}

		self.inner.active.store(false, Ordering::Release);
		self.inner
			.cancel_sync(Some(Error::Interrupted("connection deactivated".to_string())));
		self.inner.set_connection_state(ConnectionState::Disconnected);

		let transports = self.inner.transports.lock().clone();
		if let Some(transports) = transports {
			transports.deactivate().await;
		}

		info!("Connection deactivated");

		Ok(())
	}

	/// Terminal, the connection can't be activated or reinitialized afterwards.
	///
	/// Pending data requests are canceled and in flight retries stop.
	#[instrument(skip(self), fields(connection = %self.inner.id))]
	pub async fn shutdown(&self) {
		if self.inner.shutdown_initiated.swap(true, Ordering::AcqRel) {
			debug!("Connection already shutdown");
			return;
		}

		self.inner.shutdown.cancel();
		self.inner.active.store(false, Ordering::Release);
		self.inner.cancel_sync(None);
		self.inner.cancel_ping();
		self.inner.set_connection_state(ConnectionState::Disconnected);
		self.inner.teardown_transports().await;

		info!("Connection shutdown");
	}
}

impl<M: RemoteData> Inner<M> {
	fn is_active(&self) -> bool {
		self.active.load(Ordering::Acquire)
	}

	fn is_shutdown(&self) -> bool {
		self.shutdown_initiated.load(Ordering::Acquire)
	}

	fn scope(&self) -> Result<Scope, Error> {
		self.scope
			.lock()
			.clone()
			.ok_or_else(|| Error::NotAvailable("connection has no scope yet".to_string()))
	}

	fn transports(&self) -> Result<Transports, Error> {
		self.transports
			.lock()
			.clone()
			.ok_or_else(|| Error::InvalidState("connection is not initialized".to_string()))
	}

	/// Returns the data request started by the activation, if any
	fn activate(self: &Arc<Self>) -> Result<Option<SyncFuture<M>>, Error> {
		if self.is_shutdown() {
			return Err(Error::ShutdownInProgress);
		}

		let transports = self.transports()?;

		self.active.store(true, Ordering::Release);
		transports.activate()?;

		if matches!(
			self.connection_state(),
			ConnectionState::Disconnected
				| ConnectionState::Reinitializing
				| ConnectionState::Reconnecting
		) {
			self.set_connection_state(ConnectionState::Connecting);
		}

		let sync = (self.connection_state() != ConnectionState::Connected)
			.then(|| self.request_data());

		debug!("Connection activated");

		Ok(sync)
	}

	async fn reinitialize(self: &Arc<Self>, scope: Scope) -> Result<(), Error> {
		let maintainer = self.take_maintainer();
		let res = self.initialize(scope).await;
		self.restore_maintainer(maintainer);

		res
	}

	async fn initialize(self: &Arc<Self>, scope: Scope) -> Result<(), Error> {
		if self.is_shutdown() {
			return Err(Error::ShutdownInProgress);
		}

		let was_active = self.is_active();
		self.set_connection_state(if was_active {
			ConnectionState::Reconnecting
		} else {
			ConnectionState::Reinitializing
		});

		info!(%scope, was_active, "Initializing connection");

		self.teardown_transports().await;

		let transports = match self.build_transports(&scope).await {
			Ok(transports) => transports,
			Err(e) => {
				self.set_connection_state(ConnectionState::Disconnected);
				return Err(e.after_shutdown(self.is_shutdown()));
			}
		};

		if self.is_shutdown() {
			transports.shutdown().await;
			return Err(Error::ShutdownInProgress);
		}

		*self.scope.lock() = Some(scope.clone());
		*self.transports.lock() = Some(transports);

		let hook = self.post_init.lock().clone();
		if let Some(hook) = hook {
			hook(&scope);
		}

		self.initialized.store(true, Ordering::Release);

		if was_active {
			self.activate().map(|_| ())
		} else {
			self.set_connection_state(ConnectionState::Disconnected);
			Ok(())
		}
	}

	async fn build_transports(self: &Arc<Self>, scope: &Scope) -> Result<Transports, Error> {
		let subscriber = self.factory.subscriber(&scope.status()).await?;
		let rpc = self.factory.rpc_client(&scope.ctrl()).await?;

		let weak = Arc::downgrade(self);
		subscriber.register_data_handler(Arc::new(move |event| {
			if let Some(inner) = weak.upgrade() {
				inner.handle_event(event);
			}
		}));

		let subscriber = Watchdog::new(
			format!("{scope} subscriber"),
			subscriber,
			self.tasks.clone(),
			self.config.watchdog.clone(),
		);
		let rpc = Watchdog::new(
			format!("{scope} rpc client"),
			rpc,
			self.tasks.clone(),
			self.config.watchdog.clone(),
		);

		let monitor = self
			.tasks
			.schedule(
				monitor_middleware(Arc::downgrade(self), subscriber.subscribe(), rpc.subscribe())
					.in_current_span(),
			)
			.remote_controller();

		self.transports_epoch.fetch_add(1, Ordering::AcqRel);

		Ok(Transports {
			subscriber,
			rpc,
			monitor,
		})
	}

	async fn teardown_transports(&self) {
		let transports = self.transports.lock().take();
		if let Some(transports) = transports {
			transports.shutdown().await;
		}
	}

	fn on_middleware_state(self: &Arc<Self>, subscriber: ServiceState, rpc: ServiceState) {
		if subscriber == ServiceState::Failed || rpc == ServiceState::Failed {
			if self.transition(ConnectionState::Connected, ConnectionState::Connecting) {
				info!(%subscriber, %rpc, "Middleware failure, reconnecting");
			}
		} else if subscriber == ServiceState::Running
			&& rpc == ServiceState::Running
			&& self.is_active()
			&& self.connection_state() == ConnectionState::Connecting
			&& !self.is_sync_running()
		{
			debug!("Middleware running again, synchronizing data");
			drop(self.request_data());
		}
	}

	async fn wait_for_middleware(&self, limit: Option<Duration>) -> Result<(), Error> {
		let transports = self.transports()?;

		let wait = async {
			tokio::select! {
				biased;
				() = self.shutdown.cancelled() => Err(Error::ShutdownInProgress),
				res = async {
					tokio::try_join!(
						transports
							.subscriber
							.wait_for_service_state(ServiceState::Running, None),
						transports
							.rpc
							.wait_for_service_state(ServiceState::Running, None),
					)
				} => res.map(|_| ()),
			}
		};

		with_limit(limit, wait, || "waiting for the middleware".to_string()).await
	}
}

impl<M> Drop for Inner<M> {
	fn drop(&mut self) {
		if let Some(transports) = self.transports.lock().take() {
			transports.monitor.cancel();
		}
	}
}

async fn monitor_middleware<M: RemoteData>(
	inner: std::sync::Weak<Inner<M>>,
	mut subscriber: watch::Receiver<ServiceState>,
	mut rpc: watch::Receiver<ServiceState>,
) {
	loop {
		let changed = tokio::select! {
			res = subscriber.changed() => res,
			res = rpc.changed() => res,
		};

		if changed.is_err() {
			trace!("Watchdogs dropped, stopping middleware monitor");
			return;
		}

		let subscriber_state = *subscriber.borrow_and_update();
		let rpc_state = *rpc.borrow_and_update();

		let Some(inner) = inner.upgrade() else {
			return;
		};
		inner.on_middleware_state(subscriber_state, rpc_state);
	}
}

/// Bounds `fut` with `limit`, if any
async fn with_limit<T>(
	limit: Option<Duration>,
	fut: impl Future<Output = Result<T, Error>>,
	what: impl FnOnce() -> String,
) -> Result<T, Error> {
	match limit {
		Some(limit) => timeout(limit, fut)
			.await
			.map_err(|_| Error::Timeout(what()))?,
		None => fut.await,
	}
}

fn string_field(record: &dyn Record, name: &str) -> Result<String, Error> {
	let value = record.get_field(name)?;

	String::from_field_value(value)
		.map_err(|found| FieldError::type_mismatch(name, String::TYPE_NAME, &found).into())
}
