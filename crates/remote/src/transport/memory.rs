//! In process middleware.
//!
//! A [`MemoryBus`] routes events between publishers and subscribers sharing a scope, and method
//! calls to the [`RpcHandler`] serving a scope. Faults can be injected per scope to exercise the
//! recovery paths of the connections using it. [`StatusController`] is the controller side of a
//! remote object living on the bus.

use std::{
	collections::HashMap,
	sync::{
		atomic::{AtomicBool, AtomicU64, Ordering},
		Arc,
	},
	time::Duration,
};

use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use sd_task_system::{TaskRemoteController, TaskSystem};
use sd_utils::{FieldValue, MonitoredMutex, ObservableRwLock, Record};
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, trace, warn, Instrument};
use uuid::Uuid;

use super::{
	decode, encode, DataHandler, Event, RpcClient, RpcError, Service, Subscriber,
	TransportError, TransportFactory, PING_METHOD, REQUEST_STATUS_METHOD,
};
use crate::{scope::Scope, Error};

/// Answers the method calls sent to a scope
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
	async fn handle(&self, method: &str, arg: Vec<u8>) -> Result<Vec<u8>, RpcError>;
}

/// Faults that can be injected on a scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
	/// Services on the scope fail to activate
	Unavailable,
	/// Method calls report the transport as invalid
	Invalidated,
	/// Method calls never get a reply
	Silent,
}

#[derive(Default)]
struct Routes {
	subscribers: HashMap<Scope, Vec<(Uuid, Sender<Event>)>>,
	handlers: HashMap<Scope, Arc<dyn RpcHandler>>,
	faults: HashMap<Scope, Fault>,
	calls: HashMap<(Scope, String), usize>,
	built: HashMap<Scope, usize>,
}

struct BusInner {
	tasks: TaskSystem,
	routes: MonitoredMutex<Routes>,
	factory_delay: MonitoredMutex<Duration>,
}

/// In process middleware, cheap to clone
#[derive(Clone)]
pub struct MemoryBus {
	inner: Arc<BusInner>,
}

impl MemoryBus {
	#[must_use]
	pub fn new(tasks: TaskSystem) -> Self {
		Self {
			inner: Arc::new(BusInner {
				tasks,
				routes: MonitoredMutex::new("memory bus routes", Routes::default()),
				factory_delay: MonitoredMutex::new("memory bus factory delay", Duration::ZERO),
			}),
		}
	}

	/// Delivers `event` to every active subscriber of `scope`, returning how many got it
	pub fn publish(&self, scope: &Scope, event: Event) -> usize {
		let senders = self
			.inner
			.routes
			.lock()
			.subscribers
			.get(scope)
			.map(|subscribers| {
				subscribers
					.iter()
					.map(|(_, tx)| tx.clone())
					.collect::<Vec<_>>()
			})
			.unwrap_or_default();

		let delivered = senders
			.into_iter()
			.filter(|tx| tx.try_send(event.clone()).is_ok())
			.count();

		trace!(%scope, delivered, "Published event");

		delivered
	}

	/// Routes method calls on `scope` to `handler`, replacing any previous one
	pub fn serve(&self, scope: Scope, handler: Arc<dyn RpcHandler>) {
		self.inner.routes.lock().handlers.insert(scope, handler);
	}

	pub fn stop_serving(&self, scope: &Scope) {
		self.inner.routes.lock().handlers.remove(scope);
	}

	pub fn inject_fault(&self, scope: Scope, fault: Fault) {
		debug!(%scope, ?fault, "Injecting fault");
		self.inner.routes.lock().faults.insert(scope, fault);
	}

	pub fn clear_fault(&self, scope: &Scope) {
		self.inner.routes.lock().faults.remove(scope);
	}

	/// How many times `method` was called on `scope`
	#[must_use]
	pub fn calls(&self, scope: &Scope, method: &str) -> usize {
		self.inner
			.routes
			.lock()
			.calls
			.get(&(scope.clone(), method.to_string()))
			.copied()
			.unwrap_or(0)
	}

	/// How many services were built for `scope`
	#[must_use]
	pub fn built(&self, scope: &Scope) -> usize {
		self.inner
			.routes
			.lock()
			.built
			.get(scope)
			.copied()
			.unwrap_or(0)
	}

	/// Makes building services take `delay`, like a real middleware connecting to its broker
	pub fn set_factory_delay(&self, delay: Duration) {
		*self.inner.factory_delay.lock() = delay;
	}

	/// Drops every subscriber of `scope`, like a broker losing its clients. Returns how many
	/// were dropped.
	pub fn disconnect(&self, scope: &Scope) -> usize {
		let dropped = self
			.inner
			.routes
			.lock()
			.subscribers
			.remove(scope)
			.map_or(0, |subscribers| subscribers.len());

		debug!(%scope, dropped, "Disconnected subscribers");

		dropped
	}

	#[must_use]
	pub fn subscribers(&self, scope: &Scope) -> usize {
		self.inner
			.routes
			.lock()
			.subscribers
			.get(scope)
			.map_or(0, Vec::len)
	}
}

impl BusInner {
	fn fault(&self, scope: &Scope) -> Option<Fault> {
		self.routes.lock().faults.get(scope).copied()
	}

	async fn building(&self, scope: &Scope) {
		let delay = *self.factory_delay.lock();
		if !delay.is_zero() {
			sleep(delay).await;
		}

		*self.routes.lock().built.entry(scope.clone()).or_default() += 1;
	}
}

#[async_trait]
impl TransportFactory for MemoryBus {
	async fn subscriber(&self, scope: &Scope) -> Result<Arc<dyn Subscriber>, TransportError> {
		self.inner.building(scope).await;

		Ok(Arc::new(MemorySubscriber {
			id: Uuid::new_v4(),
			scope: scope.clone(),
			bus: Arc::clone(&self.inner),
			handler: Arc::new(MonitoredMutex::new("subscriber handler", None)),
			dispatcher: MonitoredMutex::new("subscriber dispatcher", None),
		}))
	}

	async fn rpc_client(&self, scope: &Scope) -> Result<Arc<dyn RpcClient>, TransportError> {
		self.inner.building(scope).await;

		Ok(Arc::new(MemoryRpcClient {
			scope: scope.clone(),
			bus: Arc::clone(&self.inner),
			active: AtomicBool::new(false),
		}))
	}
}

pub struct MemorySubscriber {
	id: Uuid,
	scope: Scope,
	bus: Arc<BusInner>,
	handler: Arc<MonitoredMutex<Option<DataHandler>>>,
	dispatcher: MonitoredMutex<Option<TaskRemoteController>>,
}

#[async_trait]
impl Service for MemorySubscriber {
	fn scope(&self) -> &Scope {
		&self.scope
	}

	async fn activate(&self) -> Result<(), TransportError> {
		if self.bus.fault(&self.scope) == Some(Fault::Unavailable) {
			return Err(TransportError::Activation {
				scope: self.scope.clone(),
				reason: "scope unavailable".to_string(),
			});
		}

		let mut dispatcher = self.dispatcher.lock();
		if dispatcher.as_ref().is_some_and(|dispatcher| !dispatcher.is_done()) {
			return Ok(());
		}

		let (tx, rx) = async_channel::unbounded();

		self.bus
			.routes
			.lock()
			.subscribers
			.entry(self.scope.clone())
			.or_default()
			.push((self.id, tx));

		let handle = self.bus.tasks.schedule(
			dispatch(rx, Arc::clone(&self.handler))
				.instrument(tracing::trace_span!("subscriber", scope = %self.scope)),
		);
		*dispatcher = Some(handle.remote_controller());

		Ok(())
	}

	async fn deactivate(&self) -> Result<(), TransportError> {
		if let Some(dispatcher) = self.dispatcher.lock().take() {
			dispatcher.cancel();
		}

		if let Some(subscribers) = self.bus.routes.lock().subscribers.get_mut(&self.scope) {
			subscribers.retain(|(id, _)| *id != self.id);
		}

		Ok(())
	}

	/// A disconnected subscriber's dispatcher stops on its own, which makes it inactive
	fn is_active(&self) -> bool {
		self.dispatcher
			.lock()
			.as_ref()
			.is_some_and(|dispatcher| !dispatcher.is_done())
	}
}

impl Subscriber for MemorySubscriber {
	fn register_data_handler(&self, handler: DataHandler) {
		*self.handler.lock() = Some(handler);
	}
}

impl Drop for MemorySubscriber {
	fn drop(&mut self) {
		if let Some(dispatcher) = self.dispatcher.lock().take() {
			dispatcher.cancel();
		}

		if let Some(subscribers) = self.bus.routes.lock().subscribers.get_mut(&self.scope) {
			subscribers.retain(|(id, _)| *id != self.id);
		}
	}
}

async fn dispatch(rx: Receiver<Event>, handler: Arc<MonitoredMutex<Option<DataHandler>>>) {
	while let Ok(event) = rx.recv().await {
		let handler = handler.lock().clone();

		if let Some(handler) = handler {
			handler(event);
		} else {
			trace!("Dropping event, no handler registered");
		}
	}
}

pub struct MemoryRpcClient {
	scope: Scope,
	bus: Arc<BusInner>,
	active: AtomicBool,
}

#[async_trait]
impl Service for MemoryRpcClient {
	fn scope(&self) -> &Scope {
		&self.scope
	}

	async fn activate(&self) -> Result<(), TransportError> {
		if self.bus.fault(&self.scope) == Some(Fault::Unavailable) {
			return Err(TransportError::Activation {
				scope: self.scope.clone(),
				reason: "scope unavailable".to_string(),
			});
		}

		self.active.store(true, Ordering::Release);
		Ok(())
	}

	async fn deactivate(&self) -> Result<(), TransportError> {
		self.active.store(false, Ordering::Release);
		Ok(())
	}

	fn is_active(&self) -> bool {
		self.active.load(Ordering::Acquire)
	}
}

#[async_trait]
impl RpcClient for MemoryRpcClient {
	async fn call_method(&self, method: &str, arg: Vec<u8>) -> Result<Vec<u8>, RpcError> {
		if !self.is_active() {
			return Err(RpcError::Inactive);
		}

		let (fault, handler) = {
			let mut routes = self.bus.routes.lock();
			*routes
				.calls
				.entry((self.scope.clone(), method.to_string()))
				.or_default() += 1;

			(
				routes.faults.get(&self.scope).copied(),
				routes.handlers.get(&self.scope).cloned(),
			)
		};

		match (fault, handler) {
			(Some(Fault::Invalidated), _) => Err(RpcError::InvalidTransport(format!(
				"transport of <{}> was invalidated",
				self.scope
			))),
			(Some(Fault::Silent), _) | (_, None) => {
				// Nobody will ever answer, the caller's timeout decides when to give up
				std::future::pending().await
			}
			(_, Some(handler)) => handler.handle(method, arg).await,
		}
	}
}

type MethodFn = Arc<dyn Fn(Vec<u8>) -> Result<Vec<u8>, RpcError> + Send + Sync>;

/// Controller side of a remote object living on a [`MemoryBus`].
///
/// Owns the authoritative record, answers `requestStatus` and `ping` on `<scope>/ctrl`, and
/// broadcasts the record on `<scope>/status` after every update, with strictly increasing
/// `(create_time, user_time)` pairs. If the record supports a `transaction_id` field, it is
/// bumped on every update.
pub struct StatusController<M> {
	scope: Scope,
	bus: MemoryBus,
	record: ObservableRwLock<M>,
	transaction_id: AtomicU64,
	clock: MonitoredMutex<(u64, u64)>,
	methods: MonitoredMutex<HashMap<String, MethodFn>>,
	response_delay: MonitoredMutex<Duration>,
}

impl<M> StatusController<M>
where
	M: Record + Serialize + Clone + Send + Sync + 'static,
{
	/// Starts serving `record` on `scope`
	pub fn serve(bus: &MemoryBus, scope: Scope, record: M) -> Arc<Self> {
		let transaction_id = record
			.field("transaction_id")
			.and_then(|value| match value {
				FieldValue::U64(id) => Some(id),
				FieldValue::I64(id) => u64::try_from(id).ok(),
				_ => None,
			})
			.unwrap_or(0);

		let this = Arc::new(Self {
			record: ObservableRwLock::new(
				format!("{scope} status"),
				record,
				Duration::from_secs(30),
			),
			scope,
			bus: bus.clone(),
			transaction_id: AtomicU64::new(transaction_id),
			clock: MonitoredMutex::new("controller clock", (0, 0)),
			methods: MonitoredMutex::new("controller methods", HashMap::new()),
			response_delay: MonitoredMutex::new("controller response delay", Duration::ZERO),
		});

		bus.serve(this.scope.ctrl(), Arc::clone(&this) as Arc<dyn RpcHandler>);

		this
	}

	#[must_use]
	pub const fn scope(&self) -> &Scope {
		&self.scope
	}

	#[must_use]
	pub fn record(&self) -> M {
		self.record.read().clone()
	}

	#[must_use]
	pub fn transaction_id(&self) -> u64 {
		self.transaction_id.load(Ordering::Acquire)
	}

	/// How many updates were applied to the record so far
	#[must_use]
	pub fn version(&self) -> u64 {
		self.record.version()
	}

	/// Applies `update` to the record and broadcasts the result
	pub fn update(&self, update: impl FnOnce(&mut M)) -> Result<M, Error> {
		let record = {
			let mut record = self.record.write();
			update(&mut *record);

			if record.supports_field("transaction_id") {
				let id = self.transaction_id.fetch_add(1, Ordering::AcqRel) + 1;
				record.set_field("transaction_id", FieldValue::U64(id))?;
			}

			(*record).clone()
		};

		self.broadcast(&record)?;

		Ok(record)
	}

	/// Broadcasts the current record again, with a fresh ordering pair
	pub fn publish(&self) -> Result<usize, Error> {
		let record = self.record();
		self.broadcast(&record)
	}

	/// Tells subscribers the controller went away
	pub fn detach(&self) -> usize {
		self.bus.publish(&self.scope.status(), Event::detached())
	}

	/// Serves an extra method, the closure gets and returns encoded values
	pub fn on_method(
		&self,
		method: impl Into<String>,
		handler: impl Fn(Vec<u8>) -> Result<Vec<u8>, RpcError> + Send + Sync + 'static,
	) {
		self.methods.lock().insert(method.into(), Arc::new(handler));
	}

	/// Makes every reply take `delay`
	pub fn set_response_delay(&self, delay: Duration) {
		*self.response_delay.lock() = delay;
	}

	fn next_times(&self) -> (u64, u64) {
		let mut clock = self.clock.lock();
		clock.0 += 1;
		*clock
	}

	fn broadcast(&self, record: &M) -> Result<usize, Error> {
		let (create_time, user_time) = self.next_times();
		let event = Event::new(encode("status record", record)?).with_times(create_time, user_time);

		Ok(self.bus.publish(&self.scope.status(), event))
	}
}

#[async_trait]
impl<M> RpcHandler for StatusController<M>
where
	M: Record + Serialize + Clone + Send + Sync + 'static,
{
	async fn handle(&self, method: &str, arg: Vec<u8>) -> Result<Vec<u8>, RpcError> {
		let delay = *self.response_delay.lock();
		if !delay.is_zero() {
			sleep(delay).await;
		}

		match method {
			REQUEST_STATUS_METHOD => encode("status record", &self.record())
				.map_err(|e| RpcError::Remote(e.to_string())),
			PING_METHOD => {
				// Validates the argument before echoing it back
				let sent_at = decode::<u64>("ping timestamp", &arg)
					.map_err(|e| RpcError::Remote(e.to_string()))?;
				encode("ping timestamp", &sent_at).map_err(|e| RpcError::Remote(e.to_string()))
			}
			other => {
				let handler = self.methods.lock().get(other).cloned();
				if let Some(handler) = handler {
					handler(arg)
				} else {
					warn!(scope = %self.scope, method = other, "Unknown method called");
					Err(RpcError::Remote(format!("unknown method <{other}>")))
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use sd_utils::DynamicRecord;

	use super::*;

	#[tokio::test]
	async fn events_reach_active_subscribers_only() {
		let tasks = TaskSystem::new();
		let bus = MemoryBus::new(tasks.clone());
		let scope = Scope::parse("test/events").expect("valid scope");

		let subscriber = bus.subscriber(&scope).await.expect("memory bus never fails");
		let (tx, rx) = async_channel::unbounded();
		subscriber.register_data_handler(Arc::new(move |event| {
			tx.try_send(event).expect("receiver alive");
		}));

		assert_eq!(bus.publish(&scope, Event::new(vec![1])), 0);

		subscriber.activate().await.expect("activation succeeds");
		assert_eq!(bus.publish(&scope, Event::new(vec![2])), 1);
		assert_eq!(rx.recv().await.expect("event delivered").payload, Some(vec![2]));

		subscriber.deactivate().await.expect("deactivation succeeds");
		assert!(!subscriber.is_active());
		assert_eq!(bus.publish(&scope, Event::new(vec![3])), 0);

		tasks.shutdown().await;
	}

	#[tokio::test]
	async fn disconnected_subscribers_turn_inactive() {
		let tasks = TaskSystem::new();
		let bus = MemoryBus::new(tasks.clone());
		let scope = Scope::parse("test/flaky-broker").expect("valid scope");

		let subscriber = bus.subscriber(&scope).await.expect("memory bus never fails");
		subscriber.activate().await.expect("activation succeeds");
		assert_eq!(bus.subscribers(&scope), 1);

		assert_eq!(bus.disconnect(&scope), 1);
		tokio::time::timeout(Duration::from_secs(1), async {
			while subscriber.is_active() {
				tokio::task::yield_now().await;
			}
		})
		.await
		.expect("dispatcher stops once disconnected");

		subscriber.activate().await.expect("reactivation succeeds");
		assert!(subscriber.is_active());
		assert_eq!(bus.subscribers(&scope), 1);

		tasks.shutdown().await;
	}

	#[tokio::test]
	async fn controller_answers_and_broadcasts() {
		let tasks = TaskSystem::new();
		let bus = MemoryBus::new(tasks.clone());
		let scope = Scope::parse("test/controller").expect("valid scope");

		let controller = StatusController::serve(
			&bus,
			scope.clone(),
			DynamicRecord::with_schema(["value", "transaction_id"])
				.with("value", 1_i64)
				.with("transaction_id", 0_u64),
		);

		let client = bus.rpc_client(&scope.ctrl()).await.expect("memory bus never fails");
		assert_eq!(
			client.call_method(REQUEST_STATUS_METHOD, vec![]).await,
			Err(RpcError::Inactive)
		);
		client.activate().await.expect("activation succeeds");

		let status: DynamicRecord = decode(
			"status",
			&client
				.call_method(REQUEST_STATUS_METHOD, vec![])
				.await
				.expect("status reply"),
		)
		.expect("valid status");
		assert_eq!(status.field("value"), Some(FieldValue::I64(1)));

		let updated = controller
			.update(|record| {
				record
					.set_field("value", FieldValue::I64(2))
					.expect("value is part of the schema");
			})
			.expect("update succeeds");
		assert_eq!(updated.field("transaction_id"), Some(FieldValue::U64(1)));
		assert_eq!(controller.version(), 1);

		assert!(matches!(
			client.call_method("foo", vec![]).await,
			Err(RpcError::Remote(_))
		));
		assert_eq!(bus.calls(&scope.ctrl(), REQUEST_STATUS_METHOD), 1);

		bus.inject_fault(scope.ctrl(), Fault::Invalidated);
		assert!(matches!(
			client.call_method(PING_METHOD, vec![]).await,
			Err(RpcError::InvalidTransport(_))
		));

		tasks.shutdown().await;
	}
}
