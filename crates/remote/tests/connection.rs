use std::{
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc,
	},
	time::Duration,
};

use async_trait::async_trait;
use sd_remote::{
	transport::{
		decode, encode,
		memory::{Fault, MemoryBus, RpcHandler, StatusController},
		Event, RpcError, REQUEST_STATUS_METHOD,
	},
	Configurable, ConnectionState, ConnectionStateChange, Error, Maintainer, RemoteConfig,
	RemoteConnection, Scope,
};
use sd_task_system::{TaskSystem, TaskSystemConfig};
use sd_utils::{impl_record, DynamicRecord, MonitoredMutex};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout, Instant};
use tracing_test::traced_test;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Light {
	id: String,
	label: Option<String>,
	power: bool,
	brightness: u64,
	transaction_id: u64,
}

impl_record!(Light {
	id,
	label,
	power,
	brightness,
	transaction_id
});

fn kitchen_light() -> Light {
	Light {
		id: "kitchen-light".to_string(),
		label: Some("Kitchen".to_string()),
		power: true,
		brightness: 50,
		transaction_id: 0,
	}
}

/// Fails the first `requestStatus` calls with `failure`, then behaves like `controller`
struct FlakyStatus {
	controller: Arc<StatusController<Light>>,
	failure: Result<Vec<u8>, RpcError>,
	failures_left: AtomicUsize,
}

#[async_trait]
impl RpcHandler for FlakyStatus {
	async fn handle(&self, method: &str, arg: Vec<u8>) -> Result<Vec<u8>, RpcError> {
		if method == REQUEST_STATUS_METHOD
			&& self
				.failures_left
				.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
				.is_ok()
		{
			return self.failure.clone();
		}

		self.controller.handle(method, arg).await
	}
}

type ObservedUpdates = Arc<MonitoredMutex<Vec<(&'static str, u64, u64)>>>;

/// Records which observer saw which transaction, and the connection's transaction id meanwhile
fn recording_observer(
	updates: &ObservedUpdates,
	connection: &RemoteConnection<Light>,
	name: &'static str,
) -> impl Fn(&Arc<Light>) + Send + Sync + 'static {
	let updates = Arc::clone(updates);
	let connection = connection.clone();

	move |light| {
		updates
			.lock()
			.push((name, light.transaction_id, connection.get_transaction_id()));
	}
}

fn state_changes(
	connection: &RemoteConnection<Light>,
) -> Arc<MonitoredMutex<Vec<ConnectionStateChange>>> {
	let changes = Arc::new(MonitoredMutex::new("state changes", Vec::new()));

	connection.add_connection_state_observer({
		let changes = Arc::clone(&changes);
		move |change: &ConnectionStateChange| changes.lock().push(*change)
	});

	changes
}

const DEGRADED: ConnectionStateChange = ConnectionStateChange {
	previous: ConnectionState::Connected,
	current: ConnectionState::Connecting,
};

struct Harness {
	tasks: TaskSystem,
	bus: MemoryBus,
	scope: Scope,
	connection: RemoteConnection<Light>,
}

impl Harness {
	fn new(scope: &str) -> Self {
		let tasks = TaskSystem::with_config(TaskSystemConfig {
			workers_count: 8,
			overload_threshold: 64,
		});
		let bus = MemoryBus::new(tasks.clone());
		let connection =
			RemoteConnection::new(tasks.clone(), Arc::new(bus.clone()), RemoteConfig::default());

		Self {
			tasks,
			bus,
			scope: Scope::parse(scope).expect("valid scope"),
			connection,
		}
	}

	fn serve(&self, light: Light) -> Arc<StatusController<Light>> {
		StatusController::serve(&self.bus, self.scope.clone(), light)
	}

	async fn connect(&self) {
		self.connection
			.init(self.scope.clone())
			.await
			.expect("init succeeds");

		timeout(Duration::from_secs(5), self.connection.activate(true))
			.await
			.expect("data arrives in time")
			.expect("activation succeeds");
	}

	/// Activates without a controller around, waiting for the middleware only
	async fn activate_alone(&self) {
		self.connection
			.init(self.scope.clone())
			.await
			.expect("init succeeds");
		self.connection
			.activate(false)
			.await
			.expect("activation succeeds");
		self.connection
			.wait_for_middleware(Some(Duration::from_secs(5)))
			.await
			.expect("middleware starts");
	}

	fn publish(&self, light: &Light, create_time: u64, user_time: u64) -> usize {
		self.bus.publish(
			&self.scope.status(),
			Event::new(encode("light", light).expect("encodable"))
				.with_times(create_time, user_time),
		)
	}

	fn calls(&self, method: &str) -> usize {
		self.bus.calls(&self.scope.ctrl(), method)
	}

	async fn wait_for(&self, check: impl Fn(&Light) -> bool) {
		timeout(Duration::from_secs(5), async {
			loop {
				if self
					.connection
					.get_data()
					.is_ok_and(|light| check(&light))
				{
					return;
				}
				sleep(Duration::from_millis(10)).await;
			}
		})
		.await
		.expect("expected data in time");
	}

	async fn shutdown(self) {
		self.connection.shutdown().await;
		self.tasks.shutdown().await;
	}
}

#[tokio::test]
#[traced_test]
async fn connects_and_synchronizes() {
	let harness = Harness::new("home/kitchen/light");
	let controller = harness.serve(kitchen_light());

	assert_eq!(
		harness.connection.get_connection_state(),
		ConnectionState::Disconnected
	);
	assert!(matches!(
		harness.connection.get_data(),
		Err(Error::NotAvailable(_))
	));

	harness.connect().await;

	assert!(harness.connection.is_connected());
	assert_eq!(*harness.connection.get_data().expect("data"), controller.record());
	assert_eq!(harness.connection.record_id().expect("record id"), "kitchen-light");
	assert_eq!(harness.connection.label().expect("label"), "Kitchen");
	assert_eq!(
		harness.connection.scope().expect("scope"),
		harness.scope
	);
	assert_eq!(harness.calls(REQUEST_STATUS_METHOD), 1);

	harness.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn applies_events_in_order_and_drops_stale_ones() {
	let harness = Harness::new("home/kitchen/light");
	let controller = harness.serve(kitchen_light());
	harness.connect().await;

	let seen = Arc::new(MonitoredMutex::new("seen", Vec::new()));
	harness.connection.add_data_observer({
		let seen = Arc::clone(&seen);
		move |light| seen.lock().push(light.brightness)
	});

	controller
		.update(|light| light.brightness = 10)
		.expect("update");
	harness.wait_for(|light| light.brightness == 10).await;

	// Same ordering pair as the update we already got
	assert_eq!(
		harness.publish(
			&Light {
				brightness: 99,
				..controller.record()
			},
			1,
			0
		),
		1
	);

	controller
		.update(|light| light.brightness = 20)
		.expect("update");
	harness.wait_for(|light| light.brightness == 20).await;

	assert_eq!(*seen.lock(), [10, 20]);
	assert_eq!(harness.connection.get_transaction_id(), 2);

	harness.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn event_connects_without_any_controller() {
	let harness = Harness::new("home/attic/fan");
	harness.activate_alone().await;

	assert_eq!(
		harness.connection.get_connection_state(),
		ConnectionState::Connecting
	);

	let fan = Light {
		id: "fan".to_string(),
		..Light::default()
	};
	assert_eq!(harness.publish(&fan, 5, 0), 1);

	harness
		.connection
		.wait_for_connection_state(ConnectionState::Connected, Some(Duration::from_secs(5)))
		.await
		.expect("connected by the event");

	assert_eq!(*harness.connection.get_data().expect("data"), fan);
	assert!(!harness.connection.is_sync_running());

	harness.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn duplicated_event_is_not_observed() {
	let harness = Harness::new("home/attic/fan");
	harness.activate_alone().await;

	let notified = Arc::new(AtomicUsize::new(0));
	harness.connection.add_data_observer({
		let notified = Arc::clone(&notified);
		move |_| {
			notified.fetch_add(1, Ordering::Relaxed);
		}
	});

	let fan = Light {
		id: "fan".to_string(),
		brightness: 1,
		..Light::default()
	};
	harness.publish(&fan, 5, 0);
	harness.wait_for(|light| light.brightness == 1).await;

	harness.publish(
		&Light {
			brightness: 2,
			..fan.clone()
		},
		5,
		0,
	);
	harness.publish(
		&Light {
			brightness: 3,
			..fan.clone()
		},
		4,
		7,
	);
	harness.publish(
		&Light {
			brightness: 4,
			..fan.clone()
		},
		5,
		1,
	);
	harness.wait_for(|light| light.brightness == 4).await;

	assert_eq!(notified.load(Ordering::Relaxed), 2);

	harness.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn concurrent_data_requests_share_one_sync() {
	let harness = Harness::new("home/kitchen/light");
	let controller = harness.serve(kitchen_light());
	harness.connect().await;

	controller.set_response_delay(Duration::from_millis(100));
	let before = harness.calls(REQUEST_STATUS_METHOD);

	let first = harness.connection.request_data();
	let others = (0..4)
		.map(|_| harness.connection.request_data())
		.collect::<Vec<_>>();

	assert!(harness.connection.is_sync_running());
	assert!(others.iter().all(|other| other.same_sync(&first)));

	for other in others {
		other.await.expect("shared sync succeeds");
	}
	first.await.expect("sync succeeds");

	assert_eq!(harness.calls(REQUEST_STATUS_METHOD), before + 1);

	let next = harness.connection.request_data();
	next.await.expect("next sync succeeds");
	assert_eq!(harness.calls(REQUEST_STATUS_METHOD), before + 2);

	harness.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn connected_always_has_data() {
	let harness = Harness::new("home/kitchen/light");
	let controller = harness.serve(kitchen_light());

	let violations = Arc::new(AtomicUsize::new(0));
	let changes = Arc::new(MonitoredMutex::new("changes", Vec::new()));
	let observer = harness.connection.add_connection_state_observer({
		let connection = harness.connection.clone();
		let violations = Arc::clone(&violations);
		let changes = Arc::clone(&changes);
		move |change: &ConnectionStateChange| {
			changes.lock().push(change.current);
			if change.current == ConnectionState::Connected && !connection.is_data_available() {
				violations.fetch_add(1, Ordering::Relaxed);
			}
		}
	});

	harness.connect().await;

	controller.detach();
	timeout(Duration::from_secs(5), async {
		while harness.calls(REQUEST_STATUS_METHOD) < 2 {
			sleep(Duration::from_millis(10)).await;
		}
	})
	.await
	.expect("detach triggers a new sync");

	harness
		.connection
		.wait_for_connection_state(ConnectionState::Connected, Some(Duration::from_secs(5)))
		.await
		.expect("connected again");

	assert!(harness.connection.remove_connection_state_observer(observer));
	assert_eq!(violations.load(Ordering::Relaxed), 0);
	assert!(changes
		.lock()
		.windows(2)
		.any(|pair| pair == [ConnectionState::Connected, ConnectionState::Connecting]));

	harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn call_method_times_out_within_budget() {
	let harness = Harness::new("home/garage/door");
	harness.activate_alone().await;

	let started = Instant::now();
	let res = harness
		.connection
		.call_method::<_, u64>("foo", &(), Some(Duration::from_millis(1000)))
		.await;
	let elapsed = started.elapsed();

	assert!(matches!(res, Err(Error::Timeout(_))), "got {res:?}");
	assert!(elapsed >= Duration::from_millis(1000), "took {elapsed:?}");
	assert!(elapsed < Duration::from_millis(1100), "took {elapsed:?}");
	assert!(harness.calls("foo") >= 2);

	harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn silent_controller_keeps_sync_retrying() {
	let harness = Harness::new("home/garage/door");
	let _controller = harness.serve(kitchen_light());
	harness
		.bus
		.inject_fault(harness.scope.ctrl(), Fault::Silent);

	harness.activate_alone().await;
	sleep(Duration::from_secs(5)).await;

	assert!(harness.connection.is_sync_running());
	assert!(harness.calls("ping") >= 3);
	assert!(!harness.connection.is_data_available());

	harness.bus.clear_fault(&harness.scope.ctrl());

	harness
		.connection
		.wait_for_data(Some(Duration::from_secs(60)))
		.await
		.expect("sync eventually succeeds");
	assert!(harness.connection.is_connected());

	harness.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn concurrent_reinit_is_rejected() {
	let harness = Harness::new("home/kitchen/light");
	let _controller = harness.serve(kitchen_light());
	harness.connect().await;

	let (first, second) = tokio::join!(
		harness.connection.reinit(),
		harness.connection.reinit(),
	);

	first.expect("first reinit succeeds");
	let Err(Error::Fatal(message)) = second else {
		panic!("expected a fatal error, got {second:?}");
	};
	assert_eq!(message.matches(file!()).count(), 2, "{message}");

	harness
		.connection
		.reinit()
		.await
		.expect("reinit is allowed again once the first one finished");

	harness.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn reinit_keeps_data_and_maintainer() {
	let harness = Harness::new("home/kitchen/light");
	let controller = harness.serve(kitchen_light());
	harness.connect().await;

	let owner = Maintainer::new();
	harness.connection.lock(owner).expect("lock");
	assert!(harness.connection.lock(Maintainer::new()).is_err());
	assert!(matches!(
		harness.connection.deactivate().await,
		Err(Error::InvalidState(_))
	));

	let states = Arc::new(MonitoredMutex::new("states", Vec::new()));
	harness.connection.add_connection_state_observer({
		let states = Arc::clone(&states);
		move |change: &ConnectionStateChange| states.lock().push(change.current)
	});

	harness.connection.reinit().await.expect("reinit succeeds");

	assert_eq!(harness.connection.maintainer(), Some(owner));
	assert_eq!(*harness.connection.get_data().expect("data kept"), controller.record());
	assert_eq!(harness.bus.built(&harness.scope.status()), 2);

	harness
		.connection
		.wait_for_connection_state(ConnectionState::Connected, Some(Duration::from_secs(5)))
		.await
		.expect("reconnected");
	assert_eq!(
		states.lock().first(),
		Some(&ConnectionState::Reconnecting)
	);

	harness
		.connection
		.deactivate_as(owner)
		.await
		.expect("maintainer may deactivate");
	assert_eq!(
		harness.connection.get_connection_state(),
		ConnectionState::Disconnected
	);
	harness.connection.unlock(owner).expect("unlock");
	assert!(!harness.connection.is_locked());

	harness.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn invalid_transport_triggers_reinit() {
	let harness = Harness::new("home/kitchen/light");
	let _controller = harness.serve(kitchen_light());
	harness.connect().await;

	harness
		.bus
		.inject_fault(harness.scope.ctrl(), Fault::Invalidated);

	let res = harness
		.connection
		.call_method::<_, u64>("foo", &(), Some(Duration::from_secs(1)))
		.await;
	assert!(
		matches!(res, Err(Error::Transport(_))),
		"got {res:?}"
	);

	harness.bus.clear_fault(&harness.scope.ctrl());

	timeout(Duration::from_secs(5), async {
		while harness.bus.built(&harness.scope.ctrl()) < 2 {
			sleep(Duration::from_millis(10)).await;
		}
	})
	.await
	.expect("transports rebuilt");

	harness
		.connection
		.wait_for_connection_state(ConnectionState::Connected, Some(Duration::from_secs(5)))
		.await
		.expect("reconnected after reinit");

	harness.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn methods_and_ping() {
	let harness = Harness::new("home/kitchen/light");
	let controller = harness.serve(kitchen_light());

	controller.on_method("double", |arg| {
		let value = decode::<u64>("value", &arg).map_err(|e| RpcError::Remote(e.to_string()))?;
		encode("doubled", &(value * 2)).map_err(|e| RpcError::Remote(e.to_string()))
	});

	let weak = Arc::downgrade(&controller);
	controller.on_method("setBrightness", move |arg| {
		let controller = weak
			.upgrade()
			.ok_or_else(|| RpcError::Remote("controller gone".to_string()))?;
		let brightness =
			decode::<u64>("brightness", &arg).map_err(|e| RpcError::Remote(e.to_string()))?;
		let light = controller
			.update(|light| light.brightness = brightness)
			.map_err(|e| RpcError::Remote(e.to_string()))?;
		encode("light", &light).map_err(|e| RpcError::Remote(e.to_string()))
	});

	harness.connect().await;

	let doubled = harness
		.connection
		.call_method::<_, u64>("double", &21_u64, Some(Duration::from_secs(1)))
		.await
		.expect("call succeeds");
	assert_eq!(doubled, 42);

	let doubled = harness
		.connection
		.call_method_async::<_, u64>("double", &4_u64, Some(Duration::from_secs(1)))
		.await
		.expect("task runs")
		.expect("call succeeds");
	assert_eq!(doubled, 8);

	let reply = harness
		.connection
		.call_method_synchronized::<_, Light>(
			"setBrightness",
			&80_u64,
			Some(Duration::from_secs(5)),
		)
		.await
		.expect("synchronized call succeeds");
	assert_eq!(reply.brightness, 80);
	assert!(harness.connection.get_transaction_id() >= reply.transaction_id);
	assert_eq!(harness.connection.get_data().expect("data").brightness, 80);

	assert!(matches!(
		harness
			.connection
			.call_method::<_, u64>("missing", &(), Some(Duration::from_secs(1)))
			.await,
		Err(Error::Remote { method, .. }) if method == "missing"
	));

	harness.connection.ping().await.expect("ping succeeds");
	assert!(harness.connection.get_ping().is_some());
	assert!(harness.connection.last_ping_received().is_some());

	harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn middleware_failures_delay_connection() {
	let harness = Harness::new("home/cellar/pump");
	let _controller = harness.serve(kitchen_light());
	harness
		.bus
		.inject_fault(harness.scope.status(), Fault::Unavailable);

	harness
		.connection
		.init(harness.scope.clone())
		.await
		.expect("init succeeds");
	harness
		.connection
		.activate(false)
		.await
		.expect("activation succeeds");

	sleep(Duration::from_secs(3)).await;
	assert_eq!(
		harness.connection.get_connection_state(),
		ConnectionState::Connecting
	);
	assert!(!harness.connection.is_data_available());

	harness.bus.clear_fault(&harness.scope.status());

	harness
		.connection
		.wait_for_connection_state(ConnectionState::Connected, Some(Duration::from_secs(10)))
		.await
		.expect("connected once the middleware recovers");

	harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn shutdown_interrupts_retrying_sync() {
	let harness = Harness::new("home/garage/door");
	harness.activate_alone().await;

	let pending = harness.connection.request_data();
	sleep(Duration::from_secs(2)).await;
	assert!(harness.calls("ping") >= 1);
	assert!(!pending.is_done());

	harness.connection.shutdown().await;

	assert!(matches!(pending.await, Err(Error::ShutdownInProgress)));

	let calls = harness.calls("ping") + harness.calls(REQUEST_STATUS_METHOD);
	sleep(Duration::from_secs(30)).await;
	assert_eq!(
		harness.calls("ping") + harness.calls(REQUEST_STATUS_METHOD),
		calls
	);

	assert_eq!(
		harness.connection.get_connection_state(),
		ConnectionState::Disconnected
	);
	assert!(matches!(
		harness.connection.activate(false).await,
		Err(Error::ShutdownInProgress)
	));
	assert!(matches!(
		harness.connection.reinit().await,
		Err(Error::ShutdownInProgress)
	));
	assert!(matches!(
		harness.connection.request_data().await,
		Err(Error::ShutdownInProgress)
	));
	assert!(matches!(
		harness.connection.ping().await,
		Err(Error::ShutdownInProgress)
	));

	// Events published after shutdown are ignored
	harness.publish(&kitchen_light(), 100, 0);
	sleep(Duration::from_millis(100)).await;
	assert!(!harness.connection.is_data_available());

	harness.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn data_requests_need_an_active_connection() {
	let harness = Harness::new("home/kitchen/light");
	let _controller = harness.serve(kitchen_light());

	assert!(matches!(
		harness.connection.request_data().await,
		Err(Error::InvalidState(_))
	));
	assert!(matches!(
		harness.connection.activate(false).await,
		Err(Error::InvalidState(_))
	));

	harness.connect().await;
	harness.connection.deactivate().await.expect("deactivate");

	assert!(!harness.connection.is_active());
	assert!(matches!(
		harness.connection.request_data().await,
		Err(Error::InvalidState(_))
	));
	// Data survives deactivation
	assert!(harness.connection.is_data_available());

	harness.connection.activate(true).await.expect("reactivation");
	assert!(harness.connection.is_connected());

	harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn failed_status_requests_are_retried() {
	let failures = [
		Err(RpcError::Transport("broker hiccup".to_string())),
		Err(RpcError::Remote("controller busy".to_string())),
		// Not valid MessagePack
		Ok(vec![0xc1]),
	];

	for failure in failures {
		let harness = Harness::new("home/kitchen/light");
		let controller = harness.serve(kitchen_light());
		harness.bus.serve(
			harness.scope.ctrl(),
			Arc::new(FlakyStatus {
				controller: Arc::clone(&controller),
				failure,
				failures_left: AtomicUsize::new(2),
			}),
		);

		harness.connect().await;

		assert!(harness.connection.is_connected());
		assert_eq!(*harness.connection.get_data().expect("data"), controller.record());
		assert_eq!(harness.calls(REQUEST_STATUS_METHOD), 3);

		harness.shutdown().await;
	}

	assert!(logs_contain("Sync attempt failed"));
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn invalid_transport_keeps_data_request_pending() {
	let harness = Harness::new("home/kitchen/light");
	let controller = harness.serve(kitchen_light());
	harness
		.bus
		.inject_fault(harness.scope.ctrl(), Fault::Invalidated);
	harness.activate_alone().await;

	let pending = harness.connection.request_data();
	sleep(Duration::from_secs(3)).await;

	assert!(!pending.is_done());
	assert!(harness.bus.built(&harness.scope.ctrl()) >= 2);

	harness.bus.clear_fault(&harness.scope.ctrl());

	let data = pending
		.wait_timeout(Duration::from_secs(60))
		.await
		.expect("sync succeeds once the transport is valid again");
	assert_eq!(*data, controller.record());
	assert!(harness.connection.is_connected());

	harness.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn prioritized_observers_run_first() {
	let harness = Harness::new("home/kitchen/light");
	let controller = harness.serve(kitchen_light());
	harness.connect().await;

	let updates: ObservedUpdates = Arc::new(MonitoredMutex::new("observed updates", Vec::new()));
	harness
		.connection
		.add_data_observer(recording_observer(&updates, &harness.connection, "general"));
	harness
		.connection
		.add_prioritized_data_observer(recording_observer(&updates, &harness.connection, "first"));
	let second = harness
		.connection
		.add_prioritized_data_observer(recording_observer(&updates, &harness.connection, "second"));

	for brightness in [10, 20] {
		controller
			.update(|light| light.brightness = brightness)
			.expect("update");
		harness.wait_for(|light| light.brightness == brightness).await;
	}

	assert!(harness.connection.remove_data_observer(second));
	controller
		.update(|light| light.brightness = 30)
		.expect("update");

	timeout(Duration::from_secs(5), async {
		while updates.lock().len() < 8 {
			sleep(Duration::from_millis(10)).await;
		}
	})
	.await
	.expect("every observer notified");

	// Prioritized observers see each update before the transaction id moves, in registration
	// order, and always before the general ones
	assert_eq!(
		*updates.lock(),
		[
			("first", 1, 0),
			("second", 1, 0),
			("general", 1, 1),
			("first", 2, 1),
			("second", 2, 1),
			("general", 2, 2),
			("first", 3, 2),
			("general", 3, 3),
		]
	);

	harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn ping_timeout_resynchronizes() {
	let harness = Harness::new("home/kitchen/light");
	let controller = harness.serve(kitchen_light());
	harness.connect().await;
	let changes = state_changes(&harness.connection);

	controller.set_response_delay(Duration::from_secs(2));
	let syncs = harness.calls(REQUEST_STATUS_METHOD);

	let res = harness.connection.ping().await;
	assert!(matches!(res, Err(Error::Timeout(_))), "got {res:?}");
	assert_eq!(
		harness.connection.get_connection_state(),
		ConnectionState::Connecting
	);
	assert!(harness.connection.is_sync_running());
	assert!(harness.connection.is_data_available());

	controller.set_response_delay(Duration::ZERO);

	harness
		.connection
		.wait_for_connection_state(ConnectionState::Connected, Some(Duration::from_secs(30)))
		.await
		.expect("connected again");
	assert!(harness.calls(REQUEST_STATUS_METHOD) > syncs);
	assert_eq!(changes.lock().first(), Some(&DEGRADED));

	harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn late_ping_timeout_leaves_reconnecting_alone() {
	let harness = Harness::new("home/kitchen/light");
	let controller = harness.serve(kitchen_light());
	harness.connect().await;
	let changes = state_changes(&harness.connection);

	controller.set_response_delay(Duration::from_secs(2));
	harness.bus.set_factory_delay(Duration::from_secs(3));

	let (state_after_ping, reinit) = tokio::join!(
		async {
			let res = harness.connection.ping().await;
			assert!(matches!(res, Err(Error::Timeout(_))), "got {res:?}");
			let state = harness.connection.get_connection_state();
			controller.set_response_delay(Duration::ZERO);
			state
		},
		async {
			sleep(Duration::from_millis(100)).await;
			harness.connection.reinit().await
		},
	);

	assert_eq!(state_after_ping, ConnectionState::Reconnecting);
	reinit.expect("reinit succeeds");

	harness
		.connection
		.wait_for_connection_state(ConnectionState::Connected, Some(Duration::from_secs(30)))
		.await
		.expect("reconnected");
	assert!(!changes.lock().contains(&DEGRADED));

	harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn middleware_failure_degrades_connection() {
	let harness = Harness::new("home/cellar/pump");
	let _controller = harness.serve(kitchen_light());
	harness.connect().await;
	let changes = state_changes(&harness.connection);

	harness
		.bus
		.inject_fault(harness.scope.status(), Fault::Unavailable);
	assert_eq!(harness.bus.disconnect(&harness.scope.status()), 1);

	// Noticed on the next healthy check of the subscriber watchdog
	sleep(RemoteConfig::default().watchdog.healthy_delay() + Duration::from_secs(5)).await;

	assert_eq!(
		harness.connection.get_connection_state(),
		ConnectionState::Connecting
	);
	assert!(changes.lock().contains(&DEGRADED));

	harness.bus.clear_fault(&harness.scope.status());

	harness
		.connection
		.wait_for_connection_state(ConnectionState::Connected, Some(Duration::from_secs(10)))
		.await
		.expect("connected once the subscriber is back");
	assert_eq!(harness.bus.subscribers(&harness.scope.status()), 1);

	harness.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn post_init_hook_runs_after_every_init() {
	let harness = Harness::new("home/kitchen/light");
	let _controller = harness.serve(kitchen_light());

	let hall = Scope::parse("home/hall/light").expect("valid scope");
	let hall_controller = StatusController::serve(
		&harness.bus,
		hall.clone(),
		Light {
			id: "hall-light".to_string(),
			..kitchen_light()
		},
	);

	let scopes = Arc::new(MonitoredMutex::new("scopes", Vec::new()));
	harness.connection.set_post_init_hook({
		let scopes = Arc::clone(&scopes);
		move |scope: &Scope| scopes.lock().push(scope.clone())
	});

	harness.connect().await;
	assert_eq!(*scopes.lock(), [harness.scope.clone()]);

	harness
		.connection
		.reinit_with_scope(hall.clone())
		.await
		.expect("reinit succeeds");
	assert_eq!(*scopes.lock(), [harness.scope.clone(), hall.clone()]);
	assert_eq!(harness.connection.scope().expect("scope"), hall);

	harness
		.connection
		.wait_for_connection_state(ConnectionState::Connected, Some(Duration::from_secs(5)))
		.await
		.expect("connected to the new scope");
	harness
		.wait_for(|light| *light == hall_controller.record())
		.await;

	harness.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn configured_from_a_record() {
	let harness = Harness::new("home/kitchen/light");
	let controller = harness.serve(kitchen_light());

	let missing = DynamicRecord::new().with("label", "no scope here");
	assert!(matches!(
		harness.connection.configure(&missing).await,
		Err(Error::Field(_))
	));

	let mistyped = DynamicRecord::new().with("scope", 3_u64);
	assert!(matches!(
		harness.connection.init_with_config(&mistyped).await,
		Err(Error::Field(_))
	));
	assert!(!harness.connection.is_initialized());

	let config = DynamicRecord::new().with("scope", "home/kitchen/light");
	harness
		.connection
		.configure(&config)
		.await
		.expect("configured");

	assert!(harness.connection.is_initialized());
	assert_eq!(harness.connection.scope().expect("scope"), harness.scope);

	harness
		.connection
		.activate(true)
		.await
		.expect("activation succeeds");
	assert_eq!(*harness.connection.get_data().expect("data"), controller.record());

	harness.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn transaction_id_regressions_are_reported() {
	let harness = Harness::new("home/attic/fan");
	harness.activate_alone().await;

	let fan = |brightness, transaction_id| Light {
		id: "fan".to_string(),
		brightness,
		transaction_id,
		..Light::default()
	};

	harness.publish(&fan(1, 5), 10, 0);
	harness.wait_for(|light| light.brightness == 1).await;
	assert_eq!(harness.connection.get_transaction_id(), 5);

	// A controller restarting from scratch counts from zero again
	harness.publish(&fan(2, 0), 11, 0);
	harness.wait_for(|light| light.brightness == 2).await;
	assert_eq!(harness.connection.get_transaction_id(), 0);

	harness.publish(&fan(3, 4), 12, 0);
	harness.wait_for(|light| light.brightness == 3).await;
	assert_eq!(harness.connection.get_transaction_id(), 4);
	assert!(!logs_contain("Transaction id went backwards"));

	harness.publish(&fan(4, 2), 13, 0);
	harness.wait_for(|light| light.brightness == 4).await;
	assert_eq!(harness.connection.get_transaction_id(), 2);
	assert!(logs_contain("Transaction id went backwards"));

	harness.shutdown().await;
}
