use std::{
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc,
	},
	time::Duration,
};

use sd_task_system::{
	all_of, post_process, CancelTaskOnDrop, TaskError, TaskSystem, TaskSystemConfig,
};

use tokio::{sync::oneshot, time::sleep};
use tracing_test::traced_test;

fn system_with_workers(workers_count: usize) -> TaskSystem {
	TaskSystem::with_config(TaskSystemConfig {
		workers_count,
		overload_threshold: 2,
	})
}

#[tokio::test]
#[traced_test]
async fn done_test() {
	let system = TaskSystem::new();

	let handles = (0..8)
		.map(|i| system.dispatch(async move { i * 2 }))
		.collect::<Vec<_>>();

	assert_eq!(
		all_of(handles).await,
		Ok((0..8).map(|i| i * 2).collect::<Vec<_>>())
	);

	system.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn cancel_test() {
	let system = TaskSystem::new();

	let handle = system.dispatch(async {
		sleep(Duration::from_secs(3600)).await;
	});
	let id = handle.task_id();

	handle.cancel();

	assert_eq!(handle.await, Err(TaskError::Canceled(id)));

	system.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn remote_cancel_test() {
	let system = TaskSystem::new();

	let handle = system.schedule(async {
		sleep(Duration::from_secs(3600)).await;
	});
	let controller = handle.remote_controller();

	controller.cancel();

	assert!(matches!(handle.await, Err(TaskError::Canceled(_))));
	assert!(controller.is_done());

	system.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn cancel_on_drop_test() {
	let system = TaskSystem::new();
	let (tx, rx) = oneshot::channel::<()>();

	let guarded = CancelTaskOnDrop::new(system.dispatch(async move {
		// Holding the sender, dropping it signals the task was aborted
		let _tx = tx;
		sleep(Duration::from_secs(3600)).await;
	}));

	drop(guarded);

	assert!(rx.await.is_err());

	system.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn shutdown_test() {
	let system = TaskSystem::new();

	let pending = (0..4)
		.map(|_| {
			system.dispatch(async {
				sleep(Duration::from_secs(3600)).await;
			})
		})
		.collect::<Vec<_>>();

	let scheduled = system.schedule_after(Duration::from_secs(3600), async {});

	system.shutdown().await;

	assert!(system.is_shutdown());

	for handle in pending {
		assert_eq!(handle.await, Err(TaskError::Shutdown));
	}
	assert_eq!(scheduled.await, Err(TaskError::Shutdown));

	assert_eq!(system.dispatch(async {}).await, Err(TaskError::Shutdown));
	assert_eq!(system.schedule(async {}).await, Err(TaskError::Shutdown));
}

#[tokio::test]
#[traced_test]
async fn panic_test() {
	let system = TaskSystem::new();

	let handle = system.dispatch(async {
		panic!("on purpose");
	});
	let id = handle.task_id();

	assert_eq!(
		handle.await,
		Err(TaskError::Panicked(id, "on purpose".to_string()))
	);

	// A panicking task must not take a worker down with it
	assert_eq!(system.dispatch(async { 1 }).await, Ok(1));

	system.shutdown().await;
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn bounded_workers_test() {
	let system = system_with_workers(2);
	let concurrent = Arc::new(AtomicUsize::new(0));
	let peak = Arc::new(AtomicUsize::new(0));

	let handles = (0..6)
		.map(|_| {
			let concurrent = Arc::clone(&concurrent);
			let peak = Arc::clone(&peak);
			system.dispatch(async move {
				let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
				peak.fetch_max(now, Ordering::SeqCst);
				sleep(Duration::from_millis(100)).await;
				concurrent.fetch_sub(1, Ordering::SeqCst);
			})
		})
		.collect::<Vec<_>>();

	sleep(Duration::from_millis(1)).await;

	let load = system.load();
	assert_eq!(load.workers_count, 2);
	assert_eq!(load.running, 2);
	assert_eq!(load.queued, 4);
	assert!(system.is_overloaded());

	all_of(handles).await.expect("no task should fail");

	assert_eq!(peak.load(Ordering::SeqCst), 2);

	let load = system.load();
	assert_eq!(load.running, 0);
	assert_eq!(load.queued, 0);

	system.shutdown().await;
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn scheduled_tasks_skip_busy_workers_test() {
	let system = system_with_workers(1);

	let blocker = system.dispatch(async {
		sleep(Duration::from_secs(3600)).await;
	});

	sleep(Duration::from_millis(1)).await;

	assert_eq!(
		system
			.schedule_after(Duration::from_millis(10), async { "ticked" })
			.await,
		Ok("ticked")
	);

	blocker.cancel();
	system.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn post_process_test() {
	let system = TaskSystem::new();
	let verified = Arc::new(AtomicUsize::new(0));

	let res = post_process(system.dispatch(async { 10 }), |out| {
		let out = *out;
		let verified = Arc::clone(&verified);
		async move {
			verified.store(out, Ordering::SeqCst);
			Ok(())
		}
	})
	.await;

	assert_eq!(res, Ok(10));
	assert_eq!(verified.load(Ordering::SeqCst), 10);

	system.shutdown().await;
}
