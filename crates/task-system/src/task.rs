use std::{
	any::Any,
	fmt,
	future::Future,
	pin::Pin,
	sync::Arc,
	task::{Context, Poll},
	time::Duration,
};

use tokio::{
	sync::watch,
	task::{AbortHandle, JoinError, JoinHandle},
	time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};
use uuid::Uuid;

use super::error::TaskError;

/// A unique identifier for a task using the [`uuid`](https://docs.rs/uuid) crate.
pub type TaskId = Uuid;

pin_project_lite::pin_project! {
	/// A handle returned when a task is dispatched to the task system, it can be used to cancel
	/// the task or to wait until it gets completed.
	///
	/// Dropping the handle detaches the task, use [`CancelTaskOnDrop`] to cancel it instead.
	#[must_use = "`TaskHandle` does nothing unless polled, dropping it detaches the task"]
	pub struct TaskHandle<T> {
		id: TaskId,
		#[pin]
		join: JoinHandle<Option<T>>,
		shutdown: CancellationToken,
	}
}

impl<T> fmt::Debug for TaskHandle<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TaskHandle")
			.field("id", &self.id)
			.field("is_done", &self.join.is_finished())
			.finish()
	}
}

impl<T> TaskHandle<T> {
	pub(crate) const fn new(
		id: TaskId,
		join: JoinHandle<Option<T>>,
		shutdown: CancellationToken,
	) -> Self {
		Self { id, join, shutdown }
	}

	/// Get the unique identifier of the task
	#[must_use]
	pub const fn task_id(&self) -> TaskId {
		self.id
	}

	/// Cancels the task at its next suspension point, awaiting the handle afterwards yields
	/// [`TaskError::Canceled`] unless the task managed to finish first
	pub fn cancel(&self) {
		trace!(task_id = %self.id, "Canceling task");
		self.join.abort();
	}

	/// Verify if the task was already completed, canceled or aborted
	#[must_use]
	pub fn is_done(&self) -> bool {
		self.join.is_finished()
	}

	/// Gets the [`TaskRemoteController`] object that can be used to cancel the task remotely
	#[must_use]
	pub fn remote_controller(&self) -> TaskRemoteController {
		TaskRemoteController {
			task_id: self.id,
			abort: self.join.abort_handle(),
		}
	}
}

impl<T> Future for TaskHandle<T> {
	type Output = Result<T, TaskError>;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let this = self.project();
		let id = *this.id;

		this.join.poll(cx).map(|res| match res {
			Ok(Some(out)) => Ok(out),
			Ok(None) => Err(TaskError::Shutdown),
			Err(e) if e.is_cancelled() && this.shutdown.is_cancelled() => Err(TaskError::Shutdown),
			Err(e) if e.is_cancelled() => Err(TaskError::Canceled(id)),
			Err(e) => Err(TaskError::Panicked(id, panic_message(e))),
		})
	}
}

fn panic_message(e: JoinError) -> String {
	let payload: Box<dyn Any + Send> = e.into_panic();

	payload
		.downcast_ref::<&str>()
		.map(ToString::to_string)
		.or_else(|| payload.downcast_ref::<String>().cloned())
		.unwrap_or_else(|| "<non string panic payload>".to_string())
}

/// A remote controller of a task that can be used to cancel it without owning its handle.
#[derive(Debug, Clone)]
pub struct TaskRemoteController {
	task_id: TaskId,
	abort: AbortHandle,
}

impl TaskRemoteController {
	#[must_use]
	pub const fn task_id(&self) -> TaskId {
		self.task_id
	}

	pub fn cancel(&self) {
		trace!(task_id = %self.task_id, "Canceling task through remote controller");
		self.abort.abort();
	}

	#[must_use]
	pub fn is_done(&self) -> bool {
		self.abort.is_finished()
	}
}

/// A helper struct when you just want to cancel a task if its `TaskHandle` gets dropped.
#[derive(Debug)]
pub struct CancelTaskOnDrop<T>(Option<TaskHandle<T>>);

impl<T> CancelTaskOnDrop<T> {
	/// Create a new `CancelTaskOnDrop` object with the given `TaskHandle`.
	pub const fn new(handle: TaskHandle<T>) -> Self {
		Self(Some(handle))
	}
}

impl<T> Future for CancelTaskOnDrop<T> {
	type Output = Result<T, TaskError>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		if let Some(handle) = self.0.as_mut() {
			match Pin::new(handle).poll(cx) {
				Poll::Ready(res) => {
					self.0 = None;
					Poll::Ready(res)
				}
				Poll::Pending => Poll::Pending,
			}
		} else {
			error!("tried to poll an already completed CancelTaskOnDrop future");
			Poll::Pending
		}
	}
}

impl<T> Drop for CancelTaskOnDrop<T> {
	fn drop(&mut self) {
		if let Some(handle) = self.0.take() {
			handle.cancel();
		}
	}
}

/// How a [`CompletableTask`] was settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion<T, E> {
	Done(T),
	Failed(E),
	Canceled,
}

/// A task that isn't driven by any future of its own, instead whoever holds a clone of it can
/// settle it exactly once, by completing, failing or canceling it. Every clone can wait for
/// the outcome, which is handed out to all of them.
pub struct CompletableTask<T, E> {
	id: TaskId,
	state: Arc<watch::Sender<Option<Completion<T, E>>>>,
}

impl<T, E> Clone for CompletableTask<T, E> {
	fn clone(&self) -> Self {
		Self {
			id: self.id,
			state: Arc::clone(&self.state),
		}
	}
}

impl<T, E> fmt::Debug for CompletableTask<T, E> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("CompletableTask")
			.field("id", &self.id)
			.field("is_done", &self.is_done())
			.finish()
	}
}

impl<T, E> Default for CompletableTask<T, E> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T, E> CompletableTask<T, E> {
	#[must_use]
	pub fn new() -> Self {
		Self {
			id: TaskId::new_v4(),
			state: Arc::new(watch::Sender::new(None)),
		}
	}

	#[must_use]
	pub const fn task_id(&self) -> TaskId {
		self.id
	}

	/// Returns `false` if the task was already settled, in which case nothing changes
	pub fn complete(&self, value: T) -> bool {
		self.settle(Completion::Done(value))
	}

	pub fn fail(&self, error: E) -> bool {
		self.settle(Completion::Failed(error))
	}

	pub fn cancel(&self) -> bool {
		self.settle(Completion::Canceled)
	}

	fn settle(&self, completion: Completion<T, E>) -> bool {
		self.state.send_if_modified(|state| {
			if state.is_some() {
				false
			} else {
				*state = Some(completion);
				true
			}
		})
	}

	#[must_use]
	pub fn is_done(&self) -> bool {
		self.state.borrow().is_some()
	}

	#[must_use]
	pub fn is_canceled(&self) -> bool {
		matches!(*self.state.borrow(), Some(Completion::Canceled))
	}

	/// `true` if both values are clones of the same task
	#[must_use]
	pub fn same_task(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.state, &other.state)
	}
}

impl<T: Clone, E: Clone> CompletableTask<T, E> {
	/// The outcome, if the task was already settled
	#[must_use]
	pub fn peek(&self) -> Option<Completion<T, E>> {
		self.state.borrow().clone()
	}

	pub async fn wait(&self) -> Completion<T, E> {
		let mut rx = self.state.subscribe();

		// We hold the sender ourselves, so the channel can't be closed while we wait
		let completion = rx
			.wait_for(Option::is_some)
			.await
			.map_or(Completion::Canceled, |state| {
				state.clone().unwrap_or(Completion::Canceled)
			});

		completion
	}

	/// Waits at most `duration`, `None` means the task is still pending
	pub async fn wait_timeout(&self, duration: Duration) -> Option<Completion<T, E>> {
		timeout(duration, self.wait()).await.ok()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn completable_settles_once() {
		let task = CompletableTask::<u32, String>::new();
		let waiter = task.clone();

		let waiting = tokio::spawn(async move { waiter.wait().await });

		assert!(task.complete(7));
		assert!(!task.fail("late".to_string()));
		assert!(!task.cancel());

		assert_eq!(waiting.await.expect("waiter panicked"), Completion::Done(7));
		assert_eq!(task.peek(), Some(Completion::Done(7)));
	}

	#[tokio::test(start_paused = true)]
	async fn completable_wait_timeout() {
		let task = CompletableTask::<(), ()>::new();

		assert_eq!(task.wait_timeout(Duration::from_millis(10)).await, None);

		task.cancel();

		assert!(task.is_canceled());
		assert_eq!(
			task.wait_timeout(Duration::from_millis(10)).await,
			Some(Completion::Canceled)
		);
	}
}
