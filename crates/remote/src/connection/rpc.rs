use std::{
	sync::{atomic::Ordering, Arc},
	time::{Duration, SystemTime, UNIX_EPOCH},
};

use sd_task_system::{post_process, CompletableTask, Completion, TaskHandle, TaskRemoteController};
use sd_utils::{error::report_error, Record};
use serde::{de::DeserializeOwned, Serialize};
use tokio::time::{timeout, Instant};
use tracing::{debug, trace, warn, Instrument};

use super::{
	state::ConnectionState, sync::transaction_id_of, with_limit, Inner, RemoteConnection,
	RemoteData,
};
use crate::{
	retry::{Attempt, RetryTimeout, TimeoutSplitter},
	transport::{decode, encode, RpcClient, RpcError, PING_METHOD},
	Error,
};

#[derive(Debug, Default)]
pub(super) struct PingState {
	in_flight: Option<(CompletableTask<Duration, Error>, TaskRemoteController)>,
	latency: Option<Duration>,
	last_received: Option<SystemTime>,
}

impl<M: RemoteData> Inner<M> {
	fn rpc_client(&self) -> Result<Arc<dyn RpcClient>, Error> {
		self.transports
			.lock()
			.as_ref()
			.map(|transports| Arc::clone(transports.rpc.service()))
			.ok_or_else(|| Error::InvalidState("connection is not initialized".to_string()))
	}

	/// A single call bounded by `limit`, an invalid transport schedules a reinit
	pub(super) async fn call_raw(
		self: &Arc<Self>,
		method: &str,
		arg: Vec<u8>,
		limit: Duration,
	) -> Attempt<Vec<u8>> {
		let rpc = match self.rpc_client() {
			Ok(rpc) => rpc,
			Err(e) => return Attempt::Failed(e),
		};

		match timeout(limit, rpc.call_method(method, arg)).await {
			Ok(Ok(reply)) => Attempt::Ok(reply),
			Err(_) | Ok(Err(RpcError::Timeout)) => Attempt::Timeout,
			Ok(Err(e)) => {
				if matches!(e, RpcError::InvalidTransport(_)) {
					self.request_reinit();
				}

				Attempt::Failed(
					e.into_error(method, rpc.scope())
						.after_shutdown(self.is_shutdown()),
				)
			}
		}
	}

	/// Retries `method` with growing timeouts until it gets a reply, fails or `limit` runs out
	async fn call_with_retries(
		self: &Arc<Self>,
		method: &str,
		arg: Vec<u8>,
		limit: Option<Duration>,
		probe_on_timeout: bool,
	) -> Result<Vec<u8>, Error> {
		if self.is_shutdown() {
			return Err(Error::ShutdownInProgress);
		}

		let splitter = TimeoutSplitter::new(limit);
		let mut retry = RetryTimeout::new(&self.config);

		loop {
			let Some(attempt_limit) = splitter.split(retry.next_timeout()) else {
				return Err(Error::Timeout(format!(
					"method <{method}> got no reply after {} attempts",
					retry.attempts().saturating_sub(1)
				)));
			};

			match self.call_raw(method, arg.clone(), attempt_limit).await {
				Attempt::Ok(reply) => return Ok(reply),
				Attempt::Failed(e) => return Err(e),
				Attempt::Timeout => {
					if self.is_shutdown() {
						return Err(Error::ShutdownInProgress);
					}

					debug!(
						method,
						attempt = retry.attempts(),
						?attempt_limit,
						"Method call timed out, retrying"
					);

					if probe_on_timeout {
						self.probe_before_retry(&splitter).await?;
					}
				}
			}
		}
	}

	/// Between retries of an asynchronous call, either wait for an ongoing reconnect or check
	/// the controller is still there
	async fn probe_before_retry(self: &Arc<Self>, splitter: &TimeoutSplitter) -> Result<(), Error> {
		if self.connection_state() == ConnectionState::Reconnecting {
			return match self.wait_while_reconnecting(splitter.remaining()).await {
				Err(e) if e.is_shutdown() => Err(e),
				_ => Ok(()),
			};
		}

		match with_limit(splitter.remaining(), self.ping(), || "ping".to_string()).await {
			Err(e) if e.is_shutdown() => Err(e),
			_ => Ok(()),
		}
	}

	/// Measures the round trip to the controller, concurrent callers share a single probe
	pub(super) async fn ping(self: &Arc<Self>) -> Result<Duration, Error> {
		if self.is_shutdown() {
			return Err(Error::ShutdownInProgress);
		}

		let task = {
			let mut ping = self.ping.lock();

			match &ping.in_flight {
				Some((task, _)) if !task.is_done() => task.clone(),
				_ => {
					let task = CompletableTask::new();
					let probe = self
						.tasks
						.dispatch(Arc::clone(self).probe(task.clone()).in_current_span());
					ping.in_flight = Some((task.clone(), probe.remote_controller()));
					task
				}
			}
		};

		match task.wait().await {
			Completion::Done(latency) => Ok(latency),
			Completion::Failed(e) => Err(e),
			Completion::Canceled => Err(Error::Interrupted("ping was canceled".to_string())
				.after_shutdown(self.is_shutdown())),
		}
	}

	async fn probe(self: Arc<Self>, task: CompletableTask<Duration, Error>) {
		match self.probe_once().await {
			Ok(latency) => task.complete(latency),
			Err(e) => task.fail(e.after_shutdown(self.is_shutdown())),
		};
	}

	async fn probe_once(self: &Arc<Self>) -> Result<Duration, Error> {
		let rpc = self.rpc_client()?;

		let sent_at = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map_or(0, |since| u64::try_from(since.as_millis()).unwrap_or(u64::MAX));
		let arg = encode("ping timestamp", &sent_at)?;
		let started = Instant::now();

		match timeout(self.config.ping_timeout(), rpc.call_method(PING_METHOD, arg)).await {
			Ok(Ok(reply)) => {
				let echoed = decode::<u64>("ping reply", &reply)?;
				if echoed != sent_at {
					warn!(sent_at, echoed, "Ping reply doesn't match its request");
				}

				let latency = started.elapsed();
				{
					let mut ping = self.ping.lock();
					ping.latency = Some(latency);
					ping.last_received = Some(SystemTime::now());
				}

				trace!(?latency, "Ping");

				Ok(latency)
			}

			Err(_) | Ok(Err(RpcError::Timeout)) => {
				if self.transition(ConnectionState::Connected, ConnectionState::Connecting) {
					warn!(scope = %rpc.scope(), "Ping timed out, reconnecting");
				}

				Err(Error::Timeout(format!("ping on <{}>", rpc.scope())))
			}

			Ok(Err(e)) => {
				if matches!(e, RpcError::InvalidTransport(_)) {
					self.request_reinit();
				}

				Err(e.into_error(PING_METHOD, rpc.scope()))
			}
		}
	}

	pub(super) fn cancel_ping(&self) {
		let in_flight = self.ping.lock().in_flight.take();

		if let Some((task, probe)) = in_flight {
			probe.cancel();
			task.cancel();
		}
	}

	/// Rebuilds the transports in the background, coalescing concurrent requests
	fn request_reinit(self: &Arc<Self>) {
		if self.is_shutdown() || self.reinit_requested.swap(true, Ordering::AcqRel) {
			return;
		}

		warn!(connection = %self.id, "Transport became invalid, reinitializing");

		let connection = RemoteConnection {
			inner: Arc::clone(self),
		};

		drop(self.tasks.schedule(
			async move {
				let res = connection.reinit().await;
				connection
					.inner
					.reinit_requested
					.store(false, Ordering::Release);
				report_error("Background reinit failed", &res);
			}
			.in_current_span(),
		));
	}
}

impl<M: RemoteData> RemoteConnection<M> {
	/// Calls `method` on the controller, retrying with growing timeouts until `limit` runs out.
	///
	/// `None` retries for as long as it takes.
	pub async fn call_method<A, R>(
		&self,
		method: &str,
		arg: &A,
		limit: Option<Duration>,
	) -> Result<R, Error>
	where
		A: Serialize + ?Sized,
		R: DeserializeOwned,
	{
		let arg = encode("method argument", arg)?;
		let reply = self
			.inner
			.call_with_retries(method, arg, limit, false)
			.await?;

		decode("method reply", &reply)
	}

	/// Runs [`RemoteConnection::call_method`] on the task system. Between retries it pings the
	/// controller, or waits for an ongoing reconnect to finish.
	pub fn call_method_async<A, R>(
		&self,
		method: impl Into<String>,
		arg: &A,
		limit: Option<Duration>,
	) -> TaskHandle<Result<R, Error>>
	where
		A: Serialize + ?Sized,
		R: DeserializeOwned + Send + 'static,
	{
		let inner = Arc::clone(&self.inner);
		let method = method.into();
		let arg = encode("method argument", arg);

		self.inner.tasks.dispatch(
			async move {
				let reply = inner
					.call_with_retries(&method, arg?, limit, true)
					.await?;

				decode("method reply", &reply)
			}
			.in_current_span(),
		)
	}

	/// Same as [`RemoteConnection::call_method`], but only returns once the local replica caught
	/// up with the transaction id of the reply
	pub async fn call_method_synchronized<A, R>(
		&self,
		method: &str,
		arg: &A,
		limit: Option<Duration>,
	) -> Result<R, Error>
	where
		A: Serialize + ?Sized,
		R: Record + DeserializeOwned,
	{
		let splitter = TimeoutSplitter::new(limit);

		post_process(self.call_method::<A, R>(method, arg, limit), |reply| {
			let target = transaction_id_of(reply);
			let inner = Arc::clone(&self.inner);
			let remaining = splitter.remaining();

			async move {
				match target {
					Some(target) => inner.wait_for_transaction(target, remaining).await,
					None => Ok(()),
				}
			}
		})
		.await
	}

	/// Raw variant of [`RemoteConnection::call_method`], for already encoded arguments
	pub async fn call_method_raw(
		&self,
		method: &str,
		arg: Vec<u8>,
		limit: Option<Duration>,
	) -> Result<Vec<u8>, Error> {
		self.inner
			.call_with_retries(method, arg, limit, false)
			.await
	}

	pub async fn ping(&self) -> Result<Duration, Error> {
		self.inner.ping().await
	}

	/// Latency measured by the last successful ping
	#[must_use]
	pub fn get_ping(&self) -> Option<Duration> {
		self.inner.ping.lock().latency
	}

	#[must_use]
	pub fn last_ping_received(&self) -> Option<SystemTime> {
		self.inner.ping.lock().last_received
	}
}
