use std::{fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::{with_limit, Inner, RemoteConnection, RemoteData};
use crate::{observer::ObserverId, Error};

/// Where a connection stands with respect to its controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
	/// Not active, or not initialized yet
	Disconnected,
	/// Active and waiting for fresh data
	Connecting,
	/// Holding data that is kept up to date
	Connected,
	/// Rebuilding the transports of an active connection
	Reconnecting,
	/// Rebuilding the transports of an inactive connection
	Reinitializing,
}

impl fmt::Display for ConnectionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			Self::Disconnected => "disconnected",
			Self::Connecting => "connecting",
			Self::Connected => "connected",
			Self::Reconnecting => "reconnecting",
			Self::Reinitializing => "reinitializing",
		};

		f.write_str(name)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStateChange {
	pub previous: ConnectionState,
	pub current: ConnectionState,
}

impl<M: RemoteData> Inner<M> {
	pub(super) fn connection_state(&self) -> ConnectionState {
		*self.state.borrow()
	}

	/// Returns whether the state actually changed
	pub(super) fn set_connection_state(self: &Arc<Self>, new: ConnectionState) -> bool {
		self.change_state(|_| true, new)
	}

	/// Moves to `new` only if the current state is `expected`
	pub(super) fn transition(
		self: &Arc<Self>,
		expected: ConnectionState,
		new: ConnectionState,
	) -> bool {
		self.change_state(|current| current == expected, new)
	}

	fn change_state(
		self: &Arc<Self>,
		precondition: impl FnOnce(ConnectionState) -> bool,
		new: ConnectionState,
	) -> bool {
		let mut previous = new;

		let changed = self.state.send_if_modified(|state| {
			previous = *state;

			if *state == new || !precondition(*state) {
				return false;
			}

			// Only checked under the channel's lock, so shutdown's final `Disconnected` always
			// wins over a concurrent change
			if self.is_shutdown() && new != ConnectionState::Disconnected {
				return false;
			}

			// Once reconnecting, only the end of the reinit decides where we go
			if *state == ConnectionState::Reconnecting && new == ConnectionState::Connected {
				return false;
			}

			*state = new;
			true
		});

		if !changed {
			if previous != new {
				trace!(%previous, requested = %new, "Connection state change suppressed");
			}
			return false;
		}

		debug!(connection = %self.id, %previous, current = %new, "Connection state changed");

		self.state_observers.notify(&ConnectionStateChange {
			previous,
			current: new,
		});

		if previous == ConnectionState::Connected
			&& new == ConnectionState::Connecting
			&& self.is_active()
			&& !self.is_shutdown()
		{
			drop(self.request_data());
		}

		true
	}

	pub(super) async fn wait_for_connection_state(
		&self,
		target: ConnectionState,
		limit: Option<Duration>,
	) -> Result<ConnectionState, Error> {
		self.wait_for_state_where(|state| state == target, limit)
			.await
			.map_err(|e| match e {
				Error::Timeout(_) => Error::Timeout(format!("waiting for connection state {target}")),
				e => e,
			})
	}

	/// Waits until an ongoing reinit of the transports is over, whatever its outcome
	pub(super) async fn wait_while_reconnecting(
		&self,
		limit: Option<Duration>,
	) -> Result<ConnectionState, Error> {
		self.wait_for_state_where(|state| state != ConnectionState::Reconnecting, limit)
			.await
	}

	async fn wait_for_state_where(
		&self,
		mut accept: impl FnMut(ConnectionState) -> bool + Send,
		limit: Option<Duration>,
	) -> Result<ConnectionState, Error> {
		let mut rx = self.state.subscribe();

		let wait = async {
			tokio::select! {
				biased;
				res = async { rx.wait_for(|state| accept(*state)).await.map(|state| *state) } => {
					res.map_err(|_| Error::Interrupted("connection was dropped".to_string()))
				}
				() = self.shutdown.cancelled() => Err(Error::ShutdownInProgress),
			}
		};

		with_limit(limit, wait, || "waiting for a connection state".to_string()).await
	}
}

impl<M: RemoteData> RemoteConnection<M> {
	#[must_use]
	pub fn get_connection_state(&self) -> ConnectionState {
		self.inner.connection_state()
	}

	#[must_use]
	pub fn is_connected(&self) -> bool {
		self.get_connection_state() == ConnectionState::Connected
	}

	/// A receiver following every committed state change
	#[must_use]
	pub fn subscribe_connection_state(&self) -> tokio::sync::watch::Receiver<ConnectionState> {
		self.inner.state.subscribe()
	}

	/// Resolves right away if the connection already is in `target`
	pub async fn wait_for_connection_state(
		&self,
		target: ConnectionState,
		limit: Option<Duration>,
	) -> Result<(), Error> {
		self.inner
			.wait_for_connection_state(target, limit)
			.await
			.map(|_| ())
	}

	/// Waits until both the subscriber and the RPC client are running
	pub async fn wait_for_middleware(&self, limit: Option<Duration>) -> Result<(), Error> {
		self.inner.wait_for_middleware(limit).await
	}

	/// Observers run synchronously after each committed change, on the thread that made it
	pub fn add_connection_state_observer(
		&self,
		observer: impl Fn(&ConnectionStateChange) + Send + Sync + 'static,
	) -> ObserverId {
		self.inner.state_observers.add(observer)
	}

	pub fn remove_connection_state_observer(&self, id: ObserverId) -> bool {
		self.inner.state_observers.remove(id)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn states_display_lowercase() {
		assert_eq!(ConnectionState::Connected.to_string(), "connected");
		assert_eq!(ConnectionState::Reinitializing.to_string(), "reinitializing");
	}

	#[test]
	fn states_serialize_by_name() {
		let json = serde_json::to_string(&ConnectionState::Reconnecting).expect("serializable");
		assert_eq!(json, "\"Reconnecting\"");
		assert_eq!(
			serde_json::from_str::<ConnectionState>(&json).expect("deserializable"),
			ConnectionState::Reconnecting
		);
	}
}
