//! Contract of the publish/subscribe and RPC middleware a remote connection runs on.
//!
//! The connection engine only knows these traits, [`memory`] provides an in process
//! implementation used by tests and by components living in the same process as their
//! controller.

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use super::{scope::Scope, Error};

pub mod memory;

/// Header carrying the logical time an event was created at
pub const CREATE_TIME_HEADER: &str = "create_time";
/// Header carrying a finer grained time, ordering events with the same creation time
pub const USER_TIME_HEADER: &str = "user_time";

/// Method answering with the controller's current full record
pub const REQUEST_STATUS_METHOD: &str = "requestStatus";
/// Method echoing its argument, used to measure latency
pub const PING_METHOD: &str = "ping";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
	#[error("service <{scope}> failed to activate: {reason}")]
	Activation { scope: Scope, reason: String },
	#[error("service <{scope}> failed to deactivate: {reason}")]
	Deactivation { scope: Scope, reason: String },
	#[error("service <{0}> is not active")]
	Inactive(Scope),
	#[error("transport of <{scope}> is no longer valid: {reason}")]
	Invalid { scope: Scope, reason: String },
	#[error("transport failure on <{scope}>: {reason}")]
	Other { scope: Scope, reason: String },
}

/// Failures of a single method call as reported by the RPC client
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
	#[error("no reply in time")]
	Timeout,
	/// The callee raised an error while executing the method
	#[error("remote error: {0}")]
	Remote(String),
	/// The underlying transport went away, the client must be rebuilt
	#[error("invalid transport: {0}")]
	InvalidTransport(String),
	#[error("client is not active")]
	Inactive,
	#[error("transport error: {0}")]
	Transport(String),
}

impl RpcError {
	/// Lifts the error into the connection error taxonomy, keeping remote application errors
	/// apart from transport failures
	#[must_use]
	pub fn into_error(self, method: &str, scope: &Scope) -> Error {
		match self {
			Self::Timeout => Error::Timeout(format!("method <{method}> on <{scope}>")),
			Self::Remote(message) => Error::Remote {
				method: method.to_string(),
				message,
			},
			Self::InvalidTransport(reason) => Error::Transport(TransportError::Invalid {
				scope: scope.clone(),
				reason,
			}),
			Self::Inactive => Error::Transport(TransportError::Inactive(scope.clone())),
			Self::Transport(reason) => Error::Transport(TransportError::Other {
				scope: scope.clone(),
				reason,
			}),
		}
	}
}

/// A message delivered to subscribers. An event without payload means the controller detached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Event {
	pub payload: Option<Vec<u8>>,
	pub headers: HashMap<String, u64>,
}

impl Event {
	#[must_use]
	pub fn new(payload: Vec<u8>) -> Self {
		Self {
			payload: Some(payload),
			headers: HashMap::new(),
		}
	}

	/// The event a controller sends when it goes away
	#[must_use]
	pub fn detached() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn with_header(mut self, key: impl Into<String>, value: u64) -> Self {
		self.headers.insert(key.into(), value);
		self
	}

	#[must_use]
	pub fn with_times(self, create_time: u64, user_time: u64) -> Self {
		self.with_header(CREATE_TIME_HEADER, create_time)
			.with_header(USER_TIME_HEADER, user_time)
	}

	#[must_use]
	pub fn create_time(&self) -> Option<u64> {
		self.headers.get(CREATE_TIME_HEADER).copied()
	}

	#[must_use]
	pub fn user_time(&self) -> Option<u64> {
		self.headers.get(USER_TIME_HEADER).copied()
	}

	/// Ordering key of the event, `None` if the creation time is missing
	#[must_use]
	pub fn ordering(&self) -> Option<(u64, u64)> {
		self.create_time()
			.map(|create_time| (create_time, self.user_time().unwrap_or(0)))
	}
}

pub type DataHandler = Arc<dyn Fn(Event) + Send + Sync>;

/// Something on the middleware that must be activated before use
#[async_trait]
pub trait Service: Send + Sync + 'static {
	fn scope(&self) -> &Scope;

	async fn activate(&self) -> Result<(), TransportError>;

	async fn deactivate(&self) -> Result<(), TransportError>;

	fn is_active(&self) -> bool;
}

pub trait Subscriber: Service {
	/// Replaces the handler receiving every event published on this subscriber's scope
	fn register_data_handler(&self, handler: DataHandler);
}

#[async_trait]
pub trait RpcClient: Service {
	/// Calls `method` with an already encoded argument, returning the encoded reply.
	///
	/// Calls don't time out by themselves, callers bound them.
	async fn call_method(&self, method: &str, arg: Vec<u8>) -> Result<Vec<u8>, RpcError>;
}

/// Builds the middleware endpoints of a connection
#[async_trait]
pub trait TransportFactory: Send + Sync + 'static {
	async fn subscriber(&self, scope: &Scope) -> Result<Arc<dyn Subscriber>, TransportError>;

	async fn rpc_client(&self, scope: &Scope) -> Result<Arc<dyn RpcClient>, TransportError>;
}

impl fmt::Debug for dyn Subscriber {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Subscriber")
			.field("scope", self.scope())
			.field("is_active", &self.is_active())
			.finish()
	}
}

impl fmt::Debug for dyn RpcClient {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("RpcClient")
			.field("scope", self.scope())
			.field("is_active", &self.is_active())
			.finish()
	}
}

pub fn encode<T: Serialize + ?Sized>(what: &'static str, value: &T) -> Result<Vec<u8>, Error> {
	rmp_serde::to_vec_named(value).map_err(|e| Error::Encode {
		what,
		source: Arc::new(e),
	})
}

pub fn decode<T: DeserializeOwned>(what: &'static str, bytes: &[u8]) -> Result<T, Error> {
	rmp_serde::from_slice(bytes).map_err(|e| Error::Decode {
		what,
		source: Arc::new(e),
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn event_ordering_defaults_user_time() {
		assert_eq!(Event::new(vec![]).ordering(), None);
		assert_eq!(
			Event::new(vec![])
				.with_header(CREATE_TIME_HEADER, 5)
				.ordering(),
			Some((5, 0))
		);
		assert_eq!(Event::new(vec![]).with_times(5, 3).ordering(), Some((5, 3)));
		assert!(Event::detached().payload.is_none());
	}

	#[test]
	fn remote_errors_stay_distinct() {
		let scope = Scope::parse("home/kitchen/ctrl").expect("valid scope");

		assert!(matches!(
			RpcError::Remote("boom".to_string()).into_error("foo", &scope),
			Error::Remote { method, message } if method == "foo" && message == "boom"
		));
		assert!(RpcError::Timeout.into_error("foo", &scope).is_timeout());
		assert!(matches!(
			RpcError::InvalidTransport("gone".to_string()).into_error("foo", &scope),
			Error::Transport(TransportError::Invalid { .. })
		));
	}
}
