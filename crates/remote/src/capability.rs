//! Narrow views over a remote connection, so components can depend on just what they use.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use sd_utils::{Identifiable, Record};
use uuid::Uuid;

use super::{
	connection::{RemoteConnection, RemoteData, SyncFuture},
	observer::ObserverId,
	scope::Scope,
	Error,
};

pub trait ScopeAddressable {
	fn scope(&self) -> Result<Scope, Error>;
}

/// Something holding a replica of remote data
pub trait DataSynchronized {
	type Data: Send + Sync + 'static;

	fn get_data(&self) -> Result<Arc<Self::Data>, Error>;

	fn is_data_available(&self) -> bool;

	fn request_data(&self) -> SyncFuture<Self::Data>;

	fn get_transaction_id(&self) -> u64;

	fn add_data_observer(
		&self,
		observer: Box<dyn Fn(&Arc<Self::Data>) + Send + Sync>,
	) -> ObserverId;

	fn remove_data_observer(&self, id: ObserverId) -> bool;
}

#[async_trait]
pub trait RpcCapable {
	async fn call_raw(
		&self,
		method: &str,
		arg: Vec<u8>,
		limit: Option<Duration>,
	) -> Result<Vec<u8>, Error>;

	async fn ping(&self) -> Result<Duration, Error>;
}

/// Things that are set up from a configuration record
#[async_trait]
pub trait Configurable {
	async fn configure(&self, config: &(dyn Record + Sync)) -> Result<(), Error>;
}

impl<M: RemoteData> ScopeAddressable for RemoteConnection<M> {
	fn scope(&self) -> Result<Scope, Error> {
		Self::scope(self)
	}
}

impl<M: RemoteData> DataSynchronized for RemoteConnection<M> {
	type Data = M;

	fn get_data(&self) -> Result<Arc<M>, Error> {
		Self::get_data(self)
	}

	fn is_data_available(&self) -> bool {
		Self::is_data_available(self)
	}

	fn request_data(&self) -> SyncFuture<M> {
		Self::request_data(self)
	}

	fn get_transaction_id(&self) -> u64 {
		Self::get_transaction_id(self)
	}

	fn add_data_observer(&self, observer: Box<dyn Fn(&Arc<M>) + Send + Sync>) -> ObserverId {
		Self::add_data_observer(self, observer)
	}

	fn remove_data_observer(&self, id: ObserverId) -> bool {
		Self::remove_data_observer(self, id)
	}
}

#[async_trait]
impl<M: RemoteData> RpcCapable for RemoteConnection<M> {
	async fn call_raw(
		&self,
		method: &str,
		arg: Vec<u8>,
		limit: Option<Duration>,
	) -> Result<Vec<u8>, Error> {
		self.call_method_raw(method, arg, limit).await
	}

	async fn ping(&self) -> Result<Duration, Error> {
		Self::ping(self).await
	}
}

#[async_trait]
impl<M: RemoteData> Configurable for RemoteConnection<M> {
	async fn configure(&self, config: &(dyn Record + Sync)) -> Result<(), Error> {
		self.init_with_config(config).await
	}
}

impl<M: RemoteData> Identifiable for RemoteConnection<M> {
	type Id = Uuid;

	fn id(&self) -> Self::Id {
		self.connection_id()
	}
}
