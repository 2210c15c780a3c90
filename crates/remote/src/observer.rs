use std::{fmt, sync::Arc};

use sd_utils::MonitoredMutex;
use uuid::Uuid;

pub type ObserverId = Uuid;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A list of callbacks notified synchronously, in registration order.
///
/// Callbacks run outside of the internal lock, so they may add or remove observers themselves;
/// such changes take effect from the next notification on.
pub struct Observable<T> {
	observers: MonitoredMutex<Vec<(ObserverId, Callback<T>)>>,
}

impl<T> fmt::Debug for Observable<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Observable")
			.field("len", &self.len())
			.finish()
	}
}

impl<T> Default for Observable<T> {
	fn default() -> Self {
		Self::new("observers")
	}
}

impl<T> Observable<T> {
	#[must_use]
	pub const fn new(name: &'static str) -> Self {
		Self {
			observers: MonitoredMutex::new(name, Vec::new()),
		}
	}

	pub fn add(&self, observer: impl Fn(&T) + Send + Sync + 'static) -> ObserverId {
		let id = ObserverId::new_v4();
		self.observers.lock().push((id, Arc::new(observer)));
		id
	}

	/// Returns `false` if there was no observer with this id
	pub fn remove(&self, id: ObserverId) -> bool {
		let mut observers = self.observers.lock();
		let len = observers.len();
		observers.retain(|(observer_id, _)| *observer_id != id);
		observers.len() != len
	}

	pub fn notify(&self, value: &T) {
		let observers = self
			.observers
			.lock()
			.iter()
			.map(|(_, observer)| Arc::clone(observer))
			.collect::<Vec<_>>();

		for observer in observers {
			observer(value);
		}
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.observers.lock().len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.observers.lock().is_empty()
	}

	pub fn clear(&self) {
		self.observers.lock().clear();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn notifies_in_registration_order() {
		let calls = Arc::new(MonitoredMutex::new("calls", Vec::new()));
		let observable = Observable::<u32>::default();

		let first = observable.add({
			let calls = Arc::clone(&calls);
			move |v| calls.lock().push(("first", *v))
		});
		observable.add({
			let calls = Arc::clone(&calls);
			move |v| calls.lock().push(("second", *v))
		});

		observable.notify(&1);
		assert!(observable.remove(first));
		assert!(!observable.remove(first));
		observable.notify(&2);

		assert_eq!(
			*calls.lock(),
			[("first", 1), ("second", 1), ("second", 2)]
		);
	}

	#[test]
	fn observers_can_unregister_themselves() {
		let observable = Arc::new(Observable::<()>::default());
		let id = Arc::new(MonitoredMutex::new("id", None));

		let registered = observable.add({
			let observable = Arc::clone(&observable);
			let id = Arc::clone(&id);
			move |_: &()| {
				if let Some(id) = *id.lock() {
					observable.remove(id);
				}
			}
		});
		*id.lock() = Some(registered);

		observable.notify(&());
		assert!(observable.is_empty());
	}
}
