//! Keyed snapshots and the difference between two of them.
//!
//! Higher layers use [`ListDiff`] to reconcile collections received from a remote (for example
//! a registry's entries) with the ones they already know: which entries are new, which changed
//! and which disappeared.

use std::{
	collections::{hash_map, HashMap},
	fmt,
	hash::Hash,
};

/// Anything that carries a stable identifier
pub trait Identifiable {
	type Id: Hash + Eq + Clone + fmt::Debug;

	fn id(&self) -> Self::Id;
}

/// A collection of identifiable entries keyed by their id, the last insertion for an id wins
#[derive(Debug, Clone)]
pub struct IdentifiableMap<V: Identifiable> {
	entries: HashMap<V::Id, V>,
}

impl<V: Identifiable> Default for IdentifiableMap<V> {
	fn default() -> Self {
		Self {
			entries: HashMap::new(),
		}
	}
}

impl<V: Identifiable + PartialEq> PartialEq for IdentifiableMap<V> {
	fn eq(&self, other: &Self) -> bool {
		self.entries == other.entries
	}
}

impl<V: Identifiable> IdentifiableMap<V> {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Inserts the entry, returning the previous one with the same id
	pub fn insert(&mut self, entry: V) -> Option<V> {
		self.entries.insert(entry.id(), entry)
	}

	pub fn remove(&mut self, id: &V::Id) -> Option<V> {
		self.entries.remove(id)
	}

	#[must_use]
	pub fn get(&self, id: &V::Id) -> Option<&V> {
		self.entries.get(id)
	}

	#[must_use]
	pub fn contains(&self, id: &V::Id) -> bool {
		self.entries.contains_key(id)
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.entries.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn ids(&self) -> impl Iterator<Item = &V::Id> {
		self.entries.keys()
	}

	pub fn values(&self) -> impl Iterator<Item = &V> {
		self.entries.values()
	}

	pub fn clear(&mut self) {
		self.entries.clear();
	}
}

impl<V: Identifiable> FromIterator<V> for IdentifiableMap<V> {
	fn from_iter<I: IntoIterator<Item = V>>(iter: I) -> Self {
		Self {
			entries: iter.into_iter().map(|entry| (entry.id(), entry)).collect(),
		}
	}
}

impl<V: Identifiable> Extend<V> for IdentifiableMap<V> {
	fn extend<I: IntoIterator<Item = V>>(&mut self, iter: I) {
		self.entries
			.extend(iter.into_iter().map(|entry| (entry.id(), entry)));
	}
}

impl<V: Identifiable> IntoIterator for IdentifiableMap<V> {
	type Item = V;
	type IntoIter = hash_map::IntoValues<V::Id, V>;

	fn into_iter(self) -> Self::IntoIter {
		self.entries.into_values()
	}
}

/// Difference between a set of original entries and a set of modifications.
///
/// After calling [`ListDiff::diff`], entries are classified as new (id unknown to the
/// originals), updated (same id, different content) or removed (id missing from the
/// modifications). [`ListDiff::commit`] then turns the last modifications into the originals
/// for the next round.
#[derive(Debug, Clone)]
pub struct ListDiff<V: Identifiable> {
	originals: IdentifiableMap<V>,
	modifications: IdentifiableMap<V>,
	new_entries: IdentifiableMap<V>,
	updated_entries: IdentifiableMap<V>,
	removed_entries: IdentifiableMap<V>,
}

impl<V: Identifiable + Clone + PartialEq> ListDiff<V> {
	pub fn new(originals: impl IntoIterator<Item = V>) -> Self {
		Self {
			originals: originals.into_iter().collect(),
			modifications: IdentifiableMap::new(),
			new_entries: IdentifiableMap::new(),
			updated_entries: IdentifiableMap::new(),
			removed_entries: IdentifiableMap::new(),
		}
	}

	/// Shortcut to build a diff and compute it in one go
	pub fn between(
		originals: impl IntoIterator<Item = V>,
		modifications: impl IntoIterator<Item = V>,
	) -> Self {
		let mut diff = Self::new(originals);
		diff.diff(modifications);
		diff
	}

	/// Computes the difference between the current originals and `modifications`, replacing
	/// the result of any previous call
	pub fn diff(&mut self, modifications: impl IntoIterator<Item = V>) {
		self.modifications = modifications.into_iter().collect();
		self.new_entries.clear();
		self.updated_entries.clear();
		self.removed_entries.clear();

		for entry in self.modifications.values() {
			match self.originals.get(&entry.id()) {
				None => {
					self.new_entries.insert(entry.clone());
				}
				Some(original) if original != entry => {
					self.updated_entries.insert(entry.clone());
				}
				Some(_) => { /* unchanged */ }
			}
		}

		self.removed_entries.extend(
			self.originals
				.values()
				.filter(|original| !self.modifications.contains(&original.id()))
				.cloned(),
		);
	}

	/// The last diffed modifications become the originals for the next [`ListDiff::diff`] call
	pub fn commit(&mut self) {
		self.originals = std::mem::take(&mut self.modifications);
		self.new_entries.clear();
		self.updated_entries.clear();
		self.removed_entries.clear();
	}

	#[must_use]
	pub const fn originals(&self) -> &IdentifiableMap<V> {
		&self.originals
	}

	#[must_use]
	pub const fn new_entries(&self) -> &IdentifiableMap<V> {
		&self.new_entries
	}

	#[must_use]
	pub const fn updated_entries(&self) -> &IdentifiableMap<V> {
		&self.updated_entries
	}

	#[must_use]
	pub const fn removed_entries(&self) -> &IdentifiableMap<V> {
		&self.removed_entries
	}

	#[must_use]
	pub fn has_changes(&self) -> bool {
		!(self.new_entries.is_empty()
			&& self.updated_entries.is_empty()
			&& self.removed_entries.is_empty())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[derive(Debug, Clone, PartialEq)]
	struct Unit {
		id: &'static str,
		label: &'static str,
	}

	impl Identifiable for Unit {
		type Id = &'static str;

		fn id(&self) -> Self::Id {
			self.id
		}
	}

	const fn unit(id: &'static str, label: &'static str) -> Unit {
		Unit { id, label }
	}

	#[test]
	fn classifies_new_updated_and_removed() {
		let diff = ListDiff::between(
			[unit("a", "lamp"), unit("b", "door"), unit("c", "window")],
			[unit("a", "lamp"), unit("b", "front door"), unit("d", "fan")],
		);

		assert!(diff.has_changes());
		assert_eq!(diff.new_entries().ids().collect::<Vec<_>>(), vec![&"d"]);
		assert_eq!(
			diff.updated_entries().get(&"b").map(|u| u.label),
			Some("front door")
		);
		assert_eq!(diff.removed_entries().ids().collect::<Vec<_>>(), vec![&"c"]);
		assert!(!diff.updated_entries().contains(&"a"));
	}

	#[test]
	fn commit_rolls_modifications_into_originals() {
		let mut diff = ListDiff::new([unit("a", "lamp")]);

		diff.diff([unit("a", "lamp"), unit("b", "door")]);
		assert_eq!(diff.new_entries().len(), 1);

		diff.commit();
		assert_eq!(diff.originals().len(), 2);
		assert!(!diff.has_changes());

		diff.diff([unit("a", "lamp"), unit("b", "door")]);
		assert!(!diff.has_changes());
	}

	#[test]
	fn duplicate_ids_keep_last_entry() {
		let map = [unit("a", "first"), unit("a", "second")]
			.into_iter()
			.collect::<IdentifiableMap<_>>();

		assert_eq!(map.len(), 1);
		assert_eq!(map.get(&"a").map(|u| u.label), Some("second"));
	}
}
