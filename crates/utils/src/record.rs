//! Named field access over structured records.
//!
//! Generic code (like the remote synchronization engine) needs to read a handful of well known
//! fields (`id`, `label`, `scope`, `transaction_id`) from records it doesn't know statically.
//! Instead of runtime reflection, records expose an explicit field table through the [`Record`]
//! trait, either generated with [`impl_record!`](crate::impl_record) or backed by a map as in
//! [`DynamicRecord`].

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
	Bool(bool),
	I64(i64),
	U64(u64),
	F64(f64),
	String(String),
	Bytes(Vec<u8>),
}

impl FieldValue {
	#[must_use]
	pub const fn type_name(&self) -> &'static str {
		match self {
			Self::Bool(_) => "bool",
			Self::I64(_) => "i64",
			Self::U64(_) => "u64",
			Self::F64(_) => "f64",
			Self::String(_) => "string",
			Self::Bytes(_) => "bytes",
		}
	}
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FieldError {
	#[error("field <{0}> is not supported by this record")]
	Unsupported(String),
	#[error("field <{0}> is not set")]
	NotSet(String),
	#[error("field <{field}> expects a value of type {expected} but received {found}")]
	TypeMismatch {
		field: String,
		expected: &'static str,
		found: &'static str,
	},
}

impl FieldError {
	#[must_use]
	pub fn type_mismatch(field: &str, expected: &'static str, found: &FieldValue) -> Self {
		Self::TypeMismatch {
			field: field.to_string(),
			expected,
			found: found.type_name(),
		}
	}
}

/// Conversion between a concrete field type and a [`FieldValue`]
pub trait FieldType: Sized {
	const TYPE_NAME: &'static str;

	/// `None` means the field is not set
	fn to_field_value(&self) -> Option<FieldValue>;

	/// Gives the value back on type mismatch
	fn from_field_value(value: FieldValue) -> Result<Self, FieldValue>;
}

/// Helper for [`impl_record!`](crate::impl_record) to name the expected type of a field
#[doc(hidden)]
pub const fn type_name_of<T: FieldType>(_: &T) -> &'static str {
	T::TYPE_NAME
}

impl FieldType for bool {
	const TYPE_NAME: &'static str = "bool";

	fn to_field_value(&self) -> Option<FieldValue> {
		Some(FieldValue::Bool(*self))
	}

	fn from_field_value(value: FieldValue) -> Result<Self, FieldValue> {
		match value {
			FieldValue::Bool(value) => Ok(value),
			other => Err(other),
		}
	}
}

impl FieldType for i64 {
	const TYPE_NAME: &'static str = "i64";

	fn to_field_value(&self) -> Option<FieldValue> {
		Some(FieldValue::I64(*self))
	}

	fn from_field_value(value: FieldValue) -> Result<Self, FieldValue> {
		match value {
			FieldValue::I64(value) => Ok(value),
			FieldValue::U64(value) => Self::try_from(value).map_err(|_| FieldValue::U64(value)),
			other => Err(other),
		}
	}
}

impl FieldType for u64 {
	const TYPE_NAME: &'static str = "u64";

	fn to_field_value(&self) -> Option<FieldValue> {
		Some(FieldValue::U64(*self))
	}

	fn from_field_value(value: FieldValue) -> Result<Self, FieldValue> {
		match value {
			FieldValue::U64(value) => Ok(value),
			FieldValue::I64(value) => Self::try_from(value).map_err(|_| FieldValue::I64(value)),
			other => Err(other),
		}
	}
}

impl FieldType for f64 {
	const TYPE_NAME: &'static str = "f64";

	fn to_field_value(&self) -> Option<FieldValue> {
		Some(FieldValue::F64(*self))
	}

	fn from_field_value(value: FieldValue) -> Result<Self, FieldValue> {
		match value {
			FieldValue::F64(value) => Ok(value),
			other => Err(other),
		}
	}
}

impl FieldType for String {
	const TYPE_NAME: &'static str = "string";

	fn to_field_value(&self) -> Option<FieldValue> {
		Some(FieldValue::String(self.clone()))
	}

	fn from_field_value(value: FieldValue) -> Result<Self, FieldValue> {
		match value {
			FieldValue::String(value) => Ok(value),
			other => Err(other),
		}
	}
}

impl FieldType for Vec<u8> {
	const TYPE_NAME: &'static str = "bytes";

	fn to_field_value(&self) -> Option<FieldValue> {
		Some(FieldValue::Bytes(self.clone()))
	}

	fn from_field_value(value: FieldValue) -> Result<Self, FieldValue> {
		match value {
			FieldValue::Bytes(value) => Ok(value),
			other => Err(other),
		}
	}
}

impl<T: FieldType> FieldType for Option<T> {
	const TYPE_NAME: &'static str = T::TYPE_NAME;

	fn to_field_value(&self) -> Option<FieldValue> {
		self.as_ref().and_then(FieldType::to_field_value)
	}

	fn from_field_value(value: FieldValue) -> Result<Self, FieldValue> {
		T::from_field_value(value).map(Some)
	}
}

macro_rules! impl_from_for_field_value {
	($($ty:ty => $variant:ident),+ $(,)?) => {
		$(
			impl From<$ty> for FieldValue {
				fn from(value: $ty) -> Self {
					Self::$variant(value.into())
				}
			}
		)+
	};
}

impl_from_for_field_value!(
	bool => Bool,
	i64 => I64,
	u64 => U64,
	f64 => F64,
	String => String,
	&str => String,
	Vec<u8> => Bytes,
);

/// A structured record with named fields
pub trait Record {
	/// Every field this record type knows about, set or not
	fn field_names(&self) -> Vec<String>;

	fn supports_field(&self, name: &str) -> bool;

	/// `None` if the field is unsupported or not set
	fn field(&self, name: &str) -> Option<FieldValue>;

	fn set_field(&mut self, name: &str, value: FieldValue) -> Result<(), FieldError>;

	fn has_field(&self, name: &str) -> bool {
		self.field(name).is_some()
	}

	fn get_field(&self, name: &str) -> Result<FieldValue, FieldError> {
		if !self.supports_field(name) {
			return Err(FieldError::Unsupported(name.to_string()));
		}

		self.field(name)
			.ok_or_else(|| FieldError::NotSet(name.to_string()))
	}

	fn get_field_as<T: FieldType>(&self, name: &str) -> Result<T, FieldError>
	where
		Self: Sized,
	{
		let value = self.get_field(name)?;
		T::from_field_value(value)
			.map_err(|found| FieldError::type_mismatch(name, T::TYPE_NAME, &found))
	}
}

/// Copies every set field of `source` that `target` supports, returning how many were copied
pub fn merge_from(target: &mut dyn Record, source: &dyn Record) -> Result<usize, FieldError> {
	let mut merged = 0;

	for name in source.field_names() {
		if !target.supports_field(&name) {
			continue;
		}

		if let Some(value) = source.field(&name) {
			target.set_field(&name, value)?;
			merged += 1;
		}
	}

	Ok(merged)
}

/// Implements [`Record`] for a struct by listing the fields that should be exposed.
///
/// Every listed field must implement [`FieldType`]; `Option` fields read as "not set" when
/// they're `None`.
///
/// ```
/// use sd_utils::{impl_record, Record};
///
/// #[derive(Default)]
/// struct Unit {
///     id: String,
///     label: Option<String>,
///     transaction_id: u64,
/// }
///
/// impl_record!(Unit { id, label, transaction_id });
///
/// let mut unit = Unit::default();
/// assert!(!unit.has_field("label"));
/// unit.set_field("label", "kitchen".into()).unwrap();
/// assert_eq!(unit.get_field_as::<String>("label").unwrap(), "kitchen");
/// ```
#[macro_export]
macro_rules! impl_record {
	($record:ty { $($field:ident),+ $(,)? }) => {
		impl $crate::record::Record for $record {
			fn field_names(&self) -> ::std::vec::Vec<::std::string::String> {
				::std::vec![$(::std::string::String::from(::std::stringify!($field))),+]
			}

			fn supports_field(&self, name: &str) -> bool {
				::std::matches!(name, $(::std::stringify!($field))|+)
			}

			fn field(&self, name: &str) -> ::std::option::Option<$crate::record::FieldValue> {
				match name {
					$(::std::stringify!($field) => {
						$crate::record::FieldType::to_field_value(&self.$field)
					})+
					_ => ::std::option::Option::None,
				}
			}

			fn set_field(
				&mut self,
				name: &str,
				value: $crate::record::FieldValue,
			) -> ::std::result::Result<(), $crate::record::FieldError> {
				match name {
					$(::std::stringify!($field) => {
						let expected = $crate::record::type_name_of(&self.$field);
						self.$field = $crate::record::FieldType::from_field_value(value)
							.map_err(|found| {
								$crate::record::FieldError::type_mismatch(name, expected, &found)
							})?;
						::std::result::Result::Ok(())
					})+
					_ => ::std::result::Result::Err(
						$crate::record::FieldError::Unsupported(name.to_string())
					),
				}
			}
		}
	};
}

/// A record backed by a map, optionally restricted to a fixed set of field names
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicRecord {
	fields: BTreeMap<String, FieldValue>,
	schema: Option<BTreeSet<String>>,
}

impl DynamicRecord {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// A record that only accepts the given field names
	pub fn with_schema(names: impl IntoIterator<Item = impl Into<String>>) -> Self {
		Self {
			fields: BTreeMap::new(),
			schema: Some(names.into_iter().map(Into::into).collect()),
		}
	}

	/// Builder style setter, fields outside the schema are ignored
	#[must_use]
	pub fn with(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
		if self.supports_field(name) {
			self.fields.insert(name.to_string(), value.into());
		}
		self
	}

	pub fn clear_field(&mut self, name: &str) -> Option<FieldValue> {
		self.fields.remove(name)
	}
}

impl Record for DynamicRecord {
	fn field_names(&self) -> Vec<String> {
		self.schema.as_ref().map_or_else(
			|| self.fields.keys().cloned().collect(),
			|schema| schema.iter().cloned().collect(),
		)
	}

	fn supports_field(&self, name: &str) -> bool {
		self.schema
			.as_ref()
			.map_or(true, |schema| schema.contains(name))
	}

	fn field(&self, name: &str) -> Option<FieldValue> {
		self.fields.get(name).cloned()
	}

	fn set_field(&mut self, name: &str, value: FieldValue) -> Result<(), FieldError> {
		if !self.supports_field(name) {
			return Err(FieldError::Unsupported(name.to_string()));
		}

		self.fields.insert(name.to_string(), value);
		Ok(())
	}
}
