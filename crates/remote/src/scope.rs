use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use super::Error;

const SEPARATOR: char = '/';

/// Hierarchical address of a controller, like `home/kitchen/light`.
///
/// A controller broadcasts its status on the `status` sub-scope and answers method calls on the
/// `ctrl` sub-scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Scope(String);

impl Scope {
	pub fn parse(scope: &str) -> Result<Self, Error> {
		let trimmed = scope.trim().trim_matches(SEPARATOR);

		if trimmed.is_empty() {
			return Err(Error::InvalidState(format!("empty scope <{scope}>")));
		}

		if trimmed.split(SEPARATOR).any(|segment| segment.trim().is_empty()) {
			return Err(Error::InvalidState(format!(
				"scope <{scope}> has an empty segment"
			)));
		}

		Ok(Self(trimmed.to_string()))
	}

	#[must_use]
	pub fn join(&self, segment: &str) -> Self {
		Self(format!(
			"{}{SEPARATOR}{}",
			self.0,
			segment.trim_matches(SEPARATOR)
		))
	}

	/// Where the controller broadcasts its status
	#[must_use]
	pub fn status(&self) -> Self {
		self.join("status")
	}

	/// Where the controller answers method calls
	#[must_use]
	pub fn ctrl(&self) -> Self {
		self.join("ctrl")
	}

	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn segments(&self) -> impl Iterator<Item = &str> {
		self.0.split(SEPARATOR)
	}
}

impl fmt::Display for Scope {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for Scope {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::parse(s)
	}
}

impl TryFrom<String> for Scope {
	type Error = Error;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		Self::parse(&value)
	}
}

impl From<Scope> for String {
	fn from(scope: Scope) -> Self {
		scope.0
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parse_and_derive_sub_scopes() {
		let scope = Scope::parse("/home/kitchen/").expect("valid scope");

		assert_eq!(scope.as_str(), "home/kitchen");
		assert_eq!(scope.status().to_string(), "home/kitchen/status");
		assert_eq!(scope.ctrl().to_string(), "home/kitchen/ctrl");
		assert_eq!(scope.segments().collect::<Vec<_>>(), ["home", "kitchen"]);
	}

	#[test]
	fn rejects_empty_segments() {
		assert!(Scope::parse("").is_err());
		assert!(Scope::parse("///").is_err());
		assert!(Scope::parse("home//kitchen").is_err());
	}
}
