//! Helper methods for extracting data from search results.
use ldap3::SearchEntry;

use crate::error::Error;

/// An extension trait for [`SearchEntry`] that provides convenience methods for
/// extracting data.
pub trait SearchEntryExt {
	/// Get the first value of an attribute. Attribute names are matched
	/// case-insensitively, as the server may echo them in any case.
	fn attr_first(&self, attr: &str) -> Option<&str>;

	/// Get the first value of an attribute, interpreted as a 389 on/off flag.
	/// `on` and `true` (in any case) are set, every other value is unset.
	fn flag_first(&self, attr: &str) -> Option<bool> {
		self.attr_first(attr).map(|value| {
			let value = value.trim();
			value.eq_ignore_ascii_case("on") || value.eq_ignore_ascii_case("true")
		})
	}

	/// Get the first value of an attribute, interpreted as a TCP port.
	fn port_first(&self, attr: &str) -> Option<Result<u16, Error>> {
		self.attr_first(attr).map(|value| {
			value.trim().parse().map_err(|_| Error::Invalid(format!("{attr}: {value}")))
		})
	}
}

impl SearchEntryExt for SearchEntry {
	fn attr_first(&self, attr: &str) -> Option<&str> {
		let values = match self.attrs.get(attr) {
			Some(values) => values,
			None => {
				self.attrs.iter().find(|(name, _)| name.eq_ignore_ascii_case(attr))?.1
			}
		};
		values.first().map(String::as_str)
	}
}
