//! Read positions of watched log sources, persistable across restarts
use std::{
	collections::HashMap,
	path::{Path, PathBuf},
};

use time::OffsetDateTime;

/// Byte offsets up to which each log source has been scanned
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Offsets {
	/// The time a position last changed
	pub(crate) updated: Option<OffsetDateTime>,
	/// Offset of the first unscanned byte per source
	pub(crate) positions: HashMap<PathBuf, u64>,
}

impl Offsets {
	/// Position to resume `path` from. Unknown sources start at the beginning.
	#[must_use]
	pub fn get(&self, path: &Path) -> u64 {
		self.saved(path).unwrap_or_default()
	}

	/// Position recorded for `path`, if any.
	#[must_use]
	pub fn saved(&self, path: &Path) -> Option<u64> {
		self.positions.get(path).copied()
	}

	/// Record the position reached in `path`. Returns whether it moved.
	pub(crate) fn record(&mut self, path: &Path, position: u64) -> bool {
		match self.positions.get_mut(path) {
			Some(cached) if *cached == position => false,
			Some(cached) => {
				*cached = position;
				self.updated = Some(OffsetDateTime::now_utc());
				true
			}
			None => {
				self.positions.insert(path.to_owned(), position);
				self.updated = Some(OffsetDateTime::now_utc());
				true
			}
		}
	}

	/// The time a position last changed.
	#[must_use]
	pub fn updated(&self) -> Option<OffsetDateTime> {
		self.updated
	}
}
