// Copyright 2015-2020 Parity Technologies (UK) Ltd.
// This file is part of Parity.

// Parity is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// Parity is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with Parity.  If not, see <http://www.gnu.org/licenses/>.

use std::cmp::Ordering;
use std::sync::Arc;
use crate::checksum::ChecksumKind;

/// Byte-string comparator. The comparator choice is recorded in the file
/// header; a file created with a custom comparator cannot be reopened
/// without one.
pub type Compare = Arc<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>;

/// Diagnostic side channel. The returned `Result` stays authoritative.
pub type ErrorSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Conditional store modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
	Always,
	/// Fail with `NotFound` when the key is absent.
	IfExist,
	/// Fail with `Exists` when the key is present.
	IfNotExist,
}

/// Returned by iteration callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanFlow {
	Continue,
	Stop,
}

/// Iteration knobs for `foreach`.
#[derive(Clone, Default)]
pub struct ScanOptions {
	/// Do not visit the record matching the start key exactly.
	pub skip_exact: bool,
	/// Yield the read lock before every callback instead of every 1024.
	pub always_yield: bool,
	/// Only records passing the filter reach the callback.
	pub filter: Option<Arc<dyn Fn(&[u8], &[u8]) -> bool + Send + Sync>>,
}

#[derive(Clone)]
pub struct OpenOptions {
	/// Create the file if it does not exist.
	pub create: bool,
	pub readonly: bool,
	/// Skip checksum verification on read. Sums are still computed on write.
	pub no_verify: bool,
	/// Skip synchronous flushes.
	pub no_sync: bool,
	/// Fail lock acquisition with `Locked` instead of blocking.
	pub non_blocking: bool,
	/// Disable the automatic yield during long iterations.
	pub no_yield: bool,
	pub checksum: ChecksumKind,
	pub compare: Option<Compare>,
	pub error_sink: Option<ErrorSink>,
	// Used by repack to seed the destination file.
	pub(crate) initial_uuid: Option<[u8; 16]>,
	pub(crate) initial_generation: u64,
	pub(crate) create_exclusive: bool,
}

impl Default for OpenOptions {
	fn default() -> OpenOptions {
		OpenOptions {
			create: false,
			readonly: false,
			no_verify: false,
			no_sync: false,
			non_blocking: false,
			no_yield: false,
			checksum: ChecksumKind::Default,
			compare: None,
			error_sink: None,
			initial_uuid: None,
			initial_generation: 0,
			create_exclusive: false,
		}
	}
}

impl OpenOptions {
	pub fn new() -> OpenOptions {
		Default::default()
	}

	pub fn create(mut self, create: bool) -> OpenOptions {
		self.create = create;
		self
	}

	pub fn readonly(mut self, readonly: bool) -> OpenOptions {
		self.readonly = readonly;
		self
	}

	pub fn checksum(mut self, kind: ChecksumKind) -> OpenOptions {
		self.checksum = kind;
		self
	}

	pub fn compare(mut self, compare: Compare) -> OpenOptions {
		self.compare = Some(compare);
		self
	}
}

/// Key ordering used by the skiplist. The empty key sorts before every
/// other key regardless of the installed comparator.
#[derive(Clone)]
pub(crate) struct KeyOrder {
	pub custom: Option<Compare>,
}

impl KeyOrder {
	pub fn cmp(&self, a: &[u8], b: &[u8]) -> Ordering {
		if a.is_empty() || b.is_empty() {
			return a.len().cmp(&b.len());
		}
		match &self.custom {
			Some(f) => f(a, b),
			None => a.cmp(b),
		}
	}
}
