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

// Checksum engines. The engine is chosen at file creation and persisted in
// the header flags; a file may only be reopened under the same engine.

use std::sync::Arc;
use crate::error::{Error, Result};

/// External engines take the covered bytes and return a 32-bit sum.
pub type ChecksumFn = Arc<dyn Fn(&[u8]) -> u32 + Send + Sync>;

#[derive(Clone)]
pub enum ChecksumKind {
	/// xxHash64 truncated to 32 bits.
	Default,
	/// Always zero. Only useful for tests and benchmarks.
	Null,
	/// Caller-supplied function.
	External(ChecksumFn),
}

impl std::fmt::Debug for ChecksumKind {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self {
			ChecksumKind::Default => write!(f, "Default"),
			ChecksumKind::Null => write!(f, "Null"),
			ChecksumKind::External(_) => write!(f, "External"),
		}
	}
}

impl ChecksumKind {
	pub fn flag_bits(&self) -> u32 {
		match self {
			ChecksumKind::Default => 0,
			ChecksumKind::Null => 1,
			ChecksumKind::External(_) => 2,
		}
	}
}

#[derive(Clone)]
pub struct Checksum {
	kind: ChecksumKind,
	verify: bool,
}

impl Checksum {
	pub fn new(kind: ChecksumKind, verify: bool) -> Checksum {
		Checksum { kind, verify }
	}

	pub fn kind(&self) -> &ChecksumKind {
		&self.kind
	}

	pub fn flag_bits(&self) -> u32 {
		self.kind.flag_bits()
	}

	/// A copy that computes but never rejects. Recovery reads structure
	/// through this before it has repaired the sums it is about to rewrite.
	pub fn unverified(&self) -> Checksum {
		Checksum { kind: self.kind.clone(), verify: false }
	}

	pub fn sum(&self, data: &[u8]) -> u32 {
		match &self.kind {
			ChecksumKind::Default => xxhash_rust::xxh64::xxh64(data, 0) as u32,
			ChecksumKind::Null => 0,
			ChecksumKind::External(f) => f(data),
		}
	}

	pub fn check(&self, data: &[u8], expected: u32) -> Result<()> {
		if !self.verify || self.sum(data) == expected {
			Ok(())
		} else {
			Err(Error::BadChecksum)
		}
	}

	pub fn check_header(&self, data: &[u8], expected: u32) -> Result<()> {
		if !self.verify || self.sum(data) == expected {
			Ok(())
		} else {
			Err(Error::BadFormat("header checksum mismatch".into()))
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn null_engine_is_zero() {
		let c = Checksum::new(ChecksumKind::Null, true);
		assert_eq!(c.sum(b""), 0);
		assert_eq!(c.sum(b"anything at all"), 0);
		assert!(c.check(b"xyz", 0).is_ok());
	}

	#[test]
	fn default_engine_truncates_xxh64() {
		let c = Checksum::new(ChecksumKind::Default, true);
		let full = xxhash_rust::xxh64::xxh64(b"skipfile", 0);
		assert_eq!(c.sum(b"skipfile"), full as u32);
		assert!(c.check(b"skipfile", full as u32).is_ok());
		assert!(c.check(b"skipfile", !(full as u32)).is_err());
	}

	#[test]
	fn unverified_accepts_garbage() {
		let c = Checksum::new(ChecksumKind::Default, true).unverified();
		assert!(c.check(b"data", 0xdead_beef).is_ok());
	}

	#[test]
	fn external_engine_is_called() {
		let f: ChecksumFn = Arc::new(|d: &[u8]| d.len() as u32);
		let c = Checksum::new(ChecksumKind::External(f), true);
		assert_eq!(c.sum(b"1234"), 4);
		assert_eq!(c.flag_bits(), 2);
	}
}
