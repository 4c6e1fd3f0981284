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

/// Outcome of every database operation. Iteration exhaustion is not an
/// error; cursors signal it with `Ok(None)`.
#[derive(Debug)]
pub enum Error {
	/// Key absent, file absent, or an `IfExist` store refused.
	NotFound,
	/// An `IfNotExist` store refused because the key was present.
	Exists,
	/// Non-blocking lock acquisition failed, or a yield was requested on
	/// a write transaction.
	Locked,
	/// A write was attempted through a read-only handle or transaction.
	ReadOnly,
	/// Magic, version, checksum engine, comparator or a structural
	/// invariant check failed.
	BadFormat(String),
	/// A record checksum mismatched.
	BadChecksum,
	/// Invalid argument or flag combination.
	BadUsage(String),
	Io(std::io::Error),
	/// Consistency assertion violated.
	Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
	fn from(e: std::io::Error) -> Error {
		Error::Io(e)
	}
}

impl std::fmt::Display for Error {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self {
			Error::NotFound => write!(f, "Not found"),
			Error::Exists => write!(f, "Key already exists"),
			Error::Locked => write!(f, "Lock contention"),
			Error::ReadOnly => write!(f, "Read-only"),
			Error::BadFormat(e) => write!(f, "Bad format: {}", e),
			Error::BadChecksum => write!(f, "Checksum mismatch"),
			Error::BadUsage(e) => write!(f, "Bad usage: {}", e),
			Error::Io(e) => write!(f, "IO error: {}", e),
			Error::Internal(e) => write!(f, "Internal error: {}", e),
		}
	}
}

impl std::error::Error for Error {}
