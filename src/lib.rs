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

//! Embedded, single-file, ordered key-value store.
//!
//! One regular file holds a 96-byte header and a skiplist of records,
//! shared between processes through a memory mapping and advisory
//! byte-range locks. Keys and values are arbitrary byte strings.
//!
//! Writes are append-only inside a single exclusive transaction per file;
//! publication is a single in-place store into one of two level-0 pointer
//! slots, which is what makes an interrupted transaction recoverable: the
//! other slot still names the last committed successor. Readers share the
//! file, and snapshot readers resolve every lookup as of a frozen point in
//! time by walking per-key ancestor chains. Dead records accumulate until
//! an online repack rewrites the file in place of itself.
//!
//! ```no_run
//! use skipfile::{Condition, Db, OpenOptions};
//!
//! # fn main() -> skipfile::Result<()> {
//! let mut opts = OpenOptions::new();
//! opts.create = true;
//! let db = Db::open("example.skf", &opts)?;
//! let mut txn = db.begin_write()?;
//! txn.store(b"banana", Some(b"yellow"), Condition::Always)?;
//! txn.commit()?;
//!
//! let mut txn = db.begin_read()?;
//! assert_eq!(txn.fetch(b"banana")?, b"yellow");
//! # Ok(())
//! # }
//! ```

mod checksum;
mod db;
mod display;
mod error;
mod file;
mod header;
mod lock;
mod options;
mod record;
mod recovery;
mod repack;
mod skiplist;
mod txn;

pub use checksum::{ChecksumFn, ChecksumKind};
pub use db::Db;
pub use error::{Error, Result};
pub use options::{Compare, Condition, ErrorSink, OpenOptions, ScanFlow, ScanOptions};
pub use txn::{Cursor, Transaction};
