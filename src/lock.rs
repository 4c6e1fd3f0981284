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

// Advisory byte-range locks over the database file.
//
// Two regions: the header lock (bytes 0..16) serialises open and
// transaction begin; the data lock (bytes 96..344, the sentinel record)
// is the transaction lock, shared for readers and exclusive for the
// writer. Acquisition is two-phase: header, then data, then the header is
// released, so a late reader can still open the file while a long
// transaction holds the data lock.
//
// fcntl locks do not exclude threads of the same process; the in-process
// lock table layered on top lives with the shared state in `db`.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use crate::error::Result;

pub const HEADER_LOCK_START: i64 = 0;
pub const HEADER_LOCK_LEN: i64 = 16;
pub const DATA_LOCK_START: i64 = 96;
pub const DATA_LOCK_LEN: i64 = 248;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
	Shared,
	Exclusive,
}

fn fcntl_lock(file: &File, l_type: libc::c_int, start: i64, len: i64, block: bool) -> Result<bool> {
	let mut fl: libc::flock = unsafe { std::mem::zeroed() };
	fl.l_type = l_type as libc::c_short;
	fl.l_whence = libc::SEEK_SET as libc::c_short;
	fl.l_start = start as libc::off_t;
	fl.l_len = len as libc::off_t;
	let cmd = if block { libc::F_SETLKW } else { libc::F_SETLK };
	loop {
		let r = unsafe { libc::fcntl(file.as_raw_fd(), cmd, &fl) };
		if r == 0 {
			return Ok(true);
		}
		let err = std::io::Error::last_os_error();
		match err.raw_os_error() {
			Some(libc::EINTR) => continue,
			Some(libc::EAGAIN) | Some(libc::EACCES) if !block => return Ok(false),
			_ => return Err(err.into()),
		}
	}
}

/// Returns false instead of blocking when `block` is off and another
/// process holds a conflicting lock.
pub fn lock_range(file: &File, start: i64, len: i64, mode: LockMode, block: bool) -> Result<bool> {
	let l_type = match mode {
		LockMode::Shared => libc::F_RDLCK,
		LockMode::Exclusive => libc::F_WRLCK,
	};
	fcntl_lock(file, l_type, start, len, block)
}

pub fn unlock_range(file: &File, start: i64, len: i64) -> Result<()> {
	fcntl_lock(file, libc::F_UNLCK, start, len, true)?;
	Ok(())
}

/// Two-phase data-lock acquisition. `mode` may also downgrade or upgrade a
/// lock the process already holds.
pub fn data_lock(file: &File, mode: LockMode, block: bool) -> Result<bool> {
	if !lock_range(file, HEADER_LOCK_START, HEADER_LOCK_LEN, LockMode::Exclusive, block)? {
		return Ok(false);
	}
	let got = lock_range(file, DATA_LOCK_START, DATA_LOCK_LEN, mode, block);
	let released = unlock_range(file, HEADER_LOCK_START, HEADER_LOCK_LEN);
	let got = got?;
	released?;
	Ok(got)
}

pub fn data_unlock(file: &File) -> Result<()> {
	unlock_range(file, DATA_LOCK_START, DATA_LOCK_LEN)
}

pub fn header_lock(file: &File, block: bool) -> Result<bool> {
	lock_range(file, HEADER_LOCK_START, HEADER_LOCK_LEN, LockMode::Exclusive, block)
}

pub fn header_unlock(file: &File) -> Result<()> {
	unlock_range(file, HEADER_LOCK_START, HEADER_LOCK_LEN)
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn lock_cycle() {
		let mut path = std::env::temp_dir();
		path.push("skipfile-test-lock-cycle");
		let file = std::fs::OpenOptions::new()
			.read(true)
			.write(true)
			.create(true)
			.open(&path)
			.unwrap();
		file.set_len(1024).unwrap();

		assert!(data_lock(&file, LockMode::Shared, true).unwrap());
		// Same process: upgrading does not conflict.
		assert!(data_lock(&file, LockMode::Exclusive, false).unwrap());
		data_unlock(&file).unwrap();
		assert!(header_lock(&file, false).unwrap());
		header_unlock(&file).unwrap();
		std::fs::remove_file(&path).unwrap();
	}
}
