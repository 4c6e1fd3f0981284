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

// Owns the descriptor and the shared mapping of one database file.
//
// The file only ever grows, and only under the exclusive data lock. A grow
// replaces the mapping; the superseded mapping is retired rather than
// unmapped so that byte ranges handed out before the grow stay valid until
// the file is closed.

use std::convert::TryInto;
use std::fs::File;
use std::path::Path;
use memmap2::{Mmap, MmapMut, MmapOptions};
use crate::error::{Error, Result};

pub const GROW_ALIGN: u64 = 16 * 1024;

/// Files are sized to 125% of the requirement, rounded up to 16KiB.
pub fn grow_target(needed: u64) -> u64 {
	let padded = needed + needed / 4;
	(padded + GROW_ALIGN - 1) / GROW_ALIGN * GROW_ALIGN
}

enum Map {
	Rw(MmapMut),
	Ro(Mmap),
}

impl Map {
	fn bytes(&self) -> &[u8] {
		match self {
			Map::Rw(m) => &m[..],
			Map::Ro(m) => &m[..],
		}
	}

	fn bytes_mut(&mut self) -> Option<&mut [u8]> {
		match self {
			Map::Rw(m) => Some(&mut m[..]),
			Map::Ro(_) => None,
		}
	}
}

pub struct MappedFile {
	file: File,
	map: Map,
	retired: Vec<Map>,
	size: u64,
	writable: bool,
}

fn map_file(file: &File, size: u64, writable: bool) -> Result<Map> {
	// The mapping is shared with every process that has the file open; all
	// mutation happens under the exclusive data lock and the level-0
	// publish protocol keeps concurrent readers consistent.
	let map = unsafe {
		if writable {
			Map::Rw(MmapOptions::new().len(size as usize).map_mut(file)?)
		} else {
			Map::Ro(MmapOptions::new().len(size as usize).map(file)?)
		}
	};
	Ok(map)
}

impl MappedFile {
	/// Opens or creates the file and maps it whole. Returns the manager and
	/// whether the file was freshly created (zero-length).
	pub fn open(
		path: &Path,
		create: bool,
		create_exclusive: bool,
		writable: bool,
	) -> Result<(MappedFile, bool)> {
		let mut fs_opts = std::fs::OpenOptions::new();
		fs_opts.read(true).write(writable);
		if create_exclusive {
			fs_opts.create_new(true);
		} else if create {
			fs_opts.create(true);
		}
		let file = match fs_opts.open(path) {
			Ok(file) => file,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(Error::NotFound),
			Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
				return Err(Error::Locked)
			}
			Err(e) => return Err(e.into()),
		};
		let mut size = file.metadata()?.len();
		let created = size == 0;
		if created {
			if !create && !create_exclusive {
				return Err(Error::BadFormat("empty database file".into()));
			}
			if !writable {
				return Err(Error::ReadOnly);
			}
			size = GROW_ALIGN;
			file.set_len(size)?;
		}
		let map = map_file(&file, size, writable)?;
		Ok((MappedFile { file, map, retired: Vec::new(), size, writable }, created))
	}

	pub fn size(&self) -> u64 {
		self.size
	}

	pub fn writable(&self) -> bool {
		self.writable
	}

	pub fn file(&self) -> &File {
		&self.file
	}

	pub fn bytes(&self) -> &[u8] {
		self.map.bytes()
	}

	pub fn bytes_mut(&mut self) -> Result<&mut [u8]> {
		match self.map.bytes_mut() {
			Some(b) => Ok(b),
			None => Err(Error::ReadOnly),
		}
	}

	pub fn slice(&self, offset: u64, len: u64) -> Result<&[u8]> {
		if offset.checked_add(len).map_or(true, |end| end > self.size) {
			return Err(Error::BadFormat(format!(
				"range of {} bytes at {} outside the file",
				len, offset
			)));
		}
		Ok(&self.map.bytes()[offset as usize..(offset + len) as usize])
	}

	pub fn slice_mut(&mut self, offset: u64, len: u64) -> Result<&mut [u8]> {
		if offset.checked_add(len).map_or(true, |end| end > self.size) {
			return Err(Error::BadFormat(format!(
				"range of {} bytes at {} outside the file",
				len, offset
			)));
		}
		let bytes = self.bytes_mut()?;
		Ok(&mut bytes[offset as usize..(offset + len) as usize])
	}

	pub fn read_u64(&self, offset: u64) -> Result<u64> {
		Ok(u64::from_le_bytes(self.slice(offset, 8)?.try_into().unwrap()))
	}

	pub fn write_u64(&mut self, offset: u64, v: u64) -> Result<()> {
		self.slice_mut(offset, 8)?.copy_from_slice(&v.to_le_bytes());
		Ok(())
	}

	/// Grows the file and replaces the mapping when `needed` bytes do not
	/// fit. Only the writer, under the exclusive data lock, gets here.
	pub fn ensure(&mut self, needed: u64) -> Result<()> {
		if needed <= self.size {
			return Ok(());
		}
		let new_size = grow_target(needed);
		log::debug!(target: "skipfile", "Growing file {} -> {} bytes", self.size, new_size);
		self.file.set_len(new_size)?;
		let new_map = map_file(&self.file, new_size, self.writable)?;
		let old = std::mem::replace(&mut self.map, new_map);
		self.retired.push(old);
		self.size = new_size;
		Ok(())
	}

	pub fn flush_range(&self, offset: u64, len: u64) -> Result<()> {
		if len == 0 {
			return Ok(());
		}
		match &self.map {
			Map::Rw(m) => Ok(m.flush_range(offset as usize, len as usize)?),
			Map::Ro(_) => Ok(()),
		}
	}

	pub fn flush_all(&self) -> Result<()> {
		match &self.map {
			Map::Rw(m) => Ok(m.flush()?),
			Map::Ro(_) => Ok(()),
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	struct TempDir(std::path::PathBuf);

	impl TempDir {
		fn new(name: &'static str) -> TempDir {
			env_logger::try_init().ok();
			let mut path = std::env::temp_dir();
			path.push("skipfile-test");
			path.push("file");
			path.push(name);
			if path.exists() {
				std::fs::remove_dir_all(&path).unwrap();
			}
			std::fs::create_dir_all(&path).unwrap();
			TempDir(path)
		}

		fn file_path(&self, name: &str) -> std::path::PathBuf {
			self.0.join(name)
		}
	}

	impl Drop for TempDir {
		fn drop(&mut self) {
			if self.0.exists() {
				std::fs::remove_dir_all(&self.0).unwrap();
			}
		}
	}

	#[test]
	fn grow_target_policy() {
		// 125% rounded up to 16KiB.
		assert_eq!(grow_target(368), 16384);
		assert_eq!(grow_target(16384), 32768);
		assert_eq!(grow_target(100_000), 131_072);
		assert_eq!(grow_target(13_107), 16384);
	}

	#[test]
	fn create_open_write_read() {
		let dir = TempDir::new("create_open_write_read");
		let path = dir.file_path("db");
		let (mut map, created) = MappedFile::open(&path, true, false, true).unwrap();
		assert!(created);
		assert_eq!(map.size(), GROW_ALIGN);
		map.slice_mut(16, 4).unwrap().copy_from_slice(b"abcd");
		map.write_u64(32, 0xfeed).unwrap();
		map.flush_all().unwrap();
		drop(map);

		let (map, created) = MappedFile::open(&path, false, false, true).unwrap();
		assert!(!created);
		assert_eq!(map.slice(16, 4).unwrap(), b"abcd");
		assert_eq!(map.read_u64(32).unwrap(), 0xfeed);
	}

	#[test]
	fn grow_preserves_content() {
		let dir = TempDir::new("grow_preserves_content");
		let path = dir.file_path("db");
		let (mut map, _) = MappedFile::open(&path, true, false, true).unwrap();
		map.slice_mut(100, 5).unwrap().copy_from_slice(b"hello");
		map.ensure(GROW_ALIGN * 3).unwrap();
		assert!(map.size() >= GROW_ALIGN * 3);
		assert_eq!(map.slice(100, 5).unwrap(), b"hello");
		// Fresh pages read back zero.
		assert!(map.slice(GROW_ALIGN * 2, 64).unwrap().iter().all(|b| *b == 0));
	}

	#[test]
	fn bounds_checked() {
		let dir = TempDir::new("bounds_checked");
		let (map, _) = MappedFile::open(&dir.file_path("db"), true, false, true).unwrap();
		assert!(map.slice(map.size() - 4, 8).is_err());
		assert!(map.slice(map.size(), 1).is_err());
		assert!(map.slice(u64::MAX - 4, 8).is_err());
		assert!(map.slice(0, map.size()).is_ok());
	}

	#[test]
	fn missing_file_is_not_found() {
		let dir = TempDir::new("missing_file_is_not_found");
		assert!(matches!(
			MappedFile::open(&dir.file_path("absent"), false, false, true),
			Err(Error::NotFound)
		));
	}

	#[test]
	fn exclusive_create_conflict_is_locked() {
		let dir = TempDir::new("exclusive_create_conflict_is_locked");
		let path = dir.file_path("db");
		let _first = MappedFile::open(&path, true, false, true).unwrap();
		assert!(matches!(MappedFile::open(&path, false, true, true), Err(Error::Locked)));
	}
}
