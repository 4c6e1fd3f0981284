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

// Database handle and per-file shared state.
//
// File-range locks are per process, so two opens of one file inside a
// process must share state: a registry keyed by the resolved path hands
// out reference-counted handles. The in-process lock table (reader count,
// writer flag, condvar) layers thread exclusion over the fcntl locks; the
// process-level fcntl lock is taken by the first in-process holder,
// upgraded when a writer has drained the readers and dropped when the last
// holder leaves.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use lazy_static::lazy_static;
use parking_lot::{Condvar, Mutex, MutexGuard};
use crate::checksum::Checksum;
use crate::error::{Error, Result};
use crate::file::MappedFile;
use crate::header::{Header, FLAG_EXTERNAL_CMP, HEADER_SIZE};
use crate::lock::{self, LockMode};
use crate::options::{ErrorSink, KeyOrder, OpenOptions};
use crate::record::{self, NewRecord};
use crate::recovery;
use crate::repack;
use crate::skiplist::DUMMY_OFFSET;
use crate::txn::Transaction;

/// `should_repack` stays quiet below this much dead weight.
pub const MIN_REPACK_SIZE: u64 = 16384;

lazy_static! {
	static ref REGISTRY: Mutex<HashMap<PathBuf, Weak<DbInner>>> = Mutex::new(HashMap::new());
}

/// One mapped generation of the database file. Repack retires the state
/// and installs a fresh one; frozen snapshots keep reading the retired
/// mapping under its original identity.
pub(crate) struct FileState {
	pub id: u64,
	pub map: MappedFile,
	pub header: Header,
	/// Logical end of committed data, refreshed at commit.
	pub committed_size: u64,
	/// Where the next append goes; ahead of `committed_size` only inside a
	/// write transaction.
	pub written_size: u64,
}

impl FileState {
	pub fn write_header(&mut self, csum: &Checksum) -> Result<()> {
		let mut buf = [0u8; HEADER_SIZE as usize];
		self.header.encode(&mut buf, csum);
		self.map.slice_mut(0, HEADER_SIZE)?.copy_from_slice(&buf);
		Ok(())
	}

	pub fn flush_header(&self, sync: bool) -> Result<()> {
		if sync {
			self.map.flush_range(0, HEADER_SIZE)?;
		}
		Ok(())
	}
}

pub(crate) struct State {
	pub file: FileState,
	/// States superseded by repack, kept alive for frozen snapshots.
	pub old: Vec<FileState>,
	pub readers: usize,
	pub writer: bool,
	pub proc_lock: Option<LockMode>,
	pub repacking: bool,
	pub next_id: u64,
}

impl State {
	pub fn find_file(&self, id: u64) -> Result<&FileState> {
		if self.file.id == id {
			Ok(&self.file)
		} else {
			self.old
				.iter()
				.find(|f| f.id == id)
				.ok_or_else(|| Error::Internal(format!("no file state {}", id)))
		}
	}
}

pub(crate) struct DbInner {
	pub path: PathBuf,
	pub state: Mutex<State>,
	pub cond: Condvar,
	pub csum: Checksum,
	pub order: KeyOrder,
	pub sink: Option<ErrorSink>,
}

impl DbInner {
	pub fn report(&self, message: &str) {
		log::warn!(target: "skipfile", "{}: {}", self.path.display(), message);
		if let Some(sink) = &self.sink {
			sink(message);
		}
	}
}

impl Drop for DbInner {
	fn drop(&mut self) {
		let mut registry = REGISTRY.lock();
		if let Some(weak) = registry.get(&self.path) {
			if weak.strong_count() == 0 {
				registry.remove(&self.path);
			}
		}
	}
}

/// A handle onto one database file. Cheap to clone; all clones and all
/// other in-process opens of the same path share state.
#[derive(Clone)]
pub struct Db {
	pub(crate) inner: Arc<DbInner>,
	pub(crate) readonly: bool,
	pub(crate) no_sync: bool,
	pub(crate) non_blocking: bool,
	pub(crate) no_yield: bool,
}

fn canonical_key(path: &Path) -> Result<PathBuf> {
	let name = match path.file_name() {
		Some(name) => name,
		None => return Err(Error::BadUsage(format!("bad database path {:?}", path))),
	};
	let parent = match path.parent() {
		Some(parent) if !parent.as_os_str().is_empty() => parent,
		_ => Path::new("."),
	};
	let parent = match parent.canonicalize() {
		Ok(parent) => parent,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(Error::NotFound),
		Err(e) => return Err(e.into()),
	};
	Ok(parent.join(name))
}

fn create_file(
	map: &mut MappedFile,
	opts: &OpenOptions,
	csum: &Checksum,
	sync: bool,
) -> Result<Header> {
	let uuid = match opts.initial_uuid {
		Some(uuid) => uuid,
		None => *uuid::Uuid::new_v4().as_bytes(),
	};
	let mut flags = csum.flag_bits();
	if opts.compare.is_some() {
		flags |= FLAG_EXTERNAL_CMP;
	}
	let header = Header {
		uuid,
		flags,
		generation: opts.initial_generation,
		num_records: 0,
		num_commits: 0,
		dirty_size: 0,
		repack_size: HEADER_SIZE + record::DUMMY_SIZE,
		current_size: HEADER_SIZE + record::DUMMY_SIZE,
		maxlevel: 1,
	};
	let mut buf = [0u8; HEADER_SIZE as usize];
	header.encode(&mut buf, csum);
	map.slice_mut(0, HEADER_SIZE)?.copy_from_slice(&buf);
	let dummy = NewRecord {
		rtype: record::RT_DUMMY,
		level: record::MAX_LEVEL as u8,
		ancestor: 0,
		key: b"",
		val: b"",
	};
	let ptrs = [0u64; record::MAX_LEVEL + 1];
	record::encode(
		map.slice_mut(DUMMY_OFFSET, record::DUMMY_SIZE)?,
		&dummy,
		&ptrs,
		csum,
	)?;
	if sync {
		map.flush_range(0, HEADER_SIZE + record::DUMMY_SIZE)?;
	}
	Ok(header)
}

pub(crate) fn open_file_state(
	path: &Path,
	opts: &OpenOptions,
	csum: &Checksum,
	order: &KeyOrder,
	id: u64,
) -> Result<FileState> {
	let writable = !opts.readonly;
	let block = !opts.non_blocking;
	let (mut map, created) = MappedFile::open(path, opts.create, opts.create_exclusive, writable)?;

	// The header lock serialises open across processes; it is dropped as
	// soon as the state is usable.
	if !lock::header_lock(map.file(), block)? {
		return Err(Error::Locked);
	}
	let result = (|| {
		let header = if created {
			create_file(&mut map, opts, csum, !opts.no_sync)?
		} else {
			let header = Header::decode(map.slice(0, HEADER_SIZE)?, csum)?;
			if !opts.no_verify && header.csum_bits() != csum.flag_bits() {
				return Err(Error::BadFormat(format!(
					"file uses checksum engine {}, handle supplies {}",
					header.csum_bits(),
					csum.flag_bits()
				)));
			}
			if header.external_cmp() != order.custom.is_some() {
				return Err(Error::BadFormat("comparator mismatch".into()));
			}
			if header.current_size > map.size() {
				return Err(Error::BadFormat("committed data past the end of the file".into()));
			}
			header
		};
		let committed = header.current_size;
		let mut fs = FileState { id, map, header, committed_size: committed, written_size: committed };
		if fs.header.dirty() {
			if !writable {
				return Err(Error::BadFormat("dirty database opened read-only".into()));
			}
			if !lock::data_lock(fs.map.file(), LockMode::Exclusive, block)? {
				return Err(Error::Locked);
			}
			let recovered = recovery::recover(&mut fs, csum, order, !opts.no_sync);
			lock::data_unlock(fs.map.file())?;
			recovered?;
		}
		Ok(fs)
	})();
	// On error the descriptor drops here, which releases the header lock.
	let fs = result?;
	lock::header_unlock(fs.map.file())?;
	Ok(fs)
}

impl Db {
	pub fn open<P: AsRef<Path>>(path: P, opts: &OpenOptions) -> Result<Db> {
		let key = canonical_key(path.as_ref())?;
		let mut registry = REGISTRY.lock();
		if let Some(inner) = registry.get(&key).and_then(|w| w.upgrade()) {
			if inner.csum.flag_bits() != opts.checksum.flag_bits()
				|| inner.order.custom.is_some() != opts.compare.is_some()
			{
				return Err(Error::BadFormat(
					"database already open with a different engine".into(),
				));
			}
			log::debug!(target: "skipfile", "Sharing open handle for {}", key.display());
			return Ok(Db {
				inner,
				readonly: opts.readonly,
				no_sync: opts.no_sync,
				non_blocking: opts.non_blocking,
				no_yield: opts.no_yield,
			});
		}

		let csum = Checksum::new(opts.checksum.clone(), !opts.no_verify);
		let order = KeyOrder { custom: opts.compare.clone() };
		let file = open_file_state(&key, opts, &csum, &order, 1)?;
		log::debug!(
			target: "skipfile",
			"Opened {} with {} records, generation {}",
			key.display(),
			file.header.num_records,
			file.header.generation,
		);
		let inner = Arc::new(DbInner {
			path: key.clone(),
			state: Mutex::new(State {
				file,
				old: Vec::new(),
				readers: 0,
				writer: false,
				proc_lock: None,
				repacking: false,
				next_id: 2,
			}),
			cond: Condvar::new(),
			csum,
			order,
			sink: opts.error_sink.clone(),
		});
		registry.insert(key, Arc::downgrade(&inner));
		Ok(Db {
			inner,
			readonly: opts.readonly,
			no_sync: opts.no_sync,
			non_blocking: opts.non_blocking,
			no_yield: opts.no_yield,
		})
	}

	pub fn begin_write(&self) -> Result<Transaction> {
		Transaction::begin_write(self)
	}

	pub fn begin_read(&self) -> Result<Transaction> {
		Transaction::begin_read(self, false)
	}

	/// A snapshot reader: `end` freezes at begin and every later operation
	/// answers as of that instant, even across yields and repacks.
	pub fn begin_snapshot(&self) -> Result<Transaction> {
		Transaction::begin_read(self, true)
	}

	pub fn path(&self) -> &Path {
		&self.inner.path
	}

	pub fn uuid(&self) -> uuid::Uuid {
		uuid::Uuid::from_bytes(self.inner.state.lock().file.header.uuid)
	}

	pub fn generation(&self) -> u64 {
		self.inner.state.lock().file.header.generation
	}

	/// Live (non-tombstoned) keys.
	pub fn num_records(&self) -> u64 {
		self.inner.state.lock().file.header.num_records
	}

	pub fn num_commits(&self) -> u64 {
		self.inner.state.lock().file.header.num_commits
	}

	/// Logical size: the end of committed data.
	pub fn size(&self) -> u64 {
		self.inner.state.lock().file.header.current_size
	}

	pub fn dirty_size(&self) -> u64 {
		self.inner.state.lock().file.header.dirty_size
	}

	/// True once the reclaimable dead weight passes the minimum and exceeds
	/// a quarter of the file.
	pub fn should_repack(&self) -> bool {
		let st = self.inner.state.lock();
		let h = &st.file.header;
		h.dirty_size > MIN_REPACK_SIZE && h.current_size < 4 * h.dirty_size
	}

	pub fn sync(&self) -> Result<()> {
		self.inner.state.lock().file.map.flush_all()
	}

	/// Verifies checksums, chain ordering, the subsequence property of the
	/// upper levels, ancestor chains and the live-record count.
	pub fn check(&self) -> Result<()> {
		let mut st = self.inner.state.lock();
		acquire_shared(&self.inner, &mut st, !self.non_blocking)?;
		let result = recovery::verify(&st.file, &self.inner.order, &self.inner.csum);
		release_shared(&self.inner, &mut st);
		if let Err(e) = &result {
			self.inner.report(&format!("consistency check failed: {}", e));
		}
		result
	}

	/// Renders every committed record, for diagnostics.
	pub fn dump(&self) -> Result<String> {
		let mut st = self.inner.state.lock();
		acquire_shared(&self.inner, &mut st, !self.non_blocking)?;
		let result = (|| {
			let fs = &st.file;
			let h = &fs.header;
			let mut out = format!(
				"{} uuid={} generation={} records={} commits={} dirty={} size={}\n",
				self.inner.path.display(),
				uuid::Uuid::from_bytes(h.uuid),
				h.generation,
				h.num_records,
				h.num_commits,
				h.dirty_size,
				h.current_size,
			);
			let mut offset = DUMMY_OFFSET;
			while offset < fs.committed_size {
				let view = record::decode(fs.map.bytes(), offset, &self.inner.csum)?;
				out.push_str(&record::describe(&view));
				out.push('\n');
				offset = view.end();
			}
			Ok(out)
		})();
		release_shared(&self.inner, &mut st);
		result
	}

	/// Rebuilds the file without its dead records while readers and writers
	/// carry on. Only one repack may run at a time.
	pub fn repack(&self) -> Result<()> {
		repack::repack(self)
	}
}

/// Re-opens the file state when the path points at a different inode than
/// the held descriptor, which is how a repack by another process becomes
/// visible here.
pub(crate) fn refresh_identity(inner: &DbInner, st: &mut State) -> Result<()> {
	use std::os::unix::fs::MetadataExt;
	let on_disk = match std::fs::metadata(&inner.path) {
		Ok(meta) => meta,
		Err(_) => return Ok(()),
	};
	let held = st.file.map.file().metadata()?;
	if on_disk.ino() == held.ino() && on_disk.dev() == held.dev() {
		return Ok(());
	}
	log::debug!(target: "skipfile", "{} was replaced, reopening", inner.path.display());
	let mut opts = OpenOptions::new();
	opts.readonly = !st.file.map.writable();
	let id = st.next_id;
	let fresh = open_file_state(&inner.path, &opts, &inner.csum, &inner.order, id)?;
	st.next_id += 1;
	let old = std::mem::replace(&mut st.file, fresh);
	st.old.push(old);
	Ok(())
}

pub(crate) fn acquire_shared(
	inner: &DbInner,
	st: &mut MutexGuard<State>,
	block: bool,
) -> Result<()> {
	loop {
		if !st.writer {
			break;
		}
		if !block {
			return Err(Error::Locked);
		}
		inner.cond.wait(st);
	}
	if st.proc_lock.is_none() {
		refresh_identity(inner, st)?;
		if !lock::data_lock(st.file.map.file(), LockMode::Shared, block)? {
			return Err(Error::Locked);
		}
		st.proc_lock = Some(LockMode::Shared);
	}
	st.readers += 1;
	Ok(())
}

/// Shared acquisition pinned to a (possibly retired) file state: a frozen
/// snapshot re-locks the same file identity it started on.
pub(crate) fn acquire_shared_on(
	inner: &DbInner,
	st: &mut MutexGuard<State>,
	file_id: u64,
	block: bool,
) -> Result<()> {
	if file_id == st.file.id {
		return acquire_shared(inner, st, block);
	}
	loop {
		if !st.writer {
			break;
		}
		if !block {
			return Err(Error::Locked);
		}
		inner.cond.wait(st);
	}
	let fs = st.find_file(file_id)?;
	if !lock::data_lock(fs.map.file(), LockMode::Shared, block)? {
		return Err(Error::Locked);
	}
	st.readers += 1;
	Ok(())
}

pub(crate) fn release_shared(inner: &DbInner, st: &mut State) {
	st.readers -= 1;
	if st.readers == 0 && !st.writer && st.proc_lock == Some(LockMode::Shared) {
		let _ = lock::data_unlock(st.file.map.file());
		st.proc_lock = None;
	}
	inner.cond.notify_all();
}

pub(crate) fn acquire_excl(
	inner: &DbInner,
	st: &mut MutexGuard<State>,
	block: bool,
) -> Result<()> {
	loop {
		if !st.writer && st.readers == 0 {
			break;
		}
		if !block {
			return Err(Error::Locked);
		}
		inner.cond.wait(st);
	}
	refresh_identity(inner, st)?;
	if !lock::data_lock(st.file.map.file(), LockMode::Exclusive, block)? {
		return Err(Error::Locked);
	}
	st.proc_lock = Some(LockMode::Exclusive);
	st.writer = true;
	Ok(())
}

pub(crate) fn release_excl(inner: &DbInner, st: &mut State) {
	if st.proc_lock == Some(LockMode::Exclusive) {
		let _ = lock::data_unlock(st.file.map.file());
		st.proc_lock = None;
	}
	st.writer = false;
	inner.cond.notify_all();
}

#[cfg(test)]
mod test {
	use std::sync::Arc;
	use super::*;
	use crate::checksum::ChecksumKind;
	use crate::options::{Condition, ScanFlow, ScanOptions};

	struct TempDir(std::path::PathBuf);

	impl TempDir {
		fn new(name: &'static str) -> TempDir {
			env_logger::try_init().ok();
			let mut path = std::env::temp_dir();
			path.push("skipfile-test");
			path.push("db");
			path.push(name);
			if path.exists() {
				std::fs::remove_dir_all(&path).unwrap();
			}
			std::fs::create_dir_all(&path).unwrap();
			TempDir(path)
		}

		fn path(&self) -> std::path::PathBuf {
			self.0.join("db")
		}

		fn db(&self) -> Db {
			self.db_opts(|_| ())
		}

		fn db_opts<F: FnOnce(&mut OpenOptions)>(&self, f: F) -> Db {
			let mut opts = OpenOptions::new();
			opts.create = true;
			f(&mut opts);
			Db::open(self.path(), &opts).unwrap()
		}
	}

	impl Drop for TempDir {
		fn drop(&mut self) {
			if self.0.exists() {
				std::fs::remove_dir_all(&self.0).unwrap();
			}
		}
	}

	fn put(db: &Db, pairs: &[(&[u8], &[u8])]) {
		let mut txn = db.begin_write().unwrap();
		for (k, v) in pairs {
			txn.store(*k, Some(*v), Condition::Always).unwrap();
		}
		txn.commit().unwrap();
	}

	#[test]
	fn metadata_persists() {
		let dir = TempDir::new("metadata_persists");
		let uuid = {
			let db = dir.db();
			put(&db, &[(b"k", b"v")]);
			assert_eq!(db.generation(), 0);
			assert_eq!(db.num_records(), 1);
			assert_eq!(db.num_commits(), 1);
			assert!(db.size() > HEADER_SIZE + record::DUMMY_SIZE);
			db.uuid()
		};
		let db = dir.db();
		assert_eq!(db.uuid(), uuid);
		assert_eq!(db.num_records(), 1);
		assert_eq!(db.num_commits(), 1);
	}

	#[test]
	fn open_missing_without_create() {
		let dir = TempDir::new("open_missing_without_create");
		let opts = OpenOptions::new();
		assert!(matches!(Db::open(dir.path(), &opts), Err(Error::NotFound)));
	}

	#[test]
	fn same_process_opens_share_state() {
		let dir = TempDir::new("same_process_opens_share_state");
		let db1 = dir.db();
		let db2 = dir.db();
		assert!(Arc::ptr_eq(&db1.inner, &db2.inner));

		put(&db1, &[(b"k", b"v")]);
		let mut txn = db2.begin_read().unwrap();
		assert_eq!(txn.fetch(b"k").unwrap(), b"v");
		drop(txn);

		// A mismatched engine cannot share the open state.
		let mut opts = OpenOptions::new();
		opts.checksum = ChecksumKind::Null;
		assert!(matches!(Db::open(dir.path(), &opts), Err(Error::BadFormat(_))));

		// Dropping every handle retires the shared state.
		drop(db1);
		drop(db2);
		let db3 = dir.db();
		assert_eq!(db3.num_records(), 1);
	}

	#[test]
	fn checksum_engine_is_persistent() {
		let dir = TempDir::new("checksum_engine_is_persistent");
		{
			let db = dir.db_opts(|o| o.checksum = ChecksumKind::Null);
			put(&db, &[(b"k", b"v")]);
		}
		// Wrong engine: format error...
		let mut opts = OpenOptions::new();
		assert!(matches!(Db::open(dir.path(), &opts), Err(Error::BadFormat(_))));
		// ...unless verification is disabled.
		opts.no_verify = true;
		let db = Db::open(dir.path(), &opts).unwrap();
		let mut txn = db.begin_read().unwrap();
		assert_eq!(txn.fetch(b"k").unwrap(), b"v");
		drop(txn);
		drop(db);

		let db = dir.db_opts(|o| o.checksum = ChecksumKind::Null);
		let mut txn = db.begin_read().unwrap();
		assert_eq!(txn.fetch(b"k").unwrap(), b"v");
		drop(txn);
		db.check().unwrap();
	}

	#[test]
	fn custom_comparator() {
		let dir = TempDir::new("custom_comparator");
		let reversed: crate::options::Compare = Arc::new(|a: &[u8], b: &[u8]| b.cmp(a));
		{
			let db = dir.db_opts(|o| o.compare = Some(reversed.clone()));
			put(&db, &[(b"a", b"1"), (b"b", b"2"), (b"c", b"3")]);
			db.check().unwrap();

			let mut txn = db.begin_read().unwrap();
			let mut keys = Vec::new();
			txn.foreach(b"", &ScanOptions::default(), |k, _| {
				keys.push(k.to_vec());
				ScanFlow::Continue
			})
			.unwrap();
			assert_eq!(keys, vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
		}
		// The comparator choice is recorded; reopening without one fails.
		let mut opts = OpenOptions::new();
		assert!(matches!(Db::open(dir.path(), &opts), Err(Error::BadFormat(_))));
		opts.compare = Some(reversed);
		let db = Db::open(dir.path(), &opts).unwrap();
		let mut txn = db.begin_read().unwrap();
		assert_eq!(txn.fetch(b"b").unwrap(), b"2");
	}

	#[test]
	fn crash_recovery() {
		let dir = TempDir::new("crash_recovery");
		{
			let db = dir.db();
			put(&db, &[(b"good", b"data")]);
			let mut txn = db.begin_write().unwrap();
			txn.store(b"INVALID", Some(b"CRASHME"), Condition::Always).unwrap();
			// Simulated crash: locks drop, dirty flag and garbage stay.
			txn.abandon();
		}
		{
			let db = dir.db();
			db.check().unwrap();
			assert_eq!(db.num_records(), 1);
			let mut txn = db.begin_read().unwrap();
			assert!(matches!(txn.fetch(b"INVALID"), Err(Error::NotFound)));
			assert_eq!(txn.fetch(b"good").unwrap(), b"data");
		}
		// Recovery already ran; another open must not change a byte.
		let before = std::fs::read(dir.path()).unwrap();
		{
			let db = dir.db();
			db.check().unwrap();
		}
		let after = std::fs::read(dir.path()).unwrap();
		assert_eq!(before, after);
	}

	#[test]
	fn bulk_insert_delete_repack() {
		let dir = TempDir::new("bulk_insert_delete_repack");
		let db = dir.db();
		let mut txn = db.begin_write().unwrap();
		for i in 0..4096u32 {
			let key = format!("{:05}", i);
			txn.store(key.as_bytes(), Some(&i.to_le_bytes()), Condition::Always).unwrap();
		}
		txn.commit().unwrap();
		let mut txn = db.begin_write().unwrap();
		for i in (0..4096u32).step_by(2) {
			let key = format!("{:05}", i);
			txn.delete(key.as_bytes()).unwrap();
		}
		txn.commit().unwrap();

		db.check().unwrap();
		assert_eq!(db.num_records(), 2048);
		assert!(db.should_repack());

		let uuid = db.uuid();
		let generation = db.generation();
		db.repack().unwrap();
		db.check().unwrap();
		assert_eq!(db.num_records(), 2048);
		assert_eq!(db.generation(), generation + 1);
		assert_eq!(db.uuid(), uuid);
		assert_eq!(db.dirty_size(), 0);
		assert!(!db.should_repack());

		let mut txn = db.begin_read().unwrap();
		assert_eq!(txn.fetch(b"00001").unwrap(), 1u32.to_le_bytes());
		assert!(matches!(txn.fetch(b"00002"), Err(Error::NotFound)));
		let count = txn
			.foreach(b"", &ScanOptions::default(), |_, _| ScanFlow::Continue)
			.unwrap();
		assert_eq!(count, 2048);
		drop(txn);

		// Second repack attempt while one is running would be Locked; a
		// sequential one simply bumps the generation again.
		db.repack().unwrap();
		assert_eq!(db.generation(), generation + 2);
		db.check().unwrap();
	}

	#[test]
	fn repack_preserves_later_commits() {
		let dir = TempDir::new("repack_preserves_later_commits");
		let db = dir.db();
		put(&db, &[(b"a", b"1"), (b"b", b"2")]);
		let mut txn = db.begin_write().unwrap();
		txn.delete(b"a").unwrap();
		txn.store(b"b", Some(b"2b"), Condition::Always).unwrap();
		txn.store(b"c", Some(b"3"), Condition::Always).unwrap();
		txn.commit().unwrap();

		db.repack().unwrap();
		db.check().unwrap();
		let mut txn = db.begin_read().unwrap();
		assert!(matches!(txn.fetch(b"a"), Err(Error::NotFound)));
		assert_eq!(txn.fetch(b"b").unwrap(), b"2b");
		assert_eq!(txn.fetch(b"c").unwrap(), b"3");
		drop(txn);
		assert_eq!(db.num_records(), 2);
	}

	#[test]
	fn snapshot_survives_repack() {
		let dir = TempDir::new("snapshot_survives_repack");
		let db = dir.db();
		put(&db, &[(b"k", b"v1")]);

		let mut snap = db.begin_snapshot().unwrap();
		assert_eq!(snap.fetch(b"k").unwrap(), b"v1");
		snap.yield_lock().unwrap();

		let mut writer = db.begin_write().unwrap();
		writer.store(b"k", Some(b"v2"), Condition::Always).unwrap();
		writer.commit().unwrap();

		db.repack().unwrap();

		// The snapshot re-acquires against the file identity it started
		// on, even though the path now names the repacked file.
		assert_eq!(snap.fetch(b"k").unwrap(), b"v1");
		snap.commit().unwrap();

		let mut fresh = db.begin_read().unwrap();
		assert_eq!(fresh.fetch(b"k").unwrap(), b"v2");
		drop(fresh);
		db.check().unwrap();
	}

	#[test]
	fn should_repack_heuristic() {
		let dir = TempDir::new("should_repack_heuristic");
		let db = dir.db();
		assert!(!db.should_repack());
		put(&db, &[(b"k", b"v")]);
		let mut txn = db.begin_write().unwrap();
		txn.delete(b"k").unwrap();
		txn.commit().unwrap();
		// Dead weight exists but stays under the minimum rewrite size.
		assert!(db.dirty_size() > 0);
		assert!(!db.should_repack());
	}

	#[test]
	fn dump_lists_records() {
		let dir = TempDir::new("dump_lists_records");
		let db = dir.db();
		put(&db, &[(b"a", b"1")]);
		let dump = db.dump().unwrap();
		assert!(dump.contains("DUMMY"));
		assert!(dump.contains("ADD"));
		assert!(dump.contains("COMMIT"));
		// Keys render as hex.
		assert!(dump.contains("61"));
	}

	#[test]
	fn readonly_handle() {
		let dir = TempDir::new("readonly_handle");
		{
			let db = dir.db();
			put(&db, &[(b"k", b"v")]);
		}
		let mut opts = OpenOptions::new();
		opts.readonly = true;
		let db = Db::open(dir.path(), &opts).unwrap();
		assert!(matches!(db.begin_write(), Err(Error::ReadOnly)));
		let mut txn = db.begin_read().unwrap();
		assert_eq!(txn.fetch(b"k").unwrap(), b"v");
		drop(txn);
		db.check().unwrap();
	}

	#[test]
	fn error_sink_reports_failures() {
		let dir = TempDir::new("error_sink_reports_failures");
		let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
		let hits2 = hits.clone();
		let db = dir.db_opts(move |o| {
			o.error_sink = Some(Arc::new(move |_msg: &str| {
				hits2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
			}));
		});
		put(&db, &[(b"k", b"v")]);
		db.check().unwrap();
		assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 0);
	}
}
