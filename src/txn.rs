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

// Transactions.
//
// A write transaction owns the exclusive data lock and appends records;
// its `end` is the write position, so it reads its own uncommitted data.
// Read transactions hold the shared lock with `end` at the committed size,
// refreshed whenever the lock is re-acquired after a yield. Snapshot
// readers freeze `end` at begin: every fetch resolves through ancestor
// links back to the newest record below the frozen end, so concurrent
// commits never change an answer.
//
// Nothing is ever written in place except the level-0 publish slots and
// single upper-level pointers; everything else is append-only, made
// durable by the commit flush and made visible by the header update that
// moves `current_size`.

use parking_lot::MutexGuard;
use crate::checksum::Checksum;
use crate::db::{self, Db, FileState, State};
use crate::error::{Error, Result};
use crate::options::{Condition, KeyOrder, ScanFlow, ScanOptions};
use crate::record::{self, NewRecord};
use crate::recovery;
use crate::skiplist::{self, Loc};

const YIELD_EVERY: u64 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
	Write,
	Read,
	Snapshot,
}

#[derive(Default)]
pub(crate) struct Counters {
	pub records: i64,
	pub dirty: u64,
	pub maxlevel: u8,
}

pub struct Transaction<'a> {
	db: &'a Db,
	kind: Kind,
	/// Offsets at or past this are invisible to the transaction.
	end: u64,
	/// Committed size at begin; the COMMIT record's start offset.
	base: u64,
	file_id: u64,
	active: bool,
	finished: bool,
	loc: Option<Loc>,
	counters: Counters,
	visits: u64,
}

impl<'a> Transaction<'a> {
	pub(crate) fn begin_write(db: &'a Db) -> Result<Transaction<'a>> {
		if db.readonly {
			return Err(Error::ReadOnly);
		}
		let mut st = db.inner.state.lock();
		db::acquire_excl(&db.inner, &mut st, !db.non_blocking)?;
		if !st.file.map.writable() {
			db::release_excl(&db.inner, &mut st);
			return Err(Error::ReadOnly);
		}
		let begun = (|| {
			let fs = &mut st.file;
			if fs.written_size != fs.committed_size {
				return Err(Error::Internal("stray uncommitted bytes".into()));
			}
			fs.header.set_dirty(true);
			fs.write_header(&db.inner.csum)?;
			fs.flush_header(!db.no_sync)?;
			Ok((fs.committed_size, fs.id))
		})();
		match begun {
			Ok((base, file_id)) => Ok(Transaction {
				db,
				kind: Kind::Write,
				end: base,
				base,
				file_id,
				active: true,
				finished: false,
				loc: None,
				counters: Default::default(),
				visits: 0,
			}),
			Err(e) => {
				db::release_excl(&db.inner, &mut st);
				Err(e)
			}
		}
	}

	pub(crate) fn begin_read(db: &'a Db, snapshot: bool) -> Result<Transaction<'a>> {
		let mut st = db.inner.state.lock();
		db::acquire_shared(&db.inner, &mut st, !db.non_blocking)?;
		let fs = &st.file;
		Ok(Transaction {
			db,
			kind: if snapshot { Kind::Snapshot } else { Kind::Read },
			end: fs.committed_size,
			base: fs.committed_size,
			file_id: fs.id,
			active: true,
			finished: false,
			loc: None,
			counters: Default::default(),
			visits: 0,
		})
	}

	/// Re-acquires the lock after a yield. Plain readers move up to the
	/// latest commit; snapshots rebind to the same file identity with
	/// `end` untouched.
	fn ensure_active(&mut self, st: &mut MutexGuard<State>) -> Result<()> {
		if self.active {
			return Ok(());
		}
		match self.kind {
			Kind::Write => Err(Error::Internal("write transaction lost its lock".into())),
			Kind::Read => {
				db::acquire_shared(&self.db.inner, st, !self.db.non_blocking)?;
				self.active = true;
				self.end = st.file.committed_size;
				self.file_id = st.file.id;
				Ok(())
			}
			Kind::Snapshot => {
				db::acquire_shared_on(&self.db.inner, st, self.file_id, !self.db.non_blocking)?;
				self.active = true;
				Ok(())
			}
		}
	}

	pub(crate) fn snapshot_end(&self) -> u64 {
		self.end
	}

	/// Stores `value` under `key`; a `None` value is a delete. Conditional
	/// failures append nothing.
	pub fn store(&mut self, key: &[u8], value: Option<&[u8]>, cond: Condition) -> Result<()> {
		if self.kind != Kind::Write {
			return Err(Error::ReadOnly);
		}
		let mut st = self.db.inner.state.lock();
		let mut cached = self.loc.take();
		let result = store_inner(
			self.db,
			&mut st,
			self.end,
			&mut cached,
			&mut self.counters,
			key,
			value,
			cond,
		);
		self.loc = cached;
		match result {
			Ok(end) => {
				self.end = end;
				Ok(())
			}
			Err(e) => Err(e),
		}
	}

	pub fn delete(&mut self, key: &[u8]) -> Result<()> {
		self.store(key, None, Condition::Always)
	}

	pub fn fetch(&mut self, key: &[u8]) -> Result<Vec<u8>> {
		let mut st = self.db.inner.state.lock();
		self.ensure_active(&mut st)?;
		let inner = &self.db.inner;
		let fs = st.find_file(self.file_id)?;
		let loc = skiplist::find_loc(fs, &inner.order, &inner.csum, self.end, key, self.loc.take())?;
		let result = if !loc.exact {
			Err(Error::NotFound)
		} else {
			match resolve_visible(fs, &inner.csum, &loc, self.end)? {
				None => Err(Error::NotFound),
				Some(off) => skiplist::view(fs, &inner.csum, off).map(|v| v.val.to_vec()),
			}
		};
		self.loc = Some(loc);
		result
	}

	/// The first pair strictly after `after`, or the first pair of the
	/// database when `after` is `None`. `Ok(None)` once exhausted.
	pub fn fetch_next(&mut self, after: Option<&[u8]>) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
		let mut st = self.db.inner.state.lock();
		self.ensure_active(&mut st)?;
		let inner = &self.db.inner;
		let fs = st.find_file(self.file_id)?;
		let mut loc = match after {
			Some(key) => {
				skiplist::find_loc(fs, &inner.order, &inner.csum, self.end, key, self.loc.take())?
			}
			None => Loc::start(fs.id, self.end),
		};
		let pair = iter_step(fs, &inner.order, &inner.csum, self.end, &mut loc)?;
		self.loc = Some(loc);
		Ok(pair)
	}

	/// Visits every live pair whose key starts with `prefix`, in key
	/// order. The callback stops the scan by returning `ScanFlow::Stop`.
	/// Returns the number of pairs visited. Readers yield the lock every
	/// 1024 callbacks unless configured otherwise.
	pub fn foreach<F: FnMut(&[u8], &[u8]) -> ScanFlow>(
		&mut self,
		prefix: &[u8],
		opts: &ScanOptions,
		mut f: F,
	) -> Result<u64> {
		let mut count = 0u64;
		let mut loc: Option<Loc> = None;
		let mut first = true;
		loop {
			// Step under the state lock; call back outside it.
			let pair = {
				let mut st = self.db.inner.state.lock();
				self.ensure_active(&mut st)?;
				let inner = &self.db.inner;
				let fs = st.find_file(self.file_id)?;
				let mut l = match loc.take() {
					Some(l) => l,
					None if prefix.is_empty() => Loc::start(fs.id, self.end),
					None => skiplist::find_loc(
						fs,
						&inner.order,
						&inner.csum,
						self.end,
						prefix,
						None,
					)?,
				};
				let pair = if first && l.exact && !opts.skip_exact {
					match resolve_visible(fs, &inner.csum, &l, self.end)? {
						Some(off) => {
							let v = skiplist::view(fs, &inner.csum, off)?;
							Some((v.key.to_vec(), v.val.to_vec()))
						}
						None => iter_step(fs, &inner.order, &inner.csum, self.end, &mut l)?,
					}
				} else {
					iter_step(fs, &inner.order, &inner.csum, self.end, &mut l)?
				};
				loc = Some(l);
				pair
			};
			first = false;
			let (key, val) = match pair {
				Some(pair) => pair,
				None => break,
			};
			if !prefix.is_empty() && !key.starts_with(prefix) {
				break;
			}
			if let Some(filter) = &opts.filter {
				if !filter(&key, &val) {
					continue;
				}
			}
			if self.kind != Kind::Write
				&& !self.db.no_yield
				&& (opts.always_yield || (self.visits > 0 && self.visits % YIELD_EVERY == 0))
			{
				self.release_read();
			}
			self.visits += 1;
			count += 1;
			if f(&key, &val) == ScanFlow::Stop {
				break;
			}
		}
		Ok(count)
	}

	pub fn cursor(&mut self, prefix: &[u8]) -> Cursor<'_, 'a> {
		Cursor { txn: self, prefix: prefix.to_vec(), loc: None, first: true, done: false }
	}

	/// Releases the lock until the next operation. Snapshots keep their
	/// frozen `end`; plain readers refresh on resume. Write transactions
	/// cannot yield.
	pub fn yield_lock(&mut self) -> Result<()> {
		if self.kind == Kind::Write {
			return Err(Error::Locked);
		}
		self.release_read();
		Ok(())
	}

	fn release_read(&mut self) {
		if !self.active {
			return;
		}
		let mut st = self.db.inner.state.lock();
		db::release_shared(&self.db.inner, &mut st);
		self.active = false;
	}

	pub fn commit(mut self) -> Result<()> {
		let result = match self.kind {
			Kind::Write => self.commit_write(),
			_ => {
				self.release_read();
				Ok(())
			}
		};
		self.finished = true;
		result
	}

	pub fn abort(mut self) -> Result<()> {
		let result = match self.kind {
			Kind::Write => self.abort_write(),
			_ => {
				self.release_read();
				Ok(())
			}
		};
		self.finished = true;
		result
	}

	fn commit_write(&mut self) -> Result<()> {
		let inner = &self.db.inner;
		let mut st = inner.state.lock();
		let result = (|| {
			let no_sync = self.db.no_sync;
			let fs = &mut st.file;
			if fs.id != self.file_id {
				return Err(Error::Internal("file replaced under a write transaction".into()));
			}
			if fs.written_size == self.base {
				// Nothing was appended; just drop the dirty flag.
				fs.header.set_dirty(false);
				fs.write_header(&inner.csum)?;
				fs.flush_header(!no_sync)?;
				return Ok(());
			}
			let off = fs.written_size;
			append(fs, &inner.csum, off, record::RT_COMMIT, 0, self.base, b"", b"", &[])?;
			fs.written_size = off + record::COMMIT_SIZE;
			if !no_sync {
				fs.map.flush_range(self.base, fs.written_size - self.base)?;
			}
			let header = &mut fs.header;
			header.current_size = fs.written_size;
			header.num_records = (header.num_records as i64 + self.counters.records) as u64;
			header.num_commits += 1;
			header.dirty_size += self.counters.dirty;
			if self.counters.maxlevel as u32 > header.maxlevel {
				header.maxlevel = self.counters.maxlevel as u32;
			}
			header.set_dirty(false);
			fs.write_header(&inner.csum)?;
			fs.flush_header(!no_sync)?;
			fs.committed_size = fs.written_size;
			log::debug!(
				target: "skipfile",
				"Committed {} bytes, {} live records",
				fs.written_size - self.base,
				fs.header.num_records,
			);
			Ok(())
		})();
		db::release_excl(inner, &mut st);
		self.active = false;
		result
	}

	/// Runs the recovery sweep bounded by the transaction start, leaving
	/// the file indistinguishable from its state before begin.
	fn abort_write(&mut self) -> Result<()> {
		let inner = &self.db.inner;
		let mut st = inner.state.lock();
		let result = (|| {
			let fs = &mut st.file;
			if fs.id != self.file_id {
				return Err(Error::Internal("file replaced under a write transaction".into()));
			}
			if fs.written_size != self.base {
				recovery::sweep(fs, &inner.csum, self.base)?;
				fs.written_size = self.base;
			}
			fs.header.set_dirty(false);
			fs.write_header(&inner.csum)?;
			fs.flush_header(!self.db.no_sync)?;
			Ok(())
		})();
		db::release_excl(inner, &mut st);
		self.active = false;
		result
	}

	/// Drops the transaction as a crashed process would: locks released,
	/// dirty flag and appended bytes left in place.
	#[cfg(test)]
	pub(crate) fn abandon(mut self) {
		let mut st = self.db.inner.state.lock();
		match self.kind {
			Kind::Write => db::release_excl(&self.db.inner, &mut st),
			_ => {
				if self.active {
					db::release_shared(&self.db.inner, &mut st);
				}
			}
		}
		drop(st);
		self.active = false;
		self.finished = true;
	}
}

impl Drop for Transaction<'_> {
	fn drop(&mut self) {
		if self.finished {
			return;
		}
		match self.kind {
			Kind::Write => {
				if let Err(e) = self.abort_write() {
					log::warn!(target: "skipfile", "Abort on drop failed: {}", e);
				}
			}
			_ => self.release_read(),
		}
		self.finished = true;
	}
}

/// Ordered traversal with in-place update. Finalised by drop; the borrow
/// it holds on the transaction ends then, unblocking commit or abort.
pub struct Cursor<'t, 'db> {
	txn: &'t mut Transaction<'db>,
	prefix: Vec<u8>,
	loc: Option<Loc>,
	first: bool,
	done: bool,
}

impl<'t, 'db> Cursor<'t, 'db> {
	pub fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
		if self.done {
			return Ok(None);
		}
		let pair = {
			let mut st = self.txn.db.inner.state.lock();
			self.txn.ensure_active(&mut st)?;
			let inner = &self.txn.db.inner;
			let end = self.txn.end;
			let fs = st.find_file(self.txn.file_id)?;
			let mut l = match self.loc.take() {
				Some(l) => l,
				None if self.prefix.is_empty() => Loc::start(fs.id, end),
				None => skiplist::find_loc(fs, &inner.order, &inner.csum, end, &self.prefix, None)?,
			};
			let pair = if self.first && l.exact {
				match resolve_visible(fs, &inner.csum, &l, end)? {
					Some(off) => {
						let v = skiplist::view(fs, &inner.csum, off)?;
						Some((v.key.to_vec(), v.val.to_vec()))
					}
					None => iter_step(fs, &inner.order, &inner.csum, end, &mut l)?,
				}
			} else {
				iter_step(fs, &inner.order, &inner.csum, end, &mut l)?
			};
			self.loc = Some(l);
			pair
		};
		self.first = false;
		match pair {
			Some((key, val)) if self.prefix.is_empty() || key.starts_with(&self.prefix) => {
				Ok(Some((key, val)))
			}
			_ => {
				self.done = true;
				Ok(None)
			}
		}
	}

	/// Replaces the value under the cursor. Write transactions only.
	pub fn replace(&mut self, value: &[u8]) -> Result<()> {
		if self.txn.kind != Kind::Write {
			return Err(Error::ReadOnly);
		}
		let key = match &self.loc {
			Some(l) if l.exact => l.key.clone(),
			_ => return Err(Error::BadUsage("cursor is not positioned on a record".into())),
		};
		let mut st = self.txn.db.inner.state.lock();
		let mut cached = self.loc.take();
		let result = store_inner(
			self.txn.db,
			&mut st,
			self.txn.end,
			&mut cached,
			&mut self.txn.counters,
			&key,
			Some(value),
			Condition::Always,
		);
		self.loc = cached;
		match result {
			Ok(end) => {
				self.txn.end = end;
				Ok(())
			}
			Err(e) => Err(e),
		}
	}
}

fn append(
	fs: &mut FileState,
	csum: &Checksum,
	off: u64,
	rtype: u8,
	level: u8,
	ancestor: u64,
	key: &[u8],
	val: &[u8],
	ptrs: &[u64],
) -> Result<u64> {
	let size = record::total_size(rtype, level, key.len() as u64, val.len() as u64);
	fs.map.ensure(off + size)?;
	let rec = NewRecord { rtype, level, ancestor, key, val };
	record::encode(fs.map.slice_mut(off, size)?, &rec, ptrs, csum)?;
	log::trace!(
		target: "skipfile",
		"Appended {} at {}, {} bytes",
		record::type_name(rtype),
		off,
		size,
	);
	Ok(size)
}

/// The full store protocol: position, conditionals, then one of insert,
/// replace, tombstone-restore or delete, each finishing with the level-0
/// publish. Returns the new write position.
fn store_inner(
	db: &Db,
	st: &mut State,
	end: u64,
	cached: &mut Option<Loc>,
	counters: &mut Counters,
	key: &[u8],
	value: Option<&[u8]>,
	cond: Condition,
) -> Result<u64> {
	let inner = &db.inner;
	let fs = &mut st.file;
	let mut loc = skiplist::find_loc(fs, &inner.order, &inner.csum, end, key, cached.take())?;
	let exists = loc.exact && loc.deleted == 0;
	match cond {
		Condition::IfExist if !exists => {
			*cached = Some(loc);
			return Err(Error::NotFound);
		}
		Condition::IfNotExist if exists => {
			*cached = Some(loc);
			return Err(Error::Exists);
		}
		_ => (),
	}

	let value = match value {
		Some(value) => value,
		None => {
			// Delete: a 24-byte tombstone spliced in front of its target.
			if !exists {
				*cached = Some(loc);
				return Err(Error::NotFound);
			}
			let (tlevel, tsize) = {
				let target = skiplist::view(fs, &inner.csum, loc.offset)?;
				(target.level, target.size)
			};
			let off = fs.written_size;
			append(fs, &inner.csum, off, record::RT_DELETE, 0, loc.offset, b"", b"", &[])?;
			skiplist::set_level0(fs, &inner.csum, loc.backloc[0], off)?;
			fs.written_size = off + record::DELETE_SIZE;
			counters.records -= 1;
			// The target and the tombstone are both dead weight for the
			// next repack.
			counters.dirty += tsize + record::DELETE_SIZE;
			for slot in 2..=(tlevel as usize) {
				loc.backloc[slot] = loc.offset;
			}
			loc.deleted = off;
			loc.end = fs.written_size;
			*cached = Some(loc);
			return Ok(fs.written_size);
		}
	};

	if loc.exact {
		// Replace, over a live record or over a tombstone. The new record
		// takes over the superseded record's place in every chain it can:
		// its pointer slots are copied wholesale and the level-0 publish
		// swings the predecessor over.
		let (tlevel, tsize, tptrs) = {
			let target = skiplist::view(fs, &inner.csum, loc.offset)?;
			let ptrs: Vec<u64> = (0..target.nptrs()).map(|i| target.ptr(i)).collect();
			(target.level, target.size, ptrs)
		};
		let ancestor = if loc.deleted != 0 { loc.deleted } else { loc.offset };
		let rtype = record::store_kind(true, key.len(), value.len() as u64);
		let off = fs.written_size;
		let size = append(fs, &inner.csum, off, rtype, tlevel, ancestor, key, value, &tptrs)?;
		skiplist::set_level0(fs, &inner.csum, loc.backloc[0], off)?;
		fs.written_size = off + size;
		if loc.deleted != 0 {
			// Both dead records were accounted when the key was deleted.
			counters.records += 1;
		} else {
			counters.dirty += tsize + 8;
		}
		for slot in 2..=(tlevel as usize) {
			loc.backloc[slot] = loc.offset;
		}
		loc.offset = off;
		loc.deleted = 0;
		loc.end = fs.written_size;
	} else {
		// Fresh insert at a random level.
		let level = skiplist::random_level();
		let rtype = record::store_kind(false, key.len(), value.len() as u64);
		let off = fs.written_size;
		let mut ptrs = vec![0u64; level as usize + 1];
		let succ = {
			let pred = skiplist::view(fs, &inner.csum, loc.backloc[0])?;
			skiplist::advance0(pred.ptr(0), pred.ptr(1), end)
		};
		ptrs[0] = succ;
		ptrs[1] = succ;
		for slot in 2..=(level as usize) {
			let pred = skiplist::view(fs, &inner.csum, loc.backloc[slot])?;
			ptrs[slot] = pred.ptr(slot);
		}
		let size = append(fs, &inner.csum, off, rtype, level, 0, key, value, &ptrs)?;
		skiplist::set_level0(fs, &inner.csum, loc.backloc[0], off)?;
		for slot in 2..=(level as usize) {
			skiplist::set_level(fs, &inner.csum, loc.backloc[slot], slot, off)?;
		}
		fs.written_size = off + size;
		counters.records += 1;
		if level > counters.maxlevel {
			counters.maxlevel = level;
		}
		loc.offset = off;
		loc.exact = true;
		loc.deleted = 0;
		for slot in 2..=(level as usize) {
			loc.backloc[slot] = off;
		}
		loc.end = fs.written_size;
	}
	*cached = Some(loc);
	Ok(fs.written_size)
}

/// Snapshot visibility: walk ancestors below `end`; a tombstone below the
/// horizon means the key did not exist at that instant.
fn resolve_visible(fs: &FileState, csum: &Checksum, loc: &Loc, end: u64) -> Result<Option<u64>> {
	let mut off = if loc.deleted != 0 { loc.deleted } else { loc.offset };
	loop {
		if off == 0 {
			return Ok(None);
		}
		let v = skiplist::view(fs, csum, off)?;
		if off >= end {
			off = v.ancestor;
			continue;
		}
		return if v.is_delete() { Ok(None) } else { Ok(Some(off)) };
	}
}

/// One visible pair in chain order, skipping tombstones and anything the
/// snapshot cannot see.
fn iter_step(
	fs: &FileState,
	order: &KeyOrder,
	csum: &Checksum,
	end: u64,
	loc: &mut Loc,
) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
	loop {
		if !skiplist::advance_loc(fs, order, csum, end, loc)? {
			return Ok(None);
		}
		match resolve_visible(fs, csum, loc, end)? {
			None => continue,
			Some(off) => {
				let v = skiplist::view(fs, csum, off)?;
				return Ok(Some((v.key.to_vec(), v.val.to_vec())));
			}
		}
	}
}
