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

// Online compaction.
//
// Phase one copies every live pair into `<name>.NEW` under a frozen
// snapshot, yielding as it goes so writers keep committing to the source.
// Phase two re-enters the source exclusively, replays the commit batches
// that landed after the snapshot end (sequential record order is commit
// order), then renames the destination over the source and installs the
// fresh file state. Snapshots still in flight keep the retired state, and
// with it the pre-rename identity, until the database closes.

use std::path::{Path, PathBuf};
use crate::db::{self, Db};
use crate::error::{Error, Result};
use crate::options::{Condition, OpenOptions, ScanFlow, ScanOptions};
use crate::record;

pub fn repack(db: &Db) -> Result<()> {
	if db.readonly {
		return Err(Error::ReadOnly);
	}
	{
		let mut st = db.inner.state.lock();
		if st.repacking {
			return Err(Error::Locked);
		}
		st.repacking = true;
	}
	let result = run(db);
	db.inner.state.lock().repacking = false;
	result
}

fn run(db: &Db) -> Result<()> {
	let inner = &db.inner;
	let mut new_path = inner.path.clone().into_os_string();
	new_path.push(".NEW");
	let new_path = PathBuf::from(new_path);

	let (uuid, generation) = {
		let st = inner.state.lock();
		(st.file.header.uuid, st.file.header.generation)
	};
	log::info!(
		target: "skipfile",
		"Repacking {} into generation {}",
		inner.path.display(),
		generation + 1,
	);

	let mut dest_opts = OpenOptions::new();
	dest_opts.create = true;
	dest_opts.create_exclusive = true;
	// One explicit flush before the rename instead of one per commit.
	dest_opts.no_sync = true;
	dest_opts.checksum = inner.csum.kind().clone();
	dest_opts.compare = inner.order.custom.clone();
	dest_opts.initial_uuid = Some(uuid);
	dest_opts.initial_generation = generation + 1;
	let dest = Db::open(&new_path, &dest_opts)?;

	let result = copy_and_swap(db, &dest, &new_path);
	if result.is_err() {
		let _ = std::fs::remove_file(&new_path);
	}
	result
}

fn copy_and_swap(db: &Db, dest: &Db, new_path: &Path) -> Result<()> {
	let inner = &db.inner;

	// Phase one: copy the snapshot image. Writers may commit to the source
	// the whole time; the scan yields its shared lock as it goes.
	let mut wd = dest.begin_write()?;
	let mut snap = db.begin_snapshot()?;
	let base = snap.snapshot_end();
	let mut copy_error: Option<Error> = None;
	let copied = snap.foreach(b"", &ScanOptions::default(), |key, val| {
		match wd.store(key, Some(val), Condition::Always) {
			Ok(()) => ScanFlow::Continue,
			Err(e) => {
				copy_error = Some(e);
				ScanFlow::Stop
			}
		}
	})?;
	snap.commit()?;
	if let Some(e) = copy_error {
		return Err(e);
	}
	log::debug!(target: "skipfile", "Copied {} live records, replaying from {}", copied, base);

	// Phase two: freeze the source and catch up.
	let mut st = inner.state.lock();
	db::acquire_excl(inner, &mut st, true)?;
	let replayed = (|| {
		let fs = &st.file;
		let mut off = base;
		while off < fs.committed_size {
			let v = record::decode(fs.map.bytes(), off, &inner.csum)?;
			match v.rtype {
				record::RT_ADD
				| record::RT_FATADD
				| record::RT_REPLACE
				| record::RT_FATREPLACE => {
					wd.store(v.key, Some(v.val), Condition::Always)?;
				}
				record::RT_DELETE => {
					let target = record::decode(fs.map.bytes(), v.ancestor, &inner.csum)?;
					wd.store(target.key, None, Condition::Always)?;
				}
				record::RT_COMMIT => (),
				_ => {
					return Err(Error::BadFormat(format!(
						"unexpected record {} at {} during replay",
						record::type_name(v.rtype),
						off
					)))
				}
			}
			off = v.end();
		}
		Ok(())
	})();
	if let Err(e) = replayed {
		db::release_excl(inner, &mut st);
		return Err(e);
	}
	let finished = wd.commit().and_then(|_| dest.sync()).and_then(|_| {
		std::fs::rename(new_path, &inner.path)?;
		Ok(())
	});
	if let Err(e) = finished {
		db::release_excl(inner, &mut st);
		return Err(e);
	}

	// Install the fresh state; the retired one stays alive for any frozen
	// snapshot still bound to it.
	let swap = (|| {
		let id = st.next_id;
		let fresh = db::open_file_state(
			&inner.path,
			&OpenOptions::new(),
			&inner.csum,
			&inner.order,
			id,
		)?;
		st.next_id += 1;
		let old = std::mem::replace(&mut st.file, fresh);
		let _ = crate::lock::data_unlock(old.map.file());
		st.old.push(old);
		st.file.header.repack_size = st.file.header.current_size;
		st.file.write_header(&inner.csum)?;
		st.file.flush_header(!db.no_sync)?;
		Ok(())
	})();
	db::release_excl(inner, &mut st);
	let generation = st.file.header.generation;
	drop(st);
	if swap.is_ok() {
		log::info!(
			target: "skipfile",
			"Repacked {} to generation {}",
			inner.path.display(),
			generation,
		);
	}
	swap
}
