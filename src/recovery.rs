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

// Dirty-shutdown recovery and structural verification.
//
// An interrupted transaction leaves two traces: appended bytes past
// `current_size`, and pointer slots rewritten in place to reference them.
// The appended bytes are unreachable once every such slot is zeroed, so
// recovery sweeps each chain from the top level down and clears every slot
// at or past the committed end. One level-0 slot of each pair always still
// names the last committed successor, so the chain survives intact; a
// zeroed upper slot merely truncates a skip chain until the next repack
// rebuilds it. Abort runs the same sweep bounded by the transaction start.

use std::cmp::Ordering;
use std::collections::HashSet;
use crate::checksum::Checksum;
use crate::db::FileState;
use crate::error::{Error, Result};
use crate::header::{Header, HEADER_SIZE};
use crate::options::KeyOrder;
use crate::record;
use crate::skiplist::{self, DUMMY_OFFSET, MAX_LEVEL};

/// Zeroes every pointer slot referencing `end` or beyond, recomputing the
/// head checksum of each record it repairs. Idempotent.
pub fn sweep(fs: &mut FileState, csum: &Checksum, end: u64) -> Result<()> {
	// Structure is read without verification here: the slot being repaired
	// and its checksum may have been half-written at the crash instant.
	let loose = csum.unverified();
	let max_steps = end / 8 + 64;

	for slot in (2..=MAX_LEVEL).rev() {
		let mut cur = DUMMY_OFFSET;
		let mut steps = 0u64;
		loop {
			scrub(fs, &loose, cur, end)?;
			let next = {
				let v = record::decode(fs.map.bytes(), cur, &loose)?;
				if slot >= v.nptrs() {
					0
				} else {
					v.ptr(slot)
				}
			};
			if next == 0 {
				break;
			}
			cur = next;
			steps += 1;
			if steps > max_steps {
				return Err(Error::BadFormat(format!("cycle in level {} chain", slot)));
			}
		}
	}

	let mut cur = DUMMY_OFFSET;
	let mut steps = 0u64;
	loop {
		scrub(fs, &loose, cur, end)?;
		let raw = {
			let v = record::decode(fs.map.bytes(), cur, &loose)?;
			if v.nptrs() < 2 {
				return Err(Error::BadFormat(format!("chain through slotless record at {}", cur)));
			}
			skiplist::advance0(v.ptr(0), v.ptr(1), end)
		};
		if raw == 0 {
			break;
		}
		let v = record::decode(fs.map.bytes(), raw, &loose)?;
		cur = if v.is_delete() { v.ancestor } else { raw };
		steps += 1;
		if steps > max_steps {
			return Err(Error::BadFormat("cycle in level 0 chain".into()));
		}
	}
	Ok(())
}

fn scrub(fs: &mut FileState, loose: &Checksum, off: u64, end: u64) -> Result<()> {
	let bad: Vec<u64> = {
		let v = record::decode(fs.map.bytes(), off, loose)?;
		(0..v.nptrs())
			.filter(|i| v.ptr(*i) >= end)
			.map(|i| v.slot_offset(i))
			.collect()
	};
	if bad.is_empty() {
		return Ok(());
	}
	log::debug!(
		target: "skipfile",
		"Clearing {} dangling slots of record at {}",
		bad.len(),
		off,
	);
	for slot_off in bad {
		fs.map.write_u64(slot_off, 0)?;
	}
	record::rewrite_head(fs.map.bytes_mut()?, off, loose)
}

/// Full recovery: sweep back to the committed end, re-verify what
/// survived, then clear the dirty flag.
pub fn recover(fs: &mut FileState, csum: &Checksum, order: &KeyOrder, sync: bool) -> Result<()> {
	let end = fs.header.current_size;
	log::info!(
		target: "skipfile",
		"Recovering after dirty shutdown, committed end {}",
		end,
	);
	fs.committed_size = end;
	fs.written_size = end;
	sweep(fs, csum, end)?;
	verify(fs, order, csum)?;
	if sync {
		fs.map.flush_all()?;
	}
	fs.header.set_dirty(false);
	fs.write_header(csum)?;
	fs.flush_header(sync)?;
	Ok(())
}

/// Structural invariants at rest: header checksum, strictly increasing
/// level-0 keys, record checksums, ancestor chains, the subsequence
/// property of every upper chain and the live-record count.
pub fn verify(fs: &FileState, order: &KeyOrder, csum: &Checksum) -> Result<()> {
	Header::decode(fs.map.slice(0, HEADER_SIZE)?, csum)?;
	let end = fs.committed_size;
	let max_steps = end / 8 + 64;

	let mut keys: HashSet<&[u8]> = HashSet::new();
	let mut live = 0u64;
	let mut curv = skiplist::view(fs, csum, DUMMY_OFFSET)?;
	let mut prev_key: Option<&[u8]> = None;
	let mut steps = 0u64;
	loop {
		let raw = skiplist::advance0(curv.ptr(0), curv.ptr(1), end);
		if raw == 0 {
			break;
		}
		if raw >= end {
			return Err(Error::BadFormat(format!("chain reaches {} past committed end {}", raw, end)));
		}
		let n = skiplist::node(fs, csum, raw)?;
		if let Some(prev) = prev_key {
			if order.cmp(prev, n.view.key) != Ordering::Less {
				return Err(Error::BadFormat(format!("key order violated at {}", raw)));
			}
		}
		ancestors(fs, csum, order, if n.deleted != 0 { n.deleted } else { n.view.offset })?;
		if n.deleted == 0 {
			live += 1;
		}
		keys.insert(n.view.key);
		prev_key = Some(n.view.key);
		curv = n.view;
		steps += 1;
		if steps > max_steps {
			return Err(Error::BadFormat("cycle in level 0 chain".into()));
		}
	}
	if live != fs.header.num_records {
		return Err(Error::BadFormat(format!(
			"{} live records on the chain, header counts {}",
			live, fs.header.num_records
		)));
	}

	let top = (fs.header.maxlevel as usize).min(MAX_LEVEL);
	for slot in 2..=top {
		let mut curv = skiplist::view(fs, csum, DUMMY_OFFSET)?;
		let mut prev_key: Option<&[u8]> = None;
		let mut steps = 0u64;
		loop {
			if slot >= curv.nptrs() {
				return Err(Error::BadFormat(format!("level {} chain entered a short record", slot)));
			}
			let next = curv.ptr(slot);
			if next == 0 {
				break;
			}
			if next >= end {
				return Err(Error::BadFormat(format!(
					"level {} chain reaches {} past committed end {}",
					slot, next, end
				)));
			}
			let nv = skiplist::view(fs, csum, next)?;
			if !record::has_ptrs(nv.rtype) || (nv.level as usize) < slot {
				return Err(Error::BadFormat(format!("bad level {} link into {}", slot, next)));
			}
			if let Some(prev) = prev_key {
				if order.cmp(prev, nv.key) != Ordering::Less {
					return Err(Error::BadFormat(format!(
						"level {} key order violated at {}",
						slot, next
					)));
				}
			}
			if !keys.contains(nv.key) {
				return Err(Error::BadFormat(format!(
					"level {} chain key at {} missing from level 0",
					slot, next
				)));
			}
			prev_key = Some(nv.key);
			curv = nv;
			steps += 1;
			if steps > max_steps {
				return Err(Error::BadFormat(format!("cycle in level {} chain", slot)));
			}
		}
	}
	Ok(())
}

/// Every REPLACE/DELETE must link a strictly older record of the same key,
/// bottoming out at the originating ADD.
fn ancestors(fs: &FileState, csum: &Checksum, order: &KeyOrder, off: u64) -> Result<()> {
	let mut v = skiplist::view(fs, csum, off)?;
	loop {
		match v.rtype {
			record::RT_ADD | record::RT_FATADD => return Ok(()),
			record::RT_REPLACE | record::RT_FATREPLACE | record::RT_DELETE => {
				let anc = v.ancestor;
				if anc == 0 || anc >= v.offset {
					return Err(Error::BadFormat(format!(
						"record at {} has ancestor {}",
						v.offset, anc
					)));
				}
				let av = skiplist::view(fs, csum, anc)?;
				if av.is_commit() || av.rtype == record::RT_DUMMY {
					return Err(Error::BadFormat(format!("bad ancestor kind at {}", anc)));
				}
				if record::has_tail(v.rtype)
					&& record::has_tail(av.rtype)
					&& order.cmp(v.key, av.key) != Ordering::Equal
				{
					return Err(Error::BadFormat(format!(
						"ancestor chain changes key at {}",
						anc
					)));
				}
				v = av;
			}
			_ => {
				return Err(Error::BadFormat(format!("bad record kind {} in chain", v.rtype)))
			}
		}
	}
}
