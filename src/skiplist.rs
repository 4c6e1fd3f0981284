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

// Skiplist traversal and pointer maintenance.
//
// Search descends the pointer slots from the highest in-use level down to
// slot 2, then walks level 0 through the dual forward slots. A search is
// bounded by `end`: pointers at or past it reference bytes the caller must
// not observe yet.
//
// A DELETE carries no forward slots of its own. It sits in front of the
// record it tombstones; the walk reads the key and the forward slots from
// that ancestor, so a tombstoned key still occupies its slot in the chain
// with the tombstone offset riding along.

use std::cmp::Ordering;
use crate::checksum::Checksum;
use crate::db::FileState;
use crate::error::{Error, Result};
use crate::options::KeyOrder;
use crate::record::{self, RecordView};

pub use crate::record::MAX_LEVEL;

pub const DUMMY_OFFSET: u64 = 96;

/// A resolved position: the matched record (or 0), the tombstone in front
/// of it (or 0) and the predecessor at every pointer slot. Doubles as the
/// position cache: a `Loc` is stale once the file identity or `end` moves.
#[derive(Debug, Clone)]
pub struct Loc {
	pub file_id: u64,
	pub end: u64,
	/// Matched record, always an ADD or REPLACE form.
	pub offset: u64,
	/// DELETE record in front of the match.
	pub deleted: u64,
	pub exact: bool,
	/// Predecessor per pointer slot; entries 0 and 1 both name the level-0
	/// predecessor.
	pub backloc: [u64; MAX_LEVEL + 1],
	/// Key this position was resolved for.
	pub key: Vec<u8>,
}

impl Loc {
	pub fn start(file_id: u64, end: u64) -> Loc {
		Loc {
			file_id,
			end,
			offset: 0,
			deleted: 0,
			exact: false,
			backloc: [DUMMY_OFFSET; MAX_LEVEL + 1],
			key: Vec::new(),
		}
	}
}

/// Record level for a fresh insert: geometric, p = 1/4, clamped to 31.
/// `thread_rng` reseeds per process, so two writers do not end up with
/// identical pointer topologies.
pub fn random_level() -> u8 {
	use rand::Rng;
	let mut rng = rand::thread_rng();
	let mut level = 1u8;
	while (level as usize) < MAX_LEVEL && rng.gen_range(0..4) == 0 {
		level += 1;
	}
	level
}

/// Selects the live successor out of the two level-0 slots. A reader whose
/// `end` is the committed size never follows a slot into uncommitted bytes;
/// the writer, whose `end` covers its own appends, prefers the freshest.
pub fn advance0(slot0: u64, slot1: u64, end: u64) -> u64 {
	if slot0 >= end {
		slot1
	} else if slot1 >= end {
		slot0
	} else {
		slot0.max(slot1)
	}
}

pub fn view<'a>(fs: &'a FileState, csum: &Checksum, offset: u64) -> Result<RecordView<'a>> {
	record::decode(fs.map.bytes(), offset, csum)
}

/// A level-0 chain node: the record owning the forward slots plus the
/// tombstone fronting it, if any.
pub struct Node<'a> {
	pub view: RecordView<'a>,
	pub deleted: u64,
}

pub fn node<'a>(fs: &'a FileState, csum: &Checksum, raw: u64) -> Result<Node<'a>> {
	let v = view(fs, csum, raw)?;
	if v.is_commit() {
		return Err(Error::BadFormat(format!("commit record at {} linked into the chain", raw)));
	}
	if v.is_delete() {
		let ancestor = v.ancestor;
		let uv = view(fs, csum, ancestor)?;
		if !record::has_tail(uv.rtype) {
			return Err(Error::BadFormat(format!("tombstone at {} has no target", raw)));
		}
		Ok(Node { view: uv, deleted: raw })
	} else {
		Ok(Node { view: v, deleted: 0 })
	}
}

/// Full walk from the sentinel. Returns the matched offset (zero on miss),
/// the fronting DELETE and the predecessor at every slot.
pub fn locate(
	fs: &FileState,
	order: &KeyOrder,
	csum: &Checksum,
	end: u64,
	key: &[u8],
) -> Result<Loc> {
	let mut loc = Loc::start(fs.id, end);
	loc.key = key.to_vec();
	let mut curv = view(fs, csum, DUMMY_OFFSET)?;
	if curv.rtype != record::RT_DUMMY {
		return Err(Error::BadFormat("sentinel record missing".into()));
	}

	// The empty key sorts before everything: the sentinel is its
	// predecessor at every level, no comparisons needed.
	if !key.is_empty() {
		let top = (fs.header.maxlevel as usize).min(MAX_LEVEL);
		// When the slot below repeats an already-rejected pointer the
		// comparison outcome is known.
		let mut rejected = 0u64;
		for slot in (2..=top).rev() {
			loop {
				let next = curv.ptr(slot);
				if next == 0 || next >= end || next == rejected {
					break;
				}
				let nv = view(fs, csum, next)?;
				if !record::has_ptrs(nv.rtype) || (nv.level as usize) < slot {
					return Err(Error::BadFormat(format!(
						"bad level {} link into {}",
						slot, next
					)));
				}
				if order.cmp(nv.key, key) == Ordering::Less {
					curv = nv;
				} else {
					rejected = next;
					break;
				}
			}
			loc.backloc[slot] = curv.offset;
		}
	}

	loc.backloc[0] = curv.offset;
	loc.backloc[1] = curv.offset;
	loop {
		let raw = advance0(curv.ptr(0), curv.ptr(1), end);
		if raw == 0 {
			break;
		}
		let n = node(fs, csum, raw)?;
		match order.cmp(n.view.key, key) {
			Ordering::Less => {
				loc.backloc[0] = n.view.offset;
				loc.backloc[1] = n.view.offset;
				curv = n.view;
			}
			Ordering::Equal => {
				loc.offset = n.view.offset;
				loc.deleted = n.deleted;
				loc.exact = true;
				break;
			}
			Ordering::Greater => break,
		}
	}
	Ok(loc)
}

/// `locate` behind the position cache. A fresh or stale cache falls back to
/// the full walk; an exact repeat costs one comparison; stepping to the
/// next record in chain order (sequential scans, sorted bulk inserts)
/// costs one slot selection and at most two comparisons.
pub fn find_loc(
	fs: &FileState,
	order: &KeyOrder,
	csum: &Checksum,
	end: u64,
	key: &[u8],
	cached: Option<Loc>,
) -> Result<Loc> {
	let cached = match cached {
		Some(c) if c.file_id == fs.id && c.end == end => c,
		_ => return locate(fs, order, csum, end, key),
	};

	if cached.exact {
		let v = view(fs, csum, cached.offset)?;
		if order.cmp(v.key, key) == Ordering::Equal {
			let mut loc = cached;
			loc.key = key.to_vec();
			return Ok(loc);
		}
	}

	let cand = if cached.exact { cached.offset } else { cached.backloc[0] };
	let cv = view(fs, csum, cand)?;
	if cand == DUMMY_OFFSET || order.cmp(cv.key, key) == Ordering::Less {
		let raw = advance0(cv.ptr(0), cv.ptr(1), end);
		let next = if raw == 0 { None } else { Some(node(fs, csum, raw)?) };
		let hit = match &next {
			None => Some((0, 0, false)),
			Some(n) => match order.cmp(n.view.key, key) {
				Ordering::Greater => Some((0, 0, false)),
				Ordering::Equal => Some((n.view.offset, n.deleted, true)),
				Ordering::Less => None,
			},
		};
		if let Some((offset, deleted, exact)) = hit {
			let mut loc = cached;
			loc.backloc[0] = cand;
			loc.backloc[1] = cand;
			loc.offset = offset;
			loc.deleted = deleted;
			loc.exact = exact;
			loc.key = key.to_vec();
			return Ok(loc);
		}
	}

	locate(fs, order, csum, end, key)
}

/// Steps the position to the next chain node. Re-anchors at the cached key
/// first when the file identity or `end` has moved (after a yield, commit
/// or repack). Returns false when the chain is exhausted.
pub fn advance_loc(
	fs: &FileState,
	order: &KeyOrder,
	csum: &Checksum,
	end: u64,
	loc: &mut Loc,
) -> Result<bool> {
	if loc.file_id != fs.id || loc.end != end {
		*loc = locate(fs, order, csum, end, &loc.key)?;
	}
	let owner = if loc.exact {
		let owner = loc.offset;
		loc.backloc[0] = owner;
		loc.backloc[1] = owner;
		loc.offset = 0;
		loc.exact = false;
		owner
	} else {
		loc.backloc[0]
	};
	let ov = view(fs, csum, owner)?;
	let raw = advance0(ov.ptr(0), ov.ptr(1), end);
	if raw == 0 {
		loc.deleted = 0;
		return Ok(false);
	}
	let n = node(fs, csum, raw)?;
	loc.offset = n.view.offset;
	loc.deleted = n.deleted;
	loc.exact = true;
	loc.key = n.view.key.to_vec();
	Ok(true)
}

/// Publishes a new level-0 successor. Of the two slots, the one still
/// pointing into committed data survives; readers bounded by the committed
/// size keep a consistent chain through a crash of the in-flight
/// transaction.
pub fn set_level0(fs: &mut FileState, csum: &Checksum, off: u64, new_next: u64) -> Result<()> {
	let committed = fs.committed_size;
	let (s0_off, s1_off, s0, s1) = {
		let v = view(fs, csum, off)?;
		if v.nptrs() < 2 {
			return Err(Error::Internal(format!("level-0 publish into record at {}", off)));
		}
		(v.slot_offset(0), v.slot_offset(1), v.ptr(0), v.ptr(1))
	};
	let target = if s0 < committed && (s1 >= committed || s0 > s1) { s1_off } else { s0_off };
	fs.map.write_u64(target, new_next)?;
	record::rewrite_head(fs.map.bytes_mut()?, off, csum)
}

/// Rewrites a single upper-level forward pointer.
pub fn set_level(
	fs: &mut FileState,
	csum: &Checksum,
	off: u64,
	slot: usize,
	new_next: u64,
) -> Result<()> {
	let slot_off = {
		let v = view(fs, csum, off)?;
		if slot < 2 || slot >= v.nptrs() {
			return Err(Error::Internal(format!("bad slot {} for record at {}", slot, off)));
		}
		v.slot_offset(slot)
	};
	fs.map.write_u64(slot_off, new_next)?;
	record::rewrite_head(fs.map.bytes_mut()?, off, csum)
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn advance0_selection() {
		// A slot at or past `end` is invisible; otherwise the freshest wins.
		assert_eq!(advance0(100, 200, 1000), 200);
		assert_eq!(advance0(200, 100, 1000), 200);
		assert_eq!(advance0(100, 200, 150), 100);
		assert_eq!(advance0(200, 100, 150), 100);
		assert_eq!(advance0(200, 300, 150), 300);
		assert_eq!(advance0(0, 0, 1000), 0);
		assert_eq!(advance0(500, 0, 1000), 500);
		assert_eq!(advance0(0, 500, 1000), 500);
	}

	#[test]
	fn random_level_bounds() {
		let mut total = 0u64;
		for _ in 0..10_000 {
			let l = random_level();
			assert!(l >= 1 && l as usize <= MAX_LEVEL);
			total += l as u64;
		}
		// Expectation for p = 1/4 is 4/3; allow generous slack.
		let mean = total as f64 / 10_000.0;
		assert!(mean > 1.1 && mean < 1.7, "suspicious level mean {}", mean);
	}

	#[test]
	fn fresh_loc_points_at_sentinel() {
		let loc = Loc::start(1, 368);
		assert!(!loc.exact);
		assert!(loc.backloc.iter().all(|b| *b == DUMMY_OFFSET));
	}
}
