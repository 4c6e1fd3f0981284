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

// On disk record layout. All integers little-endian, every record starts at
// an 8-byte-aligned offset.
//
// A record of level L (1..=31) carries L+1 pointer slots of 8 bytes each.
// Slots 0 and 1 are the two level-0 forward candidates; slot i for i >= 2
// is the single level-i forward pointer. A zero slot ends the chain.
//
// DUMMY (sentinel at offset 96, level 31):
// [TYPE: 1][LEVEL: 1][KEYLEN: 2 = 0][VALLEN: 4 = 0]
// [PTR: 8 x 32][HEADCSUM: 4][TAILCSUM: 4 = 0]
//
// ADD:
// [TYPE: 1][LEVEL: 1][KEYLEN: 2][VALLEN: 4]
// [PTR: 8 x (L+1)][HEADCSUM: 4][TAILCSUM: 4]
// [KEY][NUL][VALUE][NUL][ZERO PAD to 8]
//
// FATADD: as ADD with
// [TYPE: 1][LEVEL: 1][PAD: 6][KEYLEN: 8][VALLEN: 8]
//
// REPLACE: as ADD with [ANCESTOR: 8] between the lengths and the pointers.
// FATREPLACE: as FATADD with [ANCESTOR: 8] in the same position.
//
// DELETE:
// [TYPE: 1][LEVEL: 1 = 0][PAD: 6][ANCESTOR: 8][HEADCSUM: 4][PAD: 4]
//
// COMMIT:
// [TYPE: 1][LEVEL: 1 = 0][PAD: 6][START: 8][HEADCSUM: 4][PAD: 4]
//
// The head checksum covers every fixed byte before it. The tail checksum
// covers the padded tail. Encoders pick the fat forms exactly when a length
// exceeds the lean field width.

use std::convert::TryInto;
use crate::checksum::Checksum;
use crate::display::hex;
use crate::error::{Error, Result};

pub const RT_DUMMY: u8 = 1;
pub const RT_ADD: u8 = 2;
pub const RT_REPLACE: u8 = 3;
pub const RT_DELETE: u8 = 4;
pub const RT_COMMIT: u8 = 5;
pub const RT_FATADD: u8 = 6;
pub const RT_FATREPLACE: u8 = 7;

pub const MAX_LEVEL: usize = 31;
pub const MAX_LEAN_KEY: usize = 0xffff;
pub const MAX_LEAN_VAL: u64 = 0xffff_ffff;
pub const DELETE_SIZE: u64 = 24;
pub const COMMIT_SIZE: u64 = 24;
pub const DUMMY_SIZE: u64 = 272;

pub fn align8(n: u64) -> u64 {
	(n + 7) & !7
}

pub fn tail_size(key_len: u64, val_len: u64) -> u64 {
	align8(key_len + val_len + 2)
}

pub fn has_ptrs(rtype: u8) -> bool {
	!matches!(rtype, RT_DELETE | RT_COMMIT)
}

pub fn has_tail(rtype: u8) -> bool {
	matches!(rtype, RT_ADD | RT_FATADD | RT_REPLACE | RT_FATREPLACE)
}

fn ptr_base(rtype: u8) -> u64 {
	match rtype {
		RT_DUMMY | RT_ADD => 8,
		RT_REPLACE => 16,
		RT_FATADD => 24,
		RT_FATREPLACE => 32,
		_ => 0,
	}
}

pub fn fixed_size(rtype: u8, level: u8) -> u64 {
	match rtype {
		RT_DELETE | RT_COMMIT => 24,
		_ => ptr_base(rtype) + 8 * (level as u64 + 1) + 8,
	}
}

pub fn total_size(rtype: u8, level: u8, key_len: u64, val_len: u64) -> u64 {
	let tail = if has_tail(rtype) { tail_size(key_len, val_len) } else { 0 };
	fixed_size(rtype, level) + tail
}

/// The record kind a store appends, fat exactly when a lean length field
/// would overflow.
pub fn store_kind(replace: bool, key_len: usize, val_len: u64) -> u8 {
	let fat = key_len > MAX_LEAN_KEY || val_len > MAX_LEAN_VAL;
	match (replace, fat) {
		(false, false) => RT_ADD,
		(false, true) => RT_FATADD,
		(true, false) => RT_REPLACE,
		(true, true) => RT_FATREPLACE,
	}
}

pub fn type_name(rtype: u8) -> &'static str {
	match rtype {
		RT_DUMMY => "DUMMY",
		RT_ADD => "ADD",
		RT_REPLACE => "REPLACE",
		RT_DELETE => "DELETE",
		RT_COMMIT => "COMMIT",
		RT_FATADD => "FATADD",
		RT_FATREPLACE => "FATREPLACE",
		_ => "?",
	}
}

struct Entry<B>(usize, B);

impl<B: AsRef<[u8]>> Entry<B> {
	fn new(buf: B) -> Self {
		Entry(0, buf)
	}

	fn read_slice(&mut self, size: usize) -> &[u8] {
		let start = self.0;
		self.0 += size;
		&self.1.as_ref()[start..self.0]
	}

	fn skip(&mut self, size: usize) {
		self.0 += size;
	}

	fn read_u16(&mut self) -> u16 {
		u16::from_le_bytes(self.read_slice(2).try_into().unwrap())
	}

	fn read_u32(&mut self) -> u32 {
		u32::from_le_bytes(self.read_slice(4).try_into().unwrap())
	}

	fn read_u64(&mut self) -> u64 {
		u64::from_le_bytes(self.read_slice(8).try_into().unwrap())
	}
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> Entry<B> {
	fn write_slice(&mut self, buf: &[u8]) {
		let start = self.0;
		self.0 += buf.len();
		self.1.as_mut()[start..self.0].copy_from_slice(buf);
	}

	fn write_u8(&mut self, v: u8) {
		self.write_slice(&[v]);
	}

	fn write_u16(&mut self, v: u16) {
		self.write_slice(&v.to_le_bytes());
	}

	fn write_u32(&mut self, v: u32) {
		self.write_slice(&v.to_le_bytes());
	}

	fn write_u64(&mut self, v: u64) {
		self.write_slice(&v.to_le_bytes());
	}

	fn write_zeros(&mut self, size: usize) {
		let start = self.0;
		self.0 += size;
		for b in &mut self.1.as_mut()[start..self.0] {
			*b = 0;
		}
	}
}

/// Borrowed view of a decoded record. Key and value point straight into
/// the mapping; nothing is copied.
pub struct RecordView<'a> {
	pub offset: u64,
	pub rtype: u8,
	pub level: u8,
	/// Superseded record for REPLACE/DELETE, transaction start for COMMIT.
	pub ancestor: u64,
	pub key: &'a [u8],
	pub val: &'a [u8],
	ptrs: &'a [u8],
	pub size: u64,
}

impl<'a> RecordView<'a> {
	pub fn nptrs(&self) -> usize {
		if has_ptrs(self.rtype) {
			self.level as usize + 1
		} else {
			0
		}
	}

	pub fn ptr(&self, slot: usize) -> u64 {
		u64::from_le_bytes(self.ptrs[slot * 8..slot * 8 + 8].try_into().unwrap())
	}

	/// Absolute file offset of a pointer slot.
	pub fn slot_offset(&self, slot: usize) -> u64 {
		self.offset + ptr_base(self.rtype) + 8 * slot as u64
	}

	pub fn is_delete(&self) -> bool {
		self.rtype == RT_DELETE
	}

	pub fn is_commit(&self) -> bool {
		self.rtype == RT_COMMIT
	}

	pub fn end(&self) -> u64 {
		self.offset + self.size
	}
}

pub fn decode<'a>(buf: &'a [u8], offset: u64, csum: &Checksum) -> Result<RecordView<'a>> {
	let len = buf.len() as u64;
	if offset % 8 != 0 || offset.checked_add(8).map_or(true, |end| end > len) {
		return Err(Error::BadFormat(format!("record offset {} out of bounds", offset)));
	}
	let rtype = buf[offset as usize];
	let level = buf[offset as usize + 1];
	match rtype {
		RT_DUMMY => {
			if level as usize != MAX_LEVEL {
				return Err(Error::BadFormat("bad sentinel level".into()));
			}
		}
		RT_ADD | RT_REPLACE | RT_FATADD | RT_FATREPLACE => {
			if level == 0 || level as usize > MAX_LEVEL {
				return Err(Error::BadFormat(format!("bad record level {}", level)));
			}
		}
		RT_DELETE | RT_COMMIT => (),
		_ => return Err(Error::BadFormat(format!("bad record type {}", rtype))),
	}
	let fixed = fixed_size(rtype, level);
	if offset.checked_add(fixed).map_or(true, |end| end > len) {
		return Err(Error::BadFormat(format!("record at {} overflows the file", offset)));
	}
	let mut e = Entry::new(&buf[offset as usize..(offset + fixed) as usize]);
	e.skip(2);
	let (key_len, val_len, ancestor) = match rtype {
		RT_DUMMY | RT_ADD => (e.read_u16() as u64, e.read_u32() as u64, 0),
		RT_REPLACE => {
			let kl = e.read_u16() as u64;
			let vl = e.read_u32() as u64;
			(kl, vl, e.read_u64())
		}
		RT_FATADD => {
			e.skip(6);
			(e.read_u64(), e.read_u64(), 0)
		}
		RT_FATREPLACE => {
			e.skip(6);
			let kl = e.read_u64();
			let vl = e.read_u64();
			(kl, vl, e.read_u64())
		}
		// DELETE ancestor, or COMMIT transaction start.
		_ => {
			e.skip(6);
			(0, 0, e.read_u64())
		}
	};
	let ptrs = if has_ptrs(rtype) {
		let base = (offset + ptr_base(rtype)) as usize;
		e.skip(8 * (level as usize + 1));
		&buf[base..base + 8 * (level as usize + 1)]
	} else {
		&buf[0..0]
	};
	let head_sum = e.read_u32();
	let tail_sum = e.read_u32();
	csum.check(&buf[offset as usize..(offset + fixed - 8) as usize], head_sum)?;

	let (key, val, size) = if has_tail(rtype) {
		if key_len > len || val_len > len {
			return Err(Error::BadFormat(format!("record tail at {} overflows the file", offset)));
		}
		let tail = tail_size(key_len, val_len);
		let tail_end = offset.checked_add(fixed).and_then(|end| end.checked_add(tail));
		if tail_end.map_or(true, |end| end > len) {
			return Err(Error::BadFormat(format!("record tail at {} overflows the file", offset)));
		}
		let tail_start = (offset + fixed) as usize;
		csum.check(&buf[tail_start..tail_start + tail as usize], tail_sum)?;
		let key = &buf[tail_start..tail_start + key_len as usize];
		let val_start = tail_start + key_len as usize + 1;
		let val = &buf[val_start..val_start + val_len as usize];
		(key, val, fixed + tail)
	} else {
		(&buf[0..0], &buf[0..0], fixed)
	};
	Ok(RecordView { offset, rtype, level, ancestor, key, val, ptrs, size })
}

pub struct NewRecord<'a> {
	pub rtype: u8,
	pub level: u8,
	pub ancestor: u64,
	pub key: &'a [u8],
	pub val: &'a [u8],
}

/// Writes a complete record into `buf`, which must be exactly
/// `total_size` bytes. `ptrs` supplies all `level + 1` slot values for
/// pointered kinds and must be empty otherwise.
pub fn encode(buf: &mut [u8], rec: &NewRecord, ptrs: &[u64], csum: &Checksum) -> Result<()> {
	let fixed = fixed_size(rec.rtype, rec.level) as usize;
	let expected = total_size(rec.rtype, rec.level, rec.key.len() as u64, rec.val.len() as u64);
	assert_eq!(buf.len() as u64, expected);
	if has_ptrs(rec.rtype) {
		assert_eq!(ptrs.len(), rec.level as usize + 1);
	} else {
		assert!(ptrs.is_empty());
	}

	let buf_len = buf.len();
	let mut e = Entry::new(&mut buf[..]);
	e.write_u8(rec.rtype);
	e.write_u8(rec.level);
	match rec.rtype {
		RT_DUMMY | RT_ADD => {
			e.write_u16(rec.key.len() as u16);
			e.write_u32(rec.val.len() as u32);
		}
		RT_REPLACE => {
			e.write_u16(rec.key.len() as u16);
			e.write_u32(rec.val.len() as u32);
			e.write_u64(rec.ancestor);
		}
		RT_FATADD => {
			e.write_zeros(6);
			e.write_u64(rec.key.len() as u64);
			e.write_u64(rec.val.len() as u64);
		}
		RT_FATREPLACE => {
			e.write_zeros(6);
			e.write_u64(rec.key.len() as u64);
			e.write_u64(rec.val.len() as u64);
			e.write_u64(rec.ancestor);
		}
		RT_DELETE | RT_COMMIT => {
			e.write_zeros(6);
			e.write_u64(rec.ancestor);
		}
		_ => return Err(Error::Internal(format!("bad record type {}", rec.rtype))),
	}
	for p in ptrs {
		e.write_u64(*p);
	}
	let head_sum = csum.sum(&buf[0..fixed - 8]);
	let mut e = Entry(fixed - 8, &mut buf[..]);
	e.write_u32(head_sum);
	if has_tail(rec.rtype) {
		e.write_u32(0);
		e.write_slice(rec.key);
		e.write_zeros(1);
		e.write_slice(rec.val);
		e.write_zeros(1);
		let zeros_len = buf_len - fixed - rec.key.len() - rec.val.len() - 2;
		e.write_zeros(zeros_len);
		let tail_sum = csum.sum(&buf[fixed..]);
		Entry(fixed - 4, &mut buf[..]).write_u32(tail_sum);
	} else {
		e.write_u32(0);
	}
	Ok(())
}

/// Recomputes the head checksum of the record at `offset` after one of its
/// pointer slots was rewritten in place.
pub fn rewrite_head(buf: &mut [u8], offset: u64, csum: &Checksum) -> Result<()> {
	let rtype = buf[offset as usize];
	let level = buf[offset as usize + 1];
	let fixed = fixed_size(rtype, level);
	if !has_ptrs(rtype) || offset + fixed > buf.len() as u64 {
		return Err(Error::Internal(format!("head rewrite on bad record at {}", offset)));
	}
	let sum = csum.sum(&buf[offset as usize..(offset + fixed - 8) as usize]);
	buf[(offset + fixed - 8) as usize..(offset + fixed - 4) as usize]
		.copy_from_slice(&sum.to_le_bytes());
	Ok(())
}

/// One line per record, for diagnostics.
pub fn describe(view: &RecordView) -> String {
	match view.rtype {
		RT_DELETE => format!(
			"{:08} DELETE ancestor={}",
			view.offset, view.ancestor,
		),
		RT_COMMIT => format!(
			"{:08} COMMIT start={}",
			view.offset, view.ancestor,
		),
		RT_DUMMY => format!("{:08} DUMMY level={}", view.offset, view.level),
		_ => format!(
			"{:08} {} level={} ancestor={} key={} vallen={}",
			view.offset,
			type_name(view.rtype),
			view.level,
			view.ancestor,
			hex(view.key),
			view.val.len(),
		),
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::checksum::{Checksum, ChecksumKind};

	fn csum() -> Checksum {
		Checksum::new(ChecksumKind::Default, true)
	}

	#[test]
	fn size_formulas() {
		assert_eq!(fixed_size(RT_DUMMY, 31), DUMMY_SIZE);
		for level in 1..=31u8 {
			let l = level as u64;
			assert_eq!(fixed_size(RT_ADD, level), 24 + 8 * l);
			assert_eq!(fixed_size(RT_FATADD, level), 40 + 8 * l);
			assert_eq!(fixed_size(RT_REPLACE, level), 32 + 8 * l);
			assert_eq!(fixed_size(RT_FATREPLACE, level), 48 + 8 * l);
		}
		assert_eq!(fixed_size(RT_DELETE, 0), 24);
		assert_eq!(fixed_size(RT_COMMIT, 0), 24);
		assert_eq!(tail_size(1, 1), 8);
		assert_eq!(tail_size(3, 3), 8);
		assert_eq!(tail_size(3, 4), 16);
		assert_eq!(tail_size(0, 0), 8);
	}

	#[test]
	fn store_kind_thresholds() {
		assert_eq!(store_kind(false, MAX_LEAN_KEY, 10), RT_ADD);
		assert_eq!(store_kind(false, MAX_LEAN_KEY + 1, 10), RT_FATADD);
		assert_eq!(store_kind(false, 10, MAX_LEAN_VAL), RT_ADD);
		assert_eq!(store_kind(false, 10, MAX_LEAN_VAL + 1), RT_FATADD);
		assert_eq!(store_kind(true, MAX_LEAN_KEY + 1, 0), RT_FATREPLACE);
		assert_eq!(store_kind(true, 1, 1), RT_REPLACE);
	}

	fn encode_one(rec: &NewRecord, ptrs: &[u64]) -> Vec<u8> {
		let size = total_size(rec.rtype, rec.level, rec.key.len() as u64, rec.val.len() as u64);
		let mut buf = vec![0xaau8; size as usize];
		encode(&mut buf, rec, ptrs, &csum()).unwrap();
		buf
	}

	#[test]
	fn add_round_trip() {
		let rec = NewRecord { rtype: RT_ADD, level: 3, ancestor: 0, key: b"banana", val: b"yellow" };
		let ptrs = [88u64, 96, 104, 112];
		let buf = encode_one(&rec, &ptrs);
		assert_eq!(buf.len() as u64, 24 + 8 * 3 + tail_size(6, 6));
		let view = decode(&buf, 0, &csum()).unwrap();
		assert_eq!(view.rtype, RT_ADD);
		assert_eq!(view.level, 3);
		assert_eq!(view.key, b"banana");
		assert_eq!(view.val, b"yellow");
		assert_eq!(view.nptrs(), 4);
		for (i, p) in ptrs.iter().enumerate() {
			assert_eq!(view.ptr(i), *p);
		}
		assert_eq!(view.size, buf.len() as u64);
	}

	#[test]
	fn replace_round_trip() {
		let rec =
			NewRecord { rtype: RT_REPLACE, level: 1, ancestor: 368, key: b"k", val: b"v2" };
		let buf = encode_one(&rec, &[0, 0]);
		let view = decode(&buf, 0, &csum()).unwrap();
		assert_eq!(view.rtype, RT_REPLACE);
		assert_eq!(view.ancestor, 368);
		assert_eq!(view.key, b"k");
		assert_eq!(view.val, b"v2");
	}

	#[test]
	fn fat_round_trip() {
		let key = vec![7u8; MAX_LEAN_KEY + 3];
		let rec = NewRecord {
			rtype: store_kind(false, key.len(), 2),
			level: 2,
			ancestor: 0,
			key: &key,
			val: b"xy",
		};
		assert_eq!(rec.rtype, RT_FATADD);
		let buf = encode_one(&rec, &[0, 0, 0]);
		let view = decode(&buf, 0, &csum()).unwrap();
		assert_eq!(view.key.len(), key.len());
		assert_eq!(view.key, &key[..]);
		assert_eq!(view.val, b"xy");
	}

	#[test]
	fn delete_and_commit_round_trip() {
		let rec = NewRecord { rtype: RT_DELETE, level: 0, ancestor: 1000, key: b"", val: b"" };
		let buf = encode_one(&rec, &[]);
		assert_eq!(buf.len() as u64, DELETE_SIZE);
		let view = decode(&buf, 0, &csum()).unwrap();
		assert!(view.is_delete());
		assert_eq!(view.ancestor, 1000);
		assert_eq!(view.nptrs(), 0);

		let rec = NewRecord { rtype: RT_COMMIT, level: 0, ancestor: 368, key: b"", val: b"" };
		let buf = encode_one(&rec, &[]);
		let view = decode(&buf, 0, &csum()).unwrap();
		assert!(view.is_commit());
		assert_eq!(view.ancestor, 368);
	}

	#[test]
	fn nul_bytes_preserved() {
		let key = b"\x00tab\there\x00";
		let val = b"\r\n\x00\xff\x80";
		let rec = NewRecord { rtype: RT_ADD, level: 1, ancestor: 0, key, val };
		let buf = encode_one(&rec, &[0, 0]);
		let view = decode(&buf, 0, &csum()).unwrap();
		assert_eq!(view.key, key);
		assert_eq!(view.val, val);
	}

	#[test]
	fn padding_is_zeroed() {
		// Encoding over a dirty buffer must not leak old bytes into the pad.
		let rec = NewRecord { rtype: RT_ADD, level: 1, ancestor: 0, key: b"a", val: b"b" };
		let buf = encode_one(&rec, &[0, 0]);
		let fixed = fixed_size(RT_ADD, 1) as usize;
		// key, NUL, val, NUL then pad.
		assert_eq!(&buf[fixed..fixed + 4], b"a\x00b\x00");
		assert!(buf[fixed + 4..].iter().all(|b| *b == 0));
	}

	#[test]
	fn corrupt_head_detected() {
		let rec = NewRecord { rtype: RT_ADD, level: 1, ancestor: 0, key: b"a", val: b"b" };
		let mut buf = encode_one(&rec, &[0, 16]);
		buf[9] ^= 0xff;
		assert!(matches!(decode(&buf, 0, &csum()), Err(Error::BadChecksum)));
	}

	#[test]
	fn corrupt_tail_detected() {
		let rec = NewRecord { rtype: RT_ADD, level: 1, ancestor: 0, key: b"a", val: b"b" };
		let mut buf = encode_one(&rec, &[0, 16]);
		let fixed = fixed_size(RT_ADD, 1) as usize;
		buf[fixed] ^= 0xff;
		assert!(matches!(decode(&buf, 0, &csum()), Err(Error::BadChecksum)));
	}

	#[test]
	fn rewrite_head_revalidates() {
		let rec = NewRecord { rtype: RT_ADD, level: 1, ancestor: 0, key: b"a", val: b"b" };
		let mut buf = encode_one(&rec, &[0, 0]);
		// Rewrite slot 0 in place, as the level-0 publish step does.
		buf[8..16].copy_from_slice(&4096u64.to_le_bytes());
		assert!(matches!(decode(&buf, 0, &csum()), Err(Error::BadChecksum)));
		rewrite_head(&mut buf, 0, &csum()).unwrap();
		let view = decode(&buf, 0, &csum()).unwrap();
		assert_eq!(view.ptr(0), 4096);
	}

	#[test]
	fn truncated_record_is_bad_format() {
		let rec = NewRecord { rtype: RT_ADD, level: 4, ancestor: 0, key: b"abc", val: b"def" };
		let buf = encode_one(&rec, &[0, 0, 0, 0, 0]);
		assert!(matches!(decode(&buf[..buf.len() - 8], 0, &csum()), Err(Error::BadFormat(_))));
		assert!(matches!(decode(&buf[..16], 0, &csum()), Err(Error::BadFormat(_))));
	}

	#[test]
	fn unaligned_offset_rejected() {
		let buf = vec![0u8; 64];
		assert!(matches!(decode(&buf, 4, &csum()), Err(Error::BadFormat(_))));
	}

	#[test]
	fn wrapping_offset_rejected() {
		// An aligned offset near u64::MAX, as a corrupted pointer slot
		// would produce; the bounds check must not wrap.
		let buf = vec![0u8; 64];
		assert!(matches!(decode(&buf, u64::MAX - 7, &csum()), Err(Error::BadFormat(_))));
	}
}
