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

// File header, 96 bytes at offset 0. All integers little-endian.
//
// 0..16   magic
// 16..32  uuid, stable across repacks
// 32..36  format version
// 36..40  flags: bits 0-1 checksum engine, bit 2 external comparator,
//         bit 3 dirty
// 40..48  generation, +1 per successful repack
// 48..56  num_records (live keys)
// 56..64  num_commits
// 64..72  dirty_size (dead bytes reclaimable by repack)
// 72..80  repack_size (file size at last repack)
// 80..88  current_size (logical end of committed data)
// 88..92  maxlevel (highest in-use skip level)
// 92..96  checksum over bytes 0..92

use std::convert::TryInto;
use crate::checksum::Checksum;
use crate::error::{Error, Result};

pub const HEADER_SIZE: u64 = 96;
pub const VERSION: u32 = 1;
// Leading high-bit byte and the CRLF trap guard against text-mode mangling.
pub const MAGIC: [u8; 16] = *b"\x89skipfile\r\n\x1a\n\x00\x00\x00";

pub const FLAG_CSUM_MASK: u32 = 0b11;
pub const FLAG_EXTERNAL_CMP: u32 = 1 << 2;
pub const FLAG_DIRTY: u32 = 1 << 3;
const FLAG_KNOWN: u32 = FLAG_CSUM_MASK | FLAG_EXTERNAL_CMP | FLAG_DIRTY;

#[derive(Debug, Clone, PartialEq)]
pub struct Header {
	pub uuid: [u8; 16],
	pub flags: u32,
	pub generation: u64,
	pub num_records: u64,
	pub num_commits: u64,
	pub dirty_size: u64,
	pub repack_size: u64,
	pub current_size: u64,
	pub maxlevel: u32,
}

impl Header {
	pub fn dirty(&self) -> bool {
		self.flags & FLAG_DIRTY != 0
	}

	pub fn set_dirty(&mut self, dirty: bool) {
		if dirty {
			self.flags |= FLAG_DIRTY;
		} else {
			self.flags &= !FLAG_DIRTY;
		}
	}

	pub fn csum_bits(&self) -> u32 {
		self.flags & FLAG_CSUM_MASK
	}

	pub fn external_cmp(&self) -> bool {
		self.flags & FLAG_EXTERNAL_CMP != 0
	}

	pub fn encode(&self, buf: &mut [u8], csum: &Checksum) {
		assert_eq!(buf.len(), HEADER_SIZE as usize);
		buf[0..16].copy_from_slice(&MAGIC);
		buf[16..32].copy_from_slice(&self.uuid);
		buf[32..36].copy_from_slice(&VERSION.to_le_bytes());
		buf[36..40].copy_from_slice(&self.flags.to_le_bytes());
		buf[40..48].copy_from_slice(&self.generation.to_le_bytes());
		buf[48..56].copy_from_slice(&self.num_records.to_le_bytes());
		buf[56..64].copy_from_slice(&self.num_commits.to_le_bytes());
		buf[64..72].copy_from_slice(&self.dirty_size.to_le_bytes());
		buf[72..80].copy_from_slice(&self.repack_size.to_le_bytes());
		buf[80..88].copy_from_slice(&self.current_size.to_le_bytes());
		buf[88..92].copy_from_slice(&self.maxlevel.to_le_bytes());
		let sum = csum.sum(&buf[0..92]);
		buf[92..96].copy_from_slice(&sum.to_le_bytes());
	}

	pub fn decode(buf: &[u8], csum: &Checksum) -> Result<Header> {
		if buf.len() < HEADER_SIZE as usize {
			return Err(Error::BadFormat("file too short for header".into()));
		}
		if buf[0..16] != MAGIC {
			return Err(Error::BadFormat("bad magic".into()));
		}
		let version = u32::from_le_bytes(buf[32..36].try_into().unwrap());
		if version != VERSION {
			return Err(Error::BadFormat(format!("unsupported version {}", version)));
		}
		let flags = u32::from_le_bytes(buf[36..40].try_into().unwrap());
		if flags & !FLAG_KNOWN != 0 {
			return Err(Error::BadFormat(format!("unknown flags {:#x}", flags)));
		}
		let expected = u32::from_le_bytes(buf[92..96].try_into().unwrap());
		csum.check_header(&buf[0..92], expected)?;
		let header = Header {
			uuid: buf[16..32].try_into().unwrap(),
			flags,
			generation: u64::from_le_bytes(buf[40..48].try_into().unwrap()),
			num_records: u64::from_le_bytes(buf[48..56].try_into().unwrap()),
			num_commits: u64::from_le_bytes(buf[56..64].try_into().unwrap()),
			dirty_size: u64::from_le_bytes(buf[64..72].try_into().unwrap()),
			repack_size: u64::from_le_bytes(buf[72..80].try_into().unwrap()),
			current_size: u64::from_le_bytes(buf[80..88].try_into().unwrap()),
			maxlevel: u32::from_le_bytes(buf[88..92].try_into().unwrap()),
		};
		if header.current_size < HEADER_SIZE || header.current_size % 8 != 0 {
			return Err(Error::BadFormat("bad current_size".into()));
		}
		Ok(header)
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::checksum::{Checksum, ChecksumKind};

	fn sample() -> Header {
		Header {
			uuid: *b"0123456789abcdef",
			flags: 0,
			generation: 3,
			num_records: 42,
			num_commits: 17,
			dirty_size: 1024,
			repack_size: 368,
			current_size: 4096,
			maxlevel: 5,
		}
	}

	#[test]
	fn round_trip() {
		let csum = Checksum::new(ChecksumKind::Default, true);
		let header = sample();
		let mut buf = [0u8; 96];
		header.encode(&mut buf, &csum);
		let decoded = Header::decode(&buf, &csum).unwrap();
		assert_eq!(decoded, header);
	}

	#[test]
	fn dirty_flag() {
		let mut header = sample();
		assert!(!header.dirty());
		header.set_dirty(true);
		assert!(header.dirty());
		header.set_dirty(false);
		assert!(!header.dirty());
		assert_eq!(header.flags, 0);
	}

	#[test]
	fn rejects_bad_magic() {
		let csum = Checksum::new(ChecksumKind::Default, true);
		let mut buf = [0u8; 96];
		sample().encode(&mut buf, &csum);
		buf[0] = b'X';
		assert!(matches!(Header::decode(&buf, &csum), Err(Error::BadFormat(_))));
	}

	#[test]
	fn rejects_bad_checksum() {
		let csum = Checksum::new(ChecksumKind::Default, true);
		let mut buf = [0u8; 96];
		sample().encode(&mut buf, &csum);
		buf[50] ^= 1;
		assert!(matches!(Header::decode(&buf, &csum), Err(Error::BadFormat(_))));
		// Verification off: the mangled counter decodes.
		let loose = csum.unverified();
		assert!(Header::decode(&buf, &loose).is_ok());
	}

	#[test]
	fn rejects_bad_version() {
		let csum = Checksum::new(ChecksumKind::Null, true);
		let mut buf = [0u8; 96];
		sample().encode(&mut buf, &csum);
		buf[32] = 9;
		assert!(matches!(Header::decode(&buf, &csum), Err(Error::BadFormat(_))));
	}
}
