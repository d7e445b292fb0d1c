/*
 * Copyright 2024 Luc Lenôtre
 *
 * This file is part of Maestro.
 *
 * Maestro is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * Maestro is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * Maestro. If not, see <https://www.gnu.org/licenses/>.
 */

//! Directory entries.
//!
//! A directory's content is a contiguous array of fixed-size entries: a
//! 16-bit (versions 1/2) or 32-bit (version 3) inode number followed by a
//! NUL-padded name of 14, 30 or 60 bytes. An inode number of `0` marks a free
//! slot; the name bytes of a freed slot are left in place.

use crate::{
	cache::BlockFlags,
	endian::{conv16, conv32},
	inode::InodeInfo,
	ops::Mfs,
	sb::{SbInfo, Version},
	zone, Error, Result,
};

/// A decoded directory entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirEntry {
	/// The inode the entry points at; `0` for a free slot.
	pub inum: u32,
	/// The entry's name, truncated at the first NUL.
	pub name: Vec<u8>,
}

/// Byte offset of the name field.
fn name_off(sbi: &SbInfo) -> usize {
	match sbi.version {
		Version::V3 => 4,
		_ => 2,
	}
}

/// Encodes an entry into the `dirsize`-byte `slot`.
pub(crate) fn encode_dentry(sbi: &SbInfo, slot: &mut [u8], inum: u32, name: &[u8]) -> Result<()> {
	if name.len() > sbi.max_name_len {
		return Err(Error::NameTooLong);
	}
	let off = name_off(sbi);
	match sbi.version {
		Version::V3 => {
			slot[..4].copy_from_slice(&conv32(sbi.native, inum).to_le_bytes());
		}
		_ => {
			let inum: u16 = inum.try_into().map_err(|_| Error::Overflow)?;
			slot[..2].copy_from_slice(&conv16(sbi.native, inum).to_le_bytes());
		}
	}
	slot[off..off + name.len()].copy_from_slice(name);
	slot[off + name.len()..].fill(0);
	Ok(())
}

/// Decodes the `dirsize`-byte `slot`.
pub(crate) fn decode_dentry(sbi: &SbInfo, slot: &[u8]) -> DirEntry {
	let off = name_off(sbi);
	let inum = match sbi.version {
		Version::V3 => conv32(sbi.native, u32::from_le_bytes([slot[0], slot[1], slot[2], slot[3]])),
		_ => conv16(sbi.native, u16::from_le_bytes([slot[0], slot[1]])) as u32,
	};
	let name = &slot[off..];
	let len = name.iter().position(|b| *b == 0).unwrap_or(name.len());
	DirEntry {
		inum,
		name: name[..len].to_vec(),
	}
}

/// Returns the physical zone and in-block byte offset of the entry `index`.
fn entry_slot(mfs: &Mfs, ino: &InodeInfo, index: u32) -> Result<(u32, usize)> {
	let sbi = mfs.sbi();
	let pos = index as u64 * sbi.dirsize as u64;
	if pos >= ino.size as u64 {
		return Err(Error::InvalidArg);
	}
	let zone = zone::map_rblock(mfs, ino, (pos / sbi.block_size as u64) as u32)?;
	if zone == 0 {
		// A directory must not have sparse content
		return Err(Error::Io);
	}
	Ok((zone, (pos % sbi.block_size as u64) as usize))
}

/// Reads the directory entry at slot `index`.
pub fn read_dentry(mfs: &Mfs, ino: &InodeInfo, index: u32) -> Result<DirEntry> {
	let (zone, off) = entry_slot(mfs, ino, index)?;
	let blk = mfs.cache().get(zone as u64, BlockFlags::None)?;
	let ent = decode_dentry(mfs.sbi(), &blk.data()[off..off + mfs.sbi().dirsize]);
	mfs.cache().put(&blk)?;
	Ok(ent)
}

/// Writes the directory entry at slot `index`.
pub fn write_dentry(
	mfs: &Mfs,
	ino: &InodeInfo,
	index: u32,
	inum: u32,
	name: &[u8],
) -> Result<()> {
	let (zone, off) = entry_slot(mfs, ino, index)?;
	let blk = mfs.cache().get(zone as u64, BlockFlags::None)?;
	{
		let mut data = blk.data();
		encode_dentry(mfs.sbi(), &mut data[off..off + mfs.sbi().dirsize], inum, name)?;
		blk.mark_dirty();
	}
	mfs.cache().put(&blk)
}

/// Looks an entry up by name. Returns the entry's inode number and slot.
pub fn lookup_dentry(mfs: &Mfs, ino: &InodeInfo, name: &[u8]) -> Result<Option<(u32, u32)>> {
	let nslots = ino.size / mfs.sbi().dirsize as u32;
	for i in 0..nslots {
		let ent = read_dentry(mfs, ino, i)?;
		if ent.inum != 0 && ent.name == name {
			return Ok(Some((ent.inum, i)));
		}
	}
	Ok(None)
}

/// Inserts the entry `(name, inum)` into the directory.
///
/// The first free slot is reused; when there is none, the directory grows by
/// one entry, allocating a zeroed zone if the new entry starts one.
pub fn insert_dentry(mfs: &Mfs, ino: &mut InodeInfo, name: &[u8], inum: u32) -> Result<()> {
	let sbi = mfs.sbi();
	if name.len() > sbi.max_name_len {
		return Err(Error::NameTooLong);
	}
	let nslots = ino.size / sbi.dirsize as u32;
	let mut free_slot = None;
	for i in 0..nslots {
		let ent = read_dentry(mfs, ino, i)?;
		if ent.inum == 0 {
			free_slot.get_or_insert(i);
		} else if ent.name == name {
			return Err(Error::Exists);
		}
	}
	if let Some(i) = free_slot {
		return write_dentry(mfs, ino, i, inum, name);
	}
	// No free slot: grow the directory by one entry
	let pos = ino.size;
	if pos as usize % sbi.block_size == 0 {
		let new_zone = zone::alloc_zone_and_clear(mfs)?;
		if let Err(e) = zone::write_map(mfs, ino, pos, new_zone) {
			let _ = mfs.free_zone(new_zone);
			return Err(e);
		}
	}
	ino.size += sbi.dirsize as u32;
	ino.dirty = true;
	write_dentry(mfs, ino, nslots, inum, name)
}

/// Frees the entry with the given name, keeping its name bytes in place.
pub fn remove_dentry(mfs: &Mfs, ino: &mut InodeInfo, name: &[u8]) -> Result<()> {
	match lookup_dentry(mfs, ino, name)? {
		Some((_, index)) => {
			let ent = read_dentry(mfs, ino, index)?;
			write_dentry(mfs, ino, index, 0, &ent.name)
		}
		None => Err(Error::NoEntry),
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::sb::{Version, MFS3_DIRSIZE, MFS_DIRSIZE};

	fn sbi(version: Version) -> SbInfo {
		SbInfo {
			version,
			native: true,
			long_names: false,
			magic: 0,
			state: 0,
			ninodes: 64,
			nzones: 1024,
			ibmap_blocks: 1,
			zbmap_blocks: 1,
			firstdatazone: 10,
			log2_zone_size: 0,
			max_file_size: u32::MAX,
			block_size: 1024,
			ino_per_block: 16,
			dirsize: match version {
				Version::V3 => MFS3_DIRSIZE,
				_ => MFS_DIRSIZE,
			},
			max_name_len: match version {
				Version::V3 => 60,
				_ => 14,
			},
			itable_off: 4,
		}
	}

	#[test]
	fn encode_decode_roundtrip_v3() {
		let sbi = sbi(Version::V3);
		let mut slot = [0u8; MFS3_DIRSIZE];
		encode_dentry(&sbi, &mut slot, 0x12345, b"some-long-file-name").unwrap();
		let ent = decode_dentry(&sbi, &slot);
		assert_eq!(ent.inum, 0x12345);
		assert_eq!(ent.name, b"some-long-file-name");
	}

	#[test]
	fn encode_decode_roundtrip_v1() {
		let sbi = sbi(Version::V1);
		let mut slot = [0u8; MFS_DIRSIZE];
		encode_dentry(&sbi, &mut slot, 42, b"file.txt").unwrap();
		let ent = decode_dentry(&sbi, &slot);
		assert_eq!(ent.inum, 42);
		assert_eq!(ent.name, b"file.txt");
	}

	#[test]
	fn name_too_long() {
		let sbi = sbi(Version::V1);
		let mut slot = [0u8; MFS_DIRSIZE];
		assert_eq!(
			encode_dentry(&sbi, &mut slot, 1, b"name-of-15-bytes").err(),
			Some(Error::NameTooLong)
		);
	}

	#[test]
	fn v1_inum_overflow() {
		let sbi = sbi(Version::V1);
		let mut slot = [0u8; MFS_DIRSIZE];
		assert_eq!(
			encode_dentry(&sbi, &mut slot, 0x1_0000, b"f").err(),
			Some(Error::Overflow)
		);
	}

	#[test]
	fn freeing_keeps_name_bytes() {
		let sbi = sbi(Version::V1);
		let mut slot = [0u8; MFS_DIRSIZE];
		encode_dentry(&sbi, &mut slot, 42, b"file.txt").unwrap();
		let ent = decode_dentry(&sbi, &slot);
		encode_dentry(&sbi, &mut slot, 0, &ent.name).unwrap();
		let freed = decode_dentry(&sbi, &slot);
		assert_eq!(freed.inum, 0);
		assert_eq!(freed.name, b"file.txt");
	}
}
