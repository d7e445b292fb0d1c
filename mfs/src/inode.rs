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

//! An inode represents a file in the filesystem.
//!
//! The name of the file is not included in the inode but in the directory
//! entry associated with it since several entries can refer to the same inode
//! (hard links).
//!
//! Version 1 stores 32-byte inodes with 16-bit zone pointers and an 8-bit
//! link count; versions 2 and 3 store 64-byte inodes with 32-bit zone
//! pointers and full timestamps. [`InodeInfo`] is the uniform in-memory form;
//! fields absent from the on-disk version are zero.

use crate::{
	cache::{BlockCache, BlockFlags},
	endian::{conv16, conv32},
	sb::{SbInfo, Version},
	Error, Result,
};
use static_assertions::const_assert_eq;
use std::mem::size_of;

/// The number of direct zone pointers in an inode.
pub const NR_DIRECT_ZONES: usize = 7;
/// The number of indirect zone pointers in an inode (single, double).
pub const NR_INDIRECT_ZONES: usize = 2;

/// File type mask of the mode field.
pub const S_IFMT: u16 = 0xf000;
/// Mode: directory.
pub const S_IFDIR: u16 = 0x4000;
/// Mode: regular file.
pub const S_IFREG: u16 = 0x8000;

/// The version 1 on-disk inode.
#[repr(C)]
struct RawInode {
	/// Type and permissions.
	i_mode: u16,
	/// User ID.
	i_uid: u16,
	/// Size in bytes.
	i_size: u32,
	/// Timestamp of the last modification of the content.
	i_mtime: u32,
	/// Group ID.
	i_gid: u8,
	/// The number of hard links to this inode.
	i_nlinks: u8,
	/// Zone pointers: 7 direct, single indirect, double indirect.
	i_zone: [u16; NR_DIRECT_ZONES + NR_INDIRECT_ZONES],
}
const_assert_eq!(size_of::<RawInode>(), 32);

/// The version 2/3 on-disk inode.
#[repr(C)]
struct Raw2Inode {
	/// Type and permissions.
	i_mode: u16,
	/// The number of hard links to this inode.
	i_nlinks: u16,
	/// User ID.
	i_uid: u16,
	/// Group ID.
	i_gid: u16,
	/// Size in bytes.
	i_size: u32,
	/// Timestamp of the last access.
	i_atime: u32,
	/// Timestamp of the last modification of the content.
	i_mtime: u32,
	/// Timestamp of the last modification of the metadata.
	i_ctime: u32,
	/// Zone pointers: 7 direct, single indirect, double indirect, one unused.
	i_zone: [u32; NR_DIRECT_ZONES + NR_INDIRECT_ZONES + 1],
}
const_assert_eq!(size_of::<Raw2Inode>(), 64);

/// The uniform in-memory inode.
#[derive(Clone, Debug, Default)]
pub struct InodeInfo {
	/// The inode's 1-based index in the inode table.
	pub index: u32,
	/// Type and permissions.
	pub mode: u16,
	/// The number of hard links to this inode.
	pub nlinks: u16,
	/// User ID.
	pub uid: u16,
	/// Group ID.
	pub gid: u16,
	/// Size in bytes.
	pub size: u32,
	/// Timestamp of the last access.
	pub atime: u32,
	/// Timestamp of the last modification of the content.
	pub mtime: u32,
	/// Timestamp of the last modification of the metadata.
	pub ctime: u32,
	/// Direct zone pointers.
	pub dzone: [u32; NR_DIRECT_ZONES],
	/// Indirect zone pointers (single, double).
	pub izone: [u32; NR_INDIRECT_ZONES],
	/// Whether the in-memory form differs from the on-disk record.
	pub dirty: bool,
}

impl InodeInfo {
	pub fn is_dir(&self) -> bool {
		self.mode & S_IFMT == S_IFDIR
	}

	pub fn is_reg(&self) -> bool {
		self.mode & S_IFMT == S_IFREG
	}
}

/// Returns the block and byte offset of the inode slot `index`.
fn slot(sbi: &SbInfo, index: u32) -> Result<(u64, usize)> {
	if index == 0 || index > sbi.ninodes {
		return Err(Error::InvalidArg);
	}
	let i = (index - 1) as u64;
	let block = sbi.itable_off + i / sbi.ino_per_block as u64;
	let off = (i % sbi.ino_per_block as u64) as usize * sbi.version.inode_size();
	Ok((block, off))
}

fn r16(buf: &[u8], off: usize) -> u16 {
	u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn r32(buf: &[u8], off: usize) -> u32 {
	u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn w16(buf: &mut [u8], off: usize, val: u16) {
	buf[off..off + 2].copy_from_slice(&val.to_le_bytes());
}

fn w32(buf: &mut [u8], off: usize, val: u32) {
	buf[off..off + 4].copy_from_slice(&val.to_le_bytes());
}

impl RawInode {
	fn from_bytes(native: bool, buf: &[u8]) -> Self {
		let mut i_zone = [0u16; NR_DIRECT_ZONES + NR_INDIRECT_ZONES];
		for (i, z) in i_zone.iter_mut().enumerate() {
			*z = conv16(native, r16(buf, 14 + i * 2));
		}
		Self {
			i_mode: conv16(native, r16(buf, 0)),
			i_uid: conv16(native, r16(buf, 2)),
			i_size: conv32(native, r32(buf, 4)),
			i_mtime: conv32(native, r32(buf, 8)),
			i_gid: buf[12],
			i_nlinks: buf[13],
			i_zone,
		}
	}

	fn to_bytes(&self, native: bool, buf: &mut [u8]) {
		w16(buf, 0, conv16(native, self.i_mode));
		w16(buf, 2, conv16(native, self.i_uid));
		w32(buf, 4, conv32(native, self.i_size));
		w32(buf, 8, conv32(native, self.i_mtime));
		buf[12] = self.i_gid;
		buf[13] = self.i_nlinks;
		for (i, z) in self.i_zone.iter().enumerate() {
			w16(buf, 14 + i * 2, conv16(native, *z));
		}
	}
}

impl Raw2Inode {
	fn from_bytes(native: bool, buf: &[u8]) -> Self {
		let mut i_zone = [0u32; NR_DIRECT_ZONES + NR_INDIRECT_ZONES + 1];
		for (i, z) in i_zone.iter_mut().enumerate() {
			*z = conv32(native, r32(buf, 24 + i * 4));
		}
		Self {
			i_mode: conv16(native, r16(buf, 0)),
			i_nlinks: conv16(native, r16(buf, 2)),
			i_uid: conv16(native, r16(buf, 4)),
			i_gid: conv16(native, r16(buf, 6)),
			i_size: conv32(native, r32(buf, 8)),
			i_atime: conv32(native, r32(buf, 12)),
			i_mtime: conv32(native, r32(buf, 16)),
			i_ctime: conv32(native, r32(buf, 20)),
			i_zone,
		}
	}

	fn to_bytes(&self, native: bool, buf: &mut [u8]) {
		w16(buf, 0, conv16(native, self.i_mode));
		w16(buf, 2, conv16(native, self.i_nlinks));
		w16(buf, 4, conv16(native, self.i_uid));
		w16(buf, 6, conv16(native, self.i_gid));
		w32(buf, 8, conv32(native, self.i_size));
		w32(buf, 12, conv32(native, self.i_atime));
		w32(buf, 16, conv32(native, self.i_mtime));
		w32(buf, 20, conv32(native, self.i_ctime));
		for (i, z) in self.i_zone.iter().enumerate() {
			w32(buf, 24 + i * 4, conv32(native, *z));
		}
	}
}

/// Reads the inode slot `index` from the inode table.
pub fn read_inode(cache: &BlockCache, sbi: &SbInfo, index: u32) -> Result<InodeInfo> {
	let (block, off) = slot(sbi, index)?;
	let blk = cache.get(block, BlockFlags::None)?;
	let data = blk.data();
	let slot = &data[off..off + sbi.version.inode_size()];
	let info = match sbi.version {
		Version::V1 => {
			let raw = RawInode::from_bytes(sbi.native, slot);
			InodeInfo {
				index,
				mode: raw.i_mode,
				nlinks: raw.i_nlinks as u16,
				uid: raw.i_uid,
				gid: raw.i_gid as u16,
				size: raw.i_size,
				atime: 0,
				mtime: raw.i_mtime,
				ctime: 0,
				dzone: {
					let mut dz = [0u32; NR_DIRECT_ZONES];
					for (i, z) in dz.iter_mut().enumerate() {
						*z = raw.i_zone[i] as u32;
					}
					dz
				},
				izone: [
					raw.i_zone[NR_DIRECT_ZONES] as u32,
					raw.i_zone[NR_DIRECT_ZONES + 1] as u32,
				],
				dirty: false,
			}
		}
		_ => {
			let raw = Raw2Inode::from_bytes(sbi.native, slot);
			InodeInfo {
				index,
				mode: raw.i_mode,
				nlinks: raw.i_nlinks,
				uid: raw.i_uid,
				gid: raw.i_gid,
				size: raw.i_size,
				atime: raw.i_atime,
				mtime: raw.i_mtime,
				ctime: raw.i_ctime,
				dzone: {
					let mut dz = [0u32; NR_DIRECT_ZONES];
					dz.copy_from_slice(&raw.i_zone[..NR_DIRECT_ZONES]);
					dz
				},
				izone: [raw.i_zone[NR_DIRECT_ZONES], raw.i_zone[NR_DIRECT_ZONES + 1]],
				dirty: false,
			}
		}
	};
	drop(data);
	cache.put(&blk)?;
	Ok(info)
}

/// Writes `ino` back to its inode table slot.
pub fn write_inode(cache: &BlockCache, sbi: &SbInfo, ino: &InodeInfo) -> Result<()> {
	let (block, off) = slot(sbi, ino.index)?;
	let blk = cache.get(block, BlockFlags::None)?;
	{
		let mut data = blk.data();
		let slot = &mut data[off..off + sbi.version.inode_size()];
		match sbi.version {
			Version::V1 => {
				if ino.nlinks > u8::MAX as u16 {
					return Err(Error::Overflow);
				}
				let mut i_zone = [0u16; NR_DIRECT_ZONES + NR_INDIRECT_ZONES];
				for (i, z) in i_zone.iter_mut().enumerate() {
					let zone = if i < NR_DIRECT_ZONES {
						ino.dzone[i]
					} else {
						ino.izone[i - NR_DIRECT_ZONES]
					};
					*z = zone.try_into().map_err(|_| Error::Overflow)?;
				}
				let raw = RawInode {
					i_mode: ino.mode,
					i_uid: ino.uid,
					i_size: ino.size,
					i_mtime: ino.mtime,
					i_gid: ino.gid as u8,
					i_nlinks: ino.nlinks as u8,
					i_zone,
				};
				raw.to_bytes(sbi.native, slot);
			}
			_ => {
				let mut i_zone = [0u32; NR_DIRECT_ZONES + NR_INDIRECT_ZONES + 1];
				i_zone[..NR_DIRECT_ZONES].copy_from_slice(&ino.dzone);
				i_zone[NR_DIRECT_ZONES] = ino.izone[0];
				i_zone[NR_DIRECT_ZONES + 1] = ino.izone[1];
				let raw = Raw2Inode {
					i_mode: ino.mode,
					i_nlinks: ino.nlinks,
					i_uid: ino.uid,
					i_gid: ino.gid,
					i_size: ino.size,
					i_atime: ino.atime,
					i_mtime: ino.mtime,
					i_ctime: ino.ctime,
					i_zone,
				};
				raw.to_bytes(sbi.native, slot);
			}
		}
		blk.mark_dirty();
	}
	cache.put(&blk)
}

/// Zeroes the inode table slot `index`, after the inode has been destroyed.
pub fn clear_inode(cache: &BlockCache, sbi: &SbInfo, index: u32) -> Result<()> {
	let (block, off) = slot(sbi, index)?;
	let blk = cache.get(block, BlockFlags::None)?;
	blk.data()[off..off + sbi.version.inode_size()].fill(0);
	blk.mark_dirty();
	cache.put(&blk)
}
