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

//! Filesystem creation.
//!
//! [`create`] writes an empty MINIX filesystem onto a device: superblock,
//! bitmaps (with the reserved bits of the tails set), a zeroed inode table
//! and a root directory holding `.` and `..`.

use crate::{
	cache::{BlockCache, BlockFlags, CacheMode},
	dev::{write_bytes, BlockDev},
	dirent, inode,
	inode::{InodeInfo, S_IFDIR},
	sb,
	sb::{Raw3Superblock, RawSuperblock, SbInfo, Version, MFS_ROOT_INO},
	Error, Result,
};
use log::info;
use std::{
	sync::Arc,
	time::{SystemTime, UNIX_EPOCH},
};

/// Parameters for filesystem creation.
#[derive(Clone, Debug)]
pub struct MkfsParams {
	pub version: Version,
	/// Filesystem block size; must be 1024 for versions 1 and 2.
	pub block_size: usize,
	/// Number of inodes; derived from the device size when `None`.
	pub ninodes: Option<u32>,
}

impl Default for MkfsParams {
	fn default() -> Self {
		Self {
			version: Version::V3,
			block_size: sb::MFS_BLOCKSIZE,
			ninodes: None,
		}
	}
}

/// Tells whether a MINIX filesystem is present on `dev`.
pub fn is_present(dev: &dyn BlockDev) -> bool {
	sb::probe(dev).is_ok()
}

/// Sets the bits `0..end` and `limit..` of a bitmap spanning `nblocks`
/// blocks, leaving `end..limit` clear.
fn fill_bitmap(cache: &BlockCache, start_block: u64, nblocks: u32, end: u32, limit: u32) -> Result<()> {
	let bits_per_block = (cache.bsize() * 8) as u32;
	for i in 0..nblocks {
		let blk = cache.get(start_block + i as u64, BlockFlags::NoRead)?;
		{
			let mut data = blk.data();
			data.fill(0);
			for j in 0..bits_per_block {
				let bit = i * bits_per_block + j;
				if bit < end || bit >= limit {
					data[(j / 8) as usize] |= 1 << (j % 8);
				}
			}
			blk.mark_dirty();
		}
		cache.put(&blk)?;
	}
	Ok(())
}

fn build_time() -> u32 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs() as u32)
		.unwrap_or(0)
}

/// Creates a MINIX filesystem on `dev`.
pub fn create(dev: &Arc<dyn BlockDev>, params: &MkfsParams) -> Result<()> {
	let version = params.version;
	let block_size = params.block_size;
	match version {
		Version::V3 => {
			if !block_size.is_power_of_two()
				|| block_size < sb::MFS_BLOCKSIZE
				|| block_size > sb::MFS_MAX_BLOCKSIZE
			{
				return Err(Error::InvalidArg);
			}
		}
		_ => {
			if block_size != sb::MFS_BLOCKSIZE {
				return Err(Error::InvalidArg);
			}
		}
	}
	let dev_bytes = dev.nblocks() * dev.bsize() as u64;
	let mut nzones = dev_bytes / block_size as u64;
	// Version 1 zone pointers are 16 bits wide
	if version == Version::V1 {
		nzones = nzones.min(u16::MAX as u64);
	} else {
		nzones = nzones.min(u32::MAX as u64);
	}
	let nzones = nzones as u32;
	let ino_per_block = match version {
		Version::V1 => block_size / sb::V1_INODE_SIZE,
		_ => block_size / sb::V2_INODE_SIZE,
	};
	// One inode per three zones by default, rounded up to a full table block
	let max_inodes = match version {
		Version::V1 | Version::V2 => u16::MAX as u32,
		Version::V3 => 1 << 24,
	} / ino_per_block as u32
		* ino_per_block as u32;
	let ninodes = params
		.ninodes
		.unwrap_or((nzones / 3).max(16))
		.min(max_inodes)
		.next_multiple_of(ino_per_block as u32)
		.min(max_inodes);
	let bits_per_block = (block_size * 8) as u32;
	let ibmap_blocks = (ninodes + 1).div_ceil(bits_per_block);
	let zbmap_blocks = nzones.div_ceil(bits_per_block);
	let itable_blocks = ninodes.div_ceil(ino_per_block as u32);
	let firstdatazone = 2 + ibmap_blocks + zbmap_blocks + itable_blocks;
	// The superblock stores the first data zone as a 16-bit field
	if firstdatazone + 1 >= nzones || firstdatazone > u16::MAX as u32 {
		return Err(Error::InvalidArg);
	}
	let ptrs_per_block = (block_size / version.ptr_size()) as u64;
	let max_file_size = ((7 + ptrs_per_block + ptrs_per_block * ptrs_per_block)
		* block_size as u64)
		.min(u32::MAX as u64) as u32;
	// Zero everything up to and including the root directory zone
	let zero = vec![0u8; block_size];
	for blk in 0..=firstdatazone as u64 {
		write_bytes(dev.as_ref(), blk * block_size as u64, &zero)?;
	}
	// Superblock
	let mut sb_bytes = [0u8; 32];
	match version {
		Version::V3 => {
			let raw = Raw3Superblock {
				s_ninodes: ninodes,
				_pad0: 0,
				s_ibmap_blocks: ibmap_blocks as u16,
				s_zbmap_blocks: zbmap_blocks as u16,
				s_first_data_zone: firstdatazone as u16,
				s_log2_zone_size: 0,
				_pad1: 0,
				s_max_file_size: max_file_size,
				s_nzones: nzones,
				s_magic: sb::MFS_MAGIC_V3,
				_pad2: 0,
				s_block_size: block_size as u16,
				_s_disk_version: 0,
				_pad3: 0,
			};
			raw.to_bytes(true, &mut sb_bytes);
		}
		_ => {
			let magic = match version {
				Version::V1 => sb::MFS_MAGIC_V1,
				_ => sb::MFS_MAGIC_V2,
			};
			let raw = RawSuperblock {
				s_ninodes: ninodes as u16,
				s_nzones: nzones.min(u16::MAX as u32) as u16,
				s_ibmap_blocks: ibmap_blocks as u16,
				s_zbmap_blocks: zbmap_blocks as u16,
				s_first_data_zone: firstdatazone as u16,
				s_log2_zone_size: 0,
				s_max_file_size: max_file_size,
				s_magic: magic,
				s_state: 1,
				s_nzones2: nzones,
			};
			raw.to_bytes(true, &mut sb_bytes);
		}
	}
	write_bytes(dev.as_ref(), sb::SUPERBLOCK_OFFSET, &sb_bytes)?;
	// Re-read through the regular mount path, so layout mistakes surface
	// right here
	let sbi = sb::read_sb_info(dev.as_ref())?;
	let cache = BlockCache::new(dev.clone(), sbi.block_size, CacheMode::WriteBack)?;
	write_metadata(&cache, &sbi)?;
	cache.flush()?;
	info!(
		"mkfs: MINIX {version:?}, {ninodes} inodes, {nzones} zones, block size {block_size}"
	);
	Ok(())
}

/// Writes the bitmaps, the root inode and the root directory.
fn write_metadata(cache: &BlockCache, sbi: &SbInfo) -> Result<()> {
	// Inode bitmap: bit 0 (no inode 0) and bit 1 (root) are taken
	fill_bitmap(cache, 2, sbi.ibmap_blocks, 2, sbi.ninodes + 1)?;
	// Zone bitmap: bit 0 is the root directory zone
	fill_bitmap(
		cache,
		2 + sbi.ibmap_blocks as u64,
		sbi.zbmap_blocks,
		1,
		sbi.nzones - sbi.firstdatazone,
	)?;
	let now = build_time();
	let root = InodeInfo {
		index: MFS_ROOT_INO,
		mode: S_IFDIR | 0o755,
		nlinks: 2,
		size: 2 * sbi.dirsize as u32,
		atime: now,
		mtime: now,
		ctime: now,
		dzone: [sbi.firstdatazone, 0, 0, 0, 0, 0, 0],
		..Default::default()
	};
	inode::write_inode(cache, sbi, &root)?;
	// Root directory: `.` and `..` both point at the root
	let blk = cache.get(sbi.firstdatazone as u64, BlockFlags::NoRead)?;
	{
		let mut data = blk.data();
		data.fill(0);
		dirent::encode_dentry(sbi, &mut data[..sbi.dirsize], MFS_ROOT_INO, b".")?;
		dirent::encode_dentry(sbi, &mut data[sbi.dirsize..2 * sbi.dirsize], MFS_ROOT_INO, b"..")?;
		blk.mark_dirty();
	}
	cache.put(&blk)
}
