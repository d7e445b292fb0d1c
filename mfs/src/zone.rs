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

//! Logical-to-physical zone translation.
//!
//! An inode maps its content through 7 direct zone pointers, one single
//! indirect zone and one double indirect zone. A stored zone number of `0`
//! denotes a sparse hole.
//!
//! In write mode, missing indirect zones along the path are allocated and
//! zeroed, and the indirect block is written back before the inode is marked
//! dirty, so a crash between the two may leak zones but never corrupts live
//! data.

use crate::{
	cache::BlockFlags,
	endian::{conv16, conv32},
	inode::{InodeInfo, NR_DIRECT_ZONES},
	ops::Mfs,
	sb::Version,
	Error, Result,
};

/// Validates a stored zone number.
///
/// Zero (a sparse hole) is returned unchanged; a non-zero zone outside the
/// data area means the filesystem structure is corrupt.
fn check_zone(mfs: &Mfs, zone: u32) -> Result<u32> {
	let sbi = mfs.sbi();
	if zone != 0 && (zone < sbi.firstdatazone || zone >= sbi.nzones) {
		return Err(Error::Io);
	}
	Ok(zone)
}

/// Reads the indirect zone `zone` as an array of zone numbers.
fn read_ind_zone(mfs: &Mfs, zone: u32) -> Result<Vec<u32>> {
	let sbi = mfs.sbi();
	let blk = mfs.cache().get(zone as u64, BlockFlags::None)?;
	let data = blk.data();
	let ind = match sbi.version {
		Version::V1 => data
			.chunks_exact(2)
			.map(|c| conv16(sbi.native, u16::from_le_bytes([c[0], c[1]])) as u32)
			.collect(),
		_ => data
			.chunks_exact(4)
			.map(|c| conv32(sbi.native, u32::from_le_bytes([c[0], c[1], c[2], c[3]])))
			.collect(),
	};
	drop(data);
	mfs.cache().put(&blk)?;
	Ok(ind)
}

/// Writes `ind` back to the indirect zone `zone`.
fn write_ind_zone(mfs: &Mfs, zone: u32, ind: &[u32]) -> Result<()> {
	let sbi = mfs.sbi();
	let blk = mfs.cache().get(zone as u64, BlockFlags::None)?;
	{
		let mut data = blk.data();
		match sbi.version {
			Version::V1 => {
				for (i, z) in ind.iter().enumerate() {
					let z: u16 = (*z).try_into().map_err(|_| Error::Overflow)?;
					data[i * 2..i * 2 + 2].copy_from_slice(&conv16(sbi.native, z).to_le_bytes());
				}
			}
			_ => {
				for (i, z) in ind.iter().enumerate() {
					data[i * 4..i * 4 + 4].copy_from_slice(&conv32(sbi.native, *z).to_le_bytes());
				}
			}
		}
		blk.mark_dirty();
	}
	mfs.cache().put(&blk)
}

/// Allocates a zone and zeroes its content.
pub(crate) fn alloc_zone_and_clear(mfs: &Mfs) -> Result<u32> {
	let zone = mfs.alloc_zone()?;
	let blk = mfs.cache().get(zone as u64, BlockFlags::NoRead)?;
	blk.data().fill(0);
	blk.mark_dirty();
	mfs.cache().put(&blk)?;
	Ok(zone)
}

/// Translates the file-relative block `rblock` to its physical zone,
/// returning `0` for a sparse hole.
///
/// In write mode (`write_mode` true), the pointer at the final slot is
/// replaced with `new_zone` and the previous value returned, allocating
/// missing indirect zones along the path. Storing `0` frees indirect zones
/// that become entirely sparse.
fn rw_map(
	mfs: &Mfs,
	ino: &mut InodeInfo,
	rblock: u32,
	write_mode: bool,
	new_zone: u32,
) -> Result<u32> {
	let ptrs_per_block = mfs.sbi().ptrs_per_block() as u32;
	let mut rblock = rblock;
	// Direct zones
	if (rblock as usize) < NR_DIRECT_ZONES {
		let old = check_zone(mfs, ino.dzone[rblock as usize])?;
		if write_mode {
			ino.dzone[rblock as usize] = new_zone;
			ino.dirty = true;
		}
		return Ok(old);
	}
	rblock -= NR_DIRECT_ZONES as u32;
	// Single indirect chain
	if rblock < ptrs_per_block {
		if check_zone(mfs, ino.izone[0])? == 0 {
			if !write_mode || new_zone == 0 {
				return Ok(0);
			}
			ino.izone[0] = alloc_zone_and_clear(mfs)?;
			ino.dirty = true;
		}
		let mut ind = read_ind_zone(mfs, ino.izone[0])?;
		let old = check_zone(mfs, ind[rblock as usize])?;
		if write_mode {
			ind[rblock as usize] = new_zone;
			write_ind_zone(mfs, ino.izone[0], &ind)?;
			if new_zone == 0 && ind.iter().all(|z| *z == 0) {
				mfs.free_zone(ino.izone[0])?;
				ino.izone[0] = 0;
				ino.dirty = true;
			}
		}
		return Ok(old);
	}
	rblock -= ptrs_per_block;
	// Double indirect chain
	if rblock >= ptrs_per_block * ptrs_per_block {
		// Beyond the double indirect area: sparse for reads
		return if write_mode && new_zone != 0 {
			Err(Error::FileTooLarge)
		} else {
			Ok(0)
		};
	}
	if check_zone(mfs, ino.izone[1])? == 0 {
		if !write_mode || new_zone == 0 {
			return Ok(0);
		}
		ino.izone[1] = alloc_zone_and_clear(mfs)?;
		ino.dirty = true;
	}
	let mut ind = read_ind_zone(mfs, ino.izone[1])?;
	let ind2_off = (rblock / ptrs_per_block) as usize;
	if check_zone(mfs, ind[ind2_off])? == 0 {
		if !write_mode || new_zone == 0 {
			return Ok(0);
		}
		let zone = alloc_zone_and_clear(mfs)?;
		ind[ind2_off] = zone;
		write_ind_zone(mfs, ino.izone[1], &ind)?;
	}
	let mut ind2 = read_ind_zone(mfs, ind[ind2_off])?;
	let slot = (rblock % ptrs_per_block) as usize;
	let old = check_zone(mfs, ind2[slot])?;
	if write_mode {
		ind2[slot] = new_zone;
		write_ind_zone(mfs, ind[ind2_off], &ind2)?;
		if new_zone == 0 && ind2.iter().all(|z| *z == 0) {
			mfs.free_zone(ind[ind2_off])?;
			ind[ind2_off] = 0;
			write_ind_zone(mfs, ino.izone[1], &ind)?;
			if ind.iter().all(|z| *z == 0) {
				mfs.free_zone(ino.izone[1])?;
				ino.izone[1] = 0;
				ino.dirty = true;
			}
		}
	}
	Ok(old)
}

/// Returns the physical zone holding the file-relative block `rblock`,
/// without end-of-file semantics.
pub(crate) fn map_rblock(mfs: &Mfs, ino: &InodeInfo, rblock: u32) -> Result<u32> {
	// Read mode does not mutate the inode
	let mut ino = ino.clone();
	rw_map(mfs, &mut ino, rblock, false, 0)
}

/// Given a position in the file in bytes, returns the physical zone holding
/// it, `0` when the position is sparse or past the end of the file.
pub fn read_map(mfs: &Mfs, ino: &InodeInfo, pos: u32) -> Result<u32> {
	if ino.size < pos {
		// Reading beyond the end of file
		return Ok(0);
	}
	map_rblock(mfs, ino, pos / mfs.sbi().block_size as u32)
}

/// Maps the position `pos` to `new_zone`, returning the previously mapped
/// zone so the caller can free it.
pub fn write_map(mfs: &Mfs, ino: &mut InodeInfo, pos: u32, new_zone: u32) -> Result<u32> {
	let rblock = pos / mfs.sbi().block_size as u32;
	rw_map(mfs, ino, rblock, true, new_zone)
}

/// Truncates the inode's content to `new_size` bytes, freeing every zone past
/// the new end, highest to lowest, along with indirect zones that become
/// entirely sparse.
pub fn shrink(mfs: &Mfs, ino: &mut InodeInfo, new_size: u32) -> Result<()> {
	if new_size >= ino.size {
		return Ok(());
	}
	let bs = mfs.sbi().block_size as u32;
	let old_blocks = ino.size.div_ceil(bs);
	let new_blocks = new_size.div_ceil(bs);
	for rblock in (new_blocks..old_blocks).rev() {
		let old = rw_map(mfs, ino, rblock, true, 0)?;
		if old != 0 {
			mfs.free_zone(old)?;
		}
	}
	ino.size = new_size;
	ino.dirty = true;
	Ok(())
}
