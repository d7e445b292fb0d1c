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

//! Inode and zone bitmap allocator.
//!
//! Both bitmaps are arrays of blocks directly after the superblock, scanned
//! word by word (32-bit little-endian words on disk). A rolling search cursor
//! per bitmap avoids rescanning the beginning on every allocation; when the
//! tail yields nothing the scan restarts once from bit 0.
//!
//! Bit 0 of the inode bitmap is permanently set: there is no inode 0. Bit `i`
//! of the zone bitmap addresses the physical zone `firstdatazone + i`.

use crate::{
	cache::{BlockCache, BlockFlags},
	endian::conv32,
	sb::SbInfo,
	Error, Result,
};
use log::warn;

/// Identifies one of the two bitmaps.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BmapId {
	Inode,
	Zone,
}

/// Rolling search cursors, one per bitmap.
#[derive(Clone, Copy, Debug, Default)]
pub struct BitmapCursors {
	pub isearch: u32,
	pub zsearch: u32,
}

/// Start block and bit count of the bitmap `bid`.
fn bmap_layout(sbi: &SbInfo, bid: BmapId) -> (u64, u32, u32) {
	match bid {
		// Bits 0..=ninodes, bit 0 unused
		BmapId::Inode => (2, sbi.ibmap_blocks, sbi.ninodes + 1),
		BmapId::Zone => (
			2 + sbi.ibmap_blocks as u64,
			sbi.zbmap_blocks,
			sbi.nzones - sbi.firstdatazone,
		),
	}
}

/// Finds the lowest clear bit at index >= `start_bit` in `data`, scanning
/// 32-bit words.
fn find_free_bit(native: bool, data: &[u8], start_bit: u32) -> Option<u32> {
	let nwords = data.len() / 4;
	for w in (start_bit as usize / 32)..nwords {
		let word = conv32(
			native,
			u32::from_le_bytes([data[w * 4], data[w * 4 + 1], data[w * 4 + 2], data[w * 4 + 3]]),
		);
		if word == u32::MAX {
			continue;
		}
		for j in 0..32 {
			let bit = (w * 32 + j) as u32;
			if bit >= start_bit && word & (1 << j) == 0 {
				return Some(bit);
			}
		}
	}
	None
}

fn set_bit(native: bool, data: &mut [u8], bit: u32, value: bool) -> bool {
	let w = bit as usize / 32;
	let mut word = conv32(
		native,
		u32::from_le_bytes([data[w * 4], data[w * 4 + 1], data[w * 4 + 2], data[w * 4 + 3]]),
	);
	let mask = 1u32 << (bit % 32);
	let was_set = word & mask != 0;
	if value {
		word |= mask;
	} else {
		word &= !mask;
	}
	data[w * 4..w * 4 + 4].copy_from_slice(&conv32(native, word).to_le_bytes());
	was_set
}

/// Allocates the lowest free bit at index >= the bitmap's search cursor.
///
/// The cursor is advanced past the allocated bit. If the tail of the bitmap
/// is full, the search restarts once from bit 0; if that also fails, the
/// function returns [`Error::NoSpace`].
pub fn alloc_bit(
	cache: &BlockCache,
	sbi: &SbInfo,
	cursors: &mut BitmapCursors,
	bid: BmapId,
) -> Result<u32> {
	let (start_block, nblocks, nbits) = bmap_layout(sbi, bid);
	let bits_per_block = (sbi.block_size * 8) as u32;
	// Bit 0 of the inode bitmap must never be handed out, even when a
	// corrupt image leaves it clear
	let first = match bid {
		BmapId::Inode => 1,
		BmapId::Zone => 0,
	};
	let search = match bid {
		BmapId::Inode => &mut cursors.isearch,
		BmapId::Zone => &mut cursors.zsearch,
	};
	let mut start = (*search).max(first);
	loop {
		for i in (start / bits_per_block)..nblocks {
			let blk = cache.get(start_block + i as u64, BlockFlags::None)?;
			let from = start.saturating_sub(i * bits_per_block);
			let found = {
				let mut data = blk.data();
				match find_free_bit(sbi.native, &data, from) {
					Some(bit) if i * bits_per_block + bit < nbits => {
						set_bit(sbi.native, &mut data, bit, true);
						Some(i * bits_per_block + bit)
					}
					// A clear bit past the end of the map is a reserved tail
					// bit: the map is exhausted
					_ => None,
				}
			};
			if let Some(idx) = found {
				blk.mark_dirty();
				cache.put(&blk)?;
				*search = idx + 1;
				return Ok(idx);
			}
			cache.put(&blk)?;
		}
		if start == first {
			return Err(Error::NoSpace);
		}
		// Repeat the search from the first bitmap block
		start = first;
	}
}

/// Clears the bit `idx` in the bitmap `bid`.
///
/// Clearing an already-clear bit is tolerated but logged.
pub fn free_bit(cache: &BlockCache, sbi: &SbInfo, bid: BmapId, idx: u32) -> Result<()> {
	let (start_block, _, nbits) = bmap_layout(sbi, bid);
	if idx >= nbits {
		return Err(Error::InvalidArg);
	}
	let bits_per_block = (sbi.block_size * 8) as u32;
	let blk = cache.get(start_block + (idx / bits_per_block) as u64, BlockFlags::None)?;
	let was_set = set_bit(sbi.native, &mut blk.data(), idx % bits_per_block, false);
	if !was_set {
		warn!("freeing already-free {bid:?} bit {idx}");
	}
	blk.mark_dirty();
	cache.put(&blk)
}
