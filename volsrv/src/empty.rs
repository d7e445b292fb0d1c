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

//! Empty partition handling.
//!
//! A partition counts as empty when the blocks any supported filesystem or
//! label format would use for recognition are all zero: the first blocks of
//! the device and the last ones (backup GPT headers live at the end). Wiping
//! clears exactly the same region, so [`part_is_empty`] holds after
//! [`part_empty`].

use crate::Result;
use mfs::dev::BlockDev;

/// Number of leading device blocks making up the recognition area.
const HEAD_BLOCKS: u64 = 64;
/// Number of trailing device blocks making up the recognition area.
const TAIL_BLOCKS: u64 = 2;

/// Returns the block ranges making up the recognition area.
fn recognition_area(dev: &dyn BlockDev) -> Vec<(u64, u64)> {
	let nblocks = dev.nblocks();
	let head = nblocks.min(HEAD_BLOCKS);
	let tail_start = nblocks.saturating_sub(TAIL_BLOCKS).max(head);
	vec![(0, head), (tail_start, nblocks)]
}

/// Tells whether the partition is empty.
pub fn part_is_empty(dev: &dyn BlockDev) -> Result<bool> {
	let bsize = dev.bsize();
	let mut buf = vec![0u8; bsize];
	for (start, end) in recognition_area(dev) {
		for ba in start..end {
			dev.read(ba, 1, &mut buf)?;
			if buf.iter().any(|b| *b != 0) {
				return Ok(false);
			}
		}
	}
	Ok(true)
}

/// Wipes the partition's recognition area.
pub fn part_empty(dev: &dyn BlockDev) -> Result<()> {
	let bsize = dev.bsize();
	let zero = vec![0u8; bsize];
	for (start, end) in recognition_area(dev) {
		for ba in start..end {
			dev.write(ba, 1, &zero)?;
		}
	}
	Ok(())
}
