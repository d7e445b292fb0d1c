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

//! Buffered block cache.
//!
//! The cache works on filesystem blocks, which may span several device
//! blocks. A block is fetched with [`BlockCache::get`], mutated through its
//! data lock, marked dirty and released with [`BlockCache::put`].
//!
//! In write-back mode, dirty blocks reach the device on [`BlockCache::flush`]
//! or eviction. In write-through mode, `put` writes a dirty block out
//! immediately.

use crate::{dev::BlockDev, Error, Result};
use spin::{Mutex, MutexGuard};
use std::{
	collections::HashMap,
	sync::{
		atomic::{AtomicBool, Ordering::Relaxed},
		Arc,
	},
};

/// Number of cached blocks above which clean unreferenced entries are evicted.
const CACHE_HIWAT: usize = 4096;

/// Cache write policy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CacheMode {
	WriteBack,
	WriteThrough,
}

/// Block fetch hints.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlockFlags {
	None,
	/// The caller overwrites the whole block: skip reading it from the device.
	NoRead,
}

/// A cached filesystem block.
pub struct Block {
	ba: u64,
	data: Mutex<Vec<u8>>,
	dirty: AtomicBool,
}

impl Block {
	/// Returns the block's address, in filesystem blocks.
	pub fn ba(&self) -> u64 {
		self.ba
	}

	/// Locks and returns the block's contents.
	pub fn data(&self) -> MutexGuard<'_, Vec<u8>> {
		self.data.lock()
	}

	/// Marks the block as needing write-back.
	pub fn mark_dirty(&self) {
		self.dirty.store(true, Relaxed);
	}
}

/// A buffered cache over a block device.
pub struct BlockCache {
	dev: Arc<dyn BlockDev>,
	bsize: usize,
	mode: CacheMode,
	blocks: Mutex<HashMap<u64, Arc<Block>>>,
}

impl BlockCache {
	/// Creates a cache of `bsize`-byte filesystem blocks over `dev`.
	///
	/// `bsize` must be a multiple of the device block size.
	pub fn new(dev: Arc<dyn BlockDev>, bsize: usize, mode: CacheMode) -> Result<Self> {
		if bsize == 0 || bsize % dev.bsize() != 0 {
			return Err(Error::NotSupported);
		}
		Ok(Self {
			dev,
			bsize,
			mode,
			blocks: Mutex::new(HashMap::new()),
		})
	}

	pub fn bsize(&self) -> usize {
		self.bsize
	}

	pub fn dev(&self) -> &Arc<dyn BlockDev> {
		&self.dev
	}

	/// Number of filesystem blocks on the device.
	pub fn nblocks(&self) -> u64 {
		self.dev.nblocks() * self.dev.bsize() as u64 / self.bsize as u64
	}

	fn dev_span(&self, ba: u64) -> (u64, usize) {
		let per_blk = self.bsize / self.dev.bsize();
		(ba * per_blk as u64, per_blk)
	}

	/// Returns the block at address `ba`, fetching it from the device on a
	/// cache miss.
	pub fn get(&self, ba: u64, flags: BlockFlags) -> Result<Arc<Block>> {
		if ba >= self.nblocks() {
			return Err(Error::Io);
		}
		let mut blocks = self.blocks.lock();
		if let Some(blk) = blocks.get(&ba) {
			return Ok(blk.clone());
		}
		// Cache miss
		let mut data = vec![0u8; self.bsize];
		if flags != BlockFlags::NoRead {
			let (dev_ba, cnt) = self.dev_span(ba);
			self.dev.read(dev_ba, cnt, &mut data)?;
		}
		let blk = Arc::new(Block {
			ba,
			data: Mutex::new(data),
			dirty: AtomicBool::new(false),
		});
		if blocks.len() >= CACHE_HIWAT {
			blocks.retain(|_, b| Arc::strong_count(b) > 1 || b.dirty.load(Relaxed));
		}
		blocks.insert(ba, blk.clone());
		Ok(blk)
	}

	fn write_out(&self, blk: &Block) -> Result<()> {
		let data = blk.data.lock();
		let (dev_ba, cnt) = self.dev_span(blk.ba);
		self.dev.write(dev_ba, cnt, &data)?;
		blk.dirty.store(false, Relaxed);
		Ok(())
	}

	/// Releases a block obtained with [`Self::get`].
	///
	/// In write-through mode a dirty block is written to the device here.
	pub fn put(&self, blk: &Arc<Block>) -> Result<()> {
		if self.mode == CacheMode::WriteThrough && blk.dirty.load(Relaxed) {
			self.write_out(blk)?;
		}
		Ok(())
	}

	/// Writes every dirty block to the device.
	pub fn flush(&self) -> Result<()> {
		let blocks = self.blocks.lock();
		for blk in blocks.values() {
			if blk.dirty.load(Relaxed) {
				self.write_out(blk)?;
			}
		}
		Ok(())
	}
}

impl Drop for BlockCache {
	fn drop(&mut self) {
		if self.flush().is_err() {
			log::error!("failed flushing block cache on drop");
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::dev::MemDev;

	fn cache(mode: CacheMode) -> BlockCache {
		let dev = Arc::new(MemDev::new(512, 16));
		BlockCache::new(dev, 1024, mode).unwrap()
	}

	#[test]
	fn hit_returns_same_block() {
		let cache = cache(CacheMode::WriteBack);
		let a = cache.get(3, BlockFlags::None).unwrap();
		let b = cache.get(3, BlockFlags::None).unwrap();
		assert!(Arc::ptr_eq(&a, &b));
	}

	#[test]
	fn write_back_reaches_device_on_flush() {
		let cache = cache(CacheMode::WriteBack);
		{
			let blk = cache.get(2, BlockFlags::NoRead).unwrap();
			blk.data().fill(0x5a);
			blk.mark_dirty();
			cache.put(&blk).unwrap();
		}
		let mut raw = [0u8; 512];
		cache.dev().read(4, 1, &mut raw).unwrap();
		assert_eq!(raw, [0; 512]);
		cache.flush().unwrap();
		cache.dev().read(4, 1, &mut raw).unwrap();
		assert_eq!(raw, [0x5a; 512]);
	}

	#[test]
	fn write_through_reaches_device_on_put() {
		let cache = cache(CacheMode::WriteThrough);
		let blk = cache.get(2, BlockFlags::NoRead).unwrap();
		blk.data().fill(0x5a);
		blk.mark_dirty();
		cache.put(&blk).unwrap();
		let mut raw = [0u8; 512];
		cache.dev().read(4, 1, &mut raw).unwrap();
		assert_eq!(raw, [0x5a; 512]);
	}

	#[test]
	fn out_of_range_block() {
		let cache = cache(CacheMode::WriteBack);
		assert_eq!(cache.get(8, BlockFlags::None).err(), Some(Error::Io));
	}
}
