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

//! Block device abstraction.
//!
//! The filesystem engine talks to storage exclusively through [`BlockDev`].
//! Two implementations are provided: [`MemDev`], an in-memory device used by
//! tests and image manipulation, and [`FileDev`], backed by a disk image
//! file.

use crate::{Error, Result};
use spin::Mutex;
use std::{
	fs::{File, OpenOptions},
	io::{Read, Seek, SeekFrom, Write},
	path::Path,
};

/// A block-addressed device.
///
/// `ba` is a block address, `cnt` a number of blocks. Buffers must be exactly
/// `cnt * bsize()` bytes long.
pub trait BlockDev: Send + Sync {
	/// Reads `cnt` blocks starting at `ba` into `buf`.
	fn read(&self, ba: u64, cnt: usize, buf: &mut [u8]) -> Result<()>;
	/// Writes `cnt` blocks starting at `ba` from `buf`.
	fn write(&self, ba: u64, cnt: usize, buf: &[u8]) -> Result<()>;
	/// Returns the size of a device block in bytes.
	fn bsize(&self) -> usize;
	/// Returns the total number of device blocks.
	fn nblocks(&self) -> u64;
}

/// Reads `buf.len()` bytes at byte offset `off`, without block alignment
/// requirements on the caller's side.
pub fn read_bytes(dev: &dyn BlockDev, off: u64, buf: &mut [u8]) -> Result<()> {
	let bs = dev.bsize() as u64;
	let first = off / bs;
	let last = (off + buf.len() as u64).div_ceil(bs);
	if last > dev.nblocks() {
		return Err(Error::InvalidArg);
	}
	let cnt = (last - first) as usize;
	let mut tmp = vec![0u8; cnt * bs as usize];
	dev.read(first, cnt, &mut tmp)?;
	let skip = (off % bs) as usize;
	buf.copy_from_slice(&tmp[skip..skip + buf.len()]);
	Ok(())
}

/// Writes `data` at byte offset `off`, reading back partially covered blocks
/// first.
pub fn write_bytes(dev: &dyn BlockDev, off: u64, data: &[u8]) -> Result<()> {
	let bs = dev.bsize() as u64;
	let first = off / bs;
	let last = (off + data.len() as u64).div_ceil(bs);
	if last > dev.nblocks() {
		return Err(Error::InvalidArg);
	}
	let cnt = (last - first) as usize;
	let mut tmp = vec![0u8; cnt * bs as usize];
	let skip = (off % bs) as usize;
	// Preserve the partially covered head and tail blocks
	if skip != 0 || (skip + data.len()) % bs as usize != 0 {
		dev.read(first, cnt, &mut tmp)?;
	}
	tmp[skip..skip + data.len()].copy_from_slice(data);
	dev.write(first, cnt, &tmp)
}

fn check_span(dev: &dyn BlockDev, ba: u64, cnt: usize, buf_len: usize) -> Result<()> {
	if buf_len != cnt * dev.bsize() {
		return Err(Error::InvalidArg);
	}
	if ba + cnt as u64 > dev.nblocks() {
		return Err(Error::InvalidArg);
	}
	Ok(())
}

/// An in-memory block device.
pub struct MemDev {
	bsize: usize,
	data: Mutex<Vec<u8>>,
}

impl MemDev {
	/// Creates a zero-filled device of `nblocks` blocks of `bsize` bytes.
	pub fn new(bsize: usize, nblocks: u64) -> Self {
		Self {
			bsize,
			data: Mutex::new(vec![0; bsize * nblocks as usize]),
		}
	}
}

impl BlockDev for MemDev {
	fn read(&self, ba: u64, cnt: usize, buf: &mut [u8]) -> Result<()> {
		check_span(self, ba, cnt, buf.len())?;
		let off = ba as usize * self.bsize;
		buf.copy_from_slice(&self.data.lock()[off..off + buf.len()]);
		Ok(())
	}

	fn write(&self, ba: u64, cnt: usize, buf: &[u8]) -> Result<()> {
		check_span(self, ba, cnt, buf.len())?;
		let off = ba as usize * self.bsize;
		self.data.lock()[off..off + buf.len()].copy_from_slice(buf);
		Ok(())
	}

	fn bsize(&self) -> usize {
		self.bsize
	}

	fn nblocks(&self) -> u64 {
		(self.data.lock().len() / self.bsize) as u64
	}
}

/// A block device backed by a disk image file.
pub struct FileDev {
	file: Mutex<File>,
	bsize: usize,
	nblocks: u64,
}

impl FileDev {
	/// Opens the image at `path` with the given device block size.
	pub fn open(path: &Path, bsize: usize) -> Result<Self> {
		let file = OpenOptions::new().read(true).write(true).open(path)?;
		let len = file.metadata()?.len();
		Ok(Self {
			file: Mutex::new(file),
			bsize,
			nblocks: len / bsize as u64,
		})
	}
}

impl BlockDev for FileDev {
	fn read(&self, ba: u64, cnt: usize, buf: &mut [u8]) -> Result<()> {
		check_span(self, ba, cnt, buf.len())?;
		let mut file = self.file.lock();
		file.seek(SeekFrom::Start(ba * self.bsize as u64))?;
		file.read_exact(buf)?;
		Ok(())
	}

	fn write(&self, ba: u64, cnt: usize, buf: &[u8]) -> Result<()> {
		check_span(self, ba, cnt, buf.len())?;
		let mut file = self.file.lock();
		file.seek(SeekFrom::Start(ba * self.bsize as u64))?;
		file.write_all(buf)?;
		Ok(())
	}

	fn bsize(&self) -> usize {
		self.bsize
	}

	fn nblocks(&self) -> u64 {
		self.nblocks
	}
}
