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

//! Mounted filesystem instances and their VFS-facing operations.
//!
//! [`Mfs`] ties together the superblock, the block cache, the bitmap search
//! cursors and the node cache of one mount. All node handles obtained from it
//! ([`Mfs::node_get`], [`Mfs::root_get`], [`Mfs::lookup`], [`Mfs::create`])
//! must be released with [`Mfs::node_put`]; unmounting refuses to proceed
//! while any handle is outstanding.
//!
//! Lock order within an instance: a node's inode lock, then the bitmap
//! cursors, then cache blocks. Locks of two inodes are never held at once.

use crate::{
	bitmap,
	bitmap::{BitmapCursors, BmapId},
	cache::{BlockCache, BlockFlags, CacheMode},
	dev::BlockDev,
	dirent, inode,
	inode::{InodeInfo, S_IFDIR, S_IFREG},
	node::{FsNode, NodeCache},
	sb,
	sb::{SbInfo, Version, MFS_ROOT_INO},
	zone, Error, Result,
};
use log::{debug, info};
use spin::Mutex;
use std::{cmp::min, sync::Arc};

/// Creation flag: the new node is a directory.
pub const L_DIRECTORY: u32 = 0x1;

/// Mount option selecting the write-through cache mode.
const OPT_WTCACHE: &str = "wtcache";

/// A node's status, as reported by [`Mfs::stat`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileStat {
	pub index: u32,
	pub mode: u16,
	pub nlinks: u16,
	pub uid: u16,
	pub gid: u16,
	pub size: u32,
	pub atime: u32,
	pub mtime: u32,
	pub ctime: u32,
}

/// A mounted filesystem instance.
pub struct Mfs {
	sbi: SbInfo,
	cache: BlockCache,
	cursors: Mutex<BitmapCursors>,
	nodes: NodeCache,
}

impl Mfs {
	/// Mounts the filesystem on `dev`.
	///
	/// The option string `"wtcache"` selects write-through caching; any other
	/// value selects write-back.
	///
	/// If the device does not hold a recognized MINIX filesystem, the
	/// function returns [`Error::NotSupported`].
	pub fn mount(dev: Arc<dyn BlockDev>, opts: &str) -> Result<Arc<Self>> {
		let sbi = sb::read_sb_info(dev.as_ref())?;
		let cmode = if opts == OPT_WTCACHE {
			CacheMode::WriteThrough
		} else {
			CacheMode::WriteBack
		};
		let cache = BlockCache::new(dev, sbi.block_size, cmode)?;
		info!(
			"mounted MINIX {:?} filesystem: {} inodes, {} zones, block size {}",
			sbi.version, sbi.ninodes, sbi.nzones, sbi.block_size
		);
		Ok(Arc::new(Self {
			sbi,
			cache,
			cursors: Mutex::new(BitmapCursors::default()),
			nodes: NodeCache::new(),
		}))
	}

	/// Flushes and releases the instance.
	///
	/// Fails with [`Error::Busy`] while any node handle is outstanding.
	pub fn unmount(&self) -> Result<()> {
		if self.nodes.open_count() != 0 {
			return Err(Error::Busy);
		}
		self.cache.flush()
	}

	/// Writes every dirty inode and cached block back to the device.
	pub fn sync(&self) -> Result<()> {
		for node in self.nodes.snapshot() {
			let mut ino = node.ino();
			if ino.dirty {
				inode::write_inode(&self.cache, &self.sbi, &ino)?;
				ino.dirty = false;
			}
		}
		self.cache.flush()
	}

	pub fn sbi(&self) -> &SbInfo {
		&self.sbi
	}

	pub(crate) fn cache(&self) -> &BlockCache {
		&self.cache
	}

	/// Allocates a data zone and returns its physical number.
	pub(crate) fn alloc_zone(&self) -> Result<u32> {
		let mut cursors = self.cursors.lock();
		let bit = bitmap::alloc_bit(&self.cache, &self.sbi, &mut cursors, BmapId::Zone)?;
		Ok(self.sbi.firstdatazone + bit)
	}

	/// Returns the physical zone `zone` to the allocator.
	pub(crate) fn free_zone(&self, zone: u32) -> Result<()> {
		if zone < self.sbi.firstdatazone || zone >= self.sbi.nzones {
			return Err(Error::InvalidArg);
		}
		bitmap::free_bit(&self.cache, &self.sbi, BmapId::Zone, zone - self.sbi.firstdatazone)
	}

	fn alloc_inode_bit(&self) -> Result<u32> {
		let mut cursors = self.cursors.lock();
		bitmap::alloc_bit(&self.cache, &self.sbi, &mut cursors, BmapId::Inode)
	}

	fn free_inode_bit(&self, index: u32) -> Result<()> {
		if index == 0 {
			return Err(Error::InvalidArg);
		}
		bitmap::free_bit(&self.cache, &self.sbi, BmapId::Inode, index)
	}

	/// Highest link count the on-disk format can store.
	fn nlink_max(&self) -> u16 {
		match self.sbi.version {
			Version::V1 => u8::MAX as u16,
			_ => u16::MAX,
		}
	}

	/// Returns a handle for the node `index`, from the cache or the disk.
	pub fn node_get(&self, index: u32) -> Result<Arc<FsNode>> {
		self.nodes
			.get_or_insert(index, || inode::read_inode(&self.cache, &self.sbi, index))
	}

	/// Returns a handle for the root directory.
	pub fn root_get(&self) -> Result<Arc<FsNode>> {
		self.node_get(MFS_ROOT_INO)
	}

	/// Releases a node handle.
	///
	/// When the last handle is released, a dirty inode is flushed; an inode
	/// with no links left is destroyed instead.
	pub fn node_put(&self, node: Arc<FsNode>) -> Result<()> {
		if !self.nodes.put(&node) {
			return Ok(());
		}
		let mut ino = node.ino();
		if ino.nlinks == 0 {
			return self.destroy_node(&mut ino);
		}
		if ino.dirty {
			inode::write_inode(&self.cache, &self.sbi, &ino)?;
			ino.dirty = false;
		}
		Ok(())
	}

	/// Removes the node's content and inode from the disk. Destruction only
	/// takes effect at `nlinks == 0`.
	fn destroy_node(&self, ino: &mut InodeInfo) -> Result<()> {
		if ino.nlinks > 0 {
			return Ok(());
		}
		debug!("destroying inode {}", ino.index);
		zone::shrink(self, ino, 0)?;
		self.free_inode_bit(ino.index)?;
		inode::clear_inode(&self.cache, &self.sbi, ino.index)
	}

	/// Releases a node handle whose inode is expected to have no links left,
	/// destroying the inode along with it. See [`Self::node_put`].
	pub fn destroy(&self, node: Arc<FsNode>) -> Result<()> {
		self.node_put(node)
	}

	/// Allocates a new inode and returns a handle to it.
	///
	/// The node is created with one link, an empty content, and is a
	/// directory iff `flags` contains [`L_DIRECTORY`]. Note that the `.` and
	/// `..` entries of a directory are only written by [`Self::link`].
	pub fn create(&self, flags: u32) -> Result<Arc<FsNode>> {
		let index = self.alloc_inode_bit()?;
		let mode = if flags & L_DIRECTORY != 0 {
			S_IFDIR | 0o755
		} else {
			S_IFREG | 0o644
		};
		debug!("new node idx = {index}");
		let ino = InodeInfo {
			index,
			mode,
			nlinks: 1,
			dirty: true,
			..Default::default()
		};
		Ok(self.nodes.insert_new(ino))
	}

	/// Looks the name up in the directory `parent` and returns a handle to
	/// the child, or [`Error::NoEntry`].
	pub fn lookup(&self, parent: &FsNode, name: &[u8]) -> Result<Arc<FsNode>> {
		let index = {
			let pino = parent.ino();
			if !pino.is_dir() {
				return Err(Error::NotDir);
			}
			match dirent::lookup_dentry(self, &pino, name)? {
				Some((inum, _)) => inum,
				None => return Err(Error::NoEntry),
			}
		};
		self.node_get(index)
	}

	/// Adds the entry `(name, child)` to the directory `parent`.
	///
	/// When `child` is a directory, its `.` and `..` entries are written as
	/// well: `.` increments the child's link count, `..` the parent's.
	pub fn link(&self, parent: &FsNode, child: &FsNode, name: &[u8]) -> Result<()> {
		{
			let mut pino = parent.ino();
			if !pino.is_dir() {
				return Err(Error::NotDir);
			}
			dirent::insert_dentry(self, &mut pino, name, child.index())?;
		}
		let child_is_dir = child.ino().is_dir();
		if child_is_dir {
			{
				let mut cino = child.ino();
				if cino.nlinks >= self.nlink_max() {
					return Err(Error::Overflow);
				}
				dirent::insert_dentry(self, &mut cino, b".", child.index())?;
				cino.nlinks += 1;
				cino.dirty = true;
				dirent::insert_dentry(self, &mut cino, b"..", parent.index())?;
			}
			let mut pino = parent.ino();
			if pino.nlinks >= self.nlink_max() {
				return Err(Error::Overflow);
			}
			pino.nlinks += 1;
			pino.dirty = true;
		}
		Ok(())
	}

	/// Removes the entry `name` from `parent` and drops one link of `child`.
	///
	/// A non-empty directory is refused with [`Error::NotEmpty`]. Removing a
	/// directory also gives back the parent link acquired through the child's
	/// `..` entry.
	pub fn unlink(&self, parent: &FsNode, child: &FsNode, name: &[u8]) -> Result<()> {
		if self.has_children(child)? {
			return Err(Error::NotEmpty);
		}
		{
			let mut pino = parent.ino();
			dirent::remove_dentry(self, &mut pino, name)?;
		}
		let drop_parent_link = {
			let mut cino = child.ino();
			cino.nlinks = cino.nlinks.saturating_sub(1);
			cino.dirty = true;
			cino.is_dir()
		};
		if drop_parent_link {
			let mut pino = parent.ino();
			pino.nlinks = pino.nlinks.saturating_sub(1);
			pino.dirty = true;
		}
		Ok(())
	}

	/// Reads from a regular file at byte position `pos`.
	///
	/// At most one zone is read per call; the function returns the number of
	/// bytes read, `0` at end of file. A sparse zone reads back as zeros.
	pub fn read(&self, node: &FsNode, pos: u64, buf: &mut [u8]) -> Result<usize> {
		let ino = node.ino();
		if ino.is_dir() {
			return Err(Error::InvalidArg);
		}
		if pos >= ino.size as u64 || buf.is_empty() {
			return Ok(0);
		}
		let bs = self.sbi.block_size as u64;
		let bytes = min(buf.len() as u64, bs - pos % bs);
		let bytes = min(bytes, ino.size as u64 - pos) as usize;
		let zone = zone::read_map(self, &ino, pos as u32)?;
		if zone == 0 {
			// Sparse hole
			buf[..bytes].fill(0);
			return Ok(bytes);
		}
		let blk = self.cache.get(zone as u64, BlockFlags::None)?;
		let off = (pos % bs) as usize;
		buf[..bytes].copy_from_slice(&blk.data()[off..off + bytes]);
		self.cache.put(&blk)?;
		Ok(bytes)
	}

	/// Reads one directory entry, starting the scan at slot `pos`.
	///
	/// Positions 0 and 1 yield `.` and `..` without touching the disk; higher
	/// positions yield the first used slot at or past `pos`. Returns the
	/// entry's name and the position to continue from, or [`Error::NoEntry`]
	/// past the last entry.
	pub fn read_dir(&self, node: &FsNode, pos: u32) -> Result<(Vec<u8>, u32)> {
		let ino = node.ino();
		if !ino.is_dir() {
			return Err(Error::NotDir);
		}
		match pos {
			0 => return Ok((b".".to_vec(), 1)),
			1 => return Ok((b"..".to_vec(), 2)),
			_ => {}
		}
		let nslots = ino.size / self.sbi.dirsize as u32;
		for i in pos..nslots {
			let ent = dirent::read_dentry(self, &ino, i)?;
			if ent.inum != 0 {
				return Ok((ent.name, i + 1));
			}
		}
		Err(Error::NoEntry)
	}

	/// Writes to a regular file at byte position `pos`, growing it as
	/// needed. Writing past the end leaves a sparse hole.
	///
	/// At most one zone is written per call; the function returns the number
	/// of bytes written.
	pub fn write(&self, node: &FsNode, pos: u64, buf: &[u8]) -> Result<usize> {
		if buf.is_empty() {
			return Ok(0);
		}
		let bs = self.sbi.block_size as u64;
		let bytes = min(buf.len() as u64, bs - pos % bs) as usize;
		let end = pos + bytes as u64;
		if end > self.sbi.max_file_size as u64 {
			return Err(Error::FileTooLarge);
		}
		let mut ino = node.ino();
		if ino.is_dir() {
			return Err(Error::InvalidArg);
		}
		// Allocated blocks end at this boundary
		let boundary = (ino.size as u64).div_ceil(bs) * bs;
		let zone = if pos < boundary {
			let zone = zone::map_rblock(self, &ino, (pos / bs) as u32)?;
			if zone != 0 {
				zone
			} else {
				// Writing in a sparse zone
				let zone = zone::alloc_zone_and_clear(self)?;
				if let Err(e) = zone::write_map(self, &mut ino, pos as u32, zone) {
					let _ = self.free_zone(zone);
					return Err(e);
				}
				zone
			}
		} else {
			let zone = zone::alloc_zone_and_clear(self)?;
			if let Err(e) = zone::write_map(self, &mut ino, pos as u32, zone) {
				let _ = self.free_zone(zone);
				return Err(e);
			}
			zone
		};
		let flags = if bytes == bs as usize {
			BlockFlags::NoRead
		} else {
			BlockFlags::None
		};
		let blk = self.cache.get(zone as u64, flags)?;
		{
			let mut data = blk.data();
			let off = (pos % bs) as usize;
			data[off..off + bytes].copy_from_slice(&buf[..bytes]);
			blk.mark_dirty();
		}
		self.cache.put(&blk)?;
		if end as u32 > ino.size {
			ino.size = end as u32;
		}
		ino.dirty = true;
		Ok(bytes)
	}

	/// Truncates the file to `size` bytes. Growing a file is a no-op here;
	/// growth happens through [`Self::write`].
	pub fn truncate(&self, node: &FsNode, size: u64) -> Result<()> {
		let mut ino = node.ino();
		if size >= ino.size as u64 {
			return Ok(());
		}
		zone::shrink(self, &mut ino, size as u32)
	}

	/// Returns the node's status.
	pub fn stat(&self, node: &FsNode) -> FileStat {
		let ino = node.ino();
		FileStat {
			index: ino.index,
			mode: ino.mode,
			nlinks: ino.nlinks,
			uid: ino.uid,
			gid: ino.gid,
			size: ino.size,
			atime: ino.atime,
			mtime: ino.mtime,
			ctime: ino.ctime,
		}
	}

	/// Tells whether the directory holds any entry besides `.` and `..`.
	///
	/// Returns `false` for non-directories.
	pub fn has_children(&self, node: &FsNode) -> Result<bool> {
		let ino = node.ino();
		if !ino.is_dir() {
			return Ok(false);
		}
		let nslots = ino.size / self.sbi.dirsize as u32;
		// The first two slots are always `.` and `..`
		for i in 2..nslots {
			if dirent::read_dentry(self, &ino, i)?.inum != 0 {
				return Ok(true);
			}
		}
		Ok(false)
	}
}

impl Drop for Mfs {
	fn drop(&mut self) {
		if self.sync().is_err() {
			log::error!("failed syncing filesystem on drop");
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::{
		dev::{read_bytes, MemDev},
		mkfs,
		mkfs::MkfsParams,
	};

	/// A small version 3 image: 16 inodes, one block per bitmap, data zones
	/// starting at zone 5.
	fn image() -> Arc<dyn BlockDev> {
		let dev: Arc<dyn BlockDev> = Arc::new(MemDev::new(512, 1024));
		mkfs::create(
			&dev,
			&MkfsParams {
				version: Version::V3,
				block_size: 1024,
				ninodes: Some(16),
			},
		)
		.unwrap();
		dev
	}

	fn mount(dev: &Arc<dyn BlockDev>) -> Arc<Mfs> {
		Mfs::mount(dev.clone(), "").unwrap()
	}

	#[test]
	fn lookup_after_link_and_unlink() {
		let dev = image();
		let mfs = mount(&dev);
		let root = mfs.root_get().unwrap();
		let file = mfs.create(0).unwrap();
		let index = file.index();
		mfs.link(&root, &file, b"data").unwrap();
		let found = mfs.lookup(&root, b"data").unwrap();
		assert_eq!(found.index(), index);
		mfs.node_put(found).unwrap();
		assert!(mfs.has_children(&root).unwrap());
		mfs.unlink(&root, &file, b"data").unwrap();
		assert_eq!(mfs.lookup(&root, b"data").err(), Some(Error::NoEntry));
		mfs.node_put(file).unwrap();
		mfs.node_put(root).unwrap();
		mfs.unmount().unwrap();
	}

	#[test]
	fn mkdir_link_counts() {
		let dev = image();
		let mfs = mount(&dev);
		let root = mfs.root_get().unwrap();
		let old_nlinks = mfs.stat(&root).nlinks;
		let sub = mfs.create(L_DIRECTORY).unwrap();
		mfs.link(&root, &sub, b"sub").unwrap();
		// `.` counts on the child, `..` on the parent
		assert_eq!(mfs.stat(&sub).nlinks, 2);
		assert_eq!(mfs.stat(&root).nlinks, old_nlinks + 1);
		mfs.node_put(sub).unwrap();
		mfs.node_put(root).unwrap();
		mfs.unmount().unwrap();
	}

	#[test]
	fn unlink_refuses_non_empty_directory() {
		let dev = image();
		let mfs = mount(&dev);
		let root = mfs.root_get().unwrap();
		let sub = mfs.create(L_DIRECTORY).unwrap();
		mfs.link(&root, &sub, b"sub").unwrap();
		let inner = mfs.create(0).unwrap();
		mfs.link(&sub, &inner, b"inner").unwrap();
		assert_eq!(mfs.unlink(&root, &sub, b"sub").err(), Some(Error::NotEmpty));
		mfs.unlink(&sub, &inner, b"inner").unwrap();
		mfs.unlink(&root, &sub, b"sub").unwrap();
		mfs.node_put(inner).unwrap();
		mfs.node_put(sub).unwrap();
		mfs.node_put(root).unwrap();
		mfs.unmount().unwrap();
	}

	#[test]
	fn write_read_roundtrip_survives_remount() {
		let dev = image();
		let mfs = mount(&dev);
		let root = mfs.root_get().unwrap();
		let file = mfs.create(0).unwrap();
		mfs.link(&root, &file, b"blob").unwrap();
		let data: Vec<u8> = (0..2048u32).map(|i| i as u8).collect();
		let mut pos = 0u64;
		while pos < data.len() as u64 {
			pos += mfs.write(&file, pos, &data[pos as usize..]).unwrap() as u64;
		}
		assert_eq!(mfs.stat(&file).size, 2048);
		mfs.node_put(file).unwrap();
		mfs.node_put(root).unwrap();
		mfs.unmount().unwrap();
		drop(mfs);
		let mfs = mount(&dev);
		let root = mfs.root_get().unwrap();
		let file = mfs.lookup(&root, b"blob").unwrap();
		let mut back = vec![0u8; 2048];
		let mut pos = 0u64;
		while pos < back.len() as u64 {
			pos += mfs.read(&file, pos, &mut back[pos as usize..]).unwrap() as u64;
		}
		assert_eq!(back, data);
		mfs.node_put(file).unwrap();
		mfs.node_put(root).unwrap();
		mfs.unmount().unwrap();
	}

	#[test]
	fn split_write_lands_in_two_zones() {
		let dev = image();
		let mfs = mount(&dev);
		let file = mfs.create(0).unwrap();
		let buf = [7u8; 1025];
		// One zone per call: the first write is clamped at the zone boundary
		assert_eq!(mfs.write(&file, 0, &buf).unwrap(), 1024);
		assert_eq!(mfs.write(&file, 1024, &buf[1024..]).unwrap(), 1);
		assert_eq!(mfs.stat(&file).size, 1025);
		let mut back = [0u8; 1];
		assert_eq!(mfs.read(&file, 1024, &mut back).unwrap(), 1);
		assert_eq!(back[0], 7);
		mfs.node_put(file).unwrap();
		mfs.unmount().unwrap();
	}

	#[test]
	fn sparse_hole_reads_back_zeros() {
		let dev = image();
		let mfs = mount(&dev);
		let file = mfs.create(0).unwrap();
		// First position of the single indirect chain
		let pos = 8 * 1024;
		assert_eq!(mfs.write(&file, pos, &[0xff]).unwrap(), 1);
		assert_eq!(mfs.stat(&file).size, pos as u32 + 1);
		let mut buf = [0xaau8; 2048];
		assert_eq!(mfs.read(&file, 0, &mut buf).unwrap(), 1024);
		assert!(buf[..1024].iter().all(|b| *b == 0));
		let mut one = [0u8; 1];
		assert_eq!(mfs.read(&file, pos, &mut one).unwrap(), 1);
		assert_eq!(one[0], 0xff);
		mfs.node_put(file).unwrap();
		mfs.unmount().unwrap();
	}

	#[test]
	fn double_indirect_and_file_size_limit() {
		let dev = image();
		let mfs = mount(&dev);
		let max = mfs.sbi().max_file_size as u64;
		let file = mfs.create(0).unwrap();
		// The last byte of the largest possible file is addressable
		assert_eq!(mfs.write(&file, max - 1, &[0x42]).unwrap(), 1);
		assert_eq!(mfs.stat(&file).size as u64, max);
		let mut one = [0u8; 1];
		assert_eq!(mfs.read(&file, max - 1, &mut one).unwrap(), 1);
		assert_eq!(one[0], 0x42);
		// One more byte exceeds the limit
		assert_eq!(mfs.write(&file, max, &[0x42]).err(), Some(Error::FileTooLarge));
		mfs.truncate(&file, 0).unwrap();
		mfs.node_put(file).unwrap();
		mfs.unmount().unwrap();
	}

	#[test]
	fn truncate_keeps_links_and_destroy_clears_bitmaps() {
		let dev = image();
		let mfs = mount(&dev);
		let root = mfs.root_get().unwrap();
		let file = mfs.create(0).unwrap();
		let index = file.index();
		assert_eq!(index, 2);
		mfs.link(&root, &file, b"victim").unwrap();
		let buf = [3u8; 1024];
		for i in 0..3 {
			mfs.write(&file, i * 1024, &buf).unwrap();
		}
		mfs.truncate(&file, 0).unwrap();
		let stat = mfs.stat(&file);
		assert_eq!(stat.size, 0);
		assert_eq!(stat.nlinks, 1);
		mfs.unlink(&root, &file, b"victim").unwrap();
		mfs.node_put(file).unwrap();
		mfs.node_put(root).unwrap();
		mfs.unmount().unwrap();
		drop(mfs);
		// Inode bitmap (block 2): inode 0 and the root remain, inode 2 is
		// clear. Zone bitmap (block 3): only the root directory zone is left.
		let mut byte = [0u8; 1];
		read_bytes(dev.as_ref(), 2 * 1024, &mut byte).unwrap();
		assert_eq!(byte[0] & 0b111, 0b011);
		read_bytes(dev.as_ref(), 3 * 1024, &mut byte).unwrap();
		assert_eq!(byte[0], 0b001);
	}

	#[test]
	fn directory_growth_allocates_zeroed_zone() {
		let dev = image();
		let mfs = mount(&dev);
		let root = mfs.root_get().unwrap();
		// The root block holds 16 slots; two are `.` and `..`
		let mut files = Vec::new();
		for i in 0..15 {
			let file = mfs.create(0).unwrap();
			let name = format!("file{i:02}");
			mfs.link(&root, &file, name.as_bytes()).unwrap();
			files.push((file, name));
		}
		assert_eq!(mfs.stat(&root).size, 17 * 64);
		// Every entry resolves, including the one in the fresh zone
		for (file, name) in &files {
			let found = mfs.lookup(&root, name.as_bytes()).unwrap();
			assert_eq!(found.index(), file.index());
			mfs.node_put(found).unwrap();
		}
		for (file, _) in files {
			mfs.node_put(file).unwrap();
		}
		mfs.node_put(root).unwrap();
		mfs.unmount().unwrap();
	}

	#[test]
	fn read_dir_skips_freed_slots() {
		let dev = image();
		let mfs = mount(&dev);
		let root = mfs.root_get().unwrap();
		for name in [b"aa".as_slice(), b"bb", b"cc"] {
			let file = mfs.create(0).unwrap();
			mfs.link(&root, &file, name).unwrap();
			mfs.node_put(file).unwrap();
		}
		let victim = mfs.lookup(&root, b"bb").unwrap();
		mfs.unlink(&root, &victim, b"bb").unwrap();
		mfs.node_put(victim).unwrap();
		let mut names = Vec::new();
		let mut pos = 0;
		loop {
			match mfs.read_dir(&root, pos) {
				Ok((name, next)) => {
					names.push(name);
					pos = next;
				}
				Err(Error::NoEntry) => break,
				Err(e) => panic!("read_dir failed: {e}"),
			}
		}
		assert_eq!(
			names,
			[b".".to_vec(), b"..".to_vec(), b"aa".to_vec(), b"cc".to_vec()]
		);
		mfs.node_put(root).unwrap();
		mfs.unmount().unwrap();
	}

	#[test]
	fn unmount_refuses_open_nodes() {
		let dev = image();
		let mfs = mount(&dev);
		let root = mfs.root_get().unwrap();
		assert_eq!(mfs.unmount().err(), Some(Error::Busy));
		mfs.node_put(root).unwrap();
		mfs.unmount().unwrap();
	}

	#[test]
	fn write_through_mode_hits_the_device() {
		let dev = image();
		let mfs = Mfs::mount(dev.clone(), "wtcache").unwrap();
		let file = mfs.create(0).unwrap();
		mfs.write(&file, 0, &[0x99; 16]).unwrap();
		// The data zone reached the device without any flush
		let zone = mfs.sbi().firstdatazone + 1;
		let mut raw = [0u8; 16];
		read_bytes(dev.as_ref(), zone as u64 * 1024, &mut raw).unwrap();
		assert_eq!(raw, [0x99; 16]);
		mfs.node_put(file).unwrap();
		mfs.unmount().unwrap();
	}

	#[test]
	fn reading_a_directory_as_bytes_is_refused() {
		let dev = image();
		let mfs = mount(&dev);
		let root = mfs.root_get().unwrap();
		let mut buf = [0u8; 16];
		assert_eq!(mfs.read(&root, 0, &mut buf).err(), Some(Error::InvalidArg));
		assert_eq!(mfs.read_dir(&root, 0).unwrap().0, b".".to_vec());
		mfs.node_put(root).unwrap();
		mfs.unmount().unwrap();
	}
}
