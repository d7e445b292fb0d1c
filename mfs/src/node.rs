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

//! Filesystem node cache.
//!
//! The cache holds one [`FsNode`] per open inode, so concurrent opens of the
//! same file share a single in-memory inode. Every handle obtained through
//! [`NodeCache::get_or_insert`] or [`NodeCache::insert_new`] must be returned
//! with a matching put; the node leaves the cache when its reference count
//! drops to zero.

use crate::{inode::InodeInfo, Result};
use spin::{Mutex, MutexGuard};
use std::{
	collections::HashMap,
	sync::{
		atomic::{AtomicU32, Ordering::Relaxed},
		Arc,
	},
};

/// An open filesystem node.
pub struct FsNode {
	index: u32,
	ino: Mutex<InodeInfo>,
	/// Number of outstanding handles; only mutated under the cache lock.
	refcnt: AtomicU32,
}

impl FsNode {
	/// The inode's 1-based index.
	pub fn index(&self) -> u32 {
		self.index
	}

	/// Locks and returns the in-memory inode.
	pub(crate) fn ino(&self) -> MutexGuard<'_, InodeInfo> {
		self.ino.lock()
	}
}

/// Cache of open nodes, keyed by inode index.
pub(crate) struct NodeCache {
	nodes: Mutex<HashMap<u32, Arc<FsNode>>>,
}

impl NodeCache {
	pub fn new() -> Self {
		Self {
			nodes: Mutex::new(HashMap::new()),
		}
	}

	/// Returns the node `index`, bumping its reference count. On a cache
	/// miss, the inode is loaded with `init` and inserted with a reference
	/// count of 1.
	pub fn get_or_insert(
		&self,
		index: u32,
		init: impl FnOnce() -> Result<InodeInfo>,
	) -> Result<Arc<FsNode>> {
		let mut nodes = self.nodes.lock();
		if let Some(node) = nodes.get(&index) {
			node.refcnt.fetch_add(1, Relaxed);
			return Ok(node.clone());
		}
		// Not in cache: read the inode while other openers wait on the lock,
		// so a concurrent open cannot race a second copy in
		let ino = init()?;
		let node = Arc::new(FsNode {
			index,
			ino: Mutex::new(ino),
			refcnt: AtomicU32::new(1),
		});
		nodes.insert(index, node.clone());
		Ok(node)
	}

	/// Inserts a freshly created inode with a reference count of 1.
	pub fn insert_new(&self, ino: InodeInfo) -> Arc<FsNode> {
		let node = Arc::new(FsNode {
			index: ino.index,
			ino: Mutex::new(ino),
			refcnt: AtomicU32::new(1),
		});
		self.nodes.lock().insert(node.index, node.clone());
		node
	}

	/// Releases one reference to `node`. Returns `true` when this was the
	/// last reference, in which case the node has been removed from the cache
	/// and the caller is responsible for flushing or destroying it.
	pub fn put(&self, node: &Arc<FsNode>) -> bool {
		let mut nodes = self.nodes.lock();
		let prev = node.refcnt.fetch_sub(1, Relaxed);
		debug_assert!(prev > 0);
		if prev == 1 {
			nodes.remove(&node.index);
			true
		} else {
			false
		}
	}

	/// Number of open nodes.
	pub fn open_count(&self) -> usize {
		self.nodes.lock().len()
	}

	/// Snapshot of every open node, for syncing.
	pub fn snapshot(&self) -> Vec<Arc<FsNode>> {
		self.nodes.lock().values().cloned().collect()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::Error;

	fn info(index: u32) -> InodeInfo {
		InodeInfo {
			index,
			..Default::default()
		}
	}

	#[test]
	fn concurrent_opens_share_the_node() {
		let cache = NodeCache::new();
		let a = cache.get_or_insert(3, || Ok(info(3))).unwrap();
		let b = cache.get_or_insert(3, || panic!("should hit the cache")).unwrap();
		assert!(Arc::ptr_eq(&a, &b));
		assert_eq!(cache.open_count(), 1);
		assert!(!cache.put(&a));
		assert!(cache.put(&b));
		assert_eq!(cache.open_count(), 0);
	}

	#[test]
	fn failed_init_inserts_nothing() {
		let cache = NodeCache::new();
		let r = cache.get_or_insert(3, || Err(Error::Io));
		assert_eq!(r.err(), Some(Error::Io));
		assert_eq!(cache.open_count(), 0);
	}

	#[test]
	fn insert_new_starts_at_one_reference() {
		let cache = NodeCache::new();
		let node = cache.insert_new(info(7));
		assert_eq!(cache.open_count(), 1);
		assert!(cache.put(&node));
	}
}
