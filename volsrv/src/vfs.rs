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

//! VFS mount dispatch interface.
//!
//! The volume service does not walk filesystem trees itself; it asks the VFS
//! layer to mount and unmount, and to create or remove the directories used
//! as automatic mount points.
//!
//! [`FsDispatch`] is the in-process dispatcher: it owns the mount table and
//! routes MINIX mounts to the [`mfs`] driver. Filesystem types without an
//! in-tree driver are accepted by the probers but refused here.

use crate::{
	loc::{Loc, ServiceId},
	Error, FsType, Result,
};
use log::{info, warn};
use mfs::ops::Mfs;
use spin::Mutex;
use std::{
	collections::{HashMap, HashSet},
	sync::Arc,
};

/// Mount dispatch, as seen by the volume service.
pub trait Vfs: Send + Sync {
	/// Mounts the filesystem on the service `sid` at `mp`.
	fn mount(&self, fstype: FsType, sid: ServiceId, mp: &str, opts: &str) -> Result<()>;
	/// Unmounts whatever is mounted at `mp`.
	fn unmount(&self, mp: &str) -> Result<()>;
	/// Creates the directory `mp`.
	fn create_dir(&self, mp: &str) -> Result<()>;
	/// Removes the directory `mp`.
	fn remove_dir(&self, mp: &str) -> Result<()>;
}

/// In-process mount dispatcher backed by the MINIX driver.
pub struct FsDispatch {
	loc: Arc<dyn Loc>,
	mounts: Mutex<HashMap<String, Arc<Mfs>>>,
	/// Directories known to the (virtual) filesystem tree; mounting at a
	/// path requires it to exist here.
	dirs: Mutex<HashSet<String>>,
}

impl FsDispatch {
	pub fn new(loc: Arc<dyn Loc>) -> Arc<Self> {
		Arc::new(Self {
			loc,
			mounts: Mutex::new(HashMap::new()),
			dirs: Mutex::new(HashSet::new()),
		})
	}

	/// Pre-creates a directory, the way the base system image provides `/w`
	/// or `/mnt`.
	pub fn provide_dir(&self, mp: &str) {
		self.dirs.lock().insert(mp.to_string());
	}

	/// Returns the instance mounted at `mp`.
	pub fn mounted_at(&self, mp: &str) -> Option<Arc<Mfs>> {
		self.mounts.lock().get(mp).cloned()
	}
}

impl Vfs for FsDispatch {
	fn mount(&self, fstype: FsType, sid: ServiceId, mp: &str, opts: &str) -> Result<()> {
		if fstype != FsType::Minix {
			warn!("no driver for {} filesystems", fstype.as_str());
			return Err(Error::NotSupported);
		}
		if !self.dirs.lock().contains(mp) {
			return Err(Error::NoEntry);
		}
		let mut mounts = self.mounts.lock();
		if mounts.contains_key(mp) {
			return Err(Error::Busy);
		}
		let dev = self.loc.open_block(sid)?;
		let mfs = Mfs::mount(dev, opts)?;
		mounts.insert(mp.to_string(), mfs);
		info!("mounted service {sid} at {mp}");
		Ok(())
	}

	fn unmount(&self, mp: &str) -> Result<()> {
		let mut mounts = self.mounts.lock();
		let mfs = mounts.get(mp).cloned().ok_or(Error::NoEntry)?;
		mfs.unmount()?;
		mounts.remove(mp);
		info!("unmounted {mp}");
		Ok(())
	}

	fn create_dir(&self, mp: &str) -> Result<()> {
		if !self.dirs.lock().insert(mp.to_string()) {
			return Err(Error::Exists);
		}
		Ok(())
	}

	fn remove_dir(&self, mp: &str) -> Result<()> {
		if self.mounts.lock().contains_key(mp) {
			return Err(Error::Busy);
		}
		if !self.dirs.lock().remove(mp) {
			return Err(Error::NoEntry);
		}
		Ok(())
	}
}
