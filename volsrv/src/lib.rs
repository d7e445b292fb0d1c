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

//! Volume service.
//!
//! The service watches the location registry for partitions, probes each one
//! for a filesystem, and mounts recognized volumes according to the
//! configured policy. User settings are keyed by volume label and persisted
//! to a configuration store, so a labeled volume keeps its mount point across
//! ejects and reboots.
//!
//! [`VolSvc`] is the service's client surface; the volume registry lives in
//! [`volume`], partition handling in [`part`].

pub mod empty;
pub mod loc;
pub mod mkfs;
pub mod part;
pub mod probe;
pub mod vfs;
pub mod volume;

pub use mfs::{Error, Result};

use crate::{
	loc::{Loc, ServiceId},
	part::Parts,
	vfs::Vfs,
	volume::Volumes,
};
use log::debug;
use std::{path::Path, sync::Arc};

/// Filesystem types the prober recognizes.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FsType {
	ExFat,
	Fat,
	Minix,
	Ext4,
	Cdfs,
}

impl FsType {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::ExFat => "exfat",
			Self::Fat => "fat",
			Self::Minix => "mfs",
			Self::Ext4 => "ext4fs",
			Self::Cdfs => "cdfs",
		}
	}
}

/// Partition content classification.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PartCnt {
	/// The partition holds only zeros in its recognition blocks.
	Empty,
	/// The partition holds data no prober recognizes.
	Unknown,
	/// The partition holds a recognized filesystem.
	Fs,
}

/// What a successful filesystem probe reports.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FsProbeInfo {
	pub fstype: FsType,
	/// Volume label; empty when the filesystem carries none.
	pub label: String,
}

/// Partition information returned by [`VolSvc::part_info`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PartInfo {
	pub pcnt: PartCnt,
	pub fstype: Option<FsType>,
	pub label: String,
	pub cur_mp: Option<String>,
	pub cur_mp_auto: bool,
}

/// Volume information returned by [`VolSvc::vol_info`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolInfo {
	pub id: u64,
	pub label: String,
	pub path: String,
}

/// Label capability of a filesystem type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LabelSupport {
	pub supported: bool,
}

/// The volume service.
pub struct VolSvc {
	volumes: Arc<Volumes>,
	parts: Arc<Parts>,
}

impl VolSvc {
	/// Starts the service.
	///
	/// Arguments:
	/// - `cfg_path` is the initial configuration store
	/// - `system_cfg_path` is the configuration store merged in once the
	///   system volume is mounted at `/w`
	/// - `loc` is the location registry listing partitions
	/// - `vfs` dispatches mount and unmount requests
	pub fn new(
		cfg_path: &Path,
		system_cfg_path: &Path,
		loc: Arc<dyn Loc>,
		vfs: Arc<dyn Vfs>,
	) -> Result<Self> {
		let volumes = Volumes::create(cfg_path)?;
		let parts = Parts::new(volumes.clone(), loc, vfs, system_cfg_path);
		parts.discovery_start()?;
		Ok(Self {
			volumes,
			parts,
		})
	}

	/// Re-scans the location registry for new and vanished partitions. This
	/// is the entry point for registry change notifications.
	pub fn check_new(&self) -> Result<()> {
		self.parts.check_new()
	}

	/// Returns the service IDs of all known partitions.
	pub fn get_parts(&self) -> Vec<ServiceId> {
		self.parts.get_ids()
	}

	/// Adds the partition with the given service ID.
	pub fn part_add(&self, sid: ServiceId) -> Result<()> {
		self.parts.add(sid)
	}

	/// Returns information about a partition.
	pub fn part_info(&self, sid: ServiceId) -> Result<PartInfo> {
		let part = self.parts.find_by_id_ref(sid)?;
		let info = part.info();
		self.parts.del_ref(&part);
		Ok(info)
	}

	/// Unmounts the partition, removing an automatically created mount point
	/// directory.
	pub fn part_eject(&self, sid: ServiceId) -> Result<()> {
		debug!("part_eject({sid})");
		let part = self.parts.find_by_id_ref(sid)?;
		let rc = self.parts.eject(&part);
		self.parts.del_ref(&part);
		rc
	}

	/// Wipes the partition's recognition structures.
	pub fn part_empty(&self, sid: ServiceId) -> Result<()> {
		debug!("part_empty({sid})");
		let part = self.parts.find_by_id_ref(sid)?;
		let rc = self.parts.empty(&part);
		self.parts.del_ref(&part);
		rc
	}

	/// Re-probes and re-mounts the partition, typically after media was
	/// inserted again.
	pub fn part_insert(&self, sid: ServiceId) -> Result<()> {
		debug!("part_insert({sid})");
		let part = self.parts.find_by_id_ref(sid)?;
		let rc = self.parts.insert(&part);
		self.parts.del_ref(&part);
		rc
	}

	/// [`Self::part_insert`], with the partition resolved from its mount
	/// path.
	pub fn part_insert_by_path(&self, path: &str) -> Result<()> {
		debug!("part_insert_by_path({path})");
		let part = self.parts.find_by_path_ref(path)?;
		let rc = self.parts.insert(&part);
		self.parts.del_ref(&part);
		rc
	}

	/// Tells whether the filesystem type supports volume labels.
	pub fn part_label_support(&self, fstype: FsType) -> LabelSupport {
		mkfs::label_support(fstype)
	}

	/// Creates a filesystem on the partition, then mounts it at `mountp`.
	pub fn part_mkfs(&self, sid: ServiceId, fstype: FsType, label: &str, mountp: &str) -> Result<()> {
		debug!("part_mkfs({sid}, {fstype:?}, {label:?}, {mountp:?})");
		let part = self.parts.find_by_id_ref(sid)?;
		let rc = self.parts.mkfs(&part, fstype, label, mountp);
		self.parts.del_ref(&part);
		rc
	}

	/// Changes the partition's mount point, remounting as necessary.
	pub fn part_set_mountp(&self, sid: ServiceId, mountp: &str) -> Result<()> {
		debug!("part_set_mountp({sid}, {mountp:?})");
		let part = self.parts.find_by_id_ref(sid)?;
		let rc = self.parts.set_mountp(&part, mountp);
		self.parts.del_ref(&part);
		rc
	}

	/// Returns the IDs of all persistent volumes.
	pub fn get_volumes(&self) -> Vec<u64> {
		self.volumes.get_ids()
	}

	/// Returns information about a volume.
	pub fn vol_info(&self, id: u64) -> Result<VolInfo> {
		let volume = self.volumes.find_by_id_ref(id)?;
		let info = volume.info();
		self.volumes.del_ref(&volume);
		Ok(info)
	}
}
