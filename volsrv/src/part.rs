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

//! Partition handling.
//!
//! Partitions come and go with the location registry. A new partition is
//! probed for a filesystem, bound to the volume matching its label and, if
//! the policy allows, mounted: at the configured mount point, or under
//! `/vol/<label>` in an automatically created directory.
//!
//! By default, partitions on ATA devices are not auto-mounted; CD-ROM
//! filesystems always are (they are read-only after all).

use crate::{
	empty,
	loc::{Loc, ServiceId},
	mkfs, probe,
	probe::FsProber,
	vfs::Vfs,
	volume::{Volume, Volumes},
	Error, FsType, PartCnt, PartInfo, Result,
};
use log::{debug, error, info, warn};
use spin::Mutex;
use std::{
	path::{Path, PathBuf},
	sync::{
		atomic::{AtomicU32, Ordering::Relaxed},
		Arc,
	},
};

/// Name fragment identifying partitions on ATA hard drives.
const ATA_NAME_FRAGMENT: &str = "ata-c";
/// Prefix of automatically derived mount points.
const AUTO_MP_PREFIX: &str = "/vol/";
/// Mount point of the system volume.
const SYSTEM_MP: &str = "/w";

/// A partition known to the service.
pub struct Part {
	svc_id: ServiceId,
	svc_name: String,
	/// Reference count; only mutated under the partition list lock.
	refcnt: AtomicU32,
	state: Mutex<PartState>,
}

#[derive(Default)]
struct PartState {
	pcnt: Option<PartCnt>,
	fstype: Option<FsType>,
	label: String,
	cur_mp: Option<String>,
	/// Whether `cur_mp` is an automatically created directory to be removed
	/// on eject.
	cur_mp_auto: bool,
	/// The volume this partition is bound to.
	volume: Option<Arc<Volume>>,
}

impl Part {
	pub fn svc_id(&self) -> ServiceId {
		self.svc_id
	}

	pub fn svc_name(&self) -> &str {
		&self.svc_name
	}

	pub fn info(&self) -> PartInfo {
		let state = self.state.lock();
		let pcnt = state.pcnt.unwrap_or(PartCnt::Unknown);
		PartInfo {
			pcnt,
			fstype: (pcnt == PartCnt::Fs).then_some(state.fstype).flatten(),
			label: state.label.clone(),
			cur_mp: state.cur_mp.clone(),
			cur_mp_auto: state.cur_mp_auto,
		}
	}
}

/// The partition list.
pub struct Parts {
	volumes: Arc<Volumes>,
	loc: Arc<dyn Loc>,
	vfs: Arc<dyn Vfs>,
	probers: Vec<Box<dyn FsProber>>,
	list: Mutex<Vec<Arc<Part>>>,
	/// Configuration store merged in once the system volume is mounted.
	system_cfg: PathBuf,
}

impl Parts {
	pub fn new(
		volumes: Arc<Volumes>,
		loc: Arc<dyn Loc>,
		vfs: Arc<dyn Vfs>,
		system_cfg: &Path,
	) -> Arc<Self> {
		Arc::new(Self {
			volumes,
			loc,
			vfs,
			probers: probe::probers(),
			list: Mutex::new(Vec::new()),
			system_cfg: system_cfg.to_path_buf(),
		})
	}

	/// Performs the initial partition scan.
	pub fn discovery_start(&self) -> Result<()> {
		self.check_new()
	}

	/// Checks for new and removed partitions.
	pub fn check_new(&self) -> Result<()> {
		let sids = self.loc.get_parts()?;
		let known: Vec<Arc<Part>> = self.list.lock().clone();
		// Check for new partitions
		for sid in &sids {
			if known.iter().any(|p| p.svc_id == *sid) {
				continue;
			}
			debug!("found partition {sid}");
			if let Err(e) = self.do_add(*sid) {
				error!("could not add partition {sid}: {e}");
			}
		}
		// Check for removed partitions
		for part in known {
			if !sids.contains(&part.svc_id) {
				debug!("partition {} is gone", part.svc_id);
				self.remove(&part);
			}
		}
		Ok(())
	}

	/// Adds the partition `sid`, probing and possibly mounting it.
	pub fn add(&self, sid: ServiceId) -> Result<()> {
		if self.find_by_id_ref(sid).is_ok() {
			return Err(Error::Exists);
		}
		self.do_add(sid)
	}

	fn do_add(&self, sid: ServiceId) -> Result<()> {
		let svc_name = self.loc.service_name(sid)?;
		let part = Arc::new(Part {
			svc_id: sid,
			svc_name,
			refcnt: AtomicU32::new(1),
			state: Mutex::new(PartState::default()),
		});
		let rc = self.probe(&part).and_then(|_| self.mount(&part));
		if let Err(e) = rc {
			self.drop_part(&part);
			return Err(e);
		}
		// Commit, unless the partition appeared twice concurrently
		let mut list = self.list.lock();
		if list.iter().any(|p| p.svc_id == sid) {
			drop(list);
			self.drop_part(&part);
			return Err(Error::Exists);
		}
		list.push(part.clone());
		info!("added partition {} ({})", part.svc_id, part.svc_name);
		Ok(())
	}

	/// Removes a vanished partition, forgetting its mount.
	fn remove(&self, part: &Arc<Part>) {
		{
			let mut state = part.state.lock();
			if let Some(mp) = state.cur_mp.take() {
				// The device is gone; the mount cannot be flushed anymore
				if self.vfs.unmount(&mp).is_err() {
					warn!("failed unmounting vanished partition from {mp}");
				}
				if state.cur_mp_auto {
					let _ = self.vfs.remove_dir(&mp);
				}
				state.cur_mp_auto = false;
			}
		}
		self.list.lock().retain(|p| p.svc_id != part.svc_id);
		self.del_ref(part);
	}

	/// Probes the partition and binds it to its volume.
	fn probe(&self, part: &Arc<Part>) -> Result<()> {
		debug!("probe partition {}", part.svc_name);
		let dev = self.loc.open_block(part.svc_id)?;
		let found = self
			.probers
			.iter()
			.find_map(|p| p.probe(dev.as_ref()).ok());
		let (pcnt, fstype, label) = match found {
			Some(info) => {
				info!(
					"found {} on {}, label {:?}",
					info.fstype.as_str(),
					part.svc_name,
					info.label
				);
				(PartCnt::Fs, Some(info.fstype), info.label)
			}
			None => {
				info!("partition {} has no recognized filesystem", part.svc_name);
				let empty = empty::part_is_empty(dev.as_ref()).map_err(|_| Error::Io)?;
				let pcnt = if empty { PartCnt::Empty } else { PartCnt::Unknown };
				(pcnt, None, String::new())
			}
		};
		let volume = self.volumes.lookup_ref(&label);
		let mut state = part.state.lock();
		state.pcnt = Some(pcnt);
		state.fstype = fstype;
		state.label = label;
		if let Some(old) = state.volume.replace(volume) {
			self.volumes.del_ref(&old);
		}
		Ok(())
	}

	/// Default mount point policy for the partition.
	fn def_mountp(state: &PartState, svc_name: &str) -> &'static str {
		// CDFS is safe to mount; for other filesystems, disallow mounting
		// from ATA hard drives by default
		let allow = state.fstype == Some(FsType::Cdfs) || !svc_name.contains(ATA_NAME_FRAGMENT);
		if allow {
			"Auto"
		} else {
			"None"
		}
	}

	/// Determines the mount path to use, or `None` when the partition should
	/// not be mounted. The flag tells whether the path is automatic.
	fn determine_mount_path(state: &PartState, svc_name: &str) -> Option<(String, bool)> {
		let configured = state.volume.as_ref().map(|v| v.mountp()).unwrap_or_default();
		let cfg_mp = if configured.is_empty() {
			Self::def_mountp(state, svc_name).to_string()
		} else {
			configured
		};
		match cfg_mp.as_str() {
			"Auto" | "auto" => {
				// Don't mount nameless volumes
				if state.label.is_empty() {
					None
				} else {
					Some((format!("{AUTO_MP_PREFIX}{}", state.label), true))
				}
			}
			"None" | "none" => None,
			_ => Some((cfg_mp, false)),
		}
	}

	/// Mounts the partition according to the policy.
	fn mount(&self, part: &Arc<Part>) -> Result<()> {
		let mut state = part.state.lock();
		if state.pcnt != Some(PartCnt::Fs) {
			return Ok(());
		}
		let Some(fstype) = state.fstype else {
			return Ok(());
		};
		let Some((mp, mp_auto)) = Self::determine_mount_path(&state, &part.svc_name) else {
			info!("not mounting {}", part.svc_name);
			return Ok(());
		};
		if mp_auto {
			debug!("create mount point {mp:?}");
			match self.vfs.create_dir(&mp) {
				Ok(()) | Err(Error::Exists) => {}
				Err(e) => {
					error!("error creating mount point {mp:?}");
					return Err(e);
				}
			}
		}
		if let Err(e) = self.vfs.mount(fstype, part.svc_id, &mp, "") {
			error!(
				"failed mounting {} at {} to {mp}",
				fstype.as_str(),
				part.svc_name
			);
			if mp_auto {
				let _ = self.vfs.remove_dir(&mp);
			}
			return Err(e);
		}
		info!("mounted {} at {} to {mp}", fstype.as_str(), part.svc_name);
		state.cur_mp = Some(mp.clone());
		state.cur_mp_auto = mp_auto;
		drop(state);
		if mp == SYSTEM_MP {
			info!("mounted system volume, loading additional configuration");
			self.volumes.merge_to(&self.system_cfg)?;
		}
		Ok(())
	}

	/// Returns the service IDs of all known partitions.
	pub fn get_ids(&self) -> Vec<ServiceId> {
		self.list.lock().iter().map(|p| p.svc_id).collect()
	}

	/// Finds a partition by service ID, with a reference added.
	pub fn find_by_id_ref(&self, sid: ServiceId) -> Result<Arc<Part>> {
		let list = self.list.lock();
		let part = list.iter().find(|p| p.svc_id == sid).ok_or(Error::NoEntry)?;
		part.refcnt.fetch_add(1, Relaxed);
		Ok(part.clone())
	}

	/// Finds a partition by its (configured or derived) mount path, with a
	/// reference added.
	pub fn find_by_path_ref(&self, path: &str) -> Result<Arc<Part>> {
		let list = self.list.lock();
		for part in list.iter() {
			let state = part.state.lock();
			let mount_path = Self::determine_mount_path(&state, &part.svc_name);
			drop(state);
			if matches!(mount_path, Some((mp, _)) if mp == path) {
				part.refcnt.fetch_add(1, Relaxed);
				return Ok(part.clone());
			}
		}
		Err(Error::NoEntry)
	}

	fn drop_part(&self, part: &Arc<Part>) {
		if let Some(volume) = part.state.lock().volume.take() {
			self.volumes.del_ref(&volume);
		}
	}

	/// Drops a reference to `part`.
	pub fn del_ref(&self, part: &Arc<Part>) {
		let prev = part.refcnt.fetch_sub(1, Relaxed);
		debug_assert!(prev > 0);
		if prev == 1 {
			self.drop_part(part);
		}
	}

	/// Unmounts the partition and removes an automatically created mount
	/// point directory.
	pub fn eject(&self, part: &Arc<Part>) -> Result<()> {
		let mut state = part.state.lock();
		let Some(mp) = state.cur_mp.clone() else {
			// Not mounted, nothing to do
			return Ok(());
		};
		self.vfs.unmount(&mp)?;
		if state.cur_mp_auto {
			if let Err(e) = self.vfs.remove_dir(&mp) {
				error!("failed deleting mount directory {mp}: {e}");
			}
		}
		state.cur_mp = None;
		state.cur_mp_auto = false;
		Ok(())
	}

	/// Re-probes and re-mounts the partition.
	pub fn insert(&self, part: &Arc<Part>) -> Result<()> {
		if part.state.lock().cur_mp.is_some() {
			return Ok(());
		}
		self.probe(part)?;
		self.mount(part)
	}

	/// Wipes the partition's recognition blocks.
	pub fn empty(&self, part: &Arc<Part>) -> Result<()> {
		if part.state.lock().cur_mp.is_some() {
			return Err(Error::Busy);
		}
		let dev = self.loc.open_block(part.svc_id)?;
		empty::part_empty(dev.as_ref())?;
		part.state.lock().pcnt = Some(PartCnt::Empty);
		Ok(())
	}

	/// Verifies and stores a mount point for the partition's volume.
	///
	/// A value equal to the partition's default policy is stored as the empty
	/// string, reverting the volume to the default (and non-persistent)
	/// configuration.
	fn mountp_set(&self, part: &Arc<Part>, mountp: &str) -> Result<()> {
		if !matches!(mountp, "" | "Auto" | "auto" | "None" | "none") && !mountp.starts_with('/') {
			return Err(Error::InvalidArg);
		}
		let (volume, def) = {
			let state = part.state.lock();
			let def = Self::def_mountp(&state, &part.svc_name);
			(state.volume.clone().ok_or(Error::NoEntry)?, def)
		};
		let mp = if mountp == def { "" } else { mountp };
		self.volumes.set_mountp(&volume, mp)
	}

	/// Creates a filesystem on the partition, then re-probes it and mounts it
	/// at `mountp`.
	pub fn mkfs(&self, part: &Arc<Part>, fstype: FsType, label: &str, mountp: &str) -> Result<()> {
		if part.state.lock().cur_mp.is_some() {
			return Err(Error::Busy);
		}
		let dev = self.loc.open_block(part.svc_id)?;
		mkfs::part_mkfs(&dev, fstype, label)?;
		// Re-probe to pick up label canonicalization done by the mkfs
		self.probe(part)?;
		self.mountp_set(part, mountp)?;
		self.mount(part)
	}

	/// Sets the partition's mount point, remounting as necessary.
	pub fn set_mountp(&self, part: &Arc<Part>, mountp: &str) -> Result<()> {
		if part.state.lock().cur_mp.is_some() {
			self.eject(part)?;
		}
		self.mountp_set(part, mountp)?;
		self.mount(part)
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::loc::MemLoc;
	use mfs::dev::{write_bytes, BlockDev, MemDev};
	use std::{
		collections::{HashMap, HashSet},
		fs,
		sync::atomic::AtomicUsize,
	};

	static NEXT_CFG: AtomicUsize = AtomicUsize::new(0);

	fn cfg_path() -> PathBuf {
		std::env::temp_dir().join(format!(
			"volsrv-part-test-{}-{}.json",
			std::process::id(),
			NEXT_CFG.fetch_add(1, Relaxed)
		))
	}

	/// A mount dispatcher accepting every filesystem type.
	struct TestVfs {
		mounts: Mutex<HashMap<String, (FsType, ServiceId)>>,
		dirs: Mutex<HashSet<String>>,
	}

	impl TestVfs {
		fn new() -> Arc<Self> {
			Arc::new(Self {
				mounts: Mutex::new(HashMap::new()),
				dirs: Mutex::new(HashSet::new()),
			})
		}

		fn provide(&self, mp: &str) {
			self.dirs.lock().insert(mp.to_string());
		}

		fn mounted(&self, mp: &str) -> Option<(FsType, ServiceId)> {
			self.mounts.lock().get(mp).copied()
		}

		fn has_dir(&self, mp: &str) -> bool {
			self.dirs.lock().contains(mp)
		}
	}

	impl Vfs for TestVfs {
		fn mount(&self, fstype: FsType, sid: ServiceId, mp: &str, _opts: &str) -> Result<()> {
			if !self.dirs.lock().contains(mp) {
				return Err(Error::NoEntry);
			}
			let mut mounts = self.mounts.lock();
			if mounts.contains_key(mp) {
				return Err(Error::Busy);
			}
			mounts.insert(mp.to_string(), (fstype, sid));
			Ok(())
		}

		fn unmount(&self, mp: &str) -> Result<()> {
			self.mounts.lock().remove(mp).map(|_| ()).ok_or(Error::NoEntry)
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

	fn fat_image(label: &str) -> Arc<dyn BlockDev> {
		let dev = MemDev::new(512, 64);
		write_bytes(&dev, 510, &[0x55, 0xaa]).unwrap();
		write_bytes(&dev, 54, b"FAT16   ").unwrap();
		let mut padded = [b' '; 11];
		padded[..label.len()].copy_from_slice(label.as_bytes());
		write_bytes(&dev, 43, &padded).unwrap();
		Arc::new(dev)
	}

	fn cdfs_image(label: &str) -> Arc<dyn BlockDev> {
		let dev = MemDev::new(2048, 32);
		write_bytes(&dev, 16 * 2048 + 1, b"CD001").unwrap();
		let mut padded = [b' '; 32];
		padded[..label.len()].copy_from_slice(label.as_bytes());
		write_bytes(&dev, 16 * 2048 + 40, &padded).unwrap();
		Arc::new(dev)
	}

	struct Fixture {
		volumes: Arc<Volumes>,
		loc: Arc<MemLoc>,
		vfs: Arc<TestVfs>,
		parts: Arc<Parts>,
		cfg: PathBuf,
		system_cfg: PathBuf,
	}

	impl Drop for Fixture {
		fn drop(&mut self) {
			let _ = fs::remove_file(&self.cfg);
			let _ = fs::remove_file(&self.system_cfg);
		}
	}

	fn setup() -> Fixture {
		let cfg = cfg_path();
		let system_cfg = cfg_path();
		let volumes = Volumes::create(&cfg).unwrap();
		let loc = MemLoc::new();
		let vfs = TestVfs::new();
		let parts = Parts::new(volumes.clone(), loc.clone(), vfs.clone(), &system_cfg);
		Fixture {
			volumes,
			loc,
			vfs,
			parts,
			cfg,
			system_cfg,
		}
	}

	#[test]
	fn labeled_partition_is_automounted() {
		let f = setup();
		let sid = f.loc.add("usb0-p1", fat_image("STICK"));
		f.parts.check_new().unwrap();
		let part = f.parts.find_by_id_ref(sid).unwrap();
		let info = part.info();
		assert_eq!(info.pcnt, PartCnt::Fs);
		assert_eq!(info.fstype, Some(FsType::Fat));
		assert_eq!(info.label, "STICK");
		assert_eq!(info.cur_mp.as_deref(), Some("/vol/STICK"));
		assert!(info.cur_mp_auto);
		assert_eq!(f.vfs.mounted("/vol/STICK"), Some((FsType::Fat, sid)));
		f.parts.del_ref(&part);
	}

	#[test]
	fn ata_partition_is_not_automounted() {
		let f = setup();
		let sid = f.loc.add("ata-c0-p1", fat_image("DATA"));
		f.parts.check_new().unwrap();
		let part = f.parts.find_by_id_ref(sid).unwrap();
		let info = part.info();
		assert_eq!(info.pcnt, PartCnt::Fs);
		assert_eq!(info.cur_mp, None);
		assert_eq!(f.vfs.mounted("/vol/DATA"), None);
		f.parts.del_ref(&part);
	}

	#[test]
	fn cdfs_is_automounted_even_from_ata() {
		let f = setup();
		let sid = f.loc.add("ata-c1-d0", cdfs_image("INSTALL"));
		f.parts.check_new().unwrap();
		let part = f.parts.find_by_id_ref(sid).unwrap();
		assert_eq!(part.info().cur_mp.as_deref(), Some("/vol/INSTALL"));
		f.parts.del_ref(&part);
	}

	#[test]
	fn unlabeled_filesystem_is_not_automounted() {
		let f = setup();
		let dev: Arc<dyn BlockDev> = Arc::new(MemDev::new(512, 1024));
		mfs::mkfs::create(&dev, &mfs::mkfs::MkfsParams::default()).unwrap();
		let sid = f.loc.add("usb1-p1", dev);
		f.parts.check_new().unwrap();
		let part = f.parts.find_by_id_ref(sid).unwrap();
		let info = part.info();
		assert_eq!(info.fstype, Some(FsType::Minix));
		assert_eq!(info.cur_mp, None);
		f.parts.del_ref(&part);
	}

	#[test]
	fn empty_and_unknown_classification() {
		let f = setup();
		let blank = f.loc.add("usb2-p1", Arc::new(MemDev::new(512, 64)));
		let garbage_dev = MemDev::new(512, 64);
		write_bytes(&garbage_dev, 0, &[0xde, 0xad]).unwrap();
		let garbage = f.loc.add("usb2-p2", Arc::new(garbage_dev));
		f.parts.check_new().unwrap();
		let part = f.parts.find_by_id_ref(blank).unwrap();
		assert_eq!(part.info().pcnt, PartCnt::Empty);
		f.parts.del_ref(&part);
		let part = f.parts.find_by_id_ref(garbage).unwrap();
		let info = part.info();
		assert_eq!(info.pcnt, PartCnt::Unknown);
		assert_eq!(info.fstype, None);
		f.parts.del_ref(&part);
	}

	#[test]
	fn eject_and_insert_cycle() {
		let f = setup();
		let sid = f.loc.add("usb0-p1", fat_image("STICK"));
		f.parts.check_new().unwrap();
		let part = f.parts.find_by_id_ref(sid).unwrap();
		f.parts.eject(&part).unwrap();
		assert_eq!(part.info().cur_mp, None);
		assert_eq!(f.vfs.mounted("/vol/STICK"), None);
		// The automatic mount point directory went away with the mount
		assert!(!f.vfs.has_dir("/vol/STICK"));
		// Ejecting twice is fine
		f.parts.eject(&part).unwrap();
		f.parts.insert(&part).unwrap();
		assert_eq!(part.info().cur_mp.as_deref(), Some("/vol/STICK"));
		f.parts.del_ref(&part);
	}

	#[test]
	fn vanished_partition_keeps_persistent_volume_only() {
		let f = setup();
		let transient = f.loc.add("usb0-p1", fat_image("STICK"));
		let persistent = f.loc.add("usb0-p2", fat_image("BACKUP"));
		f.parts.check_new().unwrap();
		let part = f.parts.find_by_id_ref(persistent).unwrap();
		f.vfs.provide("/mnt/backup");
		f.parts.set_mountp(&part, "/mnt/backup").unwrap();
		f.parts.del_ref(&part);
		f.loc.remove(transient);
		f.loc.remove(persistent);
		f.parts.check_new().unwrap();
		assert!(f.parts.get_ids().is_empty());
		// The configured volume is still known under its old ID, the
		// unconfigured one was dropped
		let backup = f.volumes.lookup_ref("BACKUP");
		assert_eq!(backup.mountp(), "/mnt/backup");
		assert_eq!(f.volumes.get_ids(), vec![backup.id()]);
		let stick = f.volumes.lookup_ref("STICK");
		assert_eq!(stick.mountp(), "");
		f.volumes.del_ref(&backup);
		f.volumes.del_ref(&stick);
	}

	#[test]
	fn set_mountp_literal_and_back_to_default() {
		let f = setup();
		let sid = f.loc.add("usb0-p1", fat_image("STICK"));
		f.parts.check_new().unwrap();
		let part = f.parts.find_by_id_ref(sid).unwrap();
		f.vfs.provide("/mnt/usb");
		f.parts.set_mountp(&part, "/mnt/usb").unwrap();
		let info = part.info();
		assert_eq!(info.cur_mp.as_deref(), Some("/mnt/usb"));
		assert!(!info.cur_mp_auto);
		assert_eq!(f.vfs.mounted("/vol/STICK"), None);
		// The setting reached the store
		let doc: serde_json::Value =
			serde_json::from_slice(&fs::read(&f.cfg).unwrap()).unwrap();
		assert_eq!(doc["volumes"][0]["label"], "STICK");
		assert_eq!(doc["volumes"][0]["mountp"], "/mnt/usb");
		// Setting the default value reverts to the automatic policy
		f.parts.set_mountp(&part, "Auto").unwrap();
		let info = part.info();
		assert_eq!(info.cur_mp.as_deref(), Some("/vol/STICK"));
		assert!(info.cur_mp_auto);
		assert!(f.volumes.get_ids().is_empty());
		f.parts.del_ref(&part);
	}

	#[test]
	fn invalid_mountp_is_rejected() {
		let f = setup();
		let sid = f.loc.add("usb0-p1", fat_image("STICK"));
		f.parts.check_new().unwrap();
		let part = f.parts.find_by_id_ref(sid).unwrap();
		assert_eq!(
			f.parts.set_mountp(&part, "relative/path").err(),
			Some(Error::InvalidArg)
		);
		f.parts.del_ref(&part);
	}

	#[test]
	fn mkfs_without_label_mounts_only_explicitly() {
		let f = setup();
		let sid = f.loc.add("usb3-p1", Arc::new(MemDev::new(512, 1024)));
		f.parts.check_new().unwrap();
		let part = f.parts.find_by_id_ref(sid).unwrap();
		assert_eq!(part.info().pcnt, PartCnt::Empty);
		f.parts.mkfs(&part, FsType::Minix, "", "Auto").unwrap();
		// A nameless volume has no automatic mount point
		let info = part.info();
		assert_eq!(info.pcnt, PartCnt::Fs);
		assert_eq!(info.fstype, Some(FsType::Minix));
		assert_eq!(info.cur_mp, None);
		f.vfs.provide("/mnt/usb");
		f.parts.set_mountp(&part, "/mnt/usb").unwrap();
		assert_eq!(part.info().cur_mp.as_deref(), Some("/mnt/usb"));
		// Without a label there is nothing to remember the setting under
		let doc: serde_json::Value =
			serde_json::from_slice(&fs::read(&f.cfg).unwrap()).unwrap();
		assert_eq!(doc["volumes"].as_array().unwrap().len(), 0);
		f.parts.del_ref(&part);
	}

	#[test]
	fn wiping_reclassifies_as_empty() {
		let f = setup();
		let garbage_dev = MemDev::new(512, 64);
		write_bytes(&garbage_dev, 0, &[0xde, 0xad]).unwrap();
		let sid = f.loc.add("usb4-p1", Arc::new(garbage_dev));
		f.parts.check_new().unwrap();
		let part = f.parts.find_by_id_ref(sid).unwrap();
		assert_eq!(part.info().pcnt, PartCnt::Unknown);
		f.parts.empty(&part).unwrap();
		assert_eq!(part.info().pcnt, PartCnt::Empty);
		f.parts.insert(&part).unwrap();
		assert_eq!(part.info().pcnt, PartCnt::Empty);
		f.parts.del_ref(&part);
	}

	#[test]
	fn mounting_the_system_volume_merges_configuration() {
		let f = setup();
		// A configuration left on the system volume from an earlier session
		{
			let sys = Volumes::create(&f.system_cfg).unwrap();
			let v = sys.lookup_ref("media");
			sys.set_mountp(&v, "/srv/media").unwrap();
			sys.del_ref(&v);
		}
		let sid = f.loc.add("ata-c0-p2", fat_image("ROOT"));
		f.parts.check_new().unwrap();
		let part = f.parts.find_by_id_ref(sid).unwrap();
		f.vfs.provide("/w");
		f.parts.set_mountp(&part, "/w").unwrap();
		// The merged entry is now visible
		let media = f.volumes.lookup_ref("media");
		assert_eq!(media.mountp(), "/srv/media");
		f.volumes.del_ref(&media);
		f.parts.del_ref(&part);
	}
}
