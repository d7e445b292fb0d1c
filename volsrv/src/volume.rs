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

//! Volume handling.
//!
//! Volumes are the filesystems contained in partitions. Each [`Volume`] is
//! the configuration entry for one volume label; each partition holds a
//! reference to the volume it is bound to.
//!
//! If there is any non-default configuration to be remembered for a volume,
//! the entry is kept around even after the partition is disassociated from
//! it: the transition from an empty to a non-empty mount point takes an extra
//! reference, and the reverse transition drops it. Otherwise the entry is
//! deleted once no longer referenced.
//!
//! The set of persistent volumes is serialized to a JSON document holding a
//! single `volumes` array of `{label, mountp}` records.

use crate::{Error, Result, VolInfo};
use log::debug;
use serde::{Deserialize, Serialize};
use spin::Mutex;
use std::{
	fs, io,
	path::{Path, PathBuf},
	sync::{
		atomic::{AtomicU32, Ordering::Relaxed},
		Arc,
	},
};

/// A volume configuration entry.
pub struct Volume {
	/// ID used by clients to refer to the volume.
	id: u64,
	/// Volume label; never changes after creation.
	label: String,
	/// Reference count; only mutated under the registry lock.
	refcnt: AtomicU32,
	/// Configured mount point; empty means "use the default policy".
	mountp: Mutex<String>,
}

impl Volume {
	pub fn id(&self) -> u64 {
		self.id
	}

	pub fn label(&self) -> &str {
		&self.label
	}

	pub fn mountp(&self) -> String {
		self.mountp.lock().clone()
	}

	/// Whether the volume has non-default settings that pin it in the
	/// registry.
	fn is_persist(&self) -> bool {
		!self.mountp.lock().is_empty()
	}

	/// Whether the volume is written to the configuration store. An entry
	/// without a label could never be matched again, so it is not saved.
	fn is_saved(&self) -> bool {
		self.is_persist() && !self.label.is_empty()
	}

	pub fn info(&self) -> VolInfo {
		VolInfo {
			id: self.id,
			label: self.label.clone(),
			path: self.mountp(),
		}
	}
}

/// The on-disk configuration document.
#[derive(Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct CfgDoc {
	volumes: Vec<CfgVolume>,
}

#[derive(Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct CfgVolume {
	label: String,
	mountp: String,
}

/// Reads a configuration document. Returns `None` when the file does not
/// exist; a present but malformed document is an error.
fn load_doc(path: &Path) -> Result<Option<CfgDoc>> {
	let bytes = match fs::read(path) {
		Ok(bytes) => bytes,
		Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
		Err(_) => return Err(Error::Io),
	};
	serde_json::from_slice(&bytes).map(Some).map_err(|_| Error::Io)
}

/// The volume registry.
pub struct Volumes {
	state: Mutex<VolumesState>,
}

struct VolumesState {
	list: Vec<Arc<Volume>>,
	next_id: u64,
	/// Path of the configuration store.
	cfg_path: PathBuf,
}

impl VolumesState {
	fn new_volume(&mut self, label: &str, mountp: &str) -> Arc<Volume> {
		let volume = Arc::new(Volume {
			id: self.next_id,
			label: label.to_string(),
			refcnt: AtomicU32::new(1),
			mountp: Mutex::new(mountp.to_string()),
		});
		self.next_id += 1;
		self.list.push(volume.clone());
		volume
	}

	/// Serializes the persistent volumes to the configuration store.
	fn save(&self) -> Result<()> {
		let doc = CfgDoc {
			volumes: self
				.list
				.iter()
				.filter(|v| v.is_saved())
				.map(|v| CfgVolume {
					label: v.label.clone(),
					mountp: v.mountp(),
				})
				.collect(),
		};
		let bytes = serde_json::to_vec_pretty(&doc).map_err(|_| Error::Io)?;
		fs::write(&self.cfg_path, bytes).map_err(|_| Error::Io)
	}

	fn drop_ref(&mut self, volume: &Arc<Volume>) {
		let prev = volume.refcnt.fetch_sub(1, Relaxed);
		debug_assert!(prev > 0);
		if prev == 1 {
			debug!("deleting volume {:?}", volume.label);
			self.list.retain(|v| v.id != volume.id);
		}
	}
}

impl Volumes {
	/// Creates the registry, loading `cfg_path` when it exists. A missing
	/// file is replaced by a new empty store.
	pub fn create(cfg_path: &Path) -> Result<Arc<Self>> {
		let mut state = VolumesState {
			list: Vec::new(),
			next_id: 1,
			cfg_path: cfg_path.to_path_buf(),
		};
		match load_doc(cfg_path)? {
			Some(doc) => {
				for v in &doc.volumes {
					state.new_volume(&v.label, &v.mountp);
				}
			}
			None => state.save()?,
		}
		Ok(Arc::new(Self {
			state: Mutex::new(state),
		}))
	}

	/// Switches the configuration store to `cfg_path` and merges its entries
	/// into the registry. Used once the system volume is mounted.
	pub fn merge_to(&self, cfg_path: &Path) -> Result<()> {
		let mut state = self.state.lock();
		state.cfg_path = cfg_path.to_path_buf();
		match load_doc(cfg_path)? {
			Some(doc) => {
				for v in &doc.volumes {
					state.new_volume(&v.label, &v.mountp);
				}
				Ok(())
			}
			None => state.save(),
		}
	}

	/// Writes the persistent volumes to the configuration store.
	pub fn sync(&self) -> Result<()> {
		self.state.lock().save()
	}

	/// Returns the volume with the given label, creating it if missing, with
	/// a reference added. Lookup by label only matches non-empty labels.
	pub fn lookup_ref(&self, label: &str) -> Arc<Volume> {
		let mut state = self.state.lock();
		if !label.is_empty() {
			if let Some(volume) = state.list.iter().find(|v| v.label == label) {
				volume.refcnt.fetch_add(1, Relaxed);
				return volume.clone();
			}
		}
		debug!("new volume for label {label:?}");
		state.new_volume(label, "")
	}

	/// Returns the volume with the given ID, with a reference added.
	pub fn find_by_id_ref(&self, id: u64) -> Result<Arc<Volume>> {
		let state = self.state.lock();
		let volume = state
			.list
			.iter()
			.find(|v| v.id == id)
			.ok_or(Error::NoEntry)?;
		volume.refcnt.fetch_add(1, Relaxed);
		Ok(volume.clone())
	}

	/// Drops a reference to `volume`, deleting the entry when this was the
	/// last one.
	pub fn del_ref(&self, volume: &Arc<Volume>) {
		self.state.lock().drop_ref(volume);
	}

	/// Sets the volume's mount point and synchronizes the store.
	///
	/// A volume whose mount point becomes non-empty turns persistent: it
	/// takes an extra reference so the entry survives its partition's
	/// removal. The reverse transition gives that reference back.
	pub fn set_mountp(&self, volume: &Arc<Volume>, mountp: &str) -> Result<()> {
		let mut state = self.state.lock();
		let was_persist = volume.is_persist();
		*volume.mountp.lock() = mountp.to_string();
		let is_persist = volume.is_persist();
		if is_persist && !was_persist {
			// Now persistent: prevent the entry from being freed
			volume.refcnt.fetch_add(1, Relaxed);
		} else if !is_persist && was_persist {
			state.drop_ref(volume);
		}
		state.save()
	}

	/// Returns the IDs of all persistent volumes.
	pub fn get_ids(&self) -> Vec<u64> {
		self.state
			.lock()
			.list
			.iter()
			.filter(|v| v.is_saved())
			.map(|v| v.id)
			.collect()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::sync::atomic::AtomicUsize;

	static NEXT_CFG: AtomicUsize = AtomicUsize::new(0);

	fn cfg_path() -> PathBuf {
		std::env::temp_dir().join(format!(
			"volsrv-volume-test-{}-{}.json",
			std::process::id(),
			NEXT_CFG.fetch_add(1, Relaxed)
		))
	}

	#[test]
	fn missing_store_is_an_empty_set() {
		let path = cfg_path();
		let volumes = Volumes::create(&path).unwrap();
		assert!(volumes.get_ids().is_empty());
		// The store was created on the way
		assert!(path.exists());
		let _ = fs::remove_file(&path);
	}

	#[test]
	fn malformed_store_is_refused() {
		let path = cfg_path();
		fs::write(&path, b"{\"not-volumes\": []}").unwrap();
		assert_eq!(Volumes::create(&path).err(), Some(Error::Io));
		fs::write(&path, b"useless garbage").unwrap();
		assert_eq!(Volumes::create(&path).err(), Some(Error::Io));
		let _ = fs::remove_file(&path);
	}

	#[test]
	fn persistent_volume_survives_restart() {
		let path = cfg_path();
		{
			let volumes = Volumes::create(&path).unwrap();
			let v = volumes.lookup_ref("root");
			volumes.set_mountp(&v, "/w").unwrap();
			volumes.del_ref(&v);
		}
		let volumes = Volumes::create(&path).unwrap();
		let ids = volumes.get_ids();
		assert_eq!(ids.len(), 1);
		let v = volumes.find_by_id_ref(ids[0]).unwrap();
		let info = v.info();
		assert_eq!(info.label, "root");
		assert_eq!(info.path, "/w");
		volumes.del_ref(&v);
		let _ = fs::remove_file(&path);
	}

	#[test]
	fn default_mountp_volume_is_dropped_with_its_partition() {
		let path = cfg_path();
		let volumes = Volumes::create(&path).unwrap();
		let v = volumes.lookup_ref("stick");
		volumes.del_ref(&v);
		assert!(volumes.state.lock().list.is_empty());
		let _ = fs::remove_file(&path);
	}

	#[test]
	fn persistence_pin_is_taken_and_given_back_once() {
		let path = cfg_path();
		let volumes = Volumes::create(&path).unwrap();
		let v = volumes.lookup_ref("stick");
		volumes.set_mountp(&v, "/mnt/stick").unwrap();
		// Setting a non-empty mount point twice must not pin twice
		volumes.set_mountp(&v, "/mnt/other").unwrap();
		volumes.del_ref(&v);
		assert_eq!(volumes.state.lock().list.len(), 1);
		// Unpinning drops the entry, it has no other reference left
		let v = volumes.find_by_id_ref(volumes.get_ids()[0]).unwrap();
		volumes.set_mountp(&v, "").unwrap();
		volumes.del_ref(&v);
		assert!(volumes.state.lock().list.is_empty());
		let _ = fs::remove_file(&path);
	}

	#[test]
	fn lookup_by_empty_label_always_creates() {
		let path = cfg_path();
		let volumes = Volumes::create(&path).unwrap();
		let a = volumes.lookup_ref("");
		let b = volumes.lookup_ref("");
		assert_ne!(a.id(), b.id());
		volumes.del_ref(&a);
		volumes.del_ref(&b);
		let _ = fs::remove_file(&path);
	}

	#[test]
	fn lookup_by_label_shares_the_entry() {
		let path = cfg_path();
		let volumes = Volumes::create(&path).unwrap();
		let a = volumes.lookup_ref("data");
		let b = volumes.lookup_ref("data");
		assert_eq!(a.id(), b.id());
		volumes.del_ref(&a);
		volumes.del_ref(&b);
		let _ = fs::remove_file(&path);
	}

	#[test]
	fn merge_appends_entries_and_switches_the_store() {
		let first = cfg_path();
		let second = cfg_path();
		{
			let volumes = Volumes::create(&second).unwrap();
			let v = volumes.lookup_ref("extra");
			volumes.set_mountp(&v, "/srv/extra").unwrap();
			volumes.del_ref(&v);
		}
		let volumes = Volumes::create(&first).unwrap();
		let v = volumes.lookup_ref("root");
		volumes.set_mountp(&v, "/w").unwrap();
		volumes.del_ref(&v);
		volumes.merge_to(&second).unwrap();
		assert_eq!(volumes.get_ids().len(), 2);
		// Syncs now go to the merged store
		volumes.sync().unwrap();
		let reloaded = Volumes::create(&second).unwrap();
		assert_eq!(reloaded.get_ids().len(), 2);
		let _ = fs::remove_file(&first);
		let _ = fs::remove_file(&second);
	}
}
