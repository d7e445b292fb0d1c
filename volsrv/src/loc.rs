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

//! Location registry interface.
//!
//! The registry enumerates partition block devices and names them. The real
//! registry is a separate service; [`MemLoc`] is an in-process registry used
//! by tests and standalone setups. Change notifications are delivered by the
//! owner calling [`crate::VolSvc::check_new`].

use crate::{Error, Result};
use mfs::dev::BlockDev;
use spin::Mutex;
use std::{collections::BTreeMap, sync::Arc};

/// Opaque handle of a registered block device service.
pub type ServiceId = u64;

/// The location registry, as seen by the volume service.
pub trait Loc: Send + Sync {
	/// Returns the service IDs of every registered partition.
	fn get_parts(&self) -> Result<Vec<ServiceId>>;
	/// Returns the human-readable name of a service.
	fn service_name(&self, sid: ServiceId) -> Result<String>;
	/// Opens the block device backing a service.
	fn open_block(&self, sid: ServiceId) -> Result<Arc<dyn BlockDev>>;
}

/// An in-process location registry.
pub struct MemLoc {
	parts: Mutex<BTreeMap<ServiceId, (String, Arc<dyn BlockDev>)>>,
}

impl MemLoc {
	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			parts: Mutex::new(BTreeMap::new()),
		})
	}

	/// Registers a partition device under `name` and returns its service ID.
	pub fn add(&self, name: &str, dev: Arc<dyn BlockDev>) -> ServiceId {
		let mut parts = self.parts.lock();
		let sid = parts.keys().next_back().map(|id| id + 1).unwrap_or(1);
		parts.insert(sid, (name.to_string(), dev));
		sid
	}

	/// Unregisters a partition device.
	pub fn remove(&self, sid: ServiceId) {
		self.parts.lock().remove(&sid);
	}
}

impl Loc for MemLoc {
	fn get_parts(&self) -> Result<Vec<ServiceId>> {
		Ok(self.parts.lock().keys().copied().collect())
	}

	fn service_name(&self, sid: ServiceId) -> Result<String> {
		self.parts
			.lock()
			.get(&sid)
			.map(|(name, _)| name.clone())
			.ok_or(Error::NoEntry)
	}

	fn open_block(&self, sid: ServiceId) -> Result<Arc<dyn BlockDev>> {
		self.parts
			.lock()
			.get(&sid)
			.map(|(_, dev)| dev.clone())
			.ok_or(Error::NoEntry)
	}
}
