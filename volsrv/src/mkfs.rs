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

//! Filesystem creation dispatch.
//!
//! Routes a mkfs request to the factory of the requested filesystem type.
//! Only MINIX has an in-tree factory; the other recognized types are
//! probe-only.

use crate::{Error, FsType, LabelSupport, Result};
use log::warn;
use mfs::dev::BlockDev;
use std::sync::Arc;

/// Tells whether `fstype` can carry a volume label.
pub fn label_support(fstype: FsType) -> LabelSupport {
	let supported = matches!(fstype, FsType::ExFat | FsType::Fat | FsType::Ext4);
	LabelSupport {
		supported,
	}
}

/// Creates a filesystem of type `fstype` on `dev`.
///
/// A label on a filesystem type without label support is ignored with a
/// warning; the caller is expected to consult [`label_support`] first.
pub fn part_mkfs(dev: &Arc<dyn BlockDev>, fstype: FsType, label: &str) -> Result<()> {
	if !label.is_empty() && !label_support(fstype).supported {
		warn!("{} filesystems cannot store the label {label:?}", fstype.as_str());
	}
	match fstype {
		FsType::Minix => mfs::mkfs::create(dev, &mfs::mkfs::MkfsParams::default()),
		_ => Err(Error::NotSupported),
	}
}
