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

//! Filesystem probers.
//!
//! Each prober recognizes one filesystem by its distinguishing on-disk
//! structures and extracts the volume label where the format stores one.
//! [`probers`] returns the table in its fixed probing order; the first
//! successful prober wins. Probe failures (including short reads on small
//! devices) are not errors, they just move the scan along.

use crate::{FsProbeInfo, FsType, Result};
use mfs::dev::{read_bytes, BlockDev};
use mfs::Error;

/// A filesystem recognizer.
pub trait FsProber: Send + Sync {
	fn fstype(&self) -> FsType;
	/// Probes `dev`; an `Err` means the filesystem is not present.
	fn probe(&self, dev: &dyn BlockDev) -> Result<FsProbeInfo>;
}

/// Returns the prober table in probing order.
pub fn probers() -> Vec<Box<dyn FsProber>> {
	vec![
		Box::new(ExFatProber),
		Box::new(FatProber),
		Box::new(MinixProber),
		Box::new(Ext4Prober),
		Box::new(CdfsProber),
	]
}

/// Byte offset of the boot sector signature.
const BOOT_SIG_OFF: u64 = 510;
/// Boot sector signature.
const BOOT_SIG: [u8; 2] = [0x55, 0xaa];

fn has_boot_sig(dev: &dyn BlockDev) -> Result<bool> {
	let mut sig = [0u8; 2];
	read_bytes(dev, BOOT_SIG_OFF, &mut sig)?;
	Ok(sig == BOOT_SIG)
}

/// Trims trailing spaces and NULs of a fixed-size label field.
fn trim_label(raw: &[u8]) -> String {
	let end = raw
		.iter()
		.rposition(|b| *b != b' ' && *b != 0)
		.map(|i| i + 1)
		.unwrap_or(0);
	String::from_utf8_lossy(&raw[..end]).into_owned()
}

struct ExFatProber;

impl FsProber for ExFatProber {
	fn fstype(&self) -> FsType {
		FsType::ExFat
	}

	fn probe(&self, dev: &dyn BlockDev) -> Result<FsProbeInfo> {
		let mut name = [0u8; 8];
		read_bytes(dev, 3, &mut name)?;
		if &name != b"EXFAT   " || !has_boot_sig(dev)? {
			return Err(Error::NotSupported);
		}
		// TODO read the volume label from the root directory entry set
		Ok(FsProbeInfo {
			fstype: FsType::ExFat,
			label: String::new(),
		})
	}
}

struct FatProber;

impl FsProber for FatProber {
	fn fstype(&self) -> FsType {
		FsType::Fat
	}

	fn probe(&self, dev: &dyn BlockDev) -> Result<FsProbeInfo> {
		if !has_boot_sig(dev)? {
			return Err(Error::NotSupported);
		}
		// FAT12/16 and FAT32 keep the type string and label at different
		// offsets in the boot sector
		let mut fstype16 = [0u8; 8];
		read_bytes(dev, 54, &mut fstype16)?;
		let mut fstype32 = [0u8; 8];
		read_bytes(dev, 82, &mut fstype32)?;
		let label_off = if fstype16.starts_with(b"FAT1") {
			43
		} else if &fstype32 == b"FAT32   " {
			71
		} else {
			return Err(Error::NotSupported);
		};
		let mut label = [0u8; 11];
		read_bytes(dev, label_off, &mut label)?;
		let label = match trim_label(&label).as_str() {
			"NO NAME" => String::new(),
			l => l.to_string(),
		};
		Ok(FsProbeInfo {
			fstype: FsType::Fat,
			label,
		})
	}
}

struct MinixProber;

impl FsProber for MinixProber {
	fn fstype(&self) -> FsType {
		FsType::Minix
	}

	fn probe(&self, dev: &dyn BlockDev) -> Result<FsProbeInfo> {
		// MINIX filesystems carry no volume label
		mfs::sb::probe(dev)?;
		Ok(FsProbeInfo {
			fstype: FsType::Minix,
			label: String::new(),
		})
	}
}

/// Byte offset of the ext4 superblock.
const EXT4_SB_OFF: u64 = 1024;
/// ext4 superblock magic.
const EXT4_MAGIC: u16 = 0xef53;

struct Ext4Prober;

impl FsProber for Ext4Prober {
	fn fstype(&self) -> FsType {
		FsType::Ext4
	}

	fn probe(&self, dev: &dyn BlockDev) -> Result<FsProbeInfo> {
		let mut magic = [0u8; 2];
		read_bytes(dev, EXT4_SB_OFF + 56, &mut magic)?;
		if u16::from_le_bytes(magic) != EXT4_MAGIC {
			return Err(Error::NotSupported);
		}
		let mut label = [0u8; 16];
		read_bytes(dev, EXT4_SB_OFF + 120, &mut label)?;
		Ok(FsProbeInfo {
			fstype: FsType::Ext4,
			label: trim_label(&label),
		})
	}
}

/// Byte offset of the first ISO 9660 volume descriptor (sector 16).
const CDFS_VD_OFF: u64 = 16 * 2048;

struct CdfsProber;

impl FsProber for CdfsProber {
	fn fstype(&self) -> FsType {
		FsType::Cdfs
	}

	fn probe(&self, dev: &dyn BlockDev) -> Result<FsProbeInfo> {
		let mut ident = [0u8; 5];
		read_bytes(dev, CDFS_VD_OFF + 1, &mut ident)?;
		if &ident != b"CD001" {
			return Err(Error::NotSupported);
		}
		let mut label = [0u8; 32];
		read_bytes(dev, CDFS_VD_OFF + 40, &mut label)?;
		Ok(FsProbeInfo {
			fstype: FsType::Cdfs,
			label: trim_label(&label),
		})
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use mfs::dev::{write_bytes, MemDev};

	fn probe_all(dev: &dyn BlockDev) -> Option<FsProbeInfo> {
		probers().iter().find_map(|p| p.probe(dev).ok())
	}

	#[test]
	fn blank_device_matches_nothing() {
		let dev = MemDev::new(512, 64);
		assert_eq!(probe_all(&dev), None);
	}

	#[test]
	fn tiny_device_is_survivable() {
		// Too small for any magic offset: all probers fail on short reads
		let dev = MemDev::new(512, 1);
		assert_eq!(probe_all(&dev), None);
	}

	#[test]
	fn fat16_with_label() {
		let dev = MemDev::new(512, 64);
		write_bytes(&dev, BOOT_SIG_OFF, &BOOT_SIG).unwrap();
		write_bytes(&dev, 54, b"FAT16   ").unwrap();
		write_bytes(&dev, 43, b"STICK      ").unwrap();
		let info = probe_all(&dev).unwrap();
		assert_eq!(info.fstype, FsType::Fat);
		assert_eq!(info.label, "STICK");
	}

	#[test]
	fn fat_no_name_label_is_empty() {
		let dev = MemDev::new(512, 64);
		write_bytes(&dev, BOOT_SIG_OFF, &BOOT_SIG).unwrap();
		write_bytes(&dev, 54, b"FAT12   ").unwrap();
		write_bytes(&dev, 43, b"NO NAME    ").unwrap();
		let info = probe_all(&dev).unwrap();
		assert_eq!(info.fstype, FsType::Fat);
		assert_eq!(info.label, "");
	}

	#[test]
	fn exfat_wins_over_fat() {
		// An exFAT boot sector also carries the boot signature; the fixed
		// probe order must classify it as exFAT
		let dev = MemDev::new(512, 64);
		write_bytes(&dev, 3, b"EXFAT   ").unwrap();
		write_bytes(&dev, BOOT_SIG_OFF, &BOOT_SIG).unwrap();
		let info = probe_all(&dev).unwrap();
		assert_eq!(info.fstype, FsType::ExFat);
	}

	#[test]
	fn ext4_label() {
		let dev = MemDev::new(512, 64);
		write_bytes(&dev, EXT4_SB_OFF + 56, &EXT4_MAGIC.to_le_bytes()).unwrap();
		write_bytes(&dev, EXT4_SB_OFF + 120, b"rootfs").unwrap();
		let info = probe_all(&dev).unwrap();
		assert_eq!(info.fstype, FsType::Ext4);
		assert_eq!(info.label, "rootfs");
	}

	#[test]
	fn cdfs_volume_identifier() {
		let dev = MemDev::new(2048, 32);
		write_bytes(&dev, CDFS_VD_OFF + 1, b"CD001").unwrap();
		write_bytes(&dev, CDFS_VD_OFF + 40, b"INSTALL DISC                    ").unwrap();
		let info = probe_all(&dev).unwrap();
		assert_eq!(info.fstype, FsType::Cdfs);
		assert_eq!(info.label, "INSTALL DISC");
	}

	#[test]
	fn minix_image_is_recognized() {
		let dev: std::sync::Arc<dyn BlockDev> = std::sync::Arc::new(MemDev::new(512, 1024));
		mfs::mkfs::create(&dev, &mfs::mkfs::MkfsParams::default()).unwrap();
		let info = probe_all(dev.as_ref()).unwrap();
		assert_eq!(info.fstype, FsType::Minix);
		assert_eq!(info.label, "");
	}
}
