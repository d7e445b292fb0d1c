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

//! Userspace driver for the MINIX filesystem, versions 1 through 3.
//!
//! The filesystem divides the storage device into several substructures:
//! - Superblock: fixed-position record describing the layout
//! - Inode/zone bitmaps: allocation state, one bit per object
//! - Inode table: one fixed-size record per file
//! - Data zones: file and directory contents
//!
//! The access to an inode's data is divided into several parts, each
//! overflowing on the next when full:
//! - Direct zone pointers: each inode has 7 of them
//! - Single indirect pointer: a zone dedicated to storing a list of more
//!   zones holding the inode's data
//! - Double indirect pointer: a zone storing pointers to single indirect
//!   zones
//!
//! Zone pointers are 16 bits wide on version 1 and 32 bits wide on versions 2
//! and 3, so with a zone size of `n` bytes the maximum file size is
//! `(7 * n) + ((n/2) * n) + ((n/2)^^2 * n)` or
//! `(7 * n) + ((n/4) * n) + ((n/4)^^2 * n)` respectively.
//!
//! All operations go through a buffered block cache ([`cache`]) over an
//! abstract block device ([`dev`]). Mounting is handled by [`ops`].

pub mod bitmap;
pub mod cache;
pub mod dev;
pub mod dirent;
pub mod endian;
pub mod inode;
pub mod mkfs;
pub mod node;
pub mod ops;
pub mod sb;
pub mod zone;

use core::fmt;

/// An error as surfaced to callers of the filesystem and volume layers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
	/// I/O error, or structural corruption discovered after a successful mount.
	Io,
	/// No free inode or zone is left on the filesystem.
	NoSpace,
	/// An allocation failed.
	NoMemory,
	/// Invalid argument.
	InvalidArg,
	/// The operation requires a directory but the node is not one.
	NotDir,
	/// No entry with the given name exists.
	NoEntry,
	/// An entry with the given name already exists.
	Exists,
	/// The directory to be removed is not empty.
	NotEmpty,
	/// The resource is still in use.
	Busy,
	/// The name exceeds the filesystem's limit.
	NameTooLong,
	/// The on-disk structure is not supported (unrecognized magic, zone sizes).
	NotSupported,
	/// The operation would grow the file past the filesystem's maximum size.
	FileTooLarge,
	/// A counter would overflow its on-disk width.
	Overflow,
}

impl Error {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Io => "I/O error",
			Self::NoSpace => "No space left on device",
			Self::NoMemory => "Out of memory",
			Self::InvalidArg => "Invalid argument",
			Self::NotDir => "Not a directory",
			Self::NoEntry => "No such file or directory",
			Self::Exists => "File exists",
			Self::NotEmpty => "Directory not empty",
			Self::Busy => "Resource busy",
			Self::NameTooLong => "Name too long",
			Self::NotSupported => "Operation not supported",
			Self::FileTooLarge => "File too large",
			Self::Overflow => "Value too large for on-disk field",
		}
	}
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
	fn from(_: std::io::Error) -> Self {
		Self::Io
	}
}

pub type Result<T> = core::result::Result<T, Error>;
