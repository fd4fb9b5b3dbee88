/*
amflash, to unsparse images and resize partitions on Aml devices: block device module
Copyright (C) 2024-present Guoxin "7Ji" Pu

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as
published by the Free Software Foundation, either version 3 of the
License, or (at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

use std::{fs::File, io::{Cursor, Seek, Write}, os::unix::{fs::FileTypeExt, io::AsRawFd}};

use nix::libc::c_int;

use crate::Result;

/// Block size reported for anything that is not a real block device
pub const FALLBACK_BLOCK_SIZE: u64 = 512;

// BLKGETSIZE64 is declared with a size_t argument but always writes a u64
nix::ioctl_read_bad!(blkgetsize64,
    nix::request_code_read!(0x12, 114, std::mem::size_of::<usize>()), u64);
nix::ioctl_read_bad!(blksszget, 0x1268, c_int);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub blocks: u64,
    pub block_size: u64,
}

impl Geometry {
    fn from_len(len: u64) -> Self {
        Self {
            blocks: len / FALLBACK_BLOCK_SIZE,
            block_size: FALLBACK_BLOCK_SIZE,
        }
    }

    /// Addressable bytes, `None` if the product does not fit
    pub fn capacity(&self) -> Option<u64> {
        self.blocks.checked_mul(self.block_size)
    }
}

/// A seekable write target that can tell how many blocks it addresses
pub trait BlockDevice: Write + Seek {
    fn geometry(&self) -> Result<Geometry>;
}

impl BlockDevice for File {
    fn geometry(&self) -> Result<Geometry> {
        let metadata = self.metadata()?;
        if ! metadata.file_type().is_block_device() {
            return Ok(Geometry::from_len(metadata.len()))
        }
        let fd = self.as_raw_fd();
        let mut bytes: u64 = 0;
        let mut block_size: c_int = 0;
        unsafe { blkgetsize64(fd, &mut bytes) }.map_err(std::io::Error::from)?;
        unsafe { blksszget(fd, &mut block_size) }.map_err(std::io::Error::from)?;
        if block_size <= 0 {
            log::error!("Block device reported logical block size {}", block_size);
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData,
                "invalid logical block size").into())
        }
        let block_size = block_size as u64;
        Ok(Geometry {
            blocks: bytes / block_size,
            block_size,
        })
    }
}

impl BlockDevice for Cursor<Vec<u8>> {
    fn geometry(&self) -> Result<Geometry> {
        Ok(Geometry::from_len(self.get_ref().len() as u64))
    }
}
