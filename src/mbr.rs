/*
amflash, to unsparse images and resize partitions on Aml devices: MBR module
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

use std::{fmt::Display, fs::OpenOptions, io::{Seek, SeekFrom, Write}, path::Path};

use byteorder::{ByteOrder, LittleEndian};
use log::{error, info};

use crate::{Error, Result};

pub const PART_TYPE_LINUX_NATIVE_FS: u8 = 0x83;
pub const DOS_PART_TBL_OFFSET: u64 = 0x1be;
pub const SIZE_DOS_PARTITION: usize = 16;
/// The data partition sits in the second slot
pub const DATA_PART_OFFSET: u64 = DOS_PART_TBL_OFFSET + SIZE_DOS_PARTITION as u64;

#[derive(Debug)]
pub enum MbrError {
    FieldOverflow {
        field: &'static str,
        value: u64,
    },
}

impl From<MbrError> for Error {
    fn from(value: MbrError) -> Self {
        Error::MbrError(value)
    }
}

impl Display for MbrError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MbrError::FieldOverflow { field, value } =>
                write!(f, "{} 0x{:x} does not fit in a DOS partition entry",
                    field, value),
        }
    }
}

/// A DOS partition record used as a carrier: start and size hold whatever
/// units the vendor table uses, no LBA nor CHS conversion is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DosPartitionEntry {
    pub boot_ind: u8,
    pub head: u8,
    pub sector: u8,
    pub cyl: u8,
    pub sys_ind: u8,
    pub end_head: u8,
    pub end_sector: u8,
    pub end_cyl: u8,
    pub start: u32,
    pub size: u32,
}

impl DosPartitionEntry {
    pub fn new(start: u32, size: u32, sys_ind: u8) -> Self {
        Self {
            boot_ind: 0,
            head: 0,
            sector: 1,
            cyl: 1,
            sys_ind,
            end_head: 0,
            end_sector: 0,
            end_cyl: 0,
            start,
            size,
        }
    }

    pub fn parse(data: &[u8; SIZE_DOS_PARTITION]) -> Self {
        Self {
            boot_ind: data[0],
            head: data[1],
            sector: data[2],
            cyl: data[3],
            sys_ind: data[4],
            end_head: data[5],
            end_sector: data[6],
            end_cyl: data[7],
            start: LittleEndian::read_u32(&data[8..12]),
            size: LittleEndian::read_u32(&data[12..16]),
        }
    }

    pub fn to_bytes(&self) -> [u8; SIZE_DOS_PARTITION] {
        let mut data = [0; SIZE_DOS_PARTITION];
        data[0..8].copy_from_slice(&[self.boot_ind, self.head, self.sector,
            self.cyl, self.sys_ind, self.end_head, self.end_sector,
            self.end_cyl]);
        LittleEndian::write_u32(&mut data[8..12], self.start);
        LittleEndian::write_u32(&mut data[12..16], self.size);
        data
    }
}

fn fit_u32(field: &'static str, value: u64) -> Result<u32> {
    match u32::try_from(value) {
        Ok(value) => Ok(value),
        Err(_) => {
            error!("MBR {} 0x{:x} exceeds 32 bits", field, value);
            Err(MbrError::FieldOverflow { field, value }.into())
        },
    }
}

/// The data partition entry for `size` and `offset`, refused if either does
/// not fit the 32-bit fields
pub fn data_entry(size: u64, offset: u64) -> Result<DosPartitionEntry> {
    Ok(DosPartitionEntry::new(
        fit_u32("offset", offset)?, fit_u32("size", size)?,
        PART_TYPE_LINUX_NATIVE_FS))
}

/// Write `entry` into the data partition slot of the MBR at `node`.
///
/// With `truncate` set the node is opened like a fresh file, which throws
/// away everything else in it when `node` is a regular file.
pub fn write_data_entry<P: AsRef<Path>>(
    node: P, entry: &DosPartitionEntry, truncate: bool
)
    -> Result<()>
{
    let node = node.as_ref();
    let mut file = match OpenOptions::new()
        .write(true).create(true).truncate(truncate).open(node)
    {
        Ok(file) => file,
        Err(e) => {
            error!("Failed to open MBR '{}': {}", node.display(), e);
            return Err(e.into())
        },
    };
    file.seek(SeekFrom::Start(DATA_PART_OFFSET))?;
    if let Err(e) = file.write_all(&entry.to_bytes()) {
        error!("Failed to write MBR entry to '{}': {}", node.display(), e);
        return Err(e.into())
    }
    file.flush()?;
    info!("MBR data partition set to offset 0x{:x}, size 0x{:x}",
        entry.start, entry.size);
    Ok(())
}

/// Encode and write the data partition entry, see [`write_data_entry`]
pub fn write_entry<P: AsRef<Path>>(node: P, size: u64, offset: u64, truncate: bool)
    -> Result<()>
{
    write_data_entry(node, &data_entry(size, offset)?, truncate)
}
