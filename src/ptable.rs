/*
amflash, to unsparse images and resize partitions on Aml devices: partition table module
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

use std::{fmt::Display, fs::{File, OpenOptions}, io::{Cursor, Read, Seek, SeekFrom, Write}, path::Path};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use log::{error, info};

use crate::{pretty::human_readable, Error, Result};

/* Layout of the reserved partition table (MPT) as the bootloader lays it out */

pub const MPT_MAGIC: &[u8] = b"MPT";
pub const MPT_VERSION: &[u8] = b"01.00.00";
pub const MAX_MPT_PART_NAME_LEN: usize = 16;
pub const MAX_MPT_PART_NUM: usize = 32;

const SIZE_RAW_MAGIC: usize = 4;
const SIZE_RAW_VERSION: usize = 12;
/// magic, version, nr_parts, checksum
pub const SIZE_RAW_TABLE_HEAD: usize = SIZE_RAW_MAGIC + SIZE_RAW_VERSION + 4 + 4;
/// name, size, offset, mask_flags, then padding to 8-byte alignment
pub const SIZE_RAW_PARTITION: usize = MAX_MPT_PART_NAME_LEN + 8 + 8 + 4 + 4;
pub const SIZE_RAW_TABLE: usize =
    SIZE_RAW_TABLE_HEAD + SIZE_RAW_PARTITION * MAX_MPT_PART_NUM;

#[derive(Debug)]
pub enum TableError {
    ShortRead {
        read: usize,
        expected: usize,
    },
    InvalidMagic {
        magic: [u8; SIZE_RAW_MAGIC],
    },
    InvalidVersion {
        version: [u8; SIZE_RAW_VERSION],
    },
    InvalidCount {
        nr_parts: i32,
    },
    IndexOutOfRange {
        index: usize,
        nr_parts: usize,
    },
    NegativeSize {
        offset: u64,
        capacity: u64,
    },
}

impl From<TableError> for Error {
    fn from(value: TableError) -> Self {
        Error::TableError(value)
    }
}

impl Display for TableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TableError::ShortRead { read, expected } =>
                write!(f, "short read of {} bytes, expected {}", read, expected),
            TableError::InvalidMagic { magic } =>
                write!(f, "wrong magic 0x{}", hex::encode(magic)),
            TableError::InvalidVersion { version } =>
                write!(f, "wrong version 0x{}", hex::encode(version)),
            TableError::InvalidCount { nr_parts } =>
                write!(f, "partition count {} out of 0..={}",
                    nr_parts, MAX_MPT_PART_NUM),
            TableError::IndexOutOfRange { index, nr_parts } =>
                write!(f, "partition index {} out of {} partitions",
                    index, nr_parts),
            TableError::NegativeSize { offset, capacity } =>
                write!(f, "partition offset 0x{:x} is beyond device capacity 0x{:x}",
                    offset, capacity),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    /// Not NUL terminated when the name takes all 16 bytes
    pub name: [u8; MAX_MPT_PART_NAME_LEN],
    pub size: u64,
    pub offset: u64,
    pub mask_flags: u32,
    padding: [u8; 4],
}

impl PartitionEntry {
    /// Names longer than the field are cut, like the bootloader does
    pub fn new(name: &str, size: u64, offset: u64, mask_flags: u32) -> Self {
        let mut raw_name = [0; MAX_MPT_PART_NAME_LEN];
        let len = name.len().min(MAX_MPT_PART_NAME_LEN);
        raw_name[..len].copy_from_slice(&name.as_bytes()[..len]);
        Self {
            name: raw_name,
            size,
            offset,
            mask_flags,
            padding: [0; 4],
        }
    }

    fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = Cursor::new(data);
        let mut entry = Self::default();
        reader.read_exact(&mut entry.name)?;
        entry.size = reader.read_u64::<LittleEndian>()?;
        entry.offset = reader.read_u64::<LittleEndian>()?;
        entry.mask_flags = reader.read_u32::<LittleEndian>()?;
        reader.read_exact(&mut entry.padding)?;
        Ok(entry)
    }

    pub fn to_bytes(&self) -> [u8; SIZE_RAW_PARTITION] {
        let mut data = [0; SIZE_RAW_PARTITION];
        data[0..16].copy_from_slice(&self.name);
        LittleEndian::write_u64(&mut data[16..24], self.size);
        LittleEndian::write_u64(&mut data[24..32], self.offset);
        LittleEndian::write_u32(&mut data[32..36], self.mask_flags);
        data[36..40].copy_from_slice(&self.padding);
        data
    }

    pub fn name_bytes(&self) -> &[u8] {
        match self.name.iter().position(|byte| *byte == 0) {
            Some(end) => &self.name[..end],
            None => &self.name,
        }
    }

    pub fn name(&self) -> String {
        String::from_utf8_lossy(self.name_bytes()).into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTable {
    pub magic: [u8; SIZE_RAW_MAGIC],
    pub version: [u8; SIZE_RAW_VERSION],
    nr_parts: usize,
    /// Stored as-is, never recomputed nor verified
    pub checksum: i32,
    slots: Vec<PartitionEntry>,
}

impl Display for PartitionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MPT {}, {} partitions: [",
            String::from_utf8_lossy(trim_nul(&self.version)), self.nr_parts)?;
        let mut start = false;
        for entry in self.entries() {
            if start {
                write!(f, ", ")?;
            } else {
                start = true
            }
            write!(f, "{{ {}, offset 0x{:x}, size 0x{:x} }}",
                entry.name(), entry.offset, entry.size)?;
        }
        write!(f, "]")
    }
}

fn trim_nul(data: &[u8]) -> &[u8] {
    match data.iter().position(|byte| *byte == 0) {
        Some(end) => &data[..end],
        None => data,
    }
}

impl PartitionTable {
    /// A fresh table holding `entries`, magic and version set
    pub fn new(entries: Vec<PartitionEntry>) -> Result<Self> {
        if entries.len() > MAX_MPT_PART_NUM {
            return Err(TableError::InvalidCount {
                nr_parts: entries.len() as i32 }.into())
        }
        let mut magic = [0; SIZE_RAW_MAGIC];
        magic[..MPT_MAGIC.len()].copy_from_slice(MPT_MAGIC);
        let mut version = [0; SIZE_RAW_VERSION];
        version[..MPT_VERSION.len()].copy_from_slice(MPT_VERSION);
        let nr_parts = entries.len();
        let mut slots = entries;
        slots.resize(MAX_MPT_PART_NUM, PartitionEntry::default());
        Ok(Self { magic, version, nr_parts, checksum: 0, slots })
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < SIZE_RAW_TABLE {
            error!("Partition table of {} bytes is shorter than {} bytes",
                data.len(), SIZE_RAW_TABLE);
            return Err(TableError::ShortRead {
                read: data.len(), expected: SIZE_RAW_TABLE }.into())
        }
        let mut reader = Cursor::new(data);
        let mut magic = [0; SIZE_RAW_MAGIC];
        reader.read_exact(&mut magic)?;
        let mut version = [0; SIZE_RAW_VERSION];
        reader.read_exact(&mut version)?;
        let nr_parts = reader.read_i32::<LittleEndian>()?;
        let checksum = reader.read_i32::<LittleEndian>()?;
        if ! magic.starts_with(MPT_MAGIC) {
            error!("Partition table magic invalid: expected '{}', found 0x{}",
                String::from_utf8_lossy(MPT_MAGIC), hex::encode(magic));
            return Err(TableError::InvalidMagic { magic }.into())
        }
        if ! version.starts_with(MPT_VERSION) {
            error!("Partition table version invalid: expected '{}', found 0x{}",
                String::from_utf8_lossy(MPT_VERSION), hex::encode(version));
            return Err(TableError::InvalidVersion { version }.into())
        }
        let nr_parts = match usize::try_from(nr_parts) {
            Ok(count) if count <= MAX_MPT_PART_NUM => count,
            _ => {
                error!("Partition table claims {} partitions", nr_parts);
                return Err(TableError::InvalidCount { nr_parts }.into())
            },
        };
        let slots = data[SIZE_RAW_TABLE_HEAD..SIZE_RAW_TABLE]
            .chunks_exact(SIZE_RAW_PARTITION)
            .map(PartitionEntry::parse)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { magic, version, nr_parts, checksum, slots })
    }

    /// Read the whole table off `node` and validate it
    pub fn load<P: AsRef<Path>>(node: P) -> Result<Self> {
        let node = node.as_ref();
        let file = match File::open(node) {
            Ok(file) => file,
            Err(e) => {
                error!("Failed to open partition table '{}': {}",
                    node.display(), e);
                return Err(e.into())
            },
        };
        let mut data = Vec::with_capacity(SIZE_RAW_TABLE);
        file.take(SIZE_RAW_TABLE as u64).read_to_end(&mut data)?;
        Self::parse(&data)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(SIZE_RAW_TABLE);
        data.extend_from_slice(&self.magic);
        data.extend_from_slice(&self.version);
        data.extend_from_slice(&(self.nr_parts as i32).to_le_bytes());
        data.extend_from_slice(&self.checksum.to_le_bytes());
        for slot in self.slots.iter() {
            data.extend_from_slice(&slot.to_bytes())
        }
        data
    }

    pub fn nr_parts(&self) -> usize {
        self.nr_parts
    }

    /// Only the partitions counted by the header
    pub fn entries(&self) -> &[PartitionEntry] {
        &self.slots[..self.nr_parts]
    }

    pub fn entry(&self, index: usize) -> Option<&PartitionEntry> {
        self.entries().get(index)
    }

    /// First partition whose name is exactly `name`
    pub fn find(&self, name: &str) -> Option<usize> {
        self.entries().iter().position(
            |entry| entry.name_bytes() == name.as_bytes())
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index < self.nr_parts {
            Ok(())
        } else {
            Err(TableError::IndexOutOfRange {
                index, nr_parts: self.nr_parts }.into())
        }
    }

    /// Grow (or shrink) the partition at `index` to end at `capacity`,
    /// returning its new size and unchanged offset
    pub fn resize(&mut self, index: usize, capacity: u64) -> Result<(u64, u64)> {
        self.check_index(index)?;
        let entry = &mut self.slots[index];
        let size = match capacity.checked_sub(entry.offset) {
            Some(size) => size,
            None => {
                error!("Partition {} starts at 0x{:x}, beyond the device \
                    capacity 0x{:x}", entry.name(), entry.offset, capacity);
                return Err(TableError::NegativeSize {
                    offset: entry.offset, capacity }.into())
            },
        };
        info!("Resizing partition {} from {} to {}", entry.name(),
            human_readable(entry.size), human_readable(size));
        entry.size = size;
        Ok((size, entry.offset))
    }

    pub fn entry_offset(index: usize) -> u64 {
        (SIZE_RAW_TABLE_HEAD + SIZE_RAW_PARTITION * index) as u64
    }

    /// Write back only the entry at `index`, the rest of `node` is untouched
    pub fn persist_entry<P: AsRef<Path>>(&self, node: P, index: usize) -> Result<()> {
        self.check_index(index)?;
        let node = node.as_ref();
        let mut file = match OpenOptions::new().write(true).open(node) {
            Ok(file) => file,
            Err(e) => {
                error!("Failed to open partition table '{}' for writing: {}",
                    node.display(), e);
                return Err(e.into())
            },
        };
        let offset = Self::entry_offset(index);
        file.seek(SeekFrom::Start(offset))?;
        if let Err(e) = file.write_all(&self.slots[index].to_bytes()) {
            error!("Failed to write partition {} to '{}' at 0x{:x}: {}",
                self.slots[index].name(), node.display(), offset, e);
            return Err(e.into())
        }
        file.flush()?;
        Ok(())
    }

    pub fn print_table_stdout(&self) -> Result<()> {
        macro_rules! cell_right {
            ($raw: expr) => {
                $raw.cell().justify(Justify::Right)
            };
        }
        macro_rules! cell_bold_center {
            ($raw: expr) => {
                $raw.cell().bold(true).justify(Justify::Center)
            };
        }
        use cli_table::{Cell, Style, Table, format::Justify};
        let rows: Vec<_> = self.entries().iter().enumerate().map(
            |(id, entry)| [
                cell_right!(id),
                cell_right!(entry.name()),
                cell_right!(format!("0x{:x}", entry.offset)),
                cell_right!(format!("0x{:x}", entry.size)),
                cell_right!(human_readable(entry.size)),
                cell_right!(format!("0x{:x}", entry.mask_flags)),
            ]).collect();
        let table = rows.table().title([
            cell_bold_center!("ID"),
            cell_bold_center!("name"),
            cell_bold_center!("offset"),
            cell_bold_center!("size"),
            cell_bold_center!("human"),
            cell_bold_center!("mask"),
        ]).bold(true);
        println!("{}", self);
        cli_table::print_stdout(table)?;
        Ok(())
    }
}
