/*
amflash, to unsparse images and resize partitions on Aml devices: sparse module
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

// Logic to write Android Sparse Image onto block devices
// # Android sparse img format
// # From https://android.googlesource.com/\
// # platform/system/core/+/master/libsparse/sparse_format.h
// 0		lelong	0xed26ff3a		Android sparse image
// >4		leshort	x			\b, version: %d
// >6		leshort	x			\b.%d
// >16		lelong	x			\b, Total of %d
// >12		lelong	x			\b %d-byte output blocks in
// >20		lelong	x			\b %d input chunks.

use std::{fmt::Display, io::{Cursor, SeekFrom}};

use byteorder::{LittleEndian, ReadBytesExt};
use indicatif::ProgressBar;
use log::{debug, error, info};

use crate::{blockdev::BlockDevice, pretty::human_readable, Error, Result};

pub const SPARSE_HEADER_MAGIC: u32 = 0xed26ff3a;
/// Images with any other major version are rejected, minor is ignored
pub const SPARSE_HEADER_MAJOR_VERSION: u16 = 1;
pub const SPARSE_HEADER_SIZE: u16 = 28;
pub const CHUNK_HEADER_SIZE: u16 = 12;

const CHUNK_TYPE_RAW: u16 = 0xcac1;
const CHUNK_TYPE_FILL: u16 = 0xcac2;
const CHUNK_TYPE_DONT_CARE: u16 = 0xcac3;

#[derive(Debug)]
pub enum SparseError {
    BadMagic {
        magic: u32,
    },
    Truncated {
        offset: u64,
        needed: u64,
        available: u64,
    },
    CapacityExceeded {
        needed: u64,
        available: u64,
    },
    Incompatible {
        major_version: u16,
        file_hdr_sz: u16,
        chunk_hdr_sz: u16,
    },
    MisalignedBlockSize {
        block_size: u32,
        device_block_size: u64,
    },
    BadChunkSize {
        index: u32,
        chunk_type: ChunkType,
        total_size: u32,
    },
    UnknownChunk {
        index: u32,
        chunk_type: u16,
    },
    GeometryOverflow,
}

impl From<SparseError> for Error {
    fn from(value: SparseError) -> Self {
        Error::SparseError(value)
    }
}

impl Display for SparseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SparseError::BadMagic { magic } =>
                write!(f, "bad magic {:#010x}, expected {:#010x}",
                    magic, SPARSE_HEADER_MAGIC),
            SparseError::Truncated { offset, needed, available } =>
                write!(f, "image truncated at {}: need {} bytes, have {}",
                    offset, needed, available),
            SparseError::CapacityExceeded { needed, available } =>
                write!(f, "section size {} limit exceeded, need {}",
                    human_readable(*available), human_readable(*needed)),
            SparseError::Incompatible { major_version, file_hdr_sz, chunk_hdr_sz } =>
                write!(f, "incompatible format: major version {}, header size {}, \
                    chunk header size {}", major_version, file_hdr_sz, chunk_hdr_sz),
            SparseError::MisalignedBlockSize { block_size, device_block_size } =>
                write!(f, "block size {} is not a multiple of device block size {}",
                    block_size, device_block_size),
            SparseError::BadChunkSize { index, chunk_type, total_size } =>
                write!(f, "bad chunk size {} for chunk {}, type {}",
                    total_size, index, chunk_type),
            SparseError::UnknownChunk { index, chunk_type } =>
                write!(f, "unknown chunk ID {:04x} for chunk {}", chunk_type, index),
            SparseError::GeometryOverflow =>
                write!(f, "device geometry overflows 64-bit byte addressing"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkType {
    Raw,
    Fill,
    DontCare,
    Unknown(u16),
}

impl From<u16> for ChunkType {
    fn from(value: u16) -> Self {
        match value {
            CHUNK_TYPE_RAW => Self::Raw,
            CHUNK_TYPE_FILL => Self::Fill,
            CHUNK_TYPE_DONT_CARE => Self::DontCare,
            _ => Self::Unknown(value),
        }
    }
}

impl From<ChunkType> for u16 {
    fn from(value: ChunkType) -> Self {
        match value {
            ChunkType::Raw => CHUNK_TYPE_RAW,
            ChunkType::Fill => CHUNK_TYPE_FILL,
            ChunkType::DontCare => CHUNK_TYPE_DONT_CARE,
            ChunkType::Unknown(value) => value,
        }
    }
}

impl Display for ChunkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChunkType::Raw => write!(f, "Raw"),
            ChunkType::Fill => write!(f, "Fill"),
            ChunkType::DontCare => write!(f, "Don't care"),
            ChunkType::Unknown(value) => write!(f, "Unknown ({:04x})", value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseHeader {
    pub magic: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub file_hdr_sz: u16,
    pub chunk_hdr_sz: u16,
    pub blk_sz: u32,
    pub total_blks: u32,
    pub total_chunks: u32,
    /// CRC32 of the unsparsed data, carried but never checked
    pub image_checksum: u32,
}

impl SparseHeader {
    pub fn parse(buffer: &[u8]) -> Result<Self> {
        if buffer.len() < SPARSE_HEADER_SIZE as usize {
            error!("Sparse image of {} bytes is shorter than its header",
                buffer.len());
            return Err(SparseError::Truncated {
                offset: 0,
                needed: SPARSE_HEADER_SIZE.into(),
                available: buffer.len() as u64,
            }.into())
        }
        let mut reader = Cursor::new(buffer);
        Ok(Self {
            magic: reader.read_u32::<LittleEndian>()?,
            major_version: reader.read_u16::<LittleEndian>()?,
            minor_version: reader.read_u16::<LittleEndian>()?,
            file_hdr_sz: reader.read_u16::<LittleEndian>()?,
            chunk_hdr_sz: reader.read_u16::<LittleEndian>()?,
            blk_sz: reader.read_u32::<LittleEndian>()?,
            total_blks: reader.read_u32::<LittleEndian>()?,
            total_chunks: reader.read_u32::<LittleEndian>()?,
            image_checksum: reader.read_u32::<LittleEndian>()?,
        })
    }

    /// Bytes of the unsparsed output, cannot overflow as both factors are u32
    pub fn output_size(&self) -> u64 {
        self.total_blks as u64 * self.blk_sz as u64
    }

    fn is_compatible(&self) -> bool {
        self.major_version == SPARSE_HEADER_MAJOR_VERSION &&
            self.file_hdr_sz == SPARSE_HEADER_SIZE &&
            self.chunk_hdr_sz == CHUNK_HEADER_SIZE
    }

    fn log(&self) {
        debug!("sparse_header:");
        debug!("\t         magic={:#010x}", self.magic);
        debug!("\t       version={}.{}", self.major_version, self.minor_version);
        debug!("\t file_hdr_size={}", self.file_hdr_sz);
        debug!("\tchunk_hdr_size={}", self.chunk_hdr_sz);
        debug!("\t        blk_sz={}", self.blk_sz);
        debug!("\t    total_blks={}", self.total_blks);
        debug!("\t  total_chunks={}", self.total_chunks);
        debug!("\timage_checksum={:#010x}", self.image_checksum);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    pub chunk_type: ChunkType,
    pub reserved: u16,
    /// In blocks of the output image
    pub chunk_size: u32,
    /// In bytes of the input, including this header
    pub total_size: u32,
}

impl ChunkHeader {
    fn read_from(reader: &mut Cursor<&[u8]>) -> Result<Self> {
        let offset = reader.position();
        let available = (reader.get_ref().len() as u64).saturating_sub(offset);
        if available < CHUNK_HEADER_SIZE as u64 {
            return Err(SparseError::Truncated {
                offset,
                needed: CHUNK_HEADER_SIZE.into(),
                available,
            }.into())
        }
        Ok(Self {
            chunk_type: reader.read_u16::<LittleEndian>()?.into(),
            reserved: reader.read_u16::<LittleEndian>()?,
            chunk_size: reader.read_u32::<LittleEndian>()?,
            total_size: reader.read_u32::<LittleEndian>()?,
        })
    }
}

/// What a successful unsparse did to the device
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SparseSummary {
    pub out_length: u64,
    pub raw_chunks: u32,
    pub dont_care_chunks: u32,
    /// Device sector right after the last chunk
    pub end_sector: u64,
}

pub fn is_sparse(buffer: &[u8]) -> bool {
    buffer.len() >= 4 &&
        buffer[0..4] == SPARSE_HEADER_MAGIC.to_le_bytes()
}

/// Unsparse `buffer` onto `device`, starting at device sector `start_sector`.
///
/// The whole header is validated before the first write, but every chunk is
/// only checked when it is reached, so a bad chunk late in the image leaves
/// the earlier chunks already written.
pub fn decode_and_write<D: BlockDevice>(
    buffer: &[u8], device: &mut D, start_sector: u64
)
    -> Result<SparseSummary>
{
    decode_and_write_with_progress(buffer, device, start_sector, None)
}

pub fn decode_and_write_with_progress<D: BlockDevice>(
    buffer: &[u8], device: &mut D, start_sector: u64,
    progress: Option<&ProgressBar>
)
    -> Result<SparseSummary>
{
    let header = SparseHeader::parse(buffer)?;
    header.log();
    if header.magic != SPARSE_HEADER_MAGIC {
        error!("Sparse magic invalid: expected {:#010x}, found {:#010x}",
            SPARSE_HEADER_MAGIC, header.magic);
        return Err(SparseError::BadMagic { magic: header.magic }.into())
    }
    let geometry = device.geometry()?;
    let section_size = match geometry.capacity() {
        Some(size) => size,
        None => {
            error!("Device geometry {:?} overflows", geometry);
            return Err(SparseError::GeometryOverflow.into())
        },
    };
    let sector_size = geometry.block_size;
    // Writes start at the given sector, so everything before it is off limits
    let limit = match start_sector.checked_mul(sector_size)
        .and_then(|start| section_size.checked_sub(start))
    {
        Some(limit) => limit,
        None => {
            error!("Start sector {} is beyond the end of the device",
                start_sector);
            return Err(SparseError::CapacityExceeded {
                needed: start_sector.saturating_mul(sector_size),
                available: section_size,
            }.into())
        },
    };
    if header.output_size() > limit {
        error!("Section size {} limit exceeded by image of {}",
            human_readable(limit), human_readable(header.output_size()));
        return Err(SparseError::CapacityExceeded {
            needed: header.output_size(), available: limit }.into())
    }
    if ! header.is_compatible() {
        error!("Incompatible sparse format: version {}.{}, header size {}, \
            chunk header size {}", header.major_version, header.minor_version,
            header.file_hdr_sz, header.chunk_hdr_sz);
        return Err(SparseError::Incompatible {
            major_version: header.major_version,
            file_hdr_sz: header.file_hdr_sz,
            chunk_hdr_sz: header.chunk_hdr_sz,
        }.into())
    }
    if sector_size == 0 || header.blk_sz as u64 % sector_size != 0 {
        error!("Sparse block size {} does not align to device sectors of {} \
            bytes", header.blk_sz, sector_size);
        return Err(SparseError::MisalignedBlockSize {
            block_size: header.blk_sz, device_block_size: sector_size }.into())
    }
    let mut reader = Cursor::new(buffer);
    reader.set_position(header.file_hdr_sz.into());
    let mut sector = start_sector;
    let mut summary = SparseSummary::default();
    for index in 0..header.total_chunks {
        let chunk = ChunkHeader::read_from(&mut reader)?;
        debug!("chunk_header {}: type={}, chunk_sz={}, total_sz={}",
            index, chunk.chunk_type, chunk.chunk_size, chunk.total_size);
        let clen = chunk.chunk_size as u64 * header.blk_sz as u64;
        match chunk.chunk_type {
            ChunkType::Raw => {
                if chunk.total_size as u64 != clen + CHUNK_HEADER_SIZE as u64 {
                    error!("Bad chunk size {} for chunk {}, type Raw",
                        chunk.total_size, index);
                    return Err(SparseError::BadChunkSize {
                        index,
                        chunk_type: chunk.chunk_type,
                        total_size: chunk.total_size,
                    }.into())
                }
                summary.out_length = accumulate(summary.out_length, clen, limit)?;
                let start = reader.position();
                let payload = match start.checked_add(clen)
                    .and_then(|end|usize::try_from(end).ok())
                    .and_then(|end|buffer.get(start as usize..end))
                {
                    Some(payload) => payload,
                    None => {
                        error!("Raw chunk {} needs {} bytes at offset {} but \
                            the image ends at {}", index, clen, start,
                            buffer.len());
                        return Err(SparseError::Truncated {
                            offset: start,
                            needed: clen,
                            available: (buffer.len() as u64)
                                .saturating_sub(start),
                        }.into())
                    },
                };
                debug!("RAW blk={} bsz={}: write(sector={}, clen={})",
                    chunk.chunk_size, header.blk_sz, sector, clen);
                device.seek(SeekFrom::Start(sector * sector_size))?;
                if let Err(e) = device.write_all(payload) {
                    error!("Block write to sector {} of {} bytes ({} blkcnt) \
                        failed: {}", sector, clen, clen / sector_size, e);
                    return Err(e.into())
                }
                sector += clen / sector_size;
                reader.set_position(start + clen);
                summary.raw_chunks += 1;
            },
            ChunkType::DontCare => {
                if chunk.total_size != CHUNK_HEADER_SIZE as u32 {
                    error!("Bogus DONT CARE chunk {} with total size {}",
                        index, chunk.total_size);
                    return Err(SparseError::BadChunkSize {
                        index,
                        chunk_type: chunk.chunk_type,
                        total_size: chunk.total_size,
                    }.into())
                }
                debug!("DONT_CARE blk={} bsz={}: skip(sector={}, clen={})",
                    chunk.chunk_size, header.blk_sz, sector, clen);
                summary.out_length = accumulate(summary.out_length, clen, limit)?;
                sector += clen / sector_size;
                summary.dont_care_chunks += 1;
            },
            ChunkType::Fill | ChunkType::Unknown(_) => {
                let chunk_type: u16 = chunk.chunk_type.into();
                error!("Unknown chunk ID {:04x} for chunk {}", chunk_type, index);
                return Err(SparseError::UnknownChunk { index, chunk_type }.into())
            },
        }
        if let Some(bar) = progress {
            bar.inc(1)
        }
    }
    device.flush()?;
    summary.end_sector = sector;
    info!("Sparse out-length {} ({} raw, {} don't care chunks)",
        human_readable(summary.out_length), summary.raw_chunks,
        summary.dont_care_chunks);
    Ok(summary)
}

fn accumulate(out_length: u64, clen: u64, limit: u64) -> Result<u64> {
    match out_length.checked_add(clen) {
        Some(out_length) if out_length <= limit => Ok(out_length),
        _ => {
            error!("Section size {} limit exceeded", human_readable(limit));
            Err(SparseError::CapacityExceeded {
                needed: out_length.saturating_add(clen),
                available: limit,
            }.into())
        }
    }
}
