/*
amflash, to unsparse images and resize partitions on Aml devices: update module
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

use std::{fmt::Display, fs::OpenOptions, path::Path};

use indicatif::ProgressBar;
use log::{error, info};

use crate::{config::Config, mbr, probe, ptable::PartitionTable,
    sparse::{self, SparseSummary}, Error, Result};

#[derive(Debug)]
pub enum UpdateError {
    NotSparse,
    PartitionNotFound {
        name: String,
    },
}

impl From<UpdateError> for Error {
    fn from(value: UpdateError) -> Self {
        Error::UpdateError(value)
    }
}

impl Display for UpdateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateError::NotSparse => write!(f, "image is not in sparse format"),
            UpdateError::PartitionNotFound { name } =>
                write!(f, "{} partition does not exist", name),
        }
    }
}

/// The data partition after a resize, in the vendor table's units
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resized {
    pub index: usize,
    pub size: u64,
    pub offset: u64,
}

/// Unsparse `image` onto the existing node `target`
pub fn unsparse<P: AsRef<Path>>(
    image: &[u8], target: P, start_sector: u64, progress: Option<&ProgressBar>
)
    -> Result<SparseSummary>
{
    let target = target.as_ref();
    if ! sparse::is_sparse(image) {
        error!("'{}' payload is not in sparse format", target.display());
        return Err(UpdateError::NotSparse.into())
    }
    info!("{} is in sparse format", target.display());
    let mut device = match OpenOptions::new().write(true).open(target) {
        Ok(device) => device,
        Err(e) => {
            error!("Failed to open '{}' for writing: {}", target.display(), e);
            return Err(e.into())
        },
    };
    sparse::decode_and_write_with_progress(
        image, &mut device, start_sector, progress)
}

/// Entry point for the update script: true only if `image` was sparse and
/// got fully written to `target`
pub fn extract_sparse_to_file<P: AsRef<Path>>(image: &[u8], target: P) -> bool {
    let target = target.as_ref();
    if ! sparse::is_sparse(image) {
        return false
    }
    match unsparse(image, target, 0, None) {
        Ok(_) => {
            info!("Writing sparsed '{}' DONE!", target.display());
            true
        },
        Err(e) => {
            error!("Writing sparsed '{}' FAILED: {}", target.display(), e);
            false
        },
    }
}

/// Grow the configured partition over the rest of the device, in the vendor
/// table first and then in the MBR.
///
/// Nothing is rolled back: if the MBR write fails the vendor table has
/// already been updated.
pub fn resize_data_partition(config: &Config) -> Result<Resized> {
    let mut table = PartitionTable::load(&config.mpt_node)?;
    let index = match table.find(&config.partition) {
        Some(index) => index,
        None => {
            error!("{} partition does not exist", config.partition);
            return Err(UpdateError::PartitionNotFound {
                name: config.partition.clone() }.into())
        },
    };
    let capacity = probe::device_capacity(
        &config.block_root, &config.owner_marker, config.capacity_unit)?;
    let (size, offset) = table.resize(index, capacity)?;
    // Everything the MBR could refuse is refused before the MPT is touched
    let entry = mbr::data_entry(size, offset)?;
    table.persist_entry(&config.mpt_node, index)?;
    mbr::write_data_entry(&config.mbr_node, &entry, config.truncate_mbr)?;
    Ok(Resized { index, size, offset })
}

/// Entry point for the update script, see [`resize_data_partition`]
pub fn fdisk(config: &Config) -> bool {
    match resize_data_partition(config) {
        Ok(resized) => {
            info!("Resized {} partition to 0x{:x} bytes at 0x{:x}",
                config.partition, resized.size, resized.offset);
            true
        },
        Err(e) => {
            error!("Failed to resize {} partition: {}", config.partition, e);
            false
        },
    }
}
