/*
amflash, to unsparse images and resize partitions on Aml devices: config module
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

use std::{fs::File, path::{Path, PathBuf}};

use serde::{Deserialize, Serialize};

use crate::Result;

/// Where the device nodes live and how the resize behaves, defaults are the
/// paths on the devices themselves
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node exposing the reserved partition table
    pub mpt_node: PathBuf,
    /// Node exposing the first sector of the whole device
    pub mbr_node: PathBuf,
    /// Root to scan for the owning block device
    pub block_root: PathBuf,
    /// Attribute that marks the owning block device under `block_root`
    pub owner_marker: String,
    /// Partition to grow over the rest of the device
    pub partition: String,
    /// Multiplier applied to the probed `size` attribute
    pub capacity_unit: u64,
    /// Open the MBR node truncating, as the updater always did
    pub truncate_mbr: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mpt_node: "/dev/block/ptable".into(),
            mbr_node: "/dev/block/@MBR".into(),
            block_root: "/sys/block".into(),
            owner_marker: "odm".into(),
            partition: "data".into(),
            capacity_unit: 1,
            truncate_mbr: true,
        }
    }
}

impl Config {
    pub fn try_read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) => {
                log::error!("Failed to open config '{}': {}", path.display(), e);
                return Err(e.into())
            },
        };
        Ok(serde_yaml::from_reader(file)?)
    }
}
