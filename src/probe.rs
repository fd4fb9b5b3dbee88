/*
amflash, to unsparse images and resize partitions on Aml devices: probe module
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

use std::{fmt::Display, fs::{read_dir, read_to_string}, path::{Path, PathBuf}};

use log::{debug, error, info};

use crate::{Error, Result};

#[derive(Debug)]
pub enum ProbeError {
    Scan {
        root: PathBuf,
        error: std::io::Error,
    },
    NoDevice {
        root: PathBuf,
        marker: String,
    },
    SizeUnreadable {
        path: PathBuf,
    },
    Overflow {
        size: u64,
        unit: u64,
    },
}

impl From<ProbeError> for Error {
    fn from(value: ProbeError) -> Self {
        Error::ProbeError(value)
    }
}

impl Display for ProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeError::Scan { root, error } =>
                write!(f, "failed to scan '{}': {}", root.display(), error),
            ProbeError::NoDevice { root, marker } =>
                write!(f, "no device under '{}' has a '{}' marker",
                    root.display(), marker),
            ProbeError::SizeUnreadable { path } =>
                write!(f, "could not read a size from '{}'", path.display()),
            ProbeError::Overflow { size, unit } =>
                write!(f, "size {} in units of {} overflows", size, unit),
        }
    }
}

/// Size of the first block device under `root` (in name order) that carries
/// a `marker` attribute, as its `size` attribute times `unit`.
///
/// sysfs reports `size` in 512-byte sectors. The updater has always used the
/// number as-is, so `unit` is 1 unless configured otherwise.
pub fn device_capacity(root: &Path, marker: &str, unit: u64) -> Result<u64> {
    let dir = match read_dir(root) {
        Ok(dir) => dir,
        Err(e) => {
            error!("Failed to open '{}' to look for the device: {}",
                root.display(), e);
            return Err(ProbeError::Scan { root: root.into(), error: e }.into())
        },
    };
    let mut entries = Vec::new();
    for entry in dir {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => return Err(ProbeError::Scan {
                root: root.into(), error: e }.into()),
        };
        let file_type = match entry.file_type() {
            Ok(file_type) => file_type,
            Err(e) => return Err(ProbeError::Scan {
                root: root.into(), error: e }.into()),
        };
        if file_type.is_dir() || file_type.is_symlink() {
            entries.push(entry.path())
        } else {
            debug!("Not a directory: {}", entry.path().display())
        }
    }
    entries.sort();
    let device = match entries.into_iter().find(
        |path| path.join(marker).exists())
    {
        Some(device) => device,
        None => {
            error!("No block device under '{}' has the '{}' marker",
                root.display(), marker);
            return Err(ProbeError::NoDevice {
                root: root.into(), marker: marker.into() }.into())
        },
    };
    let path = device.join("size");
    let size = match read_to_string(&path).ok()
        .and_then(|content|content.trim().parse::<u64>().ok())
    {
        Some(size) => size,
        None => {
            error!("Failed to read size of '{}'", device.display());
            return Err(ProbeError::SizeUnreadable { path }.into())
        },
    };
    match size.checked_mul(unit) {
        Some(capacity) => {
            info!("Device '{}' reports size {} (x{})",
                device.display(), size, unit);
            Ok(capacity)
        },
        None => Err(ProbeError::Overflow { size, unit }.into()),
    }
}

#[cfg(test)]
mod tests {
    use std::fs::{create_dir, write};

    use tempfile::TempDir;

    use super::*;

    fn block_root() -> TempDir {
        let root = TempDir::new().unwrap();
        create_dir(root.path().join("loop0")).unwrap();
        write(root.path().join("loop0/size"), "64\n").unwrap();
        create_dir(root.path().join("mmcblk1")).unwrap();
        write(root.path().join("mmcblk1/size"), "2048\n").unwrap();
        write(root.path().join("mmcblk1/odm"), "").unwrap();
        // A stray file must be skipped, not treated as a device
        write(root.path().join("odm"), "").unwrap();
        root
    }

    #[test]
    fn picks_marked_device() {
        let root = block_root();
        assert_eq!(device_capacity(root.path(), "odm", 1).unwrap(), 2048);
    }

    #[test]
    fn first_marked_device_by_name_wins() {
        let root = block_root();
        create_dir(root.path().join("mmcblk0")).unwrap();
        write(root.path().join("mmcblk0/size"), "1000").unwrap();
        write(root.path().join("mmcblk0/odm"), "").unwrap();
        assert_eq!(device_capacity(root.path(), "odm", 1).unwrap(), 1000);
    }

    #[test]
    fn unit_scales_size() {
        let root = block_root();
        assert_eq!(device_capacity(root.path(), "odm", 512).unwrap(), 2048 * 512);
        assert!(matches!(device_capacity(root.path(), "odm", u64::MAX),
            Err(Error::ProbeError(ProbeError::Overflow { .. }))));
    }

    #[test]
    fn missing_root_is_scan_failure() {
        let root = block_root();
        assert!(matches!(
            device_capacity(&root.path().join("nope"), "odm", 1),
            Err(Error::ProbeError(ProbeError::Scan { .. }))));
    }

    #[test]
    fn no_marked_device() {
        let root = block_root();
        assert!(matches!(device_capacity(root.path(), "owner", 1),
            Err(Error::ProbeError(ProbeError::NoDevice { .. }))));
    }

    #[test]
    fn unreadable_size_is_distinct() {
        let root = block_root();
        write(root.path().join("mmcblk1/size"), "garbage").unwrap();
        assert!(matches!(device_capacity(root.path(), "odm", 1),
            Err(Error::ProbeError(ProbeError::SizeUnreadable { .. }))));
    }
}
