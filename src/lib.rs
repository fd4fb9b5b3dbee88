/*
amflash, to unsparse images and resize partitions on Aml devices
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

pub mod blockdev;
pub mod config;
mod error;
pub mod mbr;
mod pretty;
pub mod probe;
pub mod progress;
pub mod ptable;
pub mod sparse;
pub mod update;

pub use error::{Error, Result};
pub use update::{extract_sparse_to_file, fdisk};
