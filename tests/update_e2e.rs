use std::fs::{create_dir_all, read, write};
use std::path::Path;

use amflash::config::Config;
use amflash::mbr::{DosPartitionEntry, MbrError, PART_TYPE_LINUX_NATIVE_FS};
use amflash::ptable::{PartitionEntry, PartitionTable, TableError};
use amflash::update::{resize_data_partition, UpdateError};
use amflash::{extract_sparse_to_file, fdisk, Error};
use tempfile::TempDir;

const MBR_FILL: u8 = 0xee;

struct Device {
    _dir: TempDir,
    config: Config,
}

fn device_with(entries: Vec<PartitionEntry>, capacity: &str) -> Device {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    let table = PartitionTable::new(entries).unwrap();
    write(root.join("ptable"), table.to_bytes()).unwrap();
    write(root.join("@MBR"), [MBR_FILL; 512]).unwrap();
    create_dir_all(root.join("block/mmcblk0")).unwrap();
    write(root.join("block/mmcblk0/odm"), "").unwrap();
    write(root.join("block/mmcblk0/size"), capacity).unwrap();
    let config = Config {
        mpt_node: root.join("ptable"),
        mbr_node: root.join("@MBR"),
        block_root: root.join("block"),
        ..Config::default()
    };
    Device { _dir: dir, config }
}

fn standard_device() -> Device {
    device_with(vec![
        PartitionEntry::new("boot", 10, 0, 1),
        PartitionEntry::new("data", 100, 50, 4),
        PartitionEntry::new("cache", 20, 30, 2),
    ], "1000\n")
}

fn mbr_slot(node: &Path) -> DosPartitionEntry {
    let data = read(node).unwrap();
    DosPartitionEntry::parse(&data[0x1ce..0x1de].try_into().unwrap())
}

#[test]
fn fdisk_grows_data_in_both_tables() {
    let device = standard_device();
    assert!(fdisk(&device.config));
    let table = PartitionTable::load(&device.config.mpt_node).unwrap();
    let data = table.entry(1).unwrap();
    assert_eq!((data.size, data.offset), (950, 50));
    assert_eq!(table.entry(0).unwrap().size, 10);
    assert_eq!(table.entry(2).unwrap().size, 20);
    let entry = mbr_slot(&device.config.mbr_node);
    assert_eq!(entry.sys_ind, PART_TYPE_LINUX_NATIVE_FS);
    assert_eq!((entry.start, entry.size), (50, 950));
}

#[test]
fn resize_reports_new_geometry() {
    let device = standard_device();
    let resized = resize_data_partition(&device.config).unwrap();
    assert_eq!((resized.index, resized.size, resized.offset), (1, 950, 50));
}

#[test]
fn bad_magic_aborts_before_any_write() {
    let device = standard_device();
    let mut table = read(&device.config.mpt_node).unwrap();
    table[0] = b'X';
    write(&device.config.mpt_node, &table).unwrap();
    assert!(matches!(resize_data_partition(&device.config),
        Err(Error::TableError(TableError::InvalidMagic { .. }))));
    assert!(! fdisk(&device.config));
    assert_eq!(read(&device.config.mpt_node).unwrap(), table);
    assert_eq!(read(&device.config.mbr_node).unwrap(), vec![MBR_FILL; 512]);
}

#[test]
fn missing_partition_aborts_before_any_write() {
    let device = device_with(vec![
        PartitionEntry::new("boot", 10, 0, 1),
    ], "1000");
    let table = read(&device.config.mpt_node).unwrap();
    assert!(matches!(resize_data_partition(&device.config),
        Err(Error::UpdateError(UpdateError::PartitionNotFound { .. }))));
    assert_eq!(read(&device.config.mpt_node).unwrap(), table);
    assert_eq!(read(&device.config.mbr_node).unwrap(), vec![MBR_FILL; 512]);
}

#[test]
fn offset_beyond_capacity_aborts_before_any_write() {
    let device = device_with(vec![
        PartitionEntry::new("data", 100, 1200, 0),
    ], "1000");
    let table = read(&device.config.mpt_node).unwrap();
    assert!(matches!(resize_data_partition(&device.config),
        Err(Error::TableError(TableError::NegativeSize { .. }))));
    assert_eq!(read(&device.config.mpt_node).unwrap(), table);
    assert_eq!(read(&device.config.mbr_node).unwrap(), vec![MBR_FILL; 512]);
}

#[test]
fn size_over_mbr_field_leaves_both_tables_untouched() {
    // A 16 GB card in 512-byte sectors
    let mut device = standard_device();
    write(device.config.block_root.join("mmcblk0/size"), "31116288\n").unwrap();
    device.config.capacity_unit = 512;
    let table = read(&device.config.mpt_node).unwrap();
    assert!(matches!(resize_data_partition(&device.config),
        Err(Error::MbrError(MbrError::FieldOverflow { field: "size", .. }))));
    assert!(! fdisk(&device.config));
    assert_eq!(read(&device.config.mpt_node).unwrap(), table);
    assert_eq!(read(&device.config.mbr_node).unwrap(), vec![MBR_FILL; 512]);
}

#[test]
fn configured_partition_name_is_used() {
    let mut device = device_with(vec![
        PartitionEntry::new("userdata", 100, 50, 0),
    ], "1000");
    assert!(! fdisk(&device.config));
    device.config.partition = "userdata".into();
    assert!(fdisk(&device.config));
}

fn sparse_image() -> Vec<u8> {
    let mut image = 0xed26ff3au32.to_le_bytes().to_vec();
    for value in [1u16, 0, 28, 12] {
        image.extend(value.to_le_bytes())
    }
    // block size, total blocks, total chunks, checksum
    for value in [4096u32, 3, 2, 0] {
        image.extend(value.to_le_bytes())
    }
    image.extend(0xcac3u16.to_le_bytes());
    image.extend(0u16.to_le_bytes());
    image.extend(1u32.to_le_bytes());
    image.extend(12u32.to_le_bytes());
    image.extend(0xcac1u16.to_le_bytes());
    image.extend(0u16.to_le_bytes());
    image.extend(2u32.to_le_bytes());
    image.extend((12u32 + 2 * 4096).to_le_bytes());
    image.extend(vec![0x42u8; 2 * 4096]);
    image
}

#[test]
fn extracts_sparse_image_onto_target() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("system");
    write(&target, vec![0xaau8; 4 * 4096]).unwrap();
    assert!(extract_sparse_to_file(&sparse_image(), &target));
    let data = read(&target).unwrap();
    assert_eq!(data.len(), 4 * 4096);
    assert!(data[..4096].iter().all(|b| *b == 0xaa));
    assert!(data[4096..3 * 4096].iter().all(|b| *b == 0x42));
    assert!(data[3 * 4096..].iter().all(|b| *b == 0xaa));
}

#[test]
fn non_sparse_payload_is_left_alone() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("system");
    write(&target, vec![0xaau8; 4096]).unwrap();
    assert!(! extract_sparse_to_file(&[0u8; 64], &target));
    assert_eq!(read(&target).unwrap(), vec![0xaau8; 4096]);
}

#[test]
fn missing_target_is_not_created() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("system");
    assert!(! extract_sparse_to_file(&sparse_image(), &target));
    assert!(! target.exists());
}

#[test]
fn target_too_small_is_rejected_untouched() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("system");
    write(&target, vec![0xaau8; 2 * 4096]).unwrap();
    assert!(! extract_sparse_to_file(&sparse_image(), &target));
    assert_eq!(read(&target).unwrap(), vec![0xaau8; 2 * 4096]);
}
