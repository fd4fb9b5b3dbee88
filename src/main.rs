use std::{fs::read, path::{Path, PathBuf}};

use clap::Parser;

use amflash::{config::Config, progress, ptable::PartitionTable,
    sparse::SparseHeader, update, Result};

#[derive(clap::Subcommand, Debug, Clone)]
enum Action {
    /// Write a sparse image onto an existing block device
    Unsparse {
        /// Path of the sparse image
        image: PathBuf,
        /// Path of the block device (or image file) to write into
        target: PathBuf,
        #[arg(short = 's', long, default_value_t = 0)]
        /// Device sector to start writing at
        start_sector: u64,
    },
    /// Grow the data partition over the rest of the device, in the vendor
    /// partition table and then in the MBR
    Fdisk,
    /// Print the vendor partition table
    Show,
}

#[derive(Parser, Debug)]
#[command(version)]
struct Arg {
    #[command(subcommand)]
    action: Action,

    #[arg(short = 'c', long, global = true)]
    /// YAML config, fields not set keep the on-device defaults
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    /// Override the node of the vendor partition table
    mpt: Option<PathBuf>,

    #[arg(long, global = true)]
    /// Override the node of the MBR
    mbr: Option<PathBuf>,

    #[arg(long, global = true)]
    /// Override the root scanned for the owning block device
    block_root: Option<PathBuf>,

    #[arg(short = 'p', long, global = true)]
    /// Override the partition to grow
    partition: Option<String>,
}

impl Arg {
    fn config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::try_read(path)?,
            None => Config::default(),
        };
        if let Some(mpt) = &self.mpt {
            config.mpt_node = mpt.clone()
        }
        if let Some(mbr) = &self.mbr {
            config.mbr_node = mbr.clone()
        }
        if let Some(block_root) = &self.block_root {
            config.block_root = block_root.clone()
        }
        if let Some(partition) = &self.partition {
            config.partition = partition.clone()
        }
        Ok(config)
    }
}

fn unsparse(image: &Path, target: &Path, start_sector: u64) -> Result<()> {
    let data = read(image)?;
    let header = SparseHeader::parse(&data)?;
    let bar = progress::progress_bar_for_chunks(header.total_chunks)?;
    bar.set_message(target.display().to_string());
    let result = update::unsparse(&data, target, start_sector, Some(&bar));
    bar.finish_and_clear();
    let summary = result?;
    println!("Wrote '{}' to '{}': {} bytes out, {} raw and {} don't care chunks",
        image.display(), target.display(), summary.out_length,
        summary.raw_chunks, summary.dont_care_chunks);
    Ok(())
}

fn fdisk(config: &Config) -> Result<()> {
    let resized = update::resize_data_partition(config)?;
    println!("Partition {} (#{}) now spans 0x{:x} bytes from 0x{:x}",
        config.partition, resized.index, resized.size, resized.offset);
    Ok(())
}

fn show(config: &Config) -> Result<()> {
    PartitionTable::load(&config.mpt_node)?.print_table_stdout()
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let arg = Arg::parse();
    let config = arg.config()?;
    match arg.action {
        Action::Unsparse { image, target, start_sector } =>
            unsparse(&image, &target, start_sector),
        Action::Fdisk => fdisk(&config),
        Action::Show => show(&config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_follow_the_subcommand() {
        let arg = Arg::try_parse_from(["amflash", "fdisk", "--mpt", "/tmp/ptable",
            "--mbr", "/tmp/mbr", "--block-root", "/tmp/block", "-p", "userdata"])
            .unwrap();
        let config = arg.config().unwrap();
        assert_eq!(config.mpt_node, PathBuf::from("/tmp/ptable"));
        assert_eq!(config.mbr_node, PathBuf::from("/tmp/mbr"));
        assert_eq!(config.block_root, PathBuf::from("/tmp/block"));
        assert_eq!(config.partition, "userdata");
    }

    #[test]
    fn overrides_before_the_subcommand() {
        let arg = Arg::try_parse_from(["amflash", "--mpt", "/tmp/ptable", "show"])
            .unwrap();
        assert!(matches!(arg.action, Action::Show));
        assert_eq!(arg.config().unwrap().mpt_node, PathBuf::from("/tmp/ptable"));
    }
}
