//! Brings up a simulated SD card over SPI, gives it a partition table, then
//! writes a message into the first sector of the volume and reads it back.
//!
//! ```bash
//! RUST_LOG=debug cargo run --example sdc_demo
//! ```

use embedded_sdc_spi::{
    diskio::{DiskIo, DiskStatus, IoctlCommand, IoctlReply},
    mbr::{Mbr, Partition, PartitionNumber, PartitionType},
    sim::{SimOptions, SimulatedCard},
    Block, BlockCount, BlockDevice, BlockIdx, SdcDisk, SdcPlatform, SpiConfig,
};

const MESSAGE: &[u8] = b"SD Card I/O Example via SPI!\r\n";

/// Where the volume starts on a freshly provisioned card.
const VOLUME_START: u32 = 2048;

fn main() {
    env_logger::init();

    let mut memory = vec![0u8; 8 * 1024 * 1024];
    let card = SimulatedCard::new(&mut memory, SimOptions::default());
    let platform = match SdcPlatform::open(card, SpiConfig::sd_card()) {
        Ok(platform) => platform,
        Err((e, _card)) => {
            println!("Failed to open the SPI platform: {:?}", e);
            return;
        }
    };
    let mut disk = SdcDisk::new(platform);

    let status = disk.initialize();
    if status != DiskStatus::empty() {
        println!("Failed to initialize the card: {:?}", status);
        return;
    }

    let sector_count = match disk.ioctl(IoctlCommand::GetSectorCount) {
        Ok(IoctlReply::SectorCount(n)) => n,
        other => {
            println!("Can't get the sector count: {:?}", other);
            return;
        }
    };

    let existing = Mbr::read_partition(&mut disk.as_block_device(), PartitionNumber::One);
    let partition = match existing {
        Ok(partition) if partition.ty != PartitionType::Empty => partition,
        _ => {
            log::info!("No partition table, provisioning one");
            let partition = Partition {
                ty: PartitionType::Fat32Lba,
                lba_start: BlockCount(VOLUME_START),
                block_count: BlockCount(sector_count - VOLUME_START),
            };
            let mut blocks = disk.as_block_device();
            if let Err(e) = Mbr::write_partition(&mut blocks, PartitionNumber::One, &partition) {
                println!("Failed to write the partition table: {:?}", e);
                return;
            }
            partition
        }
    };

    let card_type = disk.ioctl(IoctlCommand::GetCardType);
    println!("-------------- Volume status --------------");
    println!("Card type = {:?}", card_type);
    println!("Partition type = {:?}", partition.ty);
    println!("Volume start (lba) = {}", partition.lba_start.0);
    println!("Volume size (sectors) = {}", partition.block_count.0);
    println!(
        "{} KiB total disk space.",
        u64::from(sector_count) * Block::LEN as u64 / 1024
    );
    println!();

    println!("-------- Write a message and read it again ---------");
    let mut block = Block::new();
    block.contents[..MESSAGE.len()].copy_from_slice(MESSAGE);
    let mut blocks = disk.as_block_device();
    if let Err(e) = partition
        .with_block_device(&mut blocks)
        .write(&[block], BlockIdx(0))
    {
        println!("Failed to write the message: {:?}", e);
        return;
    }
    println!(
        "Write a message to SD card success! Bytes written = {}",
        MESSAGE.len()
    );

    let mut sector = [0u8; Block::LEN];
    if let Err(e) = disk.read(&mut sector, partition.lba_start.0, 1) {
        println!("Failed to read the message: {:?}", e);
        return;
    }
    let len = sector.iter().position(|&b| b == 0).unwrap_or(sector.len());
    println!("Read a message from SD card success! Bytes read = {}", len);
    println!("Content: {}", String::from_utf8_lossy(&sector[..len]));

    let _ = disk.ioctl(IoctlCommand::PowerOff);
}
