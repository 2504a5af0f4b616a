//! embedded-sdc-spi - Master Boot Record
//!
//! Reads and writes the four primary partition entries in block 0, and
//! offers a [`BlockDevice`] view of a single partition.

use crate::{Block, BlockCount, BlockDevice, BlockIdx};
use core::fmt::Debug;

#[derive(Debug, PartialEq)]
pub enum Error<BlockDeviceError>
where
    BlockDeviceError: Debug,
{
    DeviceError(BlockDeviceError),
    InvalidMbrSignature,
    InvalidPartitionStatus,
    InfoTooShort,
}

impl<BDE> From<BDE> for Error<BDE>
where
    BDE: Debug,
{
    fn from(e: BDE) -> Self {
        Self::DeviceError(e)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PartitionNumber {
    One,
    Two,
    Three,
    Four,
}

impl PartitionNumber {
    pub fn from_number(number: usize) -> Option<Self> {
        let partition = match number {
            1 => Self::One,
            2 => Self::Two,
            3 => Self::Three,
            4 => Self::Four,
            _ => return None,
        };
        Some(partition)
    }

    /// Offset of this partition's entry within the MBR.
    fn entry_offset(self) -> usize {
        let index = match self {
            Self::One => 0,
            Self::Two => 1,
            Self::Three => 2,
            Self::Four => 3,
        };
        Mbr::PARTITION1_START + index * PartitionEntry::LEN
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PartitionType {
    Empty,
    Fat32ChsLba,
    Fat32Lba,
    Fat16Lba,
    Fat16,
    Unknown(u8),
}

impl PartitionType {
    const EMPTY: u8 = 0x00;
    /// Marker for a FAT32 partition. What Macosx disk utility (and also SD-Card formatter?)
    /// use.
    const FAT32_CHS_LBA: u8 = 0x0B;
    /// Marker for a FAT32 partition. Sometimes also use for FAT16 formatted
    /// partitions.
    const FAT32_LBA: u8 = 0x0C;
    /// Marker for a FAT16 partition with LBA. Seen on a Raspberry Pi SD card.
    const FAT16_LBA: u8 = 0x0E;
    /// Marker for a FAT16 partition. Seen on a card formatted with the official
    /// SD-Card formatter.
    const FAT16: u8 = 0x06;

    pub fn from_u8(value: u8) -> Self {
        match value {
            Self::EMPTY => Self::Empty,
            Self::FAT32_CHS_LBA => Self::Fat32ChsLba,
            Self::FAT32_LBA => Self::Fat32Lba,
            Self::FAT16_LBA => Self::Fat16Lba,
            Self::FAT16 => Self::Fat16,
            _ => Self::Unknown(value),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::Empty => Self::EMPTY,
            Self::Fat32ChsLba => Self::FAT32_CHS_LBA,
            Self::Fat32Lba => Self::FAT32_LBA,
            Self::Fat16Lba => Self::FAT16_LBA,
            Self::Fat16 => Self::FAT16,
            Self::Unknown(value) => value,
        }
    }
}

/// A raw 16-byte partition table entry.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    pub data: [u8; 16],
}

impl PartitionEntry {
    pub const LEN: usize = 16;

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    define_field!(status, set_status, u8, 0);
    define_field!(system_id, set_system_id, u8, 4);
    define_field!(lba_start, set_lba_start, u32, 8);
    define_field!(num_blocks, set_num_blocks, u32, 12);
}

#[derive(Debug, PartialEq)]
pub enum PartitionError<E>
where
    E: Debug,
{
    DeviceError(E),
    OutOfRange { partition_block_count: BlockCount },
}

/// One partition of a block device, addressed from its own block 0.
pub struct PartitionBlockDevice<'bd, 'part, BD>
where
    BD: BlockDevice,
{
    block_device: &'bd mut BD,
    partition: &'part Partition,
}

impl<'bd, 'part, BD> PartitionBlockDevice<'bd, 'part, BD>
where
    BD: BlockDevice,
{
    /// Where `len` blocks from partition block `start` live on the device.
    fn translate<E>(&self, start: BlockIdx, len: u32) -> Result<BlockIdx, PartitionError<E>>
    where
        E: Debug,
    {
        let out_of_range = PartitionError::OutOfRange {
            partition_block_count: self.partition.block_count,
        };
        match start.0.checked_add(len) {
            Some(end) if end <= self.partition.block_count.0 => {}
            _ => return Err(out_of_range),
        }
        // `lba_start` comes off the card, so the sum can still wrap
        match self.partition.lba_start.0.checked_add(start.0) {
            Some(first) if first.checked_add(len).is_some() => Ok(BlockIdx(first)),
            _ => Err(out_of_range),
        }
    }
}

impl<'bd, 'part, BD> BlockDevice for PartitionBlockDevice<'bd, 'part, BD>
where
    BD: BlockDevice,
{
    type Error = PartitionError<BD::Error>;

    fn read(
        &mut self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
        reason: &str,
    ) -> Result<(), Self::Error> {
        let part_start_block_idx = self.translate(start_block_idx, blocks.len() as u32)?;

        self.block_device
            .read(blocks, part_start_block_idx, reason)
            .map_err(PartitionError::DeviceError)
    }

    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        let part_start_block_idx = self.translate(start_block_idx, blocks.len() as u32)?;

        self.block_device
            .write(blocks, part_start_block_idx)
            .map_err(PartitionError::DeviceError)
    }

    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        Ok(self.partition.block_count)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Partition {
    pub ty: PartitionType,
    pub lba_start: BlockCount,
    pub block_count: BlockCount,
}

impl Partition {
    pub fn from_info<E>(info: &[u8]) -> Result<Self, Error<E>>
    where
        E: Debug,
    {
        if info.len() != PartitionEntry::LEN {
            return Err(Error::InfoTooShort);
        }
        let mut entry = PartitionEntry::default();
        entry.data.copy_from_slice(info);
        Self::from_entry(&entry)
    }

    pub fn from_entry<E>(entry: &PartitionEntry) -> Result<Self, Error<E>>
    where
        E: Debug,
    {
        let pstatus = entry.status();
        if pstatus != 0x80 && pstatus != 0x00 {
            return Err(Error::InvalidPartitionStatus);
        }

        Ok(Partition {
            ty: PartitionType::from_u8(entry.system_id()),
            lba_start: BlockCount(entry.lba_start()),
            block_count: BlockCount(entry.num_blocks()),
        })
    }

    /// The table entry for this partition. CHS fields are left zero; only
    /// the LBA fields are meaningful.
    pub fn to_entry(&self) -> PartitionEntry {
        let mut entry = PartitionEntry::default();
        entry.set_status(0x00);
        entry.set_system_id(self.ty.to_u8());
        entry.set_lba_start(self.lba_start.0);
        entry.set_num_blocks(self.block_count.0);
        entry
    }

    pub fn with_block_device<'bd, 'part, BD>(
        &'part self,
        block_device: &'bd mut BD,
    ) -> PartitionBlockDevice<'bd, 'part, BD>
    where
        BD: BlockDevice,
    {
        PartitionBlockDevice {
            block_device,
            partition: self,
        }
    }
}

pub struct Mbr;

impl Mbr {
    const FOOTER_START: usize = 510;
    const FOOTER_VALUE: u16 = 0xAA55;
    const PARTITION1_START: usize = 446;

    fn has_signature(block: &Block) -> bool {
        let footer = u16::from_le_bytes([
            block[Self::FOOTER_START],
            block[Self::FOOTER_START + 1],
        ]);
        footer == Self::FOOTER_VALUE
    }

    pub fn read_partition<BlockDev>(
        block_dev: &mut BlockDev,
        partition_num: PartitionNumber,
    ) -> Result<Partition, Error<BlockDev::Error>>
    where
        BlockDev: BlockDevice,
    {
        let first_block = block_dev.read_block(BlockIdx(0))?;

        if !Self::has_signature(&first_block) {
            return Err(Error::InvalidMbrSignature);
        }

        let pinfo_start = partition_num.entry_offset();
        let pinfo_data = &first_block[pinfo_start..pinfo_start + PartitionEntry::LEN];
        Partition::from_info(pinfo_data)
    }

    /// Store `partition` in the table. A block 0 without a valid signature
    /// is replaced by an empty table first.
    pub fn write_partition<BlockDev>(
        block_dev: &mut BlockDev,
        partition_num: PartitionNumber,
        partition: &Partition,
    ) -> Result<(), Error<BlockDev::Error>>
    where
        BlockDev: BlockDevice,
    {
        let mut first_block = block_dev.read_block(BlockIdx(0))?;
        if !Self::has_signature(&first_block) {
            first_block = Block::new();
            first_block[Self::FOOTER_START..Self::FOOTER_START + 2]
                .copy_from_slice(&Self::FOOTER_VALUE.to_le_bytes());
        }

        let pinfo_start = partition_num.entry_offset();
        first_block[pinfo_start..pinfo_start + PartitionEntry::LEN]
            .copy_from_slice(&partition.to_entry().data);
        block_dev.write(&[first_block], BlockIdx(0))?;
        Ok(())
    }
}
