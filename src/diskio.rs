//! embedded-sdc-spi - FatFs-style disk I/O
//!
//! A FAT filesystem driver sees the card only through five calls:
//! initialize, status, read, write and ioctl. [`SdcDisk`] answers them by
//! driving an [`SdCard`] and translating its errors into [`DiskError`].

use crate::platform::{SdcPlatform, SpiMaster};
use crate::sdmmc::{AcquireOpts, CardType, Error, Initialized, NotInit, SdCard};
use crate::{Block, BlockCount, BlockDevice, BlockIdx};

#[cfg(feature = "log")]
use log::{debug, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, warn};

bitflags::bitflags! {
    /// Drive status, as a FAT filesystem driver expects it.
    pub struct DiskStatus: u8 {
        /// The drive has not been initialized.
        const NOINIT = (1 << 0);
        /// There is no medium in the drive.
        const NODISK = (1 << 1);
        /// The medium is write protected.
        const PROTECT = (1 << 2);
    }
}

/// Why a disk operation failed.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DiskError {
    /// A hard error occurred while talking to the card
    ReadWrite,
    /// The medium is write protected
    WriteProtected,
    /// The drive has not been initialized, or has gone away
    NotReady,
    /// The request itself is invalid
    Parameter,
}

impl DiskError {
    /// Map a card error onto the disk contract.
    pub fn from_card(err: &Error) -> DiskError {
        use crate::platform::PlatformError;
        match err {
            Error::Platform(PlatformError::InvalidParameter)
            | Error::Platform(PlatformError::NullPointer) => DiskError::NotReady,
            Error::Platform(PlatformError::Bus) | Error::Platform(PlatformError::Transmit) => {
                DiskError::ReadWrite
            }
            Error::CardNotFound
            | Error::CantEnableCRC
            | Error::Cmd58Error
            | Error::TimeoutACommand(_) => DiskError::NotReady,
            Error::InvalidBuffer => DiskError::Parameter,
            Error::TimeoutReadBuffer
            | Error::TimeoutWaitNotBusy
            | Error::TimeoutCommand(_)
            | Error::RegisterReadError
            | Error::CrcError(_, _)
            | Error::ReadError
            | Error::WriteError
            | Error::EraseError => DiskError::ReadWrite,
        }
    }
}

impl From<Error> for DiskError {
    fn from(err: Error) -> DiskError {
        DiskError::from_card(&err)
    }
}

/// Control requests.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IoctlCommand {
    /// Finish any pending write.
    Sync,
    /// Number of sectors on the card.
    GetSectorCount,
    /// Sector size in bytes. Always 512.
    GetSectorSize,
    /// Erase block size, in sectors.
    GetBlockSize,
    /// The sectors `start ..= end` are no longer in use and may be erased.
    Trim { start: u32, end: u32 },
    GetCardType,
    /// The raw CSD register.
    GetCsd,
    /// Bus clock, in Hz.
    GetBitRate,
    /// Re-clock the bus, in Hz.
    SetBitRate(u32),
    /// Release the card. It must be initialized again before use.
    PowerOff,
}

/// What an [`IoctlCommand`] hands back.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IoctlReply {
    Done,
    SectorCount(u32),
    SectorSize(u16),
    BlockSize(u32),
    CardType(CardType),
    Csd([u8; 16]),
    BitRate(u32),
}

/// The disk I/O contract a FAT filesystem driver consumes.
///
/// Sector numbers are LBAs of 512-byte sectors. `buf` must hold exactly
/// `count` sectors.
pub trait DiskIo {
    /// Bring the drive up, and report its status afterwards.
    fn initialize(&mut self) -> DiskStatus;
    /// Report the drive status without touching the card.
    fn status(&self) -> DiskStatus;
    fn read(&mut self, buf: &mut [u8], sector: u32, count: u32) -> Result<(), DiskError>;
    fn write(&mut self, buf: &[u8], sector: u32, count: u32) -> Result<(), DiskError>;
    fn ioctl(&mut self, command: IoctlCommand) -> Result<IoctlReply, DiskError>;
}

enum Slot<S>
where
    S: SpiMaster,
{
    Idle(SdCard<S, NotInit>),
    Ready(SdCard<S, Initialized>),
    /// Only seen if a state change panicked half way
    Gone,
}

/// An SD card on an SPI platform, as a disk.
pub struct SdcDisk<S>
where
    S: SpiMaster,
{
    slot: Slot<S>,
    options: AcquireOpts,
    sector_count: u32,
    /// Smallest erasable unit, in sectors
    erase_unit: u32,
    write_protected: bool,
}

impl<S> SdcDisk<S>
where
    S: SpiMaster,
{
    /// A disk on `platform`, not yet initialized.
    pub fn new(platform: SdcPlatform<S>) -> Self {
        Self::with_opts(platform, AcquireOpts::default())
    }

    /// A disk that will acquire its card with `options`.
    pub fn with_opts(platform: SdcPlatform<S>, options: AcquireOpts) -> Self {
        SdcDisk {
            slot: Slot::Idle(SdCard::new(platform)),
            options,
            sector_count: 0,
            erase_unit: 1,
            write_protected: false,
        }
    }

    /// Give back the platform, whatever state the card is in.
    pub fn free(self) -> Option<SdcPlatform<S>> {
        match self.slot {
            Slot::Idle(card) => Some(card.free()),
            Slot::Ready(card) => Some(card.free()),
            Slot::Gone => None,
        }
    }

    /// The initialized card, if there is one.
    pub fn card_mut(&mut self) -> Option<&mut SdCard<S, Initialized>> {
        match &mut self.slot {
            Slot::Ready(card) => Some(card),
            _ => None,
        }
    }

    /// Borrow the disk as a [`BlockDevice`], for partition tables and
    /// anything else that works in [`Block`]s.
    pub fn as_block_device(&mut self) -> DiskBlocks<'_, S> {
        DiskBlocks { disk: self }
    }

    fn ready(&mut self) -> Result<&mut SdCard<S, Initialized>, DiskError> {
        self.card_mut().ok_or(DiskError::NotReady)
    }

    fn platform(&self) -> Option<&SdcPlatform<S>> {
        match &self.slot {
            Slot::Idle(card) => Some(card.platform()),
            Slot::Ready(card) => Some(card.platform()),
            Slot::Gone => None,
        }
    }

    /// Check a transfer request, and that the card is up.
    fn check(&mut self, len: usize, sector: u32, count: u32) -> Result<(), DiskError> {
        let expected = (count as usize).checked_mul(Block::LEN);
        if count == 0 || expected != Some(len) {
            return Err(DiskError::Parameter);
        }
        self.ready()?;
        match sector.checked_add(count) {
            Some(end) if end <= self.sector_count => Ok(()),
            _ => Err(DiskError::Parameter),
        }
    }

    fn power_off(&mut self) {
        self.slot = match core::mem::replace(&mut self.slot, Slot::Gone) {
            Slot::Ready(card) => Slot::Idle(card.deinit()),
            other => other,
        };
        self.sector_count = 0;
        self.erase_unit = 1;
        self.write_protected = false;
    }

    fn trim(&mut self, start: u32, end: u32) -> Result<(), DiskError> {
        self.ready()?;
        if end < start || end >= self.sector_count {
            return Err(DiskError::Parameter);
        }
        if self.write_protected {
            return Err(DiskError::WriteProtected);
        }
        // Without ERASE_BLK_EN the card wipes every erase sector the range
        // touches, so only whole sectors may be trimmed.
        if start % self.erase_unit != 0 || (end + 1) % self.erase_unit != 0 {
            debug!(
                "Trim {}..={} is not aligned to {} sector erase units",
                start, end, self.erase_unit
            );
            return Err(DiskError::Parameter);
        }
        self.ready()?.erase(BlockIdx(start), BlockIdx(end))?;
        Ok(())
    }
}

impl<S> DiskIo for SdcDisk<S>
where
    S: SpiMaster,
{
    fn initialize(&mut self) -> DiskStatus {
        let status = self.status();
        if status.contains(DiskStatus::NODISK) || !status.contains(DiskStatus::NOINIT) {
            return status;
        }
        let card = match core::mem::replace(&mut self.slot, Slot::Gone) {
            Slot::Idle(card) => card,
            other => {
                self.slot = other;
                return self.status();
            }
        };
        self.slot = match card.acquire_with_opts(self.options) {
            Ok(mut card) => {
                match card.read_csd() {
                    Ok(csd) => {
                        self.sector_count = csd.card_capacity_blocks();
                        self.write_protected = csd.write_protected();
                        self.erase_unit = if csd.erase_single_block_enabled() {
                            1
                        } else {
                            csd.erase_sector_blocks()
                        };
                        debug!(
                            "Disk ready: {} sectors, write protected: {}",
                            self.sector_count, self.write_protected
                        );
                        Slot::Ready(card)
                    }
                    Err(e) => {
                        warn!("Can't read CSD: {:?}", e);
                        Slot::Idle(card.deinit())
                    }
                }
            }
            Err((e, card)) => {
                warn!("Disk initialize failed: {:?}", e);
                Slot::Idle(card)
            }
        };
        self.status()
    }

    fn status(&self) -> DiskStatus {
        match self.platform() {
            Some(platform) if platform.is_bound() => {}
            _ => return DiskStatus::NOINIT | DiskStatus::NODISK,
        }
        match self.slot {
            Slot::Ready(_) if self.write_protected => DiskStatus::PROTECT,
            Slot::Ready(_) => DiskStatus::empty(),
            _ => DiskStatus::NOINIT,
        }
    }

    fn read(&mut self, buf: &mut [u8], sector: u32, count: u32) -> Result<(), DiskError> {
        self.check(buf.len(), sector, count)?;
        self.ready()?
            .read_sectors(buf, BlockIdx(sector))
            .map_err(|e| {
                warn!("Read of {} sectors @ {} failed: {:?}", count, sector, e);
                DiskError::from_card(&e)
            })
    }

    fn write(&mut self, buf: &[u8], sector: u32, count: u32) -> Result<(), DiskError> {
        self.check(buf.len(), sector, count)?;
        if self.write_protected {
            return Err(DiskError::WriteProtected);
        }
        self.ready()?
            .write_sectors(buf, BlockIdx(sector))
            .map_err(|e| {
                warn!("Write of {} sectors @ {} failed: {:?}", count, sector, e);
                DiskError::from_card(&e)
            })
    }

    fn ioctl(&mut self, command: IoctlCommand) -> Result<IoctlReply, DiskError> {
        match command {
            IoctlCommand::PowerOff => {
                self.power_off();
                return Ok(IoctlReply::Done);
            }
            IoctlCommand::Trim { start, end } => {
                self.trim(start, end)?;
                return Ok(IoctlReply::Done);
            }
            _ => {}
        }
        let sector_count = self.sector_count;
        let card = self.ready()?;
        let reply = match command {
            // Every write waits for the card before returning.
            IoctlCommand::Sync => IoctlReply::Done,
            IoctlCommand::GetSectorCount => IoctlReply::SectorCount(sector_count),
            IoctlCommand::GetSectorSize => IoctlReply::SectorSize(Block::LEN as u16),
            IoctlCommand::GetBlockSize => {
                IoctlReply::BlockSize(card.read_csd()?.erase_sector_blocks())
            }
            IoctlCommand::GetCardType => IoctlReply::CardType(card.card_type()),
            IoctlCommand::GetCsd => IoctlReply::Csd(*card.read_csd()?.data()),
            IoctlCommand::GetBitRate => IoctlReply::BitRate(card.platform().bit_rate()),
            IoctlCommand::SetBitRate(rate) => {
                card.set_bit_rate(rate).map_err(|e| match e {
                    Error::Platform(crate::PlatformError::InvalidParameter) => {
                        DiskError::Parameter
                    }
                    e => DiskError::from_card(&e),
                })?;
                IoctlReply::Done
            }
            IoctlCommand::Trim { .. } | IoctlCommand::PowerOff => IoctlReply::Done,
        };
        Ok(reply)
    }
}

/// An [`SdcDisk`] seen as a [`BlockDevice`]. See [`SdcDisk::as_block_device`].
pub struct DiskBlocks<'d, S>
where
    S: SpiMaster,
{
    disk: &'d mut SdcDisk<S>,
}

impl<'d, S> BlockDevice for DiskBlocks<'d, S>
where
    S: SpiMaster,
{
    type Error = DiskError;

    fn read(
        &mut self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
        reason: &str,
    ) -> Result<(), Self::Error> {
        let count = blocks.len() as u32;
        self.disk.check(blocks.len() * Block::LEN, start_block_idx.0, count)?;
        Ok(self.disk.ready()?.read(blocks, start_block_idx, reason)?)
    }

    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        let count = blocks.len() as u32;
        self.disk.check(blocks.len() * Block::LEN, start_block_idx.0, count)?;
        if self.disk.write_protected {
            return Err(DiskError::WriteProtected);
        }
        Ok(self.disk.ready()?.write(blocks, start_block_idx)?)
    }

    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        self.disk.ready()?;
        Ok(BlockCount(self.disk.sector_count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{PlatformError, SpiConfig};
    use crate::sdmmc::Timeouts;
    use crate::sim::{SimCardKind, SimOptions, SimulatedCard};
    use crate::test::RecordingSpi;

    fn disk<'c, 'm>(card: &'c mut SimulatedCard<'m>) -> SdcDisk<&'c mut SimulatedCard<'m>> {
        let platform = SdcPlatform::open(card, SpiConfig::sd_card())
            .map_err(|(e, _)| e)
            .unwrap();
        SdcDisk::new(platform)
    }

    #[test]
    fn not_ready_before_initialize() {
        let mut memory = vec![0u8; 512 * 1024];
        let mut card = SimulatedCard::new(&mut memory, SimOptions::default());
        let mut disk = disk(&mut card);
        assert_eq!(disk.status(), DiskStatus::NOINIT);
        let mut buf = [0u8; 512];
        assert_eq!(disk.read(&mut buf, 0, 1), Err(DiskError::NotReady));
        assert_eq!(disk.write(&buf, 0, 1), Err(DiskError::NotReady));
        assert_eq!(
            disk.ioctl(IoctlCommand::GetSectorCount),
            Err(DiskError::NotReady)
        );
        // Nothing has been sent to the card yet
        drop(disk);
        assert_eq!(card.commands(), 0);
    }

    #[test]
    fn initialize_and_describe() {
        let mut memory = vec![0u8; 1024 * 1024];
        let mut card = SimulatedCard::new(&mut memory, SimOptions::default());
        let mut disk = disk(&mut card);
        assert_eq!(disk.initialize(), DiskStatus::empty());
        // A second initialize is a no-op
        assert_eq!(disk.initialize(), DiskStatus::empty());
        assert_eq!(
            disk.ioctl(IoctlCommand::GetSectorCount),
            Ok(IoctlReply::SectorCount(2048))
        );
        assert_eq!(
            disk.ioctl(IoctlCommand::GetSectorSize),
            Ok(IoctlReply::SectorSize(512))
        );
        assert_eq!(
            disk.ioctl(IoctlCommand::GetBlockSize),
            Ok(IoctlReply::BlockSize(128))
        );
        assert_eq!(
            disk.ioctl(IoctlCommand::GetCardType),
            Ok(IoctlReply::CardType(CardType::SDHC))
        );
        assert_eq!(disk.ioctl(IoctlCommand::Sync), Ok(IoctlReply::Done));
        match disk.ioctl(IoctlCommand::GetCsd) {
            Ok(IoctlReply::Csd(csd)) => assert_eq!(csd[0] >> 6, 1),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            disk.as_block_device().num_blocks(),
            Ok(BlockCount(2048))
        );
    }

    #[test]
    fn bad_requests_are_parameter_errors() {
        let mut memory = vec![0u8; 512 * 1024];
        let mut card = SimulatedCard::new(&mut memory, SimOptions::default());
        let mut disk = disk(&mut card);
        disk.initialize();
        let mut buf = [0u8; 1024];
        assert_eq!(disk.read(&mut buf, 0, 0), Err(DiskError::Parameter));
        assert_eq!(disk.read(&mut buf, 0, 1), Err(DiskError::Parameter));
        assert_eq!(disk.read(&mut buf[..512], 1024, 1), Err(DiskError::Parameter));
        assert_eq!(disk.write(&buf, 1023, 2), Err(DiskError::Parameter));
        assert_eq!(disk.read(&mut buf, u32::MAX, 2), Err(DiskError::Parameter));
        disk.read(&mut buf, 1022, 2).unwrap();
    }

    #[test]
    fn round_trip_many_sectors() {
        let mut memory = vec![0u8; 512 * 1024];
        let mut card = SimulatedCard::new(&mut memory, SimOptions::default());
        let mut disk = disk(&mut card);
        disk.initialize();
        let mut data = [0u8; 4 * 512];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i / 512) as u8 + 1;
        }
        disk.write(&data, 100, 4).unwrap();
        let mut back = [0u8; 4 * 512];
        disk.read(&mut back, 100, 4).unwrap();
        assert_eq!(&back[..], &data[..]);
        drop(disk);
        drop(card);
        assert!(memory[103 * 512..104 * 512].iter().all(|&b| b == 4));
    }

    #[test]
    fn write_protected_card() {
        let mut memory = vec![0u8; 64 * 1024];
        let options = SimOptions {
            kind: SimCardKind::Sd1,
            write_protected: true,
            ..Default::default()
        };
        let mut card = SimulatedCard::new(&mut memory, options);
        let mut disk = disk(&mut card);
        assert_eq!(disk.initialize(), DiskStatus::PROTECT);
        let buf = [0u8; 512];
        assert_eq!(disk.write(&buf, 0, 1), Err(DiskError::WriteProtected));
        assert_eq!(
            disk.ioctl(IoctlCommand::Trim { start: 0, end: 3 }),
            Err(DiskError::WriteProtected)
        );
        let mut buf = [0u8; 512];
        disk.read(&mut buf, 0, 1).unwrap();
    }

    #[test]
    fn corrupt_csd_leaves_disk_uninitialized() {
        let mut memory = vec![0u8; 512 * 1024];
        let options = SimOptions {
            corrupt_read_crc: true,
            ..Default::default()
        };
        let mut card = SimulatedCard::new(&mut memory, options);
        let mut disk = disk(&mut card);
        // The CSD comes back corrupt too, so the card never gets ready
        assert_eq!(disk.initialize(), DiskStatus::NOINIT);
    }

    #[test]
    fn bus_failures_are_read_write_errors() {
        let mut memory = vec![0u8; 512 * 1024];
        let mut card = SimulatedCard::new(&mut memory, SimOptions::default());
        let mut disk = disk(&mut card);
        disk.initialize();
        let spi = disk.card_mut().unwrap().platform_mut().spi_mut().unwrap();
        spi.fail_after(Some(0));
        let mut buf = [0u8; 512];
        assert_eq!(disk.read(&mut buf, 0, 1), Err(DiskError::ReadWrite));
        assert_eq!(disk.write(&buf, 0, 1), Err(DiskError::ReadWrite));
        // The card is still considered present
        assert_eq!(disk.status(), DiskStatus::empty());
    }

    #[test]
    fn trim_and_power_off() {
        let mut memory = vec![0xEEu8; 512 * 1024];
        let mut card = SimulatedCard::new(&mut memory, SimOptions::default());
        let mut disk = disk(&mut card);
        disk.initialize();
        assert_eq!(
            disk.ioctl(IoctlCommand::Trim { start: 2, end: 1 }),
            Err(DiskError::Parameter)
        );
        assert_eq!(
            disk.ioctl(IoctlCommand::Trim { start: 2, end: 3 }),
            Ok(IoctlReply::Done)
        );
        let mut buf = [0u8; 3 * 512];
        disk.read(&mut buf, 1, 3).unwrap();
        assert!(buf[..512].iter().all(|&b| b == 0xEE));
        assert!(buf[512..].iter().all(|&b| b == 0x00));

        assert_eq!(disk.ioctl(IoctlCommand::PowerOff), Ok(IoctlReply::Done));
        assert_eq!(disk.status(), DiskStatus::NOINIT);
        assert_eq!(disk.read(&mut buf, 1, 3), Err(DiskError::NotReady));
        assert_eq!(disk.initialize(), DiskStatus::empty());
        disk.read(&mut buf, 1, 3).unwrap();
    }

    #[test]
    fn bit_rate_control() {
        let mut memory = vec![0u8; 512 * 1024];
        let options = SimOptions {
            max_speed: Some(20_000_000),
            ..Default::default()
        };
        let mut card = SimulatedCard::new(&mut memory, options);
        let mut disk = disk(&mut card);
        disk.initialize();
        assert_eq!(
            disk.ioctl(IoctlCommand::GetBitRate),
            Ok(IoctlReply::BitRate(10_000_000))
        );
        assert_eq!(
            disk.ioctl(IoctlCommand::SetBitRate(20_000_000)),
            Ok(IoctlReply::Done)
        );
        assert_eq!(
            disk.ioctl(IoctlCommand::SetBitRate(0)),
            Err(DiskError::Parameter)
        );
        assert_eq!(
            disk.ioctl(IoctlCommand::SetBitRate(50_000_000)),
            Err(DiskError::ReadWrite)
        );
        assert_eq!(
            disk.ioctl(IoctlCommand::GetBitRate),
            Ok(IoctlReply::BitRate(20_000_000))
        );
        drop(disk);
        assert_eq!(card.speed(), 20_000_000);
    }

    #[test]
    fn unbound_platform_has_no_disk() {
        let platform = SdcPlatform::<RecordingSpi>::unbound(SpiConfig::sd_card());
        let mut disk = SdcDisk::new(platform);
        let status = DiskStatus::NOINIT | DiskStatus::NODISK;
        assert_eq!(disk.status(), status);
        assert_eq!(disk.initialize(), status);
        assert_eq!(disk.read(&mut [0; 512], 0, 1), Err(DiskError::NotReady));
    }

    #[test]
    fn missing_card_stays_uninitialized() {
        let platform = SdcPlatform::open(RecordingSpi::echoing(0xFF), SpiConfig::sd_card())
            .map_err(|(e, _)| e)
            .unwrap();
        let opts = AcquireOpts {
            timeouts: Timeouts {
                init_attempts: 2,
                command_polls: 4,
                busy_polls: 4,
            },
            ..Default::default()
        };
        let mut disk = SdcDisk::with_opts(platform, opts);
        assert_eq!(disk.initialize(), DiskStatus::NOINIT);
        assert!(disk.free().unwrap().release().is_some());
    }

    #[test]
    fn card_errors_map_onto_disk_errors() {
        let cases = [
            (Error::Platform(PlatformError::NullPointer), DiskError::NotReady),
            (Error::Platform(PlatformError::InvalidParameter), DiskError::NotReady),
            (Error::Platform(PlatformError::Bus), DiskError::ReadWrite),
            (Error::Platform(PlatformError::Transmit), DiskError::ReadWrite),
            (Error::CardNotFound, DiskError::NotReady),
            (Error::CantEnableCRC, DiskError::NotReady),
            (Error::InvalidBuffer, DiskError::Parameter),
            (Error::CrcError(1, 2), DiskError::ReadWrite),
            (Error::TimeoutCommand(17), DiskError::ReadWrite),
            (Error::WriteError, DiskError::ReadWrite),
        ];
        for (card, disk) in cases.iter() {
            assert_eq!(DiskError::from_card(card), *disk, "{:?}", card);
        }
    }

    #[test]
    fn partition_access_through_block_device() {
        let mut memory = vec![0u8; 512 * 1024];
        let mut card = SimulatedCard::new(&mut memory, SimOptions::default());
        let mut disk = disk(&mut card);
        let mut block = Block::new();
        assert_eq!(
            disk.as_block_device().write(&[block.clone()], BlockIdx(0)),
            Err(DiskError::NotReady)
        );
        disk.initialize();
        block.contents[0] = 0x55;
        let mut blocks = disk.as_block_device();
        blocks.write(&[block.clone()], BlockIdx(7)).unwrap();
        let block = blocks.read_block(BlockIdx(7)).unwrap();
        assert_eq!(block.contents[0], 0x55);
        assert_eq!(
            blocks.read_block(BlockIdx(1024)).err(),
            Some(DiskError::Parameter)
        );
        let mut raw = [0u8; 512];
        disk.read(&mut raw, 7, 1).unwrap();
        assert_eq!(raw[0], 0x55);
    }

    #[test]
    fn trim_respects_erase_sectors() {
        let mut memory = vec![0xEEu8; 512 * 1024];
        let options = SimOptions {
            erase_sectors_only: true,
            ..Default::default()
        };
        let mut card = SimulatedCard::new(&mut memory, options);
        let mut disk = disk(&mut card);
        disk.initialize();
        assert_eq!(
            disk.ioctl(IoctlCommand::GetBlockSize),
            Ok(IoctlReply::BlockSize(128))
        );
        // Part of an erase sector would take its neighbours with it
        assert_eq!(
            disk.ioctl(IoctlCommand::Trim { start: 2, end: 3 }),
            Err(DiskError::Parameter)
        );
        assert_eq!(
            disk.ioctl(IoctlCommand::Trim { start: 128, end: 200 }),
            Err(DiskError::Parameter)
        );
        assert_eq!(
            disk.ioctl(IoctlCommand::Trim { start: 128, end: 255 }),
            Ok(IoctlReply::Done)
        );
        drop(disk);
        drop(card);
        assert!(memory[..128 * 512].iter().all(|&b| b == 0xEE));
        assert!(memory[128 * 512..256 * 512].iter().all(|&b| b == 0x00));
        assert!(memory[256 * 512..].iter().all(|&b| b == 0xEE));
    }
}
