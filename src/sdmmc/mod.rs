//! embedded-sdc-spi - SDMMC Protocol
//!
//! Implements the SD/MMC protocol on top of an [`SdcPlatform`].
//!
//! This is currently optimised for readability and debugability, not
//! performance.

mod busy;
use busy::SdCardBusy;

use crate::platform::{PlatformError, SdcPlatform, SpiMaster};
use crate::sdmmc_proto::*;
use crate::{Block, BlockCount, BlockDevice, BlockIdx};

#[cfg(feature = "log")]
use log::{debug, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace, warn};

/// Represents an SD Card on an SPI bus.
///
/// The platform's chip select is driven separately from the data transfers
/// so we can clock out some bytes without it asserted (which puts the card
/// into SPI mode).
pub struct SdCard<S, State>
where
    S: SpiMaster,
{
    card_type: CardType,
    platform: SdcPlatform<S>,
    options: AcquireOpts,
    state: State,
}

/// The possible errors `SdCard` can generate.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// The SPI platform reported a failure
    Platform(PlatformError),
    /// We failed to enable CRC checking on the SD card
    CantEnableCRC,
    /// We didn't get a response when reading data from the card
    TimeoutReadBuffer,
    /// We didn't get a response when waiting for the card to not be busy
    TimeoutWaitNotBusy,
    /// We didn't get a response when executing this command
    TimeoutCommand(u8),
    /// We didn't get a response when executing this application-specific command
    TimeoutACommand(u8),
    /// We got a bad response from Command 58
    Cmd58Error,
    /// We failed to read the Card Specific Data register
    RegisterReadError,
    /// We got a CRC mismatch (card gave us, we calculated)
    CrcError(u16, u16),
    /// Error reading from the card
    ReadError,
    /// Error writing to the card
    WriteError,
    /// The card refused an erase command
    EraseError,
    /// Couldn't find the card
    CardNotFound,
    /// The buffer isn't a whole number of blocks
    InvalidBuffer,
}

impl From<PlatformError> for Error {
    fn from(e: PlatformError) -> Self {
        Error::Platform(e)
    }
}

/// The state of an SdCard if it is not initialized
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub struct NotInit;

/// The state of an SdCard if it is initialized
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub struct Initialized;

/// The different types of card we support.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CardType {
    /// SD v1, byte addressed
    SD1,
    /// SD v2 standard capacity, byte addressed
    SD2,
    /// SD v2 high capacity, block addressed
    SDHC,
}

impl CardType {
    /// The argument a data command needs to address `block`.
    fn address(self, block: BlockIdx) -> u32 {
        match self {
            CardType::SD1 | CardType::SD2 => block.0 * Block::LEN_U32,
            CardType::SDHC => block.0,
        }
    }
}

/// A retry budget. Each poll is itself a bus transfer, so counting them
/// bounds how long we wait.
struct Delay(u32);

impl Delay {
    fn new(budget: u32) -> Delay {
        Delay(budget)
    }

    fn delay(&mut self, err: Error) -> Result<(), Error> {
        if self.0 == 0 {
            Err(err)
        } else {
            self.0 -= 1;
            Ok(())
        }
    }
}

/// How long we are prepared to wait for the card.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Timeouts {
    /// How many times to send CMD0 (and retry CMD8) before giving up.
    pub init_attempts: u32,
    /// How many bytes to read while waiting for an R1 response.
    pub command_polls: u32,
    /// How many polls to spend on busy signalling, data tokens and ACMD41.
    pub busy_polls: u32,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            init_attempts: 32,
            command_polls: 512,
            busy_polls: 32_000,
        }
    }
}

/// Options for acquiring the card.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone)]
pub struct AcquireOpts {
    /// Some cards don't support CRC mode. At least a 512MiB Transcend one.
    pub require_crc: bool,
    /// Clock rate used while the card is brought up, in Hz.
    pub init_bit_rate: u32,
    /// Clock rate used once the card is ready, in Hz.
    pub bit_rate: u32,
    pub timeouts: Timeouts,
}

impl Default for AcquireOpts {
    fn default() -> Self {
        AcquireOpts {
            require_crc: true,
            init_bit_rate: crate::SpiConfig::SD_INIT_BIT_RATE,
            bit_rate: 10_000_000,
            timeouts: Timeouts::default(),
        }
    }
}

impl<S, State> SdCard<S, State>
where
    S: SpiMaster,
{
    /// Give back the platform.
    pub fn free(self) -> SdcPlatform<S> {
        self.platform
    }

    /// The platform this card talks through.
    pub fn platform(&self) -> &SdcPlatform<S> {
        &self.platform
    }

    /// Mutable access to the platform, e.g. to reach the SPI master.
    pub fn platform_mut(&mut self) -> &mut SdcPlatform<S> {
        &mut self.platform
    }

    fn discard_byte(&mut self) -> Result<u8, Error> {
        Ok(self.platform.transfer_byte(0xFF)?)
    }

    fn into_state<T>(self, state: T) -> SdCard<S, T> {
        SdCard {
            card_type: self.card_type,
            platform: self.platform,
            options: self.options,
            state,
        }
    }
}

impl<S> SdCard<S, NotInit>
where
    S: SpiMaster,
{
    /// Create a new SD/MMC controller using an SPI platform.
    pub fn new(platform: SdcPlatform<S>) -> Self {
        SdCard {
            card_type: CardType::SD1,
            platform,
            options: AcquireOpts::default(),
            state: NotInit {},
        }
    }

    /// Initializes the card into a known state
    pub fn acquire(self) -> Result<SdCard<S, Initialized>, (Error, Self)> {
        self.acquire_with_opts(Default::default())
    }

    /// Initializes the card into a known state
    pub fn acquire_with_opts(
        mut self,
        options: AcquireOpts,
    ) -> Result<SdCard<S, Initialized>, (Error, Self)> {
        debug!("acquiring card with opts: {:?}", options);
        let timeouts = options.timeouts;
        let f = |s: &mut Self| -> Result<(), Error> {
            trace!("Reset card..");
            s.platform.set_bit_rate(options.init_bit_rate)?;

            // Supply minimum of 74 clock cycles without CS asserted.
            s.platform.deselect()?;
            for _ in 0..10 {
                s.discard_byte()?;
            }

            let mut busy = SdCardBusy::new(&mut s.platform, timeouts)?;

            // Enter SPI mode
            let mut attempts = timeouts.init_attempts;
            loop {
                if attempts == 0 {
                    return Err(Error::CardNotFound);
                }
                trace!(
                    "Enter SPI mode, attempt: {}..",
                    timeouts.init_attempts - attempts
                );
                match busy.card_command(CMD0, 0) {
                    Err(Error::TimeoutCommand(0)) => {
                        // Try again?
                        warn!("Timed out, trying again..");
                    }
                    Err(e) => {
                        return Err(e);
                    }
                    Ok(R1_IDLE_STATE) => {
                        break;
                    }
                    Ok(_r) => {
                        // Try again
                        warn!("Got response: {:x}, trying again..", _r);
                    }
                }
                attempts -= 1;
            }

            // Enable CRC
            debug!("Enable CRC: {}", options.require_crc);
            if busy.card_command(CMD59, 1)? != R1_IDLE_STATE && options.require_crc {
                return Err(Error::CantEnableCRC);
            }

            // Check card version
            let mut delay = Delay::new(timeouts.init_attempts);
            loop {
                if busy.card_command(CMD8, CMD8_CHECK_PATTERN)?
                    == (R1_ILLEGAL_COMMAND | R1_IDLE_STATE)
                {
                    s.card_type = CardType::SD1;
                    break;
                }
                busy.receive()?;
                busy.receive()?;
                busy.receive()?;
                let status = busy.receive()?;
                if status == 0xAA {
                    s.card_type = CardType::SD2;
                    break;
                }
                delay.delay(Error::TimeoutCommand(CMD8))?;
            }
            debug!("Card version: {:?}", s.card_type);

            let arg = match s.card_type {
                CardType::SD1 => 0,
                CardType::SD2 | CardType::SDHC => ACMD41_HCS,
            };

            let mut delay = Delay::new(timeouts.busy_polls);
            while busy.card_acmd(ACMD41, arg)? != R1_READY_STATE {
                delay.delay(Error::TimeoutACommand(ACMD41))?;
            }

            if s.card_type == CardType::SD2 {
                if busy.card_command(CMD58, 0)? != 0 {
                    return Err(Error::Cmd58Error);
                }
                if (busy.receive()? & OCR_POWER_UP_CCS) == OCR_POWER_UP_CCS {
                    s.card_type = CardType::SDHC;
                }
                // Discard other three bytes
                busy.receive()?;
                busy.receive()?;
                busy.receive()?;
            }
            drop(busy);

            s.platform.set_bit_rate(options.bit_rate)?;
            Ok(())
        };
        let result = f(&mut self);
        let _ = self.discard_byte();

        match result {
            Ok(_) => {
                debug!("Card ready: {:?}", self.card_type);
                self.options = options;
                Ok(self.into_state(Initialized {}))
            }
            Err(e) => {
                warn!("Card acquire failed: {:?}", e);
                Err((e, self))
            }
        }
    }
}

impl<S> SdCard<S, Initialized>
where
    S: SpiMaster,
{
    /// Mark the card as unused.
    /// This should be kept infallible, because Drop is unable to fail.
    /// See https://github.com/rust-lang/rfcs/issues/814
    // If there is any need to flush data, it should be implemented here.
    pub fn deinit(self) -> SdCard<S, NotInit> {
        self.into_state(NotInit {})
    }

    /// What kind of card we found.
    pub fn card_type(&self) -> CardType {
        self.card_type
    }

    /// Re-clock the bus.
    pub fn set_bit_rate(&mut self, rate: u32) -> Result<(), Error> {
        Ok(self.platform.set_bit_rate(rate)?)
    }

    /// Run a command with chip select asserted.
    ///
    /// Chip select is always deasserted, even if an error occured in `f`
    fn with_chip_select<F, R>(&mut self, f: F) -> Result<R, Error>
    where
        F: FnOnce(&mut SdCardBusy<S>) -> Result<R, Error>,
    {
        let mut busy = SdCardBusy::new(&mut self.platform, self.options.timeouts)?;
        f(&mut busy)
    }

    /// Read the 'card specific data' block.
    ///
    /// The layout is picked from the CSD_STRUCTURE field rather than the
    /// card type, since standard capacity v2 cards still send a v1 CSD.
    pub fn read_csd(&mut self) -> Result<Csd, Error> {
        let mut data = [0u8; 16];
        self.with_chip_select(|spi| {
            if spi.card_command(CMD9, 0)? != 0 {
                return Err(Error::RegisterReadError);
            }
            spi.read_data(&mut data)
        })?;
        match data[0] >> 6 {
            0 => Ok(Csd::V1(CsdV1 { data })),
            1 => Ok(Csd::V2(CsdV2 { data })),
            _ => Err(Error::RegisterReadError),
        }
    }

    /// Return the usable size of this SD card in bytes.
    pub fn card_size_bytes(&mut self) -> Result<u64, Error> {
        Ok(self.read_csd()?.card_capacity_bytes())
    }

    /// Can this card erase single blocks?
    pub fn erase_single_block_enabled(&mut self) -> Result<bool, Error> {
        Ok(self.read_csd()?.erase_single_block_enabled())
    }

    /// Is the card write protected, according to its CSD?
    pub fn write_protected(&mut self) -> Result<bool, Error> {
        Ok(self.read_csd()?.write_protected())
    }

    /// Erase some blocks on the card, from `first_block` through
    /// `last_block` inclusive.
    pub fn erase(&mut self, first_block: BlockIdx, last_block: BlockIdx) -> Result<(), Error> {
        if last_block < first_block {
            return Err(Error::EraseError);
        }
        debug!("Erase blocks {} ..= {}", first_block.0, last_block.0);
        let start = self.card_type.address(first_block);
        let end = self.card_type.address(last_block);
        self.with_chip_select(|s| {
            if s.card_command(CMD32, start)? != 0 {
                return Err(Error::EraseError);
            }
            if s.card_command(CMD33, end)? != 0 {
                return Err(Error::EraseError);
            }
            if s.card_command(CMD38, 0)? != 0 {
                return Err(Error::EraseError);
            }
            s.wait_not_busy()
        })
    }

    /// Read whole sectors into `buffer`, starting at `start_block_idx`.
    /// `buffer` must be a multiple of 512 bytes long.
    pub fn read_sectors(
        &mut self,
        buffer: &mut [u8],
        start_block_idx: BlockIdx,
    ) -> Result<(), Error> {
        if buffer.len() % Block::LEN != 0 {
            return Err(Error::InvalidBuffer);
        }
        let count = buffer.len() / Block::LEN;
        self.read_chunks(buffer.chunks_exact_mut(Block::LEN), count, start_block_idx)
    }

    /// Write whole sectors from `buffer`, starting at `start_block_idx`.
    /// `buffer` must be a multiple of 512 bytes long.
    pub fn write_sectors(
        &mut self,
        buffer: &[u8],
        start_block_idx: BlockIdx,
    ) -> Result<(), Error> {
        if buffer.len() % Block::LEN != 0 {
            return Err(Error::InvalidBuffer);
        }
        let count = buffer.len() / Block::LEN;
        self.write_chunks(buffer.chunks_exact(Block::LEN), count, start_block_idx)
    }

    fn read_chunks<'b, I>(
        &mut self,
        mut chunks: I,
        count: usize,
        start_block_idx: BlockIdx,
    ) -> Result<(), Error>
    where
        I: Iterator<Item = &'b mut [u8]>,
    {
        if count == 0 {
            return Ok(());
        }
        trace!("Read {} blocks @ {}", count, start_block_idx.0);
        let start_idx = self.card_type.address(start_block_idx);
        self.with_chip_select(|s| {
            if count == 1 {
                // Start a single-block read
                if s.card_command(CMD17, start_idx)? != 0 {
                    return Err(Error::ReadError);
                }
                if let Some(chunk) = chunks.next() {
                    s.read_data(chunk)?;
                }
            } else {
                // Start a multi-block read
                if s.card_command(CMD18, start_idx)? != 0 {
                    return Err(Error::ReadError);
                }
                let result = chunks.try_for_each(|chunk| s.read_data(chunk));
                // Stop the read, even if a block went wrong
                s.card_command(CMD12, 0)?;
                result?;
            }
            Ok(())
        })
    }

    fn write_chunks<'b, I>(
        &mut self,
        mut chunks: I,
        count: usize,
        start_block_idx: BlockIdx,
    ) -> Result<(), Error>
    where
        I: Iterator<Item = &'b [u8]>,
    {
        if count == 0 {
            return Ok(());
        }
        trace!("Write {} blocks @ {}", count, start_block_idx.0);
        let start_idx = self.card_type.address(start_block_idx);
        self.with_chip_select(|s| {
            if count == 1 {
                // Start a single-block write
                if s.card_command(CMD24, start_idx)? != 0 {
                    return Err(Error::WriteError);
                }
                if let Some(chunk) = chunks.next() {
                    s.write_data(DATA_START_BLOCK, chunk)?;
                }
                s.wait_not_busy()?;
                if s.card_command(CMD13, 0)? != 0x00 {
                    return Err(Error::WriteError);
                }
                if s.receive()? != 0x00 {
                    return Err(Error::WriteError);
                }
            } else {
                // Tell the card how much is coming so it can pre-erase
                s.card_acmd(ACMD23, count as u32)?;
                // Start a multi-block write
                if s.card_command(CMD25, start_idx)? != 0 {
                    return Err(Error::WriteError);
                }
                let result = chunks.try_for_each(|chunk| {
                    s.wait_not_busy()?;
                    s.write_data(WRITE_MULTIPLE_TOKEN, chunk)
                });
                // Stop the write
                s.wait_not_busy()?;
                s.send(STOP_TRAN_TOKEN)?;
                s.wait_not_busy()?;
                result?;
            }
            Ok(())
        })
    }
}

impl<S> BlockDevice for SdCard<S, Initialized>
where
    S: SpiMaster,
{
    type Error = Error;

    /// Read one or more blocks, starting at the given block index.
    fn read(
        &mut self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
        _reason: &str,
    ) -> Result<(), Self::Error> {
        trace!("Read for {}", _reason);
        let count = blocks.len();
        self.read_chunks(
            blocks.iter_mut().map(|b| &mut b.contents[..]),
            count,
            start_block_idx,
        )
    }

    /// Write one or more blocks, starting at the given block index.
    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        let count = blocks.len();
        self.write_chunks(
            blocks.iter().map(|b| &b.contents[..]),
            count,
            start_block_idx,
        )
    }

    /// Determine how many blocks this device can hold.
    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        Ok(BlockCount(self.read_csd()?.card_capacity_blocks()))
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
