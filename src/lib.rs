//! # embedded-sdc-spi
//!
//! > An SD card block device over a generic SPI master, written in Embedded Rust
//!
//! This crate sits between a FAT filesystem driver and an SPI master
//! peripheral. The filesystem only ever asks for sectors (initialize, read,
//! write, ioctl, status); this crate turns those requests into SD-over-SPI
//! command frames, and those into byte exchanges on the bus. It is
//! `#![no_std]` and does not use `alloc`.
//!
//! There are three layers:
//!
//! * [`platform`] - the SPI transfer primitives. An [`SdcPlatform`] owns an
//!   SPI master (anything implementing [`SpiMaster`]) together with its
//!   configuration, and offers byte exchange, multi-byte transmit/receive and
//!   bit-rate control. Raw driver errors never leave this layer.
//! * [`sdmmc`] - the SD card protocol: command framing, CRC, response polling
//!   with bounded retries, data tokens. An initialised [`SdCard`] is a
//!   [`BlockDevice`].
//! * [`diskio`] - the FatFs-style disk I/O contract, [`SdcDisk`], with its own
//!   result and status types.
//!
//! ## Using the crate
//!
//! ```rust
//! use embedded_sdc_spi::{
//!     diskio::{DiskIo, DiskStatus},
//!     sim::{SimOptions, SimulatedCard},
//!     SdcDisk, SdcPlatform, SpiConfig,
//! };
//!
//! let mut memory = [0u8; 512 * 1024];
//! let card = SimulatedCard::new(&mut memory, SimOptions::default());
//! let platform = SdcPlatform::open(card, SpiConfig::sd_card())
//!     .map_err(|(e, _card)| e)
//!     .unwrap();
//! let mut disk = SdcDisk::new(platform);
//!
//! assert_eq!(disk.initialize(), DiskStatus::empty());
//!
//! let mut sector = [0x42u8; 512];
//! disk.write(&sector, 3, 1).unwrap();
//! sector.fill(0);
//! disk.read(&mut sector, 3, 1).unwrap();
//! assert!(sector.iter().all(|&b| b == 0x42));
//! ```
//!
//! ## Features
//!
//! * `defmt-log`: By turning off the default features and enabling the `defmt-log` feature you can
//! configure this crate to log messages over defmt instead.
//! * `refcell-blockdevice`: implement [`BlockDevice`] for `RefCell<T>`.
//!
//! Make sure that either the `log` feature or the `defmt-log` feature is enabled.

#![cfg_attr(not(test), no_std)]
// #![deny(missing_docs)]

// ****************************************************************************
//
// Imports
//
// ****************************************************************************


#[macro_use]
mod structure;

pub mod block_device;
pub mod diskio;
pub mod mbr;
pub mod platform;
pub mod sdmmc;
pub mod sdmmc_proto;
pub mod sim;

pub use crate::block_device::{Block, BlockCount, BlockDevice, BlockIdx, MemoryBlockDevice};
pub use crate::diskio::{DiskBlocks, DiskError, DiskIo, DiskStatus, SdcDisk};
pub use crate::platform::{PlatformError, SdcPlatform, SpiConfig, SpiMaster};
pub use crate::sdmmc::Error as SdMmcError;
pub use crate::sdmmc::SdCard;

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
