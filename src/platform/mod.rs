//! embedded-sdc-spi - SPI transfer primitives
//!
//! The only code in this crate that talks to the SPI master. Everything
//! above this layer sees [`PlatformError`], never the driver's own error
//! type.
//!
//! An [`SdcPlatform`] owns the master together with its [`SpiConfig`], so
//! there is no process-wide bus state and several independent platforms can
//! coexist (which the tests rely on).

pub mod hal;

#[cfg(feature = "log")]
use log::{debug, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace, warn};

/// SPI clock polarity and phase.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SpiMode {
    /// CPOL = 0, CPHA = 0. What SD cards expect.
    Mode0,
    /// CPOL = 0, CPHA = 1
    Mode1,
    /// CPOL = 1, CPHA = 0
    Mode2,
    /// CPOL = 1, CPHA = 1
    Mode3,
}

/// Who drives the chip select line.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CsMode {
    /// The master drives chip select itself. [`SdcPlatform::select`] and
    /// [`SdcPlatform::deselect`] don't reach it, so the master must hold
    /// the line for a whole command sequence.
    Hardware,
    /// Chip select is a GPIO driven through [`SpiMaster::select`] and
    /// [`SpiMaster::deselect`].
    Software,
}

/// Electrical level of an asserted chip select.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CsPolarity {
    ActiveLow,
    ActiveHigh,
}

/// Configuration of an SPI master, owned by the [`SdcPlatform`] using it.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SpiConfig {
    pub mode: SpiMode,
    /// Clock rate in Hz.
    pub speed: u32,
    pub cs_mode: CsMode,
    pub cs_polarity: CsPolarity,
    /// The byte clocked out while we are only receiving.
    pub default_write_data: u8,
}

impl SpiConfig {
    /// Cards must be brought up at no more than 400 kHz.
    pub const SD_INIT_BIT_RATE: u32 = 400_000;

    /// The settings an SD card in SPI mode wants: mode 0, software chip
    /// select, slow clock and 0xFF on MOSI while receiving.
    pub fn sd_card() -> Self {
        SpiConfig {
            speed: Self::SD_INIT_BIT_RATE,
            default_write_data: 0xFF,
            ..Default::default()
        }
    }
}

impl Default for SpiConfig {
    fn default() -> Self {
        SpiConfig {
            mode: SpiMode::Mode0,
            speed: 100_000,
            cs_mode: CsMode::Software,
            cs_polarity: CsPolarity::ActiveLow,
            default_write_data: 0x00,
        }
    }
}

/// The contract this crate needs from an SPI master driver.
///
/// Implementations report failures with their own error type; the
/// [`SdcPlatform`] maps every one of them to a [`PlatformError`].
pub trait SpiMaster {
    /// Raw driver error. Only ever inspected for logging.
    type Error: core::fmt::Debug;

    /// Apply a configuration. Called once when a platform is opened.
    fn configure(&mut self, config: &SpiConfig) -> Result<(), Self::Error>;
    /// Full-duplex transfer. `tx` and `rx` have the same length.
    fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), Self::Error>;
    /// Transmit, discarding whatever comes back.
    fn write(&mut self, data: &[u8]) -> Result<(), Self::Error>;
    /// Receive, clocking out the configured default write data.
    fn read(&mut self, data: &mut [u8]) -> Result<(), Self::Error>;
    /// Change the clock rate, in Hz.
    fn set_speed(&mut self, hz: u32) -> Result<(), Self::Error>;
    /// Assert chip select.
    fn select(&mut self) -> Result<(), Self::Error>;
    /// Release chip select.
    fn deselect(&mut self) -> Result<(), Self::Error>;
    /// Shut the peripheral down.
    fn close(&mut self) {}
}

impl<T> SpiMaster for &mut T
where
    T: SpiMaster,
{
    type Error = T::Error;

    fn configure(&mut self, config: &SpiConfig) -> Result<(), Self::Error> {
        (*self).configure(config)
    }

    fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), Self::Error> {
        (*self).exchange(tx, rx)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), Self::Error> {
        (*self).write(data)
    }

    fn read(&mut self, data: &mut [u8]) -> Result<(), Self::Error> {
        (*self).read(data)
    }

    fn set_speed(&mut self, hz: u32) -> Result<(), Self::Error> {
        (*self).set_speed(hz)
    }

    fn select(&mut self) -> Result<(), Self::Error> {
        (*self).select()
    }

    fn deselect(&mut self) -> Result<(), Self::Error> {
        (*self).deselect()
    }

    fn close(&mut self) {
        (*self).close()
    }
}

/// The closed set of failures an [`SdcPlatform`] reports.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PlatformError {
    /// No SPI master is bound to this platform, or an argument was out of
    /// range. Nothing was sent on the bus.
    InvalidParameter,
    /// The SPI master failed a transfer.
    Bus,
    /// A configuration call was made without an SPI master bound.
    NullPointer,
    /// The SPI master refused a configuration change.
    Transmit,
}

/// An SPI master plus the configuration it runs with.
///
/// A platform built with [`SdcPlatform::unbound`] has no master; every call
/// on it fails before anything reaches a bus.
#[derive(Debug)]
pub struct SdcPlatform<S> {
    spi: Option<S>,
    config: SpiConfig,
}

impl<S> SdcPlatform<S>
where
    S: SpiMaster,
{
    /// Bind `spi` and apply `config` to it.
    ///
    /// The master is handed back if it refuses the configuration.
    pub fn open(mut spi: S, config: SpiConfig) -> Result<Self, (PlatformError, S)> {
        debug!("opening SPI platform with {:?}", config);
        if spi.configure(&config).is_err() {
            warn!("SPI master refused configuration");
            return Err((PlatformError::Transmit, spi));
        }
        Ok(SdcPlatform {
            spi: Some(spi),
            config,
        })
    }

    /// A platform with no master bound.
    pub fn unbound(config: SpiConfig) -> Self {
        SdcPlatform { spi: None, config }
    }

    /// Is an SPI master bound?
    pub fn is_bound(&self) -> bool {
        self.spi.is_some()
    }

    pub fn config(&self) -> &SpiConfig {
        &self.config
    }

    /// The clock rate last applied, in Hz.
    pub fn bit_rate(&self) -> u32 {
        self.config.speed
    }

    /// The bound master, for anything this type doesn't cover.
    pub fn spi_mut(&mut self) -> Option<&mut S> {
        self.spi.as_mut()
    }

    /// Close the master and give it back.
    pub fn release(mut self) -> Option<S> {
        if let Some(spi) = self.spi.as_mut() {
            spi.close();
        }
        self.spi
    }

    fn handle(&mut self, err: PlatformError) -> Result<&mut S, PlatformError> {
        self.spi.as_mut().ok_or(err)
    }

    /// Send `tx` and store the byte clocked back in `rx`.
    ///
    /// If the transfer fails `rx` is set to zero. If no master is bound `rx`
    /// is left alone.
    pub fn exchange(&mut self, tx: u8, rx: &mut u8) -> Result<(), PlatformError> {
        let spi = self.handle(PlatformError::InvalidParameter)?;
        let mut buf = [0u8];
        match spi.exchange(&[tx], &mut buf) {
            Ok(()) => {
                *rx = buf[0];
                Ok(())
            }
            Err(_e) => {
                *rx = 0;
                warn!("SPI exchange of {:x} failed", tx);
                Err(PlatformError::Bus)
            }
        }
    }

    /// Send one byte, return the byte clocked back.
    pub fn transfer_byte(&mut self, tx: u8) -> Result<u8, PlatformError> {
        let mut rx = 0;
        self.exchange(tx, &mut rx)?;
        Ok(rx)
    }

    /// Send every byte of `buffer`, ignoring what comes back.
    pub fn transmit(&mut self, buffer: &[u8]) -> Result<(), PlatformError> {
        let spi = self.handle(PlatformError::InvalidParameter)?;
        spi.write(buffer).map_err(|_e| {
            warn!("SPI write of {} bytes failed", buffer.len());
            PlatformError::Bus
        })
    }

    /// Fill `buffer` with bytes from the bus.
    pub fn receive(&mut self, buffer: &mut [u8]) -> Result<(), PlatformError> {
        let spi = self.handle(PlatformError::InvalidParameter)?;
        let len = buffer.len();
        spi.read(buffer).map_err(|_e| {
            warn!("SPI read of {} bytes failed", len);
            PlatformError::Bus
        })
    }

    /// Change the bus clock. The new rate sticks until the next call.
    ///
    /// Exactly one speed change is requested from the master; a refusal is
    /// reported as [`PlatformError::Transmit`] and not retried.
    pub fn set_bit_rate(&mut self, rate: u32) -> Result<(), PlatformError> {
        let spi = self.handle(PlatformError::NullPointer)?;
        if rate == 0 {
            return Err(PlatformError::InvalidParameter);
        }
        trace!("set bit rate {}", rate);
        spi.set_speed(rate).map_err(|_e| {
            warn!("SPI master refused bit rate {}", rate);
            PlatformError::Transmit
        })?;
        self.config.speed = rate;
        Ok(())
    }

    /// Assert chip select. With [`CsMode::Hardware`] this only checks that
    /// a master is bound.
    pub fn select(&mut self) -> Result<(), PlatformError> {
        let cs_mode = self.config.cs_mode;
        let spi = self.handle(PlatformError::InvalidParameter)?;
        match cs_mode {
            CsMode::Software => spi.select().map_err(|_e| PlatformError::Bus),
            CsMode::Hardware => Ok(()),
        }
    }

    /// Release chip select. With [`CsMode::Hardware`] this only checks that
    /// a master is bound.
    pub fn deselect(&mut self) -> Result<(), PlatformError> {
        let cs_mode = self.config.cs_mode;
        let spi = self.handle(PlatformError::InvalidParameter)?;
        match cs_mode {
            CsMode::Software => spi.deselect().map_err(|_e| PlatformError::Bus),
            CsMode::Hardware => Ok(()),
        }
    }
}
