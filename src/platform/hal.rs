//! embedded-sdc-spi - embedded-hal bridge
//!
//! Lets any `embedded-hal` 0.2 blocking SPI bus plus a GPIO chip select act
//! as a [`SpiMaster`].

use embedded_hal::blocking::spi::{Transfer, Write};
use embedded_hal::digital::v2::OutputPin;

use super::{CsMode, CsPolarity, SpiConfig, SpiMaster, SpiMode};

/// Errors from a [`HalSpi`].
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HalSpiError {
    /// The SPI bus failed
    Spi,
    /// Couldn't set the chip select pin
    Gpio,
    /// `exchange` was given buffers of different lengths
    LengthMismatch,
    /// No way to change the clock rate was provided
    Unsupported,
    /// The configuration asks for a mode or chip select scheme this bus
    /// can't provide
    Config,
}

/// Changes the clock of an `embedded-hal` SPI bus. Returns `false` if the
/// rate can't be applied.
pub type SpeedSetter<SPI> = fn(&mut SPI, u32) -> bool;

/// An `embedded-hal` SPI bus with a software chip select.
///
/// The bus must already be set up for SPI mode 0. Only configurations
/// asking for mode 0 and [`CsMode::Software`] are accepted.
#[derive(Debug)]
pub struct HalSpi<SPI, CS> {
    spi: SPI,
    cs: CS,
    polarity: CsPolarity,
    idle: u8,
    speed_setter: Option<SpeedSetter<SPI>>,
}

impl<SPI, CS> HalSpi<SPI, CS>
where
    SPI: Transfer<u8> + Write<u8>,
    CS: OutputPin,
{
    /// Wrap a bus whose clock is fixed.
    pub fn new(spi: SPI, cs: CS) -> Self {
        HalSpi {
            spi,
            cs,
            polarity: CsPolarity::ActiveLow,
            idle: 0xFF,
            speed_setter: None,
        }
    }

    /// Wrap a bus that can be re-clocked with `setter`.
    pub fn with_speed_setter(spi: SPI, cs: CS, setter: SpeedSetter<SPI>) -> Self {
        HalSpi {
            speed_setter: Some(setter),
            ..Self::new(spi, cs)
        }
    }

    /// Give back the bus and the pin.
    pub fn free(self) -> (SPI, CS) {
        (self.spi, self.cs)
    }

    fn drive_cs(&mut self, asserted: bool) -> Result<(), HalSpiError> {
        let high = match self.polarity {
            CsPolarity::ActiveLow => !asserted,
            CsPolarity::ActiveHigh => asserted,
        };
        if high {
            self.cs.set_high().map_err(|_| HalSpiError::Gpio)
        } else {
            self.cs.set_low().map_err(|_| HalSpiError::Gpio)
        }
    }
}

impl<SPI, CS> SpiMaster for HalSpi<SPI, CS>
where
    SPI: Transfer<u8> + Write<u8>,
    CS: OutputPin,
{
    type Error = HalSpiError;

    fn configure(&mut self, config: &SpiConfig) -> Result<(), Self::Error> {
        if config.mode != SpiMode::Mode0 || config.cs_mode != CsMode::Software {
            return Err(HalSpiError::Config);
        }
        self.polarity = config.cs_polarity;
        self.idle = config.default_write_data;
        if let Some(setter) = self.speed_setter {
            if !setter(&mut self.spi, config.speed) {
                return Err(HalSpiError::Unsupported);
            }
        }
        self.drive_cs(false)
    }

    fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), Self::Error> {
        if tx.len() != rx.len() {
            return Err(HalSpiError::LengthMismatch);
        }
        rx.copy_from_slice(tx);
        self.spi.transfer(rx).map_err(|_| HalSpiError::Spi)?;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), Self::Error> {
        Write::write(&mut self.spi, data).map_err(|_| HalSpiError::Spi)
    }

    fn read(&mut self, data: &mut [u8]) -> Result<(), Self::Error> {
        for b in data.iter_mut() {
            *b = self.idle;
        }
        self.spi.transfer(data).map_err(|_| HalSpiError::Spi)?;
        Ok(())
    }

    fn set_speed(&mut self, hz: u32) -> Result<(), Self::Error> {
        match self.speed_setter {
            Some(setter) if setter(&mut self.spi, hz) => Ok(()),
            _ => Err(HalSpiError::Unsupported),
        }
    }

    fn select(&mut self) -> Result<(), Self::Error> {
        self.drive_cs(true)
    }

    fn deselect(&mut self) -> Result<(), Self::Error> {
        self.drive_cs(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{PlatformError, SdcPlatform};

    #[derive(Debug, Default)]
    struct LoopSpi {
        last_write: Vec<u8>,
        speed: u32,
    }

    impl Transfer<u8> for LoopSpi {
        type Error = ();
        fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], ()> {
            for b in words.iter_mut() {
                *b = !*b;
            }
            Ok(words)
        }
    }

    impl Write<u8> for LoopSpi {
        type Error = ();
        fn write(&mut self, words: &[u8]) -> Result<(), ()> {
            self.last_write = words.to_vec();
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct Pin {
        high: Option<bool>,
    }

    impl OutputPin for Pin {
        type Error = ();
        fn set_low(&mut self) -> Result<(), ()> {
            self.high = Some(false);
            Ok(())
        }
        fn set_high(&mut self) -> Result<(), ()> {
            self.high = Some(true);
            Ok(())
        }
    }

    fn set_speed(spi: &mut LoopSpi, hz: u32) -> bool {
        spi.speed = hz;
        hz <= 25_000_000
    }

    #[test]
    fn chip_select_follows_polarity() {
        let mut hal = HalSpi::new(LoopSpi::default(), Pin::default());
        hal.configure(&SpiConfig::sd_card()).unwrap();
        assert_eq!(hal.cs.high, Some(true));
        hal.select().unwrap();
        assert_eq!(hal.cs.high, Some(false));

        let config = SpiConfig {
            cs_polarity: CsPolarity::ActiveHigh,
            ..SpiConfig::sd_card()
        };
        hal.configure(&config).unwrap();
        assert_eq!(hal.cs.high, Some(false));
        hal.select().unwrap();
        assert_eq!(hal.cs.high, Some(true));
    }

    #[test]
    fn configs_it_cannot_honour_are_refused() {
        let mut hal = HalSpi::new(LoopSpi::default(), Pin::default());
        let mode3 = SpiConfig {
            mode: SpiMode::Mode3,
            ..SpiConfig::sd_card()
        };
        assert_eq!(hal.configure(&mode3), Err(HalSpiError::Config));
        let hardware_cs = SpiConfig {
            cs_mode: CsMode::Hardware,
            ..SpiConfig::sd_card()
        };
        assert_eq!(hal.configure(&hardware_cs), Err(HalSpiError::Config));
        // Nothing was driven
        assert_eq!(hal.cs.high, None);

        let (err, _hal) = SdcPlatform::open(hal, mode3).unwrap_err();
        assert_eq!(err, PlatformError::Transmit);
    }

    #[test]
    fn read_clocks_out_idle_byte() {
        let mut hal = HalSpi::new(LoopSpi::default(), Pin::default());
        hal.configure(&SpiConfig::sd_card()).unwrap();
        let mut buf = [0u8; 4];
        hal.read(&mut buf).unwrap();
        // LoopSpi inverts what it is sent, so 0xFF comes back as 0x00.
        assert_eq!(buf, [0x00; 4]);
    }

    #[test]
    fn exchange_rejects_mismatched_buffers() {
        let mut hal = HalSpi::new(LoopSpi::default(), Pin::default());
        assert_eq!(
            hal.exchange(&[1, 2], &mut [0]),
            Err(HalSpiError::LengthMismatch)
        );
    }

    #[test]
    fn speed_without_setter_is_refused() {
        let hal = HalSpi::new(LoopSpi::default(), Pin::default());
        let mut platform = SdcPlatform::open(hal, SpiConfig::sd_card()).unwrap();
        assert_eq!(
            platform.set_bit_rate(1_000_000),
            Err(PlatformError::Transmit)
        );
    }

    #[test]
    fn speed_setter_is_used() {
        let hal = HalSpi::with_speed_setter(LoopSpi::default(), Pin::default(), set_speed);
        let mut platform = SdcPlatform::open(hal, SpiConfig::sd_card()).unwrap();
        platform.set_bit_rate(20_000_000).unwrap();
        assert_eq!(
            platform.set_bit_rate(50_000_000),
            Err(PlatformError::Transmit)
        );
        platform.transmit(&[9, 8, 7]).unwrap();
        let (spi, _cs) = platform.release().unwrap().free();
        assert_eq!(spi.speed, 50_000_000);
        assert_eq!(spi.last_write, vec![9, 8, 7]);
    }
}
