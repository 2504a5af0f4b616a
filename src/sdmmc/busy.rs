use crate::platform::{SdcPlatform, SpiMaster};
use crate::sdmmc_proto::*;

use super::{Delay, Error, Timeouts};

/// A struct used to ensure that communication only occurs
/// when CS is asserted.
///
/// This struct is responsible for ensuring that all SPI, CRC, and
/// other communication-layer functionalities are performed correctly.
pub struct SdCardBusy<'p, S>
where
    S: SpiMaster,
{
    platform: &'p mut SdcPlatform<S>,
    timeouts: Timeouts,
}

impl<'p, S> Drop for SdCardBusy<'p, S>
where
    S: SpiMaster,
{
    fn drop(&mut self) {
        self.platform.deselect().ok();
        // The card only lets go of MISO after seeing a clock with CS high.
        self.platform.transfer_byte(0xFF).ok();
    }
}

impl<'p, S> SdCardBusy<'p, S>
where
    S: SpiMaster,
{
    pub fn new(platform: &'p mut SdcPlatform<S>, timeouts: Timeouts) -> Result<Self, Error> {
        platform.select()?;
        Ok(Self { platform, timeouts })
    }

    /// Send one byte and receive one byte.
    fn transfer(&mut self, out: u8) -> Result<u8, Error> {
        Ok(self.platform.transfer_byte(out)?)
    }

    /// Receive a byte from the SD card by clocking in an 0xFF byte.
    pub fn receive(&mut self) -> Result<u8, Error> {
        self.transfer(0xFF)
    }

    /// Send a byte to the SD card.
    pub fn send(&mut self, out: u8) -> Result<(), Error> {
        let _ = self.transfer(out)?;
        Ok(())
    }

    /// Spin until the card returns 0xFF, or we spin too many times and
    /// timeout.
    pub fn wait_not_busy(&mut self) -> Result<(), Error> {
        let mut delay = Delay::new(self.timeouts.busy_polls);
        loop {
            let s = self.receive()?;
            if s == 0xFF {
                break;
            }
            delay.delay(Error::TimeoutWaitNotBusy)?;
        }
        Ok(())
    }

    /// Perform a command.
    pub fn card_command(&mut self, command: u8, arg: u32) -> Result<u8, Error> {
        // The card may legitimately be driving data when these two arrive.
        if command != CMD0 && command != CMD12 {
            self.wait_not_busy()?;
        }

        let mut buf = [
            0x40 | command,
            (arg >> 24) as u8,
            (arg >> 16) as u8,
            (arg >> 8) as u8,
            arg as u8,
            0,
        ];
        buf[5] = crc7(&buf[0..5]);

        self.platform.transmit(&buf)?;

        // skip stuff byte for stop read
        if command == CMD12 {
            let _result = self.receive()?;
        }

        for _ in 0..self.timeouts.command_polls {
            let result = self.receive()?;
            if (result & 0x80) == ERROR_OK {
                return Ok(result);
            }
        }

        Err(Error::TimeoutCommand(command))
    }

    /// Perform an application-specific command.
    pub fn card_acmd(&mut self, command: u8, arg: u32) -> Result<u8, Error> {
        self.card_command(CMD55, 0)?;
        self.card_command(command, arg).map_err(|e| match e {
            Error::TimeoutCommand(c) => Error::TimeoutACommand(c),
            other => other,
        })
    }

    /// Read an arbitrary number of bytes from the card. Always fills the
    /// given buffer, so make sure it's the right size.
    pub fn read_data(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        // Get first non-FF byte.
        let mut delay = Delay::new(self.timeouts.busy_polls);
        let status = loop {
            let s = self.receive()?;
            if s != 0xFF {
                break s;
            }
            delay.delay(Error::TimeoutReadBuffer)?;
        };
        if status != DATA_START_BLOCK {
            return Err(Error::ReadError);
        }

        self.platform.receive(buffer)?;

        let mut crc_bytes = [0u8; 2];
        self.platform.receive(&mut crc_bytes)?;
        let crc = u16::from_be_bytes(crc_bytes);

        let calc_crc = crc16(buffer);
        if crc != calc_crc {
            return Err(Error::CrcError(crc, calc_crc));
        }

        Ok(())
    }

    /// Write an arbitrary number of bytes to the card.
    pub fn write_data(&mut self, token: u8, buffer: &[u8]) -> Result<(), Error> {
        let calc_crc = crc16(buffer);
        self.send(token)?;
        self.platform.transmit(buffer)?;
        self.platform.transmit(&calc_crc.to_be_bytes())?;
        let status = self.receive()?;
        if (status & DATA_RES_MASK) != DATA_RES_ACCEPTED {
            Err(Error::WriteError)
        } else {
            Ok(())
        }
    }
}
