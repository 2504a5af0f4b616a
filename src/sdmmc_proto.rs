//! embedded-sdc-spi - Constants from the SD Specifications
//!
//! Based on SdFat, under the following terms:
//!
//! > Copyright (c) 2011-2018 Bill Greiman
//! > This file is part of the SdFat library for SD memory cards.
//! >
//! > MIT License
//! >
//! > Permission is hereby granted, free of charge, to any person obtaining a
//! > copy of this software and associated documentation files (the "Software"),
//! > to deal in the Software without restriction, including without limitation
//! > the rights to use, copy, modify, merge, publish, distribute, sublicense,
//! > and/or sell copies of the Software, and to permit persons to whom the
//! > Software is furnished to do so, subject to the following conditions:
//! >
//! > The above copyright notice and this permission notice shall be included
//! > in all copies or substantial portions of the Software.
//! >
//! > THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
//! > OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
//! > FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
//! > AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
//! > LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
//! > FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
//! > DEALINGS IN THE SOFTWARE.

//==============================================================================

// Possible errors the SD card can return

/// Card indicates last operation was a success
pub const ERROR_OK: u8 = 0x00;

//==============================================================================

// SD Card Commands

/// GO_IDLE_STATE - init card in spi mode if CS low
pub const CMD0: u8 = 0x00;
/// SEND_IF_COND - verify SD Memory Card interface operating condition.*/
pub const CMD8: u8 = 0x08;
/// SEND_CSD - read the Card Specific Data (CSD register)
pub const CMD9: u8 = 0x09;
/// SEND_CID - read the card identification information (CID register)
pub const CMD10: u8 = 0x0A;
/// STOP_TRANSMISSION - end multiple block read sequence
pub const CMD12: u8 = 0x0C;
/// SEND_STATUS - read the card status register
pub const CMD13: u8 = 0x0D;
/// READ_SINGLE_BLOCK - read a single data block from the card
pub const CMD17: u8 = 0x11;
/// READ_MULTIPLE_BLOCK - read a multiple data blocks from the card
pub const CMD18: u8 = 0x12;
/// WRITE_BLOCK - write a single data block to the card
pub const CMD24: u8 = 0x18;
/// WRITE_MULTIPLE_BLOCK - write blocks of data until a STOP_TRANSMISSION
pub const CMD25: u8 = 0x19;
/// ERASE_WR_BLK_START - sets the address of the first block to be erased
pub const CMD32: u8 = 0x20;
/// ERASE_WR_BLK_END - sets the address of the last block of the continuous
/// range to be erased*/
pub const CMD33: u8 = 0x21;
/// ERASE - erase all previously selected blocks */
pub const CMD38: u8 = 0x26;
/// APP_CMD - escape for application specific command */
pub const CMD55: u8 = 0x37;
/// READ_OCR - read the OCR register of a card */
pub const CMD58: u8 = 0x3A;
/// CRC_ON_OFF - enable or disable CRC checking */
pub const CMD59: u8 = 0x3B;
/// SET_WR_BLK_ERASE_COUNT - Set the number of write blocks to be pre-erased
/// before writing */
pub const ACMD23: u8 = 0x17;
/// SD_SEND_OP_COMD - Sends host capacity support information and activates
/// the card's initialization process */
pub const ACMD41: u8 = 0x29;

//==============================================================================

/// status for card in the ready state
pub const R1_READY_STATE: u8 = 0x00;

/// status for card in the idle state
pub const R1_IDLE_STATE: u8 = 0x01;

/// an erase sequence was cleared before executing
pub const R1_ERASE_RESET: u8 = 0x02;

/// status bit for illegal command
pub const R1_ILLEGAL_COMMAND: u8 = 0x04;

/// the CRC check of the last command failed
pub const R1_COM_CRC_ERROR: u8 = 0x08;

/// an error in the sequence of erase commands occurred
pub const R1_ERASE_SEQUENCE_ERROR: u8 = 0x10;

/// a misaligned or out-of-range address was used
pub const R1_ADDRESS_ERROR: u8 = 0x20;

/// the command's argument was outside the allowed range
pub const R1_PARAMETER_ERROR: u8 = 0x40;

/// start data token for read or write single block*/
pub const DATA_START_BLOCK: u8 = 0xFE;

/// stop token for write multiple blocks*/
pub const STOP_TRAN_TOKEN: u8 = 0xFD;

/// start data token for write multiple blocks*/
pub const WRITE_MULTIPLE_TOKEN: u8 = 0xFC;

/// mask for data response tokens after a write block operation */
pub const DATA_RES_MASK: u8 = 0x1F;

/// write data accepted token */
pub const DATA_RES_ACCEPTED: u8 = 0x05;

/// write data rejected, CRC error */
pub const DATA_RES_CRC_ERROR: u8 = 0x0B;

/// write data rejected, write error */
pub const DATA_RES_WRITE_ERROR: u8 = 0x0D;

/// The CMD8 check pattern, echoed back by SD v2 cards.
pub const CMD8_CHECK_PATTERN: u32 = 0x1AA;

/// Host Capacity Support, the ACMD41 argument for SDHC-capable hosts.
pub const ACMD41_HCS: u32 = 0x4000_0000;

/// Power-up status and Card Capacity Status bits in the first OCR byte.
pub const OCR_POWER_UP_CCS: u8 = 0xC0;

/// Card Specific Data, version 1
#[derive(Default, Clone)]
pub struct CsdV1 {
    /// The 16-bytes of data in this Card Specific Data block
    pub data: [u8; 16],
}

/// Card Specific Data, version 2
#[derive(Default, Clone)]
pub struct CsdV2 {
    /// The 16-bytes of data in this Card Specific Data block
    pub data: [u8; 16],
}

/// Card Specific Data
pub enum Csd {
    /// A version 1 CSD
    V1(CsdV1),
    /// A version 2 CSD
    V2(CsdV2),
}

impl Csd {
    /// The raw register.
    pub fn data(&self) -> &[u8; 16] {
        match self {
            Csd::V1(csd) => &csd.data,
            Csd::V2(csd) => &csd.data,
        }
    }

    /// Returns the card capacity in bytes
    pub fn card_capacity_bytes(&self) -> u64 {
        match self {
            Csd::V1(csd) => csd.card_capacity_bytes(),
            Csd::V2(csd) => csd.card_capacity_bytes(),
        }
    }

    /// Returns the card capacity in 512-byte blocks
    pub fn card_capacity_blocks(&self) -> u32 {
        match self {
            Csd::V1(csd) => csd.card_capacity_blocks(),
            Csd::V2(csd) => csd.card_capacity_blocks(),
        }
    }

    /// Can a single block be erased, rather than a whole sector?
    pub fn erase_single_block_enabled(&self) -> bool {
        match self {
            Csd::V1(csd) => csd.erase_single_block_enabled(),
            Csd::V2(csd) => csd.erase_single_block_enabled(),
        }
    }

    /// Size of an erasable sector, in 512-byte blocks
    pub fn erase_sector_blocks(&self) -> u32 {
        let size = match self {
            Csd::V1(csd) => csd.erase_sector_size(),
            Csd::V2(csd) => csd.erase_sector_size(),
        };
        u32::from(size) + 1
    }

    /// Is the card permanently or temporarily write protected?
    pub fn write_protected(&self) -> bool {
        match self {
            Csd::V1(csd) => csd.permanent_write_protection() || csd.temporary_write_protection(),
            Csd::V2(csd) => csd.permanent_write_protection() || csd.temporary_write_protection(),
        }
    }
}

impl CsdV1 {
    /// Create a new, empty, CSD
    pub fn new() -> CsdV1 {
        CsdV1::default()
    }

    fn data(&self) -> &[u8; 16] {
        &self.data
    }

    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(data_read_access_time1, u8, 1, 0, 8);
    define_field!(data_read_access_time2, u8, 2, 0, 8);
    define_field!(max_data_transfer_rate, u8, 3, 0, 8);
    define_field!(card_command_classes, u16, [(4, 0, 8), (5, 4, 4)]);
    define_field!(read_block_length, u8, 5, 0, 4);
    define_field!(read_partial_blocks, bool, 6, 7);
    define_field!(write_block_misalignment, bool, 6, 6);
    define_field!(read_block_misalignment, bool, 6, 5);
    define_field!(dsr_implemented, bool, 6, 4);
    define_field!(device_size, u32, [(6, 0, 2), (7, 0, 8), (8, 6, 2)]);
    define_field!(device_size_multiplier, u8, [(9, 0, 2), (10, 7, 1)]);
    define_field!(erase_single_block_enabled, bool, 10, 6);
    define_field!(erase_sector_size, u8, [(10, 0, 6), (11, 7, 1)]);
    define_field!(write_protect_group_size, u8, 11, 0, 7);
    define_field!(write_protect_group_enable, bool, 12, 7);
    define_field!(write_speed_factor, u8, 12, 2, 3);
    define_field!(max_write_data_length, u8, [(12, 0, 2), (13, 6, 2)]);
    define_field!(write_partial_blocks, bool, 13, 5);
    define_field!(file_format, u8, 14, 2, 2);
    define_field!(temporary_write_protection, bool, 14, 4);
    define_field!(permanent_write_protection, bool, 14, 5);
    define_field!(copy_flag_set, bool, 14, 6);
    define_field!(file_format_group_set, bool, 14, 7);
    define_field!(crc, u8, 15, 1, 7);

    /// Returns the card capacity in bytes
    pub fn card_capacity_bytes(&self) -> u64 {
        let multiplier = self.device_size_multiplier() + self.read_block_length() + 2;
        (u64::from(self.device_size()) + 1) << multiplier
    }

    /// Returns the card capacity in 512-byte blocks
    pub fn card_capacity_blocks(&self) -> u32 {
        (self.card_capacity_bytes() / 512) as u32
    }
}

impl CsdV2 {
    /// Create a new, empty, CSD
    pub fn new() -> CsdV2 {
        CsdV2::default()
    }

    fn data(&self) -> &[u8; 16] {
        &self.data
    }

    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(data_read_access_time1, u8, 1, 0, 8);
    define_field!(data_read_access_time2, u8, 2, 0, 8);
    define_field!(max_data_transfer_rate, u8, 3, 0, 8);
    define_field!(card_command_classes, u16, [(4, 0, 8), (5, 4, 4)]);
    define_field!(read_block_length, u8, 5, 0, 4);
    define_field!(read_partial_blocks, bool, 6, 7);
    define_field!(write_block_misalignment, bool, 6, 6);
    define_field!(read_block_misalignment, bool, 6, 5);
    define_field!(dsr_implemented, bool, 6, 4);
    define_field!(device_size, u32, [(7, 0, 6), (8, 0, 8), (9, 0, 8)]);
    define_field!(erase_single_block_enabled, bool, 10, 6);
    define_field!(erase_sector_size, u8, [(10, 0, 6), (11, 7, 1)]);
    define_field!(write_protect_group_size, u8, 11, 0, 7);
    define_field!(write_protect_group_enable, bool, 12, 7);
    define_field!(write_speed_factor, u8, 12, 2, 3);
    define_field!(max_write_data_length, u8, [(12, 0, 2), (13, 6, 2)]);
    define_field!(write_partial_blocks, bool, 13, 5);
    define_field!(file_format, u8, 14, 2, 2);
    define_field!(temporary_write_protection, bool, 14, 4);
    define_field!(permanent_write_protection, bool, 14, 5);
    define_field!(copy_flag_set, bool, 14, 6);
    define_field!(file_format_group_set, bool, 14, 7);
    define_field!(crc, u8, 15, 1, 7);

    /// Returns the card capacity in bytes
    pub fn card_capacity_bytes(&self) -> u64 {
        (u64::from(self.device_size()) + 1) * 512 * 1024
    }

    /// Returns the card capacity in 512-byte blocks, saturating at
    /// `u32::MAX`. The largest C_SIZE describes exactly 2^32 blocks.
    pub fn card_capacity_blocks(&self) -> u32 {
        let blocks = (u64::from(self.device_size()) + 1) * 1024;
        blocks.min(u64::from(u32::MAX)) as u32
    }
}

/// Perform the 7-bit CRC used on the SD card
pub fn crc7(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for mut d in data.iter().cloned() {
        for _bit in 0..8 {
            crc <<= 1;
            if ((d & 0x80) ^ (crc & 0x80)) != 0 {
                crc ^= 0x09;
            }
            d <<= 1;
        }
    }
    (crc << 1) | 1
}

/// Perform the X25 CRC calculation, as used for data blocks.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0u16;
    for &byte in data {
        crc = ((crc >> 8) & 0xFF) | (crc << 8);
        crc ^= u16::from(byte);
        crc ^= (crc & 0xFF) >> 4;
        crc ^= crc << 12;
        crc ^= (crc & 0xFF) << 5;
    }
    crc
}

#[cfg(test)]
mod test {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_crc7() {
        const DATA: [u8; 15] = hex!("00 26 00 32 5F 5A 83 AE FE FB CF FF 92 80 40");
        assert_eq!(crc7(&DATA), 0xDF);
    }

    #[test]
    fn command_frame_crc7() {
        assert_eq!(crc7(&[0x40, 0, 0, 0, 0]), 0x95);
        assert_eq!(crc7(&[0x48, 0x00, 0x00, 0x01, 0xAA]), 0x87);
    }

    #[test]
    fn test_crc16() {
        const DATA: [u8; 16] = hex!("00 00 5E 00 32 5B 59 00 00 E8 37 7F 80 0A 40 00");
        assert_eq!(crc16(&DATA), 0x5989);
        assert_eq!(crc16(&[0xFF; 512]), 0x7FA1);
    }

    #[test]
    fn test_csdv1b() {
        const EXAMPLE: CsdV1 = CsdV1 {
            data: hex!("00 26 00 32 5F 5A 83 AE FE FB CF FF 92 80 40 DF"),
        };

        // CSD Structure: describes version of CSD structure
        // 0b00 [Interpreted: Version 1.0]
        assert_eq!(EXAMPLE.csd_ver(), 0x00);

        // Data Read Access Time 1
        assert_eq!(EXAMPLE.data_read_access_time1(), 0x26);

        // Data Read Access Time 2
        assert_eq!(EXAMPLE.data_read_access_time2(), 0x00);

        // Max Data Transfer Rate: 0x32 [Interpreted: 25MHz]
        assert_eq!(EXAMPLE.max_data_transfer_rate(), 0x32);

        // Card Command Classes: 0x5F5
        assert_eq!(EXAMPLE.card_command_classes(), 0x5F5);

        // Max Read Data Block Length: 0xA [Interpreted: 1024 bytes]
        assert_eq!(EXAMPLE.read_block_length(), 0x0A);

        assert!(EXAMPLE.read_partial_blocks());
        assert!(!EXAMPLE.write_block_misalignment());
        assert!(!EXAMPLE.read_block_misalignment());
        assert!(!EXAMPLE.dsr_implemented());

        // Device Size: 0xEBB
        assert_eq!(EXAMPLE.device_size(), 0xEBB);

        // Device Size Multiplier: 0x07 [Interpreted: x512]
        assert_eq!(EXAMPLE.device_size_multiplier(), 0x07);

        assert!(EXAMPLE.erase_single_block_enabled());

        // Erase Sector Size: 0x1F [Interpreted: 32 blocks]
        assert_eq!(EXAMPLE.erase_sector_size(), 0x1F);

        assert!(!EXAMPLE.permanent_write_protection());
        assert!(!EXAMPLE.temporary_write_protection());

        assert_eq!(EXAMPLE.crc(), 0x6F);

        // Card capacity 1,977,614,336 bytes [Interpreted: 1.84 GiB]
        assert_eq!(EXAMPLE.card_capacity_bytes(), 1_977_614_336);
        assert_eq!(Csd::V1(EXAMPLE).erase_sector_blocks(), 32);
    }

    #[test]
    fn test_csdv2() {
        const EXAMPLE: CsdV2 = CsdV2 {
            data: hex!("40 0E 00 32 5B 59 00 00 E8 37 7F 80 0A 40 00 23"),
        };

        // CSD Structure: describes version of CSD structure
        // 0b01 [Interpreted: Version 2.0 SDHC]
        assert_eq!(EXAMPLE.csd_ver(), 0x01);

        // Data Read Access Time 1: 0x0E [Interpreted: 1 ms]
        assert_eq!(EXAMPLE.data_read_access_time1(), 0x0E);

        // Max Data Transfer Rate: 0x32 [Interpreted: 25MHz]
        assert_eq!(EXAMPLE.max_data_transfer_rate(), 0x32);

        // Card Command Classes: 0x5B5
        assert_eq!(EXAMPLE.card_command_classes(), 0x5B5);

        // Max Read Data Block Length: 0x9 [Interpreted: 512 bytes]
        assert_eq!(EXAMPLE.read_block_length(), 0x09);

        // Device Size: 0x00E837
        assert_eq!(EXAMPLE.device_size(), 0x00E837);

        assert!(EXAMPLE.erase_single_block_enabled());

        // Erase Sector Size: 0x7F [Interpreted: 128 blocks]
        assert_eq!(EXAMPLE.erase_sector_size(), 0x7F);

        assert!(!EXAMPLE.permanent_write_protection());
        assert!(!EXAMPLE.temporary_write_protection());

        // Card capacity 31,167,873,024 bytes [Interpreted: 29.03 GiB]
        assert_eq!(EXAMPLE.card_capacity_bytes(), 31_167_873_024);
        assert_eq!(EXAMPLE.card_capacity_blocks(), 60_874_752);
    }

    #[test]
    fn largest_csdv2_capacity_saturates() {
        let csd = CsdV2 {
            data: hex!("40 0E 00 32 5B 59 00 3F FF FF 7F 80 0A 40 00 00"),
        };
        assert_eq!(csd.device_size(), 0x3F_FFFF);
        assert_eq!(csd.card_capacity_bytes(), 2 * 1024 * 1024 * 1024 * 1024);
        assert_eq!(csd.card_capacity_blocks(), u32::MAX);
    }
}
