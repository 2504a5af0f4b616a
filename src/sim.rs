//! embedded-sdc-spi - A simulated SD card
//!
//! [`SimulatedCard`] is an [`SpiMaster`] with an SD card on the other end of
//! the bus, backed by a byte slice. It speaks enough of the SPI-mode
//! protocol to bring the card up, read its CSD, and read, write and erase
//! blocks. Command CRC7 and data CRC16 are checked.
//!
//! It exists for tests and demos on a host; there's no timing model.

use crate::platform::{SpiConfig, SpiMaster};
use crate::sdmmc_proto::*;
use crate::Block;

/// Which generation of card to pretend to be.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SimCardKind {
    /// SD v1: no CMD8, byte addressed, CSD v1
    Sd1,
    /// SD v2 standard capacity: byte addressed, CSD v1
    Sd2,
    /// SD v2 high capacity: block addressed, CSD v2
    Sdhc,
}

/// How the simulated card behaves.
#[derive(Debug, Copy, Clone)]
pub struct SimOptions {
    pub kind: SimCardKind,
    /// Report temporary write protection in the CSD and refuse writes.
    pub write_protected: bool,
    /// Does the card accept CMD59?
    pub crc_supported: bool,
    /// How many ACMD41s are answered with "idle" before the card is ready.
    pub acmd41_busy_polls: u32,
    /// Send a wrong CRC16 with every data block.
    pub corrupt_read_crc: bool,
    /// Refuse any clock faster than this.
    pub max_speed: Option<u32>,
    /// Clear ERASE_BLK_EN, so CMD38 wipes every erase sector it touches.
    pub erase_sectors_only: bool,
}

impl Default for SimOptions {
    fn default() -> Self {
        SimOptions {
            kind: SimCardKind::Sdhc,
            write_protected: false,
            crc_supported: true,
            acmd41_busy_polls: 2,
            corrupt_read_crc: false,
            max_speed: None,
            erase_sectors_only: false,
        }
    }
}

/// The error every failed bus operation returns.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SimBusError {
    /// Failure injected with [`SimulatedCard::fail_after`]
    Injected,
    /// `exchange` was given buffers of different lengths
    LengthMismatch,
    /// The clock rate is above [`SimOptions::max_speed`]
    SpeedRefused,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Phase {
    /// Waiting for, or collecting, a command frame
    Command,
    /// Streaming blocks until CMD12
    MultiRead { next: u32 },
    /// Waiting for a start token
    WriteWait { multi: bool, block: u32 },
    /// Collecting a data block and its CRC
    WriteData { multi: bool, block: u32, pos: usize },
}

const OUT_LEN: usize = 530;
/// SECTOR_SIZE + 1 in the CSD
const ERASE_SECTOR_BLOCKS: u32 = 128;
const PACKET_LEN: usize = Block::LEN + 2;

/// An SD card in SPI mode, simulated over a byte slice.
pub struct SimulatedCard<'a> {
    memory: &'a mut [u8],
    options: SimOptions,
    idle_byte: u8,
    speed: u32,
    speed_changes: u32,
    selected: bool,
    initialized: bool,
    app_cmd: bool,
    acmd41_count: u32,
    phase: Phase,
    cmd: [u8; 6],
    cmd_len: usize,
    data: [u8; PACKET_LEN],
    out: [u8; OUT_LEN],
    out_pos: usize,
    out_len: usize,
    erase_start: Option<u32>,
    erase_end: Option<u32>,
    bus_ops: u32,
    fail_at: Option<u32>,
    commands: u32,
    last_command: Option<u8>,
}

impl<'a> SimulatedCard<'a> {
    pub fn new(memory: &'a mut [u8], options: SimOptions) -> Self {
        SimulatedCard {
            memory,
            options,
            idle_byte: 0xFF,
            speed: 0,
            speed_changes: 0,
            selected: false,
            initialized: false,
            app_cmd: false,
            acmd41_count: 0,
            phase: Phase::Command,
            cmd: [0; 6],
            cmd_len: 0,
            data: [0; PACKET_LEN],
            out: [0xFF; OUT_LEN],
            out_pos: 0,
            out_len: 0,
            erase_start: None,
            erase_end: None,
            bus_ops: 0,
            fail_at: None,
            commands: 0,
            last_command: None,
        }
    }

    /// Every bus operation after the next `ops` fails. `None` heals the bus.
    pub fn fail_after(&mut self, ops: Option<u32>) {
        self.fail_at = ops.map(|n| self.bus_ops + n);
    }

    /// Change the write-protect flag.
    pub fn set_write_protected(&mut self, write_protected: bool) {
        self.options.write_protected = write_protected;
    }

    /// The clock rate last applied, in Hz.
    pub fn speed(&self) -> u32 {
        self.speed
    }

    /// How many times the clock rate was changed, refused or not.
    pub fn speed_changes(&self) -> u32 {
        self.speed_changes
    }

    /// How many bus operations have been attempted.
    pub fn bus_ops(&self) -> u32 {
        self.bus_ops
    }

    /// How many complete command frames the card has seen.
    pub fn commands(&self) -> u32 {
        self.commands
    }

    /// The index of the last command frame.
    pub fn last_command(&self) -> Option<u8> {
        self.last_command
    }

    pub fn is_selected(&self) -> bool {
        self.selected
    }

    /// Has ACMD41 finished?
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Number of whole blocks in the backing memory.
    pub fn num_blocks(&self) -> u32 {
        (self.memory.len() / Block::LEN) as u32
    }

    fn tick(&mut self) -> Result<(), SimBusError> {
        self.bus_ops += 1;
        match self.fail_at {
            Some(n) if self.bus_ops > n => Err(SimBusError::Injected),
            _ => Ok(()),
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        if self.out_pos > 0 {
            self.out.copy_within(self.out_pos..self.out_len, 0);
            self.out_len -= self.out_pos;
            self.out_pos = 0;
        }
        let end = (self.out_len + bytes.len()).min(OUT_LEN);
        let n = end - self.out_len;
        self.out[self.out_len..end].copy_from_slice(&bytes[..n]);
        self.out_len = end;
    }

    fn pop(&mut self) -> u8 {
        if self.out_pos == self.out_len {
            if let Phase::MultiRead { next } = self.phase {
                self.phase = Phase::MultiRead { next: next + 1 };
                self.push_block(next);
            }
        }
        if self.out_pos < self.out_len {
            let b = self.out[self.out_pos];
            self.out_pos += 1;
            b
        } else {
            0xFF
        }
    }

    fn clear_out(&mut self) {
        self.out_pos = 0;
        self.out_len = 0;
    }

    /// One byte each way.
    fn clock(&mut self, input: u8) -> u8 {
        if !self.selected {
            return 0xFF;
        }
        let output = self.pop();
        self.consume(input);
        output
    }

    fn consume(&mut self, input: u8) {
        let is_command_start = (input & 0xC0) == 0x40;
        match self.phase {
            Phase::Command => {
                if self.cmd_len == 0 && !is_command_start {
                    return;
                }
                self.cmd[self.cmd_len] = input;
                self.cmd_len += 1;
                if self.cmd_len == self.cmd.len() {
                    self.cmd_len = 0;
                    self.execute();
                }
            }
            Phase::MultiRead { .. } => {
                if is_command_start {
                    self.clear_out();
                    self.phase = Phase::Command;
                    self.cmd[0] = input;
                    self.cmd_len = 1;
                }
            }
            Phase::WriteWait { multi, block } => match input {
                DATA_START_BLOCK if !multi => {
                    self.phase = Phase::WriteData {
                        multi,
                        block,
                        pos: 0,
                    }
                }
                WRITE_MULTIPLE_TOKEN if multi => {
                    self.phase = Phase::WriteData {
                        multi,
                        block,
                        pos: 0,
                    }
                }
                STOP_TRAN_TOKEN if multi => {
                    self.phase = Phase::Command;
                    self.push(&[0x00, 0x00]);
                }
                _ if is_command_start => {
                    self.phase = Phase::Command;
                    self.cmd[0] = input;
                    self.cmd_len = 1;
                }
                _ => {}
            },
            Phase::WriteData { multi, block, pos } => {
                self.data[pos] = input;
                let pos = pos + 1;
                if pos < PACKET_LEN {
                    self.phase = Phase::WriteData { multi, block, pos };
                    return;
                }
                let response = self.store_block(block);
                self.push(&[response, 0x00, 0x00]);
                self.phase = if multi {
                    Phase::WriteWait {
                        multi,
                        block: block + 1,
                    }
                } else {
                    Phase::Command
                };
            }
        }
    }

    fn store_block(&mut self, block: u32) -> u8 {
        let (contents, crc) = self.data.split_at(Block::LEN);
        if crc16(contents).to_be_bytes() != [crc[0], crc[1]] {
            return DATA_RES_CRC_ERROR;
        }
        if self.options.write_protected || block >= self.num_blocks() {
            return DATA_RES_WRITE_ERROR;
        }
        let start = block as usize * Block::LEN;
        self.memory[start..start + Block::LEN].copy_from_slice(contents);
        DATA_RES_ACCEPTED
    }

    fn push_packet(&mut self, contents: &[u8]) {
        let mut crc = crc16(contents);
        if self.options.corrupt_read_crc {
            crc = !crc;
        }
        self.push(&[0xFF, DATA_START_BLOCK]);
        self.push(contents);
        self.push(&crc.to_be_bytes());
    }

    fn push_block(&mut self, block: u32) {
        if block >= self.num_blocks() {
            // Data error token, out of range
            self.push(&[0xFF, 0x08]);
            return;
        }
        let start = block as usize * Block::LEN;
        let mut contents = [0u8; Block::LEN];
        contents.copy_from_slice(&self.memory[start..start + Block::LEN]);
        self.push_packet(&contents);
    }

    /// The block a data command argument refers to, if it is valid.
    fn block_for(&self, arg: u32) -> Option<u32> {
        let block = match self.options.kind {
            SimCardKind::Sdhc => arg,
            SimCardKind::Sd1 | SimCardKind::Sd2 => {
                if arg % Block::LEN_U32 != 0 {
                    return None;
                }
                arg / Block::LEN_U32
            }
        };
        if block < self.num_blocks() {
            Some(block)
        } else {
            None
        }
    }

    fn r1(&self) -> u8 {
        if self.initialized {
            R1_READY_STATE
        } else {
            R1_IDLE_STATE
        }
    }

    fn csd(&self) -> [u8; 16] {
        let len = self.memory.len() as u64;
        let mut d = [0u8; 16];
        d[1] = 0x0E;
        d[3] = 0x32;
        d[4] = 0x5B;
        // Command classes low nibble, READ_BL_LEN = 9
        d[5] = 0x59;
        match self.options.kind {
            SimCardKind::Sdhc => {
                d[0] = 0x40;
                let c_size = (len / (512 * 1024)).saturating_sub(1) as u32;
                d[7] = ((c_size >> 16) & 0x3F) as u8;
                d[8] = (c_size >> 8) as u8;
                d[9] = c_size as u8;
            }
            SimCardKind::Sd1 | SimCardKind::Sd2 => {
                let mult: u32 = if len <= 8 * 1024 * 1024 { 0 } else { 7 };
                let unit = 1u64 << (mult + 9 + 2);
                let c_size = ((len / unit).saturating_sub(1) as u32).min(0xFFF);
                d[6] = ((c_size >> 10) & 0x03) as u8;
                d[7] = (c_size >> 2) as u8;
                d[8] = ((c_size & 0x03) << 6) as u8;
                d[9] = ((mult >> 1) & 0x03) as u8;
                d[10] = ((mult & 0x01) << 7) as u8;
            }
        }
        if !self.options.erase_sectors_only {
            // ERASE_BLK_EN
            d[10] |= 0x40;
        }
        // SECTOR_SIZE = 0x7F
        d[10] |= 0x3F;
        d[11] |= 0x80;
        if self.options.write_protected {
            d[14] |= 0x10;
        }
        d[15] = crc7(&d[..15]);
        d
    }

    fn execute(&mut self) {
        let frame = self.cmd;
        let command = frame[0] & 0x3F;
        let arg = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
        self.commands += 1;
        self.last_command = Some(command);

        if crc7(&frame[..5]) != frame[5] {
            self.push(&[0xFF, self.r1() | R1_COM_CRC_ERROR]);
            return;
        }

        let app_cmd = core::mem::replace(&mut self.app_cmd, false);

        if command == CMD0 {
            self.initialized = false;
            self.acmd41_count = 0;
            self.phase = Phase::Command;
            self.push(&[0xFF, R1_IDLE_STATE]);
            return;
        }

        let needs_init = !matches!(command, CMD8 | CMD55 | CMD58 | CMD59)
            && !(app_cmd && command == ACMD41);
        if needs_init && !self.initialized {
            self.push(&[0xFF, R1_IDLE_STATE | R1_ILLEGAL_COMMAND]);
            return;
        }

        match (app_cmd, command) {
            (true, ACMD41) => {
                self.acmd41_count += 1;
                if self.acmd41_count > self.options.acmd41_busy_polls {
                    self.initialized = true;
                }
                self.push(&[0xFF, self.r1()]);
            }
            (true, ACMD23) => {
                self.push(&[0xFF, self.r1()]);
            }
            (_, CMD55) => {
                self.app_cmd = true;
                self.push(&[0xFF, self.r1()]);
            }
            (_, CMD8) => {
                if self.options.kind == SimCardKind::Sd1 {
                    self.push(&[0xFF, R1_ILLEGAL_COMMAND | R1_IDLE_STATE]);
                } else {
                    self.push(&[0xFF, self.r1(), 0x00, 0x00, frame[3] & 0x0F, frame[4]]);
                }
            }
            (_, CMD59) => {
                if self.options.crc_supported {
                    self.push(&[0xFF, self.r1()]);
                } else {
                    self.push(&[0xFF, self.r1() | R1_ILLEGAL_COMMAND]);
                }
            }
            (_, CMD58) => {
                let ocr0 = match self.options.kind {
                    SimCardKind::Sdhc if self.initialized => OCR_POWER_UP_CCS,
                    _ if self.initialized => 0x80,
                    _ => 0x00,
                };
                self.push(&[0xFF, self.r1(), ocr0, 0xFF, 0x80, 0x00]);
            }
            (_, CMD9) => {
                let csd = self.csd();
                self.push(&[0xFF, R1_READY_STATE]);
                self.push_packet(&csd);
            }
            (_, CMD13) => {
                self.push(&[0xFF, R1_READY_STATE, 0x00]);
            }
            (_, CMD12) => {
                // Stuff byte, then R1
                self.push(&[0xFF, R1_READY_STATE]);
            }
            (_, CMD17) => match self.block_for(arg) {
                Some(block) => {
                    self.push(&[0xFF, R1_READY_STATE]);
                    self.push_block(block);
                }
                None => self.push(&[0xFF, R1_ADDRESS_ERROR]),
            },
            (_, CMD18) => match self.block_for(arg) {
                Some(block) => {
                    self.push(&[0xFF, R1_READY_STATE]);
                    self.phase = Phase::MultiRead { next: block };
                }
                None => self.push(&[0xFF, R1_ADDRESS_ERROR]),
            },
            (_, CMD24) | (_, CMD25) => match self.block_for(arg) {
                Some(block) => {
                    self.push(&[0xFF, R1_READY_STATE]);
                    self.phase = Phase::WriteWait {
                        multi: command == CMD25,
                        block,
                    };
                }
                None => self.push(&[0xFF, R1_ADDRESS_ERROR]),
            },
            (_, CMD32) => {
                self.erase_start = self.block_for(arg);
                self.push(&[0xFF, R1_READY_STATE]);
            }
            (_, CMD33) => {
                self.erase_end = self.block_for(arg);
                self.push(&[0xFF, R1_READY_STATE]);
            }
            (_, CMD38) => match (self.erase_start.take(), self.erase_end.take()) {
                (Some(mut start), Some(mut end))
                    if start <= end && !self.options.write_protected =>
                {
                    if self.options.erase_sectors_only {
                        start -= start % ERASE_SECTOR_BLOCKS;
                        end = (end - end % ERASE_SECTOR_BLOCKS + ERASE_SECTOR_BLOCKS - 1)
                            .min(self.num_blocks() - 1);
                    }
                    let from = start as usize * Block::LEN;
                    let to = (end as usize + 1) * Block::LEN;
                    for b in self.memory[from..to].iter_mut() {
                        *b = 0x00;
                    }
                    // R1b: R1 then busy
                    self.push(&[0xFF, R1_READY_STATE, 0x00, 0x00]);
                }
                _ => self.push(&[0xFF, R1_ERASE_SEQUENCE_ERROR]),
            },
            _ => {
                self.push(&[0xFF, self.r1() | R1_ILLEGAL_COMMAND]);
            }
        }
    }
}

impl<'a> core::fmt::Debug for SimulatedCard<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SimulatedCard")
            .field("kind", &self.options.kind)
            .field("num_blocks", &self.num_blocks())
            .field("selected", &self.selected)
            .field("initialized", &self.initialized)
            .field("speed", &self.speed)
            .finish()
    }
}

impl<'a> SpiMaster for SimulatedCard<'a> {
    type Error = SimBusError;

    fn configure(&mut self, config: &SpiConfig) -> Result<(), Self::Error> {
        self.tick()?;
        self.idle_byte = config.default_write_data;
        self.speed = config.speed;
        Ok(())
    }

    fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), Self::Error> {
        self.tick()?;
        if tx.len() != rx.len() {
            return Err(SimBusError::LengthMismatch);
        }
        for (out, inp) in tx.iter().zip(rx.iter_mut()) {
            *inp = self.clock(*out);
        }
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), Self::Error> {
        self.tick()?;
        for &b in data {
            self.clock(b);
        }
        Ok(())
    }

    fn read(&mut self, data: &mut [u8]) -> Result<(), Self::Error> {
        self.tick()?;
        for b in data.iter_mut() {
            *b = self.clock(self.idle_byte);
        }
        Ok(())
    }

    fn set_speed(&mut self, hz: u32) -> Result<(), Self::Error> {
        self.tick()?;
        self.speed_changes += 1;
        match self.options.max_speed {
            Some(max) if hz > max => Err(SimBusError::SpeedRefused),
            _ => {
                self.speed = hz;
                Ok(())
            }
        }
    }

    fn select(&mut self) -> Result<(), Self::Error> {
        self.tick()?;
        self.selected = true;
        Ok(())
    }

    fn deselect(&mut self) -> Result<(), Self::Error> {
        self.tick()?;
        self.selected = false;
        self.cmd_len = 0;
        self.phase = Phase::Command;
        self.clear_out();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(command: u8, arg: u32) -> [u8; 6] {
        let mut buf = [
            0x40 | command,
            (arg >> 24) as u8,
            (arg >> 16) as u8,
            (arg >> 8) as u8,
            arg as u8,
            0,
        ];
        buf[5] = crc7(&buf[..5]);
        buf
    }

    fn command(card: &mut SimulatedCard, command: u8, arg: u32, reply: &mut [u8]) {
        card.write(&frame(command, arg)).unwrap();
        card.read(reply).unwrap();
    }

    #[test]
    fn ignores_bus_while_deselected() {
        let mut memory = vec![0u8; 4096];
        let mut card = SimulatedCard::new(&mut memory, SimOptions::default());
        card.write(&frame(CMD0, 0)).unwrap();
        assert_eq!(card.commands(), 0);
    }

    #[test]
    fn cmd0_then_bad_crc() {
        let mut memory = vec![0u8; 4096];
        let mut card = SimulatedCard::new(&mut memory, SimOptions::default());
        card.select().unwrap();
        let mut reply = [0u8; 2];
        command(&mut card, CMD0, 0, &mut reply);
        assert_eq!(reply, [0xFF, R1_IDLE_STATE]);

        let mut bad = frame(CMD8, 0x1AA);
        bad[5] ^= 0x02;
        card.write(&bad).unwrap();
        card.read(&mut reply).unwrap();
        assert_eq!(reply, [0xFF, R1_IDLE_STATE | R1_COM_CRC_ERROR]);
    }

    #[test]
    fn data_commands_need_init() {
        let mut memory = vec![0u8; 4096];
        let mut card = SimulatedCard::new(&mut memory, SimOptions::default());
        card.select().unwrap();
        let mut reply = [0u8; 2];
        command(&mut card, CMD17, 0, &mut reply);
        assert_eq!(reply[1], R1_IDLE_STATE | R1_ILLEGAL_COMMAND);
    }

    #[test]
    fn csd_encodes_capacity() {
        use crate::sdmmc_proto::{CsdV1, CsdV2};

        let mut memory = vec![0u8; 1024 * 1024];
        let card = SimulatedCard::new(&mut memory, SimOptions::default());
        let csd = CsdV2 { data: card.csd() };
        assert_eq!(csd.csd_ver(), 1);
        assert_eq!(csd.card_capacity_bytes(), 1024 * 1024);
        assert_eq!(csd.crc(), crc7(&csd.data[..15]) >> 1);

        let mut memory = vec![0u8; 64 * 1024];
        let options = SimOptions {
            kind: SimCardKind::Sd1,
            write_protected: true,
            ..Default::default()
        };
        let card = SimulatedCard::new(&mut memory, options);
        let csd = CsdV1 { data: card.csd() };
        assert_eq!(csd.csd_ver(), 0);
        assert_eq!(csd.card_capacity_bytes(), 64 * 1024);
        assert!(csd.temporary_write_protection());
        assert!(csd.erase_single_block_enabled());
    }

    #[test]
    fn erase_without_erase_blk_en_takes_whole_sectors() {
        use crate::sdmmc_proto::CsdV2;

        let mut memory = vec![0xEEu8; 1024 * 1024];
        let options = SimOptions {
            erase_sectors_only: true,
            acmd41_busy_polls: 0,
            ..Default::default()
        };
        let mut card = SimulatedCard::new(&mut memory, options);
        let csd = CsdV2 { data: card.csd() };
        assert!(!csd.erase_single_block_enabled());
        assert_eq!(csd.erase_sector_size(), 0x7F);

        card.select().unwrap();
        let mut reply = [0u8; 2];
        command(&mut card, CMD55, 0, &mut reply);
        command(&mut card, ACMD41, 0x4000_0000, &mut reply);
        assert!(card.is_initialized());
        command(&mut card, CMD32, 130, &mut reply);
        command(&mut card, CMD33, 131, &mut reply);
        let mut reply = [0u8; 4];
        command(&mut card, CMD38, 0, &mut reply);
        assert_eq!(reply[1], R1_READY_STATE);
        card.deselect().unwrap();
        drop(card);
        assert_eq!(memory[128 * 512 - 1], 0xEE);
        assert!(memory[128 * 512..256 * 512].iter().all(|&b| b == 0x00));
        assert_eq!(memory[256 * 512], 0xEE);
    }

    #[test]
    fn injected_failures() {
        let mut memory = vec![0u8; 4096];
        let mut card = SimulatedCard::new(&mut memory, SimOptions::default());
        card.fail_after(Some(1));
        assert!(card.select().is_ok());
        assert_eq!(card.select(), Err(SimBusError::Injected));
        card.fail_after(None);
        assert!(card.select().is_ok());
    }
}
