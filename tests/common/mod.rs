//! A simulated SD card sitting behind a [`Transport`] and a chip select pin,
//! plus a byte-scripted transport for poking at the command layer directly.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::rc::Rc;

use embedded_hal::blocking::delay::DelayUs;
use embedded_hal::digital::v2::OutputPin;
use hex_literal::hex;

use sdspi::sdmmc_proto::*;
use sdspi::{Initialized, NotInit, SdMmcSpi, SpiConfig, Transport, BLOCK_SIZE};

/// A real SDHC register: 7530 * 1024 sectors.
pub const CSD_V2: [u8; 16] = hex!("40 0E 00 32 5B 59 00 00 1D 69 7F 80 0A 40 00 8B");
pub const CSD_V2_SECTORS: u32 = 7530 * 1024;

/// A real SDSC register: (0xB23 + 1) << 9 sectors.
pub const CSD_V1: [u8; 16] = hex!("00 26 00 32 5F 59 83 C8 AD DB CF FF D2 40 40 A5");
pub const CSD_V1_SECTORS: u32 = (0xB23 + 1) << 9;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// What a block holds before anyone writes to it. Block 0 is `0, 1, 2, ..`.
pub fn pattern(block: u32, i: usize) -> u8 {
    (i + block as usize * 7) as u8
}

pub fn pattern_block(block: u32) -> Vec<u8> {
    (0..BLOCK_SIZE).map(|i| pattern(block, i)).collect()
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Kind {
    V1,
    V2,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Select,
    Deselect,
    Command { index: u8, arg: u32 },
    /// A data start token written by the host
    DataToken(u8),
    StopToken,
    /// A data block sent to the host
    BlockSent(u32),
    /// A data block accepted from the host
    BlockStored(u32),
}

/// Misbehaviour to inject.
#[derive(Debug, Clone)]
pub struct Faults {
    /// Never answer a command
    pub silent: bool,
    /// Never answer these command indices
    pub ignore: Vec<u8>,
    /// Replace the SEND_IF_COND R1
    pub cmd8_response: Option<u8>,
    /// ACMD41 rounds answered with "still idle"
    pub acmd41_busy_rounds: u32,
    /// R1 for SEND_CSD
    pub csd_status: u8,
    /// R1 for SET_BLOCKLEN
    pub cmd16_status: u8,
    /// R1 for the read and write address commands
    pub address_status: u8,
    /// Accept read commands but never send the data
    pub withhold_data: bool,
    /// Answer every data block with "write error"
    pub reject_writes: bool,
    /// Never come out of busy after a write
    pub busy_forever: bool,
    /// Idle bytes before every R1
    pub ncr: usize,
}

impl Default for Faults {
    fn default() -> Self {
        Faults {
            silent: false,
            ignore: Vec::new(),
            cmd8_response: None,
            acmd41_busy_rounds: 0,
            csd_status: 0,
            cmd16_status: 0,
            address_status: 0,
            withhold_data: false,
            reject_writes: false,
            busy_forever: false,
            ncr: 1,
        }
    }
}

enum WriteState {
    Idle,
    ExpectToken { block: u32, multi: bool },
    Payload { block: u32, multi: bool, data: Vec<u8> },
    Crc { block: u32, multi: bool, data: Vec<u8>, left: u8 },
}

pub struct SimState {
    kind: Kind,
    csd: [u8; 16],
    faults: Faults,
    cs_asserted: bool,
    out: VecDeque<u8>,
    frame: Vec<u8>,
    idle: bool,
    app_cmd: bool,
    streaming: Option<u32>,
    write: WriteState,
    stuck_busy: bool,
    blocks: HashMap<u32, Vec<u8>>,
    events: Vec<Event>,
    baudrates: Vec<u32>,
    bus_ops: usize,
    bytes_read: usize,
    bad_crc: usize,
}

impl SimState {
    fn cdv(&self) -> u32 {
        match self.kind {
            Kind::V1 => 512,
            Kind::V2 => 1,
        }
    }

    fn base_r1(&self) -> u8 {
        if self.idle {
            0x01
        } else {
            0x00
        }
    }

    fn block_data(&self, block: u32) -> Vec<u8> {
        self.blocks
            .get(&block)
            .cloned()
            .unwrap_or_else(|| pattern_block(block))
    }

    fn respond(&mut self, bytes: &[u8]) {
        for _ in 0..self.faults.ncr {
            self.out.push_back(0xFF);
        }
        self.out.extend(bytes.iter().cloned());
    }

    fn queue_block(&mut self, block: u32) {
        self.events.push(Event::BlockSent(block));
        let data = self.block_data(block);
        self.out.push_back(DATA_START_BLOCK);
        self.out.extend(data);
        self.out.extend([0x12u8, 0x34].iter().cloned());
    }

    /// The card's side of one clock byte while the host is reading.
    fn clock_out(&mut self) -> u8 {
        if self.out.is_empty() {
            if let Some(block) = self.streaming {
                self.streaming = Some(block + 1);
                self.queue_block(block);
            }
        }
        match self.out.pop_front() {
            Some(b) => b,
            None if self.stuck_busy => 0x00,
            None => 0xFF,
        }
    }

    /// A byte arriving from the host.
    fn clock_in(&mut self, byte: u8) {
        match std::mem::replace(&mut self.write, WriteState::Idle) {
            WriteState::Idle => self.command_byte(byte),
            WriteState::ExpectToken { block, multi } => match byte {
                DATA_START_BLOCK if !multi => {
                    self.events.push(Event::DataToken(byte));
                    self.write = WriteState::Payload {
                        block,
                        multi,
                        data: Vec::with_capacity(BLOCK_SIZE),
                    };
                }
                WRITE_MULTIPLE_TOKEN if multi => {
                    self.events.push(Event::DataToken(byte));
                    self.write = WriteState::Payload {
                        block,
                        multi,
                        data: Vec::with_capacity(BLOCK_SIZE),
                    };
                }
                STOP_TRAN_TOKEN if multi => {
                    self.events.push(Event::StopToken);
                    self.out.extend([0xFFu8, 0x00, 0x00].iter().cloned());
                }
                b if b & 0xC0 == 0x40 => self.command_byte(b),
                _ => self.write = WriteState::ExpectToken { block, multi },
            },
            WriteState::Payload {
                block,
                multi,
                mut data,
            } => {
                data.push(byte);
                self.write = if data.len() == BLOCK_SIZE {
                    WriteState::Crc {
                        block,
                        multi,
                        data,
                        left: 2,
                    }
                } else {
                    WriteState::Payload { block, multi, data }
                };
            }
            WriteState::Crc {
                block,
                multi,
                data,
                left,
            } => {
                if left > 1 {
                    self.write = WriteState::Crc {
                        block,
                        multi,
                        data,
                        left: left - 1,
                    };
                } else {
                    self.finish_block(block, multi, data);
                }
            }
        }
    }

    fn finish_block(&mut self, block: u32, multi: bool, data: Vec<u8>) {
        if self.faults.reject_writes {
            // 0b110 in bits 3:1 - write error
            self.out.push_back(0x0D);
            if multi {
                // Waits for the host to end the transfer
                self.write = WriteState::ExpectToken { block, multi };
            }
            return;
        }
        self.blocks.insert(block, data);
        self.events.push(Event::BlockStored(block));
        self.out.push_back(0xE5);
        if self.faults.busy_forever {
            self.stuck_busy = true;
        } else {
            self.out.extend([0x00u8, 0x00].iter().cloned());
        }
        if multi {
            self.write = WriteState::ExpectToken {
                block: block + 1,
                multi,
            };
        }
    }

    fn command_byte(&mut self, byte: u8) {
        if self.frame.is_empty() && byte & 0xC0 != 0x40 {
            return;
        }
        self.frame.push(byte);
        if self.frame.len() == 6 {
            let frame = std::mem::replace(&mut self.frame, Vec::new());
            self.command(&frame);
        }
    }

    fn command(&mut self, frame: &[u8]) {
        if frame[5] != crc7(&frame[0..5]) {
            self.bad_crc += 1;
        }
        let index = frame[0] & 0x3F;
        let arg = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
        self.events.push(Event::Command { index, arg });
        if self.faults.silent || self.faults.ignore.contains(&index) {
            return;
        }
        let app = std::mem::replace(&mut self.app_cmd, false);

        match index {
            CMD0 => {
                self.idle = true;
                self.respond(&[0x01]);
            }
            CMD8 => match (self.faults.cmd8_response, self.kind) {
                (Some(r1), _) => self.respond(&[r1]),
                (None, Kind::V2) => self.respond(&[0x01, 0x00, 0x00, 0x01, 0xAA]),
                (None, Kind::V1) => self.respond(&[0x05]),
            },
            CMD55 => {
                self.app_cmd = true;
                let r1 = self.base_r1();
                self.respond(&[r1]);
            }
            ACMD41 if app => {
                if self.faults.acmd41_busy_rounds > 0 {
                    self.faults.acmd41_busy_rounds -= 1;
                    self.respond(&[0x01]);
                } else {
                    self.idle = false;
                    self.respond(&[0x00]);
                }
            }
            CMD58 => {
                let r1 = self.base_r1();
                let ocr0 = match self.kind {
                    Kind::V1 => 0x80,
                    Kind::V2 => 0xC0,
                };
                self.respond(&[r1, ocr0, 0xFF, 0x80, 0x00]);
            }
            CMD9 => {
                let status = self.faults.csd_status;
                self.respond(&[status]);
                if status == 0 {
                    self.out.push_back(0xFF);
                    self.out.push_back(DATA_START_BLOCK);
                    let csd = self.csd;
                    self.out.extend(csd.iter().cloned());
                    self.out.extend([0xABu8, 0xCD].iter().cloned());
                }
            }
            CMD16 => {
                let status = self.faults.cmd16_status;
                self.respond(&[status]);
            }
            CMD12 => {
                self.streaming = None;
                self.out.clear();
                // The stuff byte looks like a valid R1 unless skipped
                self.out.push_back(0x3C);
                self.respond(&[0x00]);
            }
            CMD17 | CMD18 | CMD24 | CMD25 => {
                let mut status = self.faults.address_status;
                if arg % self.cdv() != 0 {
                    status |= 0x20;
                }
                self.respond(&[status]);
                if status != 0 {
                    return;
                }
                let block = arg / self.cdv();
                match index {
                    CMD17 if !self.faults.withhold_data => {
                        self.out.push_back(0xFF);
                        self.queue_block(block);
                    }
                    CMD18 if !self.faults.withhold_data => self.streaming = Some(block),
                    CMD24 => {
                        self.write = WriteState::ExpectToken {
                            block,
                            multi: false,
                        }
                    }
                    CMD25 => self.write = WriteState::ExpectToken { block, multi: true },
                    _ => {}
                }
            }
            _ => {
                let r1 = self.base_r1() | 0x04;
                self.respond(&[r1]);
            }
        }
    }
}

/// Handle on a simulated card. Clones share the same card.
#[derive(Clone)]
pub struct SimCard(Rc<RefCell<SimState>>);

pub type SimDriver = SdMmcSpi<SimTransport, SimPin, CountingDelay, NotInit>;
pub type SimCardDriver = SdMmcSpi<SimTransport, SimPin, CountingDelay, Initialized>;

impl SimCard {
    pub fn new(kind: Kind, csd: [u8; 16]) -> SimCard {
        SimCard(Rc::new(RefCell::new(SimState {
            kind,
            csd,
            faults: Faults::default(),
            cs_asserted: false,
            out: VecDeque::new(),
            frame: Vec::new(),
            idle: false,
            app_cmd: false,
            streaming: None,
            write: WriteState::Idle,
            stuck_busy: false,
            blocks: HashMap::new(),
            events: Vec::new(),
            baudrates: Vec::new(),
            bus_ops: 0,
            bytes_read: 0,
            bad_crc: 0,
        })))
    }

    pub fn v2() -> SimCard {
        SimCard::new(Kind::V2, CSD_V2)
    }

    pub fn v1() -> SimCard {
        SimCard::new(Kind::V1, CSD_V1)
    }

    pub fn faults(&self, f: impl FnOnce(&mut Faults)) -> &Self {
        f(&mut self.0.borrow_mut().faults);
        self
    }

    pub fn transport(&self) -> SimTransport {
        SimTransport(self.0.clone())
    }

    pub fn pin(&self) -> SimPin {
        SimPin(self.0.clone())
    }

    pub fn driver(&self) -> SimDriver {
        SdMmcSpi::new(self.transport(), self.pin(), CountingDelay::default())
    }

    pub fn acquire(&self) -> SimCardDriver {
        match self.driver().acquire() {
            Ok(card) => card,
            Err((e, _)) => panic!("card init failed: {:?}", e),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.borrow().events.clone()
    }

    pub fn clear_events(&self) {
        self.0.borrow_mut().events.clear();
    }

    /// Indices of every command frame received, in order.
    pub fn commands(&self) -> Vec<u8> {
        self.0
            .borrow()
            .events
            .iter()
            .filter_map(|e| match e {
                Event::Command { index, .. } => Some(*index),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, event: &Event) -> usize {
        self.0.borrow().events.iter().filter(|e| *e == event).count()
    }

    pub fn cs_asserted(&self) -> bool {
        self.0.borrow().cs_asserted
    }

    pub fn bus_ops(&self) -> usize {
        self.0.borrow().bus_ops
    }

    pub fn bytes_read(&self) -> usize {
        self.0.borrow().bytes_read
    }

    pub fn baudrates(&self) -> Vec<u32> {
        self.0.borrow().baudrates.clone()
    }

    pub fn bad_crc(&self) -> usize {
        self.0.borrow().bad_crc
    }

    pub fn block(&self, block: u32) -> Vec<u8> {
        self.0.borrow().block_data(block)
    }
}

pub struct SimTransport(Rc<RefCell<SimState>>);

impl Transport for SimTransport {
    type Error = Infallible;

    fn write(&mut self, bytes: &[u8]) -> Result<(), Infallible> {
        let mut s = self.0.borrow_mut();
        s.bus_ops += 1;
        if s.cs_asserted {
            for &b in bytes {
                s.out.pop_front();
                s.clock_in(b);
            }
        }
        Ok(())
    }

    fn read_into(&mut self, buf: &mut [u8], _fill: u8) -> Result<(), Infallible> {
        let mut s = self.0.borrow_mut();
        s.bus_ops += 1;
        s.bytes_read += buf.len();
        for b in buf.iter_mut() {
            *b = if s.cs_asserted { s.clock_out() } else { 0xFF };
        }
        Ok(())
    }

    fn duplex(&mut self, out: &[u8], in_buf: &mut [u8]) -> Result<(), Infallible> {
        assert_eq!(out.len(), in_buf.len());
        assert!(out.iter().all(|&b| b == 0xFF), "host sent data while reading");
        self.read_into(in_buf, 0xFF)
    }

    fn configure(&mut self, config: &SpiConfig) -> Result<(), Infallible> {
        let mut s = self.0.borrow_mut();
        s.bus_ops += 1;
        s.baudrates.push(config.baudrate);
        Ok(())
    }
}

pub struct SimPin(Rc<RefCell<SimState>>);

impl OutputPin for SimPin {
    type Error = Infallible;

    fn set_low(&mut self) -> Result<(), Infallible> {
        let mut s = self.0.borrow_mut();
        if !s.cs_asserted {
            s.events.push(Event::Select);
        }
        s.cs_asserted = true;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        let mut s = self.0.borrow_mut();
        if s.cs_asserted {
            s.events.push(Event::Deselect);
        }
        s.cs_asserted = false;
        s.out.clear();
        s.frame.clear();
        s.streaming = None;
        Ok(())
    }
}

/// Adds up the requested delays instead of sleeping.
#[derive(Debug, Default)]
pub struct CountingDelay {
    pub calls: u32,
    pub total_us: u64,
}

impl DelayUs<u32> for CountingDelay {
    fn delay_us(&mut self, us: u32) {
        self.calls += 1;
        self.total_us += u64::from(us);
    }
}

// ----------------------------------------------------------------------------

/// Bytes the "card" will clock out, and everything the host wrote.
#[derive(Default)]
pub struct Script {
    pub reads: VecDeque<u8>,
    pub writes: Vec<Vec<u8>>,
    pub bytes_read: usize,
    pub cs_low: bool,
    pub cs_changes: usize,
}

#[derive(Clone, Default)]
pub struct Scripted(pub Rc<RefCell<Script>>);

impl Scripted {
    pub fn new(reads: &[u8]) -> Scripted {
        let script = Scripted::default();
        script.0.borrow_mut().reads.extend(reads.iter().cloned());
        script
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.0.borrow().writes.clone()
    }

    pub fn bytes_read(&self) -> usize {
        self.0.borrow().bytes_read
    }

    pub fn cs_low(&self) -> bool {
        self.0.borrow().cs_low
    }

    pub fn remaining(&self) -> usize {
        self.0.borrow().reads.len()
    }
}

impl Transport for Scripted {
    type Error = Infallible;

    fn write(&mut self, bytes: &[u8]) -> Result<(), Infallible> {
        self.0.borrow_mut().writes.push(bytes.to_vec());
        Ok(())
    }

    fn read_into(&mut self, buf: &mut [u8], _fill: u8) -> Result<(), Infallible> {
        let mut s = self.0.borrow_mut();
        s.bytes_read += buf.len();
        for b in buf.iter_mut() {
            *b = s.reads.pop_front().unwrap_or(0xFF);
        }
        Ok(())
    }

    fn duplex(&mut self, _out: &[u8], in_buf: &mut [u8]) -> Result<(), Infallible> {
        self.read_into(in_buf, 0xFF)
    }

    fn configure(&mut self, _config: &SpiConfig) -> Result<(), Infallible> {
        Ok(())
    }
}

impl OutputPin for Scripted {
    type Error = Infallible;

    fn set_low(&mut self) -> Result<(), Infallible> {
        let mut s = self.0.borrow_mut();
        s.cs_low = true;
        s.cs_changes += 1;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        let mut s = self.0.borrow_mut();
        s.cs_low = false;
        s.cs_changes += 1;
        Ok(())
    }
}
