//! sdspi - Constants and structures from the SD Specifications
//!
//! Command indices, response flags, data tokens and the Card Specific Data
//! register layout, as seen from the SPI side of the card.
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

// SD Card Commands

/// GO_IDLE_STATE - init card in spi mode if CS low
pub const CMD0: u8 = 0x00;
/// SEND_IF_COND - verify SD Memory Card interface operating condition
pub const CMD8: u8 = 0x08;
/// SEND_CSD - read the Card Specific Data (CSD register)
pub const CMD9: u8 = 0x09;
/// STOP_TRANSMISSION - end multiple block read sequence
pub const CMD12: u8 = 0x0C;
/// SET_BLOCKLEN - set the block length of standard capacity cards
pub const CMD16: u8 = 0x10;
/// READ_SINGLE_BLOCK - read a single data block from the card
pub const CMD17: u8 = 0x11;
/// READ_MULTIPLE_BLOCK - read a multiple data blocks from the card
pub const CMD18: u8 = 0x12;
/// WRITE_BLOCK - write a single data block to the card
pub const CMD24: u8 = 0x18;
/// WRITE_MULTIPLE_BLOCK - write blocks of data until a STOP_TRANSMISSION
pub const CMD25: u8 = 0x19;
/// APP_CMD - escape for application specific command
pub const CMD55: u8 = 0x37;
/// READ_OCR - read the OCR register of a card
pub const CMD58: u8 = 0x3A;
/// SD_SEND_OP_COND - Sends host capacity support information and activates
/// the card's initialization process
pub const ACMD41: u8 = 0x29;

/// CMD8 argument: 2.7-3.6V supply plus the 0xAA check pattern
pub const IF_COND_CHECK: u32 = 0x0000_01AA;

/// ACMD41 argument bit announcing host support for high capacity cards
pub const HOST_CAPACITY_SUPPORT: u32 = 0x4000_0000;

//==============================================================================

bitflags::bitflags! {
    /// The R1 status byte returned by every command.
    ///
    /// Bit 7 is always clear in a valid response; see [`R1::is_response`].
    pub struct R1: u8 {
        /// The card is in the idle state and running its init process
        const IDLE_STATE = 0x01;
        /// An erase sequence was cleared before executing
        const ERASE_RESET = 0x02;
        /// The command index is not supported by this card
        const ILLEGAL_COMMAND = 0x04;
        /// The CRC check of the last command failed
        const COMMAND_CRC_ERROR = 0x08;
        /// An error in the sequence of erase commands occurred
        const ERASE_SEQUENCE_ERROR = 0x10;
        /// A misaligned address was used in the command
        const ADDRESS_ERROR = 0x20;
        /// The command argument was outside the allowed range
        const PARAMETER_ERROR = 0x40;
    }
}

impl R1 {
    /// A byte is a response (rather than the bus idling high) when bit 7 is
    /// clear.
    pub fn is_response(byte: u8) -> bool {
        byte & 0x80 == 0
    }
}

//==============================================================================

/// start data token for read or write single block
pub const DATA_START_BLOCK: u8 = 0xFE;

/// stop token for write multiple blocks
pub const STOP_TRAN_TOKEN: u8 = 0xFD;

/// start data token for write multiple blocks
pub const WRITE_MULTIPLE_TOKEN: u8 = 0xFC;

/// mask for data response tokens after a write block operation
pub const DATA_RES_MASK: u8 = 0x1F;

/// write data accepted token
pub const DATA_RES_ACCEPTED: u8 = 0x05;

/// The byte clocked out while we only want to listen
pub const FILLER: u8 = 0xFF;

//==============================================================================

/// Card Specific Data, version 1 (standard capacity)
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct CsdV1 {
    /// The 16-bytes of data in this Card Specific Data block
    pub data: [u8; 16],
}

/// Card Specific Data, version 2 (high capacity)
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct CsdV2 {
    /// The 16-bytes of data in this Card Specific Data block
    pub data: [u8; 16],
}

/// Card Specific Data
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Csd {
    /// A version 1 CSD
    V1(CsdV1),
    /// A version 2 CSD
    V2(CsdV2),
}

impl CsdV1 {
    fn data(&self) -> &[u8; 16] {
        &self.data
    }

    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(max_data_transfer_rate, u8, 3, 0, 8);
    define_field!(card_command_classes, u16, [(4, 0, 8), (5, 4, 4)]);
    define_field!(read_block_length, u8, 5, 0, 4);
    define_field!(device_size_multiplier, u8, [(9, 0, 2), (10, 7, 1)]);
    define_field!(erase_single_block_enabled, bool, 10, 6);
    define_field!(crc, u8, 15, 1, 7);

    /// The C_SIZE value used for the sector count.
    ///
    /// Bytes 6, 7 and 8 are combined as `b6[1:0] | b7 << 2 | b8[7:6] << 4`.
    pub fn c_size(&self) -> u32 {
        let data = self.data();
        u32::from(data[6] & 0b11) | u32::from(data[7]) << 2 | u32::from(data[8] & 0b1100_0000) << 4
    }

    /// Number of 512 byte sectors on the card.
    pub fn sector_count(&self) -> u32 {
        (self.c_size() + 1) << (u32::from(self.device_size_multiplier()) + 2)
    }
}

impl CsdV2 {
    fn data(&self) -> &[u8; 16] {
        &self.data
    }

    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(max_data_transfer_rate, u8, 3, 0, 8);
    define_field!(card_command_classes, u16, [(4, 0, 8), (5, 4, 4)]);
    define_field!(read_block_length, u8, 5, 0, 4);
    define_field!(device_size, u32, [(8, 0, 8), (9, 0, 8)]);
    define_field!(erase_single_block_enabled, bool, 10, 6);
    define_field!(crc, u8, 15, 1, 7);

    /// Number of 512 byte sectors on the card.
    pub fn sector_count(&self) -> u32 {
        (self.device_size() + 1) * 1024
    }
}

impl Csd {
    /// Decode a raw register, picking the layout from the two structure bits
    /// at the top of byte 0. Unknown structures give `None`.
    pub fn from_bytes(data: [u8; 16]) -> Option<Csd> {
        match data[0] >> 6 {
            0b00 => Some(Csd::V1(CsdV1 { data })),
            0b01 => Some(Csd::V2(CsdV2 { data })),
            _ => None,
        }
    }

    /// The raw register contents.
    pub fn data(&self) -> &[u8; 16] {
        match self {
            Csd::V1(csd) => &csd.data,
            Csd::V2(csd) => &csd.data,
        }
    }

    /// Number of 512 byte sectors on the card.
    pub fn sector_count(&self) -> u32 {
        match self {
            Csd::V1(csd) => csd.sector_count(),
            Csd::V2(csd) => csd.sector_count(),
        }
    }

    /// log2 of the maximum read block length.
    pub fn read_block_length(&self) -> u8 {
        match self {
            Csd::V1(csd) => csd.read_block_length(),
            Csd::V2(csd) => csd.read_block_length(),
        }
    }

    /// Can this card erase single blocks?
    pub fn erase_single_block_enabled(&self) -> bool {
        match self {
            Csd::V1(csd) => csd.erase_single_block_enabled(),
            Csd::V2(csd) => csd.erase_single_block_enabled(),
        }
    }

    /// The raw TRAN_SPEED byte.
    pub fn max_data_transfer_rate(&self) -> u8 {
        match self {
            Csd::V1(csd) => csd.max_data_transfer_rate(),
            Csd::V2(csd) => csd.max_data_transfer_rate(),
        }
    }
}

//==============================================================================

/// Perform the 7-bit CRC used on the SD card command frames. The result
/// includes the trailing end bit, so it can go straight into byte 5.
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

/// Build the 6 byte frame for a command: start and transmission bits, the
/// command index, the big-endian argument and the given CRC byte.
pub fn command_frame(command: u8, arg: u32, crc: u8) -> [u8; 6] {
    let arg = arg.to_be_bytes();
    [0x40 | (command & 0x3F), arg[0], arg[1], arg[2], arg[3], crc]
}

/// Build a command frame carrying its correct CRC7.
pub fn command_frame_with_crc(command: u8, arg: u32) -> [u8; 6] {
    let mut frame = command_frame(command, arg, 0);
    frame[5] = crc7(&frame[0..5]);
    frame
}

// ****************************************************************************
//
// Unit Tests
//
// ****************************************************************************


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
