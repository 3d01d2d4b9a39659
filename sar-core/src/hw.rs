//! Slot descriptor and report entry codecs
//!
//! Bit-exact layouts of the words exchanged with the SAR through the
//! pending-slot registers and the completion report rings. Report entries
//! are little-endian 32-bit words in shared memory.

use sar_api::SizeClass;
use sar_api::hw::{RX_REPORT_ENTRY_SIZE, TX_REPORT_ENTRY_SIZE};
use static_assertions::const_assert_eq;

/// Receive payload of an end-of-packet report whose size field is zero.
pub const RX_SIZE_ZERO_BYTES: usize = 16 * 1024;

const CIRCUIT_MASK: u32 = 0xFFF;
const TAG_MASK: u32 = 0xFFF;

const_assert_eq!(TX_REPORT_ENTRY_SIZE, core::mem::size_of::<u32>());
const_assert_eq!(RX_REPORT_ENTRY_SIZE, 2 * core::mem::size_of::<u32>());

#[inline]
const fn bits(word: u32, shift: u32, width: u32) -> u32 {
    (word >> shift) & ((1 << width) - 1)
}

#[inline]
const fn bit(word: u32, shift: u32) -> bool {
    (word >> shift) & 1 == 1
}

#[inline]
const fn flag(value: bool, shift: u32) -> u32 {
    (value as u32) << shift
}

/// Transmit pending-slot control word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxSlotControl {
    /// Fragment length in bytes (14 bits)
    pub size: u16,
    /// Last fragment of the packet
    pub eop: bool,
    /// Hardware appends the CRC-32
    pub crc: bool,
    /// Circuit id (12 bits)
    pub circuit: u16,
    pub management: bool,
    pub idle: bool,
    pub raw: bool,
}

impl TxSlotControl {
    /// Control word template for a circuit; AAL5 always requests CRC.
    pub fn for_circuit(circuit: u16) -> Self {
        Self { circuit, crc: true, ..Self::default() }
    }

    pub fn encode(self) -> u32 {
        (self.size as u32 & 0x3FFF)
            | flag(self.eop, 14)
            | flag(self.crc, 15)
            | ((self.circuit as u32 & CIRCUIT_MASK) << 16)
            | flag(self.management, 28)
            | flag(self.idle, 29)
            | flag(self.raw, 30)
    }

    pub fn decode(word: u32) -> Self {
        Self {
            size: bits(word, 0, 14) as u16,
            eop: bit(word, 14),
            crc: bit(word, 15),
            circuit: bits(word, 16, 12) as u16,
            management: bit(word, 28),
            idle: bit(word, 29),
            raw: bit(word, 30),
        }
    }
}

/// Receive pending-slot control word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxSlotControl {
    pub circuit: u16,
    pub slot_type: SizeClass,
    /// Correlation tag echoed back in the report (12 bits)
    pub tag: u16,
    pub report_slot_type: SizeClass,
}

impl RxSlotControl {
    pub fn encode(self) -> u32 {
        (self.circuit as u32 & CIRCUIT_MASK)
            | (self.slot_type.slot_type() << 12)
            | ((self.tag as u32 & TAG_MASK) << 16)
            | (self.report_slot_type.slot_type() << 28)
    }

    pub fn decode(word: u32) -> Self {
        Self {
            circuit: bits(word, 0, 12) as u16,
            slot_type: SizeClass::from_slot_type(bits(word, 12, 2)),
            tag: bits(word, 16, 12) as u16,
            report_slot_type: SizeClass::from_slot_type(bits(word, 28, 2)),
        }
    }
}

/// Transmit completion report entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxReportEntry {
    pub circuit: u16,
    pub own: bool,
}

impl TxReportEntry {
    pub fn encode(self) -> u32 {
        (self.circuit as u32 & CIRCUIT_MASK) | flag(self.own, 31)
    }

    pub fn decode(word: u32) -> Self {
        Self { circuit: bits(word, 0, 12) as u16, own: bit(word, 31) }
    }

    pub fn to_bytes(self) -> [u8; TX_REPORT_ENTRY_SIZE] {
        self.encode().to_le_bytes()
    }

    pub fn from_bytes(bytes: [u8; TX_REPORT_ENTRY_SIZE]) -> Self {
        Self::decode(u32::from_le_bytes(bytes))
    }
}

/// Receive completion status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RxStatus {
    Crc32,
    ReassemblyTimeout,
    Length,
    Aborted,
    SlotCongestion,
    OtherCell,
    TooLong,
    Reserved,
}

impl RxStatus {
    pub const fn code(self) -> u32 {
        match self {
            RxStatus::Crc32 => 0,
            RxStatus::ReassemblyTimeout => 1,
            RxStatus::Length => 2,
            RxStatus::Aborted => 3,
            RxStatus::SlotCongestion => 4,
            RxStatus::OtherCell => 5,
            RxStatus::TooLong => 6,
            RxStatus::Reserved => 7,
        }
    }

    pub const fn from_code(code: u32) -> Self {
        match code & 0x7 {
            0 => RxStatus::Crc32,
            1 => RxStatus::ReassemblyTimeout,
            2 => RxStatus::Length,
            3 => RxStatus::Aborted,
            4 => RxStatus::SlotCongestion,
            5 => RxStatus::OtherCell,
            6 => RxStatus::TooLong,
            _ => RxStatus::Reserved,
        }
    }
}

/// Receive completion report entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxReportEntry {
    /// Slot tag of the buffer the hardware filled
    pub tag: u16,
    pub report_slot_type: SizeClass,
    pub raw: bool,
    pub own: bool,
    pub circuit: u16,
    /// Bytes written, in 32-bit words (12 bits); meaningful on end of packet
    pub size_words: u16,
    pub efci: bool,
    pub clp: bool,
    pub status: RxStatus,
    pub bad: bool,
    pub sop: bool,
    pub eop: bool,
}

impl RxReportEntry {
    /// A clean report entry for `tag` on `circuit`.
    pub fn new(tag: u16, report_slot_type: SizeClass, circuit: u16) -> Self {
        Self {
            tag,
            report_slot_type,
            raw: false,
            own: true,
            circuit,
            size_words: 0,
            efci: false,
            clp: false,
            status: RxStatus::Crc32,
            bad: false,
            sop: false,
            eop: false,
        }
    }

    pub fn encode(self) -> [u32; 2] {
        let word0 = (self.tag as u32 & TAG_MASK)
            | (self.report_slot_type.slot_type() << 12)
            | flag(self.raw, 30)
            | flag(self.own, 31);
        let word1 = (self.circuit as u32 & CIRCUIT_MASK)
            | ((self.size_words as u32 & 0xFFF) << 12)
            | flag(self.efci, 24)
            | flag(self.clp, 25)
            | (self.status.code() << 26)
            | flag(self.bad, 29)
            | flag(self.sop, 30)
            | flag(self.eop, 31);
        [word0, word1]
    }

    pub fn decode(word0: u32, word1: u32) -> Self {
        Self {
            tag: bits(word0, 0, 12) as u16,
            report_slot_type: SizeClass::from_slot_type(bits(word0, 12, 2)),
            raw: bit(word0, 30),
            own: bit(word0, 31),
            circuit: bits(word1, 0, 12) as u16,
            size_words: bits(word1, 12, 12) as u16,
            efci: bit(word1, 24),
            clp: bit(word1, 25),
            status: RxStatus::from_code(bits(word1, 26, 3)),
            bad: bit(word1, 29),
            sop: bit(word1, 30),
            eop: bit(word1, 31),
        }
    }

    pub fn to_bytes(self) -> [u8; RX_REPORT_ENTRY_SIZE] {
        let [word0, word1] = self.encode();
        let mut bytes = [0u8; RX_REPORT_ENTRY_SIZE];
        bytes[..4].copy_from_slice(&word0.to_le_bytes());
        bytes[4..].copy_from_slice(&word1.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: [u8; RX_REPORT_ENTRY_SIZE]) -> Self {
        let word0 = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let word1 = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Self::decode(word0, word1)
    }

    /// Bytes the hardware reports for an end-of-packet buffer.
    pub fn eop_length(&self) -> usize {
        match self.size_words {
            0 => RX_SIZE_ZERO_BYTES,
            words => words as usize * 4,
        }
    }

    /// Size field encoding for `len` bytes.
    pub fn size_words_for(len: usize) -> u16 {
        ((len.div_ceil(4)) & 0xFFF) as u16
    }
}
