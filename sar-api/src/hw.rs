//! Hardware ABI of the ATM-155 PCI SAR
//!
//! Register map, interrupt status bits and report ring geometry. The
//! bit layout of slot descriptors and report entries lives in the engine's
//! `hw` module; this module only names what the platform has to provide.

use static_assertions::const_assert;

/// Number of transmit (and receive) pending-slot register pairs.
pub const SLOT_REGISTER_PAIRS: usize = 8;

/// Entries in the transmit completion report ring.
pub const TX_REPORT_QUEUE_ENTRIES: usize = 256;
/// Bytes per transmit report entry.
pub const TX_REPORT_ENTRY_SIZE: usize = 4;
/// Entries in the receive completion report ring.
pub const RX_REPORT_QUEUE_ENTRIES: usize = 256;
/// Bytes per receive report entry.
pub const RX_REPORT_ENTRY_SIZE: usize = 8;

/// Largest VC table the 12-bit circuit id can address.
pub const MAX_VC_TABLE_SIZE: u32 = 1 << 12;

/// Line rate in cells per second (155.52 Mbit/s, 53-byte cells).
pub const ATM_155_CELL_RATE: u32 = 155_520_000 / (53 * 8);

const_assert!(TX_REPORT_QUEUE_ENTRIES.is_power_of_two());
const_assert!(RX_REPORT_QUEUE_ENTRIES.is_power_of_two());
const_assert!(RX_REPORT_ENTRY_SIZE == 2 * TX_REPORT_ENTRY_SIZE);

/// SAR register file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    /// Global control (reset and enables)
    SarControl,
    /// Receive buffer size encoding
    Control2,
    /// Pending interrupt bits, write 1 to acknowledge
    InterruptStatus,
    /// Enabled interrupt bits
    InterruptMask,
    /// Transmit pending slot control word
    TxSlotControl(u8),
    /// Transmit pending slot base address
    TxSlotBase(u8),
    /// Receive pending slot control word
    RxSlotControl(u8),
    /// Receive pending slot base address
    RxSlotBase(u8),
    /// Physical base of the transmit report ring
    TxReportBase,
    /// Physical base of the receive report ring
    RxReportBase,
    /// Hardware write position in the transmit report ring
    TxReportPointer,
    /// Hardware write position in the receive report ring
    RxReportPointer,
}

bitflags::bitflags! {
    /// Interrupt status register bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InterruptStatus: u32 {
        /// Transmit report ring has new entries
        const TX_IOC = 1 << 0;
        /// Receive report ring has new entries
        const RX_IOC = 1 << 1;
        /// Transmit report ring overflowed
        const TX_REPORT_FULL = 1 << 2;
        /// Receive report ring overflowed
        const RX_REPORT_FULL = 1 << 3;
        /// Transmit DMA fatal error
        const TX_FATAL_ERROR = 1 << 8;
        /// Receive DMA fatal error
        const RX_FATAL_ERROR = 1 << 9;
        /// PCI master or target abort
        const PCI_FATAL_ERROR = 1 << 10;

        const FATAL = Self::TX_FATAL_ERROR.bits()
            | Self::RX_FATAL_ERROR.bits()
            | Self::PCI_FATAL_ERROR.bits();
    }
}

bitflags::bitflags! {
    /// Global control register bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SarControl: u32 {
        /// Soft reset; clears pending slots and report pointers
        const RESET = 1 << 0;
        /// Enable segmentation
        const TX_ENABLE = 1 << 1;
        /// Enable reassembly
        const RX_ENABLE = 1 << 2;
    }
}

impl Register {
    /// Returns the transmit slot control/base register pair for `slot`.
    pub fn tx_slot(slot: usize) -> (Register, Register) {
        let slot = (slot % SLOT_REGISTER_PAIRS) as u8;
        (Register::TxSlotControl(slot), Register::TxSlotBase(slot))
    }

    /// Returns the receive slot control/base register pair for `slot`.
    pub fn rx_slot(slot: usize) -> (Register, Register) {
        let slot = (slot % SLOT_REGISTER_PAIRS) as u8;
        (Register::RxSlotControl(slot), Register::RxSlotBase(slot))
    }
}
