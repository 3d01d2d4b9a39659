//! Common types shared between the engine, the platform and the upstream

use alloc::vec::Vec;
use core::fmt;

/// Largest AAL5 CPCS-PDU payload.
pub const MAX_AAL5_PDU_SIZE: usize = 65535;

/// Largest fragment a single transmit slot can describe (14-bit size).
pub const MAX_SLOT_SIZE: usize = (1 << 14) - 1;

/// 32-bit bus address as seen by the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PhysAddr(pub u32);

impl PhysAddr {
    /// Returns the address `bytes` past this one.
    pub const fn offset(self, bytes: usize) -> PhysAddr {
        PhysAddr(self.0.wrapping_add(bytes as u32))
    }

    /// Returns the raw bus address.
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// ATM circuit address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VpiVci {
    /// Virtual path identifier
    pub vpi: u16,
    /// Virtual channel identifier
    pub vci: u16,
}

impl VpiVci {
    pub const fn new(vpi: u16, vci: u16) -> Self {
        Self { vpi, vci }
    }

    /// Identifier the adapter stores in descriptors and report entries.
    pub const fn circuit_id(self) -> u16 {
        self.vci
    }
}

impl fmt::Display for VpiVci {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.vpi, self.vci)
    }
}

/// Generational handle to a circuit control block
///
/// A handle stays valid until the circuit is deleted; a stale handle never
/// aliases a newer circuit that reuses the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VcHandle {
    index: u32,
    generation: u32,
}

impl VcHandle {
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub const fn index(self) -> u32 {
        self.index
    }

    pub const fn generation(self) -> u32 {
        self.generation
    }
}

/// Caller-chosen token identifying a transmit packet in completions
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PacketToken(pub u64);

/// Engine-issued token for a received packet held by the upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RxPacketToken(pub u64);

/// Receive buffer size class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SizeClass {
    Small,
    Big,
}

impl SizeClass {
    /// Slot type value used in descriptors and reports.
    pub const fn slot_type(self) -> u32 {
        match self {
            SizeClass::Small => 0,
            SizeClass::Big => 1,
        }
    }

    pub const fn from_slot_type(value: u32) -> Self {
        if value & 0x1 == 1 { SizeClass::Big } else { SizeClass::Small }
    }

    pub const fn other(self) -> Self {
        match self {
            SizeClass::Small => SizeClass::Big,
            SizeClass::Big => SizeClass::Small,
        }
    }

    pub const fn index(self) -> usize {
        self.slot_type() as usize
    }
}

/// ATM adaptation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AalType {
    Aal1,
    Aal34,
    Aal5,
}

/// ATM service category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceCategory {
    Cbr,
    Vbr,
    Ubr,
    Abr,
}

/// Flow parameters for one direction of a circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlowParameters {
    /// Peak cell rate in cells per second
    pub peak_cell_rate: u32,
    /// Largest SDU carried in this direction
    pub max_sdu_size: u32,
}

/// Parameters supplied when a circuit is activated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VcParameters {
    pub vpi_vci: VpiVci,
    pub aal: AalType,
    pub service_category: ServiceCategory,
    /// Transmit direction, `None` for receive-only circuits
    pub transmit: Option<FlowParameters>,
    /// Receive direction, `None` for transmit-only circuits
    pub receive: Option<FlowParameters>,
}

/// AAL5 user-to-user and common-part indicator bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Aal5Info {
    pub user_to_user: u8,
    pub common_part_indicator: u8,
}

/// One physically contiguous piece of a transmit packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysFragment {
    pub addr: PhysAddr,
    pub len: u32,
}

impl PhysFragment {
    pub const fn new(addr: PhysAddr, len: u32) -> Self {
        Self { addr, len }
    }
}

/// Outbound packet, already mapped for DMA
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxPacket {
    pub token: PacketToken,
    pub fragments: Vec<PhysFragment>,
    pub aal5: Aal5Info,
}

impl TxPacket {
    pub fn new(token: PacketToken, fragments: Vec<PhysFragment>) -> Self {
        Self { token, fragments, aal5: Aal5Info::default() }
    }

    pub fn with_aal5_info(mut self, info: Aal5Info) -> Self {
        self.aal5 = info;
        self
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.fragments.iter().map(|f| f.len as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Reassembled inbound packet handed to the upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPacket {
    pub token: RxPacketToken,
    pub vc: VcHandle,
    /// Payload with padding and trailer removed
    pub data: Vec<u8>,
    pub aal5: Aal5Info,
    /// Receive buffers the packet occupied
    pub buffer_count: usize,
}

/// Final status of a submitted packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendOutcome {
    /// Hardware reported the packet sent
    Success,
    /// Dropped by an adapter reset
    Aborted,
    /// Rejected by validation or circuit state
    Failed,
}

/// What the upstream did with a received packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDisposition {
    /// Packet consumed; the engine may reuse its buffers now
    Released,
    /// Packet kept; the upstream will call `return_packet` later
    Retained,
}

/// Result of a deactivation or reset request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// Finished synchronously
    Complete,
    /// Finished later through an upstream notification
    Pending,
}

/// Point-in-time copy of the SAR statistics counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SarStatistics {
    /// Packets the hardware reported sent
    pub xmit_pdus_ok: u64,
    /// Packets rejected at submission
    pub xmit_pdus_error: u64,
    /// Packets dropped by a reset
    pub xmit_pdus_aborted: u64,
    /// Packets delivered upstream
    pub recv_pdus_ok: u64,
    /// Receive buffers consumed by delivered packets
    pub recv_cells_ok: u64,
    /// Length, abort and oversize discards
    pub recv_pdus_error: u64,
    /// CRC-32 discards
    pub recv_crc_error: u64,
    /// Congestion discards and corrupt reassemblies
    pub recv_cells_dropped: u64,
    /// Discards for lack of buffers
    pub recv_pdus_no_buffer: u64,
    /// Reassembly timeouts
    pub recv_reassembly_err: u64,
    /// Reports naming no active circuit (adapter only)
    pub recv_invalid_vpi_vci: u64,
}
