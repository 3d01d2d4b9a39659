//! Simulated ATM-155 adapter
//!
//! Implements [`SarDevice`] over an in-memory model of the adapter: shared
//! memory regions, the slot register pairs, the two report rings and the
//! interrupt status register. The harness methods play the adapter's side
//! of the protocol so the engine can be driven end to end without
//! hardware.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec;
use alloc::vec::Vec;
use hashbrown::HashMap;
use sar_api::hw::{
    RX_REPORT_ENTRY_SIZE, RX_REPORT_QUEUE_ENTRIES, TX_REPORT_ENTRY_SIZE, TX_REPORT_QUEUE_ENTRIES,
};
use sar_api::{Aal5Info, InterruptStatus, PhysAddr, Register, SarControl, SarDevice, SizeClass};
use spin::Mutex;

use crate::aal5::{padding_bytes, Aal5Trailer, TRAILER_SIZE};
use crate::hw::{RxReportEntry, RxSlotControl, RxStatus, TxReportEntry, TxSlotControl};

/// First address handed out by the simulated allocator
pub const SIM_MEMORY_BASE: u32 = 0x1000_0000;

const SIM_ALIGNMENT: usize = 64;

/// A packet the simulated adapter put on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimTxPdu {
    pub circuit: u16,
    /// Full CPCS-PDU: payload, padding and trailer
    pub bytes: Vec<u8>,
    /// Slots the packet occupied
    pub fragments: usize,
}

impl SimTxPdu {
    pub fn trailer(&self) -> Option<Aal5Trailer> {
        let start = self.bytes.len().checked_sub(TRAILER_SIZE)?;
        let mut raw = [0u8; TRAILER_SIZE];
        raw.copy_from_slice(&self.bytes[start..]);
        Some(Aal5Trailer::from_bytes(raw))
    }

    /// Payload with padding and trailer stripped.
    pub fn payload(&self) -> Option<&[u8]> {
        let length = self.trailer()?.length as usize;
        self.bytes.get(..length)
    }
}

/// A receive buffer the engine posted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimRxBuffer {
    pub addr: PhysAddr,
    pub tag: u16,
    pub class: SizeClass,
}

#[derive(Debug, Default)]
struct SimRing {
    base: u32,
    index: usize,
}

#[derive(Debug, Default)]
struct SimState {
    next_addr: u32,
    memory: BTreeMap<u32, Vec<u8>>,
    registers: HashMap<Register, u32>,
    /// Control word latched per slot register pair
    tx_controls: [u32; 8],
    rx_controls: [u32; 8],
    /// Fragments of the packet being posted
    tx_partial: Vec<(TxSlotControl, PhysAddr)>,
    tx_pending: VecDeque<Vec<(TxSlotControl, PhysAddr)>>,
    transmitted: Vec<SimTxPdu>,
    rx_posted: [VecDeque<SimRxBuffer>; 2],
    tx_ring: SimRing,
    rx_ring: SimRing,
    fail_alloc: bool,
    /// Accesses the real adapter would have faulted on
    faults: usize,
}

impl SimState {
    /// Region base and offset of `len` bytes at `addr`, if all mapped.
    fn locate(&self, addr: PhysAddr, len: usize) -> Option<(u32, usize)> {
        let addr = addr.as_u32();
        let (base, bytes) = self.memory.range(..=addr).next_back()?;
        let offset = (addr - base) as usize;
        (offset + len <= bytes.len()).then_some((*base, offset))
    }

    fn read(&mut self, addr: PhysAddr, buf: &mut [u8]) {
        match self.locate(addr, buf.len()) {
            Some((base, offset)) => buf.copy_from_slice(&self.memory[&base][offset..offset + buf.len()]),
            None => self.fault("read", addr),
        }
    }

    fn write(&mut self, addr: PhysAddr, data: &[u8]) {
        match self.locate(addr, data.len()) {
            Some((base, offset)) => {
                if let Some(bytes) = self.memory.get_mut(&base) {
                    bytes[offset..offset + data.len()].copy_from_slice(data);
                }
            }
            None => self.fault("write", addr),
        }
    }

    fn fault(&mut self, access: &str, addr: PhysAddr) {
        log::error!("simulated {} outside shared memory at {}", access, addr);
        self.faults += 1;
    }

    fn buffer_size(&self, class: SizeClass) -> usize {
        let control2 = self.registers.get(&Register::Control2).copied().unwrap_or(0);
        match class {
            SizeClass::Small => match control2 & 0x3FF {
                0 => 2048,
                words => words as usize * 4,
            },
            SizeClass::Big => match (control2 >> 12) & 0x7 {
                0 => 1024,
                1 => 2048,
                2 => 4096,
                3 => 8192,
                4 => 10240,
                _ => 16384,
            },
        }
    }

    fn push_report(&mut self, register: Register, entry: &[u8]) {
        let (entries, size) = match register {
            Register::TxReportPointer => (TX_REPORT_QUEUE_ENTRIES, TX_REPORT_ENTRY_SIZE),
            _ => (RX_REPORT_QUEUE_ENTRIES, RX_REPORT_ENTRY_SIZE),
        };
        let ring = match register {
            Register::TxReportPointer => &mut self.tx_ring,
            _ => &mut self.rx_ring,
        };
        let addr = PhysAddr(ring.base).offset(ring.index * size);
        ring.index = (ring.index + 1) % entries;
        let pointer = ring.base + (ring.index * size) as u32;
        self.write(addr, entry);
        self.registers.insert(register, pointer);
    }

    fn raise(&mut self, status: InterruptStatus) {
        let current = self.registers.entry(Register::InterruptStatus).or_insert(0);
        *current |= status.bits();
    }

    fn reset(&mut self) {
        self.tx_partial.clear();
        self.tx_pending.clear();
        self.rx_posted = [VecDeque::new(), VecDeque::new()];
        self.registers.insert(Register::InterruptStatus, 0);
    }
}

/// In-memory model of the adapter
#[derive(Debug)]
pub struct SimAdapter {
    state: Mutex<SimState>,
}

impl SimAdapter {
    pub fn new() -> Self {
        Self { state: Mutex::new(SimState { next_addr: SIM_MEMORY_BASE, ..SimState::default() }) }
    }

    /// Makes every following `alloc_shared` fail while set.
    pub fn fail_allocations(&self, fail: bool) {
        self.state.lock().fail_alloc = fail;
    }

    /// Bad shared-memory accesses and frees seen so far.
    pub fn faults(&self) -> usize {
        self.state.lock().faults
    }

    pub fn shared_bytes_in_use(&self) -> usize {
        self.state.lock().memory.values().map(Vec::len).sum()
    }

    pub fn register(&self, reg: Register) -> u32 {
        self.state.lock().registers.get(&reg).copied().unwrap_or(0)
    }

    /// Packets posted and not yet reported complete.
    pub fn pending_transmits(&self) -> usize {
        self.state.lock().tx_pending.len()
    }

    /// Puts up to `count` pending packets on the wire and reports them.
    pub fn complete_transmits(&self, count: usize) -> usize {
        let mut state = self.state.lock();
        let mut completed = 0;
        while completed < count {
            let Some(fragments) = state.tx_pending.pop_front() else {
                break;
            };
            let mut bytes = Vec::new();
            for (ctrl, addr) in &fragments {
                let mut chunk = vec![0u8; ctrl.size as usize];
                state.read(*addr, &mut chunk);
                bytes.extend_from_slice(&chunk);
            }
            let circuit = fragments.first().map_or(0, |(ctrl, _)| ctrl.circuit);
            state.transmitted.push(SimTxPdu { circuit, bytes, fragments: fragments.len() });
            let report = TxReportEntry { circuit, own: false }.to_bytes();
            state.push_report(Register::TxReportPointer, &report);
            completed += 1;
        }
        if completed > 0 {
            state.raise(InterruptStatus::TX_IOC);
        }
        completed
    }

    pub fn transmitted(&self) -> Vec<SimTxPdu> {
        self.state.lock().transmitted.clone()
    }

    /// Drains the wire log.
    pub fn take_transmitted(&self) -> Vec<SimTxPdu> {
        core::mem::take(&mut self.state.lock().transmitted)
    }

    pub fn posted_rx_buffers(&self, class: SizeClass) -> usize {
        self.state.lock().rx_posted[class.index()].len()
    }

    /// Takes the oldest posted receive buffer of `class`.
    pub fn take_rx_buffer(&self, class: SizeClass) -> Option<SimRxBuffer> {
        self.state.lock().rx_posted[class.index()].pop_front()
    }

    pub fn write_memory(&self, addr: PhysAddr, data: &[u8]) {
        self.state.lock().write(addr, data);
    }

    pub fn push_rx_report(&self, entry: RxReportEntry) {
        let mut state = self.state.lock();
        state.push_report(Register::RxReportPointer, &entry.to_bytes());
        state.raise(InterruptStatus::RX_IOC);
    }

    pub fn raise(&self, status: InterruptStatus) {
        self.state.lock().raise(status);
    }

    /// Receives one AAL5 packet on `circuit` into posted `class` buffers.
    ///
    /// Builds the CPCS-PDU, spreads it over as many buffers as needed and
    /// reports each one. Returns the number of buffers used, or `None`
    /// without touching anything if too few buffers are posted.
    pub fn deliver_pdu(&self, circuit: u16, class: SizeClass, payload: &[u8], info: Aal5Info) -> Option<usize> {
        let mut pdu = payload.to_vec();
        pdu.resize(payload.len() + padding_bytes(payload.len()), 0);
        pdu.extend_from_slice(&Aal5Trailer::new(info, payload.len() as u16).to_bytes());
        self.deliver_raw(circuit, class, &pdu, RxStatus::Crc32, false)
    }

    /// Receives `pdu` as-is, flagging the last buffer bad with `status`
    /// when `bad` is set.
    pub fn deliver_raw(
        &self,
        circuit: u16,
        class: SizeClass,
        pdu: &[u8],
        status: RxStatus,
        bad: bool,
    ) -> Option<usize> {
        let mut state = self.state.lock();
        let size = state.buffer_size(class);
        let chunks: Vec<&[u8]> = pdu.chunks(size).collect();
        if chunks.is_empty() || state.rx_posted[class.index()].len() < chunks.len() {
            return None;
        }

        let last = chunks.len() - 1;
        for (n, chunk) in chunks.iter().enumerate() {
            let Some(buffer) = state.rx_posted[class.index()].pop_front() else {
                return None;
            };
            state.write(buffer.addr, chunk);
            let mut entry = RxReportEntry::new(buffer.tag, buffer.class, circuit);
            entry.own = false;
            entry.sop = n == 0;
            entry.eop = n == last;
            if n == last {
                entry.size_words = RxReportEntry::size_words_for(chunk.len());
                entry.status = status;
                entry.bad = bad;
            }
            state.push_report(Register::RxReportPointer, &entry.to_bytes());
        }
        state.raise(InterruptStatus::RX_IOC);
        Some(chunks.len())
    }
}

impl Default for SimAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl SarDevice for SimAdapter {
    fn read_register(&self, reg: Register) -> u32 {
        self.register(reg)
    }

    fn write_register(&self, reg: Register, value: u32) {
        let mut state = self.state.lock();
        match reg {
            Register::InterruptStatus => {
                let current = state.registers.entry(reg).or_insert(0);
                *current &= !value;
            }
            Register::SarControl => {
                if SarControl::from_bits_truncate(value).contains(SarControl::RESET) {
                    state.reset();
                }
                state.registers.insert(reg, value);
            }
            Register::TxSlotControl(slot) => state.tx_controls[slot as usize % 8] = value,
            Register::RxSlotControl(slot) => state.rx_controls[slot as usize % 8] = value,
            Register::TxSlotBase(slot) => {
                let ctrl = TxSlotControl::decode(state.tx_controls[slot as usize % 8]);
                state.tx_partial.push((ctrl, PhysAddr(value)));
                if ctrl.eop {
                    let packet = core::mem::take(&mut state.tx_partial);
                    state.tx_pending.push_back(packet);
                }
            }
            Register::RxSlotBase(slot) => {
                let ctrl = RxSlotControl::decode(state.rx_controls[slot as usize % 8]);
                let buffer = SimRxBuffer { addr: PhysAddr(value), tag: ctrl.tag, class: ctrl.slot_type };
                state.rx_posted[ctrl.slot_type.index()].push_back(buffer);
            }
            Register::TxReportBase => {
                state.tx_ring = SimRing { base: value, index: 0 };
                state.registers.insert(Register::TxReportPointer, value);
            }
            Register::RxReportBase => {
                state.rx_ring = SimRing { base: value, index: 0 };
                state.registers.insert(Register::RxReportPointer, value);
            }
            _ => {
                state.registers.insert(reg, value);
            }
        }
    }

    fn alloc_shared(&self, size: usize) -> Option<PhysAddr> {
        let mut state = self.state.lock();
        if state.fail_alloc {
            return None;
        }
        let addr = state.next_addr;
        let span = size.max(1).div_ceil(SIM_ALIGNMENT) * SIM_ALIGNMENT;
        state.next_addr = addr + span as u32;
        state.memory.insert(addr, vec![0u8; size]);
        Some(PhysAddr(addr))
    }

    fn free_shared(&self, addr: PhysAddr, size: usize) {
        let mut state = self.state.lock();
        match state.memory.remove(&addr.as_u32()) {
            Some(bytes) if bytes.len() == size => {}
            _ => state.fault("free", addr),
        }
    }

    fn read_shared(&self, addr: PhysAddr, buf: &mut [u8]) {
        self.state.lock().read(addr, buf);
    }

    fn write_shared(&self, addr: PhysAddr, data: &[u8]) {
        self.state.lock().write(addr, data);
    }
}
