//! Completion report rings
//!
//! The adapter appends one entry per finished unit of work to a ring in
//! shared memory and advances a pointer register holding the physical
//! address of the entry it will write next. Software consumes everything
//! from its own cursor up to, but not including, that entry.

use alloc::vec;
use alloc::vec::Vec;
use sar_api::hw::{RX_REPORT_ENTRY_SIZE, TX_REPORT_ENTRY_SIZE};
use sar_api::{Error, PhysAddr, Register, Result, SarDevice, SizeClass, Upstream};

use crate::engine::{Completions, SarEngine};
use crate::hw::{RxReportEntry, TxReportEntry};

/// One hardware report ring and the software cursor into it
#[derive(Debug)]
pub struct ReportRing {
    base: PhysAddr,
    entries: usize,
    entry_size: usize,
    /// Next entry software has not consumed
    last: usize,
    base_register: Register,
    pointer_register: Register,
}

impl ReportRing {
    /// Allocates the ring memory. Nothing is programmed until `reset`.
    pub fn allocate<D: SarDevice>(
        device: &D,
        base_register: Register,
        pointer_register: Register,
        entries: usize,
        entry_size: usize,
    ) -> Result<Self> {
        let base = device.alloc_shared(entries * entry_size).ok_or(Error::OutOfMemory)?;
        Ok(Self { base, entries, entry_size, last: 0, base_register, pointer_register })
    }

    pub fn free<D: SarDevice>(&self, device: &D) {
        device.free_shared(self.base, self.entries * self.entry_size);
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn cursor(&self) -> usize {
        self.last
    }

    /// Hands every entry back to the adapter and rewinds both cursors.
    ///
    /// `owned` is the entry image with only the ownership bit set.
    pub fn reset<D: SarDevice>(&mut self, device: &D, owned: &[u8]) {
        debug_assert_eq!(owned.len(), self.entry_size);
        let image: Vec<u8> = owned.iter().copied().cycle().take(self.entries * self.entry_size).collect();
        device.write_shared(self.base, &image);
        device.write_register(self.base_register, self.base.as_u32());
        self.last = 0;
    }

    /// Ring index the adapter will write next, or `None` if the pointer
    /// register does not point into the ring.
    pub fn hardware_index<D: SarDevice>(&self, device: &D) -> Option<usize> {
        let pointer = device.read_register(self.pointer_register) & !0x3;
        let offset = pointer.checked_sub(self.base.as_u32())? as usize;
        let index = offset / self.entry_size;
        if index >= self.entries {
            return None;
        }
        Some(index)
    }

    /// Reads the entries in `[last, hardware)` and advances `last`.
    pub fn drain<D: SarDevice>(&mut self, device: &D) -> Vec<Vec<u8>> {
        let Some(hardware) = self.hardware_index(device) else {
            log::error!(
                "{:?} points outside the report ring at {}",
                self.pointer_register,
                self.base
            );
            return Vec::new();
        };

        let mut drained = Vec::new();
        let mut index = self.last;
        while index != hardware {
            let mut entry = vec![0u8; self.entry_size];
            device.read_shared(self.base.offset(index * self.entry_size), &mut entry);
            drained.push(entry);
            index = (index + 1) % self.entries;
        }
        self.last = hardware;
        drained
    }
}

impl<D: SarDevice, U: Upstream> SarEngine<D, U> {
    /// Consumes transmit reports, then posts whatever `DmaWait` can now fit.
    pub(crate) fn process_tx_reports(&self, completions: &mut Completions) {
        let drained = self.tx_reports.lock().drain(&self.device);
        log::trace!("{} transmit reports", drained.len());
        for bytes in drained {
            let mut raw = [0u8; TX_REPORT_ENTRY_SIZE];
            raw.copy_from_slice(&bytes);
            self.complete_transmit(TxReportEntry::from_bytes(raw), completions);
        }
        self.process_dma_wait(completions);
    }

    /// Consumes receive reports in ring order.
    pub(crate) fn process_rx_reports(&self, completions: &mut Completions) {
        let drained = self.rx_reports.lock().drain(&self.device);
        log::trace!("{} receive reports", drained.len());
        for bytes in drained {
            let mut raw = [0u8; RX_REPORT_ENTRY_SIZE];
            raw.copy_from_slice(&bytes);
            self.complete_receive(RxReportEntry::from_bytes(raw), completions);
        }
    }

    /// Programs both report rings with every entry owned by the adapter.
    pub(crate) fn reset_report_rings(&self) {
        let tx_owned = TxReportEntry { circuit: 0, own: true }.to_bytes();
        self.tx_reports.lock().reset(&self.device, &tx_owned);

        let rx_owned = RxReportEntry::new(0, SizeClass::Small, 0);
        self.rx_reports.lock().reset(&self.device, &rx_owned.to_bytes());
    }
}
