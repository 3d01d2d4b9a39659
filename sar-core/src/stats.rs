//! Statistics counters
//!
//! Kept per adapter and per circuit. Counters are plain atomics so the
//! completion path can bump them without taking a lock.

use core::sync::atomic::{AtomicU64, Ordering};
use sar_api::SarStatistics;

use crate::hw::RxStatus;

/// Individual statistic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    XmitPdusOk,
    XmitPdusError,
    XmitPdusAborted,
    RecvPdusOk,
    RecvCellsOk,
    RecvPdusError,
    RecvCrcError,
    RecvCellsDropped,
    RecvPdusNoBuffer,
    RecvReassemblyErr,
    RecvInvalidVpiVci,
}

impl Counter {
    /// Counter charged when the hardware flags a fragment bad.
    pub fn for_discard(status: RxStatus) -> Counter {
        match status {
            RxStatus::Crc32 => Counter::RecvCrcError,
            RxStatus::Length | RxStatus::Aborted | RxStatus::TooLong => Counter::RecvPdusError,
            RxStatus::SlotCongestion => Counter::RecvCellsDropped,
            RxStatus::OtherCell => Counter::RecvPdusNoBuffer,
            RxStatus::ReassemblyTimeout => Counter::RecvReassemblyErr,
            RxStatus::Reserved => Counter::RecvPdusError,
        }
    }
}

/// Set of statistics counters
#[derive(Debug, Default)]
pub struct SarStats {
    xmit_pdus_ok: AtomicU64,
    xmit_pdus_error: AtomicU64,
    xmit_pdus_aborted: AtomicU64,
    recv_pdus_ok: AtomicU64,
    recv_cells_ok: AtomicU64,
    recv_pdus_error: AtomicU64,
    recv_crc_error: AtomicU64,
    recv_cells_dropped: AtomicU64,
    recv_pdus_no_buffer: AtomicU64,
    recv_reassembly_err: AtomicU64,
    recv_invalid_vpi_vci: AtomicU64,
}

impl SarStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::XmitPdusOk => &self.xmit_pdus_ok,
            Counter::XmitPdusError => &self.xmit_pdus_error,
            Counter::XmitPdusAborted => &self.xmit_pdus_aborted,
            Counter::RecvPdusOk => &self.recv_pdus_ok,
            Counter::RecvCellsOk => &self.recv_cells_ok,
            Counter::RecvPdusError => &self.recv_pdus_error,
            Counter::RecvCrcError => &self.recv_crc_error,
            Counter::RecvCellsDropped => &self.recv_cells_dropped,
            Counter::RecvPdusNoBuffer => &self.recv_pdus_no_buffer,
            Counter::RecvReassemblyErr => &self.recv_reassembly_err,
            Counter::RecvInvalidVpiVci => &self.recv_invalid_vpi_vci,
        }
    }

    pub fn increment(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, value: u64) {
        self.counter(counter).fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counter(counter).load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> SarStatistics {
        SarStatistics {
            xmit_pdus_ok: self.get(Counter::XmitPdusOk),
            xmit_pdus_error: self.get(Counter::XmitPdusError),
            xmit_pdus_aborted: self.get(Counter::XmitPdusAborted),
            recv_pdus_ok: self.get(Counter::RecvPdusOk),
            recv_cells_ok: self.get(Counter::RecvCellsOk),
            recv_pdus_error: self.get(Counter::RecvPdusError),
            recv_crc_error: self.get(Counter::RecvCrcError),
            recv_cells_dropped: self.get(Counter::RecvCellsDropped),
            recv_pdus_no_buffer: self.get(Counter::RecvPdusNoBuffer),
            recv_reassembly_err: self.get(Counter::RecvReassemblyErr),
            recv_invalid_vpi_vci: self.get(Counter::RecvInvalidVpiVci),
        }
    }
}
