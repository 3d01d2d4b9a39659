//! Transmit segmentation pipeline
//!
//! A packet moves `SegWait -> DmaWait -> DmaCompleting -> done`.
//!
//! - `SegWait` (per circuit) holds packets that have no pad/trailer buffer
//!   reserved yet. The pool is 30 buffers per circuit, which bounds how many
//!   packets one circuit can have past this stage.
//! - `DmaWait` (adapter wide) holds packets with a buffer reserved that are
//!   waiting for enough slots for every fragment plus the trailer.
//! - `DmaCompleting` (per circuit) holds posted packets in submission order;
//!   each transmit report pops its head.
//!
//! Both waiting queues drain strictly from the head and never reorder.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use sar_api::{
    Error, PacketToken, PhysAddr, Result, SarDevice, SendOutcome, TxPacket, Upstream, VcHandle,
    MAX_AAL5_PDU_SIZE, MAX_SLOT_SIZE,
};

use crate::aal5::{padding_bytes, Aal5Trailer, MAX_APPEND_BYTES, TRAILER_SIZE};
use crate::engine::{Completions, SarEngine, Section};
use crate::hw::{TxReportEntry, TxSlotControl};
use crate::slot::TransmitSlots;
use crate::stats::Counter;
use crate::vc::{VcBlock, VcFlags};

/// Pad/trailer buffers per circuit.
pub const MAX_PAD_TRAILER_BUFFERS: usize = 30;

/// Bytes reserved for each pad/trailer buffer.
pub const PAD_TRAILER_BUFFER_SIZE: usize = (MAX_APPEND_BYTES + 7) & !7;

/// A packet with its segmentation bookkeeping
#[derive(Debug)]
pub struct TxEntry {
    pub packet: TxPacket,
    pub circuit: u16,
    /// Pad bytes before the trailer
    pub padding: usize,
    /// Slots the packet occupies, trailer fragment included
    pub slots: usize,
}

/// Per-circuit `SegWait` queue and pad buffer reservations
#[derive(Debug, Default)]
pub struct XmitSegment {
    pub seg_wait: VecDeque<TxEntry>,
    /// Pad buffers in use or reserved by packets in `DmaWait`
    pub pads_reserved: usize,
}

/// Ring of pad/trailer buffers owned by one circuit
#[derive(Debug)]
pub struct PadTrailerPool {
    base: PhysAddr,
    free: usize,
    index: usize,
}

impl PadTrailerPool {
    const REGION_SIZE: usize = PAD_TRAILER_BUFFER_SIZE * MAX_PAD_TRAILER_BUFFERS;

    fn take(&mut self) -> PhysAddr {
        debug_assert!(self.free > 0);
        let addr = self.base.offset(self.index * PAD_TRAILER_BUFFER_SIZE);
        self.free -= 1;
        self.index = (self.index + 1) % MAX_PAD_TRAILER_BUFFERS;
        addr
    }

    fn give_back(&mut self) {
        self.free = (self.free + 1).min(MAX_PAD_TRAILER_BUFFERS);
    }

    fn reset(&mut self) {
        self.free = MAX_PAD_TRAILER_BUFFERS;
        self.index = 0;
    }
}

/// Per-circuit `DmaCompleting` queue and the pad buffers it uses
#[derive(Debug)]
pub struct XmitInFlight {
    pub dma_completing: VecDeque<TxEntry>,
    pads: PadTrailerPool,
}

impl XmitInFlight {
    pub fn free<D: SarDevice>(self, device: &D) {
        device.free_shared(self.pads.base, PadTrailerPool::REGION_SIZE);
    }
}

impl XmitSegment {
    /// Allocates a circuit's transmit state and its pad/trailer buffers.
    pub fn allocate<D: SarDevice>(device: &D) -> Result<(XmitSegment, XmitInFlight)> {
        let base = device.alloc_shared(PadTrailerPool::REGION_SIZE).ok_or(Error::OutOfMemory)?;
        let in_flight = XmitInFlight {
            dma_completing: VecDeque::new(),
            pads: PadTrailerPool { base, free: MAX_PAD_TRAILER_BUFFERS, index: 0 },
        };
        Ok((XmitSegment::default(), in_flight))
    }
}

/// Adapter-wide transmit slot ring and `DmaWait` queue
#[derive(Debug)]
pub struct XmitDmaQueue {
    pub slots: TransmitSlots,
    pub dma_wait: VecDeque<(Arc<VcBlock>, TxEntry)>,
}

impl XmitDmaQueue {
    pub fn new(maximum_slots: usize) -> Self {
        Self { slots: TransmitSlots::new(maximum_slots), dma_wait: VecDeque::new() }
    }
}

/// Reasons a packet is refused before it is queued
fn check_packet(packet: &TxPacket, maximum_slots: usize) -> core::result::Result<usize, &'static str> {
    if packet.fragments.is_empty() {
        return Err("packet has no fragments");
    }
    if packet.len() > MAX_AAL5_PDU_SIZE {
        return Err("packet larger than the largest AAL5 PDU");
    }
    if packet.fragments.iter().any(|f| f.len == 0 || f.len as usize > MAX_SLOT_SIZE) {
        return Err("fragment length outside one slot");
    }
    let slots = packet.fragments.len() + 1;
    if slots > maximum_slots {
        return Err("packet needs more slots than the ring holds");
    }
    Ok(slots)
}

impl<D: SarDevice, U: Upstream> SarEngine<D, U> {
    /// Submits a batch of packets on `vc`.
    ///
    /// Every packet is completed exactly once through
    /// `Upstream::send_complete`, possibly before this returns. Only an
    /// unknown handle is an error; the packets are then dropped unseen.
    pub fn send_packets(&self, vc: VcHandle, packets: Vec<TxPacket>) -> Result<()> {
        let block = self.vc_block(vc)?;
        let mut completions = Completions::default();
        if !self.enter_section(Section::Send) {
            // the reset has already swept the queues; nothing may follow it
            log::debug!("send on {:?} aborted by a running reset", vc);
            for packet in packets {
                completions.rejected.push((vc, packet.token, SendOutcome::Aborted));
            }
            self.dispatch(completions);
            return Ok(());
        }

        let refusal = {
            let hardware_failed = self.hardware_failed();
            let mut state = block.state.lock();
            if state.flags.contains(VcFlags::RESETTING) {
                Some(SendOutcome::Aborted)
            } else if !state.can_transmit() || hardware_failed {
                Some(SendOutcome::Failed)
            } else {
                // held for the whole batch so completions cannot finish a
                // deactivation underneath us
                state.reference();
                None
            }
        };

        match refusal {
            Some(outcome) => {
                log::warn!("send on {:?} refused: {:?}", vc, outcome);
                for packet in packets {
                    completions.rejected.push((vc, packet.token, outcome));
                }
            }
            None => {
                let maximum_slots = self.xmit.lock().slots.counter.maximum();
                let circuit = block.state.lock().circuit().unwrap_or_default();
                for packet in packets {
                    match check_packet(&packet, maximum_slots) {
                        Ok(slots) => {
                            let entry = TxEntry {
                                padding: padding_bytes(packet.len()),
                                circuit,
                                slots,
                                packet,
                            };
                            block.state.lock().reference();
                            log::trace!("queue packet {:?} on {:?}", entry.packet.token, vc);
                            self.process_segment_queue(&block, entry, &mut completions);
                        }
                        Err(reason) => {
                            log::warn!("packet {:?} on {:?} failed: {}", packet.token, vc, reason);
                            completions.rejected.push((vc, packet.token, SendOutcome::Failed));
                        }
                    }
                }
                completions.released.push(block.clone());
            }
        }

        self.dispatch(completions);
        self.leave_section(Section::Send);
        Ok(())
    }

    /// Admits a new packet, or parks it behind packets already waiting.
    fn process_segment_queue(&self, block: &Arc<VcBlock>, entry: TxEntry, completions: &mut Completions) {
        let mut xmit = block.xmit.lock();
        let Some(segment) = xmit.as_mut() else {
            log::error!("circuit {:?} has no transmit segment", block.handle());
            completions.finished.push((block.clone(), entry.packet.token, SendOutcome::Failed));
            return;
        };

        if !segment.seg_wait.is_empty() || segment.pads_reserved >= MAX_PAD_TRAILER_BUFFERS {
            segment.seg_wait.push_back(entry);
            return;
        }

        segment.pads_reserved += 1;
        let mut queue = self.xmit.lock();
        if queue.dma_wait.is_empty() && queue.slots.counter.can_reserve(entry.slots) {
            self.transmit_packet(&mut queue, block, entry, completions);
        } else {
            queue.dma_wait.push_back((block.clone(), entry));
        }
    }

    /// Writes every fragment plus the pad/trailer fragment to the slot
    /// registers. The caller has checked that enough slots are free.
    fn transmit_packet(
        &self,
        queue: &mut XmitDmaQueue,
        block: &Arc<VcBlock>,
        entry: TxEntry,
        completions: &mut Completions,
    ) {
        let mut guard = block.in_flight.lock();
        let Some(in_flight) = guard.as_mut() else {
            log::error!("circuit {:?} lost its pad buffers", block.handle());
            completions.finished.push((block.clone(), entry.packet.token, SendOutcome::Failed));
            return;
        };

        let template = TxSlotControl::for_circuit(entry.circuit);
        for fragment in &entry.packet.fragments {
            if let Err(err) =
                queue.slots.post_fragment(&self.device, template, fragment.addr, fragment.len as usize, false)
            {
                log::error!("fragment post on {:?} failed: {}", block.handle(), err);
            }
        }

        let trailer = Aal5Trailer::new(entry.packet.aal5, entry.packet.len() as u16);
        let mut tail = vec![0u8; entry.padding + TRAILER_SIZE];
        tail[entry.padding..].copy_from_slice(&trailer.to_bytes());
        let pad = in_flight.pads.take();
        self.device.write_shared(pad, &tail);
        if let Err(err) = queue.slots.post_fragment(&self.device, template, pad, tail.len(), true) {
            log::error!("trailer post on {:?} failed: {}", block.handle(), err);
        }

        log::trace!(
            "posted packet {:?} ({} slots, {} pad) on circuit {}",
            entry.packet.token,
            entry.slots,
            entry.padding,
            entry.circuit
        );
        in_flight.dma_completing.push_back(entry);
    }

    /// Posts `DmaWait` packets from the head while their slots fit.
    pub(crate) fn process_dma_wait(&self, completions: &mut Completions) {
        let mut queue = self.xmit.lock();
        loop {
            let fits = match queue.dma_wait.front() {
                Some((_, entry)) => queue.slots.counter.can_reserve(entry.slots),
                None => false,
            };
            if !fits {
                break;
            }
            if let Some((block, entry)) = queue.dma_wait.pop_front() {
                self.transmit_packet(&mut queue, &block, entry, completions);
            }
        }
    }

    /// Moves `SegWait` packets of `block` to `DmaWait` while pad buffers last.
    fn queue_packets_to_dma_wait(&self, block: &Arc<VcBlock>) {
        let mut xmit = block.xmit.lock();
        let Some(segment) = xmit.as_mut() else {
            return;
        };
        if segment.seg_wait.is_empty() {
            return;
        }
        let mut queue = self.xmit.lock();
        while segment.pads_reserved < MAX_PAD_TRAILER_BUFFERS {
            let Some(entry) = segment.seg_wait.pop_front() else {
                break;
            };
            segment.pads_reserved += 1;
            queue.dma_wait.push_back((block.clone(), entry));
        }
    }

    /// Handles one transmit report entry.
    pub(crate) fn complete_transmit(&self, report: TxReportEntry, completions: &mut Completions) {
        let Some(block) = self.registry.read().lookup(report.circuit) else {
            log::warn!("transmit report for unknown circuit {}", report.circuit);
            return;
        };
        if !block.state.lock().lifecycle.is_open() {
            log::warn!("transmit report for inactive circuit {}", report.circuit);
            return;
        }

        let entry = {
            let mut guard = block.in_flight.lock();
            guard.as_mut().and_then(|in_flight| {
                let entry = in_flight.dma_completing.pop_front();
                if entry.is_some() {
                    in_flight.pads.give_back();
                }
                entry
            })
        };
        let Some(entry) = entry else {
            log::warn!("transmit report on circuit {} with nothing in flight", report.circuit);
            return;
        };

        if let Some(segment) = block.xmit.lock().as_mut() {
            segment.pads_reserved = segment.pads_reserved.saturating_sub(1);
        }
        self.xmit.lock().slots.counter.release(entry.slots);
        completions.finished.push((block.clone(), entry.packet.token, SendOutcome::Success));

        self.queue_packets_to_dma_wait(&block);
    }

    /// Aborts every queued and in-flight packet. Part of a reset.
    pub(crate) fn abort_transmits(&self, blocks: &[Arc<VcBlock>], completions: &mut Completions) {
        let mut waiting: Vec<(Arc<VcBlock>, TxEntry)> = {
            let mut queue = self.xmit.lock();
            queue.slots.reset();
            queue.dma_wait.drain(..).collect()
        };

        for block in blocks {
            let in_flight: Vec<TxEntry> = match block.in_flight.lock().as_mut() {
                Some(in_flight) => {
                    in_flight.pads.reset();
                    in_flight.dma_completing.drain(..).collect()
                }
                None => Vec::new(),
            };
            let dma_wait: Vec<TxEntry> = {
                let (mine, rest): (Vec<_>, Vec<_>) =
                    waiting.drain(..).partition(|(owner, _)| Arc::ptr_eq(owner, block));
                waiting = rest;
                mine.into_iter().map(|(_, entry)| entry).collect()
            };
            let seg_wait: Vec<TxEntry> = match block.xmit.lock().as_mut() {
                Some(segment) => {
                    segment.pads_reserved = 0;
                    segment.seg_wait.drain(..).collect()
                }
                None => Vec::new(),
            };

            for entry in in_flight.into_iter().chain(dma_wait).chain(seg_wait) {
                completions.finished.push((block.clone(), entry.packet.token, SendOutcome::Aborted));
            }
        }

        for (block, entry) in waiting {
            log::error!("DmaWait packet for unregistered circuit {:?}", block.handle());
            completions.finished.push((block, entry.packet.token, SendOutcome::Aborted));
        }
    }

    /// Counts and reports one finished packet.
    pub(crate) fn notify_send(&self, vc: VcHandle, block: Option<&VcBlock>, token: PacketToken, outcome: SendOutcome) {
        let counter = match outcome {
            SendOutcome::Success => Counter::XmitPdusOk,
            SendOutcome::Aborted => Counter::XmitPdusAborted,
            SendOutcome::Failed => Counter::XmitPdusError,
        };
        self.stats.increment(counter);
        if let Some(block) = block {
            block.stats.increment(counter);
        }
        self.upstream.send_complete(vc, token, outcome);
    }
}
