//! Receive reassembly pipeline
//!
//! Receive buffers are allocated in pools when a receive circuit is
//! activated and shared by every circuit of the same size class. A buffer
//! cycles `Free -> posted (Completing) -> assembly -> upstream -> Free`.
//! The slot tag stamped on a buffer's first posting is how receive reports
//! name it again.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use sar_api::{
    Error, PhysAddr, ReceivedPacket, Result, RxPacketToken, SarDevice, SizeClass, Upstream,
};

use crate::aal5::{Aal5Trailer, MAX_APPEND_BYTES, TRAILER_SIZE};
use crate::engine::{Completions, SarEngine};
use crate::hw::{RxReportEntry, RxSlotControl, RxStatus};
use crate::slot::ReceiveSlots;
use crate::stats::Counter;
use crate::vc::VcBlock;

/// Index of a receive buffer header
pub type BufferId = usize;
/// Index of a receive buffer pool
pub type PoolId = usize;

/// Largest slot tag; tags run 1..=MAX_SLOT_TAG and 0 means unassigned.
pub const MAX_SLOT_TAG: u16 = 0xFFF;

/// Receive buffer header
#[derive(Debug, Clone)]
pub struct RecvBuffer {
    pub pool: PoolId,
    pub class: SizeClass,
    pub addr: PhysAddr,
    pub size: usize,
    /// Slot tag, 0 until first posted
    pub tag: u16,
    /// Circuit the buffer last carried data for
    pub circuit: Option<u16>,
}

/// A block of receive buffers sharing one shared-memory region
#[derive(Debug)]
struct RecvPool {
    class: SizeClass,
    region: PhysAddr,
    region_size: usize,
    buffers: Vec<BufferId>,
    /// Buffers not yet retired
    outstanding: usize,
    releasing: bool,
}

#[derive(Debug, Default)]
struct ClassQueues {
    /// Posted to the hardware, oldest first
    completing: VecDeque<BufferId>,
    free: VecDeque<BufferId>,
    allocated: usize,
}

/// Adapter-wide receive buffer state
#[derive(Debug)]
pub struct RecvDmaQueue {
    pub slots: ReceiveSlots,
    classes: [ClassQueues; 2],
    buffers: Vec<Option<RecvBuffer>>,
    spare_ids: Vec<BufferId>,
    pools: Vec<Option<RecvPool>>,
    next_tag: u16,
}

impl RecvDmaQueue {
    pub fn new(maximum_slots_per_class: usize) -> Self {
        Self {
            slots: ReceiveSlots::new(maximum_slots_per_class),
            classes: [ClassQueues::default(), ClassQueues::default()],
            buffers: Vec::new(),
            spare_ids: Vec::new(),
            pools: Vec::new(),
            next_tag: 1,
        }
    }

    fn class(&self, class: SizeClass) -> &ClassQueues {
        &self.classes[class.index()]
    }

    fn class_mut(&mut self, class: SizeClass) -> &mut ClassQueues {
        &mut self.classes[class.index()]
    }

    pub fn allocated(&self, class: SizeClass) -> usize {
        self.class(class).allocated
    }

    pub fn free_count(&self, class: SizeClass) -> usize {
        self.class(class).free.len()
    }

    pub fn buffer(&self, id: BufferId) -> Option<&RecvBuffer> {
        self.buffers.get(id).and_then(Option::as_ref)
    }

    fn assign_tag(&mut self) -> u16 {
        let tag = self.next_tag;
        self.next_tag = if tag >= MAX_SLOT_TAG { 1 } else { tag + 1 };
        tag
    }

    /// Allocates `count` buffers of `size` bytes onto the class free queue.
    pub fn allocate_pool<D: SarDevice>(
        &mut self,
        device: &D,
        class: SizeClass,
        count: usize,
        size: usize,
    ) -> Result<PoolId> {
        let region_size = count * size;
        let region = device.alloc_shared(region_size).ok_or(Error::OutOfMemory)?;
        let pool_id = match self.pools.iter().position(Option::is_none) {
            Some(id) => id,
            None => {
                self.pools.push(None);
                self.pools.len() - 1
            }
        };

        let mut ids = Vec::with_capacity(count);
        for n in 0..count {
            let header = RecvBuffer {
                pool: pool_id,
                class,
                addr: region.offset(n * size),
                size,
                tag: 0,
                circuit: None,
            };
            let id = match self.spare_ids.pop() {
                Some(id) => {
                    self.buffers[id] = Some(header);
                    id
                }
                None => {
                    self.buffers.push(Some(header));
                    self.buffers.len() - 1
                }
            };
            ids.push(id);
        }

        let queues = self.class_mut(class);
        queues.free.extend(ids.iter().copied());
        queues.allocated += count;
        self.pools[pool_id] = Some(RecvPool {
            class,
            region,
            region_size,
            buffers: ids,
            outstanding: count,
            releasing: false,
        });
        log::debug!("allocated {:?} receive pool {} ({} x {} bytes)", class, pool_id, count, size);
        Ok(pool_id)
    }

    fn retire<D: SarDevice>(&mut self, device: &D, id: BufferId) {
        let Some(buffer) = self.buffers.get_mut(id).and_then(Option::take) else {
            return;
        };
        self.spare_ids.push(id);
        let Some(pool) = self.pools.get_mut(buffer.pool).and_then(Option::as_mut) else {
            return;
        };
        pool.outstanding -= 1;
        if pool.outstanding == 0 {
            let class = pool.class;
            let count = pool.buffers.len();
            device.free_shared(pool.region, pool.region_size);
            self.pools[buffer.pool] = None;
            let queues = self.class_mut(class);
            queues.allocated = queues.allocated.saturating_sub(count);
            log::debug!("released {:?} receive pool {}", class, buffer.pool);
        }
    }

    /// Returns a buffer to its class free queue, or retires it if its pool
    /// is being released.
    pub fn free_buffer<D: SarDevice>(&mut self, device: &D, id: BufferId) {
        let Some(buffer) = self.buffers.get_mut(id).and_then(Option::as_mut) else {
            log::error!("free of unknown receive buffer {}", id);
            return;
        };
        buffer.circuit = None;
        let (pool, class) = (buffer.pool, buffer.class);
        let releasing = self
            .pools
            .get(pool)
            .and_then(Option::as_ref)
            .is_some_and(|pool| pool.releasing);
        if releasing {
            self.retire(device, id);
        } else {
            debug_assert!(!self.class(class).free.contains(&id));
            self.class_mut(class).free.push_back(id);
        }
    }

    /// Marks a pool for release; it is freed once every buffer is back.
    pub fn release_pool<D: SarDevice>(&mut self, device: &D, pool_id: PoolId) {
        let Some(pool) = self.pools.get_mut(pool_id).and_then(Option::as_mut) else {
            return;
        };
        pool.releasing = true;
        let class = pool.class;
        let owned = pool.buffers.clone();
        let idle: Vec<BufferId> = {
            let free = &mut self.class_mut(class).free;
            let idle = free.iter().copied().filter(|id| owned.contains(id)).collect();
            free.retain(|id| !owned.contains(id));
            idle
        };
        for id in idle {
            self.retire(device, id);
        }
    }

    /// Removes the posted buffer carrying `tag`, looking in the other size
    /// class when the reported one does not have it.
    pub fn take_completing(&mut self, class: SizeClass, tag: u16) -> Option<(BufferId, SizeClass)> {
        for (candidate, fallback) in [(class, false), (class.other(), true)] {
            let position = self
                .class(candidate)
                .completing
                .iter()
                .position(|id| self.buffer(*id).is_some_and(|buffer| buffer.tag == tag));
            if let Some(position) = position {
                if fallback {
                    log::warn!("tag {} reported as {:?} found in {:?} queue", tag, class, candidate);
                }
                let id = self.class_mut(candidate).completing.remove(position)?;
                self.slots.counter_mut(candidate).release(1);
                return Some((id, candidate));
            }
        }
        None
    }

    /// Posts free buffers of `class` while slots remain.
    pub fn post_free_buffers<D: SarDevice>(&mut self, device: &D, class: SizeClass) -> usize {
        let mut posted = 0;
        while self.slots.counter(class).remaining() > 0 {
            let Some(id) = self.class_mut(class).free.pop_front() else {
                break;
            };
            let needs_tag = self.buffer(id).is_some_and(|buffer| buffer.tag == 0);
            let tag = if needs_tag { Some(self.assign_tag()) } else { None };
            let Some(buffer) = self.buffers.get_mut(id).and_then(Option::as_mut) else {
                continue;
            };
            if let Some(tag) = tag {
                buffer.tag = tag;
            }
            let ctrl = RxSlotControl {
                circuit: buffer.circuit.unwrap_or(0),
                slot_type: class,
                tag: buffer.tag,
                report_slot_type: class,
            };
            let addr = buffer.addr;
            if let Err(err) = self.slots.post_buffer(device, ctrl, addr) {
                log::error!("receive post failed: {}", err);
                self.class_mut(class).free.push_front(id);
                break;
            }
            self.class_mut(class).completing.push_back(id);
            posted += 1;
        }
        posted
    }

    /// Takes back every posted buffer. Part of a reset.
    pub fn reclaim_posted<D: SarDevice>(&mut self, device: &D) {
        for class in [SizeClass::Small, SizeClass::Big] {
            let posted: Vec<BufferId> = self.class_mut(class).completing.drain(..).collect();
            for id in posted {
                self.free_buffer(device, id);
            }
        }
        self.slots.reset();
    }

    /// Frees every pool region. Used at teardown.
    pub fn free_all<D: SarDevice>(&mut self, device: &D) {
        for pool in self.pools.drain(..).flatten() {
            device.free_shared(pool.region, pool.region_size);
        }
        self.buffers.clear();
        self.spare_ids.clear();
        self.classes = [ClassQueues::default(), ClassQueues::default()];
    }
}

/// Buffers collected for the packet being reassembled on a circuit
#[derive(Debug, Default)]
pub struct Assembly {
    /// Buffers in arrival order with the bytes each holds
    pub buffers: Vec<(BufferId, usize)>,
}

impl Assembly {
    pub fn total(&self) -> usize {
        self.buffers.iter().map(|(_, len)| len).sum()
    }
}

/// Per-circuit receive state
#[derive(Debug)]
pub struct RecvSegment {
    pub class: SizeClass,
    /// Pool allocated when this circuit was activated
    pub pool: Option<PoolId>,
    pub assembly: Option<Assembly>,
}

impl RecvSegment {
    pub fn new(class: SizeClass, pool: Option<PoolId>) -> Self {
        Self { class, pool, assembly: None }
    }
}

/// Packet handed upstream and not yet returned
#[derive(Debug)]
pub struct HeldPacket {
    pub block: Arc<VcBlock>,
    pub buffers: Vec<BufferId>,
}

/// Complete packet waiting to be handed upstream
#[derive(Debug)]
pub struct Delivery {
    pub block: Arc<VcBlock>,
    pub buffers: Vec<BufferId>,
    pub packet: ReceivedPacket,
}

/// Why a reassembled packet was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Corruption {
    ShortPdu,
    ZeroLength,
    LengthMismatch,
}

impl<D: SarDevice, U: Upstream> SarEngine<D, U> {
    /// Posts free buffers of both classes, small first.
    pub fn post_receive_buffers(&self) {
        let mut recv = self.recv.lock();
        for class in [SizeClass::Small, SizeClass::Big] {
            let posted = recv.post_free_buffers(&self.device, class);
            if posted > 0 {
                log::trace!("posted {} {:?} receive buffers", posted, class);
            }
        }
    }

    fn free_buffers(&self, buffers: impl IntoIterator<Item = BufferId>) {
        let mut recv = self.recv.lock();
        for id in buffers {
            recv.free_buffer(&self.device, id);
        }
    }

    /// Handles one receive report entry.
    pub(crate) fn complete_receive(&self, report: RxReportEntry, completions: &mut Completions) {
        let found = self.recv.lock().take_completing(report.report_slot_type, report.tag);
        let Some((id, class)) = found else {
            log::error!("receive report for tag {} matches no posted buffer", report.tag);
            return;
        };

        let Some(block) = self.registry.read().lookup(report.circuit) else {
            log::warn!("receive report for unknown circuit {}", report.circuit);
            self.stats.increment(Counter::RecvInvalidVpiVci);
            self.free_buffers([id]);
            return;
        };

        let mut state = block.state.lock();
        if !state.accepts_receive(class) {
            log::warn!("circuit {} not receiving on {:?} buffers", report.circuit, class);
            drop(state);
            self.free_buffers([id]);
            return;
        }

        let mut guard = block.recv.lock();
        if guard.is_none() {
            drop(guard);
            drop(state);
            self.free_buffers([id]);
            return;
        }
        let Some(segment) = guard.as_mut() else {
            return;
        };

        if let Some(buffer) = self.recv.lock().buffers.get_mut(id).and_then(Option::as_mut) {
            buffer.circuit = Some(report.circuit);
        }

        if report.bad {
            let counter = Counter::for_discard(report.status);
            self.stats.increment(counter);
            block.stats.increment(counter);
            let discarded = segment.assembly.take();
            let mut buffers: Vec<BufferId> = Vec::new();
            if let Some(assembly) = discarded {
                buffers.extend(assembly.buffers.iter().map(|(buffer, _)| *buffer));
                state.dereference();
            }
            buffers.push(id);
            log::debug!(
                "discarding {} buffers on circuit {}: {:?}",
                buffers.len(),
                report.circuit,
                report.status
            );
            self.free_buffers(buffers);
            return;
        }

        if !report.sop && segment.assembly.is_none() {
            log::warn!("lost start of packet on circuit {}", report.circuit);
            self.free_buffers([id]);
            return;
        }

        if report.sop && report.eop && report.status == RxStatus::ReassemblyTimeout {
            self.free_buffers([id]);
            return;
        }

        if report.sop {
            if let Some(stale) = segment.assembly.take() {
                log::warn!("restarting reassembly on circuit {}", report.circuit);
                self.stats.increment(Counter::RecvCellsDropped);
                block.stats.increment(Counter::RecvCellsDropped);
                self.free_buffers(stale.buffers.into_iter().map(|(buffer, _)| buffer));
            } else {
                state.reference();
            }
            segment.assembly = Some(Assembly::default());
        }

        let buffer_size = self.config.buffer_size(class);
        let len = if report.eop { report.eop_length().min(buffer_size) } else { buffer_size };
        let Some(assembly) = segment.assembly.as_mut() else {
            return;
        };
        assembly.buffers.push((id, len));

        if !report.eop {
            return;
        }
        let Some(assembly) = segment.assembly.take() else {
            return;
        };
        drop(guard);
        drop(state);

        match self.read_packet(&assembly) {
            Ok((data, trailer)) => {
                let buffers: Vec<BufferId> = assembly.buffers.iter().map(|(buffer, _)| *buffer).collect();
                self.stats.increment(Counter::RecvPdusOk);
                self.stats.add(Counter::RecvCellsOk, buffers.len() as u64);
                block.stats.increment(Counter::RecvPdusOk);
                block.stats.add(Counter::RecvCellsOk, buffers.len() as u64);
                let packet = ReceivedPacket {
                    token: self.allocate_rx_token(),
                    vc: block.handle(),
                    data,
                    aal5: trailer.info(),
                    buffer_count: buffers.len(),
                };
                completions.deliveries.push(Delivery { block, buffers, packet });
            }
            Err(reason) => {
                log::warn!("corrupt PDU on circuit {}: {:?}", report.circuit, reason);
                self.stats.increment(Counter::RecvCellsDropped);
                block.stats.increment(Counter::RecvCellsDropped);
                self.free_buffers(assembly.buffers.into_iter().map(|(buffer, _)| buffer));
                completions.released.push(block);
            }
        }
    }

    fn allocate_rx_token(&self) -> RxPacketToken {
        RxPacketToken(self.next_rx_token.fetch_add(1, core::sync::atomic::Ordering::Relaxed))
    }

    /// Reads the trailer off the end of an assembly and copies out the payload.
    fn read_packet(&self, assembly: &Assembly) -> core::result::Result<(Vec<u8>, Aal5Trailer), Corruption> {
        let total = assembly.total();
        if total < TRAILER_SIZE {
            return Err(Corruption::ShortPdu);
        }

        let pieces: Vec<(PhysAddr, usize)> = {
            let recv = self.recv.lock();
            assembly
                .buffers
                .iter()
                .filter_map(|(id, len)| recv.buffer(*id).map(|buffer| (buffer.addr, *len)))
                .collect()
        };

        let mut bytes = [0u8; TRAILER_SIZE];
        self.read_range(&pieces, total - TRAILER_SIZE, &mut bytes);
        let trailer = Aal5Trailer::from_bytes(bytes);
        let length = trailer.length as usize;

        if length == 0 {
            return Err(Corruption::ZeroLength);
        }
        if length > total || total > length + MAX_APPEND_BYTES {
            return Err(Corruption::LengthMismatch);
        }

        let mut data = alloc::vec![0u8; length];
        self.read_range(&pieces, 0, &mut data);
        Ok((data, trailer))
    }

    /// Copies `out.len()` bytes starting `offset` bytes into a buffer chain.
    fn read_range(&self, pieces: &[(PhysAddr, usize)], mut offset: usize, out: &mut [u8]) {
        let mut filled = 0;
        for (addr, len) in pieces {
            if filled == out.len() {
                break;
            }
            if offset >= *len {
                offset -= len;
                continue;
            }
            let take = (len - offset).min(out.len() - filled);
            self.device.read_shared(addr.offset(offset), &mut out[filled..filled + take]);
            filled += take;
            offset = 0;
        }
    }

    /// Takes a held packet back and frees its buffers.
    ///
    /// Returns the owning circuit when this was its last reference on a
    /// closing circuit.
    pub(crate) fn reclaim_packet(&self, token: RxPacketToken) -> Option<Option<Arc<VcBlock>>> {
        let held = self.held.lock().remove(&token)?;
        self.free_buffers(held.buffers);
        let ready = held.block.release_reference();
        Some(if ready { Some(held.block) } else { None })
    }

    /// Gives back a packet the upstream retained.
    pub fn return_packet(&self, token: RxPacketToken) -> Result<()> {
        let ready = self
            .reclaim_packet(token)
            .ok_or_else(|| sar_api::error::not_found("receive packet not held"))?;
        self.post_receive_buffers();
        if let Some(block) = ready {
            self.complete_deactivation(&block, true);
        }
        Ok(())
    }

    /// Abandons every partial reassembly and takes back posted buffers.
    pub(crate) fn abandon_receives(&self, blocks: &[Arc<VcBlock>], completions: &mut Completions) {
        for block in blocks {
            let abandoned = block.recv.lock().as_mut().and_then(|segment| segment.assembly.take());
            if let Some(assembly) = abandoned {
                self.free_buffers(assembly.buffers.into_iter().map(|(buffer, _)| buffer));
                completions.released.push(block.clone());
            }
        }
        self.recv.lock().reclaim_posted(&self.device);
    }
}
